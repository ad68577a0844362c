pub mod backfill;
pub mod decoder;
pub mod error;
pub mod extractor;
pub mod keys;
pub mod normalize;
pub mod queue;
pub mod repository;
pub mod types;
pub mod value_loader;

#[cfg(test)]
pub(crate) mod test_utils;
