//! Per-contract consumers of storage diffs.
//!
//! A transformer is registered for one contract address and receives every
//! diff the watcher resolves to that contract. Transformer kinds are
//! registered at compile time in [`registry::build_registry`] and
//! instantiated per contract from the config.

pub mod decoding;
pub mod registry;
pub mod repository;
pub mod traits;

pub use registry::build_registry;
pub use repository::PgStorageValueRepository;
pub use traits::StorageTransformer;
