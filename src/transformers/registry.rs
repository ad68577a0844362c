//! Transformer registration.
//!
//! Maps the `transformer` name of a contract's config to the function that
//! builds it.

use std::collections::HashMap;
use std::sync::Arc;

use super::repository::StorageValueRepository;
use super::traits::StorageTransformer;
use crate::db::DbPool;
use crate::storage::error::StorageError;
use crate::types::config::contract::{ContractConfig, Contracts};

/// Everything a constructor gets to build a transformer for one contract.
pub struct TransformerContext<'a> {
    pub contract: &'a str,
    pub config: &'a ContractConfig,
    pub db: Option<Arc<DbPool>>,
    pub values: Arc<dyn StorageValueRepository>,
}

pub type TransformerConstructor =
    fn(&TransformerContext<'_>) -> Result<Arc<dyn StorageTransformer>, StorageError>;

/// Registry of transformer kinds, built at startup.
pub struct TransformerRegistry {
    constructors: HashMap<&'static str, TransformerConstructor>,
}

impl TransformerRegistry {
    pub fn new() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    pub fn register(&mut self, kind: &'static str, constructor: TransformerConstructor) {
        if self.constructors.insert(kind, constructor).is_some() {
            tracing::warn!("Transformer kind '{}' registered twice, keeping the last", kind);
        }
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        let mut kinds: Vec<_> = self.constructors.keys().copied().collect();
        kinds.sort_unstable();
        kinds
    }

    /// Instantiate one transformer per configured contract, in name order.
    pub fn build_transformers(
        &self,
        contracts: &Contracts,
        db: Option<Arc<DbPool>>,
        values: Arc<dyn StorageValueRepository>,
    ) -> Result<Vec<Arc<dyn StorageTransformer>>, StorageError> {
        let mut names: Vec<&String> = contracts.keys().collect();
        names.sort();

        names
            .into_iter()
            .map(|name| {
                let config = &contracts[name];
                let constructor = self.constructors.get(config.transformer.as_str()).ok_or_else(|| {
                    StorageError::UnknownTransformer {
                        contract: name.clone(),
                        kind: config.transformer.clone(),
                    }
                })?;
                let ctx = TransformerContext {
                    contract: name,
                    config,
                    db: db.clone(),
                    values: values.clone(),
                };
                constructor(&ctx)
            })
            .collect()
    }
}

impl Default for TransformerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Build the transformer registry.
///
/// Add new transformer kinds here as they are implemented.
pub fn build_registry() -> TransformerRegistry {
    let mut registry = TransformerRegistry::new();

    registry.register("decoding", super::decoding::DecodingTransformer::from_context);

    tracing::info!(
        "Built transformer registry with kinds: {}",
        registry.kinds().join(", ")
    );

    registry
}
