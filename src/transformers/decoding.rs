use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;

use super::registry::TransformerContext;
use super::repository::StorageValueRepository;
use super::traits::StorageTransformer;
use crate::storage::decoder::decode;
use crate::storage::error::StorageError;
use crate::storage::keys::{ConfigKeysLoader, KeysLookup};
use crate::storage::types::PersistedDiff;

/// Looks up the diff's key, decodes the value and stores it as-is.
pub struct DecodingTransformer {
    name: String,
    address: Address,
    lookup: Arc<KeysLookup>,
    values: Arc<dyn StorageValueRepository>,
}

impl DecodingTransformer {
    pub fn new(
        name: impl Into<String>,
        address: Address,
        lookup: Arc<KeysLookup>,
        values: Arc<dyn StorageValueRepository>,
    ) -> Self {
        Self {
            name: name.into(),
            address,
            lookup,
            values,
        }
    }

    pub fn from_context(
        ctx: &TransformerContext<'_>,
    ) -> Result<Arc<dyn StorageTransformer>, StorageError> {
        let loader = ConfigKeysLoader::new(ctx.contract, ctx.config.storage.clone(), ctx.db.clone())?;
        let lookup = Arc::new(KeysLookup::new(Arc::new(loader)));
        Ok(Arc::new(Self::new(
            ctx.contract,
            ctx.config.address,
            lookup,
            ctx.values.clone(),
        )))
    }
}

#[async_trait]
impl StorageTransformer for DecodingTransformer {
    fn name(&self) -> &str {
        &self.name
    }

    fn contract_address(&self) -> Address {
        self.address
    }

    fn keys_lookup(&self) -> Option<Arc<KeysLookup>> {
        Some(self.lookup.clone())
    }

    async fn execute(&self, diff: &PersistedDiff) -> Result<(), StorageError> {
        let metadata = self.lookup.lookup(&diff.raw.storage_key).await?;
        let value = decode(&diff.raw.storage_value, &metadata);

        tracing::debug!(
            "{}: diff {} at block {} decoded {} = {:?}",
            self.name,
            diff.id,
            diff.raw.block_height,
            metadata.name(),
            value
        );

        self.values.create(&self.name, diff, &metadata, &value).await
    }
}

#[cfg(test)]
mod tests {
    use std::collections::{BTreeMap, HashMap};
    use std::sync::Mutex;

    use alloy::primitives::{address, B256};

    use super::*;
    use crate::storage::keys::KeysLoader;
    use crate::storage::test_utils::index_key;
    use crate::storage::types::{DecodedValue, RawDiff, ValueMetadata, ValueType};

    struct StaticLoader(HashMap<B256, ValueMetadata>);

    #[async_trait]
    impl KeysLoader for StaticLoader {
        async fn load_mappings(&self) -> Result<HashMap<B256, ValueMetadata>, StorageError> {
            Ok(self.0.clone())
        }
    }

    #[derive(Default)]
    struct RecordingValues {
        rows: Mutex<Vec<(String, i64, String, DecodedValue)>>,
    }

    #[async_trait]
    impl StorageValueRepository for RecordingValues {
        async fn create(
            &self,
            contract: &str,
            diff: &PersistedDiff,
            metadata: &ValueMetadata,
            value: &DecodedValue,
        ) -> Result<(), StorageError> {
            self.rows.lock().unwrap().push((
                contract.to_string(),
                diff.id,
                metadata.name().to_string(),
                value.clone(),
            ));
            Ok(())
        }
    }

    fn transformer(values: Arc<RecordingValues>) -> DecodingTransformer {
        let metadata = ValueMetadata::new("live", BTreeMap::new(), ValueType::Uint256).unwrap();
        let loader = StaticLoader([(index_key(4), metadata)].into());
        DecodingTransformer::new(
            "vat",
            address!("35d1b3f3d7966a1dfe207aa4514c12a259a0492b"),
            Arc::new(KeysLookup::new(Arc::new(loader))),
            values,
        )
    }

    fn diff(key: B256) -> PersistedDiff {
        RawDiff {
            hashed_address: B256::ZERO,
            block_hash: B256::ZERO,
            block_height: 5,
            storage_key: key,
            storage_value: B256::with_last_byte(1),
        }
        .persisted(3)
    }

    #[tokio::test]
    async fn test_execute_decodes_and_stores() {
        let values = Arc::new(RecordingValues::default());
        let transformer = transformer(values.clone());

        transformer.execute(&diff(index_key(4))).await.unwrap();

        let rows = values.rows.lock().unwrap();
        assert_eq!(
            *rows,
            vec![(
                "vat".to_string(),
                3,
                "live".to_string(),
                DecodedValue::Single("1".to_string())
            )]
        );
    }

    #[tokio::test]
    async fn test_execute_unknown_key_is_key_not_found() {
        let values = Arc::new(RecordingValues::default());
        let transformer = transformer(values.clone());

        let err = transformer.execute(&diff(index_key(99))).await.unwrap_err();
        assert!(matches!(err, StorageError::KeyNotFound { .. }));
        assert!(values.rows.lock().unwrap().is_empty());
    }
}
