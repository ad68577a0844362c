use std::sync::Arc;

use async_trait::async_trait;

use crate::db::{DbOperation, DbPool, DbValue};
use crate::storage::error::StorageError;
use crate::storage::types::{DecodedValue, PersistedDiff, ValueMetadata};

/// Sink for decoded values.
#[async_trait]
pub trait StorageValueRepository: Send + Sync {
    /// Persist a decoded value. Writing the same diff twice is a no-op.
    async fn create(
        &self,
        contract: &str,
        diff: &PersistedDiff,
        metadata: &ValueMetadata,
        value: &DecodedValue,
    ) -> Result<(), StorageError>;
}

pub struct PgStorageValueRepository {
    db: Arc<DbPool>,
}

impl PgStorageValueRepository {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StorageValueRepository for PgStorageValueRepository {
    async fn create(
        &self,
        contract: &str,
        diff: &PersistedDiff,
        metadata: &ValueMetadata,
        value: &DecodedValue,
    ) -> Result<(), StorageError> {
        let operations = value_operations(contract, diff, metadata, value);
        self.db.execute_transaction(operations).await?;
        Ok(())
    }
}

/// One `storage_values` row per named value: a single row for a plain slot,
/// one per member for a packed slot.
fn value_operations(
    contract: &str,
    diff: &PersistedDiff,
    metadata: &ValueMetadata,
    value: &DecodedValue,
) -> Vec<DbOperation> {
    let named: Vec<(&str, &str)> = match value {
        DecodedValue::Single(v) => vec![(metadata.name(), v.as_str())],
        DecodedValue::Packed(values) => values
            .iter()
            .filter_map(|(position, v)| {
                metadata
                    .packed_names()
                    .get(position)
                    .map(|name| (name.as_str(), v.as_str()))
            })
            .collect(),
    };

    named
        .into_iter()
        .map(|(name, v)| DbOperation::Upsert {
            table: "storage_values".to_string(),
            columns: vec![
                "diff_id".to_string(),
                "contract".to_string(),
                "name".to_string(),
                "hashed_address".to_string(),
                "block_height".to_string(),
                "block_hash".to_string(),
                "keys".to_string(),
                "value".to_string(),
            ],
            values: vec![
                DbValue::Int64(diff.id),
                DbValue::Text(contract.to_string()),
                DbValue::Text(name.to_string()),
                DbValue::Bytes32(diff.raw.hashed_address.0),
                DbValue::Uint64(diff.raw.block_height),
                DbValue::Bytes32(diff.raw.block_hash.0),
                DbValue::jsonb(metadata.keys()),
                DbValue::jsonb(v),
            ],
            conflict_columns: vec!["diff_id".to_string(), "name".to_string()],
            update_columns: vec![],
        })
        .collect()
}
