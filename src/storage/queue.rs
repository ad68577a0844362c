use std::sync::Arc;

use async_trait::async_trait;

use super::error::StorageError;
use super::repository::persisted_diff_from_row;
use super::types::PersistedDiff;
use crate::db::{DbError, DbOperation, DbPool, DbValue, WhereClause};

/// Durable set of diff ids waiting for their metadata to become known.
#[async_trait]
pub trait StorageQueue: Send + Sync {
    /// Re-adding a queued id is a no-op.
    async fn add(&self, diff_id: i64) -> Result<(), StorageError>;

    /// Removes the queue entry only, never the diff.
    async fn delete(&self, diff_id: i64) -> Result<(), StorageError>;

    async fn get_all(&self) -> Result<Vec<PersistedDiff>, StorageError>;

    /// Bump the entry's attempt counter and return the new count.
    async fn record_failed_attempt(&self, diff_id: i64) -> Result<u32, StorageError>;

    async fn count(&self) -> Result<i64, StorageError>;
}

pub struct PgStorageQueue {
    db: Arc<DbPool>,
}

impl PgStorageQueue {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl StorageQueue for PgStorageQueue {
    async fn add(&self, diff_id: i64) -> Result<(), StorageError> {
        self.db
            .execute_transaction(vec![DbOperation::Upsert {
                table: "queued_storage".to_string(),
                columns: vec!["diff_id".to_string()],
                values: vec![DbValue::Int64(diff_id)],
                conflict_columns: vec!["diff_id".to_string()],
                update_columns: vec![],
            }])
            .await?;
        Ok(())
    }

    async fn delete(&self, diff_id: i64) -> Result<(), StorageError> {
        self.db
            .execute_transaction(vec![DbOperation::Delete {
                table: "queued_storage".to_string(),
                where_clause: WhereClause::Eq("diff_id".to_string(), DbValue::Int64(diff_id)),
            }])
            .await?;
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<PersistedDiff>, StorageError> {
        let rows = self
            .db
            .query(
                "SELECT d.id, d.hashed_address, d.block_height, d.block_hash, d.storage_key, \
                 d.storage_value, d.checked, d.from_backfill \
                 FROM queued_storage q JOIN storage_diff d ON d.id = q.diff_id \
                 ORDER BY q.id",
                &[],
            )
            .await?;

        Ok(rows
            .iter()
            .map(persisted_diff_from_row)
            .collect::<Result<Vec<_>, _>>()?)
    }

    async fn record_failed_attempt(&self, diff_id: i64) -> Result<u32, StorageError> {
        let row = self
            .db
            .query_opt(
                "UPDATE queued_storage SET attempts = attempts + 1 WHERE diff_id = $1 RETURNING attempts",
                &[&diff_id],
            )
            .await?;

        // An entry deleted concurrently counts as exhausted.
        let Some(row) = row else {
            return Ok(u32::MAX);
        };
        let attempts: i32 = row.try_get("attempts").map_err(DbError::from)?;
        Ok(attempts.max(0) as u32)
    }

    async fn count(&self) -> Result<i64, StorageError> {
        let row = self
            .db
            .query_one("SELECT COUNT(*) FROM queued_storage", &[])
            .await?;
        Ok(row.try_get(0).map_err(DbError::from)?)
    }
}

#[cfg(test)]
mod tests {
    use alloy::primitives::{keccak256, B256};

    use super::*;
    use crate::storage::repository::{DiffRepository, PgDiffRepository};
    use crate::storage::types::RawDiff;

    async fn test_pool() -> Option<Arc<DbPool>> {
        let url = std::env::var("TEST_DATABASE_URL").ok()?;
        let pool = DbPool::new(&url).await.ok()?;
        pool.run_migrations().await.ok()?;
        Some(Arc::new(pool))
    }

    #[tokio::test]
    async fn test_pg_queue_lifecycle() {
        let Some(pool) = test_pool().await else {
            return;
        };
        let seed = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();
        let raw = RawDiff {
            hashed_address: keccak256(seed.to_be_bytes()),
            block_hash: B256::with_last_byte(9),
            block_height: 300,
            storage_key: B256::with_last_byte(2),
            storage_value: B256::with_last_byte(3),
        };
        let repo = PgDiffRepository::new(pool.clone());
        let queue = PgStorageQueue::new(pool.clone());

        let id = repo.create_storage_diff(&raw).await.unwrap();
        queue.add(id).await.unwrap();
        queue.add(id).await.unwrap();

        let queued: Vec<_> = queue
            .get_all()
            .await
            .unwrap()
            .into_iter()
            .filter(|d| d.id == id)
            .collect();
        assert_eq!(queued.len(), 1);
        assert_eq!(queued[0].raw, raw);

        assert_eq!(queue.record_failed_attempt(id).await.unwrap(), 1);
        assert_eq!(queue.record_failed_attempt(id).await.unwrap(), 2);

        queue.delete(id).await.unwrap();
        assert!(queue.get_all().await.unwrap().iter().all(|d| d.id != id));

        let still_there: i64 = pool
            .query_one("SELECT COUNT(*) FROM storage_diff WHERE id = $1", &[&id])
            .await
            .unwrap()
            .get(0);
        assert_eq!(still_there, 1);
    }
}
