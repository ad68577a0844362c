use std::collections::{BTreeMap, HashMap};
use std::sync::Mutex;

use alloy::primitives::{B256, U256};
use async_trait::async_trait;
use tokio::sync::mpsc;

use super::error::StorageError;
use super::queue::StorageQueue;
use super::repository::{DiffRepository, NewDiffMessage};
use super::types::{PersistedDiff, RawDiff};

/// Storage key of a plain state variable at slot `index`.
pub(crate) fn index_key(index: u64) -> B256 {
    B256::from(U256::from(index))
}

#[derive(Default)]
pub struct MockDiffRepository {
    pub created: Mutex<Vec<RawDiff>>,
    pub back_filled: Mutex<Vec<RawDiff>>,
    pub checked: Mutex<Vec<i64>>,
    pub from_backfill: Mutex<Vec<i64>>,
    pub fail_writes: bool,
}

impl MockDiffRepository {
    fn write_guard(&self) -> Result<(), StorageError> {
        if self.fail_writes {
            return Err(StorageError::Io(std::io::Error::other("database unavailable")));
        }
        Ok(())
    }
}

#[async_trait]
impl DiffRepository for MockDiffRepository {
    async fn create_storage_diff(&self, diff: &RawDiff) -> Result<i64, StorageError> {
        self.write_guard()?;
        let mut created = self.created.lock().unwrap();
        if created.contains(diff) {
            return Err(StorageError::DuplicateDiff);
        }
        created.push(*diff);
        Ok(created.len() as i64)
    }

    async fn create_back_filled_storage_value(&self, diff: &RawDiff) -> Result<(), StorageError> {
        self.write_guard()?;
        self.back_filled.lock().unwrap().push(*diff);
        Ok(())
    }

    async fn get_new_diffs(
        &self,
        out: &mpsc::Sender<NewDiffMessage>,
        _min_id: i64,
    ) -> Result<(), StorageError> {
        let _ = out.send(NewDiffMessage::Done).await;
        Ok(())
    }

    async fn mark_checked(&self, id: i64) -> Result<(), StorageError> {
        self.write_guard()?;
        self.checked.lock().unwrap().push(id);
        Ok(())
    }

    async fn mark_from_backfill(&self, id: i64) -> Result<(), StorageError> {
        self.write_guard()?;
        self.from_backfill.lock().unwrap().push(id);
        Ok(())
    }
}

#[derive(Default)]
pub struct MockQueue {
    /// Diffs the queue can join back to, keyed by id.
    pub diffs: Mutex<HashMap<i64, PersistedDiff>>,
    /// Queued id to attempt count.
    pub entries: Mutex<BTreeMap<i64, u32>>,
    pub added: Mutex<Vec<i64>>,
    pub deleted: Mutex<Vec<i64>>,
    pub fail_add: bool,
}

impl MockQueue {
    pub fn with_entries(diffs: &[PersistedDiff]) -> Self {
        let queue = Self::default();
        for diff in diffs {
            queue.diffs.lock().unwrap().insert(diff.id, *diff);
            queue.entries.lock().unwrap().insert(diff.id, 0);
        }
        queue
    }

    pub fn queued_ids(&self) -> Vec<i64> {
        self.entries.lock().unwrap().keys().copied().collect()
    }
}

#[async_trait]
impl StorageQueue for MockQueue {
    async fn add(&self, diff_id: i64) -> Result<(), StorageError> {
        if self.fail_add {
            return Err(StorageError::Io(std::io::Error::other("queue unavailable")));
        }
        self.added.lock().unwrap().push(diff_id);
        self.entries.lock().unwrap().entry(diff_id).or_insert(0);
        Ok(())
    }

    async fn delete(&self, diff_id: i64) -> Result<(), StorageError> {
        self.deleted.lock().unwrap().push(diff_id);
        self.entries.lock().unwrap().remove(&diff_id);
        Ok(())
    }

    async fn get_all(&self) -> Result<Vec<PersistedDiff>, StorageError> {
        let diffs = self.diffs.lock().unwrap();
        Ok(self
            .entries
            .lock()
            .unwrap()
            .keys()
            .filter_map(|id| diffs.get(id).copied())
            .collect())
    }

    async fn record_failed_attempt(&self, diff_id: i64) -> Result<u32, StorageError> {
        let mut entries = self.entries.lock().unwrap();
        let attempts = entries.entry(diff_id).or_insert(0);
        *attempts += 1;
        Ok(*attempts)
    }

    async fn count(&self) -> Result<i64, StorageError> {
        Ok(self.entries.lock().unwrap().len() as i64)
    }
}
