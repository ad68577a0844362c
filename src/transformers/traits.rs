use std::sync::Arc;

use alloy::primitives::Address;
use async_trait::async_trait;

use crate::storage::error::StorageError;
use crate::storage::keys::KeysLookup;
use crate::storage::types::PersistedDiff;

/// Consumer of the storage diffs of one contract.
#[async_trait]
pub trait StorageTransformer: Send + Sync + 'static {
    /// Name used in logs and persisted rows, usually the contract's config key.
    fn name(&self) -> &str;

    fn contract_address(&self) -> Address;

    /// Key metadata for the contract, when the transformer decodes by key.
    /// Used to enumerate known slots when loading current values.
    fn keys_lookup(&self) -> Option<Arc<KeysLookup>> {
        None
    }

    /// Handle one diff. A `StorageError::KeyNotFound` tells the watcher to
    /// retry the diff later.
    async fn execute(&self, diff: &PersistedDiff) -> Result<(), StorageError>;
}
