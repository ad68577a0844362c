use std::sync::Arc;

use alloy::primitives::{keccak256, Address, B256};
use async_trait::async_trait;

use super::error::StorageError;
use super::repository::DiffRepository;
use super::types::RawDiff;
use crate::rpc::RpcClient;
use crate::transformers::StorageTransformer;

/// Point-in-time reads of contract storage.
#[async_trait]
pub trait StorageReader: Send + Sync {
    async fn block_hash(&self, height: u64) -> Result<B256, StorageError>;

    async fn storage_at(&self, address: Address, key: B256, height: u64) -> Result<B256, StorageError>;
}

#[async_trait]
impl StorageReader for RpcClient {
    async fn block_hash(&self, height: u64) -> Result<B256, StorageError> {
        Ok(self.get_block_hash(height).await?)
    }

    async fn storage_at(&self, address: Address, key: B256, height: u64) -> Result<B256, StorageError> {
        Ok(self.get_storage_at(address, key, height).await?)
    }
}

/// Seeds `storage_diff` with the values of every known slot at one height,
/// for contracts whose history predates diff collection.
pub struct StorageValueLoader {
    reader: Arc<dyn StorageReader>,
    repository: Arc<dyn DiffRepository>,
    transformers: Vec<Arc<dyn StorageTransformer>>,
}

impl StorageValueLoader {
    pub fn new(
        reader: Arc<dyn StorageReader>,
        repository: Arc<dyn DiffRepository>,
        transformers: Vec<Arc<dyn StorageTransformer>>,
    ) -> Self {
        Self {
            reader,
            repository,
            transformers,
        }
    }

    /// Returns the number of slots read.
    pub async fn run(&self, height: u64) -> Result<usize, StorageError> {
        let block_hash = self.reader.block_hash(height).await?;
        let mut total = 0;

        for transformer in &self.transformers {
            let Some(lookup) = transformer.keys_lookup() else {
                tracing::debug!("{}: no keys to load", transformer.name());
                continue;
            };

            let address = transformer.contract_address();
            let hashed_address = keccak256(address);
            let keys = lookup.keys().await?;

            for key in &keys {
                let value = self.reader.storage_at(address, *key, height).await?;
                let diff = RawDiff {
                    hashed_address,
                    block_hash,
                    block_height: height,
                    storage_key: *key,
                    storage_value: value,
                };
                self.repository.create_back_filled_storage_value(&diff).await?;
            }

            tracing::info!(
                "{}: loaded {} storage values at block {}",
                transformer.name(),
                keys.len(),
                height
            );
            total += keys.len();
        }

        Ok(total)
    }
}
