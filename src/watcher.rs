//! Dispatch loop matching storage diffs to contract transformers.
//!
//! Diffs arrive from a live channel and from the retry queue, which is
//! drained on a fixed interval. A diff whose key metadata is not known yet
//! is queued and retried until it succeeds or runs out of attempts.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256};
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::storage::error::{ErrorKind, StorageError};
use crate::storage::queue::StorageQueue;
use crate::storage::repository::DiffRepository;
use crate::storage::types::{DiffSource, PersistedDiff};
use crate::transformers::StorageTransformer;

#[derive(Debug, Error)]
pub enum WatcherError {
    #[error("No transformers added to watcher")]
    NoTransformers,

    #[error("Storage diff source failed: {0}")]
    Source(StorageError),
}

pub struct StorageWatcher {
    transformers: HashMap<Address, Arc<dyn StorageTransformer>>,
    /// `keccak256(address)` to transformer, filled as diffs resolve.
    hashed: RwLock<HashMap<B256, Arc<dyn StorageTransformer>>>,
    repository: Arc<dyn DiffRepository>,
    queue: Arc<dyn StorageQueue>,
    max_queue_attempts: u32,
}

impl StorageWatcher {
    pub fn new(
        repository: Arc<dyn DiffRepository>,
        queue: Arc<dyn StorageQueue>,
        max_queue_attempts: u32,
    ) -> Self {
        Self {
            transformers: HashMap::new(),
            hashed: RwLock::new(HashMap::new()),
            repository,
            queue,
            max_queue_attempts: max_queue_attempts.max(1),
        }
    }

    pub fn add_transformers(
        &mut self,
        transformers: impl IntoIterator<Item = Arc<dyn StorageTransformer>>,
    ) {
        for transformer in transformers {
            let address = transformer.contract_address();
            if let Some(previous) = self.transformers.insert(address, transformer) {
                tracing::warn!(
                    "Transformer {} replaced for contract {}",
                    previous.name(),
                    address
                );
            }
        }
    }

    /// Run until `diffs` closes, yields an error, or `cancel` fires. Failures
    /// of individual diffs are logged and never end the loop.
    pub async fn execute(
        &self,
        mut diffs: mpsc::Receiver<Result<PersistedDiff, StorageError>>,
        queue_interval: Duration,
        cancel: CancellationToken,
    ) -> Result<(), WatcherError> {
        if self.transformers.is_empty() {
            return Err(WatcherError::NoTransformers);
        }

        tracing::info!(
            "Storage watcher started with {} transformers",
            self.transformers.len()
        );

        let mut ticker = tokio::time::interval(queue_interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;

                _ = cancel.cancelled() => {
                    tracing::info!("Storage watcher cancelled");
                    return Ok(());
                }

                diff = diffs.recv() => match diff {
                    Some(Ok(diff)) => self.process(diff, DiffSource::Live).await,
                    Some(Err(e)) => {
                        tracing::error!("Storage diff source failed: {}", e);
                        return Err(WatcherError::Source(e));
                    }
                    None => {
                        tracing::info!("Storage diff source closed, stopping watcher");
                        return Ok(());
                    }
                },

                _ = ticker.tick() => self.drain_queue().await,
            }
        }
    }

    async fn drain_queue(&self) {
        let queued = match self.queue.get_all().await {
            Ok(queued) => queued,
            Err(e) => {
                tracing::warn!("Failed to read storage diff queue: {}", e);
                return;
            }
        };

        if queued.is_empty() {
            return;
        }
        tracing::info!("Retrying {} queued storage diffs", queued.len());

        for diff in queued {
            self.process(diff, DiffSource::Queue).await;
        }
    }

    async fn process(&self, diff: PersistedDiff, source: DiffSource) {
        match self.transformer_for(&diff.raw.hashed_address) {
            Some(transformer) => self.dispatch(transformer.as_ref(), &diff, source).await,
            None => match source {
                DiffSource::Live => {
                    tracing::debug!(
                        "No transformer for hashed address {}, skipping diff {}",
                        diff.raw.hashed_address,
                        diff.id
                    );
                }
                DiffSource::Queue => {
                    tracing::warn!(
                        "Queued diff {} belongs to no watched contract, removing it",
                        diff.id
                    );
                    self.delete_from_queue(diff.id).await;
                }
            },
        }

        if source == DiffSource::Live {
            if let Err(e) = self.repository.mark_checked(diff.id).await {
                tracing::error!("Failed to mark diff {} as checked: {}", diff.id, e);
            }
        }
    }

    async fn dispatch(
        &self,
        transformer: &dyn StorageTransformer,
        diff: &PersistedDiff,
        source: DiffSource,
    ) {
        let result = transformer.execute(diff).await;

        match (result, source) {
            (Ok(()), DiffSource::Live) => {
                tracing::debug!("{} executed diff {}", transformer.name(), diff.id);
            }
            (Ok(()), DiffSource::Queue) => {
                tracing::debug!("{} executed queued diff {}", transformer.name(), diff.id);
                self.delete_from_queue(diff.id).await;
            }
            (Err(e), DiffSource::Live) if e.kind() == ErrorKind::KeyNotFound => {
                tracing::warn!(
                    "{}: {} for diff {}, queueing for retry",
                    transformer.name(),
                    e,
                    diff.id
                );
                if let Err(e) = self.queue.add(diff.id).await {
                    tracing::error!("Failed to queue diff {}: {}", diff.id, e);
                }
            }
            (Err(e), DiffSource::Queue) if e.kind() == ErrorKind::KeyNotFound => {
                match self.queue.record_failed_attempt(diff.id).await {
                    Ok(attempts) if attempts >= self.max_queue_attempts => {
                        tracing::warn!(
                            "{}: giving up on queued diff {} after {} attempts: {}",
                            transformer.name(),
                            diff.id,
                            attempts,
                            e
                        );
                        self.delete_from_queue(diff.id).await;
                    }
                    Ok(attempts) => {
                        tracing::debug!(
                            "{}: queued diff {} still unresolved ({} attempts)",
                            transformer.name(),
                            diff.id,
                            attempts
                        );
                    }
                    Err(queue_err) => {
                        tracing::error!(
                            "Failed to record attempt for queued diff {}: {}",
                            diff.id,
                            queue_err
                        );
                    }
                }
            }
            (Err(e), _) => {
                tracing::error!(
                    "{} failed to execute diff {}: {}",
                    transformer.name(),
                    diff.id,
                    e
                );
            }
        }
    }

    async fn delete_from_queue(&self, diff_id: i64) {
        if let Err(e) = self.queue.delete(diff_id).await {
            tracing::error!("Failed to delete diff {} from queue: {}", diff_id, e);
        }
    }

    /// Resolve by cached hash first, then by hashing each registered
    /// address until one matches.
    fn transformer_for(&self, hashed_address: &B256) -> Option<Arc<dyn StorageTransformer>> {
        if let Some(transformer) = self
            .hashed
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(hashed_address)
        {
            return Some(transformer.clone());
        }

        let (_, transformer) = self
            .transformers
            .iter()
            .find(|(address, _)| keccak256(address) == *hashed_address)?;

        self.hashed
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(*hashed_address, transformer.clone());
        Some(transformer.clone())
    }
}
