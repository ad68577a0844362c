use std::collections::{HashMap, HashSet};
use std::ops::RangeInclusive;
use std::sync::Arc;

use alloy::primitives::B256;
use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Semaphore};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::error::StorageError;
use super::normalize::{bytes_to_word, from_state_diff, StateDiffPayload};
use super::types::RawDiff;
use crate::rpc::{RpcClient, RpcError};

pub const DEFAULT_MAX_BATCH_SIZE: u64 = 1000;
pub const DEFAULT_MAX_IN_FLIGHT: usize = 10;

/// Batched state diff source, one result per requested height.
#[async_trait]
pub trait StateDiffFetcher: Send + Sync {
    async fn fetch_state_diffs_at(
        &self,
        heights: &[u64],
    ) -> Result<Vec<Result<StateDiffPayload, StorageError>>, StorageError>;
}

#[async_trait]
impl StateDiffFetcher for RpcClient {
    async fn fetch_state_diffs_at(
        &self,
        heights: &[u64],
    ) -> Result<Vec<Result<StateDiffPayload, StorageError>>, StorageError> {
        Ok(self
            .state_diffs_at(heights)
            .await
            .into_iter()
            .map(|result| result.map_err(StorageError::from))
            .collect())
    }
}

#[derive(Debug, Error)]
pub enum BackfillError {
    #[error("ending block {end} is before starting block {start}")]
    InvalidRange { start: u64, end: u64 },

    #[error("batch size must be greater than zero")]
    ZeroBatchSize,

    #[error("fetching state diffs for blocks {start}-{end} failed: {source}")]
    Fetch {
        start: u64,
        end: u64,
        source: StorageError,
    },

    #[error("decoding state diff at block {height} failed: {source}")]
    Decode { height: u64, source: StorageError },

    #[error("normalizing storage diff at block {height} failed: {source}")]
    Normalize { height: u64, source: StorageError },
}

/// Restricts a backfill to chosen contracts, keyed by hashed address. A
/// contract with an empty key set keeps every slot.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct WantedStorage {
    contracts: HashMap<B256, HashSet<B256>>,
}

impl WantedStorage {
    pub fn contract(mut self, hashed_address: B256) -> Self {
        self.contracts.entry(hashed_address).or_default();
        self
    }

    pub fn keys(mut self, hashed_address: B256, keys: impl IntoIterator<Item = B256>) -> Self {
        self.contracts.entry(hashed_address).or_default().extend(keys);
        self
    }

    pub fn wants_account(&self, hashed_address: &B256) -> bool {
        self.contracts.contains_key(hashed_address)
    }

    pub fn wants_slot(&self, hashed_address: &B256, storage_key: &B256) -> bool {
        self.contracts
            .get(hashed_address)
            .is_some_and(|keys| keys.is_empty() || keys.contains(storage_key))
    }

    pub fn contract_count(&self) -> usize {
        self.contracts.len()
    }
}

/// Sent once every scheduled bin has finished, or after cancellation once
/// in-flight bins have stopped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackfillSummary {
    pub bins: usize,
    pub completed_bins: usize,
    pub cancelled: bool,
}

/// Split `[start, end]` into contiguous bins of `batch_size` heights. The
/// last bin may be shorter.
pub fn split_into_bins(
    start: u64,
    end: u64,
    batch_size: u64,
) -> Result<Vec<RangeInclusive<u64>>, BackfillError> {
    if end < start {
        return Err(BackfillError::InvalidRange { start, end });
    }
    if batch_size == 0 {
        return Err(BackfillError::ZeroBatchSize);
    }

    let mut bins = Vec::with_capacity(((end - start) / batch_size + 1) as usize);
    let mut bin_start = start;
    loop {
        let bin_end = bin_start.saturating_add(batch_size - 1).min(end);
        bins.push(bin_start..=bin_end);
        if bin_end == end {
            break;
        }
        bin_start = bin_end + 1;
    }
    Ok(bins)
}

/// Re-derives storage diffs for a historical block range from node state
/// diffs, a bounded number of bins at a time.
pub struct BackFiller {
    fetcher: Arc<dyn StateDiffFetcher>,
    max_in_flight: usize,
    wanted: Option<Arc<WantedStorage>>,
}

impl BackFiller {
    pub fn with_max_in_flight(fetcher: Arc<dyn StateDiffFetcher>, max_in_flight: usize) -> Self {
        Self {
            fetcher,
            max_in_flight: max_in_flight.max(1),
            wanted: None,
        }
    }

    /// Only emit diffs `wanted` selects. Without a filter every diff is kept.
    pub fn with_wanted_storage(mut self, wanted: WantedStorage) -> Self {
        self.wanted = Some(Arc::new(wanted));
        self
    }

    /// Start backfilling `[start, end]`. The range is validated before
    /// anything is spawned; a batch size of 0 means the default.
    ///
    /// Diffs go to `diff_tx` and per-item failures to `err_tx`, in no
    /// particular order. `done_tx` fires once all bins are finished.
    #[allow(clippy::too_many_arguments)]
    pub fn back_fill(
        &self,
        start: u64,
        end: u64,
        batch_size: u64,
        diff_tx: mpsc::Sender<RawDiff>,
        err_tx: mpsc::Sender<BackfillError>,
        done_tx: oneshot::Sender<BackfillSummary>,
        cancel: CancellationToken,
    ) -> Result<(), BackfillError> {
        let batch_size = if batch_size == 0 {
            DEFAULT_MAX_BATCH_SIZE
        } else {
            batch_size
        };
        let bins = split_into_bins(start, end, batch_size)?;

        tracing::info!(
            "Backfilling storage diffs for blocks {}-{} in {} bins of up to {} blocks",
            start,
            end,
            bins.len(),
            batch_size
        );

        if let Some(wanted) = &self.wanted {
            tracing::info!("Backfill restricted to {} contracts", wanted.contract_count());
        }

        tokio::spawn(schedule_bins(
            self.fetcher.clone(),
            self.wanted.clone(),
            bins,
            self.max_in_flight,
            diff_tx,
            err_tx,
            done_tx,
            cancel,
        ));

        Ok(())
    }
}

#[allow(clippy::too_many_arguments)]
async fn schedule_bins(
    fetcher: Arc<dyn StateDiffFetcher>,
    wanted: Option<Arc<WantedStorage>>,
    bins: Vec<RangeInclusive<u64>>,
    max_in_flight: usize,
    diff_tx: mpsc::Sender<RawDiff>,
    err_tx: mpsc::Sender<BackfillError>,
    done_tx: oneshot::Sender<BackfillSummary>,
    cancel: CancellationToken,
) {
    let total = bins.len();
    let semaphore = Arc::new(Semaphore::new(max_in_flight));
    let mut join_set = JoinSet::new();
    let mut pending = bins.into_iter();
    let mut next = pending.next();
    let mut completed_bins = 0;
    let mut cancelled = false;

    loop {
        if next.is_none() && join_set.is_empty() {
            break;
        }

        tokio::select! {
            biased;

            _ = cancel.cancelled(), if !cancelled => {
                tracing::warn!("Backfill cancelled, waiting for {} in-flight bins", join_set.len());
                cancelled = true;
                next = None;
            }

            Some(joined) = join_set.join_next(), if !join_set.is_empty() => {
                match joined {
                    Ok(true) => completed_bins += 1,
                    Ok(false) => {}
                    Err(e) => tracing::error!("Backfill worker failed: {}", e),
                }
            }

            permit = semaphore.clone().acquire_owned(), if next.is_some() => {
                let Ok(permit) = permit else {
                    break;
                };
                let Some(bin) = next.take() else {
                    continue;
                };
                next = pending.next();

                let fetcher = fetcher.clone();
                let wanted = wanted.clone();
                let diff_tx = diff_tx.clone();
                let err_tx = err_tx.clone();
                let cancel = cancel.clone();

                join_set.spawn(async move {
                    let _permit = permit;
                    process_bin(fetcher.as_ref(), wanted.as_deref(), bin, &diff_tx, &err_tx, &cancel).await
                });
            }
        }
    }

    let _ = done_tx.send(BackfillSummary {
        bins: total,
        completed_bins,
        cancelled,
    });
}

/// Returns false when the bin stopped early because of cancellation or an
/// abandoned consumer.
async fn process_bin(
    fetcher: &dyn StateDiffFetcher,
    wanted: Option<&WantedStorage>,
    bin: RangeInclusive<u64>,
    diff_tx: &mpsc::Sender<RawDiff>,
    err_tx: &mpsc::Sender<BackfillError>,
    cancel: &CancellationToken,
) -> bool {
    let (start, end) = (*bin.start(), *bin.end());
    let heights: Vec<u64> = bin.collect();

    let fetched = tokio::select! {
        _ = cancel.cancelled() => return false,
        fetched = fetcher.fetch_state_diffs_at(&heights) => fetched,
    };

    let payloads = match fetched {
        Ok(payloads) => payloads,
        Err(source) => {
            let err = BackfillError::Fetch { start, end, source };
            return send_or_cancel(err_tx, err, cancel).await;
        }
    };

    if payloads.len() < heights.len() {
        tracing::warn!(
            "Fetcher returned {} of {} state diffs for blocks {}-{}",
            payloads.len(),
            heights.len(),
            start,
            end
        );
    }
    let mut payloads = payloads.into_iter();

    for height in heights {
        let payload = payloads.next().unwrap_or_else(|| {
            Err(StorageError::Rpc(RpcError::ProviderError(format!(
                "no state diff returned for block {}",
                height
            ))))
        });

        let state_diff = match payload {
            Ok(payload) => match payload.decode_state_diff() {
                Ok(state_diff) => state_diff,
                Err(source) => {
                    if !send_or_cancel(err_tx, BackfillError::Decode { height, source }, cancel).await {
                        return false;
                    }
                    continue;
                }
            },
            Err(source) => {
                let err = BackfillError::Fetch {
                    start: height,
                    end: height,
                    source,
                };
                if !send_or_cancel(err_tx, err, cancel).await {
                    return false;
                }
                continue;
            }
        };

        for account in state_diff.accounts() {
            let hashed_address = bytes_to_word(&account.key);
            if wanted.is_some_and(|w| !w.wants_account(&hashed_address)) {
                continue;
            }

            for storage in &account.storage {
                if wanted.is_some_and(|w| !w.wants_slot(&hashed_address, &bytes_to_word(&storage.key))) {
                    continue;
                }

                let sent = match from_state_diff(account, &state_diff, storage) {
                    Ok(diff) => {
                        tracing::trace!(
                            "Backfilled diff: hashed address {} block {} key {} value {}",
                            diff.hashed_address,
                            diff.block_height,
                            diff.storage_key,
                            diff.storage_value
                        );
                        send_or_cancel(diff_tx, diff, cancel).await
                    }
                    Err(source) => {
                        send_or_cancel(err_tx, BackfillError::Normalize { height, source }, cancel).await
                    }
                };
                if !sent {
                    return false;
                }
            }
        }
    }

    tracing::info!("Finished fetching backfill bin from {} to {}", start, end);
    true
}

async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}
