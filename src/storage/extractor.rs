use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::stream::{BoxStream, StreamExt};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::error::{ErrorKind, StorageError};
use super::normalize::{from_csv_row, StateDiffPayload};
use super::repository::DiffRepository;
use super::types::RawDiff;
use crate::rpc::{RpcError, StateDiffSubscriptionClient};

/// A live source of raw diffs. Per-item failures go to `errs`; a returned
/// error means the source itself failed. Returns once `cancel` fires or
/// `out` is closed.
#[async_trait]
pub trait DiffFetcher: Send + Sync {
    async fn fetch_diffs(
        &self,
        out: mpsc::Sender<RawDiff>,
        errs: mpsc::Sender<StorageError>,
        cancel: CancellationToken,
    ) -> Result<(), StorageError>;
}

/// Follows a growing CSV file of diffs, `tail -f` style, from the start.
pub struct CsvTailFetcher {
    path: PathBuf,
    poll_interval: Duration,
}

impl CsvTailFetcher {
    pub fn new(path: impl Into<PathBuf>, poll_interval: Duration) -> Self {
        Self {
            path: path.into(),
            poll_interval,
        }
    }
}

#[async_trait]
impl DiffFetcher for CsvTailFetcher {
    async fn fetch_diffs(
        &self,
        out: mpsc::Sender<RawDiff>,
        errs: mpsc::Sender<StorageError>,
        cancel: CancellationToken,
    ) -> Result<(), StorageError> {
        let file = tokio::fs::File::open(&self.path).await?;
        let mut reader = BufReader::new(file);
        let mut line = Vec::new();
        let mut line_number = 0u64;

        tracing::info!("Following storage diff CSV at {}", self.path.display());

        loop {
            // An unterminated line stays in `line` until the writer finishes it.
            let read = reader.read_until(b'\n', &mut line).await?;
            if read == 0 || line.last() != Some(&b'\n') {
                tokio::select! {
                    _ = cancel.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.poll_interval) => continue,
                }
            }

            line_number += 1;
            let sent = match std::str::from_utf8(&line) {
                Ok(text) => {
                    let trimmed = text.trim_end_matches(['\n', '\r']);
                    if trimmed.is_empty() {
                        true
                    } else {
                        let fields: Vec<&str> = trimmed.split(',').collect();
                        match from_csv_row(&fields) {
                            Ok(diff) => send_or_cancel(&out, diff, &cancel).await,
                            Err(e) => {
                                tracing::trace!("CSV line {} rejected: {}", line_number, e);
                                send_or_cancel(&errs, e, &cancel).await
                            }
                        }
                    }
                }
                Err(e) => {
                    tracing::trace!("CSV line {} is not UTF-8: {}", line_number, e);
                    send_or_cancel(&errs, StorageError::invalid_field("line", e), &cancel).await
                }
            };
            line.clear();

            if !sent {
                return Ok(());
            }
        }
    }
}

/// Written to the health-check file once the subscription is up.
const HEALTH_CHECK_MESSAGE: &str = "state diff subscription established\n";

#[async_trait]
pub trait StateDiffSubscriber: Send + Sync {
    async fn subscribe(&self) -> Result<BoxStream<'static, StateDiffPayload>, StorageError>;
}

#[async_trait]
impl StateDiffSubscriber for StateDiffSubscriptionClient {
    async fn subscribe(&self) -> Result<BoxStream<'static, StateDiffPayload>, StorageError> {
        Ok(StateDiffSubscriptionClient::subscribe(self).await?)
    }
}

/// Live diffs from the node's state diff subscription. Payloads that fail
/// to decode are reported per item; the stream ending is a source failure.
pub struct SubscriptionFetcher {
    subscriber: Arc<dyn StateDiffSubscriber>,
    health_check_path: Option<PathBuf>,
}

impl SubscriptionFetcher {
    pub fn new(subscriber: Arc<dyn StateDiffSubscriber>, health_check_path: Option<PathBuf>) -> Self {
        Self {
            subscriber,
            health_check_path,
        }
    }
}

#[async_trait]
impl DiffFetcher for SubscriptionFetcher {
    async fn fetch_diffs(
        &self,
        out: mpsc::Sender<RawDiff>,
        errs: mpsc::Sender<StorageError>,
        cancel: CancellationToken,
    ) -> Result<(), StorageError> {
        let mut payloads = self.subscriber.subscribe().await?;

        if let Some(path) = &self.health_check_path {
            tokio::fs::write(path, HEALTH_CHECK_MESSAGE).await?;
            tracing::debug!("Wrote health check file {}", path.display());
        }

        loop {
            let payload = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                payload = payloads.next() => payload,
            };
            let Some(payload) = payload else {
                return Err(RpcError::Transport("state diff subscription closed".to_string()).into());
            };

            let state_diff = match payload.decode_state_diff() {
                Ok(state_diff) => state_diff,
                Err(e) => {
                    if !send_or_cancel(&errs, e, &cancel).await {
                        return Ok(());
                    }
                    continue;
                }
            };

            tracing::trace!(
                "State diff for block {} with {} accounts",
                state_diff.block_number,
                state_diff.accounts().count()
            );

            for diff in state_diff.raw_diffs() {
                let sent = match diff {
                    Ok(diff) => send_or_cancel(&out, diff, &cancel).await,
                    Err(e) => send_or_cancel(&errs, e, &cancel).await,
                };
                if !sent {
                    return Ok(());
                }
            }
        }
    }
}

async fn send_or_cancel<T>(tx: &mpsc::Sender<T>, item: T, cancel: &CancellationToken) -> bool {
    tokio::select! {
        _ = cancel.cancelled() => false,
        sent = tx.send(item) => sent.is_ok(),
    }
}

/// Pulls diffs from a fetcher and persists them. Already stored diffs are
/// skipped; a database failure ends extraction.
pub struct DiffExtractor {
    fetcher: Arc<dyn DiffFetcher>,
    repository: Arc<dyn DiffRepository>,
}

impl DiffExtractor {
    pub fn new(fetcher: Arc<dyn DiffFetcher>, repository: Arc<dyn DiffRepository>) -> Self {
        Self {
            fetcher,
            repository,
        }
    }

    pub async fn extract(
        &self,
        channel_capacity: usize,
        cancel: CancellationToken,
    ) -> Result<(), StorageError> {
        let (diff_tx, mut diff_rx) = mpsc::channel(channel_capacity);
        let (err_tx, mut err_rx) = mpsc::channel(channel_capacity);

        let consume = async move {
            let mut diffs_open = true;
            let mut errs_open = true;

            while diffs_open || errs_open {
                tokio::select! {
                    diff = diff_rx.recv(), if diffs_open => match diff {
                        Some(diff) => self.persist(&diff).await?,
                        None => diffs_open = false,
                    },
                    err = err_rx.recv(), if errs_open => match err {
                        Some(e) => tracing::warn!("Skipping storage diff row: {}", e),
                        None => errs_open = false,
                    },
                }
            }
            Ok::<(), StorageError>(())
        };

        let (fetched, consumed) =
            tokio::join!(self.fetcher.fetch_diffs(diff_tx, err_tx, cancel), consume);
        consumed?;
        fetched
    }

    async fn persist(&self, diff: &RawDiff) -> Result<(), StorageError> {
        match self.repository.create_storage_diff(diff).await {
            Ok(id) => {
                tracing::trace!("Persisted storage diff {} at block {}", id, diff.block_height);
                Ok(())
            }
            Err(e) => match e.kind() {
                ErrorKind::DuplicateDiff => Ok(()),
                ErrorKind::Transport => Err(e),
                _ => {
                    tracing::warn!(
                        "Failed to persist storage diff at block {}: {}",
                        diff.block_height,
                        e
                    );
                    Ok(())
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use alloy::primitives::{keccak256, Bytes, B256};

    use super::*;
    use crate::storage::normalize::{AccountDiff, StateDiff, StorageDiff};
    use crate::storage::test_utils::MockDiffRepository;

    const ROW: &str = "0x35d1b3f3d7966a1dfe207aa4514c12a259a0492b,\
        0xfa40fbe2d98d98b3363a778d52f2bcd29d6790b9b3f3cab2b167fd12d3550f73,\
        789,0x04,0x2a";

    fn raw(height: u64) -> RawDiff {
        RawDiff {
            hashed_address: keccak256([1u8; 20]),
            block_hash: B256::with_last_byte(1),
            block_height: height,
            storage_key: B256::with_last_byte(4),
            storage_value: B256::with_last_byte(5),
        }
    }

    #[tokio::test]
    async fn test_csv_tail_reads_rows_and_reports_malformed() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "{}", ROW).unwrap();
        writeln!(file, "0x01,0x02").unwrap();
        writeln!(file).unwrap();
        file.flush().unwrap();

        let fetcher = CsvTailFetcher::new(file.path(), Duration::from_millis(5));
        let (out, mut diffs) = mpsc::channel(8);
        let (errs, mut errors) = mpsc::channel(8);
        let cancel = CancellationToken::new();

        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.fetch_diffs(out, errs, cancel).await })
        };

        let diff = diffs.recv().await.unwrap();
        assert_eq!(diff.block_height, 789);
        assert_eq!(diff.storage_value, B256::with_last_byte(0x2a));
        assert!(matches!(
            errors.recv().await.unwrap(),
            StorageError::RowMalformed { length: 2 }
        ));

        cancel.cancel();
        assert!(task.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn test_csv_tail_skips_non_utf8_line() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(b"\xff\xfe,bad\n").unwrap();
        writeln!(file, "{}", ROW).unwrap();
        file.flush().unwrap();

        let fetcher = CsvTailFetcher::new(file.path(), Duration::from_millis(5));
        let (out, mut diffs) = mpsc::channel(8);
        let (errs, mut errors) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.fetch_diffs(out, errs, cancel).await })
        };

        assert!(matches!(
            errors.recv().await.unwrap(),
            StorageError::InvalidRowField { field: "line", .. }
        ));
        let diff = tokio::time::timeout(Duration::from_secs(5), diffs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.block_height, 789);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_csv_tail_waits_for_partial_lines() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        let (head, tail) = ROW.split_at(30);
        write!(file, "{}", head).unwrap();
        file.flush().unwrap();

        let fetcher = CsvTailFetcher::new(file.path(), Duration::from_millis(5));
        let (out, mut diffs) = mpsc::channel(8);
        let (errs, mut errors) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.fetch_diffs(out, errs, cancel).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        writeln!(file, "{}", tail).unwrap();
        file.flush().unwrap();

        let diff = tokio::time::timeout(Duration::from_secs(5), diffs.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(diff.block_height, 789);
        assert!(errors.try_recv().is_err());

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_csv_tail_missing_file_is_an_error() {
        let fetcher = CsvTailFetcher::new("/nonexistent/diffs.csv", Duration::from_millis(5));
        let (out, _diffs) = mpsc::channel(1);
        let (errs, _errors) = mpsc::channel(1);
        let result = fetcher.fetch_diffs(out, errs, CancellationToken::new()).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
    }

    fn payload(height: u64, values: &[u64]) -> StateDiffPayload {
        let state_diff = StateDiff {
            block_number: height,
            block_hash: B256::with_last_byte(9),
            created_accounts: Vec::new(),
            deleted_accounts: Vec::new(),
            updated_accounts: vec![AccountDiff {
                key: Bytes::copy_from_slice(keccak256([1u8; 20]).as_slice()),
                value: Bytes::new(),
                storage: values
                    .iter()
                    .map(|&v| StorageDiff {
                        key: Bytes::copy_from_slice(B256::with_last_byte(4).as_slice()),
                        value: alloy_rlp::encode(v).into(),
                    })
                    .collect(),
            }],
        };
        StateDiffPayload {
            block_rlp: Bytes::new(),
            state_diff_rlp: alloy_rlp::encode(&state_diff).into(),
        }
    }

    struct MockSubscriber {
        payloads: Vec<StateDiffPayload>,
        fail: bool,
        stay_open: bool,
    }

    #[async_trait]
    impl StateDiffSubscriber for MockSubscriber {
        async fn subscribe(&self) -> Result<BoxStream<'static, StateDiffPayload>, StorageError> {
            if self.fail {
                return Err(RpcError::Transport("connection refused".to_string()).into());
            }
            let items = futures::stream::iter(self.payloads.clone());
            if self.stay_open {
                Ok(items.chain(futures::stream::pending()).boxed())
            } else {
                Ok(items.boxed())
            }
        }
    }

    #[tokio::test]
    async fn test_subscription_streams_diffs_and_writes_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let health = dir.path().join("connected");
        let subscriber = Arc::new(MockSubscriber {
            payloads: vec![
                payload(7, &[3, 0x2a]),
                StateDiffPayload::default(),
                payload(8, &[5]),
            ],
            fail: false,
            stay_open: true,
        });
        let fetcher = SubscriptionFetcher::new(subscriber, Some(health.clone()));
        let (out, mut diffs) = mpsc::channel(8);
        let (errs, mut errors) = mpsc::channel(8);
        let cancel = CancellationToken::new();
        let task = {
            let cancel = cancel.clone();
            tokio::spawn(async move { fetcher.fetch_diffs(out, errs, cancel).await })
        };

        let mut received = Vec::new();
        for _ in 0..3 {
            received.push(diffs.recv().await.unwrap());
        }
        let values: Vec<(u64, B256)> = received
            .iter()
            .map(|d| (d.block_height, d.storage_value))
            .collect();
        assert_eq!(
            values,
            vec![
                (7, B256::with_last_byte(3)),
                (7, B256::with_last_byte(0x2a)),
                (8, B256::with_last_byte(5)),
            ]
        );
        assert_eq!(received[0].hashed_address, keccak256([1u8; 20]));
        assert!(matches!(errors.recv().await.unwrap(), StorageError::Rlp(_)));
        assert_eq!(std::fs::read_to_string(&health).unwrap(), HEALTH_CHECK_MESSAGE);

        cancel.cancel();
        task.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn test_subscription_closing_is_a_source_error() {
        let subscriber = Arc::new(MockSubscriber {
            payloads: vec![payload(7, &[1])],
            fail: false,
            stay_open: false,
        });
        let fetcher = SubscriptionFetcher::new(subscriber, None);
        let (out, mut diffs) = mpsc::channel(8);
        let (errs, _errors) = mpsc::channel(8);

        let result = fetcher.fetch_diffs(out, errs, CancellationToken::new()).await;
        assert!(matches!(result, Err(StorageError::Rpc(RpcError::Transport(_)))));
        assert_eq!(diffs.recv().await.unwrap().block_height, 7);
    }

    #[tokio::test]
    async fn test_subscribe_failure_skips_health_check() {
        let dir = tempfile::tempdir().unwrap();
        let health = dir.path().join("connected");
        let subscriber = Arc::new(MockSubscriber {
            payloads: Vec::new(),
            fail: true,
            stay_open: false,
        });
        let fetcher = SubscriptionFetcher::new(subscriber, Some(health.clone()));
        let (out, _diffs) = mpsc::channel(1);
        let (errs, _errors) = mpsc::channel(1);

        let result = fetcher.fetch_diffs(out, errs, CancellationToken::new()).await;
        assert_eq!(result.unwrap_err().kind(), ErrorKind::Transport);
        assert!(!health.exists());
    }

    struct VecFetcher {
        diffs: Vec<RawDiff>,
        errors: usize,
    }

    #[async_trait]
    impl DiffFetcher for VecFetcher {
        async fn fetch_diffs(
            &self,
            out: mpsc::Sender<RawDiff>,
            errs: mpsc::Sender<StorageError>,
            _cancel: CancellationToken,
        ) -> Result<(), StorageError> {
            for _ in 0..self.errors {
                let _ = errs.send(StorageError::RowMalformed { length: 1 }).await;
            }
            for diff in &self.diffs {
                if out.send(*diff).await.is_err() {
                    break;
                }
            }
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_extractor_swallows_duplicates_and_malformed_rows() {
        let repository = Arc::new(MockDiffRepository::default());
        let fetcher = Arc::new(VecFetcher {
            diffs: vec![raw(1), raw(2), raw(1)],
            errors: 2,
        });
        let extractor = DiffExtractor::new(fetcher, repository.clone());

        extractor.extract(4, CancellationToken::new()).await.unwrap();
        assert_eq!(*repository.created.lock().unwrap(), vec![raw(1), raw(2)]);
    }

    #[tokio::test]
    async fn test_extractor_stops_on_transport_error() {
        let repository = Arc::new(MockDiffRepository {
            fail_writes: true,
            ..Default::default()
        });
        let fetcher = Arc::new(VecFetcher {
            diffs: (0..100).map(raw).collect(),
            errors: 0,
        });
        let extractor = DiffExtractor::new(fetcher, repository);

        let result = extractor.extract(1, CancellationToken::new()).await;
        assert!(matches!(result, Err(StorageError::Io(_))));
    }
}
