use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::B256;
use async_trait::async_trait;
use futures::StreamExt;
use tokio::sync::mpsc;
use tokio_postgres::types::ToSql;
use tokio_util::sync::CancellationToken;

use super::error::StorageError;
use super::types::{PersistedDiff, RawDiff};
use crate::db::{DbError, DbOperation, DbPool, DbValue, WhereClause};

const DIFF_COLUMNS: &str =
    "id, hashed_address, block_height, block_hash, storage_key, storage_value, checked, from_backfill";

const INSERT_DIFF_SQL: &str = "INSERT INTO storage_diff \
     (hashed_address, block_hash, block_height, storage_key, storage_value) \
     VALUES ($1, $2, $3, $4, $5) \
     ON CONFLICT DO NOTHING RETURNING id";

/// Inserts a value read from the node only when it differs from the latest
/// diff at or before that height. A zero value with no earlier diff is
/// skipped: the slot was never set.
const INSERT_BACKFILLED_VALUE_SQL: &str = "WITH latest AS ( \
         SELECT storage_value FROM storage_diff \
         WHERE hashed_address = $1::bytea AND storage_key = $4::bytea AND block_height <= $3::bigint \
         ORDER BY block_height DESC, id DESC LIMIT 1 \
     ) \
     INSERT INTO storage_diff \
     (hashed_address, block_hash, block_height, storage_key, storage_value, from_backfill) \
     SELECT $1::bytea, $2::bytea, $3::bigint, $4::bytea, $5::bytea, TRUE \
     WHERE CASE \
         WHEN EXISTS (SELECT 1 FROM latest) THEN (SELECT storage_value FROM latest) <> $5::bytea \
         ELSE NOT $6::boolean \
     END \
     ON CONFLICT DO NOTHING";

/// Message on the `get_new_diffs` stream. `Done` is always the last one.
#[derive(Debug)]
pub enum NewDiffMessage {
    Diff(PersistedDiff),
    /// A row that could not be read back. The stream continues.
    Error(StorageError),
    Done,
}

#[async_trait]
pub trait DiffRepository: Send + Sync {
    /// Returns the new row id, or `StorageError::DuplicateDiff` when the
    /// exact diff is already stored.
    async fn create_storage_diff(&self, diff: &RawDiff) -> Result<i64, StorageError>;

    async fn create_back_filled_storage_value(&self, diff: &RawDiff) -> Result<(), StorageError>;

    /// Stream unchecked diffs with an id above `min_id`, in id order.
    async fn get_new_diffs(
        &self,
        out: &mpsc::Sender<NewDiffMessage>,
        min_id: i64,
    ) -> Result<(), StorageError>;

    async fn mark_checked(&self, id: i64) -> Result<(), StorageError>;

    async fn mark_from_backfill(&self, id: i64) -> Result<(), StorageError>;
}

pub struct PgDiffRepository {
    db: Arc<DbPool>,
}

impl PgDiffRepository {
    pub fn new(db: Arc<DbPool>) -> Self {
        Self { db }
    }

    async fn stream_new_diffs(
        &self,
        out: &mpsc::Sender<NewDiffMessage>,
        min_id: i64,
    ) -> Result<(), StorageError> {
        let sql = format!(
            "SELECT {} FROM storage_diff WHERE checked = FALSE AND id > $1 ORDER BY id",
            DIFF_COLUMNS
        );
        let client = self.db.client().await?;
        let rows = client
            .query_raw(sql.as_str(), [&min_id as &(dyn ToSql + Sync)])
            .await
            .map_err(DbError::from)?;
        let mut rows = std::pin::pin!(rows);

        while let Some(row) = rows.next().await {
            let row = row.map_err(DbError::from)?;
            let message = match persisted_diff_from_row(&row) {
                Ok(diff) => NewDiffMessage::Diff(diff),
                Err(e) => NewDiffMessage::Error(e.into()),
            };
            if out.send(message).await.is_err() {
                break;
            }
        }

        Ok(())
    }

    async fn set_flag(&self, id: i64, column: &str) -> Result<(), StorageError> {
        self.db
            .execute_transaction(vec![DbOperation::Update {
                table: "storage_diff".to_string(),
                set_columns: vec![(column.to_string(), DbValue::Bool(true))],
                where_clause: WhereClause::Eq("id".to_string(), DbValue::Int64(id)),
            }])
            .await?;
        Ok(())
    }
}

#[async_trait]
impl DiffRepository for PgDiffRepository {
    async fn create_storage_diff(&self, diff: &RawDiff) -> Result<i64, StorageError> {
        let height = diff.block_height as i64;
        let row = self
            .db
            .query_opt(
                INSERT_DIFF_SQL,
                &[
                    &diff.hashed_address.as_slice(),
                    &diff.block_hash.as_slice(),
                    &height,
                    &diff.storage_key.as_slice(),
                    &diff.storage_value.as_slice(),
                ],
            )
            .await?;

        match row {
            Some(row) => Ok(row.try_get::<_, i64>("id").map_err(DbError::from)?),
            None => Err(StorageError::DuplicateDiff),
        }
    }

    async fn create_back_filled_storage_value(&self, diff: &RawDiff) -> Result<(), StorageError> {
        let height = diff.block_height as i64;
        let is_zero = diff.storage_value.is_zero();
        self.db
            .query_opt(
                INSERT_BACKFILLED_VALUE_SQL,
                &[
                    &diff.hashed_address.as_slice(),
                    &diff.block_hash.as_slice(),
                    &height,
                    &diff.storage_key.as_slice(),
                    &diff.storage_value.as_slice(),
                    &is_zero,
                ],
            )
            .await?;
        Ok(())
    }

    async fn get_new_diffs(
        &self,
        out: &mpsc::Sender<NewDiffMessage>,
        min_id: i64,
    ) -> Result<(), StorageError> {
        let result = self.stream_new_diffs(out, min_id).await;
        let _ = out.send(NewDiffMessage::Done).await;
        result
    }

    async fn mark_checked(&self, id: i64) -> Result<(), StorageError> {
        self.set_flag(id, "checked").await
    }

    async fn mark_from_backfill(&self, id: i64) -> Result<(), StorageError> {
        self.set_flag(id, "from_backfill").await
    }
}

pub(crate) fn persisted_diff_from_row(row: &tokio_postgres::Row) -> Result<PersistedDiff, DbError> {
    let height: i64 = row.try_get("block_height")?;
    let block_height = u64::try_from(height)
        .map_err(|_| DbError::row_decode("block_height", format!("negative height {}", height)))?;

    Ok(PersistedDiff {
        id: row.try_get("id")?,
        raw: RawDiff {
            hashed_address: word_column(row, "hashed_address")?,
            block_hash: word_column(row, "block_hash")?,
            block_height,
            storage_key: word_column(row, "storage_key")?,
            storage_value: word_column(row, "storage_value")?,
        },
        checked: row.try_get("checked")?,
        from_backfill: row.try_get("from_backfill")?,
    })
}

fn word_column(row: &tokio_postgres::Row, column: &str) -> Result<B256, DbError> {
    let bytes: &[u8] = row.try_get(column)?;
    B256::try_from(bytes)
        .map_err(|_| DbError::row_decode(column, format!("expected 32 bytes, got {}", bytes.len())))
}

/// Poll for unchecked diffs and forward them to the watcher.
///
/// A cursor on the last forwarded id keeps a diff from being sent twice
/// while the watcher is still working through the channel. The cursor is
/// reset after an empty poll once the watcher has drained the channel, so
/// rows committed out of id order are picked up too. Unreadable rows are logged and skipped; a failed query is sent
/// downstream as an error and ends the poller.
pub async fn poll_new_diffs(
    repository: Arc<dyn DiffRepository>,
    interval: Duration,
    out: mpsc::Sender<Result<PersistedDiff, StorageError>>,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    let mut cursor = 0i64;

    loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => return,
            _ = ticker.tick() => {}
        }

        let (tx, mut rx) = mpsc::channel(256);
        let min_id = cursor;
        let mut forwarded = 0usize;
        let mut downstream_closed = false;

        let forward = async {
            while let Some(message) = rx.recv().await {
                match message {
                    NewDiffMessage::Diff(diff) => {
                        if downstream_closed {
                            continue;
                        }
                        cursor = cursor.max(diff.id);
                        forwarded += 1;
                        if out.send(Ok(diff)).await.is_err() {
                            downstream_closed = true;
                        }
                    }
                    NewDiffMessage::Error(e) => {
                        tracing::warn!("Skipping unreadable storage diff row: {}", e);
                    }
                    NewDiffMessage::Done => break,
                }
            }
        };

        let (result, ()) = tokio::join!(repository.get_new_diffs(&tx, min_id), forward);

        if let Err(e) = result {
            tracing::error!("Polling new storage diffs failed: {}", e);
            let _ = out.send(Err(e)).await;
            return;
        }
        if downstream_closed {
            return;
        }

        if forwarded == 0 {
            if out.capacity() == out.max_capacity() {
                cursor = 0;
            }
        } else {
            tracing::debug!("Forwarded {} new storage diffs (cursor {})", forwarded, cursor);
        }
    }
}
