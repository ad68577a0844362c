use alloy::primitives::B256;
use thiserror::Error;

use crate::db::DbError;
use crate::rpc::RpcError;

/// Coarse classification the watcher and extractor branch on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// No decode metadata for the key yet. Recoverable by queueing.
    KeyNotFound,
    /// The diff is already stored. Benign.
    DuplicateDiff,
    /// A source line with the wrong shape. Fatal to that line only.
    RowMalformed,
    /// Database or node connectivity.
    Transport,
    /// Schema or config bug.
    Configuration,
    Decode,
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage key {key} not found")]
    KeyNotFound { key: B256 },

    #[error("duplicate storage diff")]
    DuplicateDiff,

    #[error("malformed row: expected 5 fields, got {length}")]
    RowMalformed { length: usize },

    #[error("invalid {field} field: {message}")]
    InvalidRowField { field: &'static str, message: String },

    #[error("invalid metadata for '{name}': {message}")]
    InvalidMetadata { name: String, message: String },

    #[error("RLP decode error: {0}")]
    Rlp(#[from] alloy_rlp::Error),

    #[error("Database error: {0}")]
    Database(#[from] DbError),

    #[error("RPC error: {0}")]
    Rpc(#[from] RpcError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("contract '{contract}' names unknown transformer '{kind}'")]
    UnknownTransformer { contract: String, kind: String },
}

impl StorageError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            StorageError::KeyNotFound { .. } => ErrorKind::KeyNotFound,
            StorageError::DuplicateDiff => ErrorKind::DuplicateDiff,
            StorageError::RowMalformed { .. } | StorageError::InvalidRowField { .. } => {
                ErrorKind::RowMalformed
            }
            StorageError::InvalidMetadata { .. } | StorageError::UnknownTransformer { .. } => {
                ErrorKind::Configuration
            }
            StorageError::Rlp(_) => ErrorKind::Decode,
            StorageError::Database(_) | StorageError::Rpc(_) | StorageError::Io(_) => {
                ErrorKind::Transport
            }
        }
    }

    pub fn invalid_metadata(name: &str, message: impl Into<String>) -> Self {
        Self::InvalidMetadata {
            name: name.to_string(),
            message: message.into(),
        }
    }

    pub fn invalid_field(field: &'static str, message: impl ToString) -> Self {
        Self::InvalidRowField {
            field,
            message: message.to_string(),
        }
    }
}
