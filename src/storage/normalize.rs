use alloy::primitives::{keccak256, Address, Bytes, B256};
use alloy_rlp::{RlpDecodable, RlpEncodable};
use serde::{Deserialize, Serialize};

use super::error::StorageError;
use super::types::RawDiff;

/// Field count of a diff CSV row:
/// `address,block_hash,block_height,storage_key,storage_value`.
pub const CSV_ROW_LENGTH: usize = 5;

/// Parse one CSV row. The contract address is hashed so CSV diffs line up
/// with state-diff sources, which key accounts by `keccak256(address)`.
pub fn from_csv_row(row: &[&str]) -> Result<RawDiff, StorageError> {
    if row.len() != CSV_ROW_LENGTH {
        return Err(StorageError::RowMalformed { length: row.len() });
    }

    let address = Address::from_slice(&parse_padded("address", row[0], 20)?);
    let block_hash = parse_hash("block_hash", row[1])?;
    let block_height = row[2]
        .trim()
        .parse::<u64>()
        .map_err(|e| StorageError::invalid_field("block_height", e))?;
    let storage_key = parse_hash("storage_key", row[3])?;
    let storage_value = parse_hash("storage_value", row[4])?;

    Ok(RawDiff {
        hashed_address: keccak256(address),
        block_hash,
        block_height,
        storage_key,
        storage_value,
    })
}

/// Hex with or without `0x`, left-padded to 32 bytes.
fn parse_hash(field: &'static str, s: &str) -> Result<B256, StorageError> {
    Ok(B256::from_slice(&parse_padded(field, s, 32)?))
}

/// Decode a hex field of at most `width` bytes, left-padding both a
/// missing leading nibble and missing leading bytes, so `0x4` and
/// `0x0004` name the same word.
fn parse_padded(field: &'static str, s: &str, width: usize) -> Result<Vec<u8>, StorageError> {
    let digits = s.trim();
    let digits = digits
        .strip_prefix("0x")
        .or_else(|| digits.strip_prefix("0X"))
        .unwrap_or(digits);

    let bytes = if digits.len() % 2 == 1 {
        alloy::hex::decode(format!("0{}", digits))
    } else {
        alloy::hex::decode(digits)
    }
    .map_err(|e| StorageError::invalid_field(field, e))?;

    if bytes.len() > width {
        return Err(StorageError::invalid_field(
            field,
            format!("{} bytes is longer than {}", bytes.len(), width),
        ));
    }

    let mut padded = vec![0u8; width - bytes.len()];
    padded.extend_from_slice(&bytes);
    Ok(padded)
}

/// Response of `statediff_stateDiffAt`: RLP-encoded block and state diff.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StateDiffPayload {
    #[serde(default)]
    pub block_rlp: Bytes,
    pub state_diff_rlp: Bytes,
}

impl StateDiffPayload {
    pub fn decode_state_diff(&self) -> Result<StateDiff, StorageError> {
        Ok(alloy_rlp::decode_exact::<StateDiff>(&self.state_diff_rlp)?)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StorageDiff {
    pub key: Bytes,
    /// RLP encoding of the slot value.
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct AccountDiff {
    /// State trie leaf key, `keccak256(address)`.
    pub key: Bytes,
    pub value: Bytes,
    pub storage: Vec<StorageDiff>,
}

#[derive(Debug, Clone, PartialEq, Eq, RlpEncodable, RlpDecodable)]
pub struct StateDiff {
    pub block_number: u64,
    pub block_hash: B256,
    pub created_accounts: Vec<AccountDiff>,
    pub deleted_accounts: Vec<AccountDiff>,
    pub updated_accounts: Vec<AccountDiff>,
}

impl StateDiff {
    /// Created, then updated, then deleted accounts.
    pub fn accounts(&self) -> impl Iterator<Item = &AccountDiff> {
        self.created_accounts
            .iter()
            .chain(self.updated_accounts.iter())
            .chain(self.deleted_accounts.iter())
    }

    /// Every storage change in the diff as a `RawDiff`. A value that fails
    /// to decode yields an error for that entry only.
    pub fn raw_diffs(&self) -> impl Iterator<Item = Result<RawDiff, StorageError>> + '_ {
        self.accounts().flat_map(move |account| {
            account
                .storage
                .iter()
                .map(move |storage| from_state_diff(account, self, storage))
        })
    }
}

pub fn from_state_diff(
    account: &AccountDiff,
    state_diff: &StateDiff,
    storage: &StorageDiff,
) -> Result<RawDiff, StorageError> {
    let value: Bytes = alloy_rlp::decode_exact(&storage.value)?;

    Ok(RawDiff {
        hashed_address: bytes_to_word(&account.key),
        block_hash: state_diff.block_hash,
        block_height: state_diff.block_number,
        storage_key: bytes_to_word(&storage.key),
        storage_value: bytes_to_word(&value),
    })
}

/// Left-pad to 32 bytes, keeping the trailing 32 if longer.
pub(crate) fn bytes_to_word(bytes: &[u8]) -> B256 {
    if bytes.len() > 32 {
        B256::from_slice(&bytes[bytes.len() - 32..])
    } else {
        B256::left_padding_from(bytes)
    }
}
