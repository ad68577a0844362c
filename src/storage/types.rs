use std::collections::BTreeMap;

use alloy::primitives::B256;
use serde::{Deserialize, Serialize};

use super::error::StorageError;

/// A single storage-slot mutation. The five fields together identify it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RawDiff {
    pub hashed_address: B256,
    pub block_hash: B256,
    pub block_height: u64,
    pub storage_key: B256,
    pub storage_value: B256,
}

impl RawDiff {
    pub fn persisted(self, id: i64) -> PersistedDiff {
        PersistedDiff {
            id,
            raw: self,
            checked: false,
            from_backfill: false,
        }
    }
}

/// A `RawDiff` as stored in `storage_diff`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PersistedDiff {
    pub id: i64,
    pub raw: RawDiff,
    pub checked: bool,
    pub from_backfill: bool,
}

/// Where a diff handed to the watcher came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffSource {
    Live,
    Queue,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ValueType {
    Uint8,
    Uint16,
    Uint32,
    Uint48,
    Uint64,
    Uint128,
    Uint256,
    Address,
    Bytes32,
    PackedSlot,
}

/// Decode schema for one storage slot.
///
/// Packed fields are present exactly when the value type is
/// [`ValueType::PackedSlot`]. Both constructors enforce this, so a
/// `ValueMetadata` that exists is always decodable.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValueMetadata {
    name: String,
    keys: BTreeMap<String, String>,
    value_type: ValueType,
    packed_types: BTreeMap<usize, ValueType>,
    packed_names: BTreeMap<usize, String>,
}

impl ValueMetadata {
    pub fn new(
        name: impl Into<String>,
        keys: BTreeMap<String, String>,
        value_type: ValueType,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        if value_type == ValueType::PackedSlot {
            return Err(StorageError::invalid_metadata(
                &name,
                "packed slot declared without packed fields",
            ));
        }
        Ok(Self {
            name,
            keys,
            value_type,
            packed_types: BTreeMap::new(),
            packed_names: BTreeMap::new(),
        })
    }

    pub fn packed(
        name: impl Into<String>,
        keys: BTreeMap<String, String>,
        packed_types: BTreeMap<usize, ValueType>,
        packed_names: BTreeMap<usize, String>,
    ) -> Result<Self, StorageError> {
        let name = name.into();
        if packed_types.is_empty() {
            return Err(StorageError::invalid_metadata(&name, "packed slot has no fields"));
        }
        if packed_types.keys().ne(packed_names.keys()) {
            return Err(StorageError::invalid_metadata(
                &name,
                "packed names and types cover different positions",
            ));
        }
        if packed_types.keys().copied().ne(0..packed_types.len()) {
            return Err(StorageError::invalid_metadata(
                &name,
                "packed positions must be contiguous from 0",
            ));
        }

        let mut total = 0;
        for value_type in packed_types.values() {
            if *value_type == ValueType::PackedSlot {
                return Err(StorageError::invalid_metadata(&name, "nested packed slot"));
            }
            total += super::decoder::value_type_width(*value_type);
        }
        if total > 32 {
            return Err(StorageError::invalid_metadata(
                &name,
                format!("packed fields need {} bytes, a slot holds 32", total),
            ));
        }

        Ok(Self {
            name,
            keys,
            value_type: ValueType::PackedSlot,
            packed_types,
            packed_names,
        })
    }

    /// Build from a config-style field list: a plain slot when `packed` is
    /// empty, a packed slot otherwise.
    pub fn from_slot(
        name: impl Into<String>,
        keys: BTreeMap<String, String>,
        value_type: ValueType,
        packed: &[(String, ValueType)],
    ) -> Result<Self, StorageError> {
        let name = name.into();
        match (value_type, packed.is_empty()) {
            (ValueType::PackedSlot, _) => {
                let packed_types = packed.iter().map(|(_, t)| *t).enumerate().collect();
                let packed_names = packed.iter().map(|(n, _)| n.clone()).enumerate().collect();
                Self::packed(name, keys, packed_types, packed_names)
            }
            (_, true) => Self::new(name, keys, value_type),
            (_, false) => Err(StorageError::invalid_metadata(
                &name,
                "packed fields given for a slot that is not a packed slot",
            )),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn keys(&self) -> &BTreeMap<String, String> {
        &self.keys
    }

    pub fn value_type(&self) -> ValueType {
        self.value_type
    }

    pub fn packed_types(&self) -> &BTreeMap<usize, ValueType> {
        &self.packed_types
    }

    pub fn packed_names(&self) -> &BTreeMap<usize, String> {
        &self.packed_names
    }
}

/// Output of the decoder.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum DecodedValue {
    Single(String),
    /// Packed position to decoded sub-value.
    Packed(BTreeMap<usize, String>),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn names(n: &[&str]) -> BTreeMap<usize, String> {
        n.iter().map(|s| s.to_string()).enumerate().collect()
    }

    #[test]
    fn test_plain_metadata_rejects_packed_type() {
        let err = ValueMetadata::new("slot", BTreeMap::new(), ValueType::PackedSlot).unwrap_err();
        assert!(matches!(err, StorageError::InvalidMetadata { .. }));
    }

    #[test]
    fn test_packed_metadata_validation() {
        let ok = ValueMetadata::packed(
            "pair",
            BTreeMap::new(),
            [(0, ValueType::Uint48), (1, ValueType::Uint48)].into(),
            names(&["ttl", "tau"]),
        )
        .unwrap();
        assert_eq!(ok.value_type(), ValueType::PackedSlot);
        assert_eq!(ok.packed_names()[&1], "tau");

        let empty = ValueMetadata::packed("p", BTreeMap::new(), BTreeMap::new(), BTreeMap::new());
        assert!(empty.is_err());

        let gap = ValueMetadata::packed(
            "p",
            BTreeMap::new(),
            [(0, ValueType::Uint8), (2, ValueType::Uint8)].into(),
            [(0, "a".to_string()), (2, "b".to_string())].into(),
        );
        assert!(gap.is_err());

        let nested = ValueMetadata::packed(
            "p",
            BTreeMap::new(),
            [(0, ValueType::PackedSlot)].into(),
            names(&["a"]),
        );
        assert!(nested.is_err());

        let too_wide = ValueMetadata::packed(
            "p",
            BTreeMap::new(),
            [(0, ValueType::Uint256), (1, ValueType::Uint8)].into(),
            names(&["a", "b"]),
        );
        assert!(too_wide.is_err());
    }

    #[test]
    fn test_from_slot_rejects_fields_on_plain_slot() {
        let fields = vec![("a".to_string(), ValueType::Uint8)];
        assert!(ValueMetadata::from_slot("x", BTreeMap::new(), ValueType::Uint256, &fields).is_err());
        assert!(ValueMetadata::from_slot("x", BTreeMap::new(), ValueType::PackedSlot, &[]).is_err());

        let packed =
            ValueMetadata::from_slot("x", BTreeMap::new(), ValueType::PackedSlot, &fields).unwrap();
        assert_eq!(packed.packed_types()[&0], ValueType::Uint8);
    }

    #[test]
    fn test_value_type_deserializes_snake_case() {
        let t: ValueType = serde_json::from_str("\"packed_slot\"").unwrap();
        assert_eq!(t, ValueType::PackedSlot);
        let t: ValueType = serde_json::from_str("\"uint48\"").unwrap();
        assert_eq!(t, ValueType::Uint48);
    }
}
