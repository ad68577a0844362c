use serde::Deserialize;

use crate::storage::types::ValueType;

/// Storage layout of one contract: which slots to decode and how.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageKeysConfig {
    #[serde(default)]
    pub slots: Vec<SlotConfig>,
    #[serde(default)]
    pub mappings: Vec<MappingConfig>,
}

/// A plain state variable.
#[derive(Debug, Clone, Deserialize)]
pub struct SlotConfig {
    /// Slot number, decimal or `0x` hex.
    pub key: String,
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub packed: Vec<PackedFieldConfig>,
}

/// One member of a packed slot, listed from the low-order end.
#[derive(Debug, Clone, Deserialize)]
pub struct PackedFieldConfig {
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
}

/// A (possibly nested) mapping declared at `index`.
#[derive(Debug, Clone, Deserialize)]
pub struct MappingConfig {
    pub index: String,
    pub name: String,
    #[serde(rename = "type", default = "default_mapping_type")]
    pub value_type: ValueType,
    /// Labels for each mapping level, outermost first, e.g. `["owner", "spender"]`.
    pub key_names: Vec<String>,
    #[serde(default)]
    pub keys: Vec<MappingKey>,
    /// SQL returning one text column per mapping level; re-run on every
    /// key reload.
    #[serde(default)]
    pub keys_query: Option<String>,
    #[serde(default)]
    pub packed: Vec<PackedFieldConfig>,
    /// Struct members stored at consecutive slots from the mapping slot.
    #[serde(default)]
    pub fields: Vec<StructFieldConfig>,
}

fn default_mapping_type() -> ValueType {
    ValueType::Uint256
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MappingKey {
    Single(String),
    Nested(Vec<String>),
}

impl MappingKey {
    pub fn words(&self) -> Vec<&str> {
        match self {
            Self::Single(key) => vec![key.as_str()],
            Self::Nested(keys) => keys.iter().map(String::as_str).collect(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct StructFieldConfig {
    pub offset: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub value_type: ValueType,
    #[serde(default)]
    pub packed: Vec<PackedFieldConfig>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_storage_section() {
        let json = r#"{
            "slots": [
                {"key": "0x4", "name": "live", "type": "uint256"},
                {"key": "5", "name": "timing", "type": "packed_slot",
                 "packed": [{"name": "ttl", "type": "uint48"}, {"name": "tau", "type": "uint48"}]}
            ],
            "mappings": [
                {"index": "2", "name": "allowance", "key_names": ["owner", "spender"],
                 "keys": [["0xaa", "0xbb"]]},
                {"index": "3", "name": "wards", "key_names": ["usr"], "keys": ["0xcc"],
                 "keys_query": "SELECT usr FROM rely_events"}
            ]
        }"#;

        let config: StorageKeysConfig = serde_json::from_str(json).unwrap();
        assert_eq!(config.slots.len(), 2);
        assert_eq!(config.slots[1].packed[1].value_type, ValueType::Uint48);
        assert_eq!(config.mappings[0].value_type, ValueType::Uint256);
        assert_eq!(config.mappings[0].keys[0].words(), vec!["0xaa", "0xbb"]);
        assert_eq!(config.mappings[1].keys[0].words(), vec!["0xcc"]);
        assert!(config.mappings[1].keys_query.is_some());
    }
}
