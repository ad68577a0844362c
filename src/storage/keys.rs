use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use alloy::primitives::{keccak256, B256, U256};
use async_trait::async_trait;
use tokio::sync::Mutex;

use super::error::StorageError;
use super::types::{ValueMetadata, ValueType};
use crate::db::{DbError, DbPool};
use crate::types::config::storage::{MappingConfig, MappingKey, StorageKeysConfig};

/// Source of the storage-key to metadata mappings for one contract.
#[async_trait]
pub trait KeysLoader: Send + Sync {
    async fn load_mappings(&self) -> Result<HashMap<B256, ValueMetadata>, StorageError>;
}

struct LookupState {
    mappings: HashMap<B256, ValueMetadata>,
    keys: Vec<B256>,
}

/// Cached key resolution with a single reload on miss.
///
/// Every loaded key is also stored under its keccak hash, since some diff
/// sources report hashed storage keys.
pub struct KeysLookup {
    loader: Arc<dyn KeysLoader>,
    state: Mutex<LookupState>,
}

impl KeysLookup {
    pub fn new(loader: Arc<dyn KeysLoader>) -> Self {
        Self {
            loader,
            state: Mutex::new(LookupState {
                mappings: HashMap::new(),
                keys: Vec::new(),
            }),
        }
    }

    pub async fn lookup(&self, key: &B256) -> Result<ValueMetadata, StorageError> {
        let mut state = self.state.lock().await;
        if let Some(metadata) = state.mappings.get(key) {
            return Ok(metadata.clone());
        }

        self.refresh(&mut state).await?;

        state
            .mappings
            .get(key)
            .cloned()
            .ok_or(StorageError::KeyNotFound { key: *key })
    }

    /// Reload and return every known storage key, without hashed duplicates.
    pub async fn keys(&self) -> Result<Vec<B256>, StorageError> {
        let mut state = self.state.lock().await;
        self.refresh(&mut state).await?;
        Ok(state.keys.clone())
    }

    async fn refresh(&self, state: &mut LookupState) -> Result<(), StorageError> {
        let loaded = self.loader.load_mappings().await?;

        let mut keys: Vec<B256> = loaded.keys().copied().collect();
        keys.sort();

        let mut mappings = HashMap::with_capacity(loaded.len() * 2);
        for (key, metadata) in loaded {
            mappings.insert(keccak256(key), metadata.clone());
            mappings.insert(key, metadata);
        }

        tracing::debug!("Reloaded {} storage keys", keys.len());
        state.mappings = mappings;
        state.keys = keys;
        Ok(())
    }
}

/// Loader driven by a contract's `storage` config section. Mapping keys
/// listed inline are fixed; keys produced by `keys_query` are re-read on
/// every load.
pub struct ConfigKeysLoader {
    contract: String,
    config: StorageKeysConfig,
    db: Option<Arc<DbPool>>,
}

impl ConfigKeysLoader {
    /// Validates every slot's metadata up front so schema mistakes fail at
    /// startup rather than per diff.
    pub fn new(
        contract: impl Into<String>,
        config: StorageKeysConfig,
        db: Option<Arc<DbPool>>,
    ) -> Result<Self, StorageError> {
        let contract = contract.into();
        build_static_mappings(&config)?;

        if db.is_none() {
            if let Some(mapping) = config.mappings.iter().find(|m| m.keys_query.is_some()) {
                return Err(StorageError::invalid_metadata(
                    &mapping.name,
                    format!("contract {} uses keys_query without a database", contract),
                ));
            }
        }

        Ok(Self {
            contract,
            config,
            db,
        })
    }

    async fn query_keys(&self, query: &str) -> Result<Vec<MappingKey>, StorageError> {
        let Some(db) = &self.db else {
            return Ok(Vec::new());
        };

        let rows = db.query(query, &[]).await?;
        let mut keys = Vec::with_capacity(rows.len());
        for row in rows {
            let mut words = Vec::with_capacity(row.len());
            for i in 0..row.len() {
                let word: String = row
                    .try_get(i)
                    .map_err(|e| DbError::row_decode(&format!("keys_query[{}]", i), e.to_string()))?;
                words.push(word);
            }
            keys.push(MappingKey::Nested(words));
        }
        Ok(keys)
    }
}

#[async_trait]
impl KeysLoader for ConfigKeysLoader {
    async fn load_mappings(&self) -> Result<HashMap<B256, ValueMetadata>, StorageError> {
        let mut mappings = build_static_mappings(&self.config)?;

        for mapping in &self.config.mappings {
            let Some(query) = &mapping.keys_query else {
                continue;
            };
            let keys = self.query_keys(query).await?;
            tracing::trace!(
                "{}: keys_query for '{}' returned {} keys",
                self.contract,
                mapping.name,
                keys.len()
            );
            add_mapping_entries(&mut mappings, mapping, &keys)?;
        }

        Ok(mappings)
    }
}

fn build_static_mappings(
    config: &StorageKeysConfig,
) -> Result<HashMap<B256, ValueMetadata>, StorageError> {
    let mut mappings = HashMap::new();

    for slot in &config.slots {
        let key = parse_word(&slot.key).map_err(|m| StorageError::invalid_metadata(&slot.name, m))?;
        let metadata = ValueMetadata::from_slot(
            slot.name.clone(),
            BTreeMap::new(),
            slot.value_type,
            &packed_fields(&slot.packed),
        )?;
        mappings.insert(key, metadata);
    }

    for mapping in &config.mappings {
        add_mapping_entries(&mut mappings, mapping, &mapping.keys)?;
    }

    Ok(mappings)
}

fn add_mapping_entries(
    mappings: &mut HashMap<B256, ValueMetadata>,
    mapping: &MappingConfig,
    keys: &[MappingKey],
) -> Result<(), StorageError> {
    let index =
        parse_word(&mapping.index).map_err(|m| StorageError::invalid_metadata(&mapping.name, m))?;

    for key in keys {
        let words = key.words();
        if words.len() != mapping.key_names.len() {
            return Err(StorageError::invalid_metadata(
                &mapping.name,
                format!(
                    "expected {} mapping keys, got {}",
                    mapping.key_names.len(),
                    words.len()
                ),
            ));
        }

        let parsed = words
            .iter()
            .map(|w| parse_word(w))
            .collect::<Result<Vec<_>, _>>()
            .map_err(|m| StorageError::invalid_metadata(&mapping.name, m))?;
        let labels: BTreeMap<String, String> = mapping
            .key_names
            .iter()
            .cloned()
            .zip(words.iter().map(|w| w.to_string()))
            .collect();

        let base = nested_mapping_key(&parsed, index);

        if mapping.fields.is_empty() {
            let metadata = ValueMetadata::from_slot(
                mapping.name.clone(),
                labels,
                mapping.value_type,
                &packed_fields(&mapping.packed),
            )?;
            mappings.insert(base, metadata);
            continue;
        }

        for field in &mapping.fields {
            let metadata = ValueMetadata::from_slot(
                field.name.clone(),
                labels.clone(),
                field.value_type,
                &packed_fields(&field.packed),
            )?;
            mappings.insert(incremented_key(base, field.offset), metadata);
        }
    }

    Ok(())
}

fn packed_fields(
    packed: &[crate::types::config::storage::PackedFieldConfig],
) -> Vec<(String, ValueType)> {
    packed.iter().map(|p| (p.name.clone(), p.value_type)).collect()
}

/// Solidity mapping slot: `keccak256(pad32(key) ++ pad32(index))`.
pub fn mapping_key(key: B256, index: B256) -> B256 {
    let mut preimage = [0u8; 64];
    preimage[..32].copy_from_slice(key.as_slice());
    preimage[32..].copy_from_slice(index.as_slice());
    keccak256(preimage)
}

/// Slot of `mapping[k0][k1]...` declared at `index`.
pub fn nested_mapping_key(keys: &[B256], index: B256) -> B256 {
    keys.iter().fold(index, |slot, key| mapping_key(*key, slot))
}

/// Slot `n` words after `key`, used for struct members.
pub fn incremented_key(key: B256, n: u64) -> B256 {
    B256::from(U256::from_be_bytes(key.0).wrapping_add(U256::from(n)))
}

/// Parse a 32-byte word from `0x`-prefixed hex (left-padded) or a decimal
/// integer.
pub fn parse_word(s: &str) -> Result<B256, String> {
    let s = s.trim();
    if let Some(hex) = s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        let bytes = alloy::hex::decode(hex).map_err(|e| format!("invalid hex '{}': {}", s, e))?;
        if bytes.len() > 32 {
            return Err(format!("'{}' is longer than 32 bytes", s));
        }
        let mut word = [0u8; 32];
        word[32 - bytes.len()..].copy_from_slice(&bytes);
        Ok(B256::from(word))
    } else {
        let value = U256::from_str_radix(s, 10).map_err(|e| format!("invalid integer '{}': {}", s, e))?;
        Ok(B256::from(value))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use alloy::primitives::{address, b256};

    use super::*;
    use crate::storage::test_utils::index_key;
    use crate::types::config::storage::{PackedFieldConfig, SlotConfig, StructFieldConfig};

    struct MockLoader {
        calls: AtomicUsize,
        mappings: std::sync::Mutex<HashMap<B256, ValueMetadata>>,
        fail: bool,
    }

    impl MockLoader {
        fn new(mappings: HashMap<B256, ValueMetadata>) -> Self {
            Self {
                calls: AtomicUsize::new(0),
                mappings: std::sync::Mutex::new(mappings),
                fail: false,
            }
        }
    }

    #[async_trait]
    impl KeysLoader for MockLoader {
        async fn load_mappings(&self) -> Result<HashMap<B256, ValueMetadata>, StorageError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            if self.fail {
                return Err(StorageError::Io(std::io::Error::other("loader down")));
            }
            Ok(self.mappings.lock().unwrap().clone())
        }
    }

    fn metadata(name: &str) -> ValueMetadata {
        ValueMetadata::new(name, BTreeMap::new(), ValueType::Uint256).unwrap()
    }

    #[tokio::test]
    async fn test_miss_reloads_once_then_hits_cache() {
        let key = index_key(1);
        let loader = Arc::new(MockLoader::new([(key, metadata("supply"))].into()));
        let lookup = KeysLookup::new(loader.clone());

        assert_eq!(lookup.lookup(&key).await.unwrap().name(), "supply");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);

        lookup.lookup(&key).await.unwrap();
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hashed_key_resolves_to_same_metadata() {
        let key = index_key(3);
        let loader = Arc::new(MockLoader::new([(key, metadata("owner"))].into()));
        let lookup = KeysLookup::new(loader);

        let direct = lookup.lookup(&key).await.unwrap();
        let hashed = lookup.lookup(&keccak256(key)).await.unwrap();
        assert_eq!(direct, hashed);
    }

    #[tokio::test]
    async fn test_unknown_key_is_key_not_found_after_one_reload() {
        let loader = Arc::new(MockLoader::new(HashMap::new()));
        let lookup = KeysLookup::new(loader.clone());
        let key = index_key(9);

        let err = lookup.lookup(&key).await.unwrap_err();
        assert!(matches!(err, StorageError::KeyNotFound { key: k } if k == key));
        assert_eq!(loader.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_key_added_after_first_load_is_found_on_reload() {
        let first = index_key(0);
        let later = index_key(1);
        let loader = Arc::new(MockLoader::new([(first, metadata("a"))].into()));
        let lookup = KeysLookup::new(loader.clone());

        lookup.lookup(&first).await.unwrap();
        loader.mappings.lock().unwrap().insert(later, metadata("b"));

        assert_eq!(lookup.lookup(&later).await.unwrap().name(), "b");
        assert_eq!(loader.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loader_error_propagates() {
        let mut loader = MockLoader::new(HashMap::new());
        loader.fail = true;
        let lookup = KeysLookup::new(Arc::new(loader));

        let err = lookup.lookup(&index_key(0)).await.unwrap_err();
        assert!(matches!(err, StorageError::Io(_)));
    }

    #[tokio::test]
    async fn test_keys_excludes_hashed_duplicates() {
        let loader = Arc::new(MockLoader::new(
            [(index_key(0), metadata("a")), (index_key(1), metadata("b"))].into(),
        ));
        let lookup = KeysLookup::new(loader);
        assert_eq!(lookup.keys().await.unwrap(), vec![index_key(0), index_key(1)]);
    }

    #[test]
    fn test_mapping_key_matches_solidity_layout() {
        // balanceOf[0xd8dA...6045] for a mapping declared at slot 0
        let holder = B256::left_padding_from(
            address!("d8dA6BF26964aF9D7eEd9e03E53415D37aA96045").as_slice(),
        );
        let mut preimage = Vec::new();
        preimage.extend_from_slice(holder.as_slice());
        preimage.extend_from_slice(&[0u8; 32]);
        assert_eq!(mapping_key(holder, index_key(0)), keccak256(&preimage));
    }

    #[test]
    fn test_nested_mapping_key_folds_outer_first() {
        let owner = index_key(0xaa);
        let spender = index_key(0xbb);
        let index = index_key(1);
        assert_eq!(
            nested_mapping_key(&[owner, spender], index),
            mapping_key(spender, mapping_key(owner, index))
        );
    }

    #[test]
    fn test_incremented_key() {
        let key = b256!("00000000000000000000000000000000000000000000000000000000000000ff");
        assert_eq!(incremented_key(key, 1), index_key(0x100));
        assert_eq!(incremented_key(B256::repeat_byte(0xff), 1), B256::ZERO);
    }

    #[test]
    fn test_parse_word() {
        assert_eq!(parse_word("5").unwrap(), index_key(5));
        assert_eq!(parse_word("0x05").unwrap(), index_key(5));
        assert!(parse_word("0xzz").is_err());
        assert!(parse_word(&format!("0x{}", "00".repeat(33))).is_err());
    }

    fn keys_config() -> StorageKeysConfig {
        StorageKeysConfig {
            slots: vec![
                SlotConfig {
                    key: "0".to_string(),
                    name: "totalSupply".to_string(),
                    value_type: ValueType::Uint256,
                    packed: Vec::new(),
                },
                SlotConfig {
                    key: "1".to_string(),
                    name: "timing".to_string(),
                    value_type: ValueType::PackedSlot,
                    packed: vec![
                        PackedFieldConfig {
                            name: "ttl".to_string(),
                            value_type: ValueType::Uint48,
                        },
                        PackedFieldConfig {
                            name: "tau".to_string(),
                            value_type: ValueType::Uint48,
                        },
                    ],
                },
            ],
            mappings: vec![MappingConfig {
                index: "2".to_string(),
                name: "position".to_string(),
                value_type: ValueType::Uint256,
                key_names: vec!["owner".to_string()],
                keys: vec![MappingKey::Single("0xaa".to_string())],
                keys_query: None,
                packed: Vec::new(),
                fields: vec![
                    StructFieldConfig {
                        offset: 0,
                        name: "collateral".to_string(),
                        value_type: ValueType::Uint256,
                        packed: Vec::new(),
                    },
                    StructFieldConfig {
                        offset: 1,
                        name: "debt".to_string(),
                        value_type: ValueType::Uint256,
                        packed: Vec::new(),
                    },
                ],
            }],
        }
    }

    #[tokio::test]
    async fn test_config_loader_builds_slots_and_struct_fields() {
        let loader = ConfigKeysLoader::new("vat", keys_config(), None).unwrap();
        let mappings = loader.load_mappings().await.unwrap();

        assert_eq!(mappings[&index_key(0)].name(), "totalSupply");
        assert_eq!(mappings[&index_key(1)].value_type(), ValueType::PackedSlot);

        let base = mapping_key(index_key(0xaa), index_key(2));
        assert_eq!(mappings[&base].name(), "collateral");
        assert_eq!(mappings[&incremented_key(base, 1)].name(), "debt");
        assert_eq!(mappings[&base].keys()["owner"], "0xaa");
        assert_eq!(mappings.len(), 4);
    }

    #[test]
    fn test_config_loader_rejects_key_count_mismatch() {
        let mut config = keys_config();
        config.mappings[0].keys = vec![MappingKey::Nested(vec!["1".to_string(), "2".to_string()])];
        assert!(matches!(
            ConfigKeysLoader::new("vat", config, None),
            Err(StorageError::InvalidMetadata { .. })
        ));
    }

    #[test]
    fn test_config_loader_requires_db_for_keys_query() {
        let mut config = keys_config();
        config.mappings[0].keys_query = Some("SELECT owner FROM owners".to_string());
        assert!(ConfigKeysLoader::new("vat", config, None).is_err());
    }
}
