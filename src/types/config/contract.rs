use std::collections::HashMap;
use std::path::Path;

use alloy::primitives::Address;
use anyhow::Context;
use serde::Deserialize;

use crate::types::config::storage::StorageKeysConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct ContractConfig {
    pub address: Address,
    /// Registry name of the transformer handling this contract's diffs.
    #[serde(default = "default_transformer")]
    pub transformer: String,
    #[serde(default)]
    pub storage: StorageKeysConfig,
}

fn default_transformer() -> String {
    "decoding".to_string()
}

pub type Contracts = HashMap<String, ContractConfig>;

#[derive(Debug, Deserialize)]
#[serde(untagged)]
pub enum ContractsOrPath {
    Inline(Contracts),
    Path(String),
}

/// Load contracts from a JSON file, or merge every `*.json` file of a
/// directory. Contract names must be unique across files.
pub fn load_contracts_from_path(base_dir: &Path, path: &str) -> anyhow::Result<Contracts> {
    let full_path = base_dir.join(path);

    if full_path.is_dir() {
        load_contracts_from_dir(&full_path)
    } else {
        load_contracts_from_file(&full_path)
    }
}

fn load_contracts_from_file(path: &Path) -> anyhow::Result<Contracts> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read contracts file at {}", path.display()))?;
    serde_json::from_str(&content)
        .with_context(|| format!("Failed to parse contracts file at {}", path.display()))
}

fn load_contracts_from_dir(path: &Path) -> anyhow::Result<Contracts> {
    let mut merged = Contracts::new();

    let mut entries: Vec<_> = std::fs::read_dir(path)
        .with_context(|| format!("Failed to read contracts directory at {}", path.display()))?
        .filter_map(|e| e.ok())
        .filter(|e| {
            e.path()
                .extension()
                .map(|ext| ext == "json")
                .unwrap_or(false)
        })
        .collect();

    entries.sort_by_key(|e| e.path());

    for entry in entries {
        let contracts = load_contracts_from_file(&entry.path())?;
        if let Some(key) = contracts.keys().find(|key| merged.contains_key(*key)) {
            anyhow::bail!("Duplicate contract key '{}' found in {}", key, path.display());
        }
        merged.extend(contracts);
    }

    Ok(merged)
}
