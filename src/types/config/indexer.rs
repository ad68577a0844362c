use std::path::Path;

use anyhow::Context;
use serde::Deserialize;

use crate::types::config::chain::{resolve_chain_config, ChainConfig, ChainConfigRaw};

#[derive(Debug, Deserialize)]
pub struct IndexerConfigRaw {
    pub chains: Vec<ChainConfigRaw>,
}

#[derive(Debug)]
pub struct IndexerConfig {
    pub chains: Vec<ChainConfig>,
}

impl IndexerConfig {
    pub fn load(path: &Path) -> anyhow::Result<Self> {
        let base_dir = path.parent().unwrap_or(Path::new("."));
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file at {}", path.display()))?;
        let raw_config: IndexerConfigRaw = serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse config file at {}", path.display()))?;

        let chains = raw_config
            .chains
            .into_iter()
            .map(|chain| {
                let name = chain.name.clone();
                resolve_chain_config(chain, base_dir)
                    .with_context(|| format!("Failed to resolve chain config '{}'", name))
            })
            .collect::<anyhow::Result<Vec<_>>>()?;

        Ok(IndexerConfig { chains })
    }
}
