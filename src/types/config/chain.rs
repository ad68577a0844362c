use std::path::Path;

use serde::Deserialize;

use crate::storage::backfill::{DEFAULT_MAX_BATCH_SIZE, DEFAULT_MAX_IN_FLIGHT};
use crate::types::config::contract::{load_contracts_from_path, Contracts, ContractsOrPath};

#[derive(Debug, Deserialize)]
pub struct ChainConfigRaw {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    #[serde(default = "default_database_url_env_var")]
    pub database_url_env_var: String,
    pub contracts: ContractsOrPath,
    #[serde(default)]
    pub requests_per_second: Option<u32>,
    #[serde(default)]
    pub rpc_batch_size: Option<usize>,
    #[serde(default)]
    pub rpc_max_retries: Option<u32>,
    #[serde(default)]
    pub storage_diffs: StorageDiffsConfig,
}

fn default_database_url_env_var() -> String {
    "DATABASE_URL".to_string()
}

#[derive(Debug, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub rpc_url_env_var: String,
    pub database_url_env_var: String,
    pub contracts: Contracts,
    pub requests_per_second: Option<u32>,
    pub rpc_batch_size: Option<usize>,
    pub rpc_max_retries: Option<u32>,
    pub storage_diffs: StorageDiffsConfig,
}

/// Tuning for the diff pipeline. Every field has a default.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageDiffsConfig {
    /// CSV file of diffs to follow while watching.
    pub csv_path: Option<String>,
    /// Env var holding a websocket URL for the node's state diff
    /// subscription.
    pub ws_url_env_var: Option<String>,
    /// Written once the state diff subscription is established.
    pub health_check_path: Option<String>,
    pub poll_interval_ms: u64,
    pub queue_interval_ms: u64,
    /// Attempts a queued diff gets before it is dropped.
    pub max_queue_attempts: u32,
    pub backfill_batch_size: u64,
    pub backfill_max_in_flight: usize,
    pub channel_capacity: usize,
}

impl Default for StorageDiffsConfig {
    fn default() -> Self {
        Self {
            csv_path: None,
            ws_url_env_var: None,
            health_check_path: None,
            poll_interval_ms: 1000,
            queue_interval_ms: 5000,
            max_queue_attempts: 10,
            backfill_batch_size: DEFAULT_MAX_BATCH_SIZE,
            backfill_max_in_flight: DEFAULT_MAX_IN_FLIGHT,
            channel_capacity: 1000,
        }
    }
}

pub fn resolve_chain_config(
    raw_config: ChainConfigRaw,
    base_dir: &Path,
) -> anyhow::Result<ChainConfig> {
    let contracts = match raw_config.contracts {
        ContractsOrPath::Inline(contracts) => contracts,
        ContractsOrPath::Path(p) => load_contracts_from_path(base_dir, &p)?,
    };

    let mut storage_diffs = raw_config.storage_diffs;
    anyhow::ensure!(
        storage_diffs.poll_interval_ms > 0,
        "storage_diffs.poll_interval_ms must be greater than zero"
    );
    anyhow::ensure!(
        storage_diffs.queue_interval_ms > 0,
        "storage_diffs.queue_interval_ms must be greater than zero"
    );
    anyhow::ensure!(
        storage_diffs.channel_capacity > 0,
        "storage_diffs.channel_capacity must be greater than zero"
    );

    // Relative file paths are resolved against the config file.
    storage_diffs.csv_path = storage_diffs.csv_path.map(|p| resolve_path(base_dir, p));
    storage_diffs.health_check_path = storage_diffs
        .health_check_path
        .map(|p| resolve_path(base_dir, p));

    Ok(ChainConfig {
        name: raw_config.name,
        chain_id: raw_config.chain_id,
        rpc_url_env_var: raw_config.rpc_url_env_var,
        database_url_env_var: raw_config.database_url_env_var,
        contracts,
        requests_per_second: raw_config.requests_per_second,
        rpc_batch_size: raw_config.rpc_batch_size,
        rpc_max_retries: raw_config.rpc_max_retries,
        storage_diffs,
    })
}

fn resolve_path(base_dir: &Path, p: String) -> String {
    let path = Path::new(&p);
    if path.is_absolute() {
        p
    } else {
        base_dir.join(path).to_string_lossy().into_owned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_storage_diffs_defaults() {
        let raw: ChainConfigRaw = serde_json::from_str(
            r#"{"name": "mainnet", "chain_id": 1, "rpc_url_env_var": "RPC_URL", "contracts": {}}"#,
        )
        .unwrap();
        let chain = resolve_chain_config(raw, Path::new("/etc/indexer")).unwrap();

        assert_eq!(chain.database_url_env_var, "DATABASE_URL");
        assert_eq!(chain.storage_diffs.poll_interval_ms, 1000);
        assert_eq!(chain.storage_diffs.queue_interval_ms, 5000);
        assert_eq!(chain.storage_diffs.max_queue_attempts, 10);
        assert_eq!(chain.storage_diffs.backfill_batch_size, 1000);
        assert_eq!(chain.storage_diffs.backfill_max_in_flight, 10);
        assert_eq!(chain.storage_diffs.channel_capacity, 1000);
    }

    #[test]
    fn test_relative_csv_path_resolves_against_config_dir() {
        let raw: ChainConfigRaw = serde_json::from_str(
            r#"{"name": "mainnet", "chain_id": 1, "rpc_url_env_var": "RPC_URL",
                "contracts": {}, "storage_diffs": {"csv_path": "diffs.csv", "max_queue_attempts": 3}}"#,
        )
        .unwrap();
        let chain = resolve_chain_config(raw, Path::new("/etc/indexer")).unwrap();

        assert_eq!(chain.storage_diffs.csv_path.as_deref(), Some("/etc/indexer/diffs.csv"));
        assert_eq!(chain.storage_diffs.max_queue_attempts, 3);
        assert_eq!(chain.storage_diffs.poll_interval_ms, 1000);
    }

    #[test]
    fn test_zero_intervals_and_capacity_are_rejected() {
        for field in ["poll_interval_ms", "queue_interval_ms", "channel_capacity"] {
            let json = format!(
                r#"{{"name": "mainnet", "chain_id": 1, "rpc_url_env_var": "RPC_URL",
                    "contracts": {{}}, "storage_diffs": {{"{}": 0}}}}"#,
                field
            );
            let raw: ChainConfigRaw = serde_json::from_str(&json).unwrap();
            let err = resolve_chain_config(raw, Path::new("/etc/indexer")).unwrap_err();
            assert!(err.to_string().contains(field), "{}", err);
        }
    }

    #[test]
    fn test_subscription_settings() {
        let raw: ChainConfigRaw = serde_json::from_str(
            r#"{"name": "mainnet", "chain_id": 1, "rpc_url_env_var": "RPC_URL",
                "rpc_max_retries": 2, "contracts": {},
                "storage_diffs": {"ws_url_env_var": "WS_URL", "health_check_path": "connected"}}"#,
        )
        .unwrap();
        let chain = resolve_chain_config(raw, Path::new("/etc/indexer")).unwrap();

        assert_eq!(chain.rpc_max_retries, Some(2));
        assert_eq!(chain.storage_diffs.ws_url_env_var.as_deref(), Some("WS_URL"));
        assert_eq!(
            chain.storage_diffs.health_check_path.as_deref(),
            Some("/etc/indexer/connected")
        );
    }
}
