mod db;
mod rpc;
mod storage;
mod transformers;
mod types;
mod watcher;

use std::collections::HashMap;
use std::env;
use std::num::NonZeroU32;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use alloy::primitives::{keccak256, Address, B256};
use anyhow::Context;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::EnvFilter;

use db::DbPool;
use rpc::{RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig, StateDiffSubscriptionClient};
use storage::backfill::{BackFiller, WantedStorage};
use storage::error::ErrorKind;
use storage::extractor::{CsvTailFetcher, DiffExtractor, SubscriptionFetcher};
use storage::keys::parse_word;
use storage::queue::{PgStorageQueue, StorageQueue};
use storage::repository::{poll_new_diffs, DiffRepository, PgDiffRepository};
use storage::value_loader::StorageValueLoader;
use transformers::{build_registry, PgStorageValueRepository, StorageTransformer};
use types::config::chain::ChainConfig;
use types::config::indexer::IndexerConfig;
use watcher::StorageWatcher;

const DEFAULT_CONFIG_PATH: &str = "config/config.json";
const KNOWN_FLAGS: [&str; 7] = ["config", "from", "to", "batch-size", "block", "contract", "key"];

#[derive(Debug, PartialEq)]
enum Command {
    Watch,
    Backfill {
        from: u64,
        to: u64,
        batch_size: Option<u64>,
        /// Contract names or addresses to restrict the backfill to.
        contracts: Vec<String>,
        keys: Vec<B256>,
    },
    LoadValues {
        block: u64,
    },
}

#[derive(Debug)]
struct CliArgs {
    config_path: PathBuf,
    command: Command,
}

fn parse_args(args: &[String]) -> anyhow::Result<CliArgs> {
    let mut command_name = None;
    let mut flags: HashMap<&str, &str> = HashMap::new();

    let mut iter = args.iter();
    while let Some(arg) = iter.next() {
        if let Some(flag) = arg.strip_prefix("--") {
            anyhow::ensure!(KNOWN_FLAGS.contains(&flag), "unknown flag --{}", flag);
            let value = iter
                .next()
                .with_context(|| format!("--{} requires a value", flag))?;
            flags.insert(flag, value.as_str());
        } else if command_name.is_none() {
            command_name = Some(arg.as_str());
        } else {
            anyhow::bail!("unexpected argument '{}'", arg);
        }
    }

    let number = |name: &str| -> anyhow::Result<Option<u64>> {
        flags
            .get(name)
            .map(|v| {
                v.parse::<u64>()
                    .with_context(|| format!("--{} must be a block number, got '{}'", name, v))
            })
            .transpose()
    };

    let list = |name: &str| -> Vec<String> {
        flags
            .get(name)
            .map(|v| {
                v.split(',')
                    .map(str::trim)
                    .filter(|s| !s.is_empty())
                    .map(String::from)
                    .collect()
            })
            .unwrap_or_default()
    };

    let command = match command_name.unwrap_or("watch") {
        "watch" => Command::Watch,
        "backfill" => Command::Backfill {
            from: number("from")?.context("backfill requires --from")?,
            to: number("to")?.context("backfill requires --to")?,
            batch_size: number("batch-size")?,
            contracts: list("contract"),
            keys: list("key")
                .iter()
                .map(|k| parse_word(k).map_err(|e| anyhow::anyhow!("--key: {}", e)))
                .collect::<anyhow::Result<_>>()?,
        },
        "load-values" => Command::LoadValues {
            block: number("block")?.context("load-values requires --block")?,
        },
        other => anyhow::bail!("unknown command '{}'", other),
    };

    Ok(CliArgs {
        config_path: flags
            .get("config")
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_CONFIG_PATH)),
        command,
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args: Vec<String> = env::args().skip(1).collect();
    let cli = parse_args(&args)?;

    let config = IndexerConfig::load(&cli.config_path)?;
    load_required_env_vars(&config)?;
    tracing::info!("Loaded config with {} chain(s)", config.chains.len());

    let cancel = CancellationToken::new();
    tokio::spawn({
        let cancel = cancel.clone();
        async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                tracing::info!("Received ctrl-c, shutting down");
                cancel.cancel();
            }
        }
    });

    match cli.command {
        Command::Watch => {
            let mut chains: JoinSet<anyhow::Result<()>> = JoinSet::new();
            for chain in config.chains {
                let cancel = cancel.child_token();
                chains.spawn(async move { watch_chain(&chain, cancel).await });
            }
            while let Some(result) = chains.join_next().await {
                result.context("chain watcher panicked")??;
            }
        }
        Command::Backfill {
            from,
            to,
            batch_size,
            contracts,
            keys,
        } => {
            for chain in &config.chains {
                let wanted = wanted_storage(chain, &contracts, &keys)?;
                backfill_chain(chain, from, to, batch_size, wanted, cancel.clone()).await?;
            }
        }
        Command::LoadValues { block } => {
            for chain in &config.chains {
                load_values_chain(chain, block).await?;
            }
        }
    }

    tracing::info!("All chains processed successfully");
    Ok(())
}

/// Ensures all required RPC and database env vars are set, loading .env if needed.
fn load_required_env_vars(config: &IndexerConfig) -> anyhow::Result<()> {
    let required: Vec<&str> = config
        .chains
        .iter()
        .flat_map(|c| {
            [c.rpc_url_env_var.as_str(), c.database_url_env_var.as_str()]
                .into_iter()
                .chain(c.storage_diffs.ws_url_env_var.as_deref())
        })
        .collect();

    let missing: Vec<&&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .collect();

    if missing.is_empty() {
        return Ok(());
    }

    dotenvy::dotenv().with_context(|| {
        format!(
            "Missing env vars {:?} and failed to load .env file",
            missing
        )
    })?;

    let still_missing: Vec<&str> = required
        .iter()
        .filter(|var| env::var(var).is_err())
        .copied()
        .collect();

    anyhow::ensure!(
        still_missing.is_empty(),
        "Missing required env vars after loading .env: {:?}",
        still_missing
    );

    Ok(())
}

async fn connect_db(chain: &ChainConfig) -> anyhow::Result<Arc<DbPool>> {
    let url = env::var(&chain.database_url_env_var).with_context(|| {
        format!(
            "env var {} not set for chain {}",
            chain.database_url_env_var, chain.name
        )
    })?;
    let db = DbPool::new(&url)
        .await
        .context("failed to connect to database")?;
    db.run_migrations()
        .await
        .context("failed to run migrations")?;
    Ok(Arc::new(db))
}

fn build_rpc_client(chain: &ChainConfig) -> anyhow::Result<RpcClient> {
    let url = env::var(&chain.rpc_url_env_var).with_context(|| {
        format!(
            "env var {} not set for chain {}",
            chain.rpc_url_env_var, chain.name
        )
    })?;

    let mut config = RpcClientConfig::new(RpcClient::parse_url(&url)?);
    if let Some(size) = chain.rpc_batch_size {
        config = config.with_batch_size(size);
    }
    if let Some(rps) = chain.requests_per_second.and_then(NonZeroU32::new) {
        config = config.with_rate_limit(RateLimitConfig::per_second(rps));
    }
    if let Some(retries) = chain.rpc_max_retries {
        config = config.with_retry(RetryConfig::new(retries));
    }

    Ok(RpcClient::new(config)?)
}

/// Resolve `--contract` names or addresses against the chain's contracts.
/// Returns `None` when no contract was named.
fn wanted_storage(
    chain: &ChainConfig,
    contracts: &[String],
    keys: &[B256],
) -> anyhow::Result<Option<WantedStorage>> {
    if contracts.is_empty() {
        anyhow::ensure!(keys.is_empty(), "--key requires --contract");
        return Ok(None);
    }

    let mut wanted = WantedStorage::default();
    for contract in contracts {
        let address = match chain.contracts.get(contract) {
            Some(config) => config.address,
            None => contract.parse::<Address>().with_context(|| {
                format!(
                    "'{}' is neither a contract of chain {} nor an address",
                    contract, chain.name
                )
            })?,
        };
        wanted = if keys.is_empty() {
            wanted.contract(keccak256(address))
        } else {
            wanted.keys(keccak256(address), keys.iter().copied())
        };
    }
    Ok(Some(wanted))
}

fn build_transformers(
    chain: &ChainConfig,
    db: &Arc<DbPool>,
) -> anyhow::Result<Vec<Arc<dyn StorageTransformer>>> {
    let registry = build_registry();
    let values = Arc::new(PgStorageValueRepository::new(db.clone()));
    registry
        .build_transformers(&chain.contracts, Some(db.clone()), values)
        .with_context(|| format!("failed to build transformers for chain {}", chain.name))
}

/// Follow new diffs (CSV tail and unchecked rows) and dispatch them until
/// cancelled or a source fails.
async fn watch_chain(chain: &ChainConfig, cancel: CancellationToken) -> anyhow::Result<()> {
    tracing::info!(
        "Watching storage diffs for chain {} (chain id {})",
        chain.name,
        chain.chain_id
    );
    let opts = &chain.storage_diffs;

    let db = connect_db(chain).await?;
    let repository: Arc<dyn DiffRepository> = Arc::new(PgDiffRepository::new(db.clone()));
    let queue: Arc<dyn StorageQueue> = Arc::new(PgStorageQueue::new(db.clone()));

    let mut watcher = StorageWatcher::new(repository.clone(), queue.clone(), opts.max_queue_attempts);
    watcher.add_transformers(build_transformers(chain, &db)?);

    match queue.count().await {
        Ok(queued) => tracing::info!("{} storage diffs waiting in queue", queued),
        Err(e) => tracing::warn!("Failed to count queued storage diffs: {}", e),
    }

    let (diff_tx, diff_rx) = mpsc::channel(opts.channel_capacity);
    let mut tasks: JoinSet<anyhow::Result<()>> = JoinSet::new();

    if let Some(csv_path) = &opts.csv_path {
        let fetcher = Arc::new(CsvTailFetcher::new(
            csv_path,
            Duration::from_millis(opts.poll_interval_ms),
        ));
        let extractor = DiffExtractor::new(fetcher, repository.clone());
        let (capacity, cancel) = (opts.channel_capacity, cancel.clone());
        tasks.spawn(async move {
            extractor
                .extract(capacity, cancel)
                .await
                .context("CSV diff extraction failed")
        });
    }

    if let Some(var) = &opts.ws_url_env_var {
        let url = env::var(var)
            .with_context(|| format!("env var {} not set for chain {}", var, chain.name))?;
        let client = StateDiffSubscriptionClient::new(RpcClient::parse_url(&url)?);
        let fetcher = Arc::new(SubscriptionFetcher::new(
            Arc::new(client),
            opts.health_check_path.as_ref().map(PathBuf::from),
        ));
        let extractor = DiffExtractor::new(fetcher, repository.clone());
        let (capacity, cancel) = (opts.channel_capacity, cancel.clone());
        tasks.spawn(async move {
            extractor
                .extract(capacity, cancel)
                .await
                .context("state diff subscription failed")
        });
    }

    tasks.spawn({
        let (repository, cancel) = (repository.clone(), cancel.clone());
        let interval = Duration::from_millis(opts.poll_interval_ms);
        async move {
            poll_new_diffs(repository, interval, diff_tx, cancel).await;
            Ok(())
        }
    });

    tasks.spawn({
        let cancel = cancel.clone();
        let interval = Duration::from_millis(opts.queue_interval_ms);
        async move {
            watcher
                .execute(diff_rx, interval, cancel)
                .await
                .context("storage watcher failed")
        }
    });

    let mut first_error = None;
    while let Some(result) = tasks.join_next().await {
        let result = result.context("pipeline task panicked").and_then(|r| r);
        if let Err(e) = result {
            tracing::error!("Chain {} pipeline stopped: {:#}", chain.name, e);
            cancel.cancel();
            first_error.get_or_insert(e);
        }
    }

    match first_error {
        Some(e) => Err(e),
        None => {
            tracing::info!("Stopped watching chain {}", chain.name);
            Ok(())
        }
    }
}

/// Re-derive and persist diffs for `[from, to]` from node state diffs.
async fn backfill_chain(
    chain: &ChainConfig,
    from: u64,
    to: u64,
    batch_size: Option<u64>,
    wanted: Option<WantedStorage>,
    cancel: CancellationToken,
) -> anyhow::Result<()> {
    let opts = &chain.storage_diffs;
    let db = connect_db(chain).await?;
    let repository = PgDiffRepository::new(db);
    let client = Arc::new(build_rpc_client(chain)?);

    let head = client.get_block_number().await?;
    anyhow::ensure!(
        to <= head,
        "backfill range ends at {} but chain {} head is {}",
        to,
        chain.name,
        head
    );

    let mut backfiller = BackFiller::with_max_in_flight(client, opts.backfill_max_in_flight);
    if let Some(wanted) = wanted {
        backfiller = backfiller.with_wanted_storage(wanted);
    }

    let (diff_tx, mut diff_rx) = mpsc::channel(opts.channel_capacity);
    let (err_tx, mut err_rx) = mpsc::channel(opts.channel_capacity);
    let (done_tx, done_rx) = oneshot::channel();

    backfiller.back_fill(
        from,
        to,
        batch_size.unwrap_or(opts.backfill_batch_size),
        diff_tx,
        err_tx,
        done_tx,
        cancel,
    )?;

    let (mut persisted, mut duplicates, mut failures) = (0u64, 0u64, 0u64);
    let (mut diffs_open, mut errs_open) = (true, true);

    while diffs_open || errs_open {
        tokio::select! {
            diff = diff_rx.recv(), if diffs_open => match diff {
                Some(diff) => match repository.create_storage_diff(&diff).await {
                    Ok(id) => {
                        repository
                            .mark_from_backfill(id)
                            .await
                            .context("failed to flag back-filled diff")?;
                        persisted += 1;
                    }
                    Err(e) if e.kind() == ErrorKind::DuplicateDiff => duplicates += 1,
                    Err(e) => return Err(e).context("failed to persist back-filled diff"),
                },
                None => diffs_open = false,
            },
            err = err_rx.recv(), if errs_open => match err {
                Some(e) => {
                    tracing::warn!("Backfill item failed: {}", e);
                    failures += 1;
                }
                None => errs_open = false,
            },
        }
    }

    let summary = done_rx
        .await
        .context("backfill scheduler stopped without reporting")?;

    tracing::info!(
        "Backfill of chain {} blocks {}-{} {}: {}/{} bins, {} diffs stored, {} already known, {} failures",
        chain.name,
        from,
        to,
        if summary.cancelled { "cancelled" } else { "finished" },
        summary.completed_bins,
        summary.bins,
        persisted,
        duplicates,
        failures
    );
    Ok(())
}

/// Seed current slot values for every configured contract at `block`.
async fn load_values_chain(chain: &ChainConfig, block: u64) -> anyhow::Result<()> {
    let db = connect_db(chain).await?;
    let transformers = build_transformers(chain, &db)?;
    let repository = Arc::new(PgDiffRepository::new(db));
    let client = Arc::new(build_rpc_client(chain)?);

    let loaded = StorageValueLoader::new(client, repository, transformers)
        .run(block)
        .await
        .with_context(|| format!("failed to load storage values at block {}", block))?;

    tracing::info!(
        "Loaded {} storage values for chain {} at block {}",
        loaded,
        chain.name,
        block
    );
    Ok(())
}
