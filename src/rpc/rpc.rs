use std::future::Future;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use alloy::network::Ethereum;
use alloy::primitives::{Address, BlockNumber, B256, U256};
use alloy::providers::{Provider, RootProvider};
use alloy::rpc::types::{BlockId, BlockNumberOrTag};
use governor::clock::{QuantaClock, QuantaInstant};
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Jitter, Quota, RateLimiter};
use thiserror::Error;
use url::Url;

use crate::storage::normalize::StateDiffPayload;

/// Geth statediff service method returning the state diff payload for one height.
const STATE_DIFF_AT_METHOD: &str = "statediff_stateDiffAt";

#[derive(Debug, Error)]
pub enum RpcError {
    #[error("RPC transport error: {0}")]
    Transport(String),

    #[error("Invalid URL: {0}")]
    InvalidUrl(String),

    #[error("Provider error: {0}")]
    ProviderError(String),

    #[error("Block {0} not found")]
    BlockNotFound(u64),
}

impl RpcError {
    /// Check if this error is likely transient and worth retrying
    pub fn is_retryable(&self) -> bool {
        match self {
            // Transport errors are typically network issues
            RpcError::Transport(_) => true,
            // Invalid URL is permanent
            RpcError::InvalidUrl(_) => false,
            // Reported by the node itself, retrying returns the same answer
            RpcError::BlockNotFound(_) => false,
            // Provider errors need message inspection
            RpcError::ProviderError(msg) => Self::is_retryable_message(msg),
        }
    }

    /// Classify an alloy transport failure: connection-level problems map to
    /// `Transport`, everything the node answered with maps to `ProviderError`.
    pub fn from_alloy(e: alloy::transports::TransportError) -> Self {
        match e {
            alloy::transports::RpcError::Transport(kind) => RpcError::Transport(kind.to_string()),
            other => RpcError::ProviderError(other.to_string()),
        }
    }

    fn is_retryable_message(msg: &str) -> bool {
        let msg_lower = msg.to_lowercase();
        // Network/connection errors
        msg_lower.contains("connection")
            || msg_lower.contains("timeout")
            || msg_lower.contains("timed out")
            || msg_lower.contains("reset")
            || msg_lower.contains("broken pipe")
            || msg_lower.contains("network")
            || msg_lower.contains("eof")
            || msg_lower.contains("sending request")
            // Rate limiting indicators
            || msg_lower.contains("rate limit")
            || msg_lower.contains("too many requests")
            || msg_lower.contains("429")
            // Server errors (5xx)
            || msg_lower.contains("502")
            || msg_lower.contains("503")
            || msg_lower.contains("504")
            || msg_lower.contains("internal server error")
            || msg_lower.contains("service unavailable")
            || msg_lower.contains("bad gateway")
            // Temporary failures
            || msg_lower.contains("temporarily")
            || msg_lower.contains("try again")
            || msg_lower.contains("retry")
    }
}

/// Configuration for retry behavior
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (0 = no retries)
    pub max_retries: u32,
    /// Initial delay before first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (e.g., 2.0 doubles delay each retry)
    pub backoff_multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 10,
            initial_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Default::default()
        }
    }

    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt == 0 {
            return Duration::ZERO;
        }
        let delay_ms = self.initial_delay.as_millis() as f64
            * self.backoff_multiplier.powi(attempt as i32 - 1);
        let delay = Duration::from_millis(delay_ms as u64);
        std::cmp::min(delay, self.max_delay)
    }
}

/// Execute an async operation with retry logic
pub async fn with_retry<F, Fut, T>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, RpcError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, RpcError>>,
{
    let mut last_error = None;

    for attempt in 0..=config.max_retries {
        // Wait before retry (no wait on first attempt)
        if attempt > 0 {
            let delay = config.delay_for_attempt(attempt);
            tracing::warn!(
                "RPC retry {}/{} for '{}' in {:?}",
                attempt,
                config.max_retries,
                operation_name,
                delay
            );
            tokio::time::sleep(delay).await;
        }

        match operation().await {
            Ok(result) => {
                if attempt > 0 {
                    tracing::info!(
                        "RPC '{}' succeeded after {} retries",
                        operation_name,
                        attempt
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                if e.is_retryable() && attempt < config.max_retries {
                    tracing::warn!(
                        "RPC '{}' failed (attempt {}/{}): {}",
                        operation_name,
                        attempt + 1,
                        config.max_retries + 1,
                        e
                    );
                    last_error = Some(e);
                } else {
                    // Non-retryable error or exhausted retries
                    if attempt > 0 {
                        tracing::error!(
                            "RPC '{}' failed after {} attempts: {}",
                            operation_name,
                            attempt + 1,
                            e
                        );
                    }
                    return Err(e);
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| RpcError::ProviderError("Unknown error".to_string())))
}

pub type StandardRateLimiter =
    RateLimiter<NotKeyed, InMemoryState, QuantaClock, NoOpMiddleware<QuantaInstant>>;

#[derive(Debug, Clone)]
pub struct RpcClientConfig {
    pub url: Url,
    /// Number of per-height requests issued concurrently.
    pub max_batch_size: usize,
    pub rate_limit: Option<RateLimitConfig>,
    pub retry: RetryConfig,
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_second: NonZeroU32,
    pub jitter_min_ms: u64,
    pub jitter_max_ms: u64,
}

impl RateLimitConfig {
    pub fn per_second(requests_per_second: NonZeroU32) -> Self {
        Self {
            requests_per_second,
            jitter_min_ms: 5,
            jitter_max_ms: 50,
        }
    }
}

impl RpcClientConfig {
    pub fn new(url: Url) -> Self {
        Self {
            url,
            max_batch_size: 100,
            rate_limit: None,
            retry: RetryConfig::default(),
        }
    }

    pub fn with_batch_size(mut self, size: usize) -> Self {
        self.max_batch_size = size.max(1);
        self
    }

    pub fn with_rate_limit(mut self, config: RateLimitConfig) -> Self {
        self.rate_limit = Some(config);
        self
    }

    pub fn with_retry(mut self, config: RetryConfig) -> Self {
        self.retry = config;
        self
    }
}

pub struct RpcClient {
    provider: RootProvider<Ethereum>,
    config: RpcClientConfig,
    rate_limiter: Option<Arc<StandardRateLimiter>>,
    jitter: Option<Jitter>,
}

impl RpcClient {
    pub fn new(config: RpcClientConfig) -> Result<Self, RpcError> {
        let provider = RootProvider::<Ethereum>::new_http(config.url.clone());

        let (rate_limiter, jitter) = if let Some(ref rate_config) = config.rate_limit {
            let quota = Quota::per_second(rate_config.requests_per_second);
            let limiter = RateLimiter::direct(quota);
            let jitter = Jitter::new(
                Duration::from_millis(rate_config.jitter_min_ms),
                Duration::from_millis(rate_config.jitter_max_ms),
            );
            (Some(Arc::new(limiter)), Some(jitter))
        } else {
            (None, None)
        };

        Ok(Self {
            provider,
            config,
            rate_limiter,
            jitter,
        })
    }

    pub fn parse_url(url: &str) -> Result<Url, RpcError> {
        Url::parse(url).map_err(|e| RpcError::InvalidUrl(e.to_string()))
    }

    async fn wait_for_rate_limit(&self) {
        if let (Some(limiter), Some(jitter)) = (&self.rate_limiter, &self.jitter) {
            limiter.until_ready_with_jitter(*jitter).await;
        }
    }

    pub async fn get_block_number(&self) -> Result<BlockNumber, RpcError> {
        with_retry(&self.config.retry, "get_block_number", || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_block_number()
                .await
                .map_err(RpcError::from_alloy)
        })
        .await
    }

    /// Hash of the canonical block at `height`.
    pub async fn get_block_hash(&self, height: u64) -> Result<B256, RpcError> {
        let op_name = format!("eth_getBlockByNumber({})", height);
        let block = with_retry(&self.config.retry, &op_name, || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_block_by_number(BlockNumberOrTag::Number(height))
                .await
                .map_err(RpcError::from_alloy)
        })
        .await?;

        block
            .map(|block| block.header.hash)
            .ok_or(RpcError::BlockNotFound(height))
    }

    /// Raw 32-byte value of `slot` in `address`'s storage at `height`.
    pub async fn get_storage_at(
        &self,
        address: Address,
        slot: B256,
        height: u64,
    ) -> Result<B256, RpcError> {
        let op_name = format!("eth_getStorageAt({}, {}, {})", address, slot, height);
        let value = with_retry(&self.config.retry, &op_name, || async {
            self.wait_for_rate_limit().await;
            self.provider
                .get_storage_at(address, U256::from_be_bytes(slot.0))
                .block_id(BlockId::number(height))
                .await
                .map_err(RpcError::from_alloy)
        })
        .await?;

        Ok(B256::from(value))
    }

    pub async fn state_diff_at(&self, height: u64) -> Result<StateDiffPayload, RpcError> {
        let op_name = format!("{}({})", STATE_DIFF_AT_METHOD, height);
        with_retry(&self.config.retry, &op_name, || async {
            self.wait_for_rate_limit().await;
            self.provider
                .client()
                .request(STATE_DIFF_AT_METHOD, (height,))
                .await
                .map_err(RpcError::from_alloy)
        })
        .await
    }

    /// Fetch state diff payloads for every height, `max_batch_size` requests
    /// at a time. Results line up with `heights`; a failed height does not
    /// affect its neighbours.
    pub async fn state_diffs_at(&self, heights: &[u64]) -> Vec<Result<StateDiffPayload, RpcError>> {
        let mut all_results = Vec::with_capacity(heights.len());

        for chunk in heights.chunks(self.config.max_batch_size) {
            let futures: Vec<_> = chunk
                .iter()
                .map(|&height| self.state_diff_at(height))
                .collect();

            all_results.extend(futures::future::join_all(futures).await);
        }

        all_results
    }
}
