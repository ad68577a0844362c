mod rpc;
mod subscription;

pub use rpc::{RateLimitConfig, RetryConfig, RpcClient, RpcClientConfig, RpcError};
pub use subscription::StateDiffSubscriptionClient;
