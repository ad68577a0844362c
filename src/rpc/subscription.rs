use alloy::primitives::B256;
use alloy::providers::{Provider, ProviderBuilder, WsConnect};
use futures::stream::{self, BoxStream, StreamExt};
use url::Url;

use super::rpc::RpcError;
use crate::storage::normalize::StateDiffPayload;

/// Geth statediff service subscription, opened with the `stream` kind.
const STATE_DIFF_SUBSCRIBE_METHOD: &str = "statediff_subscribe";
const STATE_DIFF_STREAM_KIND: &str = "stream";

/// Websocket client for the node's live state diff stream.
pub struct StateDiffSubscriptionClient {
    url: Url,
}

impl StateDiffSubscriptionClient {
    pub fn new(url: Url) -> Self {
        Self { url }
    }

    /// Connect and subscribe. The stream ends when the connection drops.
    pub async fn subscribe(&self) -> Result<BoxStream<'static, StateDiffPayload>, RpcError> {
        let provider = ProviderBuilder::new()
            .connect_ws(WsConnect::new(self.url.as_str()))
            .await
            .map_err(RpcError::from_alloy)?;

        let id = provider
            .client()
            .request::<_, B256>(STATE_DIFF_SUBSCRIBE_METHOD, (STATE_DIFF_STREAM_KIND,))
            .map_meta(|mut meta| {
                meta.set_is_subscription();
                meta
            })
            .await
            .map_err(RpcError::from_alloy)?;

        let subscription = provider
            .root()
            .get_subscription::<StateDiffPayload>(id)
            .await
            .map_err(RpcError::from_alloy)?;

        tracing::info!("Subscribed to {} ({})", STATE_DIFF_SUBSCRIBE_METHOD, id);

        // The websocket backend shuts down once the last provider handle drops.
        Ok(stream::unfold(
            (provider, subscription.into_stream()),
            |(provider, mut payloads)| async move {
                let payload = payloads.next().await?;
                Some((payload, (provider, payloads)))
            },
        )
        .boxed())
    }
}
