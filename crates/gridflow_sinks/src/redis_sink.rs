//! Redis-backed cache and pub/sub sink.
//!
//! Current values land in plain keys via the shared `ConnectionManager`
//! (which reconnects internally); subscriptions run on dedicated pub/sub
//! connections, one background task each.

use crate::{current_value_key, CacheSink, MessageHandler, Result, SinkError};
use async_trait::async_trait;
use futures::StreamExt;
use gridflow_protocol::{PointRef, TenantId};
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tracing::{info, warn};

pub struct RedisCacheSink {
    client: redis::Client,
    manager: ConnectionManager,
    /// Per-command deadline so a wedged server cannot stall processing.
    op_timeout: std::time::Duration,
}

impl RedisCacheSink {
    pub async fn connect(url: &str, op_timeout_ms: u64) -> Result<Self> {
        let client = redis::Client::open(url)?;
        let manager = ConnectionManager::new(client.clone()).await?;
        info!("Connected to cache: {url}");
        Ok(Self {
            client,
            manager,
            op_timeout: std::time::Duration::from_millis(op_timeout_ms),
        })
    }

    async fn with_timeout<T>(
        &self,
        fut: impl std::future::Future<Output = redis::RedisResult<T>>,
    ) -> Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(SinkError::Unavailable(format!(
                "redis command exceeded {} ms",
                self.op_timeout.as_millis()
            ))),
        }
    }
}

#[async_trait]
impl CacheSink for RedisCacheSink {
    async fn set_current_value(
        &self,
        tenant: TenantId,
        point: PointRef,
        json: String,
    ) -> Result<()> {
        let key = current_value_key(tenant, point);
        let mut conn = self.manager.clone();
        self.with_timeout(async move { conn.set::<_, _, ()>(key, json).await }).await
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        let channel = channel.to_string();
        let mut conn = self.manager.clone();
        self.with_timeout(async move { conn.publish::<_, _, ()>(channel, payload).await })
            .await
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()> {
        let mut pubsub = self.client.get_async_pubsub().await?;
        pubsub.psubscribe(pattern).await?;
        let pattern = pattern.to_string();
        tokio::spawn(async move {
            let mut stream = pubsub.on_message();
            while let Some(msg) = stream.next().await {
                let channel = msg.get_channel_name().to_string();
                match msg.get_payload::<String>() {
                    Ok(payload) => handler(&channel, &payload),
                    Err(e) => warn!("Dropping undecodable message on {channel}: {e}"),
                }
            }
            warn!("Subscription stream for {pattern} ended");
        });
        Ok(())
    }
}
