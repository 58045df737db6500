//! Cache/pub-sub and time-series sinks.
//!
//! The processing service only sees the two traits here; production wires
//! Redis and a Parquet archive, tests wire the in-memory doubles.

pub mod memory;
pub mod parquet_sink;
pub mod redis_sink;

use async_trait::async_trait;
use gridflow_protocol::{PointRef, TenantId, TimestampedValue};
use std::sync::Arc;
use thiserror::Error;

pub use memory::{MemoryCacheSink, MemoryTimeSeriesSink};
pub use parquet_sink::ParquetTimeSeriesSink;
pub use redis_sink::RedisCacheSink;

pub type Result<T> = std::result::Result<T, SinkError>;

#[derive(Error, Debug)]
pub enum SinkError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("arrow error: {0}")]
    Arrow(#[from] arrow::error::ArrowError),

    #[error("parquet error: {0}")]
    Parquet(#[from] parquet::errors::ParquetError),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("sink unavailable: {0}")]
    Unavailable(String),
}

/// Callback invoked for each message a subscription delivers:
/// `(channel, payload)`.
pub type MessageHandler = Arc<dyn Fn(&str, &str) + Send + Sync>;

/// Current-value cache plus pub/sub fan-out.
#[async_trait]
pub trait CacheSink: Send + Sync {
    /// Write the serialized current value of a point.
    async fn set_current_value(
        &self,
        tenant: TenantId,
        point: PointRef,
        json: String,
    ) -> Result<()>;

    /// Publish a JSON payload on a channel.
    async fn publish(&self, channel: &str, payload: String) -> Result<()>;

    /// Subscribe to a channel pattern; the handler runs on a background task.
    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()>;
}

/// Durable time-series archive. `write_points` must be idempotent on
/// `(point, source_timestamp)`.
#[async_trait]
pub trait TimeSeriesSink: Send + Sync {
    async fn write_points(&self, batch: &[TimestampedValue]) -> Result<()>;
}

/// Cache key for a point's current value.
pub fn current_value_key(tenant: TenantId, point: PointRef) -> String {
    match point {
        PointRef::DataPoint(id) => format!("gf:{tenant}:dp:{id}"),
        PointRef::VirtualPoint(id) => format!("gf:{tenant}:vp:{id}"),
    }
}
