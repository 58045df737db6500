//! In-memory sink doubles for tests and single-node development.

use crate::{CacheSink, MessageHandler, Result, TimeSeriesSink};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use gridflow_protocol::{PointRef, TenantId, TimestampedValue};
use parking_lot::Mutex;
use std::collections::HashSet;

/// Cache/pub-sub double: current values in a map, published messages kept
/// for assertions and forwarded to matching subscribers.
#[derive(Default)]
pub struct MemoryCacheSink {
    current: DashMap<(TenantId, PointRef), String>,
    published: Mutex<Vec<(String, String)>>,
    subscribers: Mutex<Vec<(String, MessageHandler)>>,
}

impl MemoryCacheSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current_value(&self, tenant: TenantId, point: PointRef) -> Option<String> {
        self.current.get(&(tenant, point)).map(|v| v.clone())
    }

    /// All published `(channel, payload)` pairs, in publish order.
    pub fn published(&self) -> Vec<(String, String)> {
        self.published.lock().clone()
    }

    pub fn published_on(&self, channel: &str) -> Vec<String> {
        self.published
            .lock()
            .iter()
            .filter(|(c, _)| c == channel)
            .map(|(_, p)| p.clone())
            .collect()
    }

    pub fn clear_published(&self) {
        self.published.lock().clear();
    }

    fn pattern_matches(pattern: &str, channel: &str) -> bool {
        // Glob subset: '*' matches any suffix, otherwise exact.
        match pattern.strip_suffix('*') {
            Some(prefix) => channel.starts_with(prefix),
            None => pattern == channel,
        }
    }
}

#[async_trait]
impl CacheSink for MemoryCacheSink {
    async fn set_current_value(
        &self,
        tenant: TenantId,
        point: PointRef,
        json: String,
    ) -> Result<()> {
        self.current.insert((tenant, point), json);
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: String) -> Result<()> {
        self.published.lock().push((channel.to_string(), payload.clone()));
        let subscribers = self.subscribers.lock().clone();
        for (pattern, handler) in subscribers {
            if Self::pattern_matches(&pattern, channel) {
                handler(channel, &payload);
            }
        }
        Ok(())
    }

    async fn subscribe(&self, pattern: &str, handler: MessageHandler) -> Result<()> {
        self.subscribers.lock().push((pattern.to_string(), handler));
        Ok(())
    }
}

/// Time-series double with the idempotency contract: re-writing the same
/// `(point, source_timestamp)` pair replaces rather than duplicates.
#[derive(Default)]
pub struct MemoryTimeSeriesSink {
    rows: Mutex<Vec<TimestampedValue>>,
    seen: Mutex<HashSet<(PointRef, DateTime<Utc>)>>,
}

impl MemoryTimeSeriesSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rows(&self) -> Vec<TimestampedValue> {
        self.rows.lock().clone()
    }

    pub fn len(&self) -> usize {
        self.rows.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.lock().is_empty()
    }
}

#[async_trait]
impl TimeSeriesSink for MemoryTimeSeriesSink {
    async fn write_points(&self, batch: &[TimestampedValue]) -> Result<()> {
        let mut seen = self.seen.lock();
        let mut rows = self.rows.lock();
        for tv in batch {
            let key = (tv.point, tv.source_timestamp);
            if seen.insert(key) {
                rows.push(tv.clone());
            } else if let Some(existing) =
                rows.iter_mut().find(|row| row.point == tv.point && row.source_timestamp == tv.source_timestamp)
            {
                *existing = tv.clone();
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_protocol::{PointId, Quality, Value};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn tv(point: i64, value: f64) -> TimestampedValue {
        TimestampedValue::new(
            PointRef::DataPoint(PointId::new(point)),
            TenantId::new(1),
            Value::Float(value),
            Quality::Good,
        )
    }

    #[tokio::test]
    async fn publish_reaches_matching_subscribers() {
        let sink = MemoryCacheSink::new();
        let hits = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&hits);
        sink.subscribe(
            "alarm*",
            Arc::new(move |_, _| {
                counter.fetch_add(1, Ordering::SeqCst);
            }),
        )
        .await
        .unwrap();

        sink.publish("alarm_event", "{}".into()).await.unwrap();
        sink.publish("value_changed", "{}".into()).await.unwrap();
        assert_eq!(hits.load(Ordering::SeqCst), 1);
        assert_eq!(sink.published().len(), 2);
    }

    #[tokio::test]
    async fn timeseries_idempotent_on_point_and_timestamp() {
        let sink = MemoryTimeSeriesSink::new();
        let a = tv(1, 10.0);
        sink.write_points(&[a.clone()]).await.unwrap();
        sink.write_points(&[a.clone()]).await.unwrap();
        assert_eq!(sink.len(), 1);

        let mut later = tv(1, 11.0);
        later.source_timestamp = a.source_timestamp + chrono::Duration::seconds(1);
        sink.write_points(&[later]).await.unwrap();
        assert_eq!(sink.len(), 2);
    }
}
