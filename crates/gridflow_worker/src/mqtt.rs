//! MQTT worker.
//!
//! Subscriptions bind topic patterns to data points through a dotted JSON
//! path. Production mode adds the hardening a broker-fronted site needs: a
//! strict-priority publish queue, a circuit breaker on publish failures, a
//! bounded priority-preserving offline buffer replayed on reconnect, a
//! duplicate filter keyed on a `message_id` payload field, and failover
//! across backup brokers.

use crate::base::ProtocolWorker;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use bytes::BytesMut;
use chrono::{DateTime, Utc};
use gridflow_engine::queue::PipelineQueue;
use gridflow_protocol::mqtt::{
    topic_matches, Connect, ConnectReturnCode, Packet, QoS, Will,
};
use gridflow_protocol::{
    BadReason, DataPoint, DeviceDataMessage, DeviceId, MqttParams, MqttSubscription, PointId,
    PointRef, Protocol, ProtocolError, Quality, TenantId, TimestampedValue, Value,
};
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Publish priorities: strict ordering, FIFO within a level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum PublishPriority {
    High = 0,
    Normal = 1,
    Low = 2,
}

#[derive(Debug, Clone)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
    pub priority: PublishPriority,
}

/// Strict-priority queue with per-level FIFO.
#[derive(Default)]
struct PriorityPublishQueue {
    levels: [VecDeque<OutboundMessage>; 3],
}

impl PriorityPublishQueue {
    fn push(&mut self, message: OutboundMessage) {
        self.levels[message.priority as usize].push_back(message);
    }

    fn pop(&mut self) -> Option<OutboundMessage> {
        self.levels.iter_mut().find_map(VecDeque::pop_front)
    }

    fn len(&self) -> usize {
        self.levels.iter().map(VecDeque::len).sum()
    }
}

/// Circuit breaker over the publish path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

struct CircuitBreaker {
    state: BreakerState,
    consecutive_failures: u32,
    threshold: u32,
    open_until: Instant,
    cooldown: Duration,
}

impl CircuitBreaker {
    fn new(threshold: u32, cooldown: Duration) -> Self {
        Self {
            state: BreakerState::Closed,
            consecutive_failures: 0,
            threshold: threshold.max(1),
            open_until: Instant::now(),
            cooldown,
        }
    }

    fn allows(&mut self) -> bool {
        match self.state {
            BreakerState::Closed | BreakerState::HalfOpen => true,
            BreakerState::Open => {
                if Instant::now() >= self.open_until {
                    self.state = BreakerState::HalfOpen;
                    true
                } else {
                    false
                }
            }
        }
    }

    fn record_success(&mut self) {
        self.consecutive_failures = 0;
        self.state = BreakerState::Closed;
    }

    fn record_failure(&mut self) {
        self.consecutive_failures += 1;
        if self.consecutive_failures >= self.threshold || self.state == BreakerState::HalfOpen {
            self.state = BreakerState::Open;
            self.open_until = Instant::now() + self.cooldown;
        }
    }
}

/// Ring of recently seen message ids for duplicate filtering.
struct DuplicateFilter {
    order: VecDeque<String>,
    capacity: usize,
}

impl DuplicateFilter {
    fn new(capacity: usize) -> Self {
        Self { order: VecDeque::with_capacity(capacity), capacity: capacity.max(1) }
    }

    /// Returns true when the id was already seen.
    fn check_and_insert(&mut self, id: &str) -> bool {
        if self.order.iter().any(|seen| seen == id) {
            return true;
        }
        if self.order.len() >= self.capacity {
            self.order.pop_front();
        }
        self.order.push_back(id.to_string());
        false
    }
}

/// Per-subscription counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SubscriptionStats {
    pub messages: u64,
    pub parse_errors: u64,
    pub duplicates: u64,
}

const OFFLINE_BUFFER_CAP: usize = 10_000;
const BREAKER_THRESHOLD: u32 = 5;
const BREAKER_COOLDOWN: Duration = Duration::from_secs(30);
const DUPLICATE_WINDOW: usize = 1_024;

pub struct MqttWorker {
    device_id: DeviceId,
    tenant_id: TenantId,
    params: MqttParams,
    points: HashMap<PointId, DataPoint>,
    stream: Option<TcpStream>,
    read_buf: BytesMut,
    packet_id: u16,
    /// Which broker in `[primary, backups...]` we are on.
    broker_index: usize,
    publish_queue: PriorityPublishQueue,
    offline_buffer: Vec<OutboundMessage>,
    breaker: CircuitBreaker,
    duplicates: DuplicateFilter,
    stats: HashMap<String, SubscriptionStats>,
    last_message_at: Option<DateTime<Utc>>,
    producer_id: String,
}

impl MqttWorker {
    pub fn new(
        device_id: DeviceId,
        tenant_id: TenantId,
        params: MqttParams,
        points: &[DataPoint],
    ) -> Self {
        let points = points.iter().map(|p| (p.id, p.clone())).collect();
        info!(
            "mqtt worker {device_id}: {} subscriptions, production_mode={}",
            params.subscriptions.len(),
            params.production_mode
        );
        Self {
            device_id,
            tenant_id,
            params,
            points,
            stream: None,
            read_buf: BytesMut::with_capacity(8 * 1024),
            packet_id: 0,
            broker_index: 0,
            publish_queue: PriorityPublishQueue::default(),
            offline_buffer: Vec::new(),
            breaker: CircuitBreaker::new(BREAKER_THRESHOLD, BREAKER_COOLDOWN),
            duplicates: DuplicateFilter::new(DUPLICATE_WINDOW),
            stats: HashMap::new(),
            last_message_at: None,
            producer_id: format!("mqtt-{device_id}"),
        }
    }

    pub fn subscription_stats(&self) -> &HashMap<String, SubscriptionStats> {
        &self.stats
    }

    /// When the last telemetry message arrived on any subscription.
    pub fn last_message_at(&self) -> Option<DateTime<Utc>> {
        self.last_message_at
    }

    pub fn offline_buffered(&self) -> usize {
        self.offline_buffer.len()
    }

    pub fn publish_queue_len(&self) -> usize {
        self.publish_queue.len()
    }

    /// Brokers in failover order starting from the primary.
    fn brokers(&self) -> Vec<String> {
        let mut out = vec![format!("{}:{}", self.params.host, self.params.port)];
        out.extend(self.params.backup_brokers.iter().cloned());
        out
    }

    fn next_packet_id(&mut self) -> u16 {
        self.packet_id = self.packet_id.wrapping_add(1).max(1);
        self.packet_id
    }

    async fn send_packet(&mut self, packet: &Packet) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(WorkerError::NotConnected)?;
        stream
            .write_all(&packet.encode())
            .await
            .map_err(|e| WorkerError::ConnectionLost(format!("mqtt send: {e}")))
    }

    /// Read one packet, waiting up to `window`. `None` on timeout.
    async fn read_packet(&mut self, window: Duration) -> Result<Option<Packet>> {
        let deadline = Instant::now() + window;
        loop {
            if let Some(packet) = Packet::try_decode(&mut self.read_buf)? {
                return Ok(Some(packet));
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let stream = self.stream.as_mut().ok_or(WorkerError::NotConnected)?;
            let mut chunk = [0u8; 4096];
            match tokio::time::timeout(remaining, stream.read(&mut chunk)).await {
                Err(_) => return Ok(None),
                Ok(Ok(0)) => {
                    self.stream = None;
                    return Err(WorkerError::ConnectionLost("broker closed the stream".into()));
                }
                Ok(Ok(n)) => self.read_buf.extend_from_slice(&chunk[..n]),
                Ok(Err(e)) => {
                    self.stream = None;
                    return Err(WorkerError::ConnectionLost(format!("mqtt read: {e}")));
                }
            }
        }
    }

    /// Queue a publish. In production mode the message flows through the
    /// priority queue / breaker / offline buffer; otherwise it goes out on
    /// the next cycle regardless.
    pub fn publish(&mut self, message: OutboundMessage) {
        if self.stream.is_none() && self.params.production_mode {
            self.buffer_offline(message);
            return;
        }
        self.publish_queue.push(message);
    }

    fn buffer_offline(&mut self, message: OutboundMessage) {
        if self.offline_buffer.len() >= OFFLINE_BUFFER_CAP {
            // Bounded: evict the oldest entry of the lowest priority first.
            if let Some(victim) = self
                .offline_buffer
                .iter()
                .enumerate()
                .max_by_key(|(i, m)| (m.priority, std::cmp::Reverse(*i)))
                .map(|(i, _)| i)
            {
                if self.offline_buffer[victim].priority > message.priority {
                    self.offline_buffer.remove(victim);
                } else {
                    debug!("mqtt {}: offline buffer full, dropping publish", self.device_id);
                    return;
                }
            }
        }
        self.offline_buffer.push(message);
    }

    fn replay_offline(&mut self) {
        if self.offline_buffer.is_empty() {
            return;
        }
        info!(
            "mqtt {}: replaying {} buffered messages",
            self.device_id,
            self.offline_buffer.len()
        );
        let mut buffered: Vec<OutboundMessage> = std::mem::take(&mut self.offline_buffer);
        // Priority order, then original arrival order within a level.
        buffered.sort_by_key(|m| m.priority);
        for message in buffered {
            self.publish_queue.push(message);
        }
    }

    async fn drain_publish_queue(&mut self) -> Result<()> {
        while self.publish_queue.len() > 0 {
            if self.params.production_mode && !self.breaker.allows() {
                debug!("mqtt {}: circuit breaker open, deferring publishes", self.device_id);
                return Ok(());
            }
            let Some(message) = self.publish_queue.pop() else { break };
            let packet_id =
                (message.qos != QoS::AtMostOnce).then(|| self.next_packet_id());
            let packet = Packet::Publish {
                topic: message.topic.clone(),
                payload: message.payload.clone(),
                qos: message.qos,
                retain: message.retain,
                dup: false,
                packet_id,
            };
            match self.send_packet(&packet).await {
                Ok(()) => {
                    // For QoS1, the PUBACK arrives via the message pump; a
                    // successful send is what the breaker keys on.
                    self.breaker.record_success();
                }
                Err(e) => {
                    self.breaker.record_failure();
                    if self.params.production_mode {
                        self.buffer_offline(message);
                    }
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Route an inbound PUBLISH to every matching subscription.
    fn route_publish(&mut self, topic: &str, payload: &[u8], queue: &PipelineQueue) {
        let parsed: Option<serde_json::Value> = serde_json::from_slice(payload).ok();

        // Duplicate filter on the message-id field, when present.
        if self.params.production_mode {
            if let Some(id) = parsed
                .as_ref()
                .and_then(|v| v.get("message_id"))
                .and_then(|v| v.as_str())
            {
                if self.duplicates.check_and_insert(id) {
                    for sub in &self.params.subscriptions {
                        if topic_matches(&sub.topic, topic) {
                            self.stats.entry(sub.topic.clone()).or_default().duplicates += 1;
                        }
                    }
                    return;
                }
            }
        }

        let subscriptions: Vec<MqttSubscription> = self
            .params
            .subscriptions
            .iter()
            .filter(|sub| topic_matches(&sub.topic, topic))
            .cloned()
            .collect();
        for sub in subscriptions {
            let stats = self.stats.entry(sub.topic.clone()).or_default();
            stats.messages += 1;
            self.last_message_at = Some(Utc::now());

            let selected = match &parsed {
                Some(json) => select_json_path(json, &sub.json_path),
                None => None,
            };
            let mut values = Vec::with_capacity(sub.data_points.len());
            for point_id in &sub.data_points {
                let Some(point) = self.points.get(point_id) else { continue };
                let tv = match selected.and_then(json_to_value) {
                    Some(raw) => {
                        let scaled = raw.scaled(point.scale_factor, point.scale_offset);
                        match scaled.coerce(point.value_type) {
                            Some(coerced) => {
                                let quality = if point.out_of_range(&coerced) {
                                    Quality::Bad(BadReason::OutOfRange)
                                } else {
                                    Quality::Good
                                };
                                TimestampedValue::new(
                                    PointRef::DataPoint(*point_id),
                                    point.tenant_id,
                                    coerced,
                                    quality,
                                )
                            }
                            None => bad_decode(*point_id, point.tenant_id),
                        }
                    }
                    None => {
                        self.stats.entry(sub.topic.clone()).or_default().parse_errors += 1;
                        bad_decode(*point_id, point.tenant_id)
                    }
                };
                values.push(tv);
            }
            if !values.is_empty() {
                queue.send_device_data(DeviceDataMessage::new(
                    self.device_id,
                    self.tenant_id,
                    Protocol::Mqtt,
                    values,
                    self.producer_id.clone(),
                ));
            }
        }
    }
}

fn bad_decode(point_id: PointId, tenant: TenantId) -> TimestampedValue {
    TimestampedValue::new(
        PointRef::DataPoint(point_id),
        tenant,
        Value::Int(0),
        Quality::Bad(BadReason::Decode),
    )
}

/// Walk a dotted path into a JSON document; the empty path selects the root.
fn select_json_path<'a>(root: &'a serde_json::Value, path: &str) -> Option<&'a serde_json::Value> {
    if path.is_empty() {
        return Some(root);
    }
    let mut node = root;
    for part in path.split('.') {
        node = match node {
            serde_json::Value::Object(map) => map.get(part)?,
            serde_json::Value::Array(items) => items.get(part.parse::<usize>().ok()?)?,
            _ => return None,
        };
    }
    Some(node)
}

fn json_to_value(json: &serde_json::Value) -> Option<Value> {
    match json {
        serde_json::Value::Bool(b) => Some(Value::Bool(*b)),
        serde_json::Value::Number(n) => {
            if let Some(i) = n.as_i64() {
                Some(Value::Int(i))
            } else {
                n.as_f64().map(Value::Float)
            }
        }
        serde_json::Value::String(s) => Some(Value::Text(s.clone())),
        _ => None,
    }
}

#[async_trait]
impl ProtocolWorker for MqttWorker {
    async fn establish_connection(&mut self) -> Result<()> {
        let brokers = self.brokers();
        let broker = brokers[self.broker_index % brokers.len()].clone();
        let timeout = Duration::from_secs(10);

        let stream = match tokio::time::timeout(timeout, TcpStream::connect(&broker)).await {
            Ok(Ok(stream)) => stream,
            other => {
                // Failover: next attempt goes to the next broker in the list.
                self.broker_index = (self.broker_index + 1) % brokers.len();
                let reason = match other {
                    Ok(Err(e)) => e.to_string(),
                    _ => "connect timed out".to_string(),
                };
                return Err(WorkerError::Protocol(ProtocolError::ConnectFailure(format!(
                    "{broker}: {reason}"
                ))));
            }
        };
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        self.read_buf.clear();

        let connect = Connect {
            client_id: self.params.client_id.clone(),
            keep_alive_secs: self.params.keep_alive_secs,
            clean_session: true,
            username: self.params.username.clone(),
            password: self.params.password.clone(),
            will: self.params.last_will.as_ref().map(|w| Will {
                topic: w.topic.clone(),
                payload: w.payload.clone().into_bytes(),
                qos: QoS::from_u8(w.qos).unwrap_or(QoS::AtMostOnce),
                retain: w.retain,
            }),
        };
        self.send_packet(&Packet::Connect(connect)).await?;
        match self.read_packet(timeout).await? {
            Some(Packet::ConnAck { code: ConnectReturnCode::Accepted, .. }) => {}
            Some(Packet::ConnAck { code, .. }) => {
                self.stream = None;
                self.broker_index = (self.broker_index + 1) % brokers.len();
                return Err(WorkerError::Protocol(ProtocolError::ConnectFailure(format!(
                    "broker refused connection: {code:?}"
                ))));
            }
            _ => {
                self.stream = None;
                return Err(WorkerError::Protocol(ProtocolError::ConnectFailure(
                    "no CONNACK".into(),
                )));
            }
        }
        info!("mqtt {} connected to {broker}", self.device_id);

        // Subscribe everything; brokers answer with one SUBACK per request.
        let topics: Vec<(String, QoS)> = self
            .params
            .subscriptions
            .iter()
            .map(|s| (s.topic.clone(), QoS::from_u8(s.qos).unwrap_or(QoS::AtMostOnce)))
            .collect();
        if !topics.is_empty() {
            let packet_id = self.next_packet_id();
            self.send_packet(&Packet::Subscribe { packet_id, topics }).await?;
            match self.read_packet(timeout).await? {
                Some(Packet::SubAck { return_codes, .. }) => {
                    if return_codes.iter().any(|&code| code == 0x80) {
                        warn!("mqtt {}: some subscriptions were refused", self.device_id);
                    }
                }
                _ => {
                    self.stream = None;
                    return Err(WorkerError::Protocol(ProtocolError::ConnectFailure(
                        "no SUBACK".into(),
                    )));
                }
            }
        }

        // Back on a healthy broker: replay what queued up while offline.
        if self.params.production_mode {
            self.replay_offline();
        }
        Ok(())
    }

    async fn close_connection(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.write_all(&Packet::Disconnect.encode()).await;
            let _ = stream.shutdown().await;
        }
    }

    async fn check_connection(&mut self) -> bool {
        self.stream.is_some()
    }

    async fn send_keep_alive(&mut self) -> Result<()> {
        self.send_packet(&Packet::PingReq).await
    }

    async fn poll_cycle(&mut self, queue: &PipelineQueue) -> Result<Duration> {
        // Outbound first, then pump inbound for a bounded window.
        self.drain_publish_queue().await?;

        let window = Duration::from_millis(100);
        let deadline = Instant::now() + window;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match self.read_packet(remaining).await? {
                None => break,
                Some(Packet::Publish { topic, payload, qos, packet_id, .. }) => {
                    if qos == QoS::AtLeastOnce {
                        if let Some(id) = packet_id {
                            self.send_packet(&Packet::PubAck { packet_id: id }).await?;
                        }
                    }
                    self.route_publish(&topic, &payload, queue);
                }
                Some(Packet::PingResp) | Some(Packet::PubAck { .. }) => {}
                Some(Packet::Disconnect) => {
                    self.stream = None;
                    return Err(WorkerError::ConnectionLost("broker sent DISCONNECT".into()));
                }
                Some(other) => debug!("mqtt {}: ignoring packet {other:?}", self.device_id),
            }
        }
        Ok(Duration::from_millis(20))
    }

    async fn write_point(&mut self, point_id: PointId, value: Value) -> Result<()> {
        // Scalar writes publish to the point's topic.
        let point = self.points.get(&point_id).ok_or(WorkerError::UnknownPoint(point_id))?;
        if !point.access.writable() {
            return Err(WorkerError::NotWritable(point_id));
        }
        let topic = match &point.address {
            gridflow_protocol::PointAddress::Mqtt { topic } => topic.clone(),
            _ => return Err(WorkerError::Unsupported("point has no MQTT topic".into())),
        };
        let payload = serde_json::json!({ "value": value }).to_string().into_bytes();
        self.publish(OutboundMessage {
            topic,
            payload,
            qos: QoS::AtLeastOnce,
            retain: false,
            priority: PublishPriority::High,
        });
        self.drain_publish_queue().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn priority_queue_is_strict_then_fifo() {
        let mut q = PriorityPublishQueue::default();
        let msg = |p, tag: &str| OutboundMessage {
            topic: tag.into(),
            payload: vec![],
            qos: QoS::AtMostOnce,
            retain: false,
            priority: p,
        };
        q.push(msg(PublishPriority::Low, "l1"));
        q.push(msg(PublishPriority::Normal, "n1"));
        q.push(msg(PublishPriority::High, "h1"));
        q.push(msg(PublishPriority::Normal, "n2"));
        let order: Vec<String> = std::iter::from_fn(|| q.pop()).map(|m| m.topic).collect();
        assert_eq!(order, ["h1", "n1", "n2", "l1"]);
    }

    #[test]
    fn breaker_opens_after_threshold_and_half_opens() {
        let mut breaker = CircuitBreaker::new(3, Duration::from_millis(0));
        assert!(breaker.allows());
        breaker.record_failure();
        breaker.record_failure();
        assert!(breaker.allows());
        breaker.record_failure();
        // Cooldown of zero means it immediately half-opens.
        assert!(breaker.allows());
        assert_eq!(breaker.state, BreakerState::HalfOpen);
        breaker.record_failure();
        assert_eq!(breaker.state, BreakerState::Open);
        breaker.record_success();
        assert_eq!(breaker.state, BreakerState::Closed);
    }

    #[test]
    fn duplicate_filter_window() {
        let mut filter = DuplicateFilter::new(2);
        assert!(!filter.check_and_insert("a"));
        assert!(filter.check_and_insert("a"));
        assert!(!filter.check_and_insert("b"));
        assert!(!filter.check_and_insert("c"));
        // "a" fell out of the window.
        assert!(!filter.check_and_insert("a"));
    }

    #[test]
    fn json_path_selection() {
        let doc = serde_json::json!({"a": {"b": {"c": 21.5}}, "arr": [1, 2, 3]});
        assert_eq!(select_json_path(&doc, "a.b.c").unwrap().as_f64(), Some(21.5));
        assert_eq!(select_json_path(&doc, "arr.1").unwrap().as_i64(), Some(2));
        assert!(select_json_path(&doc, "a.x").is_none());
        assert_eq!(select_json_path(&doc, ""), Some(&doc));
    }

    #[test]
    fn json_scalar_coercion() {
        assert_eq!(json_to_value(&serde_json::json!(true)), Some(Value::Bool(true)));
        assert_eq!(json_to_value(&serde_json::json!(3)), Some(Value::Int(3)));
        assert_eq!(json_to_value(&serde_json::json!(3.5)), Some(Value::Float(3.5)));
        assert_eq!(json_to_value(&serde_json::json!({"x": 1})), None);
    }
}
