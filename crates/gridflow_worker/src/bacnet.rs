//! BACnet/IP worker.
//!
//! Discovery by Who-Is broadcast feeds a device table; points are read by
//! ReadProperty(Present_Value) on their poll interval, or delivered by COV
//! notifications for points marked COV-capable (subscriptions auto-renew
//! before their lifetime expires). A periodic Who-Is doubles as discovery
//! refresh and connectivity probe.

use crate::base::ProtocolWorker;
use crate::error::{Result, WorkerError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use gridflow_engine::queue::PipelineQueue;
use gridflow_protocol::bacnet::{
    self, Apdu, AppValue, CovNotification, ObjectId, PropertyId,
};
use gridflow_protocol::{
    BacnetObjectType, BacnetParams, BadReason, DataPoint, DeviceDataMessage, DeviceId,
    PointAddress, PointId, PointRef, Protocol, ProtocolError, Quality, TenantId, TimestampedValue,
    Value, ValueType,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::time::Duration;
use tokio::net::UdpSocket;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// A device learned from an I-Am.
#[derive(Debug, Clone, PartialEq)]
pub struct DiscoveredDevice {
    pub instance: u32,
    pub address: SocketAddr,
    pub max_apdu: u32,
    pub segmentation: u32,
    pub vendor_id: u32,
    pub last_seen: DateTime<Utc>,
}

struct CovSubscription {
    point_id: PointId,
    object: ObjectId,
    process_id: u32,
    renew_at: Instant,
}

struct BacnetPoint {
    point: DataPoint,
    object: ObjectId,
    next_due: Instant,
}

pub struct BacnetWorker {
    device_id: DeviceId,
    tenant_id: TenantId,
    params: BacnetParams,
    socket: Option<UdpSocket>,
    devices: HashMap<u32, DiscoveredDevice>,
    points: Vec<BacnetPoint>,
    cov: Vec<CovSubscription>,
    /// Objects reported by the target device's object list.
    objects: Vec<ObjectId>,
    invoke_id: u8,
    next_discovery: Instant,
    producer_id: String,
}

impl BacnetWorker {
    pub fn new(
        device_id: DeviceId,
        tenant_id: TenantId,
        params: BacnetParams,
        points: &[DataPoint],
    ) -> Self {
        let mapped: Vec<BacnetPoint> = points
            .iter()
            .filter_map(|p| match p.address {
                PointAddress::Bacnet { object_type, instance } => Some(BacnetPoint {
                    point: p.clone(),
                    object: ObjectId { object_type: object_type.type_number(), instance },
                    next_due: Instant::now(),
                }),
                _ => None,
            })
            .collect();
        info!("bacnet worker {device_id}: {} objects of interest", mapped.len());
        Self {
            device_id,
            tenant_id,
            params,
            socket: None,
            devices: HashMap::new(),
            points: mapped,
            cov: Vec::new(),
            objects: Vec::new(),
            invoke_id: 0,
            next_discovery: Instant::now(),
            producer_id: format!("bacnet-{device_id}"),
        }
    }

    pub fn discovered(&self) -> &HashMap<u32, DiscoveredDevice> {
        &self.devices
    }

    fn next_invoke_id(&mut self) -> u8 {
        self.invoke_id = self.invoke_id.wrapping_add(1);
        self.invoke_id
    }

    /// Address of the BACnet device our points live on.
    fn target(&self) -> Option<(u32, SocketAddr)> {
        match self.params.device_instance {
            Some(instance) => self.devices.get(&instance).map(|d| (instance, d.address)),
            None => self
                .devices
                .values()
                .min_by_key(|d| d.instance)
                .map(|d| (d.instance, d.address)),
        }
    }

    async fn send_who_is(&mut self) -> Result<()> {
        let socket = self.socket.as_ref().ok_or(WorkerError::NotConnected)?;
        let apdu = bacnet::encode_who_is(self.params.device_range);
        let frame = bacnet::encode_bvlc(true, &apdu);
        socket
            .send_to(&frame, &self.params.broadcast)
            .await
            .map_err(|e| WorkerError::ConnectionLost(format!("who-is broadcast: {e}")))?;
        debug!("bacnet {}: Who-Is sent", self.device_id);
        Ok(())
    }

    /// Pump incoming datagrams for up to `window`, handling I-Am and COV
    /// notifications; returns the first APDU matching `invoke_id`.
    async fn pump(
        &mut self,
        window: Duration,
        wanted_invoke: Option<u8>,
        queue: Option<&PipelineQueue>,
    ) -> Result<Option<Apdu>> {
        let deadline = Instant::now() + window;
        let mut buf = [0u8; 1500];
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Ok(None);
            }
            let socket = self.socket.as_ref().ok_or(WorkerError::NotConnected)?;
            let received = tokio::time::timeout(remaining, socket.recv_from(&mut buf)).await;
            let (len, from) = match received {
                Err(_) => return Ok(None),
                Ok(Err(e)) => return Err(WorkerError::ConnectionLost(format!("udp recv: {e}"))),
                Ok(Ok(pair)) => pair,
            };
            let apdu = match bacnet::decode_bvlc(&buf[..len]) {
                Ok(apdu) => apdu.to_vec(),
                Err(e) => {
                    debug!("bacnet {}: dropping frame from {from}: {e}", self.device_id);
                    continue;
                }
            };
            match bacnet::decode_apdu(&apdu) {
                Ok(Apdu::IAm(iam)) => {
                    self.devices.insert(
                        iam.device.instance,
                        DiscoveredDevice {
                            instance: iam.device.instance,
                            address: from,
                            max_apdu: iam.max_apdu,
                            segmentation: iam.segmentation,
                            vendor_id: iam.vendor_id,
                            last_seen: Utc::now(),
                        },
                    );
                }
                Ok(Apdu::CovNotification(notification)) => {
                    self.handle_cov(&notification, queue).await?;
                }
                Ok(other) => {
                    let matches = match (&other, wanted_invoke) {
                        (Apdu::ReadPropertyAck(ack), Some(id)) => ack.invoke_id == id,
                        (Apdu::SimpleAck { invoke_id, .. }, Some(id)) => *invoke_id == id,
                        (Apdu::Error { invoke_id, .. }, Some(id)) => *invoke_id == id,
                        _ => false,
                    };
                    if matches {
                        return Ok(Some(other));
                    }
                }
                Err(e) => debug!("bacnet {}: undecodable APDU from {from}: {e}", self.device_id),
            }
        }
    }

    async fn handle_cov(
        &mut self,
        notification: &CovNotification,
        queue: Option<&PipelineQueue>,
    ) -> Result<()> {
        // Confirmed notifications need a SimpleAck back to the sender.
        if let Some(invoke_id) = notification.invoke_id {
            let target = self.target().map(|(_, addr)| addr);
            if let (Some(socket), Some(addr)) = (self.socket.as_ref(), target) {
                let ack =
                    bacnet::encode_simple_ack(invoke_id, bacnet::confirmed::COV_NOTIFICATION);
                let _ = socket.send_to(&bacnet::encode_bvlc(false, &ack), addr).await;
            }
        }
        let Some(queue) = queue else { return Ok(()) };
        let Some(sub) = self.cov.iter().find(|s| {
            s.process_id == notification.process_id || s.object == notification.object
        }) else {
            debug!("bacnet {}: COV for unknown subscription", self.device_id);
            return Ok(());
        };
        let Some(point) = self.points.iter().find(|p| p.point.id == sub.point_id) else {
            return Ok(());
        };
        let present = notification
            .values
            .iter()
            .find(|(prop, _)| *prop == PropertyId::PresentValue as u32)
            .map(|(_, value)| value);
        if let Some(value) = present {
            let tv = decode_present_value(&point.point, value);
            queue.send_device_data(DeviceDataMessage::new(
                self.device_id,
                self.tenant_id,
                Protocol::Bacnet,
                vec![tv],
                self.producer_id.clone(),
            ));
        }
        Ok(())
    }

    async fn read_property(&mut self, object: ObjectId, property: PropertyId) -> Result<Vec<AppValue>> {
        let (_, addr) = self.target().ok_or(WorkerError::NotConnected)?;
        let invoke_id = self.next_invoke_id();
        let apdu = bacnet::encode_read_property(invoke_id, object, property);
        let frame = bacnet::encode_bvlc(false, &apdu);
        self.socket
            .as_ref()
            .ok_or(WorkerError::NotConnected)?
            .send_to(&frame, addr)
            .await
            .map_err(|e| WorkerError::ConnectionLost(format!("udp send: {e}")))?;

        let window = Duration::from_millis(self.params.response_timeout_ms.max(1));
        match self.pump(window, Some(invoke_id), None).await? {
            Some(Apdu::ReadPropertyAck(ack)) => Ok(ack.values),
            Some(Apdu::Error { class, code, .. }) => Err(WorkerError::Protocol(
                ProtocolError::FrameError(format!("BACnet error class {class} code {code}")),
            )),
            _ => Err(WorkerError::Protocol(ProtocolError::ReadTimeout(
                self.params.response_timeout_ms,
            ))),
        }
    }

    /// Write Present_Value on an object.
    pub async fn write_present_value(
        &mut self,
        object: ObjectId,
        value: &AppValue,
        priority: Option<u8>,
    ) -> Result<()> {
        let (_, addr) = self.target().ok_or(WorkerError::NotConnected)?;
        let invoke_id = self.next_invoke_id();
        let apdu = bacnet::encode_write_property(
            invoke_id,
            object,
            PropertyId::PresentValue,
            value,
            priority,
        );
        let frame = bacnet::encode_bvlc(false, &apdu);
        self.socket
            .as_ref()
            .ok_or(WorkerError::NotConnected)?
            .send_to(&frame, addr)
            .await
            .map_err(|e| WorkerError::ConnectionLost(format!("udp send: {e}")))?;
        let window = Duration::from_millis(self.params.response_timeout_ms.max(1));
        match self.pump(window, Some(invoke_id), None).await? {
            Some(Apdu::SimpleAck { .. }) => Ok(()),
            Some(Apdu::Error { class, code, .. }) => Err(WorkerError::Protocol(
                ProtocolError::FrameError(format!("BACnet error class {class} code {code}")),
            )),
            _ => Err(WorkerError::Protocol(ProtocolError::WriteTimeout(
                self.params.response_timeout_ms,
            ))),
        }
    }

    async fn subscribe_cov(&mut self, point_index: usize) -> Result<()> {
        let (object, point_id) = {
            let p = &self.points[point_index];
            (p.object, p.point.id)
        };
        let (_, addr) = self.target().ok_or(WorkerError::NotConnected)?;
        let invoke_id = self.next_invoke_id();
        let process_id = u32::from(invoke_id) + 1;
        let lifetime = self.params.cov_lifetime_secs;
        let apdu = bacnet::encode_subscribe_cov(invoke_id, process_id, object, false, lifetime);
        let frame = bacnet::encode_bvlc(false, &apdu);
        self.socket
            .as_ref()
            .ok_or(WorkerError::NotConnected)?
            .send_to(&frame, addr)
            .await
            .map_err(|e| WorkerError::ConnectionLost(format!("udp send: {e}")))?;
        let window = Duration::from_millis(self.params.response_timeout_ms.max(1));
        match self.pump(window, Some(invoke_id), None).await? {
            Some(Apdu::SimpleAck { .. }) => {
                // Renew at 80% of the lifetime.
                let renew =
                    Instant::now() + Duration::from_secs(u64::from(lifetime) * 4 / 5);
                self.cov.retain(|s| s.point_id != point_id);
                self.cov.push(CovSubscription {
                    point_id,
                    object,
                    process_id,
                    renew_at: renew,
                });
                debug!("bacnet {}: COV subscribed for point {point_id}", self.device_id);
                Ok(())
            }
            Some(Apdu::Error { class, code, .. }) => Err(WorkerError::Protocol(
                ProtocolError::FrameError(format!("SubscribeCOV error {class}/{code}")),
            )),
            _ => Err(WorkerError::Protocol(ProtocolError::ReadTimeout(
                self.params.response_timeout_ms,
            ))),
        }
    }

    async fn enumerate_objects(&mut self) {
        let Some((instance, _)) = self.target() else { return };
        match self.read_property(ObjectId::device(instance), PropertyId::ObjectList).await {
            Ok(values) => {
                self.objects = values
                    .into_iter()
                    .filter_map(|v| match v {
                        AppValue::ObjectId(id)
                            if BacnetObjectType::from_type_number(id.object_type).is_some() =>
                        {
                            Some(id)
                        }
                        _ => None,
                    })
                    .collect();
                info!(
                    "bacnet {}: device {instance} exposes {} objects of interest",
                    self.device_id,
                    self.objects.len()
                );
            }
            Err(e) => debug!("bacnet {}: object list read failed: {e}", self.device_id),
        }
    }
}

/// Map a Present_Value APDU value onto a point's declared type.
fn decode_present_value(point: &DataPoint, value: &AppValue) -> TimestampedValue {
    let raw = match value {
        AppValue::Real(f) => Some(Value::Float(f64::from(*f))),
        AppValue::Double(f) => Some(Value::Float(*f)),
        AppValue::Unsigned(u) => Some(Value::Int(i64::from(*u))),
        AppValue::Signed(i) => Some(Value::Int(i64::from(*i))),
        AppValue::Bool(b) => Some(Value::Bool(*b)),
        // Binary object present values arrive as enumerated 0/1.
        AppValue::Enumerated(e) => match point.value_type {
            ValueType::Bool => Some(Value::Bool(*e != 0)),
            _ => Some(Value::Int(i64::from(*e))),
        },
        AppValue::CharString(s) => Some(Value::Text(s.clone())),
        AppValue::Null | AppValue::ObjectId(_) => None,
    };
    match raw {
        Some(value) => {
            let scaled = value.scaled(point.scale_factor, point.scale_offset);
            let quality = if point.out_of_range(&scaled) {
                Quality::Bad(BadReason::OutOfRange)
            } else {
                Quality::Good
            };
            let coerced = scaled.coerce(point.value_type).unwrap_or(scaled);
            TimestampedValue::new(PointRef::DataPoint(point.id), point.tenant_id, coerced, quality)
        }
        None => TimestampedValue::new(
            PointRef::DataPoint(point.id),
            point.tenant_id,
            Value::Int(0),
            Quality::Bad(BadReason::Decode),
        ),
    }
}

#[async_trait]
impl ProtocolWorker for BacnetWorker {
    async fn establish_connection(&mut self) -> Result<()> {
        let socket = UdpSocket::bind(&self.params.bind).await.map_err(|e| {
            WorkerError::Protocol(ProtocolError::ConnectFailure(format!(
                "{}: {e}",
                self.params.bind
            )))
        })?;
        socket.set_broadcast(true).map_err(WorkerError::Io)?;
        self.socket = Some(socket);

        // Initial discovery: broadcast, then harvest I-Ams for a short window.
        self.send_who_is().await?;
        self.pump(Duration::from_millis(self.params.response_timeout_ms.max(250)), None, None)
            .await?;
        self.next_discovery =
            Instant::now() + Duration::from_secs(self.params.discovery_interval_secs.max(1));

        if self.target().is_none() {
            self.socket = None;
            return Err(WorkerError::Protocol(ProtocolError::ConnectFailure(
                "no BACnet device answered Who-Is".into(),
            )));
        }
        self.enumerate_objects().await;

        // COV subscriptions for the points that want them.
        let cov_indices: Vec<usize> = self
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| p.point.cov)
            .map(|(i, _)| i)
            .collect();
        for index in cov_indices {
            if let Err(e) = self.subscribe_cov(index).await {
                warn!("bacnet {}: COV subscribe failed: {e}", self.device_id);
            }
        }
        Ok(())
    }

    async fn close_connection(&mut self) {
        self.socket = None;
        self.cov.clear();
    }

    async fn check_connection(&mut self) -> bool {
        self.socket.is_some() && self.target().is_some()
    }

    async fn send_keep_alive(&mut self) -> Result<()> {
        // Periodic Who-Is doubles as discovery refresh and liveness probe.
        self.send_who_is().await
    }

    async fn poll_cycle(&mut self, queue: &PipelineQueue) -> Result<Duration> {
        let now = Instant::now();

        if now >= self.next_discovery {
            self.send_who_is().await?;
            self.next_discovery =
                now + Duration::from_secs(self.params.discovery_interval_secs.max(1));
        }

        // Renew COV subscriptions nearing expiry.
        let renew: Vec<PointId> = self
            .cov
            .iter()
            .filter(|s| now >= s.renew_at)
            .map(|s| s.point_id)
            .collect();
        for point_id in renew {
            if let Some(index) = self.points.iter().position(|p| p.point.id == point_id) {
                if let Err(e) = self.subscribe_cov(index).await {
                    warn!("bacnet {}: COV renew failed for {point_id}: {e}", self.device_id);
                }
            }
        }

        // Poll the due non-COV points.
        let due: Vec<usize> = self
            .points
            .iter()
            .enumerate()
            .filter(|(_, p)| !p.point.cov && p.next_due <= now)
            .map(|(i, _)| i)
            .collect();
        let mut values = Vec::with_capacity(due.len());
        for index in due {
            let (object, interval_ms) = {
                let p = &self.points[index];
                (p.object, p.point.poll_interval_ms.max(1))
            };
            let tv = match self.read_property(object, PropertyId::PresentValue).await {
                Ok(app_values) => match app_values.first() {
                    Some(value) => decode_present_value(&self.points[index].point, value),
                    None => TimestampedValue::new(
                        PointRef::DataPoint(self.points[index].point.id),
                        self.tenant_id,
                        Value::Int(0),
                        Quality::Bad(BadReason::Decode),
                    ),
                },
                Err(e) if e.is_fatal_to_connection() => return Err(e),
                Err(e) => {
                    debug!("bacnet {}: read failed: {e}", self.device_id);
                    TimestampedValue::new(
                        PointRef::DataPoint(self.points[index].point.id),
                        self.tenant_id,
                        Value::Int(0),
                        Quality::Bad(BadReason::CommFailure),
                    )
                }
            };
            values.push(tv);
            let mut next = self.points[index].next_due + Duration::from_millis(interval_ms);
            if next <= now {
                next = now + Duration::from_millis(interval_ms);
            }
            self.points[index].next_due = next;
        }
        if !values.is_empty() {
            queue.send_device_data(DeviceDataMessage::new(
                self.device_id,
                self.tenant_id,
                Protocol::Bacnet,
                values,
                self.producer_id.clone(),
            ));
        }

        // Listen briefly for unsolicited traffic (COV notifications).
        self.pump(Duration::from_millis(50), None, Some(queue)).await?;

        let idle = self
            .points
            .iter()
            .filter(|p| !p.point.cov)
            .map(|p| p.next_due.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(Duration::from_millis(200));
        Ok(idle.min(Duration::from_millis(200)))
    }

    async fn write_point(&mut self, point_id: PointId, value: Value) -> Result<()> {
        let (object, value_type, writable) = {
            let p = self
                .points
                .iter()
                .find(|p| p.point.id == point_id)
                .ok_or(WorkerError::UnknownPoint(point_id))?;
            (p.object, p.point.value_type, p.point.access.writable())
        };
        if !writable {
            return Err(WorkerError::NotWritable(point_id));
        }
        let app_value = match value_type {
            ValueType::Bool => AppValue::Enumerated(u32::from(value.as_bool())),
            ValueType::Int => AppValue::Unsigned(
                value
                    .as_i64()
                    .filter(|v| (0..=i64::from(u32::MAX)).contains(v))
                    .ok_or_else(|| {
                        WorkerError::Protocol(ProtocolError::Decode(format!(
                            "{value} does not fit an unsigned"
                        )))
                    })? as u32,
            ),
            ValueType::Float => AppValue::Real(value.as_f64().unwrap_or(0.0) as f32),
            ValueType::Text => AppValue::CharString(value.to_string()),
        };
        self.write_present_value(object, &app_value, None).await
    }
}
