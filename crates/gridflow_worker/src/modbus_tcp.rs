//! Modbus TCP worker.
//!
//! Transforms the device's point list into polling groups and scans them in
//! time-wheel order over one TCP connection. Writes go through the same
//! connection and are serialised with reads by the runner's command loop.
//! Due times slip forward so transient slowness never causes a catch-up
//! storm.

use crate::base::ProtocolWorker;
use crate::error::{Result, WorkerError};
use crate::polling::{self, PollGroup};
use async_trait::async_trait;
use gridflow_engine::queue::PipelineQueue;
use gridflow_protocol::modbus::{
    self, decode_response_pdu, encode_tcp_frame, Request, Response, MBAP_HEADER_LEN,
};
use gridflow_protocol::{
    BadReason, DataPoint, DeviceDataMessage, DeviceId, ModbusTcpParams, PointAddress, PointId,
    Protocol, ProtocolError, Quality, RegisterType, TenantId, TimestampedValue, Value,
};
use std::collections::HashMap;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Per-slave health tracking.
#[derive(Default)]
struct SlaveHealth {
    consecutive_timeouts: u32,
    offline: bool,
}

pub struct ModbusTcpWorker {
    device_id: DeviceId,
    tenant_id: TenantId,
    params: ModbusTcpParams,
    groups: Vec<PollGroup>,
    next_due: Vec<Instant>,
    stream: Option<TcpStream>,
    transaction_id: u16,
    slaves: HashMap<u8, SlaveHealth>,
    /// Write-path lookup: point -> (slave, register type, address, bool-ness).
    write_map: HashMap<PointId, (u8, RegisterType, u16)>,
    producer_id: String,
}

impl ModbusTcpWorker {
    pub fn new(
        device_id: DeviceId,
        tenant_id: TenantId,
        params: ModbusTcpParams,
        points: &[DataPoint],
    ) -> Self {
        let groups =
            polling::build_groups(points, params.max_group_gap, params.max_registers_per_group);
        info!(
            "modbus-tcp worker {device_id}: {} points -> {} polling groups",
            points.len(),
            groups.len()
        );
        let write_map = points
            .iter()
            .filter(|p| p.access.writable())
            .filter_map(|p| match p.address {
                PointAddress::Modbus { slave_id, register_type, address } => {
                    Some((p.id, (slave_id, register_type, address)))
                }
                _ => None,
            })
            .collect();
        let next_due = vec![Instant::now(); groups.len()];
        Self {
            device_id,
            tenant_id,
            params,
            groups,
            next_due,
            stream: None,
            transaction_id: 0,
            slaves: HashMap::new(),
            write_map,
            producer_id: format!("modbus-tcp-{device_id}"),
        }
    }

    fn timeout(&self) -> Duration {
        Duration::from_millis(self.params.response_timeout_ms.max(1))
    }

    async fn exchange(&mut self, slave: u8, request: &Request) -> Result<Response> {
        let stream = self.stream.as_mut().ok_or(WorkerError::NotConnected)?;
        self.transaction_id = self.transaction_id.wrapping_add(1);
        let tid = self.transaction_id;
        let frame = encode_tcp_frame(tid, slave, &request.encode_pdu());

        let timeout = Duration::from_millis(self.params.response_timeout_ms.max(1));
        let io = async {
            stream.write_all(&frame).await?;
            let mut header = [0u8; MBAP_HEADER_LEN];
            stream.read_exact(&mut header).await?;
            let parsed = modbus::decode_tcp_header(&header)?;
            let mut pdu = vec![0u8; parsed.pdu_len];
            stream.read_exact(&mut pdu).await?;
            if parsed.transaction_id != tid {
                return Err(ProtocolError::TransactionMismatch {
                    sent: tid,
                    got: parsed.transaction_id,
                });
            }
            Ok::<_, ProtocolError>(pdu)
        };

        let outcome = tokio::time::timeout(timeout, io).await;
        match outcome {
            Err(_) => {
                self.note_timeout(slave)?;
                Err(ProtocolError::ReadTimeout(self.params.response_timeout_ms).into())
            }
            Ok(Err(e)) => {
                // Stream-level failures poison the connection.
                if matches!(e, ProtocolError::Io(_)) {
                    self.stream = None;
                    return Err(WorkerError::ConnectionLost(e.to_string()));
                }
                Err(e.into())
            }
            Ok(Ok(pdu)) => {
                self.note_success(slave);
                decode_response_pdu(request.function(), slave, &pdu).map_err(Into::into)
            }
        }
    }

    /// Advance the timeout counter; past the threshold the slave goes
    /// offline and the connection is recycled.
    fn note_timeout(&mut self, slave: u8) -> Result<()> {
        let health = self.slaves.entry(slave).or_default();
        health.consecutive_timeouts += 1;
        if health.consecutive_timeouts >= self.params.offline_threshold.max(1) {
            health.offline = true;
            self.stream = None;
            return Err(WorkerError::ConnectionLost(format!(
                "slave {slave}: {} consecutive timeouts",
                health.consecutive_timeouts
            )));
        }
        Ok(())
    }

    fn note_success(&mut self, slave: u8) {
        let health = self.slaves.entry(slave).or_default();
        health.consecutive_timeouts = 0;
        health.offline = false;
    }

    fn read_request(&self, group: &PollGroup) -> Request {
        match group.register_type {
            RegisterType::Coil => Request::ReadCoils { address: group.start, count: group.count },
            RegisterType::DiscreteInput => {
                Request::ReadDiscreteInputs { address: group.start, count: group.count }
            }
            RegisterType::Holding => {
                Request::ReadHoldingRegisters { address: group.start, count: group.count }
            }
            RegisterType::Input => {
                Request::ReadInputRegisters { address: group.start, count: group.count }
            }
        }
    }

    fn decode_group(group: &PollGroup, response: &Response) -> Vec<TimestampedValue> {
        let mut out = Vec::with_capacity(group.points.len());
        for gp in &group.points {
            let decoded = match response {
                Response::Bits(bits) => {
                    bits.get(gp.offset as usize).map(|bit| polling::decode_bit(gp, *bit))
                }
                Response::Registers(regs) => {
                    regs.get(gp.offset as usize).map(|raw| polling::decode_register(gp, *raw))
                }
                Response::WriteAck { .. } => None,
            };
            let (value, quality) = match decoded {
                Some(pair) => pair,
                None => (Value::Int(0), Quality::Bad(BadReason::Decode)),
            };
            out.push(TimestampedValue::new(
                gridflow_protocol::PointRef::DataPoint(gp.id),
                gp.tenant_id,
                value,
                quality,
            ));
        }
        out
    }

    /// Emit comm-failure values for every point in the group.
    fn bad_group(group: &PollGroup) -> Vec<TimestampedValue> {
        group
            .points
            .iter()
            .map(|gp| {
                TimestampedValue::new(
                    gridflow_protocol::PointRef::DataPoint(gp.id),
                    gp.tenant_id,
                    Value::Int(0),
                    Quality::Bad(BadReason::CommFailure),
                )
            })
            .collect()
    }

    // ------------------------------------------------------------------
    // Public write surface (also reachable via the generic write_point)
    // ------------------------------------------------------------------

    pub async fn write_single_holding_register(&mut self, slave: u8, address: u16, value: u16) -> Result<()> {
        self.write_checked(slave, address, Request::WriteSingleRegister { address, value }).await
    }

    pub async fn write_single_coil(&mut self, slave: u8, address: u16, on: bool) -> Result<()> {
        self.write_checked(slave, address, Request::WriteSingleCoil { address, on }).await
    }

    pub async fn write_multiple_holding_registers(
        &mut self,
        slave: u8,
        address: u16,
        values: Vec<u16>,
    ) -> Result<()> {
        self.write_checked(slave, address, Request::WriteMultipleRegisters { address, values }).await
    }

    pub async fn write_multiple_coils(
        &mut self,
        slave: u8,
        address: u16,
        values: Vec<bool>,
    ) -> Result<()> {
        self.write_checked(slave, address, Request::WriteMultipleCoils { address, values }).await
    }

    async fn write_checked(&mut self, slave: u8, address: u16, request: Request) -> Result<()> {
        match self.exchange(slave, &request).await {
            Ok(Response::WriteAck { .. }) => Ok(()),
            Ok(other) => Err(WorkerError::Protocol(ProtocolError::FrameError(format!(
                "unexpected write response: {other:?}"
            )))),
            Err(WorkerError::Protocol(ProtocolError::ModbusException { slave, exception })) => {
                Err(WorkerError::WriteRejected { slave, address, kind: exception })
            }
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
impl ProtocolWorker for ModbusTcpWorker {
    async fn establish_connection(&mut self) -> Result<()> {
        let addr = format!("{}:{}", self.params.host, self.params.port);
        let stream = tokio::time::timeout(self.timeout(), TcpStream::connect(&addr))
            .await
            .map_err(|_| WorkerError::Protocol(ProtocolError::ConnectFailure(format!("{addr}: timed out"))))?
            .map_err(|e| WorkerError::Protocol(ProtocolError::ConnectFailure(format!("{addr}: {e}"))))?;
        stream.set_nodelay(true).ok();
        self.stream = Some(stream);
        for health in self.slaves.values_mut() {
            health.consecutive_timeouts = 0;
            health.offline = false;
        }
        // Fresh connection: everything is due now.
        let now = Instant::now();
        for due in &mut self.next_due {
            *due = now;
        }
        Ok(())
    }

    async fn close_connection(&mut self) {
        if let Some(mut stream) = self.stream.take() {
            let _ = stream.shutdown().await;
        }
    }

    async fn check_connection(&mut self) -> bool {
        self.stream.is_some()
    }

    async fn send_keep_alive(&mut self) -> Result<()> {
        // A minimal read from the configured unit doubles as a liveness
        // probe; devices without registers at 0 still answer with an
        // exception, which proves the link.
        let unit = self.params.unit_id;
        match self.exchange(unit, &Request::ReadHoldingRegisters { address: 0, count: 1 }).await {
            Ok(_) => Ok(()),
            Err(WorkerError::Protocol(ProtocolError::ModbusException { .. })) => Ok(()),
            Err(e) => Err(e),
        }
    }

    async fn poll_cycle(&mut self, queue: &PipelineQueue) -> Result<Duration> {
        let now = Instant::now();
        let mut emitted = 0usize;
        for index in 0..self.groups.len() {
            if self.next_due[index] > now {
                continue;
            }
            let group = self.groups[index].clone();
            let request = self.read_request(&group);
            let values = match self.exchange(group.slave_id, &request).await {
                Ok(response) => Self::decode_group(&group, &response),
                Err(e) if e.is_fatal_to_connection() => {
                    // Surface comm failure for this group, then reconnect.
                    let message = DeviceDataMessage::new(
                        self.device_id,
                        self.tenant_id,
                        Protocol::ModbusTcp,
                        Self::bad_group(&group),
                        self.producer_id.clone(),
                    );
                    queue.send_device_data(message);
                    return Err(e);
                }
                Err(e) => {
                    debug!("group read failed on {}: {e}", self.device_id);
                    Self::bad_group(&group)
                }
            };

            let message = DeviceDataMessage::new(
                self.device_id,
                self.tenant_id,
                Protocol::ModbusTcp,
                values,
                self.producer_id.clone(),
            );
            if !queue.send_device_data(message) {
                warn!("pipeline queue rejected batch from {}", self.device_id);
            }
            emitted += 1;

            // Slip forward: late groups resume from now, they never replay
            // the missed ticks.
            let mut due = self.next_due[index] + group.interval;
            if due <= now {
                due = now + group.interval;
            }
            self.next_due[index] = due;

            if self.params.inter_frame_delay_ms > 0 {
                tokio::time::sleep(Duration::from_millis(self.params.inter_frame_delay_ms)).await;
            }
        }
        if emitted > 0 {
            debug!("worker {} scanned {emitted} groups", self.device_id);
        }

        // Sleep until the earliest group is due, bounded for command latency.
        let idle = self
            .next_due
            .iter()
            .map(|due| due.saturating_duration_since(Instant::now()))
            .min()
            .unwrap_or(Duration::from_millis(500));
        Ok(idle.min(Duration::from_millis(500)))
    }

    async fn write_point(&mut self, point_id: PointId, value: Value) -> Result<()> {
        let (slave, register_type, address) = *self
            .write_map
            .get(&point_id)
            .ok_or(WorkerError::UnknownPoint(point_id))?;
        match register_type {
            RegisterType::Holding => {
                let raw = value
                    .as_i64()
                    .filter(|v| (0..=i64::from(u16::MAX)).contains(v))
                    .ok_or(WorkerError::Protocol(ProtocolError::Decode(format!(
                        "{value} does not fit a holding register"
                    ))))? as u16;
                self.write_single_holding_register(slave, address, raw).await
            }
            RegisterType::Coil => self.write_single_coil(slave, address, value.as_bool()).await,
            RegisterType::DiscreteInput | RegisterType::Input => {
                Err(WorkerError::NotWritable(point_id))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gridflow_protocol::modbus::crc16;

    // The codec-level behaviours this worker depends on are covered in
    // gridflow_protocol; here we pin the worker-level decode mapping.

    fn group_with_types() -> PollGroup {
        use gridflow_protocol::ValueType;
        PollGroup {
            slave_id: 1,
            register_type: RegisterType::Holding,
            start: 0,
            count: 2,
            interval: Duration::from_millis(1000),
            points: vec![
                crate::polling::GroupPoint {
                    id: PointId::new(1),
                    tenant_id: TenantId::new(1),
                    offset: 0,
                    value_type: ValueType::Float,
                    scale_factor: 0.1,
                    scale_offset: 0.0,
                    min_value: None,
                    max_value: None,
                },
                crate::polling::GroupPoint {
                    id: PointId::new(2),
                    tenant_id: TenantId::new(1),
                    offset: 1,
                    value_type: ValueType::Int,
                    scale_factor: 1.0,
                    scale_offset: 0.0,
                    min_value: Some(0.0),
                    max_value: Some(100.0),
                },
            ],
        }
    }

    #[test]
    fn group_decode_applies_scaling_and_range() {
        let group = group_with_types();
        let response = Response::Registers(vec![215, 400]);
        let values = ModbusTcpWorker::decode_group(&group, &response);
        assert_eq!(values[0].value, Value::Float(21.5));
        assert_eq!(values[0].quality, Quality::Good);
        // 400 > max 100 -> out of range.
        assert_eq!(values[1].quality, Quality::Bad(BadReason::OutOfRange));
    }

    #[test]
    fn short_response_marks_decode_failure() {
        let group = group_with_types();
        let response = Response::Registers(vec![215]);
        let values = ModbusTcpWorker::decode_group(&group, &response);
        assert_eq!(values[1].quality, Quality::Bad(BadReason::Decode));
    }

    #[test]
    fn crc_sanity_for_shared_codec() {
        // Guards against the codec crate drifting underneath the worker.
        assert_eq!(crc16(&[0x01, 0x03, 0x00, 0x00, 0x00, 0x0A]), 0xCDC5);
    }
}
