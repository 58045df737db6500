//! Modbus RTU worker.
//!
//! Same polling-group model as the TCP worker, plus the serial-bus realities:
//! the line is half-duplex and may host many slaves behind one port, so all
//! exchanges hold a per-bus mutex and honour a minimum inter-frame delay.
//! CRC and frame errors are tracked per slave; a scan probe walks a slave-id
//! range and records reachability.

use crate::base::ProtocolWorker;
use crate::error::{Result, WorkerError};
use crate::polling::{self, PollGroup};
use async_trait::async_trait;
use gridflow_engine::queue::PipelineQueue;
use gridflow_protocol::modbus::{
    self, decode_response_pdu, encode_rtu_frame, expected_response_pdu_len, Request, Response,
};
use gridflow_protocol::{
    BadReason, DataPoint, DeviceDataMessage, DeviceId, ModbusRtuParams, PointAddress, PointId,
    Protocol, ProtocolError, Quality, RegisterType, SerialParity, TenantId, TimestampedValue,
    Value,
};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::Mutex as AsyncMutex;
use tokio::time::Instant;
use tokio_serial::{SerialPortBuilderExt, SerialStream};
use tracing::{debug, info, warn};

/// Per-slave link statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct SlaveStats {
    pub requests: u64,
    pub crc_errors: u64,
    pub frame_errors: u64,
    pub timeouts: u64,
    pub consecutive_timeouts: u32,
    pub offline: bool,
}

pub struct ModbusRtuWorker {
    device_id: DeviceId,
    tenant_id: TenantId,
    params: ModbusRtuParams,
    groups: Vec<PollGroup>,
    next_due: Vec<Instant>,
    port: Option<SerialStream>,
    /// One mutex per physical serial port, shared by every worker on it.
    bus: Arc<AsyncMutex<()>>,
    slaves: HashMap<u8, SlaveStats>,
    write_map: HashMap<PointId, (u8, RegisterType, u16)>,
    producer_id: String,
}

impl ModbusRtuWorker {
    pub fn new(
        device_id: DeviceId,
        tenant_id: TenantId,
        params: ModbusRtuParams,
        points: &[DataPoint],
        bus: Arc<AsyncMutex<()>>,
    ) -> Self {
        let groups =
            polling::build_groups(points, params.max_group_gap, params.max_registers_per_group);
        info!(
            "modbus-rtu worker {device_id} on {}: {} points -> {} groups",
            params.serial_port,
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
            port: None,
            bus,
            slaves: HashMap::new(),
            write_map,
            producer_id: format!("modbus-rtu-{device_id}"),
        }
    }

    pub fn slave_stats(&self) -> &HashMap<u8, SlaveStats> {
        &self.slaves
    }

    /// One bus exchange: frame, send, read the sized response, validate CRC.
    /// Holds the bus mutex for the whole request/response plus quiet time.
    async fn exchange(&mut self, slave: u8, request: &Request) -> Result<Response> {
        let response_timeout = Duration::from_millis(self.params.response_timeout_ms.max(1));
        let quiet = Duration::from_millis(self.params.inter_frame_delay_ms);
        let expected_pdu = expected_response_pdu_len(request);
        let frame = encode_rtu_frame(slave, &request.encode_pdu());
        let bus = Arc::clone(&self.bus);
        let offline_threshold = self.params.offline_threshold.max(1);

        let stats = self.slaves.entry(slave).or_default();
        stats.requests += 1;

        let port = self.port.as_mut().ok_or(WorkerError::NotConnected)?;
        let guard = bus.lock().await;
        let io = async {
            port.write_all(&frame).await?;
            // Slave address + function first, to spot exception frames.
            let mut head = [0u8; 2];
            port.read_exact(&mut head).await?;
            let body_len = if head[1] & 0x80 != 0 { 1 } else { expected_pdu - 1 };
            let mut rest = vec![0u8; body_len + 2];
            port.read_exact(&mut rest).await?;
            let mut full = Vec::with_capacity(2 + rest.len());
            full.extend_from_slice(&head);
            full.extend_from_slice(&rest);
            Ok::<Vec<u8>, std::io::Error>(full)
        };
        let outcome = tokio::time::timeout(response_timeout, io).await;
        // Quiet time after every exchange, still under the bus lock.
        if !quiet.is_zero() {
            tokio::time::sleep(quiet).await;
        }
        drop(guard);

        let stats = self.slaves.entry(slave).or_default();
        match outcome {
            Err(_) => {
                stats.timeouts += 1;
                stats.consecutive_timeouts += 1;
                if stats.consecutive_timeouts >= offline_threshold {
                    stats.offline = true;
                    self.port = None;
                    return Err(WorkerError::ConnectionLost(format!(
                        "slave {slave}: {} consecutive timeouts",
                        stats.consecutive_timeouts
                    )));
                }
                Err(ProtocolError::ReadTimeout(self.params.response_timeout_ms).into())
            }
            Ok(Err(e)) => {
                self.port = None;
                Err(WorkerError::ConnectionLost(e.to_string()))
            }
            Ok(Ok(raw)) => {
                stats.consecutive_timeouts = 0;
                stats.offline = false;
                match modbus::decode_rtu_frame(&raw) {
                    Ok((from, pdu)) => {
                        if from != slave {
                            stats.frame_errors += 1;
                            return Err(ProtocolError::FrameError(format!(
                                "response from slave {from}, expected {slave}"
                            ))
                            .into());
                        }
                        decode_response_pdu(request.function(), slave, pdu).map_err(|e| {
                            if matches!(e, ProtocolError::FrameTooShort { .. } | ProtocolError::FrameError(_)) {
                                stats.frame_errors += 1;
                            }
                            e.into()
                        })
                    }
                    Err(e @ ProtocolError::CrcMismatch { .. }) => {
                        stats.crc_errors += 1;
                        Err(e.into())
                    }
                    Err(e) => {
                        stats.frame_errors += 1;
                        Err(e.into())
                    }
                }
            }
        }
    }

    /// Probe a slave-id range with a short timeout; records reachability in
    /// the per-slave stats and returns the reachable ids.
    pub async fn scan_slaves(&mut self, lo: u8, hi: u8) -> Result<Vec<u8>> {
        let mut reachable = Vec::new();
        for slave in lo..=hi.max(lo) {
            let request = Request::ReadHoldingRegisters { address: 0, count: 1 };
            match self.exchange(slave, &request).await {
                Ok(_) => reachable.push(slave),
                // An exception still proves the slave is on the bus.
                Err(WorkerError::Protocol(ProtocolError::ModbusException { .. })) => {
                    reachable.push(slave)
                }
                Err(e) if e.is_fatal_to_connection() => return Err(e),
                Err(_) => {}
            }
        }
        info!(
            "rtu scan {}..{} on {}: {} reachable",
            lo,
            hi,
            self.params.serial_port,
            reachable.len()
        );
        Ok(reachable)
    }

    fn read_request(group: &PollGroup) -> Request {
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
}

#[async_trait]
impl ProtocolWorker for ModbusRtuWorker {
    async fn establish_connection(&mut self) -> Result<()> {
        let parity = match self.params.parity {
            SerialParity::None => tokio_serial::Parity::None,
            SerialParity::Even => tokio_serial::Parity::Even,
            SerialParity::Odd => tokio_serial::Parity::Odd,
        };
        let data_bits = match self.params.data_bits {
            5 => tokio_serial::DataBits::Five,
            6 => tokio_serial::DataBits::Six,
            7 => tokio_serial::DataBits::Seven,
            _ => tokio_serial::DataBits::Eight,
        };
        let stop_bits = if self.params.stop_bits == 2 {
            tokio_serial::StopBits::Two
        } else {
            tokio_serial::StopBits::One
        };
        let port = tokio_serial::new(self.params.serial_port.as_str(), self.params.baud_rate)
            .parity(parity)
            .data_bits(data_bits)
            .stop_bits(stop_bits)
            .timeout(Duration::from_millis(self.params.response_timeout_ms))
            .open_native_async()
            .map_err(|e| {
                WorkerError::Protocol(ProtocolError::ConnectFailure(format!(
                    "{}: {e}",
                    self.params.serial_port
                )))
            })?;
        self.port = Some(port);
        for stats in self.slaves.values_mut() {
            stats.consecutive_timeouts = 0;
            stats.offline = false;
        }
        let now = Instant::now();
        for due in &mut self.next_due {
            *due = now;
        }
        Ok(())
    }

    async fn close_connection(&mut self) {
        self.port = None;
    }

    async fn check_connection(&mut self) -> bool {
        self.port.is_some()
    }

    async fn send_keep_alive(&mut self) -> Result<()> {
        // The polling traffic itself keeps the line exercised; an explicit
        // probe would only add bus contention.
        if self.port.is_none() {
            return Err(WorkerError::NotConnected);
        }
        Ok(())
    }

    async fn poll_cycle(&mut self, queue: &PipelineQueue) -> Result<Duration> {
        let now = Instant::now();
        for index in 0..self.groups.len() {
            if self.next_due[index] > now {
                continue;
            }
            let group = self.groups[index].clone();
            if self.slaves.get(&group.slave_id).map(|s| s.offline).unwrap_or(false) {
                // Offline slaves wait for the reconnect path.
                continue;
            }
            let request = Self::read_request(&group);
            let values = match self.exchange(group.slave_id, &request).await {
                Ok(response) => decode_group(&group, &response),
                Err(e) if e.is_fatal_to_connection() => {
                    queue.send_device_data(DeviceDataMessage::new(
                        self.device_id,
                        self.tenant_id,
                        Protocol::ModbusRtu,
                        bad_group(&group),
                        self.producer_id.clone(),
                    ));
                    return Err(e);
                }
                Err(e) => {
                    debug!("rtu group read failed on {}: {e}", self.device_id);
                    bad_group(&group)
                }
            };
            if !queue.send_device_data(DeviceDataMessage::new(
                self.device_id,
                self.tenant_id,
                Protocol::ModbusRtu,
                values,
                self.producer_id.clone(),
            )) {
                warn!("pipeline queue rejected batch from {}", self.device_id);
            }

            let mut due = self.next_due[index] + group.interval;
            if due <= now {
                due = now + group.interval;
            }
            self.next_due[index] = due;
        }

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
        let request = match register_type {
            RegisterType::Holding => {
                let raw = value
                    .as_i64()
                    .filter(|v| (0..=i64::from(u16::MAX)).contains(v))
                    .ok_or(WorkerError::Protocol(ProtocolError::Decode(format!(
                        "{value} does not fit a holding register"
                    ))))? as u16;
                Request::WriteSingleRegister { address, value: raw }
            }
            RegisterType::Coil => Request::WriteSingleCoil { address, on: value.as_bool() },
            RegisterType::DiscreteInput | RegisterType::Input => {
                return Err(WorkerError::NotWritable(point_id))
            }
        };
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

fn decode_group(group: &PollGroup, response: &Response) -> Vec<TimestampedValue> {
    let mut out = Vec::with_capacity(group.points.len());
    for gp in &group.points {
        let decoded = match response {
            Response::Bits(bits) => bits.get(gp.offset as usize).map(|b| polling::decode_bit(gp, *b)),
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
