//! Modbus TCP worker against an in-process slave.

use gridflow_engine::queue::PipelineQueue;
use gridflow_worker::base::ProtocolWorker;
use gridflow_worker::modbus_tcp::ModbusTcpWorker;
use gridflow_worker::WorkerError;
use gridflow_protocol::modbus::{decode_tcp_header, encode_tcp_frame, MBAP_HEADER_LEN};
use gridflow_protocol::{
    AccessMode, DataPoint, DeviceId, ModbusTcpParams, PointAddress, PointId, Quality,
    RegisterType, TenantId, Value, ValueType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Minimal slave: serves two holding registers (scaled temp + status),
/// echoes writes, and answers address 99 with IllegalAddress.
async fn spawn_slave() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut registers = [215u16, 1u16];
        let (mut socket, _) = listener.accept().await.unwrap();
        loop {
            let mut header = [0u8; MBAP_HEADER_LEN];
            if socket.read_exact(&mut header).await.is_err() {
                return;
            }
            let parsed = decode_tcp_header(&header).unwrap();
            let mut pdu = vec![0u8; parsed.pdu_len];
            if socket.read_exact(&mut pdu).await.is_err() {
                return;
            }
            let function = pdu[0];
            let address = u16::from_be_bytes([pdu[1], pdu[2]]);
            let response = match function {
                0x03 => {
                    let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
                    if address == 99 {
                        vec![function | 0x80, 0x02]
                    } else {
                        let mut out = vec![function, (count * 2) as u8];
                        for i in 0..count {
                            let value = registers.get(address as usize + i).copied().unwrap_or(0);
                            out.extend_from_slice(&value.to_be_bytes());
                        }
                        out
                    }
                }
                0x06 => {
                    if address == 99 {
                        vec![function | 0x80, 0x02]
                    } else {
                        let value = u16::from_be_bytes([pdu[3], pdu[4]]);
                        if let Some(slot) = registers.get_mut(address as usize) {
                            *slot = value;
                        }
                        pdu.clone()
                    }
                }
                _ => vec![function | 0x80, 0x01],
            };
            let frame = encode_tcp_frame(parsed.transaction_id, parsed.unit_id, &response);
            if socket.write_all(&frame).await.is_err() {
                return;
            }
        }
    });
    addr
}

fn params(addr: std::net::SocketAddr) -> ModbusTcpParams {
    ModbusTcpParams {
        host: addr.ip().to_string(),
        port: addr.port(),
        unit_id: 1,
        response_timeout_ms: 1_000,
        byte_timeout_ms: 200,
        inter_frame_delay_ms: 0,
        offline_threshold: 3,
        max_group_gap: 8,
        max_registers_per_group: 120,
    }
}

fn holding_point(id: i64, address: u16, scale: f64) -> DataPoint {
    DataPoint {
        id: PointId::new(id),
        device_id: DeviceId::new(1),
        tenant_id: TenantId::new(1),
        name: format!("p{id}"),
        address: PointAddress::Modbus { slave_id: 1, register_type: RegisterType::Holding, address },
        value_type: ValueType::Float,
        unit: None,
        scale_factor: scale,
        scale_offset: 0.0,
        min_value: None,
        max_value: None,
        poll_interval_ms: 50,
        access: AccessMode::ReadWrite,
        cov: false,
    }
}

#[tokio::test]
async fn polls_a_group_and_emits_scaled_values() {
    let addr = spawn_slave().await;
    let points = vec![holding_point(1, 0, 0.1), holding_point(2, 1, 1.0)];
    let mut worker = ModbusTcpWorker::new(DeviceId::new(1), TenantId::new(1), params(addr), &points);
    let queue = Arc::new(PipelineQueue::new(100));

    worker.establish_connection().await.unwrap();
    worker.poll_cycle(&queue).await.unwrap();

    let batch = queue.get_batch(10, Duration::from_millis(100));
    assert_eq!(batch.len(), 1);
    let values = &batch[0].values;
    assert_eq!(values.len(), 2);
    // Register 215 scaled by 0.1.
    assert_eq!(values[0].value, Value::Float(21.5));
    assert_eq!(values[0].quality, Quality::Good);
    assert_eq!(values[1].value, Value::Float(1.0));
    worker.close_connection().await;
}

#[tokio::test]
async fn write_then_read_roundtrips_the_register() {
    let addr = spawn_slave().await;
    let points = vec![holding_point(1, 0, 1.0)];
    let mut worker = ModbusTcpWorker::new(DeviceId::new(1), TenantId::new(1), params(addr), &points);
    let queue = Arc::new(PipelineQueue::new(100));
    worker.establish_connection().await.unwrap();

    worker.write_point(PointId::new(1), Value::Int(0x1234)).await.unwrap();
    worker.poll_cycle(&queue).await.unwrap();

    let batch = queue.get_batch(10, Duration::from_millis(100));
    assert_eq!(batch[0].values[0].value, Value::Float(f64::from(0x1234u16)));
    worker.close_connection().await;
}

#[tokio::test]
async fn rejected_write_names_slave_and_address() {
    let addr = spawn_slave().await;
    let points = vec![holding_point(1, 99, 1.0)];
    let mut worker = ModbusTcpWorker::new(DeviceId::new(1), TenantId::new(1), params(addr), &points);
    worker.establish_connection().await.unwrap();

    let err = worker.write_point(PointId::new(1), Value::Int(1)).await.unwrap_err();
    match err {
        WorkerError::WriteRejected { slave, address, kind } => {
            assert_eq!(slave, 1);
            assert_eq!(address, 99);
            assert_eq!(kind, gridflow_protocol::ModbusExceptionKind::IllegalAddress);
        }
        other => panic!("unexpected error: {other}"),
    }
    worker.close_connection().await;
}

#[tokio::test]
async fn connect_failure_is_reported() {
    // Nothing listens on this port.
    let mut params = params("127.0.0.1:1".parse().unwrap());
    params.response_timeout_ms = 200;
    let mut worker = ModbusTcpWorker::new(DeviceId::new(1), TenantId::new(1), params, &[]);
    assert!(worker.establish_connection().await.is_err());
}
