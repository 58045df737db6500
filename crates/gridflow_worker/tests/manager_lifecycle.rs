//! Worker manager lifecycle over an in-memory store and a loopback slave.

use gridflow_engine::queue::PipelineQueue;
use gridflow_worker::{WorkerError, WorkerManager};
use gridflow_protocol::modbus::{decode_tcp_header, encode_tcp_frame, MBAP_HEADER_LEN};
use gridflow_protocol::{
    AccessMode, ConnectionConfig, DataPoint, Device, DeviceId, ModbusTcpParams, PointAddress,
    PointId, Protocol, RegisterType, TenantId, Value, ValueType,
};
use gridflow_test_utils::MemoryStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Slave that answers every read with zeros and acks every write.
async fn spawn_slave() -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((mut socket, _)) = listener.accept().await else { return };
            tokio::spawn(async move {
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
                    let response = match pdu[0] {
                        0x03 | 0x04 => {
                            let count = u16::from_be_bytes([pdu[3], pdu[4]]) as usize;
                            let mut out = vec![pdu[0], (count * 2) as u8];
                            out.extend(std::iter::repeat(0u8).take(count * 2));
                            out
                        }
                        0x05 | 0x06 => pdu.clone(),
                        other => vec![other | 0x80, 0x01],
                    };
                    let frame = encode_tcp_frame(parsed.transaction_id, parsed.unit_id, &response);
                    if socket.write_all(&frame).await.is_err() {
                        return;
                    }
                }
            });
        }
    });
    addr
}

fn seeded_store(addr: std::net::SocketAddr) -> Arc<MemoryStore> {
    let store = Arc::new(MemoryStore::new());
    store.add_device(Device {
        id: DeviceId::new(1),
        tenant_id: TenantId::new(1),
        name: "plc".into(),
        protocol: Protocol::ModbusTcp,
        connection: ConnectionConfig::ModbusTcp(ModbusTcpParams {
            host: addr.ip().to_string(),
            port: addr.port(),
            unit_id: 1,
            response_timeout_ms: 500,
            byte_timeout_ms: 100,
            inter_frame_delay_ms: 0,
            offline_threshold: 3,
            max_group_gap: 8,
            max_registers_per_group: 120,
        }),
        enabled: true,
        location: None,
    });
    store.add_datapoint(DataPoint {
        id: PointId::new(10),
        device_id: DeviceId::new(1),
        tenant_id: TenantId::new(1),
        name: "setpoint".into(),
        address: PointAddress::Modbus {
            slave_id: 1,
            register_type: RegisterType::Holding,
            address: 0,
        },
        value_type: ValueType::Int,
        unit: None,
        scale_factor: 1.0,
        scale_offset: 0.0,
        min_value: None,
        max_value: None,
        poll_interval_ms: 100,
        access: AccessMode::ReadWrite,
        cov: false,
    });
    store
}

async fn wait_connected(manager: &WorkerManager, device: DeviceId) {
    for _ in 0..50 {
        if manager.status(device).map(|s| s.connected).unwrap_or(false) {
            return;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    panic!("worker never connected");
}

#[tokio::test]
async fn start_is_idempotent_and_stop_succeeds_when_missing() {
    let addr = spawn_slave().await;
    let store = seeded_store(addr);
    let queue = Arc::new(PipelineQueue::new(1_000));
    let manager = WorkerManager::new(store, Arc::clone(&queue));

    manager.start(DeviceId::new(1)).await.unwrap();
    manager.start(DeviceId::new(1)).await.unwrap();
    assert_eq!(manager.list().len(), 1);
    wait_connected(&manager, DeviceId::new(1)).await;

    // The worker produces into the shared queue.
    for _ in 0..50 {
        if !queue.is_empty() {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert!(!queue.is_empty());

    manager.stop(DeviceId::new(1)).await.unwrap();
    assert!(manager.list().is_empty());
    // Stopping an unknown worker still succeeds.
    manager.stop(DeviceId::new(1)).await.unwrap();
    manager.stop(DeviceId::new(42)).await.unwrap();
}

#[tokio::test]
async fn write_routes_to_live_worker() {
    let addr = spawn_slave().await;
    let store = seeded_store(addr);
    let queue = Arc::new(PipelineQueue::new(1_000));
    let manager = WorkerManager::new(store, queue);

    manager.start(DeviceId::new(1)).await.unwrap();
    wait_connected(&manager, DeviceId::new(1)).await;

    manager.write_point(DeviceId::new(1), PointId::new(10), Value::Int(7)).await.unwrap();
    manager.control_analog(DeviceId::new(1), PointId::new(10), 21.0).await.unwrap();

    let status = manager.status(DeviceId::new(1)).unwrap();
    assert!(status.writes >= 2);
    manager.stop_all().await;
}

#[tokio::test]
async fn write_to_missing_worker_fails_fast() {
    let addr = spawn_slave().await;
    let store = seeded_store(addr);
    let queue = Arc::new(PipelineQueue::new(1_000));
    let manager = WorkerManager::new(store, queue);

    let err = manager
        .write_point(DeviceId::new(1), PointId::new(10), Value::Int(7))
        .await
        .unwrap_err();
    assert!(matches!(err, WorkerError::Stopped));
}

#[tokio::test]
async fn start_all_active_starts_each_enabled_device() {
    let addr = spawn_slave().await;
    let store = seeded_store(addr);
    let queue = Arc::new(PipelineQueue::new(1_000));
    let manager = WorkerManager::new(store, queue);

    let started = manager.start_all_active(Some(TenantId::new(1))).await.unwrap();
    assert_eq!(started, 1);
    assert_eq!(manager.list().len(), 1);
    manager.stop_all().await;
}

#[tokio::test]
async fn pause_and_resume_change_state() {
    let addr = spawn_slave().await;
    let store = seeded_store(addr);
    let queue = Arc::new(PipelineQueue::new(1_000));
    let manager = WorkerManager::new(store, queue);

    manager.start(DeviceId::new(1)).await.unwrap();
    wait_connected(&manager, DeviceId::new(1)).await;

    manager.pause(DeviceId::new(1)).await.unwrap();
    for _ in 0..50 {
        if manager.status(DeviceId::new(1)).unwrap().state == "paused" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.status(DeviceId::new(1)).unwrap().state, "paused");

    manager.resume(DeviceId::new(1)).await.unwrap();
    for _ in 0..50 {
        if manager.status(DeviceId::new(1)).unwrap().state == "running" {
            break;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    assert_eq!(manager.status(DeviceId::new(1)).unwrap().state, "running");
    manager.stop_all().await;
}
