//! BACnet worker against an in-process device on UDP.

use gridflow_engine::queue::PipelineQueue;
use gridflow_worker::bacnet::BacnetWorker;
use gridflow_worker::base::ProtocolWorker;
use gridflow_protocol::bacnet::{
    self, AppValue, CovNotification, IAm, ObjectId, PropertyId, ReadPropertyAck, TagReader,
};
use gridflow_protocol::{
    AccessMode, BacnetObjectType, BacnetParams, DataPoint, DeviceId, PointAddress, PointId,
    Quality, TenantId, Value, ValueType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::UdpSocket;

const DEVICE_INSTANCE: u32 = 99;

/// Emulated device: answers Who-Is with I-Am, ReadProperty with canned
/// values, SubscribeCOV with a SimpleAck followed by a COV notification.
async fn spawn_device() -> std::net::SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let addr = socket.local_addr().unwrap();
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        loop {
            let Ok((len, peer)) = socket.recv_from(&mut buf).await else { return };
            let Ok(apdu) = bacnet::decode_bvlc(&buf[..len]) else { continue };
            if apdu.len() < 2 {
                continue;
            }
            match apdu[0] >> 4 {
                // Unconfirmed: only Who-Is expected.
                0x1 if apdu[1] == bacnet::unconfirmed::WHO_IS => {
                    let iam = bacnet::encode_i_am(&IAm {
                        device: ObjectId::device(DEVICE_INSTANCE),
                        max_apdu: 1476,
                        segmentation: 3,
                        vendor_id: 42,
                    });
                    let _ = socket.send_to(&bacnet::encode_bvlc(false, &iam), peer).await;
                }
                // Confirmed requests.
                0x0 => {
                    let invoke_id = apdu[2];
                    let service = apdu[3];
                    match service {
                        bacnet::confirmed::READ_PROPERTY => {
                            let mut reader = TagReader::new(&apdu[4..]);
                            let object = reader.expect_context_object_id(0).unwrap();
                            let property = reader.expect_context_unsigned(1).unwrap();
                            let values = if property == PropertyId::ObjectList as u32 {
                                vec![
                                    AppValue::ObjectId(ObjectId::device(DEVICE_INSTANCE)),
                                    AppValue::ObjectId(ObjectId { object_type: 0, instance: 5 }),
                                ]
                            } else {
                                vec![AppValue::Real(21.5)]
                            };
                            let ack = bacnet::encode_read_property_ack(&ReadPropertyAck {
                                invoke_id,
                                object,
                                property,
                                values,
                            });
                            let _ = socket.send_to(&bacnet::encode_bvlc(false, &ack), peer).await;
                        }
                        bacnet::confirmed::SUBSCRIBE_COV => {
                            let mut reader = TagReader::new(&apdu[4..]);
                            let process_id = reader.expect_context_unsigned(0).unwrap();
                            let object = reader.expect_context_object_id(1).unwrap();
                            let ack = bacnet::encode_simple_ack(invoke_id, service);
                            let _ = socket.send_to(&bacnet::encode_bvlc(false, &ack), peer).await;
                            // Push one unconfirmed notification right away.
                            let notification = bacnet::encode_cov_notification(&CovNotification {
                                invoke_id: None,
                                process_id,
                                device: ObjectId::device(DEVICE_INSTANCE),
                                object,
                                time_remaining: 500,
                                values: vec![(
                                    PropertyId::PresentValue as u32,
                                    AppValue::Real(3.25),
                                )],
                            });
                            let _ = socket
                                .send_to(&bacnet::encode_bvlc(false, &notification), peer)
                                .await;
                        }
                        bacnet::confirmed::WRITE_PROPERTY => {
                            let ack = bacnet::encode_simple_ack(invoke_id, service);
                            let _ = socket.send_to(&bacnet::encode_bvlc(false, &ack), peer).await;
                        }
                        _ => {}
                    }
                }
                _ => {}
            }
        }
    });
    addr
}

fn bacnet_params(device: std::net::SocketAddr) -> BacnetParams {
    BacnetParams {
        bind: "127.0.0.1:0".into(),
        broadcast: device.to_string(),
        device_instance: Some(DEVICE_INSTANCE),
        discovery_interval_secs: 300,
        device_range: None,
        cov_lifetime_secs: 600,
        response_timeout_ms: 500,
    }
}

fn analog_point(id: i64, instance: u32, cov: bool) -> DataPoint {
    DataPoint {
        id: PointId::new(id),
        device_id: DeviceId::new(3),
        tenant_id: TenantId::new(1),
        name: format!("ai{instance}"),
        address: PointAddress::Bacnet { object_type: BacnetObjectType::AnalogInput, instance },
        value_type: ValueType::Float,
        unit: None,
        scale_factor: 1.0,
        scale_offset: 0.0,
        min_value: None,
        max_value: None,
        poll_interval_ms: 50,
        access: AccessMode::ReadWrite,
        cov,
    }
}

#[tokio::test]
async fn discovers_and_polls_present_value() {
    let device = spawn_device().await;
    let mut worker = BacnetWorker::new(
        DeviceId::new(3),
        TenantId::new(1),
        bacnet_params(device),
        &[analog_point(1, 5, false)],
    );
    let queue = Arc::new(PipelineQueue::new(100));

    worker.establish_connection().await.unwrap();
    assert!(worker.discovered().contains_key(&DEVICE_INSTANCE));

    worker.poll_cycle(&queue).await.unwrap();
    let batch = queue.get_batch(10, Duration::from_millis(200));
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].values[0].value, Value::Float(21.5));
    assert_eq!(batch[0].values[0].quality, Quality::Good);
    worker.close_connection().await;
}

#[tokio::test]
async fn cov_subscription_delivers_notifications() {
    let device = spawn_device().await;
    let mut worker = BacnetWorker::new(
        DeviceId::new(3),
        TenantId::new(1),
        bacnet_params(device),
        &[analog_point(1, 5, true)],
    );
    let queue = Arc::new(PipelineQueue::new(100));

    // Connect subscribes COV; the device immediately notifies.
    worker.establish_connection().await.unwrap();
    worker.poll_cycle(&queue).await.unwrap();

    let batch = queue.get_batch(10, Duration::from_millis(200));
    assert!(!batch.is_empty(), "COV notification should have produced values");
    assert_eq!(batch[0].values[0].value, Value::Float(3.25));
    worker.close_connection().await;
}

#[tokio::test]
async fn write_present_value_round_trips() {
    let device = spawn_device().await;
    let mut worker = BacnetWorker::new(
        DeviceId::new(3),
        TenantId::new(1),
        bacnet_params(device),
        &[analog_point(1, 5, false)],
    );
    worker.establish_connection().await.unwrap();
    worker.write_point(PointId::new(1), Value::Float(42.0)).await.unwrap();
    worker.close_connection().await;
}

#[tokio::test]
async fn no_answer_fails_discovery() {
    // A socket that never answers.
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let mut params = bacnet_params(silent.local_addr().unwrap());
    params.response_timeout_ms = 150;
    let mut worker =
        BacnetWorker::new(DeviceId::new(3), TenantId::new(1), params, &[analog_point(1, 5, false)]);
    assert!(worker.establish_connection().await.is_err());
}
