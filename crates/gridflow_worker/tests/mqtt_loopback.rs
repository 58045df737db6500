//! MQTT worker against an in-process broker speaking just enough 3.1.1.

use bytes::BytesMut;
use gridflow_engine::queue::PipelineQueue;
use gridflow_worker::base::ProtocolWorker;
use gridflow_worker::mqtt::MqttWorker;
use gridflow_protocol::mqtt::{ConnectReturnCode, Packet, QoS};
use gridflow_protocol::{
    AccessMode, DataPoint, DeviceId, MqttParams, MqttSubscription, PointAddress, PointId,
    Quality, TenantId, Value, ValueType,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};

async fn read_packet(stream: &mut TcpStream, buf: &mut BytesMut) -> Packet {
    loop {
        if let Some(packet) = Packet::try_decode(buf).unwrap() {
            return packet;
        }
        let mut chunk = [0u8; 1024];
        let n = stream.read(&mut chunk).await.unwrap();
        assert!(n > 0, "peer closed");
        buf.extend_from_slice(&chunk[..n]);
    }
}

/// Broker that accepts the handshake, then publishes one telemetry message.
async fn spawn_broker(publish_payload: &'static str) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut stream, _) = listener.accept().await.unwrap();
        let mut buf = BytesMut::new();

        match read_packet(&mut stream, &mut buf).await {
            Packet::Connect(c) => assert_eq!(c.client_id, "gf-test"),
            other => panic!("expected CONNECT, got {other:?}"),
        }
        stream
            .write_all(
                &Packet::ConnAck { session_present: false, code: ConnectReturnCode::Accepted }
                    .encode(),
            )
            .await
            .unwrap();

        let packet_id = match read_packet(&mut stream, &mut buf).await {
            Packet::Subscribe { packet_id, topics } => {
                assert_eq!(topics.len(), 1);
                packet_id
            }
            other => panic!("expected SUBSCRIBE, got {other:?}"),
        };
        stream
            .write_all(&Packet::SubAck { packet_id, return_codes: vec![0] }.encode())
            .await
            .unwrap();

        stream
            .write_all(
                &Packet::Publish {
                    topic: "plant/line1/telemetry".into(),
                    payload: publish_payload.as_bytes().to_vec(),
                    qos: QoS::AtMostOnce,
                    retain: false,
                    dup: false,
                    packet_id: None,
                }
                .encode(),
            )
            .await
            .unwrap();

        // Keep serving pings until the peer goes away.
        loop {
            match Packet::try_decode(&mut buf) {
                Ok(Some(Packet::PingReq)) => {
                    let _ = stream.write_all(&Packet::PingResp.encode()).await;
                }
                Ok(Some(Packet::Disconnect)) | Err(_) => return,
                Ok(Some(_)) => {}
                Ok(None) => {
                    let mut chunk = [0u8; 1024];
                    match stream.read(&mut chunk).await {
                        Ok(0) | Err(_) => return,
                        Ok(n) => buf.extend_from_slice(&chunk[..n]),
                    }
                }
            }
        }
    });
    addr
}

fn mqtt_params(addr: std::net::SocketAddr) -> MqttParams {
    MqttParams {
        host: addr.ip().to_string(),
        port: addr.port(),
        client_id: "gf-test".into(),
        username: None,
        password: None,
        keep_alive_secs: 30,
        last_will: None,
        production_mode: false,
        backup_brokers: vec![],
        subscriptions: vec![MqttSubscription {
            topic: "plant/+/telemetry".into(),
            qos: 0,
            json_path: "sensors.temp".into(),
            data_points: vec![PointId::new(1)],
        }],
    }
}

fn mqtt_point(id: i64) -> DataPoint {
    DataPoint {
        id: PointId::new(id),
        device_id: DeviceId::new(2),
        tenant_id: TenantId::new(1),
        name: "temp".into(),
        address: PointAddress::Mqtt { topic: "plant/line1/telemetry".into() },
        value_type: ValueType::Float,
        unit: Some("degC".into()),
        scale_factor: 1.0,
        scale_offset: 0.0,
        min_value: None,
        max_value: None,
        poll_interval_ms: 0,
        access: AccessMode::Read,
        cov: false,
    }
}

#[tokio::test]
async fn subscribes_and_routes_json_path_values() {
    let addr = spawn_broker(r#"{"sensors": {"temp": 21.5, "rpm": 900}}"#).await;
    let mut worker =
        MqttWorker::new(DeviceId::new(2), TenantId::new(1), mqtt_params(addr), &[mqtt_point(1)]);
    let queue = Arc::new(PipelineQueue::new(100));

    worker.establish_connection().await.unwrap();
    // The broker pushes right after SUBACK; one cycle picks it up.
    worker.poll_cycle(&queue).await.unwrap();

    let batch = queue.get_batch(10, Duration::from_millis(200));
    assert_eq!(batch.len(), 1);
    assert_eq!(batch[0].values.len(), 1);
    assert_eq!(batch[0].values[0].value, Value::Float(21.5));
    assert_eq!(batch[0].values[0].quality, Quality::Good);

    worker.send_keep_alive().await.unwrap();
    worker.close_connection().await;
}

#[tokio::test]
async fn unparsable_payload_degrades_quality() {
    let addr = spawn_broker("not json at all").await;
    let mut worker =
        MqttWorker::new(DeviceId::new(2), TenantId::new(1), mqtt_params(addr), &[mqtt_point(1)]);
    let queue = Arc::new(PipelineQueue::new(100));

    worker.establish_connection().await.unwrap();
    worker.poll_cycle(&queue).await.unwrap();

    let batch = queue.get_batch(10, Duration::from_millis(200));
    assert_eq!(batch.len(), 1);
    assert!(batch[0].values[0].quality.is_bad());
    assert_eq!(worker.subscription_stats()["plant/+/telemetry"].parse_errors, 1);
    worker.close_connection().await;
}

#[tokio::test]
async fn production_mode_buffers_offline_and_replays_on_connect() {
    use gridflow_worker::mqtt::{OutboundMessage, PublishPriority};

    let addr = spawn_broker(r#"{"sensors": {"temp": 1.0}}"#).await;
    let mut params = mqtt_params(addr);
    params.production_mode = true;
    let mut worker =
        MqttWorker::new(DeviceId::new(2), TenantId::new(1), params, &[mqtt_point(1)]);

    // Disconnected publishes land in the offline buffer, priority preserved.
    for (priority, tag) in [
        (PublishPriority::Low, "low"),
        (PublishPriority::High, "high"),
        (PublishPriority::Normal, "normal"),
    ] {
        worker.publish(OutboundMessage {
            topic: format!("out/{tag}"),
            payload: tag.as_bytes().to_vec(),
            qos: QoS::AtMostOnce,
            retain: false,
            priority,
        });
    }
    assert_eq!(worker.offline_buffered(), 3);
    assert_eq!(worker.publish_queue_len(), 0);

    // Connect replays the buffer into the publish queue; a poll drains it.
    worker.establish_connection().await.unwrap();
    assert_eq!(worker.offline_buffered(), 0);
    assert_eq!(worker.publish_queue_len(), 3);
    let queue = Arc::new(PipelineQueue::new(100));
    worker.poll_cycle(&queue).await.unwrap();
    assert_eq!(worker.publish_queue_len(), 0);
    worker.close_connection().await;
}

#[tokio::test]
async fn failover_rotates_to_backup_broker() {
    // Primary is unreachable; the backup is real.
    let backup = spawn_broker(r#"{"sensors": {"temp": 1.0}}"#).await;
    let mut params = mqtt_params("127.0.0.1:1".parse().unwrap());
    params.production_mode = true;
    params.backup_brokers = vec![backup.to_string()];
    let mut worker =
        MqttWorker::new(DeviceId::new(2), TenantId::new(1), params, &[mqtt_point(1)]);

    // First attempt fails and advances the broker index.
    assert!(worker.establish_connection().await.is_err());
    // Second attempt lands on the backup.
    worker.establish_connection().await.unwrap();
    worker.close_connection().await;
}
