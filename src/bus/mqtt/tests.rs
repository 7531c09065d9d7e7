use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::time::timeout;

use super::*;
use crate::bus::backoff::{BackoffPolicy, JitterPolicy};

const CONNACK: [u8; 4] = [0x20, 0x02, 0x00, 0x00];
const CONNECT: u8 = 1;
const SUBSCRIBE: u8 = 8;
const TOPIC: &str = "robot/speaking";
const LIMIT: Duration = Duration::from_secs(10);

fn broker(port: u16) -> BrokerConfig {
    BrokerConfig {
        host: "127.0.0.1".to_string(),
        port,
        client_id: "voicebus-test".to_string(),
        keep_alive_secs: 5,
        queue_capacity: 8,
        drain_timeout_ms: 500,
        ..BrokerConfig::default()
    }
}

fn policy(max_attempts: u32) -> ReconnectPolicy {
    ReconnectPolicy {
        backoff: BackoffPolicy {
            first: Duration::from_millis(20),
            max: Duration::from_millis(50),
            factor: 2.0,
            jitter: JitterPolicy::None,
        },
        max_attempts: Some(max_attempts),
    }
}

/// Reads one MQTT control packet and returns its type and body.
async fn read_packet(stream: &mut TcpStream) -> std::io::Result<(u8, Vec<u8>)> {
    let header = stream.read_u8().await?;
    let mut remaining = 0usize;
    let mut shift = 0;
    loop {
        let byte = stream.read_u8().await?;
        remaining |= ((byte & 0x7f) as usize) << shift;
        if byte & 0x80 == 0 {
            break;
        }
        shift += 7;
    }
    let mut body = vec![0; remaining];
    stream.read_exact(&mut body).await?;
    Ok((header >> 4, body))
}

fn publish_packet(topic: &str, payload: &[u8]) -> Vec<u8> {
    let mut body = Vec::new();
    body.extend_from_slice(&(topic.len() as u16).to_be_bytes());
    body.extend_from_slice(topic.as_bytes());
    body.extend_from_slice(payload);

    let mut packet = vec![0x30];
    let mut remaining = body.len();
    loop {
        let mut byte = (remaining % 128) as u8;
        remaining /= 128;
        if remaining > 0 {
            byte |= 0x80;
        }
        packet.push(byte);
        if remaining == 0 {
            break;
        }
    }
    packet.extend(body);
    packet
}

/// Accepts one client and completes the MQTT handshake.
async fn accept(listener: &TcpListener) -> TcpStream {
    let (mut stream, _) = listener.accept().await.expect("accept");
    let (kind, _) = read_packet(&mut stream).await.expect("connect packet");
    assert_eq!(kind, CONNECT);
    stream.write_all(&CONNACK).await.expect("connack");
    stream
}

async fn next_subscribe(stream: &mut TcpStream) -> Vec<u8> {
    loop {
        let (kind, body) = read_packet(stream).await.expect("subscribe packet");
        if kind == SUBSCRIBE {
            return body;
        }
    }
}

fn names_topic(body: &[u8], topic: &str) -> bool {
    body.windows(topic.len()).any(|window| window == topic.as_bytes())
}

#[tokio::test]
async fn refused_broker_exhausts_reconnects() {
    let port = {
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        listener.local_addr().expect("addr").port()
    };
    let mut bus = MqttBus::connect(&broker(port), policy(2)).expect("connect");

    let err = bus.recv(LIMIT).await.expect_err("reconnects must run out");

    assert_eq!(err, BusError::ReconnectExhausted { attempts: 2 });
    assert!(err.is_fatal());
    assert!(!bus.is_connected());
}

#[tokio::test]
async fn reconnect_restores_subscriptions() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    // Each round drops the client right after it subscribed. With a ceiling
    // of one failure only a reset on ConnAck lets all three rounds happen.
    let server = tokio::spawn(async move {
        let mut rounds = Vec::new();
        for _ in 0..3 {
            let mut stream = accept(&listener).await;
            let body = next_subscribe(&mut stream).await;
            rounds.push(names_topic(&body, TOPIC));
        }
        rounds
    });

    let mut bus = MqttBus::connect(&broker(port), policy(1)).expect("connect");
    bus.subscribe(&[TOPIC.to_string()]).await.expect("subscribe");

    let rounds = timeout(LIMIT, server)
        .await
        .expect("client stopped reconnecting")
        .expect("fake broker panicked");
    assert_eq!(rounds, vec![true, true, true]);

    let err = bus.recv(LIMIT).await.expect_err("broker is gone");
    assert_eq!(err, BusError::ReconnectExhausted { attempts: 1 });
}

#[tokio::test]
async fn inbound_burst_does_not_block_publishers() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let port = listener.local_addr().expect("addr").port();

    let server = tokio::spawn(async move {
        let mut stream = accept(&listener).await;
        for _ in 0..64 {
            stream
                .write_all(&publish_packet(TOPIC, b"true"))
                .await
                .expect("publish");
        }
        while read_packet(&mut stream).await.is_ok() {}
    });

    let mut bus = MqttBus::connect(&broker(port), policy(3)).expect("connect");
    bus.subscribe(&[TOPIC.to_string()]).await.expect("subscribe");
    bus.wait_connected(LIMIT).await.expect("connected");
    // Nobody reads yet, so the inbound queue fills and the driver parks.
    sleep(Duration::from_millis(200)).await;

    let flood = async {
        for _ in 0..100 {
            bus.publish(OutboundMessage {
                topic: "session/state".to_string(),
                payload: Bytes::from_static(b"active"),
                retain: true,
            })
            .await?;
        }
        Ok::<_, BusError>(())
    };
    timeout(LIMIT, flood)
        .await
        .expect("publish blocked behind a full inbound queue")
        .expect("publish");

    let message = bus
        .recv(LIMIT)
        .await
        .expect("recv")
        .expect("buffered message");
    assert_eq!(message.topic, TOPIC);

    timeout(LIMIT, bus.disconnect())
        .await
        .expect("disconnect hung")
        .expect("disconnect");
    server.abort();
}
