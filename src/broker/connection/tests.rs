//! Connection state machine tests over an in-memory transport

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use pretty_assertions::assert_eq;
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;

use super::*;
use crate::broker::BrokerConfig;
use crate::hooks::AllowAll;
use crate::persistence::{MemoryBackend, StorageBackend};
use crate::protocol::{QoS, Transport};

/// Frames in through a channel, frames out through another
struct ChannelIo {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
    outbound: mpsc::UnboundedSender<String>,
}

#[async_trait]
impl FrameIo for ChannelIo {
    async fn fill(&mut self, decoder: &mut Decoder) -> std::io::Result<bool> {
        match self.inbound.recv().await {
            Some(data) => {
                decoder.extend(&data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn send(&mut self, frames: &[String]) -> std::io::Result<()> {
        for frame in frames {
            let _ = self.outbound.send(frame.clone());
        }
        Ok(())
    }

    async fn close(&mut self) {}
}

struct Client {
    tx: Option<mpsc::UnboundedSender<Vec<u8>>>,
    rx: mpsc::UnboundedReceiver<String>,
    task: JoinHandle<Result<(), ConnectionError>>,
    _shutdown: broadcast::Sender<()>,
}

impl Client {
    fn spawn(engine: &Arc<Engine>) -> Self {
        let (in_tx, in_rx) = mpsc::unbounded_channel();
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (shutdown, shutdown_rx) = broadcast::channel(1);
        let io = ChannelIo {
            inbound: in_rx,
            outbound: out_tx,
        };
        let remote = RemoteInfo::new("127.0.0.1:6000".parse().unwrap(), Transport::Socket);
        let mut conn = Connection::new(io, remote, engine.clone());
        let task = tokio::spawn(async move { conn.run(shutdown_rx).await });
        Self {
            tx: Some(in_tx),
            rx: out_rx,
            task,
            _shutdown: shutdown,
        }
    }

    fn send(&self, frame: Value) {
        let mut data = frame.to_string().into_bytes();
        data.push(0);
        self.tx.as_ref().unwrap().send(data).unwrap();
    }

    async fn recv(&mut self) -> Value {
        let frame = tokio::time::timeout(Duration::from_secs(2), self.rx.recv())
            .await
            .expect("timed out waiting for a frame")
            .expect("connection closed");
        serde_json::from_str(&frame).unwrap()
    }

    async fn assert_silent(&mut self) {
        let next = tokio::time::timeout(Duration::from_millis(100), self.rx.recv()).await;
        assert!(next.is_err(), "unexpected frame: {:?}", next);
    }

    async fn connect(&mut self, client_id: &str) {
        self.send(json!({"conn": {"at": "token", "cl": client_id}}));
        assert_eq!(self.recv().await, json!({"connAck": {"st": 1, "ts": 30}}));
    }
}

fn engine_with(config: BrokerConfig) -> Arc<Engine> {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let caps = AllowAll::with_store(store.clone()).capabilities();
    Arc::new(Engine::new(config, caps, store, None))
}

fn engine() -> Arc<Engine> {
    engine_with(BrokerConfig::default())
}

#[tokio::test]
async fn test_auth_returns_client_id_and_token() {
    let engine = engine();
    let mut client = Client::spawn(&engine);

    client.send(json!({"auth": {"dt": {"client_name": "alice"}}}));
    let ack = client.recv().await;
    assert_eq!(ack["authAck"]["st"], json!(1));
    assert_eq!(ack["authAck"]["cl"], json!("alice"));
    assert!(ack["authAck"]["at"].as_str().is_some_and(|t| !t.is_empty()));
}

#[tokio::test]
async fn test_auth_without_client_name_is_rejected() {
    let engine = engine();
    let mut client = Client::spawn(&engine);

    client.send(json!({"auth": {"dt": {}}}));
    assert_eq!(
        client.recv().await,
        json!({"authAck": {"st": 10, "mg": "Invalid auth data, client_name is missing"}})
    );
}

#[tokio::test]
async fn test_requests_before_conn_are_not_allowed() {
    let engine = engine();
    let mut client = Client::spawn(&engine);

    client.send(json!({"hb": {}}));
    client.send(json!({"pub": {"cn": "news", "dt": 1, "id": "p1", "q": 1}}));
    assert_eq!(
        client.recv().await,
        json!({"pubAck": {"st": 7, "id": "p1"}})
    );

    client.send(json!({"sub": {"cn": "news"}}));
    assert_eq!(client.recv().await, json!({"subAck": {"st": 7, "cn": "news"}}));

    client.send(json!({"unsub": {"cn": "news"}}));
    assert_eq!(client.recv().await, json!({"unsubAck": {"st": 7, "cn": "news"}}));
}

#[tokio::test]
async fn test_heartbeat_after_conn() {
    let engine = engine();
    let mut client = Client::spawn(&engine);
    client.connect("alice").await;

    client.send(json!({"hb": {}}));
    assert_eq!(client.recv().await, json!({"hbAck": {}}));
}

#[tokio::test]
async fn test_malformed_frame_is_skipped() {
    let engine = engine();
    let mut client = Client::spawn(&engine);

    client.tx.as_ref().unwrap().send(b"{\"nope\":{}}\0".to_vec()).unwrap();
    client.connect("alice").await;
}

#[tokio::test]
async fn test_sub_to_p2p_and_control_is_not_allowed() {
    let engine = engine();
    let mut client = Client::spawn(&engine);
    client.connect("alice").await;

    client.send(json!({"sub": {"cn": "#bob"}}));
    assert_eq!(client.recv().await, json!({"subAck": {"st": 7, "cn": "#bob"}}));

    client.send(json!({"sub": {"cn": "$mySubscriptions"}}));
    assert_eq!(
        client.recv().await,
        json!({"subAck": {"st": 7, "cn": "$mySubscriptions"}})
    );

    client.send(json!({"sub": {"cn": "$"}}));
    assert_eq!(client.recv().await, json!({"subAck": {"st": 11, "cn": "$"}}));
}

#[tokio::test]
async fn test_publish_reaches_other_subscribers_only() {
    let engine = engine();
    let mut alice = Client::spawn(&engine);
    let mut bob = Client::spawn(&engine);
    alice.connect("alice").await;
    bob.connect("bob").await;

    for client in [&mut alice, &mut bob] {
        client.send(json!({"sub": {"cn": "news"}}));
        assert_eq!(client.recv().await, json!({"subAck": {"st": 1, "cn": "news"}}));
    }

    bob.send(json!({"pub": {"cn": "news", "dt": {"headline": "hi"}}}));
    assert_eq!(
        alice.recv().await,
        json!({"push": {"cn": "news", "dt": {"headline": "hi"}, "cl": "bob"}})
    );
    bob.assert_silent().await;
}

#[tokio::test]
async fn test_qos1_publish_is_acked_and_tracked() {
    let engine = engine();
    let mut alice = Client::spawn(&engine);
    let mut bob = Client::spawn(&engine);
    alice.connect("alice").await;
    bob.connect("bob").await;

    alice.send(json!({"sub": {"cn": "news", "pr": 1}}));
    alice.recv().await;

    bob.send(json!({"pub": {"cn": "news", "dt": "x", "id": "b1", "q": 1}}));
    assert_eq!(bob.recv().await, json!({"pubAck": {"st": 1, "id": "b1"}}));

    let push = alice.recv().await;
    assert_eq!(push["push"]["q"], json!(1));
    let id = push["push"]["id"].as_str().unwrap().to_string();
    assert_ne!(id, "b1");
    assert_eq!(engine.pending_ids("alice").await, vec![id.clone()]);

    alice.send(json!({"pushAck": {"id": id}}));
    alice.send(json!({"hb": {}}));
    alice.recv().await;
    assert!(engine.pending_ids("alice").await.is_empty());
}

#[tokio::test]
async fn test_pending_packets_are_sent_one_at_a_time() {
    let engine = engine();
    engine.subscribe("alice", "news", true).await;
    for n in 0..2 {
        engine
            .publish("bob", "news", &json!(n), QoS::AtLeastOnce, false)
            .await;
    }

    let mut alice = Client::spawn(&engine);
    alice.connect("alice").await;

    let first = alice.recv().await;
    assert_eq!(first["push"]["dt"], json!(0));
    alice.assert_silent().await;

    alice.send(json!({"pushAck": {"id": first["push"]["id"]}}));
    let second = alice.recv().await;
    assert_eq!(second["push"]["dt"], json!(1));
}

#[tokio::test]
async fn test_retained_message_follows_suback() {
    let engine = engine();
    let mut bob = Client::spawn(&engine);
    bob.connect("bob").await;
    bob.send(json!({"pub": {"cn": "weather", "dt": "sunny", "rt": 1}}));

    let mut alice = Client::spawn(&engine);
    alice.connect("alice").await;
    // Give the publish time to land
    bob.send(json!({"hb": {}}));
    bob.recv().await;

    alice.send(json!({"sub": {"cn": "weather"}}));
    assert_eq!(alice.recv().await, json!({"subAck": {"st": 1, "cn": "weather"}}));
    assert_eq!(
        alice.recv().await,
        json!({"push": {"cn": "weather", "dt": "sunny", "cl": "bob", "rt": 1}})
    );
}

#[tokio::test]
async fn test_control_channel_answers_in_puback() {
    let engine = engine();
    let mut alice = Client::spawn(&engine);
    alice.connect("alice").await;
    alice.send(json!({"sub": {"cn": "news", "pr": 1}}));
    alice.recv().await;

    alice.send(json!({"pub": {"cn": "$mySubscriptions", "dt": {}, "id": "c1"}}));
    assert_eq!(
        alice.recv().await,
        json!({"pubAck": {"st": 1, "id": "c1", "dt": {"channels": [{"news": "persistent"}]}}})
    );

    alice.send(json!({"pub": {"cn": "$unknown", "dt": {}, "id": "c2"}}));
    assert_eq!(alice.recv().await, json!({"pubAck": {"st": 0, "id": "c2"}}));
}

#[tokio::test]
async fn test_p2p_publish_to_offline_client() {
    let engine = engine();
    engine.subscribe("bob", "#bob", true).await;
    let mut alice = Client::spawn(&engine);
    alice.connect("alice").await;

    alice.send(json!({"pub": {"cn": "#bob", "dt": 1, "id": "a1", "q": 1}}));
    assert_eq!(alice.recv().await, json!({"pubAck": {"st": 8, "id": "a1"}}));
}

#[tokio::test]
async fn test_disconn_tears_down_session() {
    let engine = engine();
    let mut alice = Client::spawn(&engine);
    alice.connect("alice").await;
    alice.send(json!({"sub": {"cn": "news"}}));
    alice.recv().await;

    alice.send(json!({"disconn": {}}));
    let result = tokio::time::timeout(Duration::from_secs(2), &mut alice.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(!engine.is_registered("alice"));
    assert!(engine.subscriptions("alice").await.is_empty());
}

#[tokio::test]
async fn test_second_connect_evicts_first() {
    let engine = engine();
    let mut first = Client::spawn(&engine);
    let mut second = Client::spawn(&engine);
    first.connect("alice").await;
    second.connect("alice").await;

    let result = tokio::time::timeout(Duration::from_secs(2), &mut first.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(engine.is_registered("alice"));
}

#[tokio::test]
async fn test_inactivity_ends_connection() {
    let engine = engine_with(BrokerConfig {
        timeout: Duration::from_millis(200),
        ..BrokerConfig::default()
    });
    let mut alice = Client::spawn(&engine);
    alice.send(json!({"conn": {"at": "t", "cl": "alice"}}));
    alice.recv().await;

    let result = tokio::time::timeout(Duration::from_secs(2), &mut alice.task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConnectionError::Timeout)));
    assert!(!engine.is_registered("alice"));
}

#[tokio::test]
async fn test_transport_close_is_not_graceful() {
    let engine = engine();
    let mut alice = Client::spawn(&engine);
    alice.connect("alice").await;

    alice.tx.take();
    let result = tokio::time::timeout(Duration::from_secs(2), &mut alice.task)
        .await
        .unwrap()
        .unwrap();
    assert!(result.is_ok());
    assert!(!engine.is_registered("alice"));
    assert!(!engine.store().has_presence("alice").await.unwrap());
}

#[tokio::test]
async fn test_oversized_frame_drops_connection() {
    let engine = engine_with(BrokerConfig {
        max_frame_size: 16,
        ..BrokerConfig::default()
    });
    let mut client = Client::spawn(&engine);
    client.tx.as_ref().unwrap().send(vec![b'x'; 64]).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), &mut client.task)
        .await
        .unwrap()
        .unwrap();
    assert!(matches!(result, Err(ConnectionError::FrameTooLarge { .. })));
}

/// Accepts frames but never finishes a write
struct StalledIo {
    inbound: mpsc::UnboundedReceiver<Vec<u8>>,
}

#[async_trait]
impl FrameIo for StalledIo {
    async fn fill(&mut self, decoder: &mut Decoder) -> std::io::Result<bool> {
        match self.inbound.recv().await {
            Some(data) => {
                decoder.extend(&data);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    async fn send(&mut self, _frames: &[String]) -> std::io::Result<()> {
        std::future::pending().await
    }

    async fn close(&mut self) {}
}

#[tokio::test]
async fn test_stalled_write_ends_connection() {
    let engine = engine_with(BrokerConfig {
        timeout: Duration::from_millis(200),
        ..BrokerConfig::default()
    });
    let (tx, inbound) = mpsc::unbounded_channel();
    let (_shutdown, shutdown_rx) = broadcast::channel(1);
    let remote = RemoteInfo::new("127.0.0.1:6001".parse().unwrap(), Transport::Socket);
    let mut conn = Connection::new(StalledIo { inbound }, remote, engine.clone());
    let task = tokio::spawn(async move { conn.run(shutdown_rx).await });

    let mut frame = json!({"conn": {"at": "t", "cl": "slow"}}).to_string().into_bytes();
    frame.push(0);
    tx.send(frame).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(2), task)
        .await
        .expect("stalled connection was not dropped")
        .unwrap();
    match result {
        Err(ConnectionError::Io(e)) => assert_eq!(e.kind(), std::io::ErrorKind::TimedOut),
        other => panic!("unexpected result: {:?}", other),
    }
    assert!(!engine.is_registered("slow"));
}

#[test]
fn test_decode_error_conversion() {
    let err: ConnectionError = DecodeError::FrameTooLarge { size: 20, max: 10 }.into();
    assert!(matches!(err, ConnectionError::FrameTooLarge { size: 20, max: 10 }));
}
