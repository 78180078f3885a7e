//! Broker API tests

use super::*;
use crate::hooks::AllowAll;
use crate::persistence::Presence;
use pretty_assertions::assert_eq;
use serde_json::json;

async fn broker_with_store(store: Arc<dyn StorageBackend>) -> Broker {
    let config = BrokerConfig {
        bind: "127.0.0.1:0".parse().unwrap(),
        ..Default::default()
    };
    Broker::with_backends(config, AllowAll::new().capabilities(), store, None)
        .await
        .unwrap()
}

#[test]
fn test_from_config_maps_sections() {
    let config = Config::parse(
        r#"
        [server]
        bind = "127.0.0.1:4100"
        ws_bind = "127.0.0.1:4101"

        [session]
        timeout = "45s"
        auto_p2p_channel = true

        [limits]
        max_frame_size = 4096
        max_connections = 10

        [relay]
        instance_id = "node-a"
        "#,
    )
    .unwrap();

    let broker_config = BrokerConfig::from_config(&config);
    assert_eq!(broker_config.bind, "127.0.0.1:4100".parse().unwrap());
    assert_eq!(broker_config.ws_bind, Some("127.0.0.1:4101".parse().unwrap()));
    assert_eq!(broker_config.tls_bind, None);
    assert_eq!(broker_config.timeout, Duration::from_secs(45));
    assert!(broker_config.auto_p2p_channel);
    assert_eq!(broker_config.max_frame_size, 4096);
    assert_eq!(broker_config.max_connections, 10);
    assert_eq!(broker_config.instance_id, "node-a");
}

#[test]
fn test_default_instance_ids_differ() {
    assert_ne!(
        BrokerConfig::default().instance_id,
        BrokerConfig::default().instance_id
    );
}

#[tokio::test]
async fn test_tls_listener_without_certificate_fails() {
    let config = BrokerConfig {
        tls_bind: Some("127.0.0.1:0".parse().unwrap()),
        ..Default::default()
    };
    let result = Broker::new(config, AllowAll::new().capabilities()).await;
    assert!(matches!(result, Err(BrokerError::Tls(_))));
}

#[tokio::test]
async fn test_start_clears_temporary_subscriptions() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    store.insert_subscription("alice", "news", false).await.unwrap();
    store.insert_subscription("alice", "#alice", true).await.unwrap();

    let broker = broker_with_store(store).await;
    assert_eq!(
        broker.get_subscriptions("alice").await,
        vec![("#alice".to_string(), true)]
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_force_sub_and_unsub() {
    let broker = broker_with_store(Arc::new(MemoryBackend::new())).await;

    assert_eq!(broker.force_sub("bob", "#bob", true).await, StatusCode::Ok);
    assert_eq!(broker.force_sub("bob", " news ", false).await, StatusCode::Ok);
    assert_eq!(
        broker.force_sub("bob", "$mySubscriptions", false).await,
        StatusCode::NotAllowed
    );
    assert_eq!(broker.force_sub("bob", "  ", false).await, StatusCode::InvalidChannel);

    let mut subs = broker.get_subscriptions("bob").await;
    subs.sort();
    assert_eq!(
        subs,
        vec![("#bob".to_string(), true), ("news".to_string(), false)]
    );

    assert_eq!(broker.force_unsub("bob", "news").await, StatusCode::Ok);
    assert_eq!(broker.force_unsub("bob", "#").await, StatusCode::InvalidChannel);
    assert_eq!(
        broker.get_subscriptions("bob").await,
        vec![("#bob".to_string(), true)]
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_force_pub_rejections() {
    let broker = broker_with_store(Arc::new(MemoryBackend::new())).await;

    assert_eq!(
        broker.force_pub("$", &json!({}), QoS::AtMostOnce, false).await,
        StatusCode::InvalidChannel
    );
    assert_eq!(
        broker
            .force_pub("$restart", &json!({}), QoS::AtMostOnce, false)
            .await,
        StatusCode::NotAllowed
    );
    assert_eq!(
        broker
            .force_pub("#nobody", &json!({"m": 1}), QoS::AtMostOnce, false)
            .await,
        StatusCode::ClientOffline
    );
    broker.shutdown().await;
}

#[tokio::test]
async fn test_force_pub_retains_and_queues() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let broker = broker_with_store(store.clone()).await;
    broker.force_sub("carol", "alerts", true).await;

    let status = broker
        .force_pub("alerts", &json!({"level": "high"}), QoS::AtLeastOnce, true)
        .await;
    assert_eq!(status, StatusCode::Ok);

    let retained = store.retained_for(&["alerts".to_string()]).await.unwrap();
    assert_eq!(retained.len(), 1);
    assert_eq!(retained[0].sender, "");

    // carol is offline, so the packet waits for her
    assert_eq!(store.pending_ids("carol").await.unwrap().len(), 1);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_is_connected_checks_presence() {
    let store: Arc<dyn StorageBackend> = Arc::new(MemoryBackend::new());
    let broker = broker_with_store(store.clone()).await;
    assert!(!broker.is_connected("dave").await);

    store
        .upsert_presence(&Presence {
            client_id: "dave".to_string(),
            transport: "socket".to_string(),
            addr: "10.0.0.2:5000".to_string(),
            instance_id: "elsewhere".to_string(),
            connected_at: 1,
        })
        .await
        .unwrap();
    assert!(broker.is_connected("dave").await);
    assert_eq!(broker.local_client_count(), 0);
    broker.shutdown().await;
}

#[tokio::test]
async fn test_run_returns_after_shutdown() {
    let broker = Arc::new(broker_with_store(Arc::new(MemoryBackend::new())).await);

    let runner = broker.clone();
    let handle = tokio::spawn(async move { runner.run().await });
    tokio::time::sleep(Duration::from_millis(50)).await;

    broker.shutdown().await;
    let result = tokio::time::timeout(Duration::from_secs(2), handle)
        .await
        .expect("run did not stop")
        .unwrap();
    assert!(result.is_ok());
    assert_eq!(broker.connection_count(), 0);
}

#[tokio::test]
async fn test_bind_failure_is_reported() {
    let taken = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = taken.local_addr().unwrap();

    let config = BrokerConfig {
        bind: addr,
        ..Default::default()
    };
    let broker = Broker::new(config, AllowAll::new().capabilities())
        .await
        .unwrap();
    let result = broker.run().await;
    assert!(matches!(result, Err(BrokerError::Bind { .. })));
    broker.shutdown().await;
}
