//! Shared broker state and delivery.
//!
//! The engine owns the peer registry (client id to live connection), talks
//! to the store and the relay, and implements the operations every
//! connection and the public [`Broker`](super::Broker) API share: session
//! registration and teardown, publish fanout, local delivery, retained and
//! pending dispatch.

use std::sync::{Arc, Weak};

use async_trait::async_trait;
use dashmap::DashMap;
use serde_json::Value;
use tracing::{debug, error, warn};

use super::{BrokerConfig, SendError, SharedWriter};
use crate::hooks::{Capabilities, RemoteInfo};
use crate::persistence::{now_millis, PendingPublish, Presence, RetainedMessage, StorageBackend};
use crate::protocol::{ChannelKind, ConnAck, Packet, Push, QoS, StatusCode};
use crate::relay::{Relay, RelayHandler, RelayedPublish};

/// A live connection as seen from the registry
#[derive(Clone)]
pub(crate) struct Peer {
    pub(crate) writer: Arc<SharedWriter>,
    pub(crate) remote: RemoteInfo,
}

/// Why a registered session is being torn down
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Retire {
    /// The client sent `disconn`
    Graceful,
    /// Transport failure or inactivity timeout
    Lost,
    /// A newer session for the same client id took over
    Evicted,
    /// The same connection sent another `conn`
    Reconnect,
}

pub(crate) struct Engine {
    config: BrokerConfig,
    caps: Capabilities,
    store: Arc<dyn StorageBackend>,
    relay: Option<Arc<Relay>>,
    peers: DashMap<Arc<str>, Peer>,
    /// Serializes registration against teardown
    session_lock: tokio::sync::Mutex<()>,
}

impl Engine {
    pub(crate) fn new(
        config: BrokerConfig,
        caps: Capabilities,
        store: Arc<dyn StorageBackend>,
        relay: Option<Arc<Relay>>,
    ) -> Self {
        Self {
            config,
            caps,
            store,
            relay,
            peers: DashMap::new(),
            session_lock: tokio::sync::Mutex::new(()),
        }
    }

    pub(crate) fn config(&self) -> &BrokerConfig {
        &self.config
    }

    pub(crate) fn capabilities(&self) -> &Capabilities {
        &self.caps
    }

    pub(crate) fn store(&self) -> &Arc<dyn StorageBackend> {
        &self.store
    }

    pub(crate) fn instance_id(&self) -> &str {
        &self.config.instance_id
    }

    /// Adapter handed to the relay reader
    pub(crate) fn relay_handler(self: &Arc<Self>) -> Arc<dyn RelayHandler> {
        Arc::new(RelayBridge(Arc::downgrade(self)))
    }

    pub(crate) fn is_registered(&self, client_id: &str) -> bool {
        self.peers.contains_key(client_id)
    }

    pub(crate) fn peer_count(&self) -> usize {
        self.peers.len()
    }

    /// Writers of every registered session
    pub(crate) fn writers(&self) -> Vec<Arc<SharedWriter>> {
        self.peers.iter().map(|p| p.writer.clone()).collect()
    }

    // ========================================================================
    // Session lifecycle
    // ========================================================================

    /// Make `writer` the live session of `client_id`.
    ///
    /// Evicts an older local session, clears non-persistent subscriptions
    /// left by earlier sessions and records presence. On success the
    /// connAck is queued before the peer becomes visible to deliveries, so
    /// it always precedes the first push.
    pub(crate) async fn register(
        &self,
        client_id: Arc<str>,
        writer: Arc<SharedWriter>,
        remote: RemoteInfo,
    ) -> StatusCode {
        let _guard = self.session_lock.lock().await;

        if !writer.is_alive() {
            return StatusCode::NetworkError;
        }

        if let Some((_, old)) = self.peers.remove(client_id.as_ref()) {
            debug!("Evicting previous session of {}", client_id);
            self.retire(&client_id, old, Retire::Evicted).await;
        }

        if let Err(e) = self.drop_temporary_subscriptions(&client_id).await {
            error!("Failed to clear subscriptions of {}: {}", client_id, e);
            return StatusCode::ServerError;
        }

        let presence = Presence {
            client_id: client_id.to_string(),
            transport: remote.transport.as_str().to_string(),
            addr: remote.addr.to_string(),
            instance_id: self.config.instance_id.clone(),
            connected_at: now_millis(),
        };
        if let Err(e) = self.store.upsert_presence(&presence).await {
            error!("Failed to record presence of {}: {}", client_id, e);
            return StatusCode::ServerError;
        }

        let ack = Packet::ConnAck(ConnAck {
            status: StatusCode::Ok,
            timeout: self.config.timeout.as_secs(),
        });
        if writer.send_packet(&ack).is_err() {
            let _ = self.store.remove_presence(&client_id).await;
            return StatusCode::NetworkError;
        }

        self.peers.insert(
            client_id.clone(),
            Peer {
                writer,
                remote,
            },
        );

        if let Some(relay) = &self.relay {
            if let Err(e) = relay.claim_client(&client_id).await {
                warn!("Relay claim for {} failed: {}", client_id, e);
            }
            if let Err(e) = relay.announce_online(&presence).await {
                warn!("Relay presence for {} failed: {}", client_id, e);
            }
        }

        StatusCode::Ok
    }

    /// Tear down `client_id` if `writer` is still its registered session
    pub(crate) async fn teardown(&self, client_id: &str, writer: &Arc<SharedWriter>, reason: Retire) {
        let _guard = self.session_lock.lock().await;

        let removed = self
            .peers
            .remove_if(client_id, |_, peer| Arc::ptr_eq(&peer.writer, writer));
        match removed {
            Some((_, peer)) => self.retire(client_id, peer, reason).await,
            None => {
                if reason == Retire::Graceful {
                    writer.close();
                }
            }
        }
    }

    /// Drop the local session of a client that connected elsewhere
    pub(crate) async fn evict(&self, client_id: &str) {
        let _guard = self.session_lock.lock().await;
        if let Some((_, peer)) = self.peers.remove(client_id) {
            debug!("Client {} connected on another instance", client_id);
            self.retire(client_id, peer, Retire::Evicted).await;
        }
    }

    async fn retire(&self, client_id: &str, peer: Peer, reason: Retire) {
        if reason != Retire::Reconnect {
            peer.writer.close();
        }

        if let Some(relay) = &self.relay {
            if let Err(e) = relay.release_client(client_id).await {
                warn!("Relay release for {} failed: {}", client_id, e);
            }
        }

        if reason != Retire::Evicted {
            if let Err(e) = self.drop_temporary_subscriptions(client_id).await {
                error!("Failed to clear subscriptions of {}: {}", client_id, e);
            }
        }
        if self.drop_own_presence(client_id).await {
            if let Some(relay) = &self.relay {
                if let Err(e) = relay.announce_offline(client_id).await {
                    warn!("Relay presence for {} failed: {}", client_id, e);
                }
            }
        }

        if reason == Retire::Reconnect {
            return;
        }

        let caps = self.caps.clone();
        let id = client_id.to_string();
        let remote = peer.remote;
        tokio::spawn(async move {
            caps.connection_close.on_connection_close(&id, &remote).await;
            if reason == Retire::Graceful {
                caps.disconnect.on_disconnect(&id, &remote).await;
            }
        });
    }

    async fn drop_temporary_subscriptions(
        &self,
        client_id: &str,
    ) -> crate::persistence::Result<()> {
        let removed = self.store.remove_non_persistent(client_id).await?;
        for channel in removed {
            self.announce_unsubscribe(client_id, &channel).await;
        }
        Ok(())
    }

    /// Remove presence unless another instance has recorded the client since
    async fn drop_own_presence(&self, client_id: &str) -> bool {
        self.drop_presence_of(client_id, &self.config.instance_id).await
    }

    /// Remove the presence of `client_id` if `instance_id` still holds it
    async fn drop_presence_of(&self, client_id: &str, instance_id: &str) -> bool {
        match self.store.get_presence(client_id).await {
            Ok(Some(p)) if p.instance_id == instance_id => {
                match self.store.remove_presence(client_id).await {
                    Ok(()) => true,
                    Err(e) => {
                        error!("Failed to remove presence of {}: {}", client_id, e);
                        false
                    }
                }
            }
            Ok(_) => false,
            Err(e) => {
                error!("Failed to read presence of {}: {}", client_id, e);
                false
            }
        }
    }

    // ========================================================================
    // Subscriptions
    // ========================================================================

    pub(crate) async fn subscribe(&self, client_id: &str, channel: &str, persistent: bool) -> StatusCode {
        if let Err(e) = self
            .store
            .insert_subscription(client_id, channel, persistent)
            .await
        {
            error!("Failed to subscribe {} to {}: {}", client_id, channel, e);
            return StatusCode::ServerError;
        }
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.announce_subscribe(client_id, channel, persistent).await {
                warn!("Relay subscribe announcement failed: {}", e);
            }
        }
        StatusCode::Ok
    }

    pub(crate) async fn unsubscribe(&self, client_id: &str, channel: &str) -> StatusCode {
        if let Err(e) = self.store.remove_subscription(client_id, channel).await {
            error!("Failed to unsubscribe {} from {}: {}", client_id, channel, e);
            return StatusCode::ServerError;
        }
        self.announce_unsubscribe(client_id, channel).await;
        StatusCode::Ok
    }

    async fn announce_unsubscribe(&self, client_id: &str, channel: &str) {
        if let Some(relay) = &self.relay {
            if let Err(e) = relay.announce_unsubscribe(client_id, channel).await {
                warn!("Relay unsubscribe announcement failed: {}", e);
            }
        }
    }

    /// `(channel, persistent)` pairs of a client
    pub(crate) async fn subscriptions(&self, client_id: &str) -> Vec<(String, bool)> {
        match self.store.subscriptions_by_client(client_id).await {
            Ok(subs) => subs.into_iter().map(|s| (s.channel, s.persistent)).collect(),
            Err(e) => {
                error!("Failed to list subscriptions of {}: {}", client_id, e);
                Vec::new()
            }
        }
    }

    // ========================================================================
    // Publish
    // ========================================================================

    /// Fan a publish out to every subscriber of `channel` except the sender.
    ///
    /// Control channels never reach this point; their subscriptions are never
    /// stored.
    pub(crate) async fn publish(
        &self,
        sender: &str,
        channel: &str,
        data: &Value,
        qos: QoS,
        retain: bool,
    ) -> StatusCode {
        let kind = ChannelKind::of(channel);

        let recipients: Vec<String> = match self.store.subscribers(channel).await {
            Ok(subs) => subs
                .into_iter()
                .map(|s| s.client_id)
                .filter(|c| c != sender)
                .collect(),
            Err(e) => {
                error!("Failed to load subscribers of {}: {}", channel, e);
                return StatusCode::ServerError;
            }
        };

        if kind == ChannelKind::PeerToPeer && !self.any_present(&recipients).await {
            return StatusCode::ClientOffline;
        }

        let payload = data.to_string();
        let packet_id = uuid::Uuid::new_v4().to_string();

        if qos == QoS::AtLeastOnce && !recipients.is_empty() {
            let pending = PendingPublish {
                packet_id: packet_id.clone(),
                channel: channel.to_string(),
                sender: sender.to_string(),
                payload: payload.clone(),
                created_at: now_millis(),
            };
            if let Err(e) = self.store.insert_packet(&pending).await {
                error!("Failed to store pending packet {}: {}", packet_id, e);
                return StatusCode::ServerError;
            }
            for recipient in &recipients {
                if let Err(e) = self
                    .store
                    .insert_pending_ack(recipient, &packet_id, channel)
                    .await
                {
                    error!("Failed to queue {} for {}: {}", packet_id, recipient, e);
                }
            }
        }

        if retain && kind == ChannelKind::Plain {
            let retained = RetainedMessage {
                channel: channel.to_string(),
                sender: sender.to_string(),
                payload: payload.clone(),
                updated_at: now_millis(),
            };
            if let Err(e) = self.store.upsert_retained(&retained).await {
                error!("Failed to retain message on {}: {}", channel, e);
            }
        }

        for recipient in recipients {
            self.route(RelayedPublish {
                recipient,
                channel: channel.to_string(),
                sender: sender.to_string(),
                payload: payload.clone(),
                qos: qos as u8,
                packet_id: packet_id.clone(),
            })
            .await;
        }

        StatusCode::Ok
    }

    async fn any_present(&self, clients: &[String]) -> bool {
        for client in clients {
            match self.store.has_presence(client).await {
                Ok(true) => return true,
                Ok(false) => {}
                Err(e) => error!("Failed to read presence of {}: {}", client, e),
            }
        }
        false
    }

    /// With a relay every push takes the relay path, even for local recipients
    async fn route(&self, publish: RelayedPublish) {
        match &self.relay {
            Some(relay) => {
                let recipient = publish.recipient.clone();
                if let Err(e) = relay.publish(publish).await {
                    warn!("Relay publish to {} failed: {}", recipient, e);
                }
            }
            None => self.deliver_local(publish).await,
        }
    }

    /// Push to a locally held recipient that is still subscribed
    pub(crate) async fn deliver_local(&self, publish: RelayedPublish) {
        let Some(writer) = self
            .peers
            .get(publish.recipient.as_str())
            .map(|p| p.writer.clone())
        else {
            return;
        };

        match self
            .store
            .has_subscription(&publish.recipient, &publish.channel)
            .await
        {
            Ok(true) => {}
            Ok(false) => return,
            Err(e) => {
                error!("Failed to check subscription of {}: {}", publish.recipient, e);
                return;
            }
        }

        let data: Value = match serde_json::from_str(&publish.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping push with unreadable payload: {}", e);
                return;
            }
        };
        let qos = QoS::from_u8(publish.qos).unwrap_or_default();
        let push = Push {
            channel: publish.channel,
            data,
            sender: publish.sender,
            packet_id: (qos == QoS::AtLeastOnce).then_some(publish.packet_id),
            qos,
            retain: false,
        };
        match writer.send_packet(&Packet::Push(push)) {
            Ok(()) => {}
            Err(SendError::QueueFull) => {
                warn!("Dropping {}: outbound queue full", publish.recipient);
            }
            Err(e) => debug!("Push to {} not queued: {}", publish.recipient, e),
        }
    }

    // ========================================================================
    // Retained and pending dispatch
    // ========================================================================

    /// Push the retained messages of `channels`, flagged `rt`, at QoS 0
    pub(crate) async fn send_retained(&self, writer: &SharedWriter, channels: &[String]) {
        let retained = match self.store.retained_for(channels).await {
            Ok(retained) => retained,
            Err(e) => {
                error!("Failed to load retained messages: {}", e);
                return;
            }
        };
        for message in retained {
            let data: Value = match serde_json::from_str(&message.payload) {
                Ok(data) => data,
                Err(e) => {
                    warn!("Skipping unreadable retained message on {}: {}", message.channel, e);
                    continue;
                }
            };
            let push = Push {
                channel: message.channel,
                data,
                sender: message.sender,
                packet_id: None,
                qos: QoS::AtMostOnce,
                retain: true,
            };
            if writer.send_packet(&Packet::Push(push)).is_err() {
                return;
            }
        }
    }

    /// Unacknowledged packet ids of a client, oldest first
    pub(crate) async fn pending_ids(&self, client_id: &str) -> Vec<String> {
        self.store.pending_ids(client_id).await.unwrap_or_else(|e| {
            error!("Failed to load pending packets of {}: {}", client_id, e);
            Vec::new()
        })
    }

    /// Push a stored QoS 1 packet again.
    ///
    /// Returns false, and drops the ack row, when the packet is gone or the
    /// client no longer subscribes to its channel.
    pub(crate) async fn redeliver(&self, client_id: &str, packet_id: &str, writer: &SharedWriter) -> bool {
        let packet = match self.store.get_packet(packet_id).await {
            Ok(packet) => packet,
            Err(e) => {
                error!("Failed to load pending packet {}: {}", packet_id, e);
                return false;
            }
        };

        let deliverable = match &packet {
            Some(p) => self
                .store
                .has_subscription(client_id, &p.channel)
                .await
                .unwrap_or(false),
            None => false,
        };
        let (Some(packet), true) = (packet, deliverable) else {
            self.acknowledge(client_id, packet_id).await;
            return false;
        };

        let data: Value = match serde_json::from_str(&packet.payload) {
            Ok(data) => data,
            Err(e) => {
                warn!("Dropping unreadable pending packet {}: {}", packet_id, e);
                self.acknowledge(client_id, packet_id).await;
                return false;
            }
        };
        let push = Push {
            channel: packet.channel,
            data,
            sender: packet.sender,
            packet_id: Some(packet.packet_id),
            qos: QoS::AtLeastOnce,
            retain: false,
        };
        writer.send_packet(&Packet::Push(push)).is_ok()
    }

    pub(crate) async fn acknowledge(&self, client_id: &str, packet_id: &str) {
        if let Err(e) = self.store.remove_pending_ack(client_id, packet_id).await {
            error!("Failed to acknowledge {} for {}: {}", packet_id, client_id, e);
        }
    }
}

/// Relay callbacks, holding the engine weakly so the reader task does not keep it alive
struct RelayBridge(Weak<Engine>);

#[async_trait]
impl RelayHandler for RelayBridge {
    async fn on_relay_publish(&self, publish: RelayedPublish) {
        if let Some(engine) = self.0.upgrade() {
            engine.deliver_local(publish).await;
        }
    }

    async fn on_relay_disconnect(&self, client_id: String) {
        if let Some(engine) = self.0.upgrade() {
            engine.evict(&client_id).await;
        }
    }

    async fn on_relay_subscribe(&self, client_id: String, channel: String, persistent: bool) {
        if let Some(engine) = self.0.upgrade() {
            if let Err(e) = engine
                .store
                .insert_subscription(&client_id, &channel, persistent)
                .await
            {
                error!("Failed to apply relayed subscription: {}", e);
            }
        }
    }

    async fn on_relay_unsubscribe(&self, client_id: String, channel: String) {
        if let Some(engine) = self.0.upgrade() {
            if let Err(e) = engine.store.remove_subscription(&client_id, &channel).await {
                error!("Failed to apply relayed unsubscription: {}", e);
            }
        }
    }

    async fn on_relay_online(&self, presence: Presence) {
        let Some(engine) = self.0.upgrade() else {
            return;
        };
        // A local session is newer than whatever the relay still carries
        let _guard = engine.session_lock.lock().await;
        if engine.is_registered(&presence.client_id) {
            return;
        }
        if let Err(e) = engine.store.upsert_presence(&presence).await {
            error!("Failed to apply relayed presence: {}", e);
        }
    }

    async fn on_relay_offline(&self, client_id: String, instance_id: String) {
        if let Some(engine) = self.0.upgrade() {
            let _guard = engine.session_lock.lock().await;
            engine.drop_presence_of(&client_id, &instance_id).await;
        }
    }
}
