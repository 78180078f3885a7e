//! Distribution Relay
//!
//! Lets several broker processes share one logical view of subscriptions
//! and presence while each holds its own set of live connections.
//!
//! Every connected client gets two relay topics on the instance that
//! holds it: `JMQTPub_<client>` carries publishes addressed to the client
//! and `JMQTDisc_<client>` tells other instances to drop their copy of
//! the session. Two global topics propagate subscription changes and a
//! third carries presence, so instances with private stores still agree on
//! who is online.
//!
//! The relay does not move bytes itself; a [`RelayTransport`] does.
//! [`LocalBus`] connects brokers inside one process and
//! [`ClusterTransport`](crate::cluster::ClusterTransport) connects them
//! over the network.

mod local;


pub use local::{LocalBus, LocalTransport};

use std::fmt;
use std::sync::Arc;

use ahash::AHashSet;
use async_trait::async_trait;
use bincode::{Decode, Encode};
use bytes::Bytes;
use parking_lot::Mutex;
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::persistence::Presence;

/// Global topic carrying subscription inserts
pub const SUBSCRIBE_TOPIC: &str = "JMQTSub";

/// Global topic carrying subscription removals
pub const UNSUBSCRIBE_TOPIC: &str = "JMQTUnsub";

/// Global topic carrying presence changes
pub const PRESENCE_TOPIC: &str = "JMQTPresence";

/// Topic on which publishes addressed to `client_id` travel
pub fn publish_topic(client_id: &str) -> String {
    format!("JMQTPub_{}", client_id)
}

/// Topic on which a new session for `client_id` evicts older ones
pub fn disconnect_topic(client_id: &str) -> String {
    format!("JMQTDisc_{}", client_id)
}

/// Whether a topic is delivered to every instance
pub fn is_global_topic(topic: &str) -> bool {
    topic == SUBSCRIBE_TOPIC || topic == UNSUBSCRIBE_TOPIC || topic == PRESENCE_TOPIC
}

/// Relay error types
#[derive(Debug)]
pub enum RelayError {
    Encode(String),
    Decode(String),
    /// The transport could not carry the message
    Transport(String),
    /// The relay or its transport was shut down
    Closed,
}

impl fmt::Display for RelayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelayError::Encode(e) => write!(f, "relay encode error: {}", e),
            RelayError::Decode(e) => write!(f, "relay decode error: {}", e),
            RelayError::Transport(e) => write!(f, "relay transport error: {}", e),
            RelayError::Closed => write!(f, "relay closed"),
        }
    }
}

impl std::error::Error for RelayError {}

/// Messages exchanged between broker instances
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum RelayMessage {
    /// Deliver a push to `recipient`
    Publish {
        recipient: String,
        channel: String,
        sender: String,
        /// Application data as JSON text
        payload: String,
        qos: u8,
        packet_id: String,
    },
    /// `client_id` connected on `instance_id`; everybody else drops it
    Disconnect {
        client_id: String,
        instance_id: String,
    },
    Subscribe {
        client_id: String,
        channel: String,
        persistent: bool,
        instance_id: String,
    },
    Unsubscribe {
        client_id: String,
        channel: String,
        instance_id: String,
    },
    /// The instance named in `presence` now holds the client
    Online { presence: Presence },
    /// `instance_id` no longer holds `client_id`
    Offline {
        client_id: String,
        instance_id: String,
    },
}

impl RelayMessage {
    pub fn encode(&self) -> Result<Bytes, RelayError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map(Bytes::from)
            .map_err(|e| RelayError::Encode(e.to_string()))
    }

    pub fn decode(data: &[u8]) -> Result<Self, RelayError> {
        bincode::decode_from_slice(data, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| RelayError::Decode(e.to_string()))
    }

    /// Relay topic the message travels on
    pub fn topic(&self) -> String {
        match self {
            RelayMessage::Publish { recipient, .. } => publish_topic(recipient),
            RelayMessage::Disconnect { client_id, .. } => disconnect_topic(client_id),
            RelayMessage::Subscribe { .. } => SUBSCRIBE_TOPIC.to_string(),
            RelayMessage::Unsubscribe { .. } => UNSUBSCRIBE_TOPIC.to_string(),
            RelayMessage::Online { .. } | RelayMessage::Offline { .. } => {
                PRESENCE_TOPIC.to_string()
            }
        }
    }
}

/// A message as it arrives from the transport
#[derive(Debug, Clone)]
pub struct RelayEnvelope {
    pub topic: String,
    pub payload: Bytes,
}

/// Topic-based pub/sub bus between broker instances
#[async_trait]
pub trait RelayTransport: Send + Sync {
    /// Send a payload to every instance subscribed to `topic`, including this one
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), RelayError>;

    async fn subscribe(&self, topic: &str) -> Result<(), RelayError>;

    async fn unsubscribe(&self, topic: &str) -> Result<(), RelayError>;

    /// Stream of messages on subscribed topics. Only the first call returns it.
    fn take_inbound(&self) -> Option<mpsc::UnboundedReceiver<RelayEnvelope>>;

    /// Release network resources
    async fn close(&self) {}
}

/// A publish relayed to the instance holding its recipient
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayedPublish {
    pub recipient: String,
    pub channel: String,
    pub sender: String,
    pub payload: String,
    pub qos: u8,
    pub packet_id: String,
}

/// Receives what other instances (and this one) put on the relay
#[async_trait]
pub trait RelayHandler: Send + Sync {
    async fn on_relay_publish(&self, publish: RelayedPublish);

    /// Another instance took over `client_id`
    async fn on_relay_disconnect(&self, client_id: String);

    async fn on_relay_subscribe(&self, client_id: String, channel: String, persistent: bool);

    async fn on_relay_unsubscribe(&self, client_id: String, channel: String);

    /// Another instance recorded `presence`
    async fn on_relay_online(&self, presence: Presence);

    /// `instance_id` dropped its session of `client_id`
    async fn on_relay_offline(&self, client_id: String, instance_id: String);
}

/// Instance-side relay endpoint
pub struct Relay {
    instance_id: String,
    transport: Arc<dyn RelayTransport>,
    /// Per-client topics this instance is subscribed to
    topics: Mutex<AHashSet<String>>,
    shutdown_tx: broadcast::Sender<()>,
    reader: Mutex<Option<JoinHandle<()>>>,
}

impl Relay {
    pub fn new(instance_id: impl Into<String>, transport: Arc<dyn RelayTransport>) -> Self {
        let (shutdown_tx, _) = broadcast::channel(1);
        Self {
            instance_id: instance_id.into(),
            transport,
            topics: Mutex::new(AHashSet::new()),
            shutdown_tx,
            reader: Mutex::new(None),
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    /// Subscribe the global topics and spawn the reader task
    pub async fn start(&self, handler: Arc<dyn RelayHandler>) -> Result<(), RelayError> {
        let inbound = self.transport.take_inbound().ok_or(RelayError::Closed)?;
        self.transport.subscribe(SUBSCRIBE_TOPIC).await?;
        self.transport.subscribe(UNSUBSCRIBE_TOPIC).await?;
        self.transport.subscribe(PRESENCE_TOPIC).await?;

        let reader = tokio::spawn(Self::reader_loop(
            self.instance_id.clone(),
            inbound,
            handler,
            self.shutdown_tx.subscribe(),
        ));
        *self.reader.lock() = Some(reader);

        info!("Relay started for instance {}", self.instance_id);
        Ok(())
    }

    /// Evict `client_id` everywhere else, then listen on its topics
    pub async fn claim_client(&self, client_id: &str) -> Result<(), RelayError> {
        let evict = RelayMessage::Disconnect {
            client_id: client_id.to_string(),
            instance_id: self.instance_id.clone(),
        };
        self.send(&evict).await?;

        for topic in [publish_topic(client_id), disconnect_topic(client_id)] {
            self.transport.subscribe(&topic).await?;
            self.topics.lock().insert(topic);
        }
        Ok(())
    }

    /// Stop listening on the client's topics
    pub async fn release_client(&self, client_id: &str) -> Result<(), RelayError> {
        for topic in [publish_topic(client_id), disconnect_topic(client_id)] {
            self.topics.lock().remove(&topic);
            self.transport.unsubscribe(&topic).await?;
        }
        Ok(())
    }

    /// Whether this instance currently listens for `client_id`
    pub fn holds_client(&self, client_id: &str) -> bool {
        self.topics.lock().contains(&publish_topic(client_id))
    }

    pub async fn publish(&self, publish: RelayedPublish) -> Result<(), RelayError> {
        self.send(&RelayMessage::Publish {
            recipient: publish.recipient,
            channel: publish.channel,
            sender: publish.sender,
            payload: publish.payload,
            qos: publish.qos,
            packet_id: publish.packet_id,
        })
        .await
    }

    pub async fn announce_subscribe(
        &self,
        client_id: &str,
        channel: &str,
        persistent: bool,
    ) -> Result<(), RelayError> {
        self.send(&RelayMessage::Subscribe {
            client_id: client_id.to_string(),
            channel: channel.to_string(),
            persistent,
            instance_id: self.instance_id.clone(),
        })
        .await
    }

    pub async fn announce_unsubscribe(
        &self,
        client_id: &str,
        channel: &str,
    ) -> Result<(), RelayError> {
        self.send(&RelayMessage::Unsubscribe {
            client_id: client_id.to_string(),
            channel: channel.to_string(),
            instance_id: self.instance_id.clone(),
        })
        .await
    }

    pub async fn announce_online(&self, presence: &Presence) -> Result<(), RelayError> {
        self.send(&RelayMessage::Online {
            presence: presence.clone(),
        })
        .await
    }

    pub async fn announce_offline(&self, client_id: &str) -> Result<(), RelayError> {
        self.send(&RelayMessage::Offline {
            client_id: client_id.to_string(),
            instance_id: self.instance_id.clone(),
        })
        .await
    }

    /// Stop the reader and close the transport
    pub async fn shutdown(&self) {
        let _ = self.shutdown_tx.send(());
        let reader = self.reader.lock().take();
        if let Some(reader) = reader {
            let _ = reader.await;
        }
        self.transport.close().await;
    }

    async fn send(&self, msg: &RelayMessage) -> Result<(), RelayError> {
        let payload = msg.encode()?;
        self.transport.publish(&msg.topic(), payload).await
    }

    async fn reader_loop(
        instance_id: String,
        mut inbound: mpsc::UnboundedReceiver<RelayEnvelope>,
        handler: Arc<dyn RelayHandler>,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) {
        loop {
            tokio::select! {
                envelope = inbound.recv() => {
                    let Some(envelope) = envelope else {
                        debug!("Relay inbound stream ended");
                        break;
                    };
                    let msg = match RelayMessage::decode(&envelope.payload) {
                        Ok(msg) => msg,
                        Err(e) => {
                            warn!("Dropping relay message on '{}': {}", envelope.topic, e);
                            continue;
                        }
                    };
                    Self::dispatch(&instance_id, msg, handler.as_ref()).await;
                }

                _ = shutdown_rx.recv() => {
                    debug!("Relay reader received shutdown signal");
                    break;
                }
            }
        }
    }

    async fn dispatch(instance_id: &str, msg: RelayMessage, handler: &dyn RelayHandler) {
        match msg {
            RelayMessage::Publish {
                recipient,
                channel,
                sender,
                payload,
                qos,
                packet_id,
            } => {
                handler
                    .on_relay_publish(RelayedPublish {
                        recipient,
                        channel,
                        sender,
                        payload,
                        qos,
                        packet_id,
                    })
                    .await;
            }
            RelayMessage::Disconnect {
                client_id,
                instance_id: origin,
            } => {
                if origin != instance_id {
                    handler.on_relay_disconnect(client_id).await;
                }
            }
            RelayMessage::Subscribe {
                client_id,
                channel,
                persistent,
                instance_id: origin,
            } => {
                if origin != instance_id {
                    handler.on_relay_subscribe(client_id, channel, persistent).await;
                }
            }
            RelayMessage::Unsubscribe {
                client_id,
                channel,
                instance_id: origin,
            } => {
                if origin != instance_id {
                    handler.on_relay_unsubscribe(client_id, channel).await;
                }
            }
            RelayMessage::Online { presence } => {
                if presence.instance_id != instance_id {
                    handler.on_relay_online(presence).await;
                }
            }
            RelayMessage::Offline {
                client_id,
                instance_id: origin,
            } => {
                if origin != instance_id {
                    handler.on_relay_offline(client_id, origin).await;
                }
            }
        }
    }
}
