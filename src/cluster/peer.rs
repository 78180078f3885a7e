//! Cluster Peer
//!
//! Outbound link to another node. Relay traffic for that node is queued
//! on a command channel and written by a connection task that reconnects
//! with exponential backoff.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use bytes::Bytes;
use parking_lot::RwLock;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::relay::{is_global_topic, RelayError};

use super::protocol::{
    frame_message, read_message, spawn_reader, ClusterMessage, CLUSTER_PROTOCOL_VERSION,
};

/// Callback for relay traffic received from a cluster peer: (topic, payload, origin node)
pub type ClusterInboundCallback = Arc<dyn Fn(String, Bytes, String) + Send + Sync>;

/// Status of a peer link
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    Disconnected,
    Connecting,
    Connected,
    /// Connection failed, backing off before retry
    Backoff,
}

/// Commands sent to the peer connection task
#[derive(Debug)]
enum PeerCommand {
    Relay {
        topic: String,
        payload: Bytes,
        origin: String,
    },
    Shutdown,
}

/// A connection to another cluster node
pub struct ClusterPeer {
    node_id: String,
    peer_addr: SocketAddr,
    status: Arc<RwLock<PeerStatus>>,
    command_tx: mpsc::Sender<PeerCommand>,
    /// Relay topics the remote node listens on
    interest: Arc<RwLock<AHashSet<String>>>,
}

impl ClusterPeer {
    /// Spawn the connection task for a discovered node
    pub fn spawn(
        node_id: String,
        peer_addr: SocketAddr,
        local_node_id: String,
        inbound_callback: ClusterInboundCallback,
    ) -> Arc<Self> {
        let (command_tx, command_rx) = mpsc::channel(1000);
        let status = Arc::new(RwLock::new(PeerStatus::Disconnected));
        let interest = Arc::new(RwLock::new(AHashSet::new()));

        let link = PeerLink {
            node_id: node_id.clone(),
            local_node_id,
            peer_addr,
            status: status.clone(),
            interest: interest.clone(),
            inbound_callback,
        };
        tokio::spawn(link.connection_loop(command_rx));

        Arc::new(Self {
            node_id,
            peer_addr,
            status,
            command_tx,
            interest,
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn status(&self) -> PeerStatus {
        *self.status.read()
    }

    /// Replace the remote interest set (from gossip or an `Interest` message)
    pub fn set_interest(&self, topics: Vec<String>) {
        let mut interest = self.interest.write();
        interest.clear();
        interest.extend(topics);
    }

    /// Whether relay traffic on `topic` should go to this node
    pub fn wants(&self, topic: &str) -> bool {
        is_global_topic(topic) || self.interest.read().contains(topic)
    }

    pub async fn forward(
        &self,
        topic: &str,
        payload: Bytes,
        origin: &str,
    ) -> Result<(), RelayError> {
        self.command_tx
            .try_send(PeerCommand::Relay {
                topic: topic.to_string(),
                payload,
                origin: origin.to_string(),
            })
            .map_err(|e| RelayError::Transport(format!("peer '{}': {}", self.node_id, e)))
    }

    pub async fn stop(&self) {
        let _ = self.command_tx.send(PeerCommand::Shutdown).await;
        info!("ClusterPeer '{}': Stopped", self.node_id);
    }
}

/// State owned by the connection task
struct PeerLink {
    node_id: String,
    local_node_id: String,
    peer_addr: SocketAddr,
    status: Arc<RwLock<PeerStatus>>,
    interest: Arc<RwLock<AHashSet<String>>>,
    inbound_callback: ClusterInboundCallback,
}

impl PeerLink {
    /// Run the connection loop with reconnection
    async fn connection_loop(self, mut command_rx: mpsc::Receiver<PeerCommand>) {
        let mut retry_interval = Duration::from_secs(1);
        let max_retry = Duration::from_secs(30);

        loop {
            *self.status.write() = PeerStatus::Connecting;
            debug!("ClusterPeer '{}': Connecting to {}", self.node_id, self.peer_addr);

            match self.connect_and_run(&mut command_rx, &mut retry_interval).await {
                Ok(()) => {
                    info!("ClusterPeer '{}': Disconnected gracefully", self.node_id);
                    *self.status.write() = PeerStatus::Disconnected;
                    return;
                }
                Err(e) => {
                    warn!("ClusterPeer '{}': Connection failed: {}", self.node_id, e);
                    *self.status.write() = PeerStatus::Backoff;

                    let backoff = tokio::time::sleep(retry_interval);
                    tokio::pin!(backoff);
                    loop {
                        tokio::select! {
                            _ = &mut backoff => break,
                            cmd = command_rx.recv() => {
                                if matches!(cmd, None | Some(PeerCommand::Shutdown)) {
                                    *self.status.write() = PeerStatus::Disconnected;
                                    return;
                                }
                                // Relay traffic is dropped while the link is down.
                                // QoS 1 deliveries stay in the pending-ack table.
                            }
                        }
                    }
                    retry_interval = std::cmp::min(retry_interval * 2, max_retry);
                }
            }
        }
    }

    /// Connect to the peer and run the message loop
    async fn connect_and_run(
        &self,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
        retry_interval: &mut Duration,
    ) -> Result<(), RelayError> {
        let stream = tokio::time::timeout(
            Duration::from_secs(10),
            TcpStream::connect(self.peer_addr),
        )
        .await
        .map_err(|_| RelayError::Transport("connect timed out".to_string()))?
        .map_err(|e| RelayError::Transport(e.to_string()))?;
        let _ = stream.set_nodelay(true);

        let (mut read_half, mut write_half) = stream.into_split();

        let hello = ClusterMessage::Hello {
            node_id: self.local_node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_frame(&mut write_half, &hello).await?;

        let ack = tokio::time::timeout(Duration::from_secs(10), read_message(&mut read_half))
            .await
            .map_err(|_| RelayError::Transport("handshake timed out".to_string()))??;
        match ack {
            ClusterMessage::HelloAck { node_id, version } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RelayError::Transport(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                info!("ClusterPeer '{}': Connected (peer_id={})", self.node_id, node_id);
            }
            other => {
                return Err(RelayError::Transport(format!(
                    "Expected HelloAck, got {}",
                    other.type_name()
                )));
            }
        }

        *self.status.write() = PeerStatus::Connected;
        *retry_interval = Duration::from_secs(1);

        let (mut incoming, reader) = spawn_reader(read_half);
        let result = self
            .message_loop(&mut incoming, &mut write_half, command_rx)
            .await;
        reader.abort();
        result
    }

    async fn message_loop(
        &self,
        incoming: &mut mpsc::Receiver<ClusterMessage>,
        write_half: &mut tokio::net::tcp::OwnedWriteHalf,
        command_rx: &mut mpsc::Receiver<PeerCommand>,
    ) -> Result<(), RelayError> {
        let mut ping_timer = tokio::time::interval(Duration::from_secs(15));
        ping_timer.reset();

        loop {
            tokio::select! {
                cmd = command_rx.recv() => {
                    match cmd {
                        Some(PeerCommand::Relay { topic, payload, origin }) => {
                            let msg = ClusterMessage::Relay {
                                topic,
                                payload: payload.to_vec(),
                                origin,
                            };
                            if let Err(e) = write_frame(write_half, &msg).await {
                                error!("ClusterPeer '{}': TCP write error: {}", self.node_id, e);
                                return Err(e);
                            }
                        }
                        Some(PeerCommand::Shutdown) | None => {
                            let _ = write_frame(write_half, &ClusterMessage::Goodbye).await;
                            return Ok(());
                        }
                    }
                }

                msg = incoming.recv() => {
                    let Some(msg) = msg else {
                        return Err(RelayError::Transport("Connection closed".to_string()));
                    };
                    match msg {
                        ClusterMessage::Relay { topic, payload, origin } => {
                            (self.inbound_callback)(topic, Bytes::from(payload), origin);
                        }
                        ClusterMessage::Interest { topics } => {
                            debug!(
                                "ClusterPeer '{}': Interest update ({} topics)",
                                self.node_id,
                                topics.len()
                            );
                            let mut interest = self.interest.write();
                            interest.clear();
                            interest.extend(topics);
                        }
                        ClusterMessage::Ping => {
                            write_frame(write_half, &ClusterMessage::Pong).await?;
                        }
                        ClusterMessage::Pong => {
                            debug!("ClusterPeer '{}': Pong received", self.node_id);
                        }
                        ClusterMessage::Goodbye => {
                            info!("ClusterPeer '{}': Received Goodbye", self.node_id);
                            return Err(RelayError::Transport("Peer disconnected".to_string()));
                        }
                        other => {
                            debug!(
                                "ClusterPeer '{}': Ignoring {}",
                                self.node_id,
                                other.type_name()
                            );
                        }
                    }
                }

                _ = ping_timer.tick() => {
                    write_frame(write_half, &ClusterMessage::Ping).await?;
                }
            }
        }
    }
}

pub(super) async fn write_frame<W>(writer: &mut W, msg: &ClusterMessage) -> Result<(), RelayError>
where
    W: tokio::io::AsyncWrite + Unpin,
{
    let frame = frame_message(msg)?;
    writer
        .write_all(&frame)
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))
}
