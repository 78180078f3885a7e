//! Cluster Manager
//!
//! Gossip membership (chitchat over UDP) plus one TCP link per discovered
//! node. Each node gossips the relay topics it listens on so senders only
//! forward traffic to nodes that want it.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use ahash::AHashSet;
use bytes::Bytes;
use chitchat::transport::UdpTransport;
use chitchat::{
    spawn_chitchat, Chitchat, ChitchatConfig, ChitchatHandle, ChitchatId, FailureDetectorConfig,
};
use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::ClusterConfig;
use crate::relay::RelayError;

use super::peer::{write_frame, ClusterInboundCallback, ClusterPeer, PeerStatus};
use super::protocol::{read_message, spawn_reader, ClusterMessage, CLUSTER_PROTOCOL_VERSION};

/// Chitchat state keys
const KEY_PEER_ADDR: &str = "peer_addr";
const KEY_TOPICS: &str = "relay_topics";

/// Cluster manager for the networked relay
pub struct ClusterManager {
    node_id: String,
    config: ClusterConfig,
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    /// Dropping the handle stops gossip
    handle: Mutex<Option<ChitchatHandle>>,
    /// Links to other nodes, by node id
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    /// Relay topics this node listens on
    local_topics: Arc<RwLock<AHashSet<String>>>,
    /// Full topic list, pushed to nodes linked to us
    interest_tx: broadcast::Sender<Vec<String>>,
    /// Delivers inbound relay traffic for topics we listen on
    inbound_callback: ClusterInboundCallback,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl ClusterManager {
    /// Join the gossip cluster. `sink` receives relay traffic for local topics.
    pub async fn new(
        config: ClusterConfig,
        node_id: String,
        sink: ClusterInboundCallback,
    ) -> Result<Self, RelayError> {
        let gossip_advertise_addr = config.gossip_advertise();
        let peer_advertise_addr = config.peer_advertise();

        info!(
            "Starting cluster node: {} (gossip_advertise={}, peer_advertise={})",
            node_id, gossip_advertise_addr, peer_advertise_addr
        );

        let failure_detector_config = FailureDetectorConfig {
            phi_threshold: 8.0,
            initial_interval: config.gossip_interval,
            ..Default::default()
        };

        let chitchat_config = ChitchatConfig {
            chitchat_id: ChitchatId::new(node_id.clone(), 0, gossip_advertise_addr),
            cluster_id: config.cluster_id.clone(),
            gossip_interval: config.gossip_interval,
            listen_addr: config.gossip_addr,
            seed_nodes: config.seeds.clone(),
            failure_detector_config,
            marked_for_deletion_grace_period: config.dead_node_grace_period,
            catchup_callback: None,
            extra_liveness_predicate: None,
        };

        let initial_kvs = vec![
            (KEY_PEER_ADDR.to_string(), peer_advertise_addr.to_string()),
            (KEY_TOPICS.to_string(), "[]".to_string()),
        ];

        let handle = spawn_chitchat(chitchat_config, initial_kvs, &UdpTransport)
            .await
            .map_err(|e| RelayError::Transport(format!("gossip: {}", e)))?;

        let local_topics: Arc<RwLock<AHashSet<String>>> = Arc::new(RwLock::new(AHashSet::new()));
        let filter = local_topics.clone();
        let inbound_callback: ClusterInboundCallback = Arc::new(move |topic, payload, origin| {
            if filter.read().contains(&topic) {
                sink(topic, payload, origin);
            } else {
                debug!("Cluster: dropping relay for '{}' from {}", topic, origin);
            }
        });

        let (interest_tx, _) = broadcast::channel(64);
        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            node_id,
            config,
            chitchat: handle.chitchat(),
            handle: Mutex::new(Some(handle)),
            peers: Arc::new(DashMap::new()),
            local_topics,
            interest_tx,
            inbound_callback,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
        })
    }

    pub fn node_id(&self) -> &str {
        &self.node_id
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn connected_peer_count(&self) -> usize {
        self.peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected)
            .count()
    }

    pub fn is_local_topic(&self, topic: &str) -> bool {
        self.local_topics.read().contains(topic)
    }

    /// Start listening for relay links and watching gossip
    pub async fn start(&self) -> Result<(), RelayError> {
        let listener = TcpListener::bind(self.config.peer_addr)
            .await
            .map_err(|e| RelayError::Transport(format!("bind {}: {}", self.config.peer_addr, e)))?;
        info!(
            "Cluster manager listening on gossip={}, peer={}",
            self.config.gossip_addr, self.config.peer_addr
        );

        let incoming = IncomingLinks {
            local_node_id: self.node_id.clone(),
            local_topics: self.local_topics.clone(),
            interest_tx: self.interest_tx.clone(),
            inbound_callback: self.inbound_callback.clone(),
            shutdown_tx: self.shutdown_tx.clone(),
        };
        let listener_task = tokio::spawn(incoming.accept_loop(listener));

        let watcher = GossipWatcher {
            chitchat: self.chitchat.clone(),
            peers: self.peers.clone(),
            interval: self.config.gossip_interval,
            inbound_callback: self.inbound_callback.clone(),
            local_node_id: self.node_id.clone(),
        };
        let watcher_task = tokio::spawn(watcher.run(self.shutdown_tx.subscribe()));

        self.tasks.lock().extend([listener_task, watcher_task]);
        Ok(())
    }

    /// Listen on a relay topic and advertise it
    pub async fn add_topic(&self, topic: &str) {
        let changed = self.local_topics.write().insert(topic.to_string());
        if changed {
            self.publish_interest().await;
        }
    }

    /// Stop listening on a relay topic
    pub async fn remove_topic(&self, topic: &str) {
        let changed = self.local_topics.write().remove(topic);
        if changed {
            self.publish_interest().await;
        }
    }

    /// Forward relay traffic to every linked node that listens on `topic`
    pub async fn forward(&self, topic: &str, payload: Bytes) {
        let targets: Vec<Arc<ClusterPeer>> = self
            .peers
            .iter()
            .filter(|p| p.value().status() == PeerStatus::Connected && p.value().wants(topic))
            .map(|p| p.value().clone())
            .collect();

        for peer in targets {
            if let Err(e) = peer.forward(topic, payload.clone(), &self.node_id).await {
                warn!("Failed to forward '{}' to peer '{}': {}", topic, peer.node_id(), e);
            }
        }
    }

    pub async fn stop(&self) {
        info!("Stopping cluster manager");
        let _ = self.shutdown_tx.send(());

        let peers: Vec<Arc<ClusterPeer>> = self.peers.iter().map(|p| p.value().clone()).collect();
        self.peers.clear();
        for peer in peers {
            peer.stop().await;
        }

        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        self.handle.lock().take();
    }

    async fn publish_interest(&self) {
        let topics: Vec<String> = self.local_topics.read().iter().cloned().collect();
        let json = serde_json::to_string(&topics).unwrap_or_else(|_| "[]".to_string());

        self.chitchat
            .lock()
            .await
            .self_node_state()
            .set(KEY_TOPICS.to_string(), json);

        // No receivers just means no node is linked to us yet
        let _ = self.interest_tx.send(topics);
    }
}

/// Accepts relay links opened by other nodes
struct IncomingLinks {
    local_node_id: String,
    local_topics: Arc<RwLock<AHashSet<String>>>,
    interest_tx: broadcast::Sender<Vec<String>>,
    inbound_callback: ClusterInboundCallback,
    shutdown_tx: broadcast::Sender<()>,
}

impl IncomingLinks {
    async fn accept_loop(self, listener: TcpListener) {
        let this = Arc::new(self);
        let mut shutdown_rx = this.shutdown_tx.subscribe();
        loop {
            tokio::select! {
                accepted = listener.accept() => match accepted {
                    Ok((stream, addr)) => {
                        debug!("Incoming cluster link from {}", addr);
                        let links = this.clone();
                        tokio::spawn(async move {
                            if let Err(e) = links.handle(stream, addr).await {
                                debug!("Cluster link from {} ended: {}", addr, e);
                            }
                        });
                    }
                    Err(e) => error!("Failed to accept cluster link: {}", e),
                },
                _ = shutdown_rx.recv() => return,
            }
        }
    }

    async fn handle(&self, stream: TcpStream, addr: SocketAddr) -> Result<(), RelayError> {
        let _ = stream.set_nodelay(true);
        let (mut read_half, mut write_half) = stream.into_split();

        let hello = tokio::time::timeout(Duration::from_secs(10), read_message(&mut read_half))
            .await
            .map_err(|_| RelayError::Transport("handshake timed out".to_string()))??;
        let peer_node_id = match hello {
            ClusterMessage::Hello { node_id, version } => {
                if version != CLUSTER_PROTOCOL_VERSION {
                    return Err(RelayError::Transport(format!(
                        "Protocol version mismatch: {} vs {}",
                        version, CLUSTER_PROTOCOL_VERSION
                    )));
                }
                node_id
            }
            other => {
                return Err(RelayError::Transport(format!(
                    "Expected Hello, got {}",
                    other.type_name()
                )));
            }
        };
        info!("Incoming cluster peer: {} ({})", peer_node_id, addr);

        // Subscribe before snapshotting so no update falls in between
        let mut interest_rx = self.interest_tx.subscribe();
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        let ack = ClusterMessage::HelloAck {
            node_id: self.local_node_id.clone(),
            version: CLUSTER_PROTOCOL_VERSION,
        };
        write_frame(&mut write_half, &ack).await?;
        write_frame(&mut write_half, &self.current_interest()).await?;

        let (mut incoming, reader) = spawn_reader(read_half);
        let result = loop {
            tokio::select! {
                msg = incoming.recv() => {
                    let Some(msg) = msg else {
                        info!("Cluster peer '{}' disconnected", peer_node_id);
                        break Ok(());
                    };
                    match msg {
                        ClusterMessage::Relay { topic, payload, origin } => {
                            (self.inbound_callback)(topic, Bytes::from(payload), origin);
                        }
                        ClusterMessage::Ping => {
                            if let Err(e) = write_frame(&mut write_half, &ClusterMessage::Pong).await {
                                break Err(e);
                            }
                        }
                        ClusterMessage::Goodbye => {
                            info!("Cluster peer '{}' said goodbye", peer_node_id);
                            break Ok(());
                        }
                        other => debug!("Cluster peer '{}': ignoring {}", peer_node_id, other.type_name()),
                    }
                }

                update = interest_rx.recv() => {
                    let msg = match update {
                        Ok(topics) => ClusterMessage::Interest { topics },
                        Err(broadcast::error::RecvError::Lagged(_)) => self.current_interest(),
                        Err(broadcast::error::RecvError::Closed) => break Ok(()),
                    };
                    if let Err(e) = write_frame(&mut write_half, &msg).await {
                        break Err(e);
                    }
                }

                _ = shutdown_rx.recv() => {
                    let _ = write_frame(&mut write_half, &ClusterMessage::Goodbye).await;
                    break Ok(());
                }
            }
        };
        reader.abort();
        result
    }

    fn current_interest(&self) -> ClusterMessage {
        ClusterMessage::Interest {
            topics: self.local_topics.read().iter().cloned().collect(),
        }
    }
}

/// Discovers nodes through gossip, links to new ones and drops departed ones
struct GossipWatcher {
    chitchat: Arc<tokio::sync::Mutex<Chitchat>>,
    peers: Arc<DashMap<String, Arc<ClusterPeer>>>,
    interval: Duration,
    inbound_callback: ClusterInboundCallback,
    local_node_id: String,
}

impl GossipWatcher {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        let mut known_nodes: AHashSet<String> = AHashSet::new();
        let mut ticker = tokio::time::interval(self.interval);

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_rx.recv() => return,
            }

            let cluster_state = self.chitchat.lock().await.state_snapshot();

            let mut current_nodes = AHashSet::new();
            for node_state in &cluster_state.node_states {
                let node_id = node_state.chitchat_id().node_id.clone();
                if node_id == self.local_node_id {
                    continue;
                }
                current_nodes.insert(node_id.clone());

                if !known_nodes.contains(&node_id) {
                    let Some(peer_addr) = node_state
                        .get(KEY_PEER_ADDR)
                        .and_then(|addr| addr.parse::<SocketAddr>().ok())
                    else {
                        continue;
                    };
                    info!("Discovered cluster peer: {} at {}", node_id, peer_addr);
                    let peer = ClusterPeer::spawn(
                        node_id.clone(),
                        peer_addr,
                        self.local_node_id.clone(),
                        self.inbound_callback.clone(),
                    );
                    self.peers.insert(node_id.clone(), peer);
                    known_nodes.insert(node_id.clone());
                }

                // A connected link receives `Interest` directly, which is fresher
                if let (Some(peer), Some(json)) =
                    (self.peers.get(&node_id), node_state.get(KEY_TOPICS))
                {
                    if peer.status() != PeerStatus::Connected {
                        if let Ok(topics) = serde_json::from_str::<Vec<String>>(json) {
                            peer.set_interest(topics);
                        }
                    }
                }
            }

            let departed: Vec<String> = known_nodes
                .iter()
                .filter(|n| !current_nodes.contains(*n))
                .cloned()
                .collect();
            for node_id in departed {
                info!("Cluster peer '{}' left the cluster", node_id);
                known_nodes.remove(&node_id);
                if let Some((_, peer)) = self.peers.remove(&node_id) {
                    peer.stop().await;
                }
            }
        }
    }
}
