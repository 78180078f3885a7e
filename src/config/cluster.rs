//! Cluster Configuration
//!
//! Gossip membership and peer links used when `relay.mode = "cluster"`.

use std::net::{IpAddr, SocketAddr, ToSocketAddrs};
use std::time::Duration;

use serde::Deserialize;

/// Cluster configuration for the networked relay
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ClusterConfig {
    /// Node identifier (defaults to the relay instance id)
    pub node_id: Option<String>,

    /// Cluster name; nodes only gossip with nodes of the same name
    pub cluster_id: String,

    /// Address for gossip protocol (chitchat) to bind to
    pub gossip_addr: SocketAddr,

    /// Advertise address for gossip (what peers use to reach us)
    pub gossip_advertise_addr: Option<SocketAddr>,

    /// Address for relay TCP links to bind to
    pub peer_addr: SocketAddr,

    /// Advertise address for relay links
    pub peer_advertise_addr: Option<SocketAddr>,

    /// Seed nodes for discovery, as gossip "host:port"
    pub seeds: Vec<String>,

    #[serde(with = "humantime_serde")]
    pub gossip_interval: Duration,

    /// How long a dead node stays in the membership table
    #[serde(with = "humantime_serde")]
    pub dead_node_grace_period: Duration,
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            node_id: None,
            cluster_id: "jmqt".to_string(),
            gossip_addr: SocketAddr::from(([0, 0, 0, 0], 7946)),
            gossip_advertise_addr: None,
            peer_addr: SocketAddr::from(([0, 0, 0, 0], 7947)),
            peer_advertise_addr: None,
            seeds: Vec::new(),
            gossip_interval: Duration::from_secs(1),
            dead_node_grace_period: Duration::from_secs(30),
        }
    }
}

impl ClusterConfig {
    /// Node id to announce, falling back to the relay instance id
    pub fn node_id_or(&self, instance_id: &str) -> String {
        self.node_id
            .clone()
            .unwrap_or_else(|| instance_id.to_string())
    }

    /// Gossip advertise address.
    /// Priority: explicit config > resolved hostname > bind address
    pub fn gossip_advertise(&self) -> SocketAddr {
        advertise(self.gossip_advertise_addr, self.gossip_addr)
    }

    /// Peer advertise address, with the same priority as gossip
    pub fn peer_advertise(&self) -> SocketAddr {
        advertise(self.peer_advertise_addr, self.peer_addr)
    }
}

fn advertise(explicit: Option<SocketAddr>, bind: SocketAddr) -> SocketAddr {
    if let Some(addr) = explicit {
        return addr;
    }
    if !bind.ip().is_unspecified() {
        return bind;
    }
    match resolve_local_ip() {
        Some(ip) => SocketAddr::new(ip, bind.port()),
        None => bind,
    }
}

/// Resolve the local machine's IP address from its hostname
fn resolve_local_ip() -> Option<IpAddr> {
    let hostname = hostname::get().ok()?;
    format!("{}:0", hostname.to_string_lossy())
        .to_socket_addrs()
        .ok()?
        .find(|addr| addr.is_ipv4())
        .map(|addr| addr.ip())
}
