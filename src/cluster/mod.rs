//! Cluster Module
//!
//! Networked relay for brokers on different hosts.
//!
//! # Architecture
//!
//! - **Gossip (UDP via chitchat)**: node discovery, membership and the
//!   relay topics each node listens on
//! - **Peer TCP**: relay traffic, forwarded only to nodes that listen on
//!   the topic (global topics go everywhere)
//!
//! # Usage
//!
//! ```toml
//! [relay]
//! mode = "cluster"
//!
//! [cluster]
//! gossip_addr = "0.0.0.0:7946"
//! peer_addr = "0.0.0.0:7947"
//! seeds = ["node1:7946", "node2:7946"]
//! ```

mod manager;
mod peer;
mod protocol;
mod transport;

pub use manager::ClusterManager;
pub use peer::{ClusterInboundCallback, ClusterPeer, PeerStatus};
pub use protocol::{ClusterMessage, CLUSTER_PROTOCOL_VERSION};
pub use transport::ClusterTransport;
