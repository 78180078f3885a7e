//! JMQT - lightweight publish/subscribe broker
//!
//! Clients exchange NUL-terminated JSON frames over TCP, TLS or WebSocket.
//! Applications plug in authentication, authorization and control channels
//! through the capabilities in [`hooks`]; several brokers can share a store
//! and a relay to serve one client population.

pub mod acl;
pub mod auth;
pub mod broker;
pub mod cluster;
pub mod codec;
pub mod config;
pub mod control;
pub mod hooks;
pub mod persistence;
pub mod protocol;
pub mod relay;
pub mod transport;

pub use acl::ChannelAcl;
pub use auth::TokenAuthenticator;
pub use broker::{Broker, BrokerConfig, BrokerError};
pub use cluster::{ClusterManager, ClusterTransport};
pub use config::Config;
pub use control::{ControlChannels, LogNotifier};
pub use hooks::{AllowAll, Capabilities};
pub use persistence::{FjallBackend, MemoryBackend, StorageBackend};
pub use protocol::{QoS, StatusCode};
pub use relay::{LocalBus, Relay};
