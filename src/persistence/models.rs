//! Stored records.
//!
//! Application payloads are kept as JSON text; timestamps are unix
//! milliseconds.

use std::time::{SystemTime, UNIX_EPOCH};

use bincode::{Decode, Encode};

/// Current unix time in milliseconds
pub fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A live client as seen by the store
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Presence {
    pub client_id: String,
    pub transport: String,
    pub addr: String,
    /// Broker instance holding the connection
    pub instance_id: String,
    pub connected_at: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct Subscription {
    pub client_id: String,
    pub channel: String,
    /// Persistent subscriptions survive disconnects
    pub persistent: bool,
    pub created_at: u64,
}

impl Subscription {
    pub fn new(client_id: &str, channel: &str, persistent: bool) -> Self {
        Self {
            client_id: client_id.to_string(),
            channel: channel.to_string(),
            persistent,
            created_at: now_millis(),
        }
    }
}

/// Last retained publish on a plain channel
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct RetainedMessage {
    pub channel: String,
    pub sender: String,
    pub payload: String,
    pub updated_at: u64,
}

/// A QoS 1 publish kept until every recipient acknowledged it
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PendingPublish {
    pub packet_id: String,
    pub channel: String,
    pub sender: String,
    pub payload: String,
    pub created_at: u64,
}

/// One unacknowledged recipient of a [`PendingPublish`]
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub struct PendingAck {
    pub client_id: String,
    pub packet_id: String,
    pub channel: String,
}
