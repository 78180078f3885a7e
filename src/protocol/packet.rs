//! JMQT Packet Definitions
//!
//! Every frame is a JSON object with a single root key naming the packet
//! type. Field names inside the packet body are fixed short codes.

use std::fmt;

use serde_json::Value;

use super::{QoS, StatusCode};

/// Short field keys used inside packet bodies
pub mod keys {
    pub const STATUS: &str = "st";
    pub const CHANNEL: &str = "cn";
    pub const DATA: &str = "dt";
    pub const PACKET_ID: &str = "id";
    pub const QOS: &str = "q";
    pub const RETAIN: &str = "rt";
    pub const TOKEN: &str = "at";
    pub const CLIENT_ID: &str = "cl";
    pub const PERSISTENT: &str = "pr";
    pub const MESSAGE: &str = "mg";
    pub const TIMEOUT: &str = "ts";
}

/// Root keys of the fixed packet enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PacketType {
    Auth,
    AuthAck,
    Conn,
    ConnAck,
    Pub,
    PubAck,
    Push,
    PushAck,
    Sub,
    SubAck,
    Unsub,
    UnsubAck,
    Hb,
    HbAck,
    Disconn,
}

impl PacketType {
    pub const ALL: [PacketType; 15] = [
        PacketType::Auth,
        PacketType::AuthAck,
        PacketType::Conn,
        PacketType::ConnAck,
        PacketType::Pub,
        PacketType::PubAck,
        PacketType::Push,
        PacketType::PushAck,
        PacketType::Sub,
        PacketType::SubAck,
        PacketType::Unsub,
        PacketType::UnsubAck,
        PacketType::Hb,
        PacketType::HbAck,
        PacketType::Disconn,
    ];

    /// Root key as it appears on the wire
    pub fn key(self) -> &'static str {
        match self {
            PacketType::Auth => "auth",
            PacketType::AuthAck => "authAck",
            PacketType::Conn => "conn",
            PacketType::ConnAck => "connAck",
            PacketType::Pub => "pub",
            PacketType::PubAck => "pubAck",
            PacketType::Push => "push",
            PacketType::PushAck => "pushAck",
            PacketType::Sub => "sub",
            PacketType::SubAck => "subAck",
            PacketType::Unsub => "unsub",
            PacketType::UnsubAck => "unsubAck",
            PacketType::Hb => "hb",
            PacketType::HbAck => "hbAck",
            PacketType::Disconn => "disconn",
        }
    }

    pub fn from_key(key: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|t| t.key() == key)
    }
}

impl fmt::Display for PacketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}

/// JMQT Packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Packet {
    Auth(Auth),
    AuthAck(AuthAck),
    Conn(Conn),
    ConnAck(ConnAck),
    Publish(Publish),
    PubAck(PubAck),
    Push(Push),
    PushAck(PushAck),
    Subscribe(Subscribe),
    SubAck(SubAck),
    Unsubscribe(Unsubscribe),
    UnsubAck(UnsubAck),
    Heartbeat,
    HeartbeatAck,
    Disconnect,
}

impl Packet {
    pub fn packet_type(&self) -> PacketType {
        match self {
            Packet::Auth(_) => PacketType::Auth,
            Packet::AuthAck(_) => PacketType::AuthAck,
            Packet::Conn(_) => PacketType::Conn,
            Packet::ConnAck(_) => PacketType::ConnAck,
            Packet::Publish(_) => PacketType::Pub,
            Packet::PubAck(_) => PacketType::PubAck,
            Packet::Push(_) => PacketType::Push,
            Packet::PushAck(_) => PacketType::PushAck,
            Packet::Subscribe(_) => PacketType::Sub,
            Packet::SubAck(_) => PacketType::SubAck,
            Packet::Unsubscribe(_) => PacketType::Unsub,
            Packet::UnsubAck(_) => PacketType::UnsubAck,
            Packet::Heartbeat => PacketType::Hb,
            Packet::HeartbeatAck => PacketType::HbAck,
            Packet::Disconnect => PacketType::Disconn,
        }
    }
}

/// AUTH packet (client -> server). `data` is handed to the auth validator untouched.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Auth {
    pub data: Value,
}

/// AUTHACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthAck {
    pub status: StatusCode,
    /// Sent only when status is OK
    pub client_id: String,
    /// Sent only when status is OK
    pub token: String,
    /// Sent only when status is not OK
    pub message: String,
}

/// CONN packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Conn {
    pub token: String,
    pub client_id: String,
}

/// CONNACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnAck {
    pub status: StatusCode,
    /// Inactivity window in seconds
    pub timeout: u64,
}

/// PUB packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Publish {
    pub channel: String,
    pub data: Value,
    /// Client-chosen id, echoed in pubAck
    pub packet_id: Option<String>,
    pub qos: QoS,
    pub retain: bool,
}

/// PUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PubAck {
    pub status: StatusCode,
    pub packet_id: String,
    /// Present for control-channel responses
    pub data: Option<Value>,
}

/// PUSH packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Push {
    pub channel: String,
    pub data: Value,
    /// Client id of the publisher, empty for server-originated publishes
    pub sender: String,
    /// Present only for QoS 1
    pub packet_id: Option<String>,
    pub qos: QoS,
    pub retain: bool,
}

/// PUSHACK packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct PushAck {
    pub packet_id: String,
}

/// SUB packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Subscribe {
    pub channel: String,
    pub persistent: bool,
}

/// SUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubAck {
    pub status: StatusCode,
    pub channel: String,
}

/// UNSUB packet (client -> server)
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct Unsubscribe {
    pub channel: String,
}

/// UNSUBACK packet (server -> client)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnsubAck {
    pub status: StatusCode,
    pub channel: String,
}
