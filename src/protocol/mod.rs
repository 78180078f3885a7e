//! JMQT Protocol definitions and types
//!
//! Defines the status codes, transport tags, QoS levels and channel
//! classes shared by the codec, the engine and the relay.

mod error;
mod packet;

pub use error::{DecodeError, EncodeError, ProtocolError};
pub use packet::*;

use std::fmt;

/// Prefix marking a peer-to-peer channel
pub const P2P_PREFIX: char = '#';

/// Prefix marking a control channel
pub const CONTROL_PREFIX: char = '$';

/// Response status carried in the `st` field of every ack
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum StatusCode {
    Ok,
    Failed,
    ServerError,
    InvalidToken,
    NotAllowed,
    ClientOffline,
    NetworkError,
    InvalidPacket,
    InvalidChannel,
    Unknown,
}

impl StatusCode {
    /// Stable integer used on the wire
    pub fn code(self) -> i64 {
        match self {
            StatusCode::Ok => 1,
            StatusCode::Failed => 0,
            StatusCode::ServerError => 5,
            StatusCode::InvalidToken => 6,
            StatusCode::NotAllowed => 7,
            StatusCode::ClientOffline => 8,
            StatusCode::NetworkError => 9,
            StatusCode::InvalidPacket => 10,
            StatusCode::InvalidChannel => 11,
            StatusCode::Unknown => -1,
        }
    }

    /// Map a wire integer back to a status; anything unrecognised is `Unknown`
    pub fn from_code(code: i64) -> Self {
        match code {
            1 => StatusCode::Ok,
            0 => StatusCode::Failed,
            5 => StatusCode::ServerError,
            6 => StatusCode::InvalidToken,
            7 => StatusCode::NotAllowed,
            8 => StatusCode::ClientOffline,
            9 => StatusCode::NetworkError,
            10 => StatusCode::InvalidPacket,
            11 => StatusCode::InvalidChannel,
            _ => StatusCode::Unknown,
        }
    }

    pub fn is_ok(self) -> bool {
        self == StatusCode::Ok
    }
}

impl fmt::Display for StatusCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StatusCode::Ok => "OK",
            StatusCode::Failed => "FAILED",
            StatusCode::ServerError => "SERVER_ERROR",
            StatusCode::InvalidToken => "INVALID_TOKEN",
            StatusCode::NotAllowed => "NOT_ALLOWED",
            StatusCode::ClientOffline => "CLIENT_OFFLINE",
            StatusCode::NetworkError => "NETWORK_ERROR",
            StatusCode::InvalidPacket => "INVALID_PACKET",
            StatusCode::InvalidChannel => "INVALID_CHANNEL",
            StatusCode::Unknown => "UNKNOWN",
        };
        write!(f, "{}({})", name, self.code())
    }
}

/// Transport a client is connected over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Transport {
    Socket,
    SslSocket,
    WebSocket,
    SslWebSocket,
}

impl Transport {
    pub fn as_str(self) -> &'static str {
        match self {
            Transport::Socket => "SOCKET",
            Transport::SslSocket => "SSL_SOCKET",
            Transport::WebSocket => "WEB_SOCKET",
            Transport::SslWebSocket => "SSL_WEB_SOCKET",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SOCKET" => Some(Transport::Socket),
            "SSL_SOCKET" => Some(Transport::SslSocket),
            "WEB_SOCKET" => Some(Transport::WebSocket),
            "SSL_WEB_SOCKET" => Some(Transport::SslWebSocket),
            _ => None,
        }
    }

    pub fn is_websocket(self) -> bool {
        matches!(self, Transport::WebSocket | Transport::SslWebSocket)
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Quality of Service levels
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum QoS {
    /// At most once delivery
    #[default]
    AtMostOnce = 0,
    /// At least once delivery, tracked until pushAck
    AtLeastOnce = 1,
}

impl QoS {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(QoS::AtMostOnce),
            1 => Some(QoS::AtLeastOnce),
            _ => None,
        }
    }
}

/// Channel classes, decided by the first character of the name
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelKind {
    /// Broadcast to every subscriber
    Plain,
    /// `#...`, addressed to a single implicit recipient
    PeerToPeer,
    /// `$...`, answered by the control-channel handler
    Control,
}

impl ChannelKind {
    pub fn of(channel: &str) -> Self {
        if channel.starts_with(P2P_PREFIX) {
            ChannelKind::PeerToPeer
        } else if channel.starts_with(CONTROL_PREFIX) {
            ChannelKind::Control
        } else {
            ChannelKind::Plain
        }
    }
}

/// Trim a channel name and reject empty names and bare prefixes.
///
/// Returns the trimmed name when valid.
pub fn validate_channel(channel: &str) -> Option<&str> {
    let channel = channel.trim();
    match channel {
        "" => None,
        c if c.len() == 1 && (c.starts_with(P2P_PREFIX) || c.starts_with(CONTROL_PREFIX)) => None,
        c => Some(c),
    }
}

/// Peer-to-peer channel owned by a client
pub fn p2p_channel(client_id: &str) -> String {
    format!("{}{}", P2P_PREFIX, client_id)
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    #[test_case(StatusCode::Ok, 1)]
    #[test_case(StatusCode::Failed, 0)]
    #[test_case(StatusCode::ServerError, 5)]
    #[test_case(StatusCode::InvalidToken, 6)]
    #[test_case(StatusCode::NotAllowed, 7)]
    #[test_case(StatusCode::ClientOffline, 8)]
    #[test_case(StatusCode::NetworkError, 9)]
    #[test_case(StatusCode::InvalidPacket, 10)]
    #[test_case(StatusCode::InvalidChannel, 11)]
    #[test_case(StatusCode::Unknown, -1)]
    fn test_status_codes_are_stable(status: StatusCode, code: i64) {
        assert_eq!(status.code(), code);
        assert_eq!(StatusCode::from_code(code), status);
    }

    #[test]
    fn test_unrecognised_status_is_unknown() {
        assert_eq!(StatusCode::from_code(42), StatusCode::Unknown);
    }

    #[test_case("news", ChannelKind::Plain)]
    #[test_case("#peer1", ChannelKind::PeerToPeer)]
    #[test_case("$ctl", ChannelKind::Control)]
    #[test_case("a#b", ChannelKind::Plain)]
    fn test_channel_kind(channel: &str, kind: ChannelKind) {
        assert_eq!(ChannelKind::of(channel), kind);
    }

    #[test_case("", None)]
    #[test_case("   ", None)]
    #[test_case("#", None)]
    #[test_case("$", None)]
    #[test_case(" news ", Some("news"))]
    #[test_case("#a", Some("#a"))]
    #[test_case("$mySubscriptions", Some("$mySubscriptions"))]
    fn test_validate_channel(input: &str, expected: Option<&str>) {
        assert_eq!(validate_channel(input), expected);
    }

    #[test]
    fn test_transport_tags() {
        for t in [
            Transport::Socket,
            Transport::SslSocket,
            Transport::WebSocket,
            Transport::SslWebSocket,
        ] {
            assert_eq!(Transport::parse(t.as_str()), Some(t));
        }
        assert!(Transport::SslWebSocket.is_websocket());
        assert!(!Transport::SslSocket.is_websocket());
    }

    #[test]
    fn test_qos_from_u8() {
        assert_eq!(QoS::from_u8(0), Some(QoS::AtMostOnce));
        assert_eq!(QoS::from_u8(1), Some(QoS::AtLeastOnce));
        assert_eq!(QoS::from_u8(2), None);
    }
}
