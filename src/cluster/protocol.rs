//! Cluster Protocol Messages
//!
//! Binary protocol spoken on peer TCP links: a 4-byte big-endian length
//! followed by a bincode-encoded [`ClusterMessage`].

use bincode::{Decode, Encode};
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::debug;

use crate::relay::RelayError;

/// Protocol version for compatibility checking
pub const CLUSTER_PROTOCOL_VERSION: u8 = 1;

/// Frames larger than this are treated as a broken link
pub const MAX_CLUSTER_FRAME: usize = 16 * 1024 * 1024;

/// Messages exchanged between cluster nodes over TCP
#[derive(Debug, Clone, PartialEq, Eq, Encode, Decode)]
pub enum ClusterMessage {
    /// Handshake sent when connecting to a peer
    Hello { node_id: String, version: u8 },

    /// Handshake acknowledgment
    HelloAck { node_id: String, version: u8 },

    /// Relay traffic for one topic
    Relay {
        topic: String,
        payload: Vec<u8>,
        /// Node that published the message
        origin: String,
    },

    /// Full list of relay topics the sender wants to receive
    Interest { topics: Vec<String> },

    /// Keep-alive ping
    Ping,

    /// Keep-alive pong
    Pong,

    /// Graceful disconnect notification
    Goodbye,
}

impl ClusterMessage {
    /// Encode message to bytes using bincode
    pub fn encode(&self) -> Result<Vec<u8>, RelayError> {
        bincode::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| RelayError::Encode(e.to_string()))
    }

    /// Decode message from bytes using bincode
    pub fn decode(data: &[u8]) -> Result<Self, RelayError> {
        bincode::decode_from_slice(data, bincode::config::standard())
            .map(|(msg, _)| msg)
            .map_err(|e| RelayError::Decode(e.to_string()))
    }

    /// Get the message type name for logging
    pub fn type_name(&self) -> &'static str {
        match self {
            ClusterMessage::Hello { .. } => "Hello",
            ClusterMessage::HelloAck { .. } => "HelloAck",
            ClusterMessage::Relay { .. } => "Relay",
            ClusterMessage::Interest { .. } => "Interest",
            ClusterMessage::Ping => "Ping",
            ClusterMessage::Pong => "Pong",
            ClusterMessage::Goodbye => "Goodbye",
        }
    }
}

/// Frame a message with length prefix for TCP transmission
pub fn frame_message(msg: &ClusterMessage) -> Result<Vec<u8>, RelayError> {
    let payload = msg.encode()?;
    let len = payload.len() as u32;

    let mut frame = Vec::with_capacity(4 + payload.len());
    frame.extend_from_slice(&len.to_be_bytes());
    frame.extend_from_slice(&payload);

    Ok(frame)
}

/// Read one length-prefixed message
pub async fn read_message<R>(reader: &mut R) -> Result<ClusterMessage, RelayError>
where
    R: AsyncRead + Unpin,
{
    let mut len = [0u8; 4];
    reader
        .read_exact(&mut len)
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(len) as usize;
    if len > MAX_CLUSTER_FRAME {
        return Err(RelayError::Decode(format!("cluster frame of {} bytes", len)));
    }

    let mut payload = vec![0u8; len];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| RelayError::Transport(e.to_string()))?;
    ClusterMessage::decode(&payload)
}

/// Read messages on a dedicated task so callers can `select!` on them.
///
/// The channel closes when the link fails or a frame cannot be decoded.
pub fn spawn_reader<R>(mut reader: R) -> (mpsc::Receiver<ClusterMessage>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::channel(1000);
    let handle = tokio::spawn(async move {
        loop {
            match read_message(&mut reader).await {
                Ok(msg) => {
                    if tx.send(msg).await.is_err() {
                        break;
                    }
                }
                Err(e) => {
                    debug!("Cluster link reader stopped: {}", e);
                    break;
                }
            }
        }
    });
    (rx, handle)
}
