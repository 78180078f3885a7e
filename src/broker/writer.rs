//! Per-connection outbound queue.
//!
//! Any task (the connection itself, the relay reader delivering pushes, an
//! evicting connect) appends encoded frames here; the connection loop
//! drains the queue and writes it to the transport.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::Mutex;
use tokio::sync::Notify;

use crate::codec::Encoder;
use crate::protocol::{EncodeError, Packet};

/// Error when sending to a SharedWriter
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SendError {
    /// Connection is closed
    Closed,
    /// The client stopped draining its queue; the writer is now closed
    QueueFull,
    /// The packet failed field validation
    Encoding(EncodeError),
}

impl std::fmt::Display for SendError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SendError::Closed => write!(f, "connection closed"),
            SendError::QueueFull => write!(f, "outbound queue full"),
            SendError::Encoding(e) => write!(f, "encoding failed: {}", e),
        }
    }
}

impl std::error::Error for SendError {}

/// Shared write queue for one connection
pub struct SharedWriter {
    /// Encoded frames waiting to be written
    frames: Mutex<VecDeque<String>>,
    /// Wakes the connection loop
    notify: Notify,
    encoder: Encoder,
    alive: AtomicBool,
    /// Frames allowed to wait at once (0 = unbounded)
    max_queued: usize,
}

impl SharedWriter {
    pub fn new() -> Self {
        Self::with_limit(0)
    }

    /// Writer that closes itself once `max_queued` frames are waiting
    pub fn with_limit(max_queued: usize) -> Self {
        Self {
            frames: Mutex::new(VecDeque::new()),
            notify: Notify::new(),
            encoder: Encoder::new(),
            alive: AtomicBool::new(true),
            max_queued,
        }
    }

    pub fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Mark the connection as closed. Frames already queued are still flushed.
    pub fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.notify.notify_one();
    }

    /// Wait until frames are queued or the writer is closed
    pub fn notified(&self) -> tokio::sync::futures::Notified<'_> {
        self.notify.notified()
    }

    /// Take all pending frames
    pub fn take_frames(&self) -> Vec<String> {
        self.frames.lock().drain(..).collect()
    }

    pub fn queued(&self) -> usize {
        self.frames.lock().len()
    }

    /// Encode and queue a packet
    pub fn send_packet(&self, packet: &Packet) -> Result<(), SendError> {
        if !self.is_alive() {
            return Err(SendError::Closed);
        }
        let frame = self.encoder.encode_json(packet).map_err(SendError::Encoding)?;

        let was_empty = {
            let mut frames = self.frames.lock();
            if self.max_queued > 0 && frames.len() >= self.max_queued {
                drop(frames);
                self.close();
                return Err(SendError::QueueFull);
            }
            frames.push_back(frame);
            frames.len() == 1
        };

        // Coalesce notifications during bursts
        if was_empty {
            self.notify.notify_one();
        }
        Ok(())
    }
}

impl Default for SharedWriter {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for SharedWriter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SharedWriter")
            .field("queued", &self.queued())
            .field("alive", &self.is_alive())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::{StatusCode, SubAck};

    #[test]
    fn test_send_queues_encoded_frames_in_order() {
        let writer = SharedWriter::new();
        writer.send_packet(&Packet::HeartbeatAck).unwrap();
        writer
            .send_packet(&Packet::SubAck(SubAck {
                status: StatusCode::Ok,
                channel: "news".to_string(),
            }))
            .unwrap();

        let frames = writer.take_frames();
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0], r#"{"hbAck":{}}"#);
        assert!(frames[1].starts_with(r#"{"subAck":"#));
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_closed_writer_rejects_frames() {
        let writer = SharedWriter::new();
        writer.close();
        assert!(!writer.is_alive());
        assert_eq!(
            writer.send_packet(&Packet::HeartbeatAck),
            Err(SendError::Closed)
        );
    }

    #[test]
    fn test_invalid_packet_is_not_queued() {
        let writer = SharedWriter::new();
        let result = writer.send_packet(&Packet::SubAck(SubAck {
            status: StatusCode::Ok,
            channel: "  ".to_string(),
        }));
        assert!(matches!(result, Err(SendError::Encoding(_))));
        assert_eq!(writer.queued(), 0);
    }

    #[test]
    fn test_full_queue_closes_writer() {
        let writer = SharedWriter::with_limit(2);
        writer.send_packet(&Packet::HeartbeatAck).unwrap();
        writer.send_packet(&Packet::HeartbeatAck).unwrap();

        assert_eq!(
            writer.send_packet(&Packet::HeartbeatAck),
            Err(SendError::QueueFull)
        );
        assert!(!writer.is_alive());
        // What was queued is still flushed
        assert_eq!(writer.take_frames().len(), 2);
    }

    #[tokio::test]
    async fn test_send_wakes_waiter() {
        let writer = std::sync::Arc::new(SharedWriter::new());
        let waiter = {
            let writer = writer.clone();
            tokio::spawn(async move { writer.notified().await })
        };
        tokio::task::yield_now().await;
        writer.send_packet(&Packet::HeartbeatAck).unwrap();
        tokio::time::timeout(std::time::Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
    }
}
