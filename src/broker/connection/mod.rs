//! JMQT Connection Handler
//!
//! Drives one client connection: reads frames, runs the protocol state
//! machine and flushes the connection's [`SharedWriter`]. Packet handlers
//! live in the submodules, one per protocol area.

mod connect;
mod disconnect;
mod publish;
mod qos;
mod subscribe;

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::broadcast;
use tokio::time::Instant;
use tracing::{debug, trace, warn};

use super::engine::{Engine, Retire};
use super::SharedWriter;
use crate::codec::Decoder;
use crate::hooks::RemoteInfo;
use crate::protocol::{DecodeError, Packet};
use crate::transport::FrameIo;

/// Connection error types
#[derive(Debug)]
pub enum ConnectionError {
    Io(std::io::Error),
    Decode(DecodeError),
    /// An unterminated frame outgrew the limit
    FrameTooLarge { size: usize, max: usize },
    /// No frame within the session timeout
    Timeout,
    Shutdown,
}

impl std::fmt::Display for ConnectionError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConnectionError::Io(e) => write!(f, "IO error: {}", e),
            ConnectionError::Decode(e) => write!(f, "Decode error: {}", e),
            ConnectionError::FrameTooLarge { size, max } => {
                write!(f, "Frame too large: {} bytes (max {})", size, max)
            }
            ConnectionError::Timeout => write!(f, "Connection timeout"),
            ConnectionError::Shutdown => write!(f, "Shutdown"),
        }
    }
}

impl std::error::Error for ConnectionError {}

impl From<std::io::Error> for ConnectionError {
    fn from(e: std::io::Error) -> Self {
        ConnectionError::Io(e)
    }
}

impl From<DecodeError> for ConnectionError {
    fn from(e: DecodeError) -> Self {
        match e {
            DecodeError::FrameTooLarge { size, max } => ConnectionError::FrameTooLarge { size, max },
            other => ConnectionError::Decode(other),
        }
    }
}

/// Protocol state of a connection
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum State {
    /// Nothing accepted yet
    Unauthenticated,
    /// An `auth` succeeded; the client still has to `conn`
    Authenticated { client_id: String },
    /// Registered as the live session of `client_id`
    Connected { client_id: Arc<str> },
    /// `disconn` received, or the session was torn down
    Disconnected,
}

/// QoS 1 redelivery queue, one packet in flight at a time
#[derive(Debug, Default)]
pub(crate) struct Redelivery {
    pub(crate) queue: VecDeque<String>,
    pub(crate) in_flight: Option<String>,
}

/// Connection handler - generic over the frame transport
pub struct Connection<T> {
    pub(crate) io: T,
    pub(crate) remote: RemoteInfo,
    pub(crate) state: State,
    pub(crate) decoder: Decoder,
    pub(crate) writer: Arc<SharedWriter>,
    pub(crate) engine: Arc<Engine>,
    pub(crate) redelivery: Redelivery,
}

impl<T: FrameIo> Connection<T> {
    pub(crate) fn new(io: T, remote: RemoteInfo, engine: Arc<Engine>) -> Self {
        let decoder = Decoder::new().with_max_frame_size(engine.config().max_frame_size);
        Self {
            io,
            remote,
            state: State::Unauthenticated,
            decoder,
            writer: Arc::new(SharedWriter::with_limit(engine.config().max_queued_frames)),
            engine,
            redelivery: Redelivery::default(),
        }
    }

    /// Run the connection until the client leaves, is evicted, times out or
    /// the broker shuts down
    pub(crate) async fn run(
        &mut self,
        mut shutdown_rx: broadcast::Receiver<()>,
    ) -> Result<(), ConnectionError> {
        let timeout = self.engine.config().timeout;
        let mut deadline = Instant::now() + timeout;

        let result = loop {
            tokio::select! {
                filled = self.io.fill(&mut self.decoder) => {
                    match filled {
                        Ok(true) => match self.process_frames().await {
                            Ok(true) => deadline = Instant::now() + timeout,
                            Ok(false) => {}
                            Err(e) => break Err(e),
                        },
                        Ok(false) => {
                            debug!("Connection closed by {}", self.remote);
                            break Ok(());
                        }
                        Err(e) => break Err(e.into()),
                    }
                }

                _ = self.writer.notified() => {
                    if let Err(e) = self.flush().await {
                        break Err(e.into());
                    }
                    if !self.writer.is_alive() {
                        debug!("Writer closed for {}", self.remote);
                        break Ok(());
                    }
                }

                _ = tokio::time::sleep_until(deadline) => {
                    debug!("Inactivity timeout for {}", self.remote);
                    break Err(ConnectionError::Timeout);
                }

                _ = shutdown_rx.recv() => {
                    break Err(ConnectionError::Shutdown);
                }
            }
        };

        self.finish().await;
        result
    }

    /// Decode and handle every complete frame in the buffer.
    ///
    /// Returns whether at least one frame arrived.
    async fn process_frames(&mut self) -> Result<bool, ConnectionError> {
        let mut seen = false;
        loop {
            if !self.writer.is_alive() {
                return Ok(seen);
            }
            match self.decoder.next_packet()? {
                Some(Ok(packet)) => {
                    seen = true;
                    self.handle_packet(packet).await;
                }
                Some(Err(e)) => {
                    seen = true;
                    warn!("Malformed frame from {}: {}", self.remote, e);
                }
                None => return Ok(seen),
            }
        }
    }

    async fn handle_packet(&mut self, packet: Packet) {
        trace!("{:?} from {}", packet.packet_type(), self.remote);
        match packet {
            Packet::Auth(auth) => self.handle_auth(auth).await,
            Packet::Conn(conn) => self.handle_conn(conn).await,
            Packet::Publish(publish) => self.handle_publish(publish).await,
            Packet::PushAck(ack) => self.handle_push_ack(ack).await,
            Packet::Subscribe(sub) => self.handle_subscribe(sub).await,
            Packet::Unsubscribe(unsub) => self.handle_unsubscribe(unsub).await,
            Packet::Heartbeat => {
                if self.client_id().is_some() {
                    self.reply(Packet::HeartbeatAck);
                }
            }
            Packet::Disconnect => self.handle_disconnect().await,
            other => {
                warn!(
                    "Unexpected {:?} packet from {}",
                    other.packet_type(),
                    self.remote
                );
            }
        }
    }

    /// Write everything queued on the writer.
    ///
    /// A client that does not take the bytes within one session timeout is
    /// treated as gone.
    async fn flush(&mut self) -> std::io::Result<()> {
        let frames = self.writer.take_frames();
        if frames.is_empty() {
            return Ok(());
        }
        let limit = self.engine.config().timeout;
        match tokio::time::timeout(limit, self.io.send(&frames)).await {
            Ok(result) => result,
            Err(_) => Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "write stalled",
            )),
        }
    }

    async fn finish(&mut self) {
        if let State::Connected { client_id } = &self.state {
            let client_id = client_id.clone();
            self.engine
                .teardown(&client_id, &self.writer, Retire::Lost)
                .await;
        }
        self.state = State::Disconnected;
        self.writer.close();
        if let Err(e) = self.flush().await {
            debug!("Final flush to {} failed: {}", self.remote, e);
        }
        self.io.close().await;
    }

    /// Client id of the registered session, if any
    pub(crate) fn client_id(&self) -> Option<Arc<str>> {
        match &self.state {
            State::Connected { client_id } => Some(client_id.clone()),
            _ => None,
        }
    }

    /// Queue a response; a closed writer or an unencodable packet is only logged
    pub(crate) fn reply(&self, packet: Packet) {
        if let Err(e) = self.writer.send_packet(&packet) {
            debug!(
                "{:?} to {} not sent: {}",
                packet.packet_type(),
                self.remote,
                e
            );
        }
    }
}

#[cfg(test)]
mod tests;
