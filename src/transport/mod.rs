//! Transport Layer
//!
//! Moves JMQT frames over byte streams (TCP, TLS) and WebSocket with a
//! single interface, so the connection loop does not care which one it
//! is driving.

mod websocket;

pub use websocket::WsIo;

use std::io;

use async_trait::async_trait;
use bytes::BytesMut;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;

use crate::codec::{Decoder, FRAME_DELIMITER};

/// Frame-level I/O for one client connection
#[async_trait]
pub trait FrameIo: Send {
    /// Wait for inbound data and append it to the decoder.
    ///
    /// Returns `Ok(false)` once the peer closed the connection. Must be
    /// cancel safe: it is polled inside `select!`.
    async fn fill(&mut self, decoder: &mut Decoder) -> io::Result<bool>;

    /// Write encoded frames (JSON text without terminator) and flush
    async fn send(&mut self, frames: &[String]) -> io::Result<()>;

    /// Close the connection, ignoring errors
    async fn close(&mut self);
}

/// NUL-delimited frames over a byte stream
pub struct StreamIo<S> {
    stream: S,
    write_buf: BytesMut,
}

impl<S> StreamIo<S> {
    pub fn new(stream: S) -> Self {
        Self {
            stream,
            write_buf: BytesMut::with_capacity(2048),
        }
    }
}

#[async_trait]
impl<S> FrameIo for StreamIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn fill(&mut self, decoder: &mut Decoder) -> io::Result<bool> {
        let n = self.stream.read_buf(decoder.buffer_mut()).await?;
        Ok(n > 0)
    }

    async fn send(&mut self, frames: &[String]) -> io::Result<()> {
        self.write_buf.clear();
        for frame in frames {
            self.write_buf.extend_from_slice(frame.as_bytes());
            self.write_buf.extend_from_slice(&[FRAME_DELIMITER]);
        }
        self.stream.write_all(&self.write_buf).await?;
        self.stream.flush().await
    }

    async fn close(&mut self) {
        let _ = self.stream.shutdown().await;
    }
}

/// Configure an accepted TCP stream
pub fn configure_stream(stream: &TcpStream) -> io::Result<()> {
    stream.set_nodelay(true)
}
