//! WebSocket Transport
//!
//! Each WebSocket message carries one JMQT frame. Inbound text and binary
//! messages are fed to the decoder with a terminator appended when the
//! client left it out; outbound frames go out as text messages without
//! the terminator.

use std::io;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::WebSocketStream;

use super::FrameIo;
use crate::codec::{Decoder, FRAME_DELIMITER};

/// JMQT frames over a WebSocket
pub struct WsIo<S> {
    ws: WebSocketStream<S>,
}

impl<S> WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Run the server handshake on an accepted stream (plain or TLS)
    pub async fn accept(stream: S) -> io::Result<Self> {
        let ws = tokio_tungstenite::accept_async(stream)
            .await
            .map_err(io::Error::other)?;
        Ok(Self::new(ws))
    }

    pub fn new(ws: WebSocketStream<S>) -> Self {
        Self { ws }
    }
}

fn push_message(decoder: &mut Decoder, data: &[u8]) {
    decoder.extend(data);
    if data.last() != Some(&FRAME_DELIMITER) {
        decoder.extend(&[FRAME_DELIMITER]);
    }
}

#[async_trait]
impl<S> FrameIo for WsIo<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn fill(&mut self, decoder: &mut Decoder) -> io::Result<bool> {
        loop {
            match self.ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    push_message(decoder, text.as_bytes());
                    return Ok(true);
                }
                Some(Ok(Message::Binary(data))) => {
                    push_message(decoder, &data);
                    return Ok(true);
                }
                Some(Ok(Message::Close(_))) | None => return Ok(false),
                // Pings are answered by tungstenite
                Some(Ok(_)) => continue,
                Some(Err(e)) => return Err(io::Error::other(e)),
            }
        }
    }

    async fn send(&mut self, frames: &[String]) -> io::Result<()> {
        for frame in frames {
            self.ws
                .feed(Message::Text(frame.clone()))
                .await
                .map_err(io::Error::other)?;
        }
        self.ws.flush().await.map_err(io::Error::other)
    }

    async fn close(&mut self) {
        let _ = self.ws.close(None).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::Packet;

    #[test]
    fn test_push_message_appends_missing_terminator() {
        let mut decoder = Decoder::new();
        push_message(&mut decoder, b"{\"hb\":{}}");
        push_message(&mut decoder, b"{\"hb\":{}}\0");

        assert_eq!(decoder.next_packet().unwrap(), Some(Ok(Packet::Heartbeat)));
        assert_eq!(decoder.next_packet().unwrap(), Some(Ok(Packet::Heartbeat)));
        assert_eq!(decoder.next_packet().unwrap(), None);
    }
}
