//! Streaming frame splitter and packet decoder

use bytes::{Buf, Bytes, BytesMut};
use serde_json::{Map, Value};

use super::{DEFAULT_MAX_FRAME_SIZE, FRAME_DELIMITER};
use crate::protocol::{
    keys, Auth, AuthAck, Conn, ConnAck, DecodeError, Packet, PacketType, PubAck, Publish, Push,
    PushAck, QoS, StatusCode, SubAck, Subscribe, UnsubAck, Unsubscribe,
};

/// Accumulates reads and yields complete NUL-terminated frames.
///
/// A read may carry zero, one or many frames and a frame may span
/// several reads; nothing is yielded until its terminator has arrived.
#[derive(Debug)]
pub struct Decoder {
    buffer: BytesMut,
    /// Prefix of `buffer` already known to hold no terminator
    scanned: usize,
    max_frame_size: usize,
}

impl Default for Decoder {
    fn default() -> Self {
        Self::new()
    }
}

impl Decoder {
    pub fn new() -> Self {
        Self {
            buffer: BytesMut::with_capacity(4096),
            scanned: 0,
            max_frame_size: DEFAULT_MAX_FRAME_SIZE,
        }
    }

    /// Set the maximum size of a single frame
    pub fn with_max_frame_size(mut self, max_frame_size: usize) -> Self {
        self.max_frame_size = max_frame_size;
        self
    }

    /// Buffer to read socket data into directly
    pub fn buffer_mut(&mut self) -> &mut BytesMut {
        &mut self.buffer
    }

    /// Append raw bytes
    pub fn extend(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Number of bytes waiting for a terminator
    pub fn buffered(&self) -> usize {
        self.buffer.len()
    }

    /// Split off the next complete frame, skipping empty ones.
    ///
    /// Fails only when an unterminated run exceeds the maximum frame size;
    /// the connection cannot resynchronise after that.
    pub fn next_frame(&mut self) -> Result<Option<Bytes>, DecodeError> {
        loop {
            let start = self.scanned.min(self.buffer.len());
            let found = self.buffer[start..]
                .iter()
                .position(|b| *b == FRAME_DELIMITER);
            let Some(pos) = found.map(|offset| start + offset) else {
                self.scanned = self.buffer.len();
                if self.buffer.len() > self.max_frame_size {
                    return Err(DecodeError::FrameTooLarge {
                        size: self.buffer.len(),
                        max: self.max_frame_size,
                    });
                }
                return Ok(None);
            };

            if pos > self.max_frame_size {
                return Err(DecodeError::FrameTooLarge {
                    size: pos,
                    max: self.max_frame_size,
                });
            }

            let frame = self.buffer.split_to(pos).freeze();
            self.buffer.advance(1);
            self.scanned = 0;

            if frame.iter().all(|b| b.is_ascii_whitespace()) {
                continue;
            }
            return Ok(Some(frame));
        }
    }

    /// Split and decode the next frame.
    ///
    /// The outer `Result` is fatal for the stream, the inner one only for
    /// the frame that failed to parse.
    #[allow(clippy::type_complexity)]
    pub fn next_packet(&mut self) -> Result<Option<Result<Packet, DecodeError>>, DecodeError> {
        Ok(self.next_frame()?.map(|frame| decode(&frame)))
    }
}

/// Decode a single frame (without its terminator)
pub fn decode(frame: &[u8]) -> Result<Packet, DecodeError> {
    let text = std::str::from_utf8(frame).map_err(|_| DecodeError::InvalidUtf8)?;
    let value: Value =
        serde_json::from_str(text).map_err(|e| DecodeError::InvalidJson(e.to_string()))?;

    let Value::Object(root) = value else {
        return Err(DecodeError::NotAnObject);
    };
    if root.len() != 1 {
        return Err(DecodeError::RootKeyCount(root.len()));
    }
    let Some((key, body)) = root.into_iter().next() else {
        return Err(DecodeError::RootKeyCount(0));
    };
    let packet_type =
        PacketType::from_key(&key).ok_or(DecodeError::UnknownPacketType(key))?;

    let packet = match packet_type {
        PacketType::Hb => Packet::Heartbeat,
        PacketType::HbAck => Packet::HeartbeatAck,
        PacketType::Disconn => Packet::Disconnect,
        PacketType::Auth => {
            let mut body = Fields::new(body)?;
            Packet::Auth(Auth {
                data: body.take_data(),
            })
        }
        PacketType::AuthAck => {
            let body = Fields::new(body)?;
            Packet::AuthAck(AuthAck {
                status: body.status()?,
                client_id: body.string(keys::CLIENT_ID)?,
                token: body.string(keys::TOKEN)?,
                message: body.string(keys::MESSAGE)?,
            })
        }
        PacketType::Conn => {
            let body = Fields::new(body)?;
            Packet::Conn(Conn {
                token: body.string(keys::TOKEN)?,
                client_id: body.string(keys::CLIENT_ID)?,
            })
        }
        PacketType::ConnAck => {
            let body = Fields::new(body)?;
            Packet::ConnAck(ConnAck {
                status: body.status()?,
                timeout: body.unsigned(keys::TIMEOUT)?,
            })
        }
        PacketType::Pub => {
            let mut body = Fields::new(body)?;
            Packet::Publish(Publish {
                channel: body.string(keys::CHANNEL)?,
                packet_id: body.packet_id()?,
                qos: body.qos()?,
                retain: body.flag(keys::RETAIN)?,
                data: body.take_data(),
            })
        }
        PacketType::PubAck => {
            let mut body = Fields::new(body)?;
            Packet::PubAck(PubAck {
                status: body.status()?,
                packet_id: body.string(keys::PACKET_ID)?,
                data: body.take(keys::DATA),
            })
        }
        PacketType::Push => {
            let mut body = Fields::new(body)?;
            Packet::Push(Push {
                channel: body.string(keys::CHANNEL)?,
                sender: body.string(keys::CLIENT_ID)?,
                packet_id: body.packet_id()?,
                qos: body.qos()?,
                retain: body.flag(keys::RETAIN)?,
                data: body.take_data(),
            })
        }
        PacketType::PushAck => {
            let body = Fields::new(body)?;
            Packet::PushAck(PushAck {
                packet_id: body.string(keys::PACKET_ID)?,
            })
        }
        PacketType::Sub => {
            let body = Fields::new(body)?;
            Packet::Subscribe(Subscribe {
                channel: body.string(keys::CHANNEL)?,
                persistent: body.flag(keys::PERSISTENT)?,
            })
        }
        PacketType::SubAck => {
            let body = Fields::new(body)?;
            Packet::SubAck(SubAck {
                status: body.status()?,
                channel: body.string(keys::CHANNEL)?,
            })
        }
        PacketType::Unsub => {
            let body = Fields::new(body)?;
            Packet::Unsubscribe(Unsubscribe {
                channel: body.string(keys::CHANNEL)?,
            })
        }
        PacketType::UnsubAck => {
            let body = Fields::new(body)?;
            Packet::UnsubAck(UnsubAck {
                status: body.status()?,
                channel: body.string(keys::CHANNEL)?,
            })
        }
    };

    Ok(packet)
}

/// Lenient accessors over a packet body.
///
/// Missing fields fall back to defaults so the engine can answer with a
/// status code; only values of the wrong JSON shape are rejected.
struct Fields(Map<String, Value>);

impl Fields {
    fn new(body: Value) -> Result<Self, DecodeError> {
        match body {
            Value::Object(map) => Ok(Self(map)),
            _ => Err(DecodeError::InvalidField("body")),
        }
    }

    fn get(&self, key: &'static str) -> Option<&Value> {
        self.0.get(key).filter(|v| !v.is_null())
    }

    fn take(&mut self, key: &'static str) -> Option<Value> {
        self.0.remove(key).filter(|v| !v.is_null())
    }

    fn take_data(&mut self) -> Value {
        self.take(keys::DATA).unwrap_or(Value::Null)
    }

    fn string(&self, key: &'static str) -> Result<String, DecodeError> {
        match self.get(key) {
            None => Ok(String::new()),
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(_) => Err(DecodeError::InvalidField(key)),
        }
    }

    fn packet_id(&self) -> Result<Option<String>, DecodeError> {
        match self.get(keys::PACKET_ID) {
            None => Ok(None),
            Some(Value::String(s)) => Ok(Some(s.clone())),
            Some(Value::Number(n)) => Ok(Some(n.to_string())),
            Some(_) => Err(DecodeError::InvalidField(keys::PACKET_ID)),
        }
    }

    fn flag(&self, key: &'static str) -> Result<bool, DecodeError> {
        match self.get(key) {
            None => Ok(false),
            Some(Value::Bool(b)) => Ok(*b),
            Some(Value::Number(n)) => Ok(n.as_f64().map(|v| v != 0.0).unwrap_or(false)),
            Some(_) => Err(DecodeError::InvalidField(key)),
        }
    }

    fn qos(&self) -> Result<QoS, DecodeError> {
        match self.get(keys::QOS) {
            None => Ok(QoS::AtMostOnce),
            Some(Value::Number(n)) => {
                let raw = n.as_i64().ok_or(DecodeError::InvalidField(keys::QOS))?;
                u8::try_from(raw)
                    .ok()
                    .and_then(QoS::from_u8)
                    .ok_or(DecodeError::InvalidQoS(raw))
            }
            Some(_) => Err(DecodeError::InvalidField(keys::QOS)),
        }
    }

    fn status(&self) -> Result<StatusCode, DecodeError> {
        match self.get(keys::STATUS) {
            Some(Value::Number(n)) => n
                .as_i64()
                .map(StatusCode::from_code)
                .ok_or(DecodeError::InvalidField(keys::STATUS)),
            _ => Err(DecodeError::InvalidField(keys::STATUS)),
        }
    }

    fn unsigned(&self, key: &'static str) -> Result<u64, DecodeError> {
        match self.get(key) {
            None => Ok(0),
            Some(Value::Number(n)) => n.as_u64().ok_or(DecodeError::InvalidField(key)),
            Some(_) => Err(DecodeError::InvalidField(key)),
        }
    }
}
