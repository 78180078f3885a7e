//! Packet encoder
//!
//! Builds the JSON envelope for a packet after checking that every
//! required field is present. A packet that fails validation is never
//! emitted.

use bytes::{BufMut, BytesMut};
use serde_json::{json, Map, Value};

use super::FRAME_DELIMITER;
use crate::protocol::{keys, EncodeError, Packet, QoS};

/// JMQT packet encoder
#[derive(Debug, Default, Clone, Copy)]
pub struct Encoder;

impl Encoder {
    pub fn new() -> Self {
        Self
    }

    /// Encode a packet and append it to `buf` followed by the NUL terminator
    pub fn encode(&self, packet: &Packet, buf: &mut BytesMut) -> Result<(), EncodeError> {
        let json = self.encode_json(packet)?;
        buf.reserve(json.len() + 1);
        buf.put_slice(json.as_bytes());
        buf.put_u8(FRAME_DELIMITER);
        Ok(())
    }

    /// Encode a packet as a bare JSON document (WebSocket messages carry no terminator)
    pub fn encode_json(&self, packet: &Packet) -> Result<String, EncodeError> {
        let mut body = Map::new();

        match packet {
            Packet::Auth(auth) => {
                body.insert(keys::DATA.into(), auth.data.clone());
            }
            Packet::AuthAck(ack) => {
                body.insert(keys::STATUS.into(), json!(ack.status.code()));
                if ack.status.is_ok() {
                    body.insert(keys::TOKEN.into(), required(&ack.token, "auth token")?);
                    body.insert(keys::CLIENT_ID.into(), required(&ack.client_id, "client id")?);
                } else {
                    body.insert(keys::MESSAGE.into(), required(&ack.message, "message")?);
                }
            }
            Packet::Conn(conn) => {
                body.insert(keys::TOKEN.into(), required(&conn.token, "auth token")?);
                body.insert(keys::CLIENT_ID.into(), required(&conn.client_id, "client id")?);
            }
            Packet::ConnAck(ack) => {
                body.insert(keys::STATUS.into(), json!(ack.status.code()));
                body.insert(keys::TIMEOUT.into(), json!(ack.timeout));
            }
            Packet::Publish(publish) => {
                body.insert(keys::CHANNEL.into(), required(&publish.channel, "channel name")?);
                body.insert(keys::DATA.into(), publish.data.clone());
                match (&publish.packet_id, publish.qos) {
                    (Some(id), _) => {
                        body.insert(keys::PACKET_ID.into(), required(id, "packet id")?);
                    }
                    (None, QoS::AtLeastOnce) => return Err(EncodeError::EmptyField("packet id")),
                    (None, QoS::AtMostOnce) => {}
                }
                if publish.qos == QoS::AtLeastOnce {
                    body.insert(keys::QOS.into(), json!(publish.qos as u8));
                }
                if publish.retain {
                    body.insert(keys::RETAIN.into(), json!(1));
                }
            }
            Packet::PubAck(ack) => {
                body.insert(keys::STATUS.into(), json!(ack.status.code()));
                body.insert(keys::PACKET_ID.into(), required(&ack.packet_id, "packet id")?);
                if let Some(data) = &ack.data {
                    body.insert(keys::DATA.into(), data.clone());
                }
            }
            Packet::Push(push) => {
                body.insert(keys::CHANNEL.into(), required(&push.channel, "channel name")?);
                body.insert(keys::DATA.into(), push.data.clone());
                body.insert(keys::CLIENT_ID.into(), Value::String(push.sender.trim().to_string()));
                if push.retain {
                    body.insert(keys::RETAIN.into(), json!(1));
                }
                if push.qos == QoS::AtLeastOnce {
                    let id = push
                        .packet_id
                        .as_deref()
                        .ok_or(EncodeError::EmptyField("packet id"))?;
                    body.insert(keys::PACKET_ID.into(), required(id, "packet id")?);
                    body.insert(keys::QOS.into(), json!(push.qos as u8));
                }
            }
            Packet::PushAck(ack) => {
                body.insert(keys::PACKET_ID.into(), required(&ack.packet_id, "packet id")?);
            }
            Packet::Subscribe(sub) => {
                body.insert(keys::CHANNEL.into(), required(&sub.channel, "channel name")?);
                body.insert(keys::PERSISTENT.into(), json!(sub.persistent as u8));
            }
            Packet::SubAck(ack) => {
                body.insert(keys::STATUS.into(), json!(ack.status.code()));
                body.insert(keys::CHANNEL.into(), required(&ack.channel, "channel name")?);
            }
            Packet::Unsubscribe(unsub) => {
                body.insert(keys::CHANNEL.into(), required(&unsub.channel, "channel name")?);
            }
            Packet::UnsubAck(ack) => {
                body.insert(keys::STATUS.into(), json!(ack.status.code()));
                body.insert(keys::CHANNEL.into(), required(&ack.channel, "channel name")?);
            }
            Packet::Heartbeat | Packet::HeartbeatAck | Packet::Disconnect => {}
        }

        let mut root = Map::with_capacity(1);
        root.insert(packet.packet_type().key().to_string(), Value::Object(body));
        serde_json::to_string(&Value::Object(root)).map_err(|e| EncodeError::Json(e.to_string()))
    }
}

/// Trimmed, non-blank string field
fn required(value: &str, name: &'static str) -> Result<Value, EncodeError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(EncodeError::EmptyField(name));
    }
    Ok(Value::String(value.to_string()))
}
