//! Protocol error types

use std::fmt;

/// Errors that can occur during frame splitting and packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Frame is not valid UTF-8
    InvalidUtf8,
    /// Frame is not valid JSON
    InvalidJson(String),
    /// Root value is not a JSON object
    NotAnObject,
    /// Root object must have exactly one key
    RootKeyCount(usize),
    /// Root key is not a known packet type
    UnknownPacketType(String),
    /// A field has a value of the wrong shape
    InvalidField(&'static str),
    /// Invalid QoS value
    InvalidQoS(i64),
    /// Unterminated frame grew beyond the configured maximum
    FrameTooLarge { size: usize, max: usize },
}

impl DecodeError {
    /// Whether the error only affects a single frame (the connection survives)
    pub fn is_malformed_packet(&self) -> bool {
        !matches!(self, Self::FrameTooLarge { .. })
    }
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidUtf8 => write!(f, "malformed packet: invalid UTF-8"),
            Self::InvalidJson(e) => write!(f, "malformed packet: invalid JSON: {}", e),
            Self::NotAnObject => write!(f, "malformed packet: root must be an object"),
            Self::RootKeyCount(n) => {
                write!(f, "malformed packet: root element must be one (found {})", n)
            }
            Self::UnknownPacketType(t) => {
                write!(f, "malformed packet: invalid packet type '{}'", t)
            }
            Self::InvalidField(name) => write!(f, "malformed packet: invalid field '{}'", name),
            Self::InvalidQoS(q) => write!(f, "malformed packet: invalid QoS value {}", q),
            Self::FrameTooLarge { size, max } => {
                write!(f, "frame too large: {} bytes (max {})", size, max)
            }
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur while building an outgoing frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Required string field is missing or blank
    EmptyField(&'static str),
    /// JSON serialization failed
    Json(String),
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::EmptyField(name) => write!(f, "'{}' can not be None or empty", name),
            Self::Json(e) => write!(f, "JSON encoding failed: {}", e),
        }
    }
}

impl std::error::Error for EncodeError {}

/// General protocol errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    /// Decode error
    Decode(DecodeError),
    /// Encode error
    Encode(EncodeError),
    /// Frame not permitted in the current session state
    ProtocolViolation(&'static str),
}

impl fmt::Display for ProtocolError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Decode(e) => write!(f, "decode error: {}", e),
            Self::Encode(e) => write!(f, "encode error: {}", e),
            Self::ProtocolViolation(msg) => write!(f, "protocol violation: {}", msg),
        }
    }
}

impl std::error::Error for ProtocolError {}

impl From<DecodeError> for ProtocolError {
    fn from(e: DecodeError) -> Self {
        Self::Decode(e)
    }
}

impl From<EncodeError> for ProtocolError {
    fn from(e: EncodeError) -> Self {
        Self::Encode(e)
    }
}
