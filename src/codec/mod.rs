//! JMQT Packet Codec
//!
//! Frames on the wire are UTF-8 JSON objects terminated by a NUL byte.
//! [`Decoder`] buffers raw reads and splits them strictly on NUL
//! boundaries; [`decode`] turns one frame into a [`Packet`](crate::protocol::Packet);
//! [`Encoder`] validates and serializes outgoing packets.

mod decode;
mod encode;

#[cfg(test)]
mod tests;

pub use decode::{decode, Decoder};
pub use encode::Encoder;

/// Frame terminator
pub const FRAME_DELIMITER: u8 = 0;

/// Default upper bound for a single unterminated frame
pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024 * 1024;
