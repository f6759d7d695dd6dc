//! MQTT 3.1.1 protocol encoding and decoding.

pub mod codec;
pub mod decoder;
pub mod v4;

pub use decoder::Decoder;
pub use v4::*;

/// Maximum packet size (1MB default).
pub const MAX_PACKET_SIZE: usize = 1024 * 1024;

/// Largest value the remaining length field can carry.
pub const MAX_REMAINING_LENGTH: usize = 268_435_455;

/// Protocol name for MQTT.
pub const PROTOCOL_NAME: &str = "MQTT";

/// Protocol level for MQTT 3.1.1.
pub const PROTOCOL_LEVEL: u8 = 4;
