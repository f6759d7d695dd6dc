//! Error types for mqttc.

use std::io;

use crate::protocol::{ConnectReturnCode, PacketType};

/// Result type alias for mqttc.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mqttc operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// IO error on the transport.
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// Inbound bytes could not be decoded.
    #[error("decode error: {0}")]
    Decode(#[from] DecodeError),

    /// A transport connect is already in flight.
    #[error("transport connect already pending")]
    ChannelConnectPending,

    /// CONNECT was sent and the CONNACK has not arrived yet.
    #[error("broker connect already pending")]
    BrokerConnectPending,

    /// The client is already connected.
    #[error("already connected")]
    AlreadyConnected,

    /// The operation requires a connected client.
    #[error("not connected")]
    NotConnected,

    /// The broker did not acknowledge CONNECT in time.
    #[error("timeout: connect was not acknowledged")]
    ConnectTimeout,

    /// Connection refused by broker.
    #[error("connection refused: {0}")]
    ConnectionRefused(ConnectReturnCode),

    /// Connection closed by peer.
    #[error("connection closed")]
    ConnectionClosed,

    /// The broker violated the protocol.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Packet identifier does not fit the packet being built.
    #[error("invalid packet identifier: {0}")]
    InvalidPacketIdentifier(&'static str),

    /// Topic name or filter cannot be sent.
    #[error("invalid topic: {0}")]
    InvalidTopic(String),

    /// Encoded packet would not fit the remaining length field.
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },

    /// Invalid configuration.
    #[error("invalid config: {0}")]
    InvalidConfig(String),

    /// No tokio runtime to run the client on.
    #[error("runtime error: {0}")]
    Runtime(String),

    /// The connection event loop has stopped.
    #[error("client stopped")]
    Stopped,

    /// TLS setup failed.
    #[cfg(feature = "tls")]
    #[error("tls error: {0}")]
    Tls(String),
}

/// Why an inbound frame could not be turned into a packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum DecodeError {
    /// Body too short, too long, or otherwise inconsistent.
    #[error("malformed data")]
    MalformedData,

    /// QoS bits were 3.
    #[error("malformed qos: {0}")]
    MalformedQoS(u8),

    /// Packet type nibble was 0 or 15.
    #[error("malformed packet type: {0}")]
    MalformedPacketType(u8),

    /// CONNACK return code outside 0..=5.
    #[error("malformed connack return code: {0}")]
    MalformedConnAckReturnCode(u8),

    /// SUBACK return code outside {0, 1, 2, 0x80}.
    #[error("malformed suback return code: {0:#04x}")]
    MalformedSubAckReturnCode(u8),

    /// Remaining length ran past four bytes.
    #[error("malformed remaining length")]
    MalformedRemainingLength,

    /// A packet type that only flows from client to broker.
    #[error("unexpected packet: {0:?}")]
    UnexpectedPacket(PacketType),

    /// Frame exceeds the configured maximum.
    #[error("packet too large: {size} > {max}")]
    PacketTooLarge { size: usize, max: usize },
}

impl DecodeError {
    /// Whether frame boundaries were lost and the stream cannot be resynchronized.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            DecodeError::MalformedRemainingLength | DecodeError::PacketTooLarge { .. }
        )
    }
}
