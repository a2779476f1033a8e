//! Protocol error types

use std::fmt;

/// Errors that can occur during packet decoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DecodeError {
    /// Not enough data in buffer
    InsufficientData,
    /// Invalid packet type (0 and 15 are reserved)
    InvalidPacketType(u8),
    /// Remaining length continuation bit set on the 4th byte
    MalformedRemainingLength,
    /// Invalid protocol name or level
    InvalidProtocolName,
    /// Invalid QoS value
    InvalidQoS(u8),
    /// Invalid UTF-8 string
    InvalidUtf8,
    /// Invalid fixed-header control flags
    InvalidFlags,
    /// Invalid topic name or filter
    InvalidTopic(&'static str),
    /// Malformed packet
    MalformedPacket(&'static str),
    /// Remaining length exceeds the configured maximum
    PacketTooLarge,
    /// Invalid SUBACK return code
    InvalidReturnCode(u8),
    /// Structurally valid packet type the broker does not handle (QoS flow)
    UnsupportedPacket(u8),
}

impl fmt::Display for DecodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InsufficientData => write!(f, "insufficient data in buffer"),
            Self::InvalidPacketType(t) => write!(f, "invalid packet type: {}", t),
            Self::MalformedRemainingLength => {
                write!(f, "malformed remaining length: continuation bit on 4th byte")
            }
            Self::InvalidProtocolName => write!(f, "invalid protocol name or level"),
            Self::InvalidQoS(q) => write!(f, "invalid QoS value: {}", q),
            Self::InvalidUtf8 => write!(f, "invalid UTF-8 string"),
            Self::InvalidFlags => write!(f, "invalid packet flags"),
            Self::InvalidTopic(msg) => write!(f, "invalid topic: {}", msg),
            Self::MalformedPacket(msg) => write!(f, "malformed packet: {}", msg),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::InvalidReturnCode(c) => write!(f, "invalid return code: {:#04x}", c),
            Self::UnsupportedPacket(t) => write!(f, "unsupported packet type: {}", t),
        }
    }
}

impl std::error::Error for DecodeError {}

/// Errors that can occur during packet encoding
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EncodeError {
    /// Caller-supplied buffer shorter than the computed packet length
    BufferTooSmall,
    /// Remaining length exceeds the protocol maximum
    PacketTooLarge,
    /// String exceeds the 65535-byte MQTT string limit
    StringTooLong,
}

impl fmt::Display for EncodeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BufferTooSmall => write!(f, "buffer too small"),
            Self::PacketTooLarge => write!(f, "packet too large"),
            Self::StringTooLong => write!(f, "string too long"),
        }
    }
}

impl std::error::Error for EncodeError {}

/// Topic name/filter structural violation.
///
/// Surfaced by the topic parsers; the codec maps it to [`DecodeError`] for
/// on-wire violations.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTopic(pub &'static str);

impl fmt::Display for InvalidTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "invalid topic name/filter: {}", self.0)
    }
}

impl std::error::Error for InvalidTopic {}

impl From<InvalidTopic> for DecodeError {
    fn from(e: InvalidTopic) -> Self {
        DecodeError::InvalidTopic(e.0)
    }
}
