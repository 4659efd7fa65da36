//! Node-to-node control-plane wire protocol.
//!
//! This module defines the binary format replicas use to exchange small coordination
//! messages: sequence-number acknowledgements, coherency leases, page prefetch hints,
//! page compaction requests and RTT probes.
//!
//! # Overview
//!
//! Every datagram is a single [`Envelope`]: a fixed 24 byte header, a type-specific
//! payload and a trailing NUL-terminated host name identifying the sender. The header
//! declares the size of each region so a receiver can check the packet against the
//! number of bytes it actually read before touching the payload.
//!
//! # Binary Format
//!
//! - All integers are big-endian and fixed width.
//! - Header fields, in order: `header_size: u32`, `message_type: i32`,
//!   `payload_len: u32`, `from_host_len: u32`, `from: i32`, `to: i32`.
//! - `from` and `to` are legacy numeric node ids and must always be zero.
//! - `from_host_len` counts the terminating NUL of the host name.
//!
//! The layout is shared by every node in a cluster; changing a field size or order
//! breaks interoperability silently.
//!
//! # Key Components
//!
//! - [`Envelope`]: owned, outgoing message.
//! - [`EnvelopeRef`]: validated view over a received packet.
//! - [`Payload`]: encode/decode contract implemented by every payload record.
//! - [`MessageType`]: stable wire tags.
//!
//! # Extensibility
//!
//! Unknown message types decode into a valid [`EnvelopeRef`]; the receiver drops them
//! after logging, so new types can be rolled out without breaking older nodes.
mod envelope;
mod payload;

use bincode::config::{BigEndian, Configuration, Fixint};

pub use envelope::{Envelope, EnvelopeRef, HEADER_SIZE, Header, MAX_DATAGRAM_LEN, RecvBuffer};
pub use error::CodecError;
pub use payload::{
    COHERENCY_LEASE_LEN, CoherencyLease, FILE_PAGE_HINT_LEN, FilePageHint, LSN_LEN, Lsn,
    PAGE_COMPACT_HEADER_LEN, PAGE_COMPACT_MAX_LEN, PageCompactRequest, Payload,
    SEQUENCE_ACK_LEN, SequenceAck, TIMESTAMP_LEN, Timestamp,
};

/// Message tags as they appear in the `message_type` header field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum MessageType {
    SequenceAck = 2,
    UdpAck = 25,
    UdpPing = 26,
    UdpTimestamp = 27,
    UdpTimestampAck = 28,
    TcpTimestamp = 29,
    TcpTimestampAck = 30,
    PingTimestamp = 31,
    PingTimestampAck = 32,
    CoherencyLease = 34,
    PageCompact = 35,
    TruncateLog = 38,
    UdpPrefault = 40,
}

impl From<MessageType> for i32 {
    fn from(value: MessageType) -> Self {
        value as i32
    }
}

impl TryFrom<i32> for MessageType {
    type Error = CodecError;

    fn try_from(value: i32) -> Result<Self, Self::Error> {
        match value {
            2 => Ok(MessageType::SequenceAck),
            25 => Ok(MessageType::UdpAck),
            26 => Ok(MessageType::UdpPing),
            27 => Ok(MessageType::UdpTimestamp),
            28 => Ok(MessageType::UdpTimestampAck),
            29 => Ok(MessageType::TcpTimestamp),
            30 => Ok(MessageType::TcpTimestampAck),
            31 => Ok(MessageType::PingTimestamp),
            32 => Ok(MessageType::PingTimestampAck),
            34 => Ok(MessageType::CoherencyLease),
            35 => Ok(MessageType::PageCompact),
            38 => Ok(MessageType::TruncateLog),
            40 => Ok(MessageType::UdpPrefault),
            other => Err(CodecError::UnknownType(other)),
        }
    }
}

/// Encoding shared by headers and payloads: big-endian, no varints.
pub(crate) fn wire_config() -> Configuration<BigEndian, Fixint> {
    bincode::config::standard()
        .with_big_endian()
        .with_fixed_int_encoding()
}

pub mod error {
    use thiserror::Error;

    #[derive(Debug, Error)]
    pub enum CodecError {
        #[error("failed to encode: {0}")]
        Encode(#[from] bincode::error::EncodeError),

        #[error("failed to decode: {0}")]
        Decode(#[from] bincode::error::DecodeError),

        #[error("truncated {what}: need {need} bytes, have {have}")]
        Truncated {
            what: &'static str,
            need: usize,
            have: usize,
        },

        #[error("destination buffer too small: need {need} bytes, have {have}")]
        BufferTooSmall { need: usize, have: usize },

        #[error("payload of {size} bytes exceeds limit of {max}")]
        TooLarge { size: usize, max: usize },

        #[error("invalid read of {actual} bytes (header suggests: {declared})")]
        SizeMismatch { declared: usize, actual: usize },

        #[error("unexpected to/from setting: from={from} to={to}")]
        UnexpectedPeerIds { from: i32, to: i32 },

        #[error("invalid host trailer: {0}")]
        BadTrailer(&'static str),

        #[error("unknown message type {0}")]
        UnknownType(i32),
    }
}
