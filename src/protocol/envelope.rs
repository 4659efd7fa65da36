use bincode::{Decode, Encode};

use super::{MessageType, Payload, error::CodecError, wire_config};

pub const HEADER_SIZE: usize = 24;

/// Capacity of the receive buffer; larger datagrams are truncated by the socket and
/// then fail the size check.
pub const MAX_DATAGRAM_LEN: usize = 1024;

/// Fixed envelope header.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Encode, Decode)]
pub struct Header {
    pub header_size: u32,
    pub message_type: i32,
    pub payload_len: u32,
    pub from_host_len: u32,
    pub from: i32,
    pub to: i32,
}

impl Header {
    pub fn decode(src: &[u8]) -> Result<Self, CodecError> {
        if src.len() < HEADER_SIZE {
            return Err(CodecError::Truncated {
                what: "envelope header",
                need: HEADER_SIZE,
                have: src.len(),
            });
        }
        let (header, _) = bincode::decode_from_slice(&src[..HEADER_SIZE], wire_config())?;
        Ok(header)
    }

    pub fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        if dst.len() < HEADER_SIZE {
            return Err(CodecError::BufferTooSmall {
                need: HEADER_SIZE,
                have: dst.len(),
            });
        }
        Ok(bincode::encode_into_slice(
            self,
            &mut dst[..HEADER_SIZE],
            wire_config(),
        )?)
    }

    /// `header_size + payload_len + from_host_len`, or `None` on overflow.
    pub fn total_len(&self) -> Option<usize> {
        (self.header_size as usize)
            .checked_add(self.payload_len as usize)?
            .checked_add(self.from_host_len as usize)
    }
}

/// Outgoing message, owned by the sender until handed to a transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    message_type: MessageType,
    payload: Vec<u8>,
    source_host: String,
}

impl Envelope {
    pub fn new(message_type: MessageType, payload: Vec<u8>, source_host: &str) -> Self {
        Self {
            message_type,
            payload,
            source_host: source_host.to_string(),
        }
    }

    /// Envelope with no payload, used for pings and bare acks.
    pub fn bare(message_type: MessageType, source_host: &str) -> Self {
        Self::new(message_type, Vec::new(), source_host)
    }

    pub fn with_payload<P: Payload>(
        message_type: MessageType,
        payload: &P,
        source_host: &str,
    ) -> Result<Self, CodecError> {
        Ok(Self::new(message_type, payload.to_bytes()?, source_host))
    }

    pub fn message_type(&self) -> MessageType {
        self.message_type
    }

    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    pub fn source_host(&self) -> &str {
        &self.source_host
    }

    pub fn header(&self) -> Header {
        Header {
            header_size: HEADER_SIZE as u32,
            message_type: self.message_type.into(),
            payload_len: self.payload.len() as u32,
            from_host_len: (self.source_host.len() + 1) as u32,
            from: 0,
            to: 0,
        }
    }

    pub fn encoded_len(&self) -> usize {
        HEADER_SIZE + self.payload.len() + self.source_host.len() + 1
    }

    pub fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        let need = self.encoded_len();
        if dst.len() < need {
            return Err(CodecError::BufferTooSmall {
                need,
                have: dst.len(),
            });
        }

        let mut pos = self.header().encode_into(dst)?;
        dst[pos..pos + self.payload.len()].copy_from_slice(&self.payload);
        pos += self.payload.len();
        dst[pos..pos + self.source_host.len()].copy_from_slice(self.source_host.as_bytes());
        pos += self.source_host.len();
        dst[pos] = 0;

        Ok(pos + 1)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0; self.encoded_len()];
        self.encode_into(&mut buf)?;
        Ok(buf)
    }
}

/// Validated view over a received packet.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnvelopeRef<'a> {
    pub header: Header,
    pub payload: &'a [u8],
    pub source_host: &'a str,
}

impl<'a> EnvelopeRef<'a> {
    /// Checks, in order, that the declared sizes add up to `packet.len()`, that the
    /// legacy `from`/`to` ids are zero and that the host trailer is a non-empty,
    /// NUL-terminated name inside the packet.
    pub fn parse(packet: &'a [u8]) -> Result<Self, CodecError> {
        let header = Header::decode(packet)?;

        let declared = header.total_len().unwrap_or(usize::MAX);
        if declared != packet.len() || (header.header_size as usize) < HEADER_SIZE {
            return Err(CodecError::SizeMismatch {
                declared,
                actual: packet.len(),
            });
        }

        if header.from != 0 || header.to != 0 {
            return Err(CodecError::UnexpectedPeerIds {
                from: header.from,
                to: header.to,
            });
        }

        let payload_start = header.header_size as usize;
        let payload_end = payload_start + header.payload_len as usize;
        let payload = packet
            .get(payload_start..payload_end)
            .ok_or(CodecError::BadTrailer("payload outside packet"))?;
        let trailer = packet
            .get(payload_end..declared)
            .ok_or(CodecError::BadTrailer("host name outside packet"))?;

        let source_host = host_from_trailer(trailer)?;

        Ok(Self {
            header,
            payload,
            source_host,
        })
    }

    /// Wire tag, or the raw value if this build does not know it.
    pub fn message_type(&self) -> Result<MessageType, i32> {
        MessageType::try_from(self.header.message_type).map_err(|_| self.header.message_type)
    }

    /// Copy of this envelope with a new type and source, payload untouched.
    pub fn echo(&self, message_type: MessageType, source_host: &str) -> Envelope {
        Envelope::new(message_type, self.payload.to_vec(), source_host)
    }
}

fn host_from_trailer(trailer: &[u8]) -> Result<&str, CodecError> {
    let (&last, name) = trailer
        .split_last()
        .ok_or(CodecError::BadTrailer("empty host name"))?;
    if last != 0 {
        return Err(CodecError::BadTrailer("host name not NUL terminated"));
    }

    let name = match name.iter().position(|b| *b == 0) {
        Some(nul) => &name[..nul],
        None => name,
    };
    if name.is_empty() {
        return Err(CodecError::BadTrailer("empty host name"));
    }

    std::str::from_utf8(name).map_err(|_| CodecError::BadTrailer("host name is not utf-8"))
}

/// Fixed-capacity receive buffer reused across datagrams.
pub struct RecvBuffer {
    bytes: [u8; MAX_DATAGRAM_LEN],
}

impl Default for RecvBuffer {
    fn default() -> Self {
        Self::new()
    }
}

impl RecvBuffer {
    pub fn new() -> Self {
        Self {
            bytes: [0; MAX_DATAGRAM_LEN],
        }
    }

    pub fn capacity(&self) -> usize {
        MAX_DATAGRAM_LEN
    }

    pub fn as_mut_slice(&mut self) -> &mut [u8] {
        &mut self.bytes
    }

    /// First `len` bytes; `None` if `len` exceeds the capacity.
    pub fn packet(&self, len: usize) -> Option<&[u8]> {
        self.bytes.get(..len)
    }

    /// Copies `data` into the buffer, returning the number of bytes kept.
    pub fn fill(&mut self, data: &[u8]) -> usize {
        let n = data.len().min(MAX_DATAGRAM_LEN);
        self.bytes[..n].copy_from_slice(&data[..n]);
        n
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::protocol::{FilePageHint, Timestamp};

    use super::*;

    fn any_envelope() -> impl Strategy<Value = Envelope> {
        let kinds = vec![
            MessageType::SequenceAck,
            MessageType::UdpPing,
            MessageType::UdpTimestamp,
            MessageType::TcpTimestampAck,
            MessageType::CoherencyLease,
            MessageType::PageCompact,
            MessageType::UdpPrefault,
        ];
        (
            prop::sample::select(kinds),
            prop::collection::vec(any::<u8>(), 0..512),
            "[a-zA-Z0-9.:-]{1,64}",
        )
            .prop_map(|(kind, payload, host)| Envelope::new(kind, payload, &host))
    }

    proptest! {
        #[test]
        fn declared_total_matches_encoding(envelope in any_envelope()) {
            let bytes = envelope.to_bytes()?;
            prop_assert_eq!(bytes.len(), envelope.encoded_len());
            prop_assert_eq!(envelope.header().total_len(), Some(bytes.len()));

            let parsed = EnvelopeRef::parse(&bytes)?;
            prop_assert_eq!(parsed.message_type(), Ok(envelope.message_type()));
            prop_assert_eq!(parsed.payload, envelope.payload());
            prop_assert_eq!(parsed.source_host, envelope.source_host());
        }

        #[test]
        fn every_prefix_is_rejected(envelope in any_envelope(), cut in any::<prop::sample::Index>()) {
            let bytes = envelope.to_bytes()?;
            let len = cut.index(bytes.len());
            prop_assert!(EnvelopeRef::parse(&bytes[..len]).is_err());
        }
    }

    fn hint_envelope() -> Envelope {
        let hint = FilePageHint {
            file_id: 1,
            page_no: 2,
        };
        Envelope::with_payload(MessageType::UdpPrefault, &hint, "node-a").unwrap()
    }

    #[test]
    fn header_layout() {
        let bytes = hint_envelope().to_bytes().unwrap();

        assert_eq!(&bytes[0..4], &24u32.to_be_bytes());
        assert_eq!(&bytes[4..8], &40i32.to_be_bytes());
        assert_eq!(&bytes[8..12], &8u32.to_be_bytes());
        assert_eq!(&bytes[12..16], &7u32.to_be_bytes());
        assert_eq!(&bytes[16..24], &[0; 8]);
        assert_eq!(&bytes[24..32], &[0, 0, 0, 1, 0, 0, 0, 2]);
        assert_eq!(&bytes[32..], b"node-a\0");
    }

    #[test]
    fn declared_sizes_match_encoded_length() {
        let envelopes = [
            hint_envelope(),
            Envelope::bare(MessageType::UdpPing, "n"),
            Envelope::with_payload(
                MessageType::UdpTimestamp,
                &Timestamp::from_micros(42),
                "a-much-longer-host-name.example.com",
            )
            .unwrap(),
        ];

        for envelope in envelopes {
            let bytes = envelope.to_bytes().unwrap();
            assert_eq!(envelope.header().total_len(), Some(bytes.len()));
        }
    }

    #[test]
    fn parse_encoded_envelope() {
        let envelope = hint_envelope();
        let bytes = envelope.to_bytes().unwrap();
        let parsed = EnvelopeRef::parse(&bytes).unwrap();

        assert_eq!(parsed.message_type(), Ok(MessageType::UdpPrefault));
        assert_eq!(parsed.source_host, "node-a");
        assert_eq!(parsed.payload, envelope.payload());
    }

    #[test]
    fn encode_refuses_small_destination() {
        let envelope = hint_envelope();
        let mut dst = vec![0; envelope.encoded_len() - 1];

        assert!(matches!(
            envelope.encode_into(&mut dst),
            Err(CodecError::BufferTooSmall { .. })
        ));
    }

    #[test]
    fn truncated_packet_is_rejected() {
        let bytes = hint_envelope().to_bytes().unwrap();

        assert!(matches!(
            EnvelopeRef::parse(&bytes[..bytes.len() - 1]),
            Err(CodecError::SizeMismatch { .. })
        ));
        assert!(matches!(
            EnvelopeRef::parse(&bytes[..10]),
            Err(CodecError::Truncated { .. })
        ));
    }

    #[test]
    fn overflowing_sizes_are_rejected() {
        let mut bytes = hint_envelope().to_bytes().unwrap();
        bytes[8..12].copy_from_slice(&u32::MAX.to_be_bytes());
        bytes[12..16].copy_from_slice(&u32::MAX.to_be_bytes());

        assert!(matches!(
            EnvelopeRef::parse(&bytes),
            Err(CodecError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn small_header_size_is_rejected() {
        let mut bytes = hint_envelope().to_bytes().unwrap();
        // Shrink the header and grow the payload so the total still adds up.
        bytes[0..4].copy_from_slice(&16u32.to_be_bytes());
        bytes[8..12].copy_from_slice(&16u32.to_be_bytes());

        assert!(matches!(
            EnvelopeRef::parse(&bytes),
            Err(CodecError::SizeMismatch { .. })
        ));
    }

    #[test]
    fn legacy_ids_are_rejected() {
        let mut bytes = hint_envelope().to_bytes().unwrap();
        bytes[20..24].copy_from_slice(&3i32.to_be_bytes());

        assert!(matches!(
            EnvelopeRef::parse(&bytes),
            Err(CodecError::UnexpectedPeerIds { from: 0, to: 3 })
        ));
    }

    #[test]
    fn trailer_must_be_nul_terminated() {
        let mut bytes = hint_envelope().to_bytes().unwrap();
        let last = bytes.len() - 1;
        bytes[last] = b'x';

        assert!(matches!(
            EnvelopeRef::parse(&bytes),
            Err(CodecError::BadTrailer(_))
        ));
    }

    #[test]
    fn trailer_must_not_be_empty() {
        let mut bytes = Envelope::bare(MessageType::UdpPing, "n").to_bytes().unwrap();
        bytes.truncate(HEADER_SIZE);
        bytes[12..16].copy_from_slice(&0u32.to_be_bytes());
        assert!(matches!(
            EnvelopeRef::parse(&bytes),
            Err(CodecError::BadTrailer(_))
        ));

        let mut bytes = Envelope::bare(MessageType::UdpPing, "n").to_bytes().unwrap();
        bytes[HEADER_SIZE] = 0;
        assert!(matches!(
            EnvelopeRef::parse(&bytes),
            Err(CodecError::BadTrailer(_))
        ));
    }

    #[test]
    fn unknown_type_still_parses() {
        let mut bytes = hint_envelope().to_bytes().unwrap();
        bytes[4..8].copy_from_slice(&4242i32.to_be_bytes());

        let parsed = EnvelopeRef::parse(&bytes).unwrap();
        assert_eq!(parsed.message_type(), Err(4242));
    }

    #[test]
    fn echo_keeps_payload() {
        let probe = Envelope::with_payload(
            MessageType::UdpTimestamp,
            &Timestamp::from_micros(99),
            "a",
        )
        .unwrap();
        let bytes = probe.to_bytes().unwrap();
        let reply = EnvelopeRef::parse(&bytes)
            .unwrap()
            .echo(MessageType::UdpTimestampAck, "b");

        assert_eq!(reply.message_type(), MessageType::UdpTimestampAck);
        assert_eq!(reply.payload(), probe.payload());
        assert_eq!(reply.source_host(), "b");
    }

    #[test]
    fn recv_buffer_is_bounded() {
        let mut buf = RecvBuffer::new();

        assert_eq!(buf.fill(&[1; MAX_DATAGRAM_LEN + 10]), MAX_DATAGRAM_LEN);
        assert!(buf.packet(MAX_DATAGRAM_LEN).is_some());
        assert!(buf.packet(MAX_DATAGRAM_LEN + 1).is_none());
    }
}
