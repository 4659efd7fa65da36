use std::fmt;

use bincode::{Decode, Encode};

use super::{error::CodecError, wire_config};

pub const LSN_LEN: usize = 8;
pub const SEQUENCE_ACK_LEN: usize = 16;
pub const COHERENCY_LEASE_LEN: usize = 12;
pub const FILE_PAGE_HINT_LEN: usize = 8;
pub const TIMESTAMP_LEN: usize = 16;
pub const PAGE_COMPACT_HEADER_LEN: usize = 8;

/// Largest page compaction payload a node will put on the wire.
pub const PAGE_COMPACT_MAX_LEN: usize = 512;

/// Encode/decode contract for envelope payloads.
///
/// `decode` rejects buffers shorter than the record requires; `encode_into` never
/// truncates and fails when `dst` cannot hold the whole record.
pub trait Payload: Sized {
    fn encoded_len(&self) -> usize;

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError>;

    fn decode(src: &[u8]) -> Result<Self, CodecError>;

    fn to_bytes(&self) -> Result<Vec<u8>, CodecError> {
        let mut buf = vec![0; self.encoded_len()];
        let n = self.encode_into(&mut buf)?;
        buf.truncate(n);
        Ok(buf)
    }
}

fn encode_fixed<T: Encode>(value: &T, len: usize, dst: &mut [u8]) -> Result<usize, CodecError> {
    if dst.len() < len {
        return Err(CodecError::BufferTooSmall {
            need: len,
            have: dst.len(),
        });
    }
    Ok(bincode::encode_into_slice(value, &mut dst[..len], wire_config())?)
}

fn decode_fixed<T: Decode<()>>(src: &[u8], len: usize, what: &'static str) -> Result<T, CodecError> {
    if src.len() < len {
        return Err(CodecError::Truncated {
            what,
            need: len,
            have: src.len(),
        });
    }
    let (value, _) = bincode::decode_from_slice(&src[..len], wire_config())?;
    Ok(value)
}

/// Position in the replicated write-ahead log.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Encode, Decode)]
pub struct Lsn {
    pub file: u32,
    pub offset: u32,
}

impl Lsn {
    pub fn new(file: u32, offset: u32) -> Self {
        Self { file, offset }
    }

    /// File number zero never names a real log position.
    pub fn is_valid(&self) -> bool {
        self.file != 0
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.file, self.offset)
    }
}

impl Payload for Lsn {
    fn encoded_len(&self) -> usize {
        LSN_LEN
    }

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        encode_fixed(self, LSN_LEN, dst)
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        decode_fixed(src, LSN_LEN, "lsn")
    }
}

/// Durability acknowledgement a replica sends to the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct SequenceAck {
    pub lsn: Lsn,
    pub generation: u32,
    pub commit_generation: u32,
}

impl Payload for SequenceAck {
    fn encoded_len(&self) -> usize {
        SEQUENCE_ACK_LEN
    }

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        encode_fixed(self, SEQUENCE_ACK_LEN, dst)
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        decode_fixed(src, SEQUENCE_ACK_LEN, "sequence ack")
    }
}

/// Time-bounded permission to serve reads, issued by the coordinator.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct CoherencyLease {
    pub issue_time_ms: u64,
    pub lease_duration_ms: i32,
}

impl CoherencyLease {
    /// Wall-clock millisecond at which the lease lapses.
    pub fn expires_at_ms(&self) -> u64 {
        self.issue_time_ms
            .saturating_add_signed(i64::from(self.lease_duration_ms))
    }
}

impl Payload for CoherencyLease {
    fn encoded_len(&self) -> usize {
        COHERENCY_LEASE_LEN
    }

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        encode_fixed(self, COHERENCY_LEASE_LEN, dst)
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        decode_fixed(src, COHERENCY_LEASE_LEN, "coherency lease")
    }
}

/// Advisory prefetch hint; never acknowledged.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct FilePageHint {
    pub file_id: u32,
    pub page_no: u32,
}

impl Payload for FilePageHint {
    fn encoded_len(&self) -> usize {
        FILE_PAGE_HINT_LEN
    }

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        encode_fixed(self, FILE_PAGE_HINT_LEN, dst)
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        decode_fixed(src, FILE_PAGE_HINT_LEN, "file page hint")
    }
}

/// Probe timestamp, laid out like a 64-bit `timeval`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Encode, Decode)]
pub struct Timestamp {
    pub secs: i64,
    pub micros: i64,
}

impl Timestamp {
    pub fn from_micros(micros: i64) -> Self {
        Self {
            secs: micros.div_euclid(1_000_000),
            micros: micros.rem_euclid(1_000_000),
        }
    }

    pub fn as_micros(&self) -> i64 {
        self.secs
            .saturating_mul(1_000_000)
            .saturating_add(self.micros)
    }
}

impl Payload for Timestamp {
    fn encoded_len(&self) -> usize {
        TIMESTAMP_LEN
    }

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        encode_fixed(self, TIMESTAMP_LEN, dst)
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        decode_fixed(src, TIMESTAMP_LEN, "timestamp")
    }
}

#[derive(Encode, Decode)]
struct CompactHeader {
    file_id: i32,
    size: u32,
}

/// Request asking the coordinator to compact pages of a file.
///
/// On the wire: `file_id: i32`, `size: u32`, then `size` opaque bytes.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PageCompactRequest {
    pub file_id: i32,
    pub data: Vec<u8>,
}

impl PageCompactRequest {
    pub fn new(file_id: i32, data: Vec<u8>) -> Result<Self, CodecError> {
        if data.len() > PAGE_COMPACT_MAX_LEN {
            return Err(CodecError::TooLarge {
                size: data.len(),
                max: PAGE_COMPACT_MAX_LEN,
            });
        }
        Ok(Self { file_id, data })
    }

    pub fn size(&self) -> u32 {
        self.data.len() as u32
    }
}

impl Payload for PageCompactRequest {
    fn encoded_len(&self) -> usize {
        PAGE_COMPACT_HEADER_LEN + self.data.len()
    }

    fn encode_into(&self, dst: &mut [u8]) -> Result<usize, CodecError> {
        if self.data.len() > PAGE_COMPACT_MAX_LEN {
            return Err(CodecError::TooLarge {
                size: self.data.len(),
                max: PAGE_COMPACT_MAX_LEN,
            });
        }
        let need = self.encoded_len();
        if dst.len() < need {
            return Err(CodecError::BufferTooSmall {
                need,
                have: dst.len(),
            });
        }

        let header = CompactHeader {
            file_id: self.file_id,
            size: self.size(),
        };
        encode_fixed(&header, PAGE_COMPACT_HEADER_LEN, dst)?;
        dst[PAGE_COMPACT_HEADER_LEN..need].copy_from_slice(&self.data);
        Ok(need)
    }

    fn decode(src: &[u8]) -> Result<Self, CodecError> {
        let header: CompactHeader = decode_fixed(src, PAGE_COMPACT_HEADER_LEN, "compaction header")?;
        let size = header.size as usize;
        if size > PAGE_COMPACT_MAX_LEN {
            return Err(CodecError::TooLarge {
                size,
                max: PAGE_COMPACT_MAX_LEN,
            });
        }

        let data = PAGE_COMPACT_HEADER_LEN
            .checked_add(size)
            .and_then(|end| src.get(PAGE_COMPACT_HEADER_LEN..end))
            .ok_or(CodecError::Truncated {
                what: "compaction data",
                need: PAGE_COMPACT_HEADER_LEN + size,
                have: src.len(),
            })?;

        Ok(Self {
            file_id: header.file_id,
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use crate::protocol::{
        COHERENCY_LEASE_LEN, CodecError, CoherencyLease, FilePageHint, Lsn,
        PAGE_COMPACT_HEADER_LEN, PAGE_COMPACT_MAX_LEN, PageCompactRequest, Payload,
        SequenceAck, Timestamp,
    };

    fn any_lsn() -> impl Strategy<Value = Lsn> {
        (any::<u32>(), any::<u32>()).prop_map(|(file, offset)| Lsn::new(file, offset))
    }

    proptest! {
        #[test]
        fn lsn_roundtrip(lsn in any_lsn()) {
            prop_assert_eq!(Lsn::decode(&lsn.to_bytes()?)?, lsn);
        }

        #[test]
        fn sequence_ack_roundtrip(
            lsn in any_lsn(),
            generation in any::<u32>(),
            commit_generation in any::<u32>(),
        ) {
            let ack = SequenceAck { lsn, generation, commit_generation };
            prop_assert_eq!(SequenceAck::decode(&ack.to_bytes()?)?, ack);
        }

        #[test]
        fn lease_roundtrip(issue_time_ms in any::<u64>(), lease_duration_ms in any::<i32>()) {
            let lease = CoherencyLease { issue_time_ms, lease_duration_ms };
            prop_assert_eq!(CoherencyLease::decode(&lease.to_bytes()?)?, lease);
        }

        #[test]
        fn hint_roundtrip(file_id in any::<u32>(), page_no in any::<u32>()) {
            let hint = FilePageHint { file_id, page_no };
            prop_assert_eq!(FilePageHint::decode(&hint.to_bytes()?)?, hint);
        }

        #[test]
        fn timestamp_roundtrip(secs in any::<i64>(), micros in any::<i64>()) {
            let ts = Timestamp { secs, micros };
            prop_assert_eq!(Timestamp::decode(&ts.to_bytes()?)?, ts);
        }

        #[test]
        fn compaction_roundtrip(
            file_id in any::<i32>(),
            data in prop::collection::vec(any::<u8>(), 0..=PAGE_COMPACT_MAX_LEN),
        ) {
            let req = PageCompactRequest::new(file_id, data)?;
            let bytes = req.to_bytes()?;
            prop_assert_eq!(bytes.len(), PAGE_COMPACT_HEADER_LEN + req.data.len());
            prop_assert_eq!(PageCompactRequest::decode(&bytes)?, req);
        }

        #[test]
        fn compaction_decode_never_overreads(bytes in prop::collection::vec(any::<u8>(), 0..600)) {
            if let Ok(req) = PageCompactRequest::decode(&bytes) {
                prop_assert!(req.data.len() <= PAGE_COMPACT_MAX_LEN);
                prop_assert!(PAGE_COMPACT_HEADER_LEN + req.data.len() <= bytes.len());
            }
        }
    }

    #[test]
    fn sequence_ack_layout() {
        let ack = SequenceAck {
            lsn: Lsn::new(7, 0x0102_0304),
            generation: 9,
            commit_generation: 8,
        };
        let bytes = ack.to_bytes().unwrap();

        assert_eq!(
            bytes,
            vec![0, 0, 0, 7, 1, 2, 3, 4, 0, 0, 0, 9, 0, 0, 0, 8]
        );
        assert_eq!(SequenceAck::decode(&bytes).unwrap(), ack);
    }

    #[test]
    fn lease_layout() {
        let lease = CoherencyLease {
            issue_time_ms: 0x0000_0102_0304_0506,
            lease_duration_ms: -2,
        };
        let bytes = lease.to_bytes().unwrap();

        assert_eq!(bytes.len(), COHERENCY_LEASE_LEN);
        assert_eq!(&bytes[..8], &[0, 0, 1, 2, 3, 4, 5, 6]);
        assert_eq!(&bytes[8..], &[0xff, 0xff, 0xff, 0xfe]);
        assert_eq!(CoherencyLease::decode(&bytes).unwrap(), lease);
    }

    #[test]
    fn lease_expiry() {
        let lease = CoherencyLease {
            issue_time_ms: 1_000,
            lease_duration_ms: 500,
        };
        assert_eq!(lease.expires_at_ms(), 1_500);
    }

    #[test]
    fn short_fixed_payloads_are_rejected() {
        let hint = FilePageHint {
            file_id: 3,
            page_no: 44,
        };
        let bytes = hint.to_bytes().unwrap();

        assert!(matches!(
            FilePageHint::decode(&bytes[..7]),
            Err(CodecError::Truncated { need: 8, have: 7, .. })
        ));
        assert!(matches!(
            SequenceAck::decode(&[0; 15]),
            Err(CodecError::Truncated { need: 16, .. })
        ));
    }

    #[test]
    fn trailing_bytes_are_ignored() {
        let hint = FilePageHint {
            file_id: 3,
            page_no: 44,
        };
        let mut bytes = hint.to_bytes().unwrap();
        bytes.extend_from_slice(&[0xaa; 4]);

        assert_eq!(FilePageHint::decode(&bytes).unwrap(), hint);
    }

    #[test]
    fn encode_refuses_small_destination() {
        let lease = CoherencyLease::default();
        let mut dst = [0; COHERENCY_LEASE_LEN - 1];

        assert!(matches!(
            lease.encode_into(&mut dst),
            Err(CodecError::BufferTooSmall { need: 12, have: 11 })
        ));
    }

    #[test]
    fn timestamp_micros() {
        let ts = Timestamp::from_micros(3_000_250);
        assert_eq!(ts.secs, 3);
        assert_eq!(ts.micros, 250);
        assert_eq!(ts.as_micros(), 3_000_250);
        assert_eq!(Timestamp::decode(&ts.to_bytes().unwrap()).unwrap(), ts);
    }

    #[test]
    fn compaction_request_layout() {
        let req = PageCompactRequest::new(-5, vec![9, 8, 7]).unwrap();
        let bytes = req.to_bytes().unwrap();

        assert_eq!(bytes, vec![0xff, 0xff, 0xff, 0xfb, 0, 0, 0, 3, 9, 8, 7]);
        assert_eq!(PageCompactRequest::decode(&bytes).unwrap(), req);
    }

    #[test]
    fn compaction_size_is_bounds_checked() {
        let mut bytes = PageCompactRequest::new(1, vec![1, 2, 3, 4])
            .unwrap()
            .to_bytes()
            .unwrap();
        bytes.truncate(10);

        assert!(matches!(
            PageCompactRequest::decode(&bytes),
            Err(CodecError::Truncated { need: 12, have: 10, .. })
        ));
    }

    #[test]
    fn oversized_compaction_is_rejected() {
        assert!(matches!(
            PageCompactRequest::new(1, vec![0; PAGE_COMPACT_MAX_LEN + 1]),
            Err(CodecError::TooLarge { .. })
        ));

        let mut bytes = vec![0, 0, 0, 1];
        bytes.extend_from_slice(&((PAGE_COMPACT_MAX_LEN as u32) + 1).to_be_bytes());
        bytes.resize(PAGE_COMPACT_HEADER_LEN + PAGE_COMPACT_MAX_LEN + 1, 0);
        assert!(matches!(
            PageCompactRequest::decode(&bytes),
            Err(CodecError::TooLarge { .. })
        ));
    }

    #[test]
    fn lsn_validity() {
        assert!(!Lsn::new(0, 10).is_valid());
        assert!(Lsn::new(1, 0).is_valid());
        assert_eq!(Lsn::new(4, 128).to_string(), "4:128");
    }
}
