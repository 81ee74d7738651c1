//! Wire format of transport messages.
//!
//! Every message carries one fragment of one action, framed as:
//!
//! ```text
//! ┌───────────┬────────────┬────────────┬────────────┬──────┬───────┬─────────┐
//! │ action_id │ frag_index │ frag_count │ total_size │ type │ crc32 │ payload │
//! │  (8 B)    │   (4 B)    │   (4 B)    │   (8 B)    │ (1 B)│ (4 B) │  (var)  │
//! └───────────┴────────────┴────────────┴────────────┴──────┴───────┴─────────┘
//! ```
//!
//! All integers are big-endian. The checksum covers the payload only and
//! detects corruption, not tampering. `action_id` is unique and monotonic
//! per sender, which together with the transport's total order lets the
//! receiver reassemble each sender's actions without ambiguity.

use bytes::{Buf, BufMut};

use crate::types::{ActionType, Seqno};

/// Size of the fragment header in bytes.
pub const FRAG_HEADER_SIZE: usize = 8 + 4 + 4 + 8 + 1 + 4;

/// Smallest packet size that leaves room for at least one payload byte.
pub const MIN_PKT_SIZE: usize = FRAG_HEADER_SIZE + 1;

// ============================================================================
// Errors
// ============================================================================

/// Errors produced while encoding or decoding wire data.
#[derive(Debug, thiserror::Error)]
pub enum WireError {
    /// Not enough bytes for the expected structure.
    #[error("truncated data: have {have} bytes, need {need}")]
    Truncated { have: usize, need: usize },

    /// Payload checksum does not match.
    #[error("checksum mismatch: expected {expected:#x}, got {actual:#x}")]
    ChecksumMismatch { expected: u32, actual: u32 },

    /// Fragment metadata is internally inconsistent.
    #[error("bad fragment: index {frag_index} of {frag_count}")]
    BadFragment { frag_index: u32, frag_count: u32 },

    /// A member identifier exceeds the allowed length or is not valid UTF-8.
    #[error("bad member id ({len} bytes)")]
    BadMemberId { len: usize },
}

// ============================================================================
// Fragment Header
// ============================================================================

/// Metadata of one fragment of one action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FragmentHeader {
    /// Sender-local action identifier, monotonic per sender.
    pub action_id: u64,
    /// Zero-based index of this fragment.
    pub frag_index: u32,
    /// Total number of fragments of the action.
    pub frag_count: u32,
    /// Total action size in bytes.
    pub total_size: u64,
    /// Action classification.
    pub kind: ActionType,
}

impl FragmentHeader {
    /// Encodes the header plus payload into a single message buffer.
    pub fn encode(&self, payload: &[u8]) -> Vec<u8> {
        debug_assert!(
            self.frag_index < self.frag_count,
            "fragment index out of range"
        );

        let mut buf = Vec::with_capacity(FRAG_HEADER_SIZE + payload.len());
        buf.put_u64(self.action_id);
        buf.put_u32(self.frag_index);
        buf.put_u32(self.frag_count);
        buf.put_u64(self.total_size);
        buf.put_u8(self.kind.as_u8());
        buf.put_u32(crc32fast::hash(payload));
        buf.put_slice(payload);
        buf
    }

    /// Decodes a message buffer into its header and payload, verifying the
    /// payload checksum.
    pub fn decode(mut buf: &[u8]) -> Result<(Self, &[u8]), WireError> {
        if buf.len() < FRAG_HEADER_SIZE {
            return Err(WireError::Truncated {
                have: buf.len(),
                need: FRAG_HEADER_SIZE,
            });
        }

        let action_id = buf.get_u64();
        let frag_index = buf.get_u32();
        let frag_count = buf.get_u32();
        let total_size = buf.get_u64();
        let kind = ActionType::from_u8(buf.get_u8());
        let expected = buf.get_u32();

        if frag_count == 0 || frag_index >= frag_count {
            return Err(WireError::BadFragment {
                frag_index,
                frag_count,
            });
        }

        let actual = crc32fast::hash(buf);
        if actual != expected {
            return Err(WireError::ChecksumMismatch { expected, actual });
        }

        Ok((
            Self {
                action_id,
                frag_index,
                frag_count,
                total_size,
                kind,
            },
            buf,
        ))
    }
}

// ============================================================================
// Small Payloads
// ============================================================================

/// Encodes a seqno payload (join status, commit cut).
pub fn encode_seqno(seqno: Seqno) -> Vec<u8> {
    seqno.as_i64().to_be_bytes().to_vec()
}

/// Decodes a seqno payload.
pub fn decode_seqno(buf: &[u8]) -> Result<Seqno, WireError> {
    if buf.len() < 8 {
        return Err(WireError::Truncated {
            have: buf.len(),
            need: 8,
        });
    }
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[..8]);
    Ok(Seqno::new(i64::from_be_bytes(bytes)))
}

/// Encodes a flow control payload.
pub fn encode_flow(pause: bool) -> Vec<u8> {
    vec![u8::from(pause)]
}

/// Decodes a flow control payload.
pub fn decode_flow(buf: &[u8]) -> Result<bool, WireError> {
    match buf.first() {
        Some(&b) => Ok(b != 0),
        None => Err(WireError::Truncated { have: 0, need: 1 }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(action_id: u64, frag_index: u32, frag_count: u32, total: u64) -> FragmentHeader {
        FragmentHeader {
            action_id,
            frag_index,
            frag_count,
            total_size: total,
            kind: ActionType::Ordered,
        }
    }

    #[test]
    fn fragment_round_trip() {
        let hdr = header(7, 2, 5, 1000);
        let encoded = hdr.encode(b"payload bytes");
        let (decoded, payload) = FragmentHeader::decode(&encoded).unwrap();

        assert_eq!(decoded, hdr);
        assert_eq!(payload, b"payload bytes");
    }

    #[test]
    fn empty_payload_round_trip() {
        let hdr = header(1, 0, 1, 0);
        let encoded = hdr.encode(b"");
        assert_eq!(encoded.len(), FRAG_HEADER_SIZE);

        let (decoded, payload) = FragmentHeader::decode(&encoded).unwrap();
        assert_eq!(decoded.total_size, 0);
        assert!(payload.is_empty());
    }

    #[test]
    fn corrupted_payload_detected() {
        let mut encoded = header(1, 0, 1, 4).encode(b"abcd");
        let last = encoded.len() - 1;
        encoded[last] ^= 0xFF;

        assert!(matches!(
            FragmentHeader::decode(&encoded),
            Err(WireError::ChecksumMismatch { .. })
        ));
    }

    #[test]
    fn truncated_header_detected() {
        assert!(matches!(
            FragmentHeader::decode(&[0u8; FRAG_HEADER_SIZE - 1]),
            Err(WireError::Truncated { .. })
        ));
    }

    #[test]
    fn bad_fragment_counts_detected() {
        let hdr = FragmentHeader {
            action_id: 1,
            frag_index: 0,
            frag_count: 1,
            total_size: 0,
            kind: ActionType::Ordered,
        };
        let mut encoded = hdr.encode(b"");
        // Overwrite frag_count with zero.
        encoded[12..16].copy_from_slice(&0u32.to_be_bytes());

        assert!(matches!(
            FragmentHeader::decode(&encoded),
            Err(WireError::BadFragment { .. })
        ));
    }

    #[test]
    fn seqno_payload_round_trip() {
        let bytes = encode_seqno(Seqno::new(123_456));
        assert_eq!(decode_seqno(&bytes).unwrap(), Seqno::new(123_456));
        assert!(decode_seqno(&bytes[..4]).is_err());
    }

    #[test]
    fn flow_payload_round_trip() {
        assert!(decode_flow(&encode_flow(true)).unwrap());
        assert!(!decode_flow(&encode_flow(false)).unwrap());
        assert!(decode_flow(&[]).is_err());
    }
}
