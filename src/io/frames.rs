//! # Length-Prefixed, Checksummed Frames
//!
//! Buffer segments and sealed database blocks share one frame format:
//!
//! ```text
//! +----------------+----------------+------------------+
//! | payload length | CRC-64         | payload          |
//! | 4 bytes BE     | 8 bytes BE     | (length bytes)   |
//! +----------------+----------------+------------------+
//! ```
//!
//! The checksum covers only the payload. A frame whose checksum fails
//! validation marks the end of usable data during replay: the append
//! protocol writes frames in order and syncs, so a bad frame can only be
//! the torn tail of an interrupted write.

use eyre::{bail, Result};
use zerocopy::big_endian::{U32, U64};
use zerocopy::{FromBytes, Immutable, IntoBytes, KnownLayout};

use crate::config::SEGMENT_FRAME_HEADER_SIZE;

const CRC64: crc::Crc<u64> = crc::Crc::<u64>::new(&crc::CRC_64_ECMA_182);

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Immutable, KnownLayout)]
pub struct FrameHeader {
    pub length: U32,
    pub checksum: U64,
}

const _: () = assert!(std::mem::size_of::<FrameHeader>() == SEGMENT_FRAME_HEADER_SIZE);

pub fn checksum(payload: &[u8]) -> u64 {
    CRC64.checksum(payload)
}

/// Appends a framed payload to `out`.
pub fn encode_frame(payload: &[u8], out: &mut Vec<u8>) {
    let header = FrameHeader {
        length: U32::new(payload.len() as u32),
        checksum: U64::new(checksum(payload)),
    };
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
}

/// The total on-disk size of a frame holding `payload_len` bytes.
pub fn frame_size(payload_len: usize) -> usize {
    SEGMENT_FRAME_HEADER_SIZE + payload_len
}

/// Outcome of decoding one frame from a byte region.
pub enum Frame<'a> {
    /// A valid frame and the offset just past it.
    Valid { payload: &'a [u8], next: usize },
    /// The region ends cleanly at this offset.
    End,
    /// Bytes remain but do not form a valid frame (torn tail).
    Torn,
}

/// Decodes the frame starting at `offset`, distinguishing a clean end, a
/// valid frame, and a torn tail.
pub fn decode_frame(bytes: &[u8], offset: usize) -> Frame<'_> {
    if offset == bytes.len() {
        return Frame::End;
    }
    if offset + SEGMENT_FRAME_HEADER_SIZE > bytes.len() {
        return Frame::Torn;
    }
    let header = match FrameHeader::read_from_bytes(&bytes[offset..offset + SEGMENT_FRAME_HEADER_SIZE]) {
        Ok(header) => header,
        Err(_) => return Frame::Torn,
    };
    let payload_start = offset + SEGMENT_FRAME_HEADER_SIZE;
    let payload_end = payload_start + header.length.get() as usize;
    if payload_end > bytes.len() {
        return Frame::Torn;
    }
    let payload = &bytes[payload_start..payload_end];
    if checksum(payload) != header.checksum.get() {
        return Frame::Torn;
    }
    Frame::Valid {
        payload,
        next: payload_end,
    }
}

/// Iterates every valid frame in `bytes`, failing on a torn tail when
/// `strict` (sealed blocks are written atomically, so a torn block is
/// corruption, not an interrupted append).
pub fn decode_all<'a>(bytes: &'a [u8], strict: bool) -> Result<Vec<&'a [u8]>> {
    let mut frames = Vec::new();
    let mut offset = 0;
    loop {
        match decode_frame(bytes, offset) {
            Frame::Valid { payload, next } => {
                frames.push(payload);
                offset = next;
            }
            Frame::End => return Ok(frames),
            Frame::Torn => {
                if strict {
                    bail!(
                        "corrupted frame at offset {} of a {}-byte sealed region",
                        offset,
                        bytes.len()
                    );
                }
                return Ok(frames);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_round_trip_in_sequence() {
        let mut bytes = Vec::new();
        encode_frame(b"first", &mut bytes);
        encode_frame(b"second", &mut bytes);
        let frames = decode_all(&bytes, true).unwrap();
        assert_eq!(frames, vec![b"first".as_slice(), b"second".as_slice()]);
    }

    #[test]
    fn torn_tail_ends_lenient_decoding() {
        let mut bytes = Vec::new();
        encode_frame(b"kept", &mut bytes);
        encode_frame(b"torn", &mut bytes);
        bytes.truncate(bytes.len() - 2);
        let frames = decode_all(&bytes, false).unwrap();
        assert_eq!(frames, vec![b"kept".as_slice()]);
        assert!(decode_all(&bytes, true).is_err());
    }

    #[test]
    fn corrupted_payload_fails_the_checksum() {
        let mut bytes = Vec::new();
        encode_frame(b"payload", &mut bytes);
        let last = bytes.len() - 1;
        bytes[last] ^= 0xFF;
        assert!(matches!(decode_frame(&bytes, 0), Frame::Torn));
    }

    #[test]
    fn frame_size_accounts_for_the_header() {
        assert_eq!(frame_size(0), crate::config::SEGMENT_FRAME_HEADER_SIZE);
        assert_eq!(frame_size(100), crate::config::SEGMENT_FRAME_HEADER_SIZE + 100);
    }
}
