//! The on-disk framing format for a batch of log entries.
//!
//! ```text
//! [preamble: u64 version | u64 n-entries]
//! [batch-header: (u64 term, u8 type, u8x3 pad, u32 payload-len) x n]
//! [payloads (each 8-byte aligned, zero-padded)]
//! [crc32c of header | crc32c of payloads]
//! ```
//!
//! All integers little-endian. A closed segment is simply a concatenation of
//! these frames in append order; indices are not stored in the frame itself
//! (they're derived from the segment's position in the log — see
//! `storage::load`), which keeps the header a fixed 16 bytes per entry.
//!
//! CRC uses Castagnoli (CRC-32C), not IEEE CRC-32, matching the `crc32c`
//! crate already used for the same purpose in the sibling `haystack` store.

use std::io::{Cursor, Read};

use byteorder::{ReadBytesExt, WriteBytesExt, LE};

use crate::error::{RaftError, Result};
use crate::log_entry::EntryType;
use crate::types::Term;

const FRAME_VERSION: u64 = 1;
const HEADER_ENTRY_SIZE: usize = 16;

fn padded_len(len: usize) -> usize {
    (len + 7) & !7
}

/// Encodes one batch of entries (typically everything appended in a single
/// call) into one on-disk frame.
pub fn encode_frame(entries: &[(Term, EntryType, &[u8])]) -> Vec<u8> {
    let mut header_buf = Vec::with_capacity(16 + entries.len() * HEADER_ENTRY_SIZE);
    header_buf.write_u64::<LE>(FRAME_VERSION).unwrap();
    header_buf.write_u64::<LE>(entries.len() as u64).unwrap();
    for (term, entry_type, payload) in entries {
        header_buf.write_u64::<LE>(*term).unwrap();
        header_buf.write_u8(*entry_type as u8).unwrap();
        header_buf.extend_from_slice(&[0u8; 3]);
        header_buf.write_u32::<LE>(payload.len() as u32).unwrap();
    }

    let mut payload_buf = Vec::new();
    for (_, _, payload) in entries {
        payload_buf.extend_from_slice(payload);
        let pad = padded_len(payload.len()) - payload.len();
        payload_buf.extend(std::iter::repeat(0u8).take(pad));
    }

    let header_crc = crc32c::crc32c(&header_buf);
    let payload_crc = crc32c::crc32c(&payload_buf);

    let mut out = Vec::with_capacity(header_buf.len() + payload_buf.len() + 8);
    out.extend_from_slice(&header_buf);
    out.extend_from_slice(&payload_buf);
    out.write_u32::<LE>(header_crc).unwrap();
    out.write_u32::<LE>(payload_crc).unwrap();
    out
}

/// One entry recovered from a frame, still missing the index it will be
/// assigned once its position in the overall log is known.
pub struct DecodedEntry {
    pub term: Term,
    pub entry_type: EntryType,
    pub payload: Vec<u8>,
}

pub struct DecodedFrame {
    pub entries: Vec<DecodedEntry>,
    /// Total bytes this frame occupied, so the caller can seek past it to
    /// find the next frame in the file.
    pub frame_len: usize,
}

/// Decodes a single frame starting at the beginning of `buf`. `buf` may
/// contain trailing bytes belonging to later frames; only `frame_len` bytes
/// are consumed.
pub fn decode_frame(buf: &[u8]) -> Result<DecodedFrame> {
    let mut cur = Cursor::new(buf);

    let version = read_u64(&mut cur, "version")?;
    if version != FRAME_VERSION {
        return Err(RaftError::Corrupt(format!("frame: unsupported version {version}")));
    }
    let n_entries = read_u64(&mut cur, "n-entries")? as usize;

    let header_start = cur.position() as usize;
    let header_len = n_entries * HEADER_ENTRY_SIZE;
    if buf.len() < header_start + header_len {
        return Err(RaftError::Corrupt("frame: truncated header".into()));
    }
    let header_bytes = &buf[header_start..header_start + header_len];

    let mut specs = Vec::with_capacity(n_entries);
    let mut hc = Cursor::new(header_bytes);
    for _ in 0..n_entries {
        let term = read_u64(&mut hc, "term")?;
        let entry_type_byte = hc
            .read_u8()
            .map_err(|_| RaftError::Corrupt("frame: truncated entry type".into()))?;
        let entry_type = EntryType::from_byte(entry_type_byte)
            .ok_or_else(|| RaftError::Corrupt(format!("frame: unknown entry type {entry_type_byte}")))?;
        let mut pad = [0u8; 3];
        hc.read_exact(&mut pad)
            .map_err(|_| RaftError::Corrupt("frame: truncated pad".into()))?;
        let payload_len = hc
            .read_u32::<LE>()
            .map_err(|_| RaftError::Corrupt("frame: truncated payload length".into()))? as usize;
        specs.push((term, entry_type, payload_len));
    }

    let mut offset = header_start + header_len;
    let mut entries = Vec::with_capacity(n_entries);
    let mut payload_region_start = offset;
    for (term, entry_type, payload_len) in specs {
        let padded = padded_len(payload_len);
        if buf.len() < offset + padded {
            return Err(RaftError::Corrupt("frame: truncated payload".into()));
        }
        let payload = buf[offset..offset + payload_len].to_vec();
        entries.push(DecodedEntry {
            term,
            entry_type,
            payload,
        });
        offset += padded;
    }
    let payload_region_end = offset;
    let payload_bytes = &buf[payload_region_start..payload_region_end];
    let _ = &mut payload_region_start;

    if buf.len() < offset + 8 {
        return Err(RaftError::Corrupt("frame: truncated checksum".into()));
    }
    let mut trailer = Cursor::new(&buf[offset..offset + 8]);
    let stored_header_crc = trailer.read_u32::<LE>().unwrap();
    let stored_payload_crc = trailer.read_u32::<LE>().unwrap();

    if crc32c::crc32c(header_bytes) != stored_header_crc {
        return Err(RaftError::Corrupt("frame: header checksum mismatch".into()));
    }
    if crc32c::crc32c(payload_bytes) != stored_payload_crc {
        return Err(RaftError::Corrupt("frame: payload checksum mismatch".into()));
    }

    Ok(DecodedFrame {
        entries,
        frame_len: offset + 8,
    })
}

fn read_u64(cur: &mut Cursor<&[u8]>, what: &str) -> Result<u64> {
    cur.read_u64::<LE>()
        .map_err(|_| RaftError::Corrupt(format!("frame: truncated {what}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_single_entry() {
        let payload = b"hello world";
        let encoded = encode_frame(&[(7, EntryType::Command, payload)]);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.frame_len, encoded.len());
        assert_eq!(decoded.entries.len(), 1);
        assert_eq!(decoded.entries[0].term, 7);
        assert_eq!(decoded.entries[0].entry_type, EntryType::Command);
        assert_eq!(decoded.entries[0].payload, payload);
    }

    #[test]
    fn roundtrip_multiple_entries_with_odd_lengths() {
        let a = b"a".as_slice();
        let b = b"a longer payload that is not block aligned".as_slice();
        let c = b"".as_slice();
        let encoded = encode_frame(&[
            (1, EntryType::Command, a),
            (1, EntryType::Barrier, c),
            (2, EntryType::Configuration, b),
        ]);
        let decoded = decode_frame(&encoded).unwrap();
        assert_eq!(decoded.entries.len(), 3);
        assert_eq!(decoded.entries[0].payload, a);
        assert_eq!(decoded.entries[1].payload, c);
        assert_eq!(decoded.entries[2].payload, b);
    }

    #[test]
    fn two_frames_back_to_back_are_independently_decodable() {
        let first = encode_frame(&[(1, EntryType::Command, b"one")]);
        let second = encode_frame(&[(1, EntryType::Command, b"two")]);
        let mut both = first.clone();
        both.extend_from_slice(&second);

        let d1 = decode_frame(&both).unwrap();
        assert_eq!(d1.frame_len, first.len());
        let d2 = decode_frame(&both[d1.frame_len..]).unwrap();
        assert_eq!(d2.entries[0].payload, b"two");
    }

    #[test]
    fn corrupted_payload_fails_checksum() {
        let mut encoded = encode_frame(&[(1, EntryType::Command, b"hello")]);
        let last = encoded.len() - 1;
        encoded[last - 4] ^= 0xFF; // flip a payload byte, leaving the stored crc stale
        assert!(matches!(decode_frame(&encoded), Err(RaftError::Corrupt(_))));
    }

    #[test]
    fn truncated_frame_is_rejected() {
        let encoded = encode_frame(&[(1, EntryType::Command, b"hello world")]);
        let truncated = &encoded[..encoded.len() - 4];
        assert!(decode_frame(truncated).is_err());
    }
}
