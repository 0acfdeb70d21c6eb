//! Truncated packet-number encoding and reconstruction
//! (RFC 9000 Section 17.1, Appendix A).

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result};

/// Reconstruct a full packet number from its truncated wire form
/// (RFC 9000 Appendix A.3).
///
/// `largest` is the largest packet number processed so far in the space
/// (`None` if no packet has been received), `truncated` the 1-4 byte wire
/// value, and `pn_nbits` its bit width (8, 16, 24 or 32).
pub fn decode_packet_number(largest: Option<u64>, truncated: u32, pn_nbits: u32) -> u64 {
    let expected = match largest {
        Some(pn) => pn + 1,
        None => 0,
    };
    let win = 1u64 << pn_nbits;
    let hwin = win / 2;
    let mask = win - 1;

    let candidate = (expected & !mask) | truncated as u64;
    if candidate + hwin <= expected {
        return candidate + win;
    }
    if candidate > expected + hwin && candidate > win {
        return candidate - win;
    }
    candidate
}

/// Smallest packet-number encoding length in bytes for `pn`, given the
/// largest packet number the peer has acknowledged (RFC 9000 Appendix A.2).
///
/// Before any ACK has arrived the full four bytes are used.
pub fn packet_number_len(pn: u64, largest_acked: Option<u64>) -> usize {
    let largest_acked = match largest_acked {
        Some(acked) => acked,
        None => return 4,
    };
    let unacked = pn.saturating_sub(largest_acked);
    if unacked < 1 << 7 {
        1
    } else if unacked < 1 << 15 {
        2
    } else if unacked < 1 << 23 {
        3
    } else {
        4
    }
}

/// Read a 1-4 byte big-endian truncated packet number.
pub fn parse_truncated_pn(buf: &[u8], pn_len: usize) -> Result<u32> {
    debug_assert!((1..=4).contains(&pn_len));
    if buf.len() < pn_len {
        return Err(Error::ShortBuffer);
    }
    let mut truncated = 0u32;
    for &byte in &buf[..pn_len] {
        truncated = (truncated << 8) | byte as u32;
    }
    Ok(truncated)
}

/// Append the truncated packet number in `pn_len` big-endian bytes.
pub fn put_truncated_pn(buf: &mut BytesMut, pn: u64, pn_len: usize) {
    debug_assert!((1..=4).contains(&pn_len));
    let bytes = (pn as u32).to_be_bytes();
    buf.put_slice(&bytes[4 - pn_len..]);
}
