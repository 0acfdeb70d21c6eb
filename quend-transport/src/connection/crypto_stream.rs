//! Outgoing CRYPTO stream storage.
//!
//! Handshake data from the TLS engine accumulates in an append-only byte
//! stream per encryption level, physically a sequence of fixed 16 KiB
//! buffers grown on demand. Frames are cut from the stream at a given
//! offset; a cut never crosses a buffer boundary, so a frame's payload is
//! always one contiguous slice.

use crate::error::{Error, Result};

/// Size of one CRYPTO stream buffer (16 KiB).
pub const CRYPTO_BUF_SZ: usize = 1 << 14;

/// Upper bound on buffered CRYPTO data per level; a handshake flight that
/// exceeds this indicates a broken TLS engine.
const CRYPTO_STREAM_MAX: usize = 1 << 20;

/// Append-only TX CRYPTO stream with a send-offset cursor.
#[derive(Debug, Default)]
pub struct CryptoStream {
    bufs: Vec<Vec<u8>>,
    /// Total bytes appended.
    len: u64,
    /// Offset of the next byte that has not yet been cut into a packet.
    offset: u64,
}

impl CryptoStream {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append handshake bytes, growing storage in 16 KiB increments.
    pub fn append(&mut self, mut data: &[u8]) -> Result<()> {
        if self.len as usize + data.len() > CRYPTO_STREAM_MAX {
            return Err(Error::CryptoBufExhausted);
        }
        while !data.is_empty() {
            let need_new = match self.bufs.last() {
                Some(buf) => buf.len() == CRYPTO_BUF_SZ,
                None => true,
            };
            if need_new {
                self.bufs.push(Vec::with_capacity(CRYPTO_BUF_SZ));
            }
            let buf = self.bufs.last_mut().expect("buffer just ensured");
            let take = data.len().min(CRYPTO_BUF_SZ - buf.len());
            buf.extend_from_slice(&data[..take]);
            data = &data[take..];
            self.len += take as u64;
        }
        Ok(())
    }

    /// Total bytes appended so far.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Send-offset cursor: next byte not yet cut into a packet.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Whether every appended byte has been cut into a packet.
    pub fn consumed(&self) -> bool {
        self.offset == self.len
    }

    /// Bytes available from `offset` to the end of the stream.
    pub fn remaining_from(&self, offset: u64) -> u64 {
        self.len.saturating_sub(offset)
    }

    /// A contiguous view starting at `offset`, at most `max_len` bytes and
    /// never crossing a 16 KiB buffer boundary. Empty when `offset` is at
    /// or past the end.
    pub fn chunk_at(&self, offset: u64, max_len: usize) -> &[u8] {
        if offset >= self.len {
            return &[];
        }
        let buf_idx = (offset as usize) / CRYPTO_BUF_SZ;
        let buf_off = (offset as usize) % CRYPTO_BUF_SZ;
        let buf = &self.bufs[buf_idx];
        let end = buf.len().min(buf_off + max_len);
        &buf[buf_off..end]
    }

    /// Advance the send cursor after cutting a frame at the cursor.
    pub fn advance(&mut self, len: u64) {
        debug_assert!(self.offset + len <= self.len);
        self.offset += len;
    }
}
