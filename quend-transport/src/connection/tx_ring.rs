//! TX datagram ring.
//!
//! A fixed ring of MTU-sized buffers decouples packet building from UDP
//! transmission. The writer coalesces whole packets into the current write
//! buffer; the reader drains non-empty buffers to the socket and resets
//! them for reuse. Both indices increase monotonically modulo the (power of
//! two) ring size, and within one connection task iteration the build phase
//! always completes before the drain phase.

use bytes::BytesMut;

use crate::types::{CONN_TX_BUFS_NB, PACKET_MAXLEN};

/// One outgoing datagram buffer.
#[derive(Debug)]
pub struct TxBuf {
    pub data: BytesMut,
}

impl TxBuf {
    fn new() -> Self {
        Self {
            data: BytesMut::with_capacity(PACKET_MAXLEN),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Remaining capacity for additional coalesced packets.
    pub fn room(&self) -> usize {
        PACKET_MAXLEN - self.data.len()
    }
}

/// Ring of [`CONN_TX_BUFS_NB`] datagram buffers.
#[derive(Debug)]
pub struct TxRing {
    bufs: Vec<TxBuf>,
    wbuf: usize,
    rbuf: usize,
}

impl Default for TxRing {
    fn default() -> Self {
        Self::new()
    }
}

impl TxRing {
    pub fn new() -> Self {
        Self {
            bufs: (0..CONN_TX_BUFS_NB).map(|_| TxBuf::new()).collect(),
            wbuf: 0,
            rbuf: 0,
        }
    }

    /// Current write buffer.
    pub fn wbuf(&mut self) -> &mut TxBuf {
        &mut self.bufs[self.wbuf]
    }

    /// Advance the writer to the next buffer and return it. The caller
    /// checks [`TxBuf::is_empty`] to find out whether it is writable or the
    /// ring is full of undrained datagrams.
    pub fn next_wbuf(&mut self) -> &mut TxBuf {
        self.wbuf = (self.wbuf + 1) & (CONN_TX_BUFS_NB - 1);
        &mut self.bufs[self.wbuf]
    }

    /// Take the next pending datagram, resetting its buffer for reuse.
    pub fn pop_datagram(&mut self) -> Option<Vec<u8>> {
        let buf = &mut self.bufs[self.rbuf];
        if buf.is_empty() {
            return None;
        }
        let datagram = buf.data.split().to_vec();
        self.rbuf = (self.rbuf + 1) & (CONN_TX_BUFS_NB - 1);
        Some(datagram)
    }

    /// Whether any buffer holds data awaiting transmission.
    pub fn has_pending(&self) -> bool {
        self.bufs.iter().any(|b| !b.is_empty())
    }
}
