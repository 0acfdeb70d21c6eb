//! Per-space packet-number bookkeeping (RFC 9000 Section 12.3).
//!
//! QUIC keeps three independent packet-number domains; ACKs never cross
//! them. Initial packets use the Initial space, Handshake packets the
//! Handshake space, and 0-RTT/1-RTT both map to the Application space.

use crate::packet::ranges::AckRangeSet;

/// Packet-number space identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpaceId {
    Initial = 0,
    Handshake = 1,
    Application = 2,
}

impl SpaceId {
    pub const COUNT: usize = 3;

    pub fn index(self) -> usize {
        self as usize
    }
}

/// State of one packet-number space.
#[derive(Debug, Clone, Default)]
pub struct PktSpace {
    /// Next packet number to assign for transmissions.
    pub tx_next_pn: u64,

    /// Largest packet number received and processed. Non-decreasing.
    pub largest_rx_pn: Option<u64>,

    /// Largest packet number the peer has acknowledged.
    pub largest_acked_pn: Option<u64>,

    /// Count of ack-eliciting packets received.
    pub nb_ack_eliciting: u64,

    /// Ranges of received packet numbers awaiting acknowledgment.
    pub ack_ranges: AckRangeSet,

    /// An ACK frame must be emitted in the next packet for this space.
    pub ack_required: bool,
}

impl PktSpace {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate the next packet number. Strictly increasing; never reused.
    pub fn next_packet_number(&mut self) -> u64 {
        let pn = self.tx_next_pn;
        self.tx_next_pn += 1;
        pn
    }

    /// Record a processed received packet: update the largest-received
    /// watermark, the ACK ranges, and the ack-eliciting counter. The odd
    /// ack-eliciting packet arms the ACK obligation, which emission clears,
    /// yielding an ACK every two ack-eliciting packets.
    pub fn on_packet_received(&mut self, pn: u64, ack_eliciting: bool) {
        match self.largest_rx_pn {
            Some(largest) if pn <= largest => {}
            _ => self.largest_rx_pn = Some(pn),
        }
        self.ack_ranges.insert(pn);

        if ack_eliciting {
            self.nb_ack_eliciting += 1;
            if self.nb_ack_eliciting & 1 == 1 {
                self.ack_required = true;
            }
        }
    }

    /// Record the largest packet number acknowledged by the peer.
    pub fn on_ack_received(&mut self, largest_acked: u64) {
        match self.largest_acked_pn {
            Some(largest) if largest_acked <= largest => {}
            _ => self.largest_acked_pn = Some(largest_acked),
        }
    }

    /// Clear the ACK obligation after an ACK frame has been emitted.
    pub fn on_ack_sent(&mut self) {
        self.ack_required = false;
    }
}
