//! Per-encryption-level state: packet-protection contexts, RX packet
//! queues, the TX CRYPTO stream and in-flight CRYPTO frame bookkeeping.

use std::collections::BTreeMap;
use std::collections::VecDeque;
use std::ops::Bound;

use bytes::{Bytes, BytesMut};

use crate::connection::crypto_stream::CryptoStream;
use crate::crypto::key_schedule::LevelKeys;
use crate::crypto::suite::CipherSuite;
use crate::error::{Error, Result};
use crate::packet::header::{PacketType, LONG_HEADER_BIT, PNL_BITMASK, PN_MAXLEN};
use crate::packet::number::{decode_packet_number, parse_truncated_pn};
use crate::tls::EncryptionLevel;
use crate::types::TAG_LEN;

/// CRYPTO payload carried by a received packet, referencing the decrypted
/// packet buffer.
#[derive(Debug, Clone)]
pub struct RxCrypto {
    pub offset: u64,
    pub data: Bytes,
}

/// A received packet moving through the pipeline. Header fields are parsed
/// up front; the packet number appears once header protection is removed,
/// the frames once the payload is decrypted.
#[derive(Debug)]
pub struct RxPacket {
    pub ty: PacketType,
    pub long_header: bool,
    /// Offset of the packet-number field within `data`.
    pub pn_offset: usize,
    /// Full packet bytes: header, packet number, payload, tag.
    pub data: BytesMut,
    /// Total packet length; shrinks by the tag once decrypted.
    pub len: usize,
    /// Reconstructed packet number (valid once header protection is off).
    pub pn: u64,
    /// AAD length: header through packet-number field.
    pub aad_len: usize,
    /// Frames parsed and bookkeeping applied.
    pub processed: bool,
    pub ack_eliciting: bool,
    /// CRYPTO frames waiting for the stream cursor to reach their offsets.
    pub crypto: Vec<RxCrypto>,
}

/// A sent CRYPTO frame awaiting acknowledgment, keyed by packet number in
/// the level's in-flight map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CryptoFrameRecord {
    pub offset: u64,
    pub len: usize,
}

/// State for one encryption level.
pub struct EncLevel {
    pub level: EncryptionLevel,

    /// Negotiated suite; Initial is pinned to AES-128-GCM/SHA-256.
    pub suite: CipherSuite,
    pub rx_keys: Option<LevelKeys>,
    pub tx_keys: Option<LevelKeys>,

    /// Received packets whose header protection cannot be removed yet.
    pub rx_pending_hp: VecDeque<RxPacket>,
    /// Unprotected packets keyed by packet number, awaiting decryption,
    /// frame dispatch or in-order CRYPTO delivery.
    pub rx_packets: BTreeMap<u64, RxPacket>,
    /// In-order delivery cursor of the RX CRYPTO stream.
    pub rx_crypto_offset: u64,

    /// Outgoing CRYPTO stream for this level.
    pub tx_crypto: CryptoStream,
    /// Sent, unacknowledged CRYPTO frames by packet number.
    pub tx_in_flight: BTreeMap<u64, CryptoFrameRecord>,
    /// CRYPTO frames declared lost, awaiting re-cut into new packets.
    pub tx_retransmit: BTreeMap<u64, CryptoFrameRecord>,
}

impl EncLevel {
    pub fn new(level: EncryptionLevel) -> Self {
        Self {
            level,
            suite: CipherSuite::INITIAL,
            rx_keys: None,
            tx_keys: None,
            rx_pending_hp: VecDeque::new(),
            rx_packets: BTreeMap::new(),
            rx_crypto_offset: 0,
            tx_crypto: CryptoStream::new(),
            tx_in_flight: BTreeMap::new(),
            tx_retransmit: BTreeMap::new(),
        }
    }

    pub fn install_rx_keys(&mut self, suite: CipherSuite, keys: LevelKeys) {
        self.suite = suite;
        self.rx_keys = Some(keys);
    }

    pub fn install_tx_keys(&mut self, suite: CipherSuite, keys: LevelKeys) {
        self.suite = suite;
        self.tx_keys = Some(keys);
    }

    /// Park a packet whose header protection cannot be removed yet. The
    /// driver retries once RX secrets for the level are installed.
    pub fn queue_rx_protected(&mut self, pkt: RxPacket) {
        self.rx_pending_hp.push_back(pkt);
    }

    /// Number of packets buffered at this level, protected or not.
    pub fn buffered_rx(&self) -> usize {
        self.rx_pending_hp.len() + self.rx_packets.len()
    }

    /// Remove header protection from one packet in place: unmask the first
    /// byte and packet-number field, reconstruct the full packet number.
    pub fn remove_header_protection(&self, pkt: &mut RxPacket, largest_pn: Option<u64>) -> Result<()> {
        let keys = self.rx_keys.as_ref().ok_or(Error::ShortBuffer)?;
        let pn_offset = pkt.pn_offset;

        // The sample starts after a 4-byte packet-number placeholder.
        if pkt.len < pn_offset + PN_MAXLEN + 16 {
            return Err(Error::ShortBuffer);
        }
        let sample = &pkt.data[pn_offset + PN_MAXLEN..pn_offset + PN_MAXLEN + 16];
        let mask = keys.hp.mask(sample)?;

        let buf = &mut pkt.data[..];
        let first_mask = if buf[0] & LONG_HEADER_BIT != 0 { 0x0f } else { 0x1f };
        buf[0] ^= mask[0] & first_mask;

        let pn_len = (buf[0] & PNL_BITMASK) as usize + 1;
        for i in 0..pn_len {
            buf[pn_offset + i] ^= mask[1 + i];
        }

        let truncated = parse_truncated_pn(&buf[pn_offset..], pn_len)?;
        pkt.pn = decode_packet_number(largest_pn, truncated, pn_len as u32 * 8);
        pkt.aad_len = pn_offset + pn_len;
        Ok(())
    }

    /// Unprotect every parked packet, moving successes into the
    /// by-packet-number tree and dropping failures.
    ///
    /// Returns the number of packets dropped.
    pub fn flush_pending_hp(&mut self, largest_pn: Option<u64>) -> usize {
        let mut dropped = 0;
        let pending: Vec<RxPacket> = self.rx_pending_hp.drain(..).collect();
        for mut pkt in pending {
            match self.remove_header_protection(&mut pkt, largest_pn) {
                Ok(()) => {
                    self.rx_packets.insert(pkt.pn, pkt);
                }
                Err(_) => dropped += 1,
            }
        }
        dropped
    }

    /// AEAD-open a packet in place. On success the tag is stripped from
    /// `pkt.len` and the payload is plaintext.
    pub fn decrypt_packet(&self, pkt: &mut RxPacket) -> Result<()> {
        let keys = self.rx_keys.as_ref().ok_or(Error::AeadAuthFailed)?;
        if pkt.len < pkt.aad_len + TAG_LEN {
            return Err(Error::ShortBuffer);
        }
        let nonce = keys.nonce(pkt.pn);
        let (aad, payload) = pkt.data.split_at_mut(pkt.aad_len);
        let ciphertext_len = pkt.len - pkt.aad_len;
        let plaintext_len = keys
            .aead
            .open_in_place(&nonce, aad, payload, ciphertext_len)?;
        pkt.len = pkt.aad_len + plaintext_len;
        Ok(())
    }

    /// Remove acknowledged CRYPTO frame records with packet numbers in
    /// `[smallest, largest]`, crediting their bytes back to the in-flight
    /// counter.
    pub fn ack_crypto_frames(&mut self, largest: u64, smallest: u64, in_flight: &mut usize) {
        let acked: Vec<u64> = self
            .tx_in_flight
            .range(smallest..=largest)
            .map(|(&pn, _)| pn)
            .collect();
        for pn in acked {
            if let Some(rec) = self.tx_in_flight.remove(&pn) {
                *in_flight -= rec.len;
                tracing::trace!(level = ?self.level, pn, len = rec.len, "CRYPTO frame acked");
            }
        }
    }

    /// Coalesce the in-flight CRYPTO frames lost in the gap
    /// `next_largest < pn < smallest` into one record (smallest offset,
    /// summed length) and move it to the retransmit-pending set.
    ///
    /// Returns the merged record if the gap held any frames.
    pub fn move_gap_to_retransmit(
        &mut self,
        smallest: u64,
        next_largest: u64,
        in_flight: &mut usize,
    ) -> Option<(u64, CryptoFrameRecord)> {
        let lost: Vec<u64> = self
            .tx_in_flight
            .range((Bound::Excluded(next_largest), Bound::Excluded(smallest)))
            .map(|(&pn, _)| pn)
            .collect();
        let first_pn = *lost.first()?;

        let mut merged = CryptoFrameRecord { offset: u64::MAX, len: 0 };
        for pn in lost {
            let rec = self.tx_in_flight.remove(&pn).expect("key collected above");
            merged.offset = merged.offset.min(rec.offset);
            merged.len += rec.len;
        }
        *in_flight -= merged.len;
        self.tx_retransmit.insert(first_pn, merged);
        Some((first_pn, merged))
    }

    /// Bytes of CRYPTO stream data not yet cut into any packet.
    pub fn unsent_crypto(&self) -> u64 {
        self.tx_crypto.remaining_from(self.tx_crypto.offset())
    }
}
