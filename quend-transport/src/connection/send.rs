//! Send pipeline: packet building, CRYPTO frame cutting, retransmission
//! and the packet sequencer feeding the TX datagram ring.

use bytes::{BufMut, BytesMut};

use crate::error::{Error, Result, TransportError};
use crate::events::ConnEvent;
use crate::frames::{
    put_ack_frame, put_connection_close, put_crypto_frame, put_handshake_done,
    put_new_connection_id, put_padding, Frame,
};
use crate::packet::header::{put_long_header, put_short_header, PacketType, LONG_HEADER_BIT};
use crate::packet::number::{packet_number_len, put_truncated_pn};
use crate::crypto::key_schedule::LevelKeys;
use crate::tls::EncryptionLevel;
use crate::types::{CRYPTO_IN_FLIGHT_MAX, INITIAL_PACKET_MINLEN, TAG_LEN};

use super::enc_level::CryptoFrameRecord;
use super::handshake::ConnectionState;
use super::Connection;

/// Outcome of one packet-build attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum BuildResult {
    /// A packet was committed carrying `crypto_len` bytes of CRYPTO data.
    Built { crypto_len: usize },
    /// The current write buffer lacks room; retry in the next one.
    NoRoom,
    /// The CRYPTO in-flight cap leaves nothing to send; retry after ACKs.
    Stall,
}

/// Seal the freshly built packet payload and apply header protection in
/// place. `start` is the packet's first byte within `buf`, `pn_off` the
/// packet-number field offset (absolute), and the buffer already has
/// [`TAG_LEN`] zero bytes reserved at the end.
fn seal_and_protect(
    buf: &mut BytesMut,
    start: usize,
    pn_off: usize,
    pn_len: usize,
    pn: u64,
    keys: &LevelKeys,
) -> Result<()> {
    let payload_off = pn_off + pn_len;
    let nonce = keys.nonce(pn);

    let total_len = buf.len();
    let (head, payload) = buf.split_at_mut(payload_off);
    let aad = &head[start..];
    keys.aead
        .seal_in_place(&nonce, aad, payload, total_len - payload_off - TAG_LEN)?;

    // Header-protection sample sits 4 bytes past the PN field start.
    let mask = {
        let sample = &buf[pn_off + 4..pn_off + 20];
        keys.hp.mask(sample)?
    };
    let first_mask = if buf[start] & LONG_HEADER_BIT != 0 { 0x0f } else { 0x1f };
    buf[start] ^= mask[0] & first_mask;
    for i in 0..pn_len {
        buf[pn_off + i] ^= mask[1 + i];
    }
    Ok(())
}

impl Connection {
    /// Build one Initial or Handshake packet into the current write buffer:
    /// an ACK frame when the space owes one, then at most one CRYPTO frame
    /// cut from the level's stream at `offset` (up to `max_len` bytes),
    /// then PADDING on server Initials up to the Initial minimum.
    pub(crate) fn build_crypto_packet(
        &mut self,
        level: EncryptionLevel,
        offset: u64,
        max_len: usize,
    ) -> Result<BuildResult> {
        let space_id = level.space();
        let ty = match level {
            EncryptionLevel::Initial => PacketType::Initial,
            _ => PacketType::Handshake,
        };

        // Cap the CRYPTO cut by the in-flight budget.
        let cap = CRYPTO_IN_FLIGHT_MAX.saturating_sub(self.crypto_in_flight);
        let mut crypto_len = max_len.min(cap);

        let ack_required =
            self.spaces[space_id.index()].ack_required && !self.spaces[space_id.index()].ack_ranges.is_empty();
        if max_len > 0 && crypto_len == 0 && !ack_required {
            return Ok(BuildResult::Stall);
        }

        let mut ack_buf = BytesMut::new();
        if ack_required {
            put_ack_frame(&mut ack_buf, &self.spaces[space_id.index()].ack_ranges, 0);
        }

        let pn = self.spaces[space_id.index()].tx_next_pn;
        let pn_len = packet_number_len(pn, self.spaces[space_id.index()].largest_acked_pn);

        let dcid = self.dcid.clone();
        let scid = self.scid.clone();
        let version = self.version;

        // Header size through the token field, plus a fixed 2-byte length
        // varint rewritten below.
        let header_size = 1
            + 4
            + 1
            + dcid.len()
            + 1
            + scid.len()
            + if ty == PacketType::Initial { 1 } else { 0 };
        let crypto_hdr_max = 1 + crate::codec::varint_size(offset) + 2;

        let crypto_len_committed;
        let built_len;
        {
            let enc_level = &self.levels[level.index()];
            let wbuf = self.tx_ring.wbuf();
            let room = wbuf.room();

            let overhead = header_size + 2 + pn_len + ack_buf.len() + TAG_LEN;
            if room < overhead + if crypto_len > 0 { crypto_hdr_max + 1 } else { 0 } {
                return Ok(BuildResult::NoRoom);
            }

            let data_budget = room.saturating_sub(overhead + crypto_hdr_max);
            let chunk = enc_level.tx_crypto.chunk_at(offset, crypto_len.min(data_budget));
            crypto_len = chunk.len();
            if max_len > 0 && crypto_len == 0 && !ack_required {
                return Ok(BuildResult::NoRoom);
            }

            let crypto_total = if crypto_len > 0 {
                1 + crate::codec::varint_size(offset) + crate::codec::varint_size(crypto_len as u64) + crypto_len
            } else {
                0
            };

            // Server Initials are expanded so the datagram reaches the
            // Initial minimum.
            let buf = &mut wbuf.data;
            let start = buf.len();
            let mut padding = 0;
            if ty == PacketType::Initial {
                let datagram_len = start + header_size + 2 + pn_len + ack_buf.len() + crypto_total + TAG_LEN;
                if datagram_len < INITIAL_PACKET_MINLEN {
                    padding = INITIAL_PACKET_MINLEN - datagram_len;
                }
            }

            let length_value = pn_len + ack_buf.len() + crypto_total + padding + TAG_LEN;
            if room < header_size + 2 + length_value {
                return Ok(BuildResult::NoRoom);
            }

            put_long_header(buf, ty, version, &dcid, &scid, pn_len);
            buf.put_u16(0x4000 | length_value as u16);
            let pn_off = buf.len();
            put_truncated_pn(buf, pn, pn_len);
            buf.put_slice(&ack_buf);
            if crypto_len > 0 {
                put_crypto_frame(buf, offset, chunk);
            }
            if padding > 0 {
                put_padding(buf, padding);
            }
            buf.resize(buf.len() + TAG_LEN, 0);

            let keys = enc_level
                .tx_keys
                .as_ref()
                .ok_or(Error::Transport(TransportError::InternalError))?;
            seal_and_protect(buf, start, pn_off, pn_len, pn, keys)?;

            built_len = buf.len() - start;
            crypto_len_committed = crypto_len;
        }

        // Commit: consume the packet number, account the CRYPTO frame,
        // clear the ACK obligation.
        let pn = self.spaces[space_id.index()].next_packet_number();
        if crypto_len_committed > 0 {
            self.levels[level.index()].tx_in_flight.insert(
                pn,
                CryptoFrameRecord {
                    offset,
                    len: crypto_len_committed,
                },
            );
            self.crypto_in_flight += crypto_len_committed;
        }
        if ack_required {
            self.spaces[space_id.index()].on_ack_sent();
        }
        self.emit(ConnEvent::PacketSent {
            level,
            pn,
            len: built_len,
        });

        Ok(BuildResult::Built {
            crypto_len: crypto_len_committed,
        })
    }

    /// Build one 1-RTT short-header packet from the post-handshake frame
    /// queue, preceded by an ACK when the Application space owes one.
    pub(crate) fn build_app_packet(&mut self) -> Result<BuildResult> {
        let level = EncryptionLevel::OneRtt;
        let space_idx = level.space().index();

        let ack_required =
            self.spaces[space_idx].ack_required && !self.spaces[space_idx].ack_ranges.is_empty();

        let mut ack_buf = BytesMut::new();
        if ack_required {
            put_ack_frame(&mut ack_buf, &self.spaces[space_idx].ack_ranges, 0);
        }

        let pn = self.spaces[space_idx].tx_next_pn;
        let pn_len = packet_number_len(pn, self.spaces[space_idx].largest_acked_pn);
        let dcid = self.dcid.clone();
        let header_size = 1 + dcid.len();

        let built_len;
        let mut sent_frames = 0;
        {
            let wbuf = self.tx_ring.wbuf();
            let room = wbuf.room();
            if room < header_size + pn_len + ack_buf.len() + TAG_LEN + 2 {
                return Ok(BuildResult::NoRoom);
            }

            let buf = &mut wbuf.data;
            let start = buf.len();
            put_short_header(buf, &dcid, pn_len);
            let pn_off = buf.len();
            put_truncated_pn(buf, pn, pn_len);
            buf.put_slice(&ack_buf);

            // Greedily pack queued frames that still fit before the tag.
            let end_budget = start + room - TAG_LEN;
            while let Some(frame) = self.post_handshake_frames.front() {
                let mut tmp = BytesMut::new();
                match frame {
                    Frame::HandshakeDone => put_handshake_done(&mut tmp),
                    Frame::NewConnectionId(ncid) => put_new_connection_id(&mut tmp, ncid),
                    other => {
                        tracing::warn!(?other, "unsupported post-handshake frame dropped");
                        self.post_handshake_frames.pop_front();
                        continue;
                    }
                }
                if buf.len() + tmp.len() > end_budget {
                    break;
                }
                buf.put_slice(&tmp);
                self.post_handshake_frames.pop_front();
                sent_frames += 1;
            }

            if sent_frames == 0 && !ack_required {
                // Nothing fit: roll back the header.
                buf.truncate(start);
                return Ok(BuildResult::NoRoom);
            }

            // The header-protection sample needs 4 + 16 bytes past the PN
            // field; tiny packets are padded up to that.
            let min_len = pn_off + 4 + 16;
            if buf.len() + TAG_LEN < min_len {
                put_padding(buf, min_len - buf.len() - TAG_LEN);
            }

            buf.resize(buf.len() + TAG_LEN, 0);
            let keys = self.levels[level.index()]
                .tx_keys
                .as_ref()
                .ok_or(Error::Transport(TransportError::InternalError))?;
            seal_and_protect(buf, start, pn_off, pn_len, pn, keys)?;
            built_len = buf.len() - start;
        }

        let pn = self.spaces[space_idx].next_packet_number();
        if ack_required {
            self.spaces[space_idx].on_ack_sent();
        }
        self.emit(ConnEvent::PacketSent {
            level,
            pn,
            len: built_len,
        });
        Ok(BuildResult::Built { crypto_len: 0 })
    }

    /// Build the single best-effort CONNECTION_CLOSE packet at the highest
    /// level with installed TX keys.
    pub(crate) fn prep_close_packet(&mut self) -> Result<()> {
        let close = match self.close {
            Some(c) if !c.sent => c,
            _ => return Ok(()),
        };

        let level = [
            EncryptionLevel::OneRtt,
            EncryptionLevel::Handshake,
            EncryptionLevel::Initial,
        ]
        .into_iter()
        .find(|l| self.levels[l.index()].tx_keys.is_some());
        let level = match level {
            Some(l) => l,
            None => return Ok(()),
        };

        let space_idx = level.space().index();
        let pn = self.spaces[space_idx].tx_next_pn;
        let pn_len = packet_number_len(pn, self.spaces[space_idx].largest_acked_pn);
        let dcid = self.dcid.clone();
        let scid = self.scid.clone();
        let version = self.version;

        let mut frame_buf = BytesMut::new();
        put_connection_close(&mut frame_buf, close.error_code, close.frame_type, b"");
        // Keep the packet long enough for the header-protection sample.
        let sample_pad = (4 + 16usize).saturating_sub(pn_len + frame_buf.len() + TAG_LEN);
        put_padding(&mut frame_buf, sample_pad);

        {
            let wbuf = self.tx_ring.wbuf();
            let buf = &mut wbuf.data;
            let start = buf.len();

            let pn_off;
            if level == EncryptionLevel::OneRtt {
                put_short_header(buf, &dcid, pn_len);
                pn_off = buf.len();
            } else {
                let ty = if level == EncryptionLevel::Initial {
                    PacketType::Initial
                } else {
                    PacketType::Handshake
                };
                put_long_header(buf, ty, version, &dcid, &scid, pn_len);
                let length_value = pn_len + frame_buf.len() + TAG_LEN;
                buf.put_u16(0x4000 | length_value as u16);
                pn_off = buf.len();
            }
            put_truncated_pn(buf, pn, pn_len);
            buf.put_slice(&frame_buf);
            buf.resize(buf.len() + TAG_LEN, 0);

            let keys = self.levels[level.index()]
                .tx_keys
                .as_ref()
                .ok_or(Error::Transport(TransportError::InternalError))?;
            seal_and_protect(buf, start, pn_off, pn_len, pn, keys)?;
        }

        self.spaces[space_idx].next_packet_number();
        if let Some(close) = self.close.as_mut() {
            close.sent = true;
        }
        Ok(())
    }

    /// Packet sequencer: retransmit lost CRYPTO frames first, else cut new
    /// packets from the CRYPTO streams, then any post-handshake frames.
    pub(crate) fn prep_packets(&mut self) -> Result<()> {
        if self.close.is_some() {
            return self.prep_close_packet();
        }
        if self.retransmit {
            self.prep_retransmit_packets()?;
        }
        if !self.retransmit {
            self.prep_crypto_packets()?;
        }
        let app_space = EncryptionLevel::OneRtt.space().index();
        let app_work = !self.post_handshake_frames.is_empty()
            || (self.spaces[app_space].ack_required && !self.spaces[app_space].ack_ranges.is_empty());
        if app_work && self.levels[EncryptionLevel::OneRtt.index()].tx_keys.is_some() {
            self.prep_app_packets()?;
        }
        self.send_wanted = false;
        Ok(())
    }

    /// Sending levels for the current handshake state: the level to drain
    /// first and the one to advance to once the first is consumed.
    fn send_levels(&self) -> (EncryptionLevel, EncryptionLevel) {
        match self.state {
            ConnectionState::ServerInitial | ConnectionState::ClientInitial => {
                (EncryptionLevel::Initial, EncryptionLevel::Handshake)
            }
            _ => (EncryptionLevel::Handshake, EncryptionLevel::OneRtt),
        }
    }

    fn prep_crypto_packets(&mut self) -> Result<()> {
        let (start_level, next_level) = self.send_levels();
        let mut tel = start_level;
        let mut reuse_wbuf = false;

        loop {
            if !(self.tx_ring.wbuf().is_empty() || reuse_wbuf) {
                break;
            }
            reuse_wbuf = false;

            let space_idx = tel.space().index();
            let consumed = self.levels[tel.index()].tx_crypto.consumed();
            let ack_required = self.spaces[space_idx].ack_required
                && !self.spaces[space_idx].ack_ranges.is_empty();

            // Never seal at a level whose TX keys are absent.
            let sealable = self.levels[tel.index()].tx_keys.is_some();

            if !sealable || (consumed && !ack_required) {
                // Nothing at this level; Initial hands over to Handshake.
                if tel == start_level && tel != next_level && next_level != EncryptionLevel::OneRtt
                {
                    tel = next_level;
                    continue;
                }
                break;
            }

            let offset = self.levels[tel.index()].tx_crypto.offset();
            let remaining = self.levels[tel.index()].tx_crypto.remaining_from(offset) as usize;

            match self.build_crypto_packet(tel, offset, remaining)? {
                BuildResult::NoRoom => {
                    self.tx_ring.next_wbuf();
                }
                BuildResult::Stall => break,
                BuildResult::Built { crypto_len } => {
                    self.levels[tel.index()].tx_crypto.advance(crypto_len as u64);

                    if self.levels[tel.index()].tx_crypto.consumed() && tel == EncryptionLevel::Initial
                    {
                        tel = next_level;
                        if self.levels[tel.index()].tx_crypto.consumed() {
                            self.tx_ring.next_wbuf();
                        } else {
                            // Coalesce the first Handshake packet into the
                            // same datagram when it still has room.
                            reuse_wbuf = true;
                        }
                    } else {
                        self.tx_ring.next_wbuf();
                    }
                }
            }
        }
        Ok(())
    }

    fn prep_retransmit_packets(&mut self) -> Result<()> {
        let (start_level, next_level) = self.send_levels();

        'levels: for tel in [start_level, next_level] {
            loop {
                let (pn, mut rec) = match self.levels[tel.index()].tx_retransmit.iter().next() {
                    Some((&pn, &rec)) => (pn, rec),
                    None => break,
                };
                if !self.tx_ring.wbuf().is_empty() {
                    break 'levels;
                }

                match self.build_crypto_packet(tel, rec.offset, rec.len)? {
                    BuildResult::NoRoom => {
                        self.tx_ring.next_wbuf();
                    }
                    BuildResult::Stall => break 'levels,
                    BuildResult::Built { crypto_len } => {
                        rec.offset += crypto_len as u64;
                        rec.len -= crypto_len;
                        let retransmit = &mut self.levels[tel.index()].tx_retransmit;
                        if rec.len == 0 {
                            retransmit.remove(&pn);
                        } else {
                            retransmit.insert(pn, rec);
                        }
                        self.tx_ring.next_wbuf();
                    }
                }
            }
        }

        if self
            .levels
            .iter()
            .all(|l| l.tx_retransmit.is_empty())
        {
            self.retransmit = false;
        }
        Ok(())
    }

    fn prep_app_packets(&mut self) -> Result<()> {
        loop {
            let space_idx = EncryptionLevel::OneRtt.space().index();
            let ack_due = self.spaces[space_idx].ack_required
                && !self.spaces[space_idx].ack_ranges.is_empty();
            if (self.post_handshake_frames.is_empty() && !ack_due)
                || !self.tx_ring.wbuf().is_empty()
            {
                break;
            }
            match self.build_app_packet()? {
                BuildResult::NoRoom => {
                    self.tx_ring.next_wbuf();
                }
                BuildResult::Stall => break,
                BuildResult::Built { .. } => {
                    self.tx_ring.next_wbuf();
                }
            }
        }
        Ok(())
    }
}
