//! Receive pipeline: header-protection removal (or deferral), AEAD open,
//! frame dispatch and ACK processing.

use std::time::Instant;

use bytes::{Bytes, BytesMut};

use crate::error::{Error, Result, TransportError};
use crate::events::{ConnEvent, DropReason};
use crate::frames::{parse_frame, AckFrame, Frame};
use crate::packet::header::{Header, PacketType};
use crate::tls::EncryptionLevel;
use crate::types::CONN_MAX_PACKET;

use super::enc_level::{RxCrypto, RxPacket};
use super::handshake::ConnectionState;
use super::Connection;

impl Connection {
    /// Accept one packet from the demultiplexer (header already parsed,
    /// `data` holding exactly the packet's bytes).
    ///
    /// Removes header protection immediately when the level's RX keys are
    /// installed, otherwise parks the packet on the level's pending list
    /// for the driver to retry after key installation.
    pub fn accept_packet(&mut self, header: Header, data: BytesMut, now: Instant) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            self.emit(ConnEvent::PacketDropped {
                reason: DropReason::Draining,
            });
            return;
        }

        let level = match header.ty {
            PacketType::Initial => EncryptionLevel::Initial,
            PacketType::Handshake => EncryptionLevel::Handshake,
            PacketType::Short => EncryptionLevel::OneRtt,
            // 0-RTT carries no handshake data and Retry is out of scope;
            // neither will ever have keys here.
            PacketType::ZeroRtt | PacketType::Retry => {
                self.emit(ConnEvent::PacketDropped {
                    reason: DropReason::Malformed,
                });
                return;
            }
        };

        if self.levels.iter().map(|l| l.buffered_rx()).sum::<usize>() >= CONN_MAX_PACKET {
            self.emit(ConnEvent::PacketDropped {
                reason: DropReason::BufferFull,
            });
            return;
        }

        if header.ty == PacketType::Initial {
            // The client may switch its SCID between Initials; our
            // outgoing DCID follows it.
            if let Some(scid) = &header.scid {
                self.dcid = scid.clone();
            }
        }
        if header.ty == PacketType::Handshake && self.state == ConnectionState::ServerInitial {
            self.state = ConnectionState::ServerHandshake;
        }

        let len = data.len();
        let mut pkt = RxPacket {
            ty: header.ty,
            long_header: header.long_header,
            pn_offset: header.pn_offset,
            data,
            len,
            pn: 0,
            aad_len: 0,
            processed: false,
            ack_eliciting: false,
            crypto: Vec::new(),
        };

        self.on_activity(now);

        let largest_pn = self.space(level.space()).largest_rx_pn;
        let enc_level = &mut self.levels[level.index()];
        if enc_level.rx_keys.is_some() {
            match enc_level.remove_header_protection(&mut pkt, largest_pn) {
                Ok(()) => {
                    enc_level.rx_packets.insert(pkt.pn, pkt);
                }
                Err(_) => {
                    self.emit(ConnEvent::PacketDropped {
                        reason: DropReason::HeaderProtection,
                    });
                }
            }
        } else {
            enc_level.queue_rx_protected(pkt);
        }
    }

    /// Process every unprotected packet buffered at `level`: decrypt,
    /// dispatch frames, update packet-number bookkeeping, and deliver
    /// in-order CRYPTO data to the TLS engine. Packets whose CRYPTO frames
    /// are still ahead of the stream cursor stay buffered.
    pub(crate) fn process_rx_packets(&mut self, level: EncryptionLevel) -> Result<()> {
        let space_id = level.space();

        loop {
            let mut delivered = false;
            let pns: Vec<u64> = self.levels[level.index()].rx_packets.keys().copied().collect();

            for pn in pns {
                let mut pkt = match self.levels[level.index()].rx_packets.remove(&pn) {
                    Some(pkt) => pkt,
                    None => continue,
                };

                if !pkt.processed {
                    if self.levels[level.index()].decrypt_packet(&mut pkt).is_err() {
                        self.emit(ConnEvent::PacketDropped {
                            reason: DropReason::AeadAuthFailed,
                        });
                        continue;
                    }

                    match self.dispatch_frames(level, &mut pkt) {
                        Ok(()) => {}
                        Err(e) if e.is_packet_local() => {
                            self.emit(ConnEvent::PacketDropped {
                                reason: DropReason::Malformed,
                            });
                            continue;
                        }
                        Err(e) => return Err(e),
                    }
                    pkt.processed = true;

                    self.space_mut(space_id).on_packet_received(pkt.pn, pkt.ack_eliciting);
                    self.emit(ConnEvent::PacketReceived {
                        level,
                        pn: pkt.pn,
                        len: pkt.len,
                    });
                }

                // In-order CRYPTO delivery; out-of-order frames keep the
                // packet buffered until the cursor catches up.
                while let Some(idx) = {
                    let expected = self.levels[level.index()].rx_crypto_offset;
                    pkt.crypto.iter().position(|c| c.offset == expected)
                } {
                    let frame = pkt.crypto.swap_remove(idx);
                    self.tls
                        .provide_data(level, &frame.data)
                        .map_err(|_| Error::Transport(TransportError::Crypto(0x0a)))?;
                    self.levels[level.index()].rx_crypto_offset += frame.data.len() as u64;
                    self.emit(ConnEvent::CryptoDelivered {
                        level,
                        len: frame.data.len(),
                    });
                    delivered = true;
                }

                // Fully-superseded retransmissions are dropped with the
                // packet; only frames still ahead of the cursor hold it.
                let expected = self.levels[level.index()].rx_crypto_offset;
                pkt.crypto
                    .retain(|c| c.offset + c.data.len() as u64 > expected);
                if !pkt.crypto.is_empty() {
                    self.levels[level.index()].rx_packets.insert(pn, pkt);
                }
            }

            if !delivered {
                return Ok(());
            }
            // Delivery moved the cursor; rescan for frames that became
            // in-order.
        }
    }

    /// Walk the decrypted payload and act on each frame.
    fn dispatch_frames(&mut self, level: EncryptionLevel, pkt: &mut RxPacket) -> Result<()> {
        let payload = Bytes::copy_from_slice(&pkt.data[pkt.aad_len..pkt.len]);
        let mut offset = 0;

        while offset < payload.len() {
            let (frame, consumed) = parse_frame(&payload, offset)?;
            offset += consumed;

            if frame.is_ack_eliciting() {
                pkt.ack_eliciting = true;
            }

            match frame {
                Frame::Padding { .. } => {
                    // In 1-RTT packets padding is only valid as trailer.
                    if level == EncryptionLevel::OneRtt && offset != payload.len() {
                        return Err(Error::Transport(TransportError::ProtocolViolation));
                    }
                }
                Frame::Ping => {}
                Frame::Ack(ack) => self.process_ack_frame(level, &ack)?,
                Frame::Crypto(c) => {
                    if c.offset != self.levels[level.index()].rx_crypto_offset {
                        tracing::trace!(
                            ?level,
                            offset = c.offset,
                            expected = self.levels[level.index()].rx_crypto_offset,
                            "out-of-order CRYPTO frame held"
                        );
                    }
                    pkt.crypto.push(RxCrypto {
                        offset: c.offset,
                        data: c.data,
                    });
                }
                Frame::Stream(_) | Frame::NewConnectionId(_) => {
                    // Application-level content is not processed by this
                    // core; receipt still elicits an ACK.
                }
                Frame::ConnectionClose(_) | Frame::ApplicationClose { .. } => {
                    if level == EncryptionLevel::OneRtt {
                        tracing::debug!(scid = %self.scid, "peer closed the connection");
                        self.state = ConnectionState::Draining;
                    }
                }
                Frame::HandshakeDone => {
                    // Only servers send HANDSHAKE_DONE.
                    return Err(Error::Transport(TransportError::ProtocolViolation));
                }
            }
        }
        Ok(())
    }

    /// Apply an ACK frame: drop acknowledged CRYPTO frame records, move the
    /// frames inside reported gaps to the retransmit-pending set, and
    /// update the space's largest-acked watermark.
    fn process_ack_frame(&mut self, level: EncryptionLevel, ack: &AckFrame) -> Result<()> {
        let space_id = level.space();

        if ack.largest_ack > self.space(space_id).tx_next_pn {
            return Err(Error::Transport(TransportError::FrameEncodingError));
        }
        if ack.first_ack_range > ack.largest_ack {
            return Err(Error::Transport(TransportError::FrameEncodingError));
        }

        let mut largest = ack.largest_ack;
        let mut smallest = largest - ack.first_ack_range;
        let mut events = Vec::new();

        {
            let enc_level = &mut self.levels[level.index()];
            let in_flight = &mut self.crypto_in_flight;

            enc_level.ack_crypto_frames(largest, smallest, in_flight);
            for range in &ack.ranges {
                if smallest < range.gap + 2 {
                    return Err(Error::Transport(TransportError::FrameEncodingError));
                }
                let next_largest = smallest - range.gap - 2;
                if next_largest < range.length {
                    return Err(Error::Transport(TransportError::FrameEncodingError));
                }

                if let Some((_, merged)) =
                    enc_level.move_gap_to_retransmit(smallest, next_largest, in_flight)
                {
                    self.retransmit = true;
                    events.push(ConnEvent::CryptoRetransmitQueued {
                        level,
                        offset: merged.offset,
                        len: merged.len,
                    });
                }

                largest = next_largest;
                smallest = largest - range.length;
                enc_level.ack_crypto_frames(largest, smallest, in_flight);
            }
        }

        for event in events {
            self.emit(event);
        }
        self.space_mut(space_id).on_ack_received(ack.largest_ack);
        Ok(())
    }
}
