//! Handshake driver: the per-connection state machine sequencing packet
//! intake, TLS progress, sending and level advancement.

use std::time::Instant;

use crate::crypto::key_schedule::derive_level_keys;
use crate::crypto::suite::CipherSuite;
use crate::error::{Error, Result, TransportError};
use crate::events::{ConnEvent, Direction};
use crate::frames::{Frame, NewConnectionIdFrame};
use crate::tls::{EncryptionLevel, HandshakeStatus, TlsEvent};
use crate::transport::parameters::TransportParameters;
use crate::types::{ConnectionId, Side, STATELESS_RESET_TOKEN_LEN};

use super::Connection;

/// Connection lifecycle state. The handshake phases mirror which flight the
/// endpoint is currently sending; Draining and Closed are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    ServerInitial,
    ServerHandshake,
    ClientInitial,
    ClientHandshake,
    /// Handshake confirmed; 1-RTT only from here on.
    Confirmed,
    /// Closing: discard everything except CONNECTION_CLOSE, send at most
    /// one CONNECTION_CLOSE.
    Draining,
    Closed,
}

impl Connection {
    /// One iteration of the connection task: flush deferred header
    /// protection, process buffered packets level by level, drive TLS,
    /// transmit, and advance to the next level while its keys and packets
    /// are ready.
    ///
    /// Errors inside the iteration turn into CONNECTION_CLOSE / silent
    /// close according to the failure kind; `drive` itself never fails.
    pub fn drive(&mut self, now: Instant) {
        match self.state {
            ConnectionState::Closed => return,
            ConnectionState::Draining => {
                // Only the single close packet may still go out.
                let _ = self.prep_close_packet();
                return;
            }
            _ => {}
        }

        let driven = if self.state == ConnectionState::Confirmed {
            self.drive_confirmed(now)
        } else {
            self.drive_inner(now)
        };
        if let Err(e) = driven {
            tracing::debug!(scid = %self.scid, error = %e, "connection failure");
            match e {
                Error::CryptoBufExhausted => self.close_silently(),
                Error::Transport(te) => self.close_with(te),
                Error::ShortBuffer | Error::AeadAuthFailed => {
                    self.close_with(TransportError::InternalError)
                }
            }
            let _ = self.prep_close_packet();
        }
    }

    fn drive_inner(&mut self, now: Instant) -> Result<()> {
        let order = EncryptionLevel::crypto_levels();
        let mut idx = 0;

        loop {
            let level = order[idx];

            // Deferred header-protection removal once keys are available.
            if self.levels[level.index()].rx_keys.is_some()
                && !self.levels[level.index()].rx_pending_hp.is_empty()
            {
                let largest = self.space(level.space()).largest_rx_pn;
                let dropped = self.levels[level.index()].flush_pending_hp(largest);
                for _ in 0..dropped {
                    self.emit(ConnEvent::PacketDropped {
                        reason: crate::events::DropReason::HeaderProtection,
                    });
                }
            }

            if !self.levels[level.index()].rx_packets.is_empty() {
                self.process_rx_packets(level)?;
            }
            if self.is_draining() {
                return Ok(());
            }

            self.pump_tls()?;
            self.prep_packets()?;
            self.on_activity(now);

            // Advance while the next level already has keys and packets.
            let next = idx + 1;
            if next < order.len() {
                let nl = order[next];
                let ready = self.levels[nl.index()].rx_keys.is_some()
                    && self.levels[nl.index()].buffered_rx() > 0;
                if ready {
                    if self.state == ConnectionState::ServerInitial
                        && nl == EncryptionLevel::Handshake
                    {
                        self.state = ConnectionState::ServerHandshake;
                    }
                    idx = next;
                    continue;
                }
            }
            return Ok(());
        }
    }

    /// Post-handshake iteration: no level sequencing left, just drain
    /// whatever arrived at the Handshake (late flight retransmits) and
    /// Application levels, then send.
    fn drive_confirmed(&mut self, now: Instant) -> Result<()> {
        for level in [EncryptionLevel::Handshake, EncryptionLevel::OneRtt] {
            if self.levels[level.index()].rx_keys.is_some()
                && !self.levels[level.index()].rx_pending_hp.is_empty()
            {
                let largest = self.space(level.space()).largest_rx_pn;
                self.levels[level.index()].flush_pending_hp(largest);
            }
            if !self.levels[level.index()].rx_packets.is_empty() {
                self.process_rx_packets(level)?;
            }
            if self.is_draining() {
                return Ok(());
            }
        }

        self.pump_tls()?;
        self.prep_packets()?;
        self.on_activity(now);
        Ok(())
    }

    /// Drive the TLS engine and apply every event it produced. Detects
    /// completion exactly once and emits the post-handshake flight.
    pub(crate) fn pump_tls(&mut self) -> Result<()> {
        let status = self
            .tls
            .drive_handshake()
            .map_err(|_| Error::Transport(TransportError::Crypto(0x28)))?;

        while let Some(event) = self.tls.next_event() {
            self.handle_tls_event(event)?;
        }

        if status == HandshakeStatus::Complete
            && matches!(
                self.state,
                ConnectionState::ServerInitial | ConnectionState::ServerHandshake
            )
        {
            self.on_handshake_complete()?;
        }
        Ok(())
    }

    fn handle_tls_event(&mut self, event: TlsEvent) -> Result<()> {
        match event {
            TlsEvent::ReadSecret(level, suite_id, secret) => {
                let suite = CipherSuite::from_tls_id(suite_id)
                    .ok_or(Error::Transport(TransportError::Crypto(0x28)))?;
                let keys = derive_level_keys(suite, &secret)?;
                self.levels[level.index()].install_rx_keys(suite, keys);
                self.emit(ConnEvent::KeysInstalled {
                    level,
                    direction: Direction::Rx,
                });

                if level == EncryptionLevel::OneRtt {
                    self.receive_peer_params()?;
                }
            }
            TlsEvent::WriteSecret(level, suite_id, secret) => {
                let suite = CipherSuite::from_tls_id(suite_id)
                    .ok_or(Error::Transport(TransportError::Crypto(0x28)))?;
                let keys = derive_level_keys(suite, &secret)?;
                self.levels[level.index()].install_tx_keys(suite, keys);
                self.emit(ConnEvent::KeysInstalled {
                    level,
                    direction: Direction::Tx,
                });
            }
            TlsEvent::HandshakeData(level, data) => {
                // The server's handshake flights only ever ride Initial and
                // Handshake CRYPTO streams; anything else is an engine bug.
                if !matches!(level, EncryptionLevel::Initial | EncryptionLevel::Handshake) {
                    return Err(Error::Transport(TransportError::ProtocolViolation));
                }
                self.levels[level.index()].tx_crypto.append(&data)?;
            }
            TlsEvent::FlushFlight => {
                self.send_wanted = true;
            }
            TlsEvent::Alert(_, code) => {
                return Err(Error::Transport(TransportError::Crypto(code)));
            }
        }
        Ok(())
    }

    /// Decode and adopt the client's transport parameters after 1-RTT read
    /// keys are installed.
    fn receive_peer_params(&mut self) -> Result<()> {
        let blob = match self.tls.peer_transport_params() {
            Some(blob) => blob,
            None => return Err(Error::Transport(TransportError::TransportParameterError)),
        };
        let params = TransportParameters::decode(&blob, Side::Client)?;

        if params.max_idle_timeout > 0 {
            let peer = std::time::Duration::from_millis(params.max_idle_timeout);
            self.idle_timeout = self.idle_timeout.min(peer);
        }
        self.peer_params = Some(params);
        Ok(())
    }

    /// Handshake completion: run post-handshake TLS processing, then queue
    /// HANDSHAKE_DONE plus one NEW_CONNECTION_ID per CID slot the peer
    /// advertises beyond the primary.
    fn on_handshake_complete(&mut self) -> Result<()> {
        self.tls
            .process_post_handshake()
            .map_err(|_| Error::Transport(TransportError::Crypto(0x28)))?;

        self.post_handshake_frames.push_back(Frame::HandshakeDone);

        // Bounded regardless of what the peer advertises.
        let cid_limit = self
            .peer_params
            .as_ref()
            .map(|p| p.active_connection_id_limit)
            .unwrap_or(2)
            .min(8);
        for seq in 1..cid_limit {
            let cid = ConnectionId::random(self.scid.len());
            let mut reset_token = [0u8; STATELESS_RESET_TOKEN_LEN];
            let _ = getrandom::getrandom(&mut reset_token);
            let frame = NewConnectionIdFrame {
                seq,
                retire_prior_to: 0,
                cid,
                reset_token,
            };
            self.local_cids.push(frame.clone());
            self.post_handshake_frames.push_back(Frame::NewConnectionId(frame));
        }

        self.state = ConnectionState::Confirmed;
        self.emit(ConnEvent::HandshakeComplete);
        tracing::debug!(scid = %self.scid, "handshake complete");

        self.prep_packets()
    }
}
