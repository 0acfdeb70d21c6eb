//! Per-connection state and the handshake pipelines.
//!
//! A [`Connection`] composes four encryption-level states, three
//! packet-number spaces, the TLS engine handle, negotiated transport
//! parameters and the TX datagram ring. The receive pipeline
//! ([`recv`]), send pipeline ([`send`]) and handshake driver
//! ([`handshake`]) are implemented as separate impl blocks over this type.

pub mod crypto_stream;
pub mod enc_level;
pub mod tx_ring;

mod handshake;
mod recv;
mod send;

#[cfg(test)]
mod tests;

use std::collections::VecDeque;
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use crate::crypto::key_schedule;
use crate::error::{Result, TransportError};
use crate::events::{ConnEvent, EventSink};
use crate::frames::NewConnectionIdFrame;
use crate::packet::space::{PktSpace, SpaceId};
use crate::tls::{EncryptionLevel, TlsEngine};
use crate::transport::parameters::TransportParameters;
use crate::types::{ConnectionId, Side, Version};

use enc_level::EncLevel;
use tx_ring::TxRing;

pub use handshake::ConnectionState;

/// A CONNECTION_CLOSE waiting to be emitted (at most once).
#[derive(Debug, Clone, Copy)]
pub(crate) struct CloseState {
    pub error_code: u64,
    pub frame_type: u64,
    pub sent: bool,
}

/// A server-side QUIC connection.
pub struct Connection {
    pub(crate) side: Side,
    pub(crate) version: Version,

    /// The client's original DCID; echoed in the
    /// original_destination_connection_id transport parameter and the IKM
    /// of the Initial secrets.
    pub(crate) odcid: ConnectionId,
    /// DCID for outgoing packets: the peer's current SCID.
    pub(crate) dcid: ConnectionId,
    /// Our primary local CID, carried as SCID in long headers.
    pub(crate) scid: ConnectionId,
    /// Additional local CIDs issued through NEW_CONNECTION_ID.
    pub(crate) local_cids: Vec<NewConnectionIdFrame>,

    pub(crate) peer_addr: SocketAddr,

    pub(crate) levels: [EncLevel; EncryptionLevel::COUNT],
    pub(crate) spaces: [PktSpace; SpaceId::COUNT],

    pub(crate) state: ConnectionState,
    pub(crate) tls: Box<dyn TlsEngine>,

    pub(crate) local_params: TransportParameters,
    pub(crate) peer_params: Option<TransportParameters>,

    pub(crate) tx_ring: TxRing,
    /// Bytes of unacknowledged CRYPTO data across all levels.
    pub(crate) crypto_in_flight: usize,
    /// Lost CRYPTO frames are waiting in some level's retransmit set.
    pub(crate) retransmit: bool,
    /// Frames queued for 1-RTT packets after handshake completion.
    pub(crate) post_handshake_frames: VecDeque<crate::frames::Frame>,
    /// TLS signalled a complete flight; the send pipeline should run.
    pub(crate) send_wanted: bool,

    pub(crate) close: Option<CloseState>,

    pub(crate) last_activity: Instant,
    pub(crate) idle_timeout: Duration,

    pub(crate) sink: Option<Box<dyn EventSink>>,
}

impl Connection {
    /// Instantiate a server connection for a client's first Initial packet.
    ///
    /// `odcid` is the client-chosen DCID (the Initial-secret IKM), `scid`
    /// the client's SCID which becomes our outgoing DCID. Local transport
    /// parameters are completed with the ODCID echo and our fresh source
    /// CID, then handed to the TLS engine.
    #[allow(clippy::too_many_arguments)]
    pub fn new_server(
        version: Version,
        odcid: ConnectionId,
        peer_scid: ConnectionId,
        peer_addr: SocketAddr,
        local_cid_len: usize,
        mut params: TransportParameters,
        mut tls: Box<dyn TlsEngine>,
        idle_timeout: Duration,
        now: Instant,
    ) -> Result<Self> {
        let scid = ConnectionId::random(local_cid_len);

        params.original_destination_connection_id = Some(odcid.clone());
        params.initial_source_connection_id = Some(scid.clone());
        let blob = params.encode()?;
        tls.set_transport_params(&blob)?;

        let mut levels = [
            EncLevel::new(EncryptionLevel::Initial),
            EncLevel::new(EncryptionLevel::ZeroRtt),
            EncLevel::new(EncryptionLevel::Handshake),
            EncLevel::new(EncryptionLevel::OneRtt),
        ];

        let (rx_keys, tx_keys) = key_schedule::derive_initial_keys(odcid.as_bytes(), Side::Server)?;
        let initial = &mut levels[EncryptionLevel::Initial.index()];
        initial.install_rx_keys(crate::crypto::CipherSuite::INITIAL, rx_keys);
        initial.install_tx_keys(crate::crypto::CipherSuite::INITIAL, tx_keys);

        Ok(Self {
            side: Side::Server,
            version,
            odcid,
            dcid: peer_scid,
            scid,
            local_cids: Vec::new(),
            peer_addr,
            levels,
            spaces: [PktSpace::new(), PktSpace::new(), PktSpace::new()],
            state: ConnectionState::ServerInitial,
            tls,
            local_params: params,
            peer_params: None,
            tx_ring: TxRing::new(),
            crypto_in_flight: 0,
            retransmit: false,
            post_handshake_frames: VecDeque::new(),
            send_wanted: false,
            close: None,
            last_activity: now,
            idle_timeout,
            sink: None,
        })
    }

    /// Our primary local connection ID.
    pub fn scid(&self) -> &ConnectionId {
        &self.scid
    }

    /// Every local CID the listener should index: the primary SCID plus
    /// issued NEW_CONNECTION_ID values.
    pub fn local_cids(&self) -> impl Iterator<Item = &ConnectionId> {
        std::iter::once(&self.scid).chain(self.local_cids.iter().map(|f| &f.cid))
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn is_closed(&self) -> bool {
        self.state == ConnectionState::Closed
    }

    pub fn is_draining(&self) -> bool {
        self.state == ConnectionState::Draining
    }

    /// The peer's transport parameters, once received.
    pub fn peer_params(&self) -> Option<&TransportParameters> {
        self.peer_params.as_ref()
    }

    /// Subscribe a sink to this connection's structured events.
    pub fn set_event_sink(&mut self, sink: Box<dyn EventSink>) {
        self.sink = Some(sink);
    }

    pub(crate) fn emit(&mut self, event: ConnEvent) {
        tracing::trace!(scid = %self.scid, ?event, "conn event");
        if let Some(sink) = self.sink.as_mut() {
            sink.on_event(&event);
        }
    }

    pub(crate) fn level(&self, level: EncryptionLevel) -> &EncLevel {
        &self.levels[level.index()]
    }

    pub(crate) fn level_mut(&mut self, level: EncryptionLevel) -> &mut EncLevel {
        &mut self.levels[level.index()]
    }

    pub(crate) fn space(&self, id: SpaceId) -> &PktSpace {
        &self.spaces[id.index()]
    }

    pub(crate) fn space_mut(&mut self, id: SpaceId) -> &mut PktSpace {
        &mut self.spaces[id.index()]
    }

    /// Enter the closing path with a transport error: queue one best-effort
    /// CONNECTION_CLOSE and start draining.
    pub(crate) fn close_with(&mut self, error: TransportError) {
        if matches!(self.state, ConnectionState::Draining | ConnectionState::Closed) {
            return;
        }
        let code = error.to_wire();
        self.emit(ConnEvent::Closing { error_code: code });
        self.close = Some(CloseState {
            error_code: code,
            frame_type: 0,
            sent: false,
        });
        self.state = ConnectionState::Draining;
    }

    /// Close silently: no CONNECTION_CLOSE is emitted.
    pub(crate) fn close_silently(&mut self) {
        self.close = None;
        self.state = ConnectionState::Closed;
    }

    /// Record packet activity for the idle timer.
    pub(crate) fn on_activity(&mut self, now: Instant) {
        self.last_activity = now;
    }

    /// Whether the idle deadline has passed.
    pub fn idle_expired(&self, now: Instant) -> bool {
        now.duration_since(self.last_activity) >= self.idle_timeout
    }

    /// Expire the connection on idle timeout: silent close.
    pub fn handle_timeout(&mut self, now: Instant) {
        if self.idle_expired(now) {
            tracing::debug!(scid = %self.scid, "idle timeout, closing");
            self.close_silently();
        }
    }

    /// Drain the next datagram the send pipeline produced.
    pub fn poll_transmit(&mut self) -> Option<(Vec<u8>, SocketAddr)> {
        let datagram = self.tx_ring.pop_datagram()?;
        Some((datagram, self.peer_addr))
    }

    /// Sum of in-flight CRYPTO frame bytes across levels; equal to
    /// `crypto_in_flight` at every quiescent point.
    #[cfg(test)]
    pub(crate) fn in_flight_frame_bytes(&self) -> usize {
        self.levels
            .iter()
            .map(|l| l.tx_in_flight.values().map(|r| r.len).sum::<usize>())
            .sum()
    }
}
