//! TLS 1.3 engine interface (RFC 9001 Section 4).
//!
//! The TLS library is an external collaborator. The connection feeds it
//! in-order CRYPTO data with [`TlsEngine::provide_data`], drives it with
//! [`TlsEngine::drive_handshake`], and drains the events it produced:
//! secret installations, handshake flights, alerts. Events correspond
//! one-to-one to the QUIC TLS callbacks (set_read_secret, set_write_secret,
//! add_handshake_data, flush_flight, send_alert).

use crate::error::Result;
use crate::packet::space::SpaceId;

/// QUIC encryption level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum EncryptionLevel {
    Initial,
    ZeroRtt,
    Handshake,
    OneRtt,
}

impl EncryptionLevel {
    pub const COUNT: usize = 4;

    pub fn index(self) -> usize {
        match self {
            EncryptionLevel::Initial => 0,
            EncryptionLevel::ZeroRtt => 1,
            EncryptionLevel::Handshake => 2,
            EncryptionLevel::OneRtt => 3,
        }
    }

    pub fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(EncryptionLevel::Initial),
            1 => Some(EncryptionLevel::ZeroRtt),
            2 => Some(EncryptionLevel::Handshake),
            3 => Some(EncryptionLevel::OneRtt),
            _ => None,
        }
    }

    /// The packet-number space this level transmits in.
    pub fn space(self) -> SpaceId {
        match self {
            EncryptionLevel::Initial => SpaceId::Initial,
            EncryptionLevel::Handshake => SpaceId::Handshake,
            EncryptionLevel::ZeroRtt | EncryptionLevel::OneRtt => SpaceId::Application,
        }
    }

    /// Levels carrying a CRYPTO stream, in handshake order. 0-RTT has no
    /// CRYPTO stream and is skipped.
    pub fn crypto_levels() -> [EncryptionLevel; 3] {
        [
            EncryptionLevel::Initial,
            EncryptionLevel::Handshake,
            EncryptionLevel::OneRtt,
        ]
    }
}

/// Outcome of driving the TLS handshake forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// More CRYPTO data is needed in one direction or the other.
    InProgress,
    /// The handshake has completed.
    Complete,
}

/// An event produced by the TLS engine for the QUIC layer.
#[derive(Debug, Clone)]
pub enum TlsEvent {
    /// Install RX packet protection for a level: cipher-suite identifier
    /// plus the raw traffic secret.
    ReadSecret(EncryptionLevel, u16, Vec<u8>),
    /// Install TX packet protection for a level.
    WriteSecret(EncryptionLevel, u16, Vec<u8>),
    /// Handshake bytes to transmit in CRYPTO frames at the given level.
    HandshakeData(EncryptionLevel, Vec<u8>),
    /// Best-effort signal that a flight is complete and should be sent.
    FlushFlight,
    /// A TLS alert; mapped into the QUIC crypto error space (0x100 + code).
    Alert(EncryptionLevel, u8),
}

/// A server-side TLS 1.3 session speaking through QUIC CRYPTO frames.
pub trait TlsEngine: Send {
    /// Set the local transport parameters blob carried in the
    /// quic_transport_parameters extension.
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()>;

    /// The peer's transport parameters blob, once its flight carrying the
    /// extension has been processed.
    fn peer_transport_params(&self) -> Option<Vec<u8>>;

    /// Deliver in-order CRYPTO stream data received at `level`.
    fn provide_data(&mut self, level: EncryptionLevel, data: &[u8]) -> Result<()>;

    /// Drive the handshake forward. May synchronously queue events.
    fn drive_handshake(&mut self) -> Result<HandshakeStatus>;

    /// Process post-handshake messages (session tickets and the like).
    fn process_post_handshake(&mut self) -> Result<()>;

    /// Drain the next queued event, if any.
    fn next_event(&mut self) -> Option<TlsEvent>;
}

/// Placeholder engine for builds where no TLS terminator is linked in.
///
/// Accepts CRYPTO data, reports the handshake as perpetually in progress
/// and produces no events. Lets the datagram plumbing run end-to-end while
/// the embedder supplies the real engine.
#[derive(Debug, Default)]
pub struct NullTlsEngine {
    params: Vec<u8>,
}

impl TlsEngine for NullTlsEngine {
    fn set_transport_params(&mut self, params: &[u8]) -> Result<()> {
        self.params = params.to_vec();
        Ok(())
    }

    fn peer_transport_params(&self) -> Option<Vec<u8>> {
        None
    }

    fn provide_data(&mut self, _level: EncryptionLevel, _data: &[u8]) -> Result<()> {
        Ok(())
    }

    fn drive_handshake(&mut self) -> Result<HandshakeStatus> {
        Ok(HandshakeStatus::InProgress)
    }

    fn process_post_handshake(&mut self) -> Result<()> {
        Ok(())
    }

    fn next_event(&mut self) -> Option<TlsEvent> {
        None
    }
}
