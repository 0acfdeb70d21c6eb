//! Structured per-connection events.
//!
//! Connection internals report notable state transitions through a
//! [`ConnEvent`] stream rather than ad-hoc log lines; the daemon forwards
//! them to telemetry and test code subscribes to assert on behavior.

use crate::tls::EncryptionLevel;

/// Direction of installed key material.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Rx,
    Tx,
}

/// Why an incoming packet was discarded.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Header or length field failed a bounds check.
    Malformed,
    /// AEAD tag verification failed.
    AeadAuthFailed,
    /// Header protection could not be removed.
    HeaderProtection,
    /// No connection matches the packet's DCID.
    UnknownConnectionId,
    /// The RX packet budget for the connection is exhausted.
    BufferFull,
    /// The connection is draining and discards everything but
    /// CONNECTION_CLOSE.
    Draining,
}

/// A structured event emitted by a connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnEvent {
    PacketReceived {
        level: EncryptionLevel,
        pn: u64,
        len: usize,
    },
    PacketDropped {
        reason: DropReason,
    },
    PacketSent {
        level: EncryptionLevel,
        pn: u64,
        len: usize,
    },
    KeysInstalled {
        level: EncryptionLevel,
        direction: Direction,
    },
    /// In-order CRYPTO bytes handed to the TLS engine.
    CryptoDelivered {
        level: EncryptionLevel,
        len: usize,
    },
    /// A lost CRYPTO frame was queued for retransmission.
    CryptoRetransmitQueued {
        level: EncryptionLevel,
        offset: u64,
        len: usize,
    },
    HandshakeComplete,
    /// The connection started closing with the given wire error code.
    Closing {
        error_code: u64,
    },
}

/// Receiver of connection events.
pub trait EventSink: Send {
    fn on_event(&mut self, event: &ConnEvent);
}

/// Sink that discards everything.
#[derive(Debug, Default)]
pub struct NopSink;

impl EventSink for NopSink {
    fn on_event(&mut self, _event: &ConnEvent) {}
}
