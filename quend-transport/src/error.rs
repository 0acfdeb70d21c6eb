//! Error types for QUIC transport operations.
//!
//! Two tiers, matching how failures propagate: [`Error`] distinguishes
//! packet-local failures (drop the packet, keep the connection) from
//! connection-fatal ones, and [`TransportError`] carries the RFC 9000
//! Section 20 wire codes used in CONNECTION_CLOSE frames.

use thiserror::Error;

/// Result alias for transport operations.
pub type Result<T> = core::result::Result<T, Error>;

/// Transport-level failure.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum Error {
    /// A codec bounds check failed: the buffer is shorter than the encoding
    /// claims. The offending packet is dropped; the datagram may continue.
    #[error("buffer too short")]
    ShortBuffer,

    /// AEAD authentication failed while opening a packet. The packet is
    /// dropped silently.
    #[error("AEAD authentication failed")]
    AeadAuthFailed,

    /// The TX CRYPTO stream could not grow. The connection is closed
    /// without sending CONNECTION_CLOSE.
    #[error("CRYPTO stream buffer exhausted")]
    CryptoBufExhausted,

    /// Connection-fatal protocol error carrying a wire error code.
    #[error("connection error: {0}")]
    Transport(TransportError),
}

impl Error {
    /// Whether this error is local to one packet (drop-and-continue).
    pub fn is_packet_local(&self) -> bool {
        matches!(self, Error::ShortBuffer | Error::AeadAuthFailed)
    }
}

impl From<TransportError> for Error {
    fn from(e: TransportError) -> Self {
        Error::Transport(e)
    }
}

/// QUIC transport error codes per RFC 9000 Section 20.1.
#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum TransportError {
    /// No error (0x00).
    #[error("no error")]
    NoError,

    /// Internal error (0x01).
    #[error("internal error")]
    InternalError,

    /// Connection refused (0x02).
    #[error("connection refused")]
    ConnectionRefused,

    /// Flow control error (0x03).
    #[error("flow control error")]
    FlowControlError,

    /// Stream limit error (0x04).
    #[error("stream limit error")]
    StreamLimitError,

    /// Stream state error (0x05).
    #[error("stream state error")]
    StreamStateError,

    /// Final size error (0x06).
    #[error("final size error")]
    FinalSizeError,

    /// Frame encoding error (0x07).
    #[error("frame encoding error")]
    FrameEncodingError,

    /// Transport parameter error (0x08).
    #[error("transport parameter error")]
    TransportParameterError,

    /// Connection ID limit error (0x09).
    #[error("connection ID limit error")]
    ConnectionIdLimitError,

    /// Protocol violation (0x0A).
    #[error("protocol violation")]
    ProtocolViolation,

    /// Invalid token (0x0B).
    #[error("invalid token")]
    InvalidToken,

    /// Application error (0x0C).
    #[error("application error")]
    ApplicationError,

    /// Crypto buffer exceeded (0x0D).
    #[error("crypto buffer exceeded")]
    CryptoBufferExceeded,

    /// TLS alert mapped into the QUIC crypto error space (0x0100-0x01FF).
    #[error("crypto error: alert {0:#x}")]
    Crypto(u8),
}

impl TransportError {
    /// Convert to the wire-format error code.
    pub fn to_wire(&self) -> u64 {
        match self {
            TransportError::NoError => 0x00,
            TransportError::InternalError => 0x01,
            TransportError::ConnectionRefused => 0x02,
            TransportError::FlowControlError => 0x03,
            TransportError::StreamLimitError => 0x04,
            TransportError::StreamStateError => 0x05,
            TransportError::FinalSizeError => 0x06,
            TransportError::FrameEncodingError => 0x07,
            TransportError::TransportParameterError => 0x08,
            TransportError::ConnectionIdLimitError => 0x09,
            TransportError::ProtocolViolation => 0x0A,
            TransportError::InvalidToken => 0x0B,
            TransportError::ApplicationError => 0x0C,
            TransportError::CryptoBufferExceeded => 0x0D,
            TransportError::Crypto(alert) => 0x0100 + (*alert as u64),
        }
    }

    /// Convert a wire-format error code back to an error.
    pub fn from_wire(code: u64) -> Self {
        match code {
            0x00 => TransportError::NoError,
            0x01 => TransportError::InternalError,
            0x02 => TransportError::ConnectionRefused,
            0x03 => TransportError::FlowControlError,
            0x04 => TransportError::StreamLimitError,
            0x05 => TransportError::StreamStateError,
            0x06 => TransportError::FinalSizeError,
            0x07 => TransportError::FrameEncodingError,
            0x08 => TransportError::TransportParameterError,
            0x09 => TransportError::ConnectionIdLimitError,
            0x0A => TransportError::ProtocolViolation,
            0x0B => TransportError::InvalidToken,
            0x0C => TransportError::ApplicationError,
            0x0D => TransportError::CryptoBufferExceeded,
            0x0100..=0x01FF => TransportError::Crypto((code - 0x0100) as u8),
            _ => TransportError::InternalError,
        }
    }
}
