//! Core QUIC types shared across the crate.

use bytes::Bytes;

/// Maximum length of a Connection ID (20 bytes per RFC 9000 Section 17.2).
pub const MAX_CID_LENGTH: usize = 20;

/// Default length of connection IDs issued by this endpoint.
pub const DEFAULT_LOCAL_CID_LEN: usize = 8;

/// Length of a stateless reset token (RFC 9000 Section 10.3).
pub const STATELESS_RESET_TOKEN_LEN: usize = 16;

/// AEAD authentication tag length; 16 bytes for every QUIC-TLS suite.
pub const TAG_LEN: usize = 16;

/// Minimum UDP payload size of an Initial packet (RFC 9000 Section 14.1).
pub const INITIAL_PACKET_MINLEN: usize = 1200;

/// Maximum QUIC packet we buffer; also the TX datagram buffer capacity.
pub const PACKET_MAXLEN: usize = 1252;

/// Maximum packet number value (62 bits).
pub const MAX_PACKET_NUMBER: u64 = (1u64 << 62) - 1;

/// Maximum number of buffered RX packets per connection. Power of two.
pub const CONN_MAX_PACKET: usize = 64;

/// Number of TX datagram buffers per connection. Power of two.
pub const CONN_TX_BUFS_NB: usize = 8;

/// Maximum bytes of CRYPTO data in flight during handshakes.
pub const CRYPTO_IN_FLIGHT_MAX: usize = 4096;

/// The TLS extension carrying QUIC transport parameters.
pub const TLS_EXT_TRANSPORT_PARAMS: u16 = 0xffa5;

/// Connection ID: an opaque byte string of 0..=20 bytes (RFC 9000
/// Section 5.1). Long-header packets carry both a DCID and an SCID; short
/// headers carry only the DCID, at the fixed length this endpoint issues.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId {
    bytes: Bytes,
}

impl ConnectionId {
    /// Create a connection ID from owned bytes.
    ///
    /// Returns `None` if the length exceeds [`MAX_CID_LENGTH`].
    pub fn new(bytes: Bytes) -> Option<Self> {
        if bytes.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self { bytes })
    }

    /// Create from a borrowed slice (copies data).
    pub fn from_slice(slice: &[u8]) -> Option<Self> {
        if slice.len() > MAX_CID_LENGTH {
            return None;
        }
        Some(Self {
            bytes: Bytes::copy_from_slice(slice),
        })
    }

    /// Generate a random connection ID of `len` bytes.
    pub fn random(len: usize) -> Self {
        debug_assert!(len <= MAX_CID_LENGTH);
        let mut buf = [0u8; MAX_CID_LENGTH];
        // Zero-filled CIDs on entropy failure would still be functional,
        // only guessable; getrandom only fails on broken platforms.
        let _ = getrandom::getrandom(&mut buf[..len]);
        Self {
            bytes: Bytes::copy_from_slice(&buf[..len]),
        }
    }

    /// Create an empty (zero-length) connection ID.
    pub fn empty() -> Self {
        Self { bytes: Bytes::new() }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

impl core::fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "ConnectionId(")?;
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        write!(f, ")")
    }
}

impl core::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        for byte in &self.bytes[..] {
            write!(f, "{:02x}", byte)?;
        }
        Ok(())
    }
}

/// QUIC version number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Version(pub u32);

impl Version {
    pub const NEGOTIATION: Version = Version(0x0000_0000);
    pub const V1: Version = Version(0x0000_0001);

    pub fn is_supported(self) -> bool {
        self == Version::V1
    }
}

/// Connection endpoint side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Client,
    Server,
}

impl Side {
    pub fn is_server(self) -> bool {
        matches!(self, Side::Server)
    }

    pub fn opposite(self) -> Side {
        match self {
            Side::Client => Side::Server,
            Side::Server => Side::Client,
        }
    }
}
