//! # quend-transport: server-side QUIC v1 transport core
//!
//! A sans-IO implementation of the QUIC v1 (RFC 9000/9001) handshake
//! transport for servers. The crate terminates QUIC packet protection on top
//! of UDP datagrams supplied by the caller and drives a TLS 1.3 engine
//! through CRYPTO frames:
//!
//! - Initial-secret derivation from the client-chosen DCID and per-level
//!   `{key, iv, hp_key}` expansion (RFC 9001 Section 5)
//! - AEAD packet protection and header protection for AES-128-GCM,
//!   AES-256-GCM, ChaCha20-Poly1305 and AES-128-CCM
//! - Packet-number spaces with truncated packet-number reconstruction and
//!   ACK-range bookkeeping (RFC 9000 Section 12.3, 19.3)
//! - In-order CRYPTO stream reassembly feeding a pluggable TLS engine, and
//!   ACK-driven retransmission of lost CRYPTO data
//! - A datagram-level endpoint demultiplexing packets onto connections by
//!   Connection ID
//!
//! ## Design
//!
//! The crate performs no socket I/O and starts no tasks. The embedding
//! process reads UDP datagrams and hands them to [`server::Endpoint`], which
//! routes packets to per-connection state machines and returns the datagrams
//! to transmit. One endpoint (and everything under it) is single-threaded;
//! run one endpoint per socket for cross-connection parallelism.
//!
//! The TLS 1.3 library is an external collaborator reached through the
//! [`tls::TlsEngine`] trait: the connection feeds it in-order CRYPTO data
//! and consumes its secret-installation and handshake-data events.

#![forbid(unsafe_code)]

pub mod architecture;
pub mod codec;
pub mod connection;
pub mod crypto;
pub mod error;
pub mod events;
pub mod frames;
pub mod packet;
pub mod server;
pub mod tls;
pub mod transport;
pub mod types;

#[cfg(test)]
pub(crate) mod test_util;

pub use connection::Connection;
pub use error::{Error, Result, TransportError};
pub use events::{ConnEvent, EventSink};
pub use server::{Endpoint, EndpointConfig, Transmit};
pub use tls::{EncryptionLevel, TlsEngine, TlsEvent};
pub use transport::parameters::TransportParameters;
pub use types::{ConnectionId, Side, Version};
