//! # Architecture Documentation
//!
//! This module documents how the pieces of quend-transport fit together:
//! the data flow through the endpoint, the per-connection pipelines, and
//! the integration seams the embedding process plugs into.

// ============================================================================
// DATA FLOW OVERVIEW
// ============================================================================

//! ## Data Flow
//!
//! ```text
//! UDP datagram + source address
//!        │
//!        ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    server::Endpoint                          │
//! │                                                              │
//! │  • fixed-bit check, per-datagram packet iteration            │
//! │  • Initial packets:  (DCID, source addr) → connection        │
//! │  • everything else:  local CID → connection                  │
//! │  • unknown Initial DCID → Connection::new_server             │
//! └─────────────────────────────────────────────────────────────┘
//!        │ accept_packet()                    ▲ poll_transmit()
//!        ▼                                    │
//! ┌─────────────────────────────────────────────────────────────┐
//! │                  connection::Connection                      │
//! │                                                              │
//! │  receive (recv.rs)          send (send.rs)                   │
//! │  ┌────────────────────┐     ┌─────────────────────────────┐  │
//! │  │ header protection  │     │ sequencer: retransmit, then │  │
//! │  │ removal or parking │     │ CRYPTO stream, then 1-RTT   │  │
//! │  │ AEAD open          │     │ packet builder: ACK +       │  │
//! │  │ frame dispatch     │     │ CRYPTO + PADDING, seal,     │  │
//! │  │ ACK application    │     │ header protection, TX ring  │  │
//! │  └────────────────────┘     └─────────────────────────────┘  │
//! │            │                              ▲                  │
//! │            ▼  in-order CRYPTO             │ HandshakeData    │
//! │  ┌─────────────────────────────────────────────────────────┐ │
//! │  │            tls::TlsEngine (external)                     │ │
//! │  │  provide_data / drive_handshake → ReadSecret,            │ │
//! │  │  WriteSecret, HandshakeData, FlushFlight, Alert          │ │
//! │  └─────────────────────────────────────────────────────────┘ │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! The handshake driver (`connection/handshake.rs`) is the outer loop tying
//! the halves together: per iteration it flushes deferred header
//! protection, processes buffered packets level by level, pumps the TLS
//! engine, runs the send sequencer, and advances to the next encryption
//! level while its keys and packets are both ready.

// ============================================================================
// ENCRYPTION LEVELS AND PACKET-NUMBER SPACES
// ============================================================================

//! ## Levels and Spaces
//!
//! Four encryption levels map onto three packet-number spaces:
//!
//! ```text
//! level      Initial   0-RTT        Handshake   1-RTT
//! space      Initial   Application  Handshake   Application
//! CRYPTO     yes       no           yes         yes (unused by servers)
//! ```
//!
//! Each level owns its keys, its RX queues and its TX CRYPTO stream
//! (`connection/enc_level.rs`); each space owns packet-number allocation,
//! the largest-received watermark and the ACK-range set
//! (`packet/space.rs`). ACKs never cross spaces.
//!
//! A packet that arrives before its level's RX secrets exist cannot even
//! have its packet number read (the number is header-protected), so it is
//! parked byte-for-byte on the level's pending list with its recorded
//! `pn_offset` and revisited after key installation.

// ============================================================================
// CRYPTO DATA LIFE CYCLE
// ============================================================================

//! ## CRYPTO Data Life Cycle (TX)
//!
//! ```text
//! TlsEvent::HandshakeData ──► CryptoStream (16 KiB buffers, send cursor)
//!                                   │ cut ≤ one frame per packet
//!                                   ▼
//!                            tx_in_flight: pn → {offset, len}
//!                                   │
//!              ACK covers pn ───────┤────────── gap reported by ACK
//!                    │              ▼                   │
//!                    ▼         record dropped,          ▼
//!             bytes credited   in-flight credited   tx_retransmit
//!             to in-flight                          (coalesced, re-cut
//!             budget                                 under new PNs)
//! ```
//!
//! The in-flight budget (4096 bytes) bounds unacknowledged CRYPTO data;
//! when it is exhausted the packet builder reports a stall and the
//! sequencer stops until ACKs free the window. Stream buffers are never
//! released while the connection lives, so retransmission can always
//! re-cut a lost range from its original offset.

// ============================================================================
// INTEGRATION SEAMS
// ============================================================================

//! ## Integration Seams
//!
//! The crate performs no I/O and owns no tasks. The embedding process
//! supplies three things:
//!
//! 1. **Datagrams in**: `Endpoint::handle_datagram(bytes, addr, now, out)`
//!    from its UDP receive loop; `out` collects datagrams to transmit.
//! 2. **Time**: a monotonic `Instant` on every call; idle expiry runs
//!    through `Endpoint::handle_timeouts(now)`.
//! 3. **A TLS engine** per connection through the factory given to
//!    `Endpoint::new`. The engine speaks the five QUIC TLS callbacks as
//!    [`crate::tls::TlsEvent`] values; secrets it installs are expanded
//!    into packet-protection keys by the key schedule, never by the engine
//!    itself.
//!
//! One endpoint serializes all of its connections; cross-connection
//! parallelism comes from running one endpoint per SO_REUSEPORT socket,
//! which also keeps a connection's packets on a single endpoint.
//!
//! Observability is event-driven: connection internals emit
//! [`crate::events::ConnEvent`] values to a pluggable sink, and tests
//! subscribe to the same stream the daemon forwards to its telemetry.
