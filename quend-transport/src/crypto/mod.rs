//! Packet-protection cryptography (RFC 9001).
//!
//! The QUIC state machine does not pick algorithms itself: the Initial level
//! is fixed to AES-128-GCM/SHA-256, later levels inherit the TLS-negotiated
//! suite. Concrete primitives are RustCrypto implementations behind thin
//! wrappers keyed by [`CipherSuite`].

pub mod aead;
pub mod hkdf;
pub mod hp;
pub mod key_schedule;
pub mod suite;

pub use aead::PacketAead;
pub use hp::HeaderProtector;
pub use key_schedule::{derive_initial_keys, derive_level_keys, LevelKeys, INITIAL_SALT_V1};
pub use suite::{CipherSuite, Md};
