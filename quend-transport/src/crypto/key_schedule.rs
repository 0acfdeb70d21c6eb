//! Key schedule: initial-secret derivation and per-level packet-protection
//! key expansion (RFC 9001 Section 5.1, 5.2).

use crate::crypto::aead::PacketAead;
use crate::crypto::hkdf;
use crate::crypto::hp::HeaderProtector;
use crate::crypto::suite::{CipherSuite, Md};
use crate::error::Result;
use crate::types::Side;

/// The QUIC v1 initial salt (RFC 9001 Section 5.2).
pub const INITIAL_SALT_V1: [u8; 20] = [
    0x38, 0x76, 0x2c, 0xf7, 0xf5, 0x59, 0x34, 0xb3, 0x4d, 0x17, 0x9a, 0xe6, 0xa4, 0xc8, 0x0c,
    0xad, 0xcc, 0xbb, 0x7f, 0x0a,
];

/// Packet-protection material for one direction of one encryption level:
/// the AEAD, its static IV, and the header-protection cipher.
pub struct LevelKeys {
    pub aead: PacketAead,
    pub iv: [u8; 12],
    pub hp: HeaderProtector,
}

impl LevelKeys {
    /// Build the per-packet AEAD nonce: the packet number left-padded to IV
    /// length with zeros, XORed with the IV (RFC 9001 Section 5.3).
    pub fn nonce(&self, pn: u64) -> [u8; 12] {
        let mut nonce = self.iv;
        let pn_bytes = pn.to_be_bytes();
        for i in 0..8 {
            nonce[4 + i] ^= pn_bytes[i];
        }
        nonce
    }
}

/// Expand a traffic secret into `{key, iv, hp_key}` and instantiate the
/// AEAD and header-protection ciphers for `suite`.
pub fn derive_level_keys(suite: CipherSuite, secret: &[u8]) -> Result<LevelKeys> {
    let md = suite.md();
    let key = hkdf::expand_label(md, secret, "quic key", suite.key_len())?;
    let iv_bytes = hkdf::expand_label(md, secret, "quic iv", suite.iv_len())?;
    let hp_key = hkdf::expand_label(md, secret, "quic hp", suite.key_len())?;

    let mut iv = [0u8; 12];
    iv.copy_from_slice(&iv_bytes);

    Ok(LevelKeys {
        aead: PacketAead::new(suite, &key)?,
        iv,
        hp: HeaderProtector::new(suite, &hp_key)?,
    })
}

/// Derive both Initial traffic secrets from the client-chosen DCID
/// (RFC 9001 Section 5.2). Returns `(rx_secret, tx_secret)` for `side`.
pub fn derive_initial_secrets(dcid: &[u8], side: Side) -> Result<(Vec<u8>, Vec<u8>)> {
    let initial = hkdf::extract(Md::Sha256, &INITIAL_SALT_V1, dcid);
    let client = hkdf::expand_label(Md::Sha256, &initial, "client in", 32)?;
    let server = hkdf::expand_label(Md::Sha256, &initial, "server in", 32)?;

    Ok(match side {
        Side::Server => (client, server),
        Side::Client => (server, client),
    })
}

/// Derive the full Initial-level key material for `side` from the
/// client-chosen DCID. Returns `(rx_keys, tx_keys)`.
pub fn derive_initial_keys(dcid: &[u8], side: Side) -> Result<(LevelKeys, LevelKeys)> {
    let (rx_secret, tx_secret) = derive_initial_secrets(dcid, side)?;
    let rx = derive_level_keys(CipherSuite::INITIAL, &rx_secret)?;
    let tx = derive_level_keys(CipherSuite::INITIAL, &tx_secret)?;
    Ok((rx, tx))
}
