//! Header-protection mask generation (RFC 9001 Section 5.4).
//!
//! The mask is five bytes of keystream derived from a 16-byte sample of the
//! protected packet, taken at `pn_offset + 4` (a 4-byte packet-number
//! placeholder). `mask[0]` covers the first header byte (low 4 bits for long
//! headers, low 5 for short), `mask[1..5]` the packet-number field.
//!
//! Suite mapping: the AES-GCM and AES-CCM suites use AES-ECB over the sample
//! (equivalent to AES-CTR with the sample as counter block);
//! ChaCha20-Poly1305 uses raw ChaCha20 with the sample split into counter
//! and nonce.

use aes::cipher::{BlockEncrypt, KeyInit};
use aes::Block;
use chacha20::cipher::{KeyIvInit, StreamCipher, StreamCipherSeek};
use chacha20::ChaCha20;

use crate::crypto::suite::CipherSuite;
use crate::error::{Error, Result, TransportError};

/// Length of the ciphertext sample fed to the mask generator.
pub const SAMPLE_LEN: usize = 16;

/// Header-protection cipher bound to one hp_key.
pub enum HeaderProtector {
    Aes128(Box<aes::Aes128>),
    Aes256(Box<aes::Aes256>),
    ChaCha20 { key: [u8; 32] },
}

impl HeaderProtector {
    /// Instantiate the header-protection cipher for `suite` with `hp_key`.
    pub fn new(suite: CipherSuite, hp_key: &[u8]) -> Result<Self> {
        if hp_key.len() != suite.key_len() {
            return Err(Error::Transport(TransportError::InternalError));
        }
        let hp = match suite {
            CipherSuite::Aes128GcmSha256 | CipherSuite::Aes128CcmSha256 => HeaderProtector::Aes128(
                Box::new(
                    aes::Aes128::new_from_slice(hp_key)
                        .map_err(|_| Error::Transport(TransportError::InternalError))?,
                ),
            ),
            CipherSuite::Aes256GcmSha384 => HeaderProtector::Aes256(Box::new(
                aes::Aes256::new_from_slice(hp_key)
                    .map_err(|_| Error::Transport(TransportError::InternalError))?,
            )),
            CipherSuite::ChaCha20Poly1305Sha256 => {
                let mut key = [0u8; 32];
                key.copy_from_slice(hp_key);
                HeaderProtector::ChaCha20 { key }
            }
        };
        Ok(hp)
    }

    /// Compute the 5-byte mask from a 16-byte ciphertext sample.
    pub fn mask(&self, sample: &[u8]) -> Result<[u8; 5]> {
        if sample.len() < SAMPLE_LEN {
            return Err(Error::ShortBuffer);
        }
        let mut mask = [0u8; 5];
        match self {
            HeaderProtector::Aes128(cipher) => {
                let mut block = Block::clone_from_slice(&sample[..SAMPLE_LEN]);
                cipher.encrypt_block(&mut block);
                mask.copy_from_slice(&block[..5]);
            }
            HeaderProtector::Aes256(cipher) => {
                let mut block = Block::clone_from_slice(&sample[..SAMPLE_LEN]);
                cipher.encrypt_block(&mut block);
                mask.copy_from_slice(&block[..5]);
            }
            HeaderProtector::ChaCha20 { key } => {
                // sample[0..4] is the block counter (little-endian),
                // sample[4..16] the nonce.
                let counter = u32::from_le_bytes([sample[0], sample[1], sample[2], sample[3]]);
                let mut nonce = [0u8; 12];
                nonce.copy_from_slice(&sample[4..SAMPLE_LEN]);

                let mut cipher = ChaCha20::new(key.into(), (&nonce).into());
                cipher.seek(counter as u64 * 64);
                cipher.apply_keystream(&mut mask);
            }
        }
        Ok(mask)
    }
}
