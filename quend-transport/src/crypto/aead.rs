//! AEAD packet protection (RFC 9001 Section 5.3).
//!
//! In-place seal/open with a detached 16-byte tag. The nonce is the per-level
//! IV XORed with the left-padded packet number; building it is the key
//! schedule's job ([`super::key_schedule::LevelKeys::nonce`]).

use aes_gcm::aead::generic_array::GenericArray;
use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes128Gcm, Aes256Gcm};
use ccm::consts::{U12, U16};
use ccm::Ccm;
use chacha20poly1305::ChaCha20Poly1305;

use crate::crypto::suite::CipherSuite;
use crate::error::{Error, Result, TransportError};
use crate::types::TAG_LEN;

/// AES-128-CCM with a 16-byte tag and 12-byte nonce, as used by
/// TLS_AES_128_CCM_SHA256.
type Aes128Ccm = Ccm<aes::Aes128, U16, U12>;

/// A packet-protection AEAD bound to one key.
pub enum PacketAead {
    Aes128Gcm(Box<Aes128Gcm>),
    Aes256Gcm(Box<Aes256Gcm>),
    ChaCha20Poly1305(Box<ChaCha20Poly1305>),
    Aes128Ccm(Box<Aes128Ccm>),
}

impl PacketAead {
    /// Instantiate the AEAD for `suite` with `key`.
    pub fn new(suite: CipherSuite, key: &[u8]) -> Result<Self> {
        if key.len() != suite.key_len() {
            return Err(Error::Transport(TransportError::InternalError));
        }
        let aead = match suite {
            CipherSuite::Aes128GcmSha256 => PacketAead::Aes128Gcm(Box::new(
                Aes128Gcm::new_from_slice(key)
                    .map_err(|_| Error::Transport(TransportError::InternalError))?,
            )),
            CipherSuite::Aes256GcmSha384 => PacketAead::Aes256Gcm(Box::new(
                Aes256Gcm::new_from_slice(key)
                    .map_err(|_| Error::Transport(TransportError::InternalError))?,
            )),
            CipherSuite::ChaCha20Poly1305Sha256 => PacketAead::ChaCha20Poly1305(Box::new(
                ChaCha20Poly1305::new_from_slice(key)
                    .map_err(|_| Error::Transport(TransportError::InternalError))?,
            )),
            CipherSuite::Aes128CcmSha256 => PacketAead::Aes128Ccm(Box::new(
                Aes128Ccm::new_from_slice(key)
                    .map_err(|_| Error::Transport(TransportError::InternalError))?,
            )),
        };
        Ok(aead)
    }

    /// Encrypt `buf[..payload_len]` in place and append the 16-byte tag at
    /// `buf[payload_len..payload_len + TAG_LEN]`.
    ///
    /// Returns the ciphertext length including the tag.
    pub fn seal_in_place(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        buf: &mut [u8],
        payload_len: usize,
    ) -> Result<usize> {
        let total = payload_len + TAG_LEN;
        if buf.len() < total {
            return Err(Error::ShortBuffer);
        }
        let nonce = GenericArray::from_slice(nonce);
        let payload = &mut buf[..payload_len];

        let tag = match self {
            PacketAead::Aes128Gcm(c) => c
                .encrypt_in_place_detached(nonce, aad, payload)
                .map_err(|_| Error::Transport(TransportError::InternalError))?,
            PacketAead::Aes256Gcm(c) => c
                .encrypt_in_place_detached(nonce, aad, payload)
                .map_err(|_| Error::Transport(TransportError::InternalError))?,
            PacketAead::ChaCha20Poly1305(c) => c
                .encrypt_in_place_detached(nonce, aad, payload)
                .map_err(|_| Error::Transport(TransportError::InternalError))?,
            PacketAead::Aes128Ccm(c) => c
                .encrypt_in_place_detached(nonce, aad, payload)
                .map_err(|_| Error::Transport(TransportError::InternalError))?,
        };
        buf[payload_len..total].copy_from_slice(&tag);
        Ok(total)
    }

    /// Decrypt `buf[..ciphertext_len]` (payload followed by tag) in place.
    ///
    /// Returns the plaintext length, or [`Error::AeadAuthFailed`] if the tag
    /// does not verify.
    pub fn open_in_place(
        &self,
        nonce: &[u8; 12],
        aad: &[u8],
        buf: &mut [u8],
        ciphertext_len: usize,
    ) -> Result<usize> {
        if ciphertext_len < TAG_LEN || buf.len() < ciphertext_len {
            return Err(Error::ShortBuffer);
        }
        let plaintext_len = ciphertext_len - TAG_LEN;
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&buf[plaintext_len..ciphertext_len]);
        let tag = GenericArray::from_slice(&tag).to_owned();
        let nonce = GenericArray::from_slice(nonce);
        let payload = &mut buf[..plaintext_len];

        let opened = match self {
            PacketAead::Aes128Gcm(c) => c.decrypt_in_place_detached(nonce, aad, payload, &tag),
            PacketAead::Aes256Gcm(c) => c.decrypt_in_place_detached(nonce, aad, payload, &tag),
            PacketAead::ChaCha20Poly1305(c) => {
                c.decrypt_in_place_detached(nonce, aad, payload, &tag)
            }
            PacketAead::Aes128Ccm(c) => c.decrypt_in_place_detached(nonce, aad, payload, &tag),
        };
        opened.map_err(|_| Error::AeadAuthFailed)?;
        Ok(plaintext_len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(suite: CipherSuite) {
        let key = vec![0x42u8; suite.key_len()];
        let aead = PacketAead::new(suite, &key).unwrap();
        let nonce = [0x24u8; 12];
        let aad = b"packet header bytes";
        let plaintext = b"crypto frame payload";

        let mut buf = vec![0u8; 128];
        buf[..plaintext.len()].copy_from_slice(plaintext);

        let ct_len = aead
            .seal_in_place(&nonce, aad, &mut buf, plaintext.len())
            .unwrap();
        assert_eq!(ct_len, plaintext.len() + TAG_LEN);
        assert_ne!(&buf[..plaintext.len()], plaintext);

        let pt_len = aead.open_in_place(&nonce, aad, &mut buf, ct_len).unwrap();
        assert_eq!(pt_len, plaintext.len());
        assert_eq!(&buf[..pt_len], plaintext);
    }

    #[test]
    fn test_seal_open_aes128gcm() {
        roundtrip(CipherSuite::Aes128GcmSha256);
    }

    #[test]
    fn test_seal_open_aes256gcm() {
        roundtrip(CipherSuite::Aes256GcmSha384);
    }

    #[test]
    fn test_seal_open_chacha20poly1305() {
        roundtrip(CipherSuite::ChaCha20Poly1305Sha256);
    }

    #[test]
    fn test_seal_open_aes128ccm() {
        roundtrip(CipherSuite::Aes128CcmSha256);
    }

    #[test]
    fn test_open_rejects_tampered_ciphertext() {
        let aead = PacketAead::new(CipherSuite::Aes128GcmSha256, &[7u8; 16]).unwrap();
        let nonce = [0u8; 12];
        let mut buf = vec![0u8; 64];
        buf[..5].copy_from_slice(b"hello");
        let ct_len = aead.seal_in_place(&nonce, b"aad", &mut buf, 5).unwrap();

        buf[0] ^= 0xff;
        assert_eq!(
            aead.open_in_place(&nonce, b"aad", &mut buf, ct_len).unwrap_err(),
            Error::AeadAuthFailed
        );
    }

    #[test]
    fn test_open_rejects_wrong_aad() {
        let aead = PacketAead::new(CipherSuite::Aes128GcmSha256, &[7u8; 16]).unwrap();
        let nonce = [0u8; 12];
        let mut buf = vec![0u8; 64];
        let ct_len = aead.seal_in_place(&nonce, b"aad", &mut buf, 8).unwrap();
        assert_eq!(
            aead.open_in_place(&nonce, b"other", &mut buf, ct_len).unwrap_err(),
            Error::AeadAuthFailed
        );
    }

    #[test]
    fn test_wrong_key_length_rejected() {
        assert!(PacketAead::new(CipherSuite::Aes128GcmSha256, &[0u8; 32]).is_err());
        assert!(PacketAead::new(CipherSuite::Aes256GcmSha384, &[0u8; 16]).is_err());
    }

    #[test]
    fn test_open_too_short_for_tag() {
        let aead = PacketAead::new(CipherSuite::Aes128GcmSha256, &[7u8; 16]).unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(
            aead.open_in_place(&[0u8; 12], b"", &mut buf, 8).unwrap_err(),
            Error::ShortBuffer
        );
    }
}
