//! HKDF-Extract and HKDF-Expand-Label (RFC 5869, RFC 8446 Section 7.1).
//!
//! QUIC reuses the TLS 1.3 label convention: the label string is prefixed
//! with `"tls13 "` and wrapped in the HkdfLabel structure with an empty
//! context.

use hkdf::Hkdf;
use sha2::{Sha256, Sha384};

use crate::crypto::suite::Md;
use crate::error::{Error, Result, TransportError};

/// HKDF-Extract: `prk = HMAC-Hash(salt, ikm)`.
pub fn extract(md: Md, salt: &[u8], ikm: &[u8]) -> Vec<u8> {
    match md {
        Md::Sha256 => {
            let (prk, _) = Hkdf::<Sha256>::extract(Some(salt), ikm);
            prk.to_vec()
        }
        Md::Sha384 => {
            let (prk, _) = Hkdf::<Sha384>::extract(Some(salt), ikm);
            prk.to_vec()
        }
    }
}

/// HKDF-Expand-Label with the `"tls13 "` prefix and an empty context.
pub fn expand_label(md: Md, secret: &[u8], label: &str, out_len: usize) -> Result<Vec<u8>> {
    let info = hkdf_label(label, out_len);
    let mut okm = vec![0u8; out_len];

    let ok = match md {
        Md::Sha256 => match Hkdf::<Sha256>::from_prk(secret) {
            Ok(hk) => hk.expand(&info, &mut okm).is_ok(),
            Err(_) => false,
        },
        Md::Sha384 => match Hkdf::<Sha384>::from_prk(secret) {
            Ok(hk) => hk.expand(&info, &mut okm).is_ok(),
            Err(_) => false,
        },
    };

    if !ok {
        return Err(Error::Transport(TransportError::InternalError));
    }
    Ok(okm)
}

/// Build the HkdfLabel structure:
/// `u16 out_len | u8 label_len | "tls13 " label | u8 context_len (0)`.
fn hkdf_label(label: &str, out_len: usize) -> Vec<u8> {
    const PREFIX: &[u8] = b"tls13 ";
    let mut info = Vec::with_capacity(4 + PREFIX.len() + label.len());
    info.extend_from_slice(&(out_len as u16).to_be_bytes());
    info.push((PREFIX.len() + label.len()) as u8);
    info.extend_from_slice(PREFIX);
    info.extend_from_slice(label.as_bytes());
    info.push(0);
    info
}
