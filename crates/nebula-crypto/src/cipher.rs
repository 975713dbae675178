//! AEAD ciphers used for tunnel traffic.
//!
//! A network runs exactly one of two ciphers, fixed in configuration:
//! AES-128-GCM or ChaCha20-Poly1305.  Both use a 12-byte nonce whose low
//! eight bytes are a little-endian message counter, and both produce a
//! 16-byte authentication tag.  The cipher for a tunnel never changes;
//! re-keying means running a new handshake.

use aes_gcm::Aes128Gcm;
use chacha20poly1305::ChaCha20Poly1305;
use thiserror::Error;

use aes_gcm::aead::{Aead, KeyInit, Payload};

/// Length of the authentication tag appended to every sealed message.
pub const TAG_LEN: usize = 16;

/// Length of the derived secret each direction of a tunnel receives.
pub const SECRET_LEN: usize = 32;

/// Message authentication failed while opening a sealed payload.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("packet failed authentication")]
#[non_exhaustive]
pub struct AuthFail;

/// Which AEAD cipher a network runs.
///
/// Deliberately exhaustive: the wire protocol admits exactly these two.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[allow(clippy::exhaustive_enums)]
pub enum CipherKind {
    /// AES-128-GCM.
    #[default]
    AesGcm,
    /// ChaCha20-Poly1305.
    ChaChaPoly,
}

impl std::str::FromStr for CipherKind {
    type Err = UnknownCipher;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aes" => Ok(CipherKind::AesGcm),
            "chachapoly" => Ok(CipherKind::ChaChaPoly),
            _ => Err(UnknownCipher(s.to_owned())),
        }
    }
}

/// An unrecognized cipher name in configuration.
#[derive(Error, Debug, Clone)]
#[error("unknown cipher {0:?}; expected \"aes\" or \"chachapoly\"")]
#[non_exhaustive]
pub struct UnknownCipher(pub String);

/// One direction's AEAD state: a key, instantiated for the network cipher.
///
/// AES-128-GCM consumes the first 16 bytes of the 32-byte derived secret;
/// ChaCha20-Poly1305 consumes all 32.
#[allow(clippy::exhaustive_enums)]
pub enum AeadCipher {
    /// An AES-128-GCM key.
    AesGcm(Box<Aes128Gcm>),
    /// A ChaCha20-Poly1305 key.
    ChaChaPoly(Box<ChaCha20Poly1305>),
}

impl AeadCipher {
    /// Instantiate the cipher `kind` from a 32-byte derived secret.
    pub fn new(kind: CipherKind, secret: &[u8; SECRET_LEN]) -> Self {
        match kind {
            CipherKind::AesGcm => {
                let key = Aes128Gcm::new_from_slice(&secret[..16])
                    .expect("AES-128-GCM key length is fixed");
                AeadCipher::AesGcm(Box::new(key))
            }
            CipherKind::ChaChaPoly => {
                let key = ChaCha20Poly1305::new_from_slice(&secret[..])
                    .expect("ChaCha20-Poly1305 key length is fixed");
                AeadCipher::ChaChaPoly(Box::new(key))
            }
        }
    }

    /// Return which cipher this key instantiates.
    pub fn kind(&self) -> CipherKind {
        match self {
            AeadCipher::AesGcm(_) => CipherKind::AesGcm,
            AeadCipher::ChaChaPoly(_) => CipherKind::ChaChaPoly,
        }
    }

    /// Build the 12-byte nonce for `counter`: four zero bytes, then the
    /// counter in little-endian order.
    fn nonce(counter: u64) -> [u8; 12] {
        let mut n = [0_u8; 12];
        n[4..].copy_from_slice(&counter.to_le_bytes());
        n
    }

    /// Seal `plaintext` under `counter`, authenticating `aad` alongside it.
    ///
    /// Returns ciphertext with the 16-byte tag appended.  The caller is
    /// responsible for never reusing a counter with the same key.
    pub fn seal(&self, counter: u64, aad: &[u8], plaintext: &[u8]) -> Vec<u8> {
        let nonce = Self::nonce(counter);
        let payload = Payload {
            msg: plaintext,
            aad,
        };
        let sealed = match self {
            AeadCipher::AesGcm(k) => k.encrypt((&nonce).into(), payload),
            AeadCipher::ChaChaPoly(k) => k.encrypt((&nonce).into(), payload),
        };
        // The AEAD API only fails on overlong plaintexts, far beyond any MTU.
        sealed.expect("AEAD seal failed")
    }

    /// Open `sealed` (ciphertext plus tag) under `counter` and `aad`.
    pub fn open(&self, counter: u64, aad: &[u8], sealed: &[u8]) -> Result<Vec<u8>, AuthFail> {
        let nonce = Self::nonce(counter);
        let payload = Payload { msg: sealed, aad };
        let opened = match self {
            AeadCipher::AesGcm(k) => k.decrypt((&nonce).into(), payload),
            AeadCipher::ChaChaPoly(k) => k.decrypt((&nonce).into(), payload),
        };
        opened.map_err(|_| AuthFail)
    }
}
