//! Public-key cryptography for the overlay engine.
//!
//! An identity certificate commits to one of two curve suites: Curve25519
//! (X25519 key agreement, Ed25519 signatures) or NIST P-256 (ECDH key
//! agreement, ECDSA signatures).  The suite is fixed when a CA is created
//! and every certificate it signs uses the same suite.
//!
//! This module provides a tagged-variant view over both suites, so that the
//! certificate and handshake code can dispatch once per key rather than once
//! per operation.

use rand_core::CryptoRngCore;
use thiserror::Error;
use zeroize::Zeroizing;

/// Re-exports for Curve25519 key agreement.
pub mod curve25519 {
    pub use x25519_dalek::{PublicKey, SharedSecret, StaticSecret};
}

/// Re-exports for Ed25519 signatures.
pub mod ed25519 {
    pub use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
}

/// Length of an X25519 public key.
pub const X25519_PUBLIC_LEN: usize = 32;
/// Length of an uncompressed SEC1 P-256 public key.
pub const P256_PUBLIC_LEN: usize = 65;

/// A curve suite that a certificate (and therefore a tunnel) may use.
///
/// Deliberately exhaustive: the certificate format admits exactly these
/// two suites.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[allow(clippy::exhaustive_enums)]
pub enum Curve {
    /// X25519 key agreement with Ed25519 signatures.
    #[default]
    Curve25519,
    /// NIST P-256 ECDH key agreement with ECDSA signatures.
    P256,
}

impl Curve {
    /// Return the length in bytes of a public key on this curve, as
    /// it appears in a certificate.
    pub fn public_key_len(&self) -> usize {
        match self {
            Curve::Curve25519 => X25519_PUBLIC_LEN,
            Curve::P256 => P256_PUBLIC_LEN,
        }
    }
}

/// An error from a public-key operation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PkError {
    /// A public key had the wrong length or was off the curve.
    #[error("malformed public key for {0:?}")]
    BadPublicKey(Curve),
    /// A private key had the wrong length or was out of range.
    #[error("malformed private key for {0:?}")]
    BadPrivateKey(Curve),
    /// A signature was structurally invalid (not merely a mismatch).
    #[error("malformed signature for {0:?}")]
    BadSignature(Curve),
}

/// A Diffie-Hellman keypair: a tunnel endpoint's static or ephemeral key.
#[allow(clippy::exhaustive_enums)]
pub enum DhKeypair {
    /// An X25519 keypair.
    X25519 {
        /// The secret half.
        secret: curve25519::StaticSecret,
        /// The public half.
        public: curve25519::PublicKey,
    },
    /// A P-256 keypair used for ECDH.
    P256 {
        /// The secret half.
        secret: p256::NonZeroScalar,
        /// The public half.
        public: p256::PublicKey,
    },
}

impl DhKeypair {
    /// Generate a fresh keypair on `curve`.
    pub fn generate<R: CryptoRngCore>(curve: Curve, rng: &mut R) -> Self {
        match curve {
            Curve::Curve25519 => {
                let secret = curve25519::StaticSecret::random_from_rng(&mut *rng);
                let public = curve25519::PublicKey::from(&secret);
                DhKeypair::X25519 { secret, public }
            }
            Curve::P256 => {
                let secret = p256::NonZeroScalar::random(rng);
                let public = p256::PublicKey::from_secret_scalar(&secret);
                DhKeypair::P256 { secret, public }
            }
        }
    }

    /// Reconstruct a keypair from a stored private key.
    pub fn from_private_bytes(curve: Curve, bytes: &[u8]) -> Result<Self, PkError> {
        match curve {
            Curve::Curve25519 => {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| PkError::BadPrivateKey(curve))?;
                let secret = curve25519::StaticSecret::from(arr);
                let public = curve25519::PublicKey::from(&secret);
                Ok(DhKeypair::X25519 { secret, public })
            }
            Curve::P256 => {
                let secret = p256::NonZeroScalar::try_from(bytes)
                    .map_err(|_| PkError::BadPrivateKey(curve))?;
                let public = p256::PublicKey::from_secret_scalar(&secret);
                Ok(DhKeypair::P256 { secret, public })
            }
        }
    }

    /// Return the curve this keypair lives on.
    pub fn curve(&self) -> Curve {
        match self {
            DhKeypair::X25519 { .. } => Curve::Curve25519,
            DhKeypair::P256 { .. } => Curve::P256,
        }
    }

    /// Return the public key in its certificate encoding (raw 32 bytes for
    /// X25519; uncompressed SEC1 for P-256).
    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            DhKeypair::X25519 { public, .. } => public.as_bytes().to_vec(),
            DhKeypair::P256 { public, .. } => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                public.to_encoded_point(false).as_bytes().to_vec()
            }
        }
    }

    /// Return the private key bytes, for serialization to a key file.
    pub fn private_bytes(&self) -> Zeroizing<Vec<u8>> {
        match self {
            DhKeypair::X25519 { secret, .. } => Zeroizing::new(secret.as_bytes().to_vec()),
            DhKeypair::P256 { secret, .. } => Zeroizing::new(secret.to_bytes().to_vec()),
        }
    }

    /// Perform Diffie-Hellman with a peer's encoded public key, returning a
    /// 32-byte shared secret.
    ///
    /// For P-256 the shared secret is the X coordinate of the shared point,
    /// as is conventional for ECDH.
    pub fn dh(&self, peer_public: &[u8]) -> Result<Zeroizing<[u8; 32]>, PkError> {
        match self {
            DhKeypair::X25519 { secret, .. } => {
                let arr: [u8; 32] = peer_public
                    .try_into()
                    .map_err(|_| PkError::BadPublicKey(Curve::Curve25519))?;
                let theirs = curve25519::PublicKey::from(arr);
                let shared = secret.diffie_hellman(&theirs);
                Ok(Zeroizing::new(*shared.as_bytes()))
            }
            DhKeypair::P256 { secret, .. } => {
                let theirs = p256::PublicKey::from_sec1_bytes(peer_public)
                    .map_err(|_| PkError::BadPublicKey(Curve::P256))?;
                let shared = p256::ecdh::diffie_hellman(secret, theirs.as_affine());
                let mut out = Zeroizing::new([0_u8; 32]);
                out.copy_from_slice(shared.raw_secret_bytes());
                Ok(out)
            }
        }
    }
}

/// A signing keypair, as held by a certificate authority or by a node that
/// signs its own handshake transcript.
#[allow(clippy::exhaustive_enums)]
pub enum SigningKeypair {
    /// An Ed25519 signing key.
    Ed25519(ed25519::SigningKey),
    /// A P-256 ECDSA signing key.
    P256(p256::ecdsa::SigningKey),
}

impl SigningKeypair {
    /// Generate a fresh signing keypair on `curve`.
    pub fn generate<R: CryptoRngCore>(curve: Curve, rng: &mut R) -> Self {
        match curve {
            Curve::Curve25519 => SigningKeypair::Ed25519(ed25519::SigningKey::generate(rng)),
            Curve::P256 => SigningKeypair::P256(p256::ecdsa::SigningKey::random(rng)),
        }
    }

    /// Reconstruct a signing keypair from a stored private key.
    pub fn from_private_bytes(curve: Curve, bytes: &[u8]) -> Result<Self, PkError> {
        match curve {
            Curve::Curve25519 => {
                let arr: [u8; 32] = bytes
                    .try_into()
                    .map_err(|_| PkError::BadPrivateKey(curve))?;
                Ok(SigningKeypair::Ed25519(ed25519::SigningKey::from_bytes(
                    &arr,
                )))
            }
            Curve::P256 => p256::ecdsa::SigningKey::from_slice(bytes)
                .map(SigningKeypair::P256)
                .map_err(|_| PkError::BadPrivateKey(curve)),
        }
    }

    /// Return the curve this keypair signs on.
    pub fn curve(&self) -> Curve {
        match self {
            SigningKeypair::Ed25519(_) => Curve::Curve25519,
            SigningKeypair::P256(_) => Curve::P256,
        }
    }

    /// Return the public key in its certificate encoding.
    pub fn public_bytes(&self) -> Vec<u8> {
        match self {
            SigningKeypair::Ed25519(k) => k.verifying_key().as_bytes().to_vec(),
            SigningKeypair::P256(k) => {
                use p256::elliptic_curve::sec1::ToEncodedPoint;
                k.verifying_key().to_encoded_point(false).as_bytes().to_vec()
            }
        }
    }

    /// Return the private key bytes, for serialization to a key file.
    pub fn private_bytes(&self) -> Zeroizing<Vec<u8>> {
        match self {
            SigningKeypair::Ed25519(k) => Zeroizing::new(k.to_bytes().to_vec()),
            SigningKeypair::P256(k) => Zeroizing::new(k.to_bytes().to_vec()),
        }
    }

    /// Sign `message`, returning the detached signature encoding used in
    /// certificates (64 bytes for both suites).
    pub fn sign(&self, message: &[u8]) -> Vec<u8> {
        use ed25519::Signer as _;
        match self {
            SigningKeypair::Ed25519(k) => k.sign(message).to_bytes().to_vec(),
            SigningKeypair::P256(k) => {
                let sig: p256::ecdsa::Signature = k.sign(message);
                sig.to_bytes().to_vec()
            }
        }
    }
}

/// Check a detached signature over `message` against an encoded public key.
///
/// Returns `Ok(true)` for a valid signature, `Ok(false)` for a well-formed
/// but non-matching one, and an error when the key or signature cannot even
/// be decoded.
pub fn verify_signature(
    curve: Curve,
    public_key: &[u8],
    message: &[u8],
    signature: &[u8],
) -> Result<bool, PkError> {
    match curve {
        Curve::Curve25519 => {
            let arr: [u8; 32] = public_key
                .try_into()
                .map_err(|_| PkError::BadPublicKey(curve))?;
            let key = ed25519::VerifyingKey::from_bytes(&arr)
                .map_err(|_| PkError::BadPublicKey(curve))?;
            let sig_arr: [u8; 64] = signature
                .try_into()
                .map_err(|_| PkError::BadSignature(curve))?;
            let sig = ed25519::Signature::from_bytes(&sig_arr);
            use ed25519::Verifier as _;
            Ok(key.verify(message, &sig).is_ok())
        }
        Curve::P256 => {
            let key = p256::ecdsa::VerifyingKey::from_sec1_bytes(public_key)
                .map_err(|_| PkError::BadPublicKey(curve))?;
            let sig = p256::ecdsa::Signature::from_slice(signature)
                .map_err(|_| PkError::BadSignature(curve))?;
            use p256::ecdsa::signature::Verifier as _;
            Ok(key.verify(message, &sig).is_ok())
        }
    }
}

#[cfg(test)]
mod test {
    // @@ begin test lint list maintained by maint/add_warning @@
    #![allow(clippy::bool_assert_comparison)]
    #![allow(clippy::clone_on_copy)]
    #![allow(clippy::dbg_macro)]
    #![allow(clippy::mixed_attributes_style)]
    #![allow(clippy::print_stderr)]
    #![allow(clippy::print_stdout)]
    #![allow(clippy::single_char_pattern)]
    #![allow(clippy::unwrap_used)]
    #![allow(clippy::unchecked_duration_subtraction)]
    #![allow(clippy::useless_vec)]
    #![allow(clippy::needless_pass_by_value)]
    //! <!-- @@ end test lint list maintained by maint/add_warning @@ -->
    use super::*;

    #[test]
    fn dh_agreement_both_curves() {
        let mut rng = rand::thread_rng();
        for curve in [Curve::Curve25519, Curve::P256] {
            let a = DhKeypair::generate(curve, &mut rng);
            let b = DhKeypair::generate(curve, &mut rng);
            let s1 = a.dh(&b.public_bytes()).unwrap();
            let s2 = b.dh(&a.public_bytes()).unwrap();
            assert_eq!(*s1, *s2);
        }
    }

    #[test]
    fn dh_keypair_roundtrip() {
        let mut rng = rand::thread_rng();
        for curve in [Curve::Curve25519, Curve::P256] {
            let kp = DhKeypair::generate(curve, &mut rng);
            let restored = DhKeypair::from_private_bytes(curve, &kp.private_bytes()).unwrap();
            assert_eq!(kp.public_bytes(), restored.public_bytes());
            assert_eq!(kp.public_bytes().len(), curve.public_key_len());
        }
    }

    #[test]
    fn sign_and_verify_both_curves() {
        let mut rng = rand::thread_rng();
        for curve in [Curve::Curve25519, Curve::P256] {
            let kp = SigningKeypair::generate(curve, &mut rng);
            let msg = b"was not the sea itself a sky?";
            let sig = kp.sign(msg);
            assert!(verify_signature(curve, &kp.public_bytes(), msg, &sig).unwrap());
            assert!(!verify_signature(curve, &kp.public_bytes(), b"other", &sig).unwrap());
        }
    }

    #[test]
    fn bad_key_material_is_an_error() {
        assert!(matches!(
            verify_signature(Curve::Curve25519, &[0_u8; 7], b"m", &[0_u8; 64]),
            Err(PkError::BadPublicKey(_))
        ));
        assert!(matches!(
            DhKeypair::from_private_bytes(Curve::P256, &[0_u8; 3]),
            Err(PkError::BadPrivateKey(_))
        ));
    }
}
