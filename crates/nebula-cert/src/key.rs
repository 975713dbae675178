//! PEM banners and encryption for private and public key files.
//!
//! Signing keys (for CAs) and Diffie-Hellman keys (for nodes) each get a
//! curve-specific banner.  A signing key may additionally be wrapped with a
//! passphrase: Argon2id stretches the passphrase into an AES-256-GCM key,
//! and the KDF parameters ride along in the record so decryption needs
//! nothing but the passphrase.

use aes_gcm::aead::{Aead, KeyInit, Payload};
use aes_gcm::Aes256Gcm;
use prost::Message;
use rand_core::CryptoRngCore;
use zeroize::Zeroizing;

use nebula_crypto::pk::{DhKeypair, SigningKeypair};
use nebula_crypto::Curve;

use crate::pem::{decode_block, encode_block};
use crate::proto;
use crate::PemError;

/// Banner for an Ed25519 CA signing key.
pub const ED25519_PRIVATE_BANNER: &str = "NEBULA ED25519 PRIVATE KEY";
/// Banner for a P-256 ECDSA CA signing key.
pub const ECDSA_P256_PRIVATE_BANNER: &str = "NEBULA ECDSA P256 PRIVATE KEY";
/// Banner for an X25519 node private key.
pub const X25519_PRIVATE_BANNER: &str = "NEBULA X25519 PRIVATE KEY";
/// Banner for a P-256 node private key.
pub const P256_PRIVATE_BANNER: &str = "NEBULA P256 PRIVATE KEY";
/// Banner for an X25519 node public key.
pub const X25519_PUBLIC_BANNER: &str = "NEBULA X25519 PUBLIC KEY";
/// Banner for a P-256 node public key.
pub const P256_PUBLIC_BANNER: &str = "NEBULA P256 PUBLIC KEY";
/// Banner for a passphrase-encrypted Ed25519 signing key.
pub const ED25519_ENCRYPTED_BANNER: &str = "NEBULA ED25519 ENCRYPTED PRIVATE KEY";

/// The only AEAD we produce or accept for encrypted keys.
const ENCRYPTION_ALGORITHM: &str = "AES-256-GCM";
/// AES-GCM nonce length; the nonce is prepended to the ciphertext.
const NONCE_LEN: usize = 12;

/// Argon2id cost parameters for wrapping a private key.
#[derive(Debug, Clone)]
#[allow(clippy::exhaustive_structs)]
pub struct Argon2Parameters {
    /// Memory cost in KiB.
    pub memory: u32,
    /// Lane count.
    pub parallelism: u32,
    /// Pass count.
    pub iterations: u32,
}

impl Default for Argon2Parameters {
    fn default() -> Self {
        // Matches the cost the reference tooling uses for new keys.
        Argon2Parameters {
            memory: 2 * 1024 * 1024,
            parallelism: 4,
            iterations: 1,
        }
    }
}

impl Argon2Parameters {
    /// Stretch `passphrase` into a 32-byte AEAD key.
    fn derive(&self, passphrase: &[u8], salt: &[u8]) -> Result<Zeroizing<[u8; 32]>, PemError> {
        let params = argon2::Params::new(self.memory, self.iterations, self.parallelism, Some(32))
            .map_err(|_| PemError::BadKdfParameters)?;
        let kdf = argon2::Argon2::new(argon2::Algorithm::Argon2id, argon2::Version::V0x13, params);
        let mut key = Zeroizing::new([0_u8; 32]);
        kdf.hash_password_into(passphrase, salt, &mut key[..])
            .map_err(|_| PemError::BadKdfParameters)?;
        Ok(key)
    }
}

/// Encode a CA signing key as PEM.
pub fn encode_signing_key(key: &SigningKeypair) -> String {
    match key {
        SigningKeypair::Ed25519(k) => {
            // The Ed25519 file format carries seed and public halves.
            encode_block(ED25519_PRIVATE_BANNER, &k.to_keypair_bytes())
        }
        SigningKeypair::P256(_) => {
            encode_block(ECDSA_P256_PRIVATE_BANNER, &key.private_bytes())
        }
    }
}

/// Decode a CA signing key from PEM.
pub fn decode_signing_key(input: &str) -> Result<SigningKeypair, PemError> {
    let (banner, data, _rest) = decode_block(input)?;
    match banner.as_str() {
        ED25519_PRIVATE_BANNER => {
            // Accept the 64-byte seed-plus-public form or a bare 32-byte seed.
            let seed: &[u8] = match data.len() {
                64 => &data[..32],
                32 => &data[..],
                _ => return Err(PemError::BadKeyLength(banner)),
            };
            SigningKeypair::from_private_bytes(Curve::Curve25519, seed)
                .map_err(|_| PemError::BadKeyLength(banner))
        }
        ECDSA_P256_PRIVATE_BANNER => SigningKeypair::from_private_bytes(Curve::P256, &data)
            .map_err(|_| PemError::BadKeyLength(banner)),
        _ => Err(PemError::UnknownBanner(banner)),
    }
}

/// Encode a node's Diffie-Hellman private key as PEM.
pub fn encode_dh_private(key: &DhKeypair) -> String {
    let banner = match key.curve() {
        Curve::Curve25519 => X25519_PRIVATE_BANNER,
        Curve::P256 => P256_PRIVATE_BANNER,
    };
    encode_block(banner, &key.private_bytes())
}

/// Decode a node's Diffie-Hellman private key from PEM.
pub fn decode_dh_private(input: &str) -> Result<DhKeypair, PemError> {
    let (banner, data, _rest) = decode_block(input)?;
    let curve = match banner.as_str() {
        X25519_PRIVATE_BANNER => Curve::Curve25519,
        P256_PRIVATE_BANNER => Curve::P256,
        _ => return Err(PemError::UnknownBanner(banner)),
    };
    DhKeypair::from_private_bytes(curve, &data).map_err(|_| PemError::BadKeyLength(banner))
}

/// Encode a node's public key as PEM.
pub fn encode_dh_public(curve: Curve, public: &[u8]) -> String {
    let banner = match curve {
        Curve::Curve25519 => X25519_PUBLIC_BANNER,
        Curve::P256 => P256_PUBLIC_BANNER,
    };
    encode_block(banner, public)
}

/// Decode a node's public key from PEM.
pub fn decode_dh_public(input: &str) -> Result<(Curve, Vec<u8>), PemError> {
    let (banner, data, _rest) = decode_block(input)?;
    let curve = match banner.as_str() {
        X25519_PUBLIC_BANNER => Curve::Curve25519,
        P256_PUBLIC_BANNER => Curve::P256,
        _ => return Err(PemError::UnknownBanner(banner)),
    };
    if data.len() != curve.public_key_len() {
        return Err(PemError::BadKeyLength(banner));
    }
    Ok((curve, data))
}

/// Encrypt an Ed25519 signing key under `passphrase` and encode it as PEM.
pub fn encode_encrypted_signing_key<R: CryptoRngCore>(
    key: &SigningKeypair,
    passphrase: &[u8],
    params: &Argon2Parameters,
    rng: &mut R,
) -> Result<String, PemError> {
    let SigningKeypair::Ed25519(k) = key else {
        // Only the Ed25519 banner exists; P-256 CA keys are stored unwrapped.
        return Err(PemError::UnsupportedEncryption("ECDSA P256".to_owned()));
    };
    let mut salt = [0_u8; 32];
    rng.fill_bytes(&mut salt);
    let aead_key = params.derive(passphrase, &salt)?;
    let cipher = Aes256Gcm::new_from_slice(&aead_key[..]).expect("AES-256-GCM key length is fixed");

    let mut nonce = [0_u8; NONCE_LEN];
    rng.fill_bytes(&mut nonce);
    let plaintext = Zeroizing::new(k.to_keypair_bytes());
    let sealed = cipher
        .encrypt(
            (&nonce).into(),
            Payload {
                msg: &plaintext[..],
                aad: &[],
            },
        )
        .expect("AEAD seal failed");

    let mut ciphertext = Vec::with_capacity(NONCE_LEN + sealed.len());
    ciphertext.extend_from_slice(&nonce);
    ciphertext.extend_from_slice(&sealed);

    let record = proto::RawEncryptedKey {
        metadata: Some(proto::RawEncryptionMetadata {
            algorithm: ENCRYPTION_ALGORITHM.to_owned(),
            argon: Some(proto::RawArgon2Parameters {
                version: 0x13,
                memory: params.memory,
                parallelism: params.parallelism,
                iterations: params.iterations,
                salt: salt.to_vec(),
            }),
        }),
        ciphertext,
    };
    Ok(encode_block(
        ED25519_ENCRYPTED_BANNER,
        &record.encode_to_vec(),
    ))
}

/// Decode and decrypt an encrypted Ed25519 signing key.
///
/// A wrong passphrase fails with [`PemError::BadPassphrase`].
pub fn decode_encrypted_signing_key(
    input: &str,
    passphrase: &[u8],
) -> Result<SigningKeypair, PemError> {
    let (banner, data, _rest) = decode_block(input)?;
    if banner != ED25519_ENCRYPTED_BANNER {
        return Err(PemError::UnknownBanner(banner));
    }
    let record = proto::RawEncryptedKey::decode(&data[..])?;
    let meta = record
        .metadata
        .ok_or_else(|| PemError::Decode("missing encryption metadata".to_owned()))?;
    if meta.algorithm != ENCRYPTION_ALGORITHM {
        return Err(PemError::UnsupportedEncryption(meta.algorithm));
    }
    let argon = meta
        .argon
        .ok_or_else(|| PemError::Decode("missing KDF parameters".to_owned()))?;
    if argon.version != 0x13 {
        return Err(PemError::BadKdfParameters);
    }
    let params = Argon2Parameters {
        memory: argon.memory,
        parallelism: argon.parallelism,
        iterations: argon.iterations,
    };
    let aead_key = params.derive(passphrase, &argon.salt)?;
    let cipher = Aes256Gcm::new_from_slice(&aead_key[..]).expect("AES-256-GCM key length is fixed");

    if record.ciphertext.len() < NONCE_LEN {
        return Err(PemError::Decode("short ciphertext".to_owned()));
    }
    let (nonce, sealed) = record.ciphertext.split_at(NONCE_LEN);
    let nonce_arr: [u8; NONCE_LEN] = nonce.try_into().expect("length checked above");
    let plaintext = cipher
        .decrypt(
            (&nonce_arr).into(),
            Payload {
                msg: sealed,
                aad: &[],
            },
        )
        .map_err(|_| PemError::BadPassphrase)?;
    let plaintext = Zeroizing::new(plaintext);
    let seed: &[u8] = match plaintext.len() {
        64 => &plaintext[..32],
        32 => &plaintext[..],
        _ => return Err(PemError::BadKeyLength(ED25519_ENCRYPTED_BANNER.to_owned())),
    };
    SigningKeypair::from_private_bytes(Curve::Curve25519, seed)
        .map_err(|_| PemError::BadKeyLength(ED25519_ENCRYPTED_BANNER.to_owned()))
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

    /// Cheap KDF costs so the tests stay fast.
    fn test_params() -> Argon2Parameters {
        Argon2Parameters {
            memory: 8,
            parallelism: 1,
            iterations: 1,
        }
    }

    #[test]
    fn signing_key_roundtrip_both_curves() {
        let mut rng = rand::thread_rng();
        for curve in [Curve::Curve25519, Curve::P256] {
            let key = SigningKeypair::generate(curve, &mut rng);
            let pem = encode_signing_key(&key);
            let back = decode_signing_key(&pem).unwrap();
            assert_eq!(key.public_bytes(), back.public_bytes());
        }
    }

    #[test]
    fn dh_key_roundtrip_both_curves() {
        let mut rng = rand::thread_rng();
        for curve in [Curve::Curve25519, Curve::P256] {
            let key = DhKeypair::generate(curve, &mut rng);
            let pem = encode_dh_private(&key);
            let back = decode_dh_private(&pem).unwrap();
            assert_eq!(key.public_bytes(), back.public_bytes());

            let pub_pem = encode_dh_public(curve, &key.public_bytes());
            let (c2, pub_back) = decode_dh_public(&pub_pem).unwrap();
            assert_eq!(c2, curve);
            assert_eq!(pub_back, key.public_bytes());
        }
    }

    #[test]
    fn encrypted_key_roundtrip() {
        let mut rng = rand::thread_rng();
        let key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let pem =
            encode_encrypted_signing_key(&key, b"hunter2", &test_params(), &mut rng).unwrap();
        assert!(pem.contains("NEBULA ED25519 ENCRYPTED PRIVATE KEY"));
        let back = decode_encrypted_signing_key(&pem, b"hunter2").unwrap();
        assert_eq!(key.public_bytes(), back.public_bytes());
    }

    #[test]
    fn wrong_passphrase_is_a_dedicated_error() {
        let mut rng = rand::thread_rng();
        let key = SigningKeypair::generate(Curve::Curve25519, &mut rng);
        let pem =
            encode_encrypted_signing_key(&key, b"hunter2", &test_params(), &mut rng).unwrap();
        assert!(matches!(
            decode_encrypted_signing_key(&pem, b"*******"),
            Err(PemError::BadPassphrase)
        ));
    }

    #[test]
    fn wrong_banner_is_rejected() {
        let mut rng = rand::thread_rng();
        let key = DhKeypair::generate(Curve::Curve25519, &mut rng);
        let pem = encode_dh_private(&key);
        assert!(matches!(
            decode_signing_key(&pem),
            Err(PemError::UnknownBanner(_))
        ));
    }
}
