//! Protobuf wire messages for certificate blobs and encrypted keys.
//!
//! A certificate blob is a `RawCertificate`: the encoded detail block as an
//! opaque byte field, plus the signature over exactly those bytes.  Keeping
//! the detail block opaque at this level means the bytes that were signed
//! are the bytes that get re-verified and fingerprinted, whatever a
//! re-encoder might have done with field ordering.

/// Outer certificate message: detail bytes plus signature.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RawCertificate {
    /// The encoded `RawCertificateDetails`, byte-for-byte as signed.
    #[prost(bytes = "vec", tag = "1")]
    pub(crate) details: Vec<u8>,
    /// Signature over `details` under the issuer's public key.
    #[prost(bytes = "vec", tag = "2")]
    pub(crate) signature: Vec<u8>,
}

/// The signed detail block of a certificate.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RawCertificateDetails {
    /// Human-meaningful node or CA name.
    #[prost(string, tag = "1")]
    pub(crate) name: String,
    /// Overlay networks as (address, mask) pairs of big-endian u32s.
    #[prost(uint32, repeated, tag = "2")]
    pub(crate) ips: Vec<u32>,
    /// Permitted subnets, same encoding as `ips`.
    #[prost(uint32, repeated, tag = "3")]
    pub(crate) subnets: Vec<u32>,
    /// Group memberships.
    #[prost(string, repeated, tag = "4")]
    pub(crate) groups: Vec<String>,
    /// Validity start, seconds since the Unix epoch.
    #[prost(int64, tag = "5")]
    pub(crate) not_before: i64,
    /// Validity end, seconds since the Unix epoch.
    #[prost(int64, tag = "6")]
    pub(crate) not_after: i64,
    /// The subject public key, encoded per curve.
    #[prost(bytes = "vec", tag = "7")]
    pub(crate) public_key: Vec<u8>,
    /// True for certificate-authority certificates.
    #[prost(bool, tag = "8")]
    pub(crate) is_ca: bool,
    /// SHA-256 fingerprint of the signing CA; empty when self-signed.
    #[prost(bytes = "vec", tag = "9")]
    pub(crate) issuer: Vec<u8>,
    /// Which curve suite the subject key uses.
    #[prost(enumeration = "RawCurve", tag = "100")]
    pub(crate) curve: i32,
}

/// Wire encoding of the curve suite.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, prost::Enumeration)]
#[repr(i32)]
pub(crate) enum RawCurve {
    /// X25519 agreement, Ed25519 signatures.
    Curve25519 = 0,
    /// P-256 ECDH agreement, ECDSA signatures.
    P256 = 1,
}

/// A passphrase-encrypted private key record.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RawEncryptedKey {
    /// How the ciphertext was produced.
    #[prost(message, optional, tag = "1")]
    pub(crate) metadata: Option<RawEncryptionMetadata>,
    /// Nonce-prefixed AEAD ciphertext of the raw private key.
    #[prost(bytes = "vec", tag = "2")]
    pub(crate) ciphertext: Vec<u8>,
}

/// Encryption algorithm and KDF parameters for an encrypted key.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RawEncryptionMetadata {
    /// Name of the AEAD; only "AES-256-GCM" is produced or accepted.
    #[prost(string, tag = "1")]
    pub(crate) algorithm: String,
    /// Argon2id parameters used to stretch the passphrase.
    #[prost(message, optional, tag = "2")]
    pub(crate) argon: Option<RawArgon2Parameters>,
}

/// Argon2id cost parameters, embedded so decryption needs no out-of-band
/// configuration.
#[derive(Clone, PartialEq, prost::Message)]
pub(crate) struct RawArgon2Parameters {
    /// Argon2 version; 19 (0x13) is current.
    #[prost(int32, tag = "1")]
    pub(crate) version: i32,
    /// Memory cost in KiB.
    #[prost(uint32, tag = "2")]
    pub(crate) memory: u32,
    /// Lane count.
    #[prost(uint32, tag = "3")]
    pub(crate) parallelism: u32,
    /// Pass count.
    #[prost(uint32, tag = "4")]
    pub(crate) iterations: u32,
    /// Random salt.
    #[prost(bytes = "vec", tag = "5")]
    pub(crate) salt: Vec<u8>,
}
