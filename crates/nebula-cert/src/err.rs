//! Declare error types for nebula-cert.

use thiserror::Error;

/// An error arising when decoding or verifying a certificate.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum CertificateError {
    /// The certificate's validity window has passed.
    #[error("certificate is expired")]
    Expired,
    /// The certificate's validity window has not yet begun.
    #[error("certificate is not yet valid")]
    NotYetValid,
    /// The signing CA's validity window has passed.
    #[error("root certificate is expired")]
    RootExpired,
    /// The signing CA's validity window has not yet begun.
    #[error("root certificate is not yet valid")]
    RootNotYetValid,
    /// The signature did not verify under the signer's public key.
    #[error("certificate signature did not match")]
    InvalidSignature,
    /// A certificate added to the CA pool was not a CA certificate.
    #[error("certificate is not a CA")]
    NotCA,
    /// A CA certificate's signature was not made by its own key.
    #[error("certificate is not self-signed")]
    NotSelfSigned,
    /// The blob or banner declared a version we do not implement.
    #[error("certificate version is not supported")]
    UnsupportedVersion,
    /// The certificate's fingerprint appears in the configured blocklist.
    #[error("certificate is in the block list")]
    Blocklisted,
    /// A certificate claimed an address, subnet, or group its signing CA
    /// does not hold.
    #[error("certificate contained {field} outside the limitations of the signing ca: {entry}")]
    FieldOutsideCA {
        /// Which detail field overstepped: "an ip assignment", "a subnet
        /// assignment", or "a group assignment".
        field: &'static str,
        /// The offending CIDR or group, verbatim.
        entry: String,
    },
    /// No CA in the pool matches the certificate's issuer fingerprint.
    #[error("certificate signed by unknown authority")]
    UnknownIssuer,
    /// The protobuf blob would not parse.
    #[error("malformed certificate: {0}")]
    Decode(String),
    /// The embedded public key did not fit the declared curve.
    #[error("bad key material: {0}")]
    BadKeyMaterial(#[from] nebula_crypto::pk::PkError),
}

impl From<prost::DecodeError> for CertificateError {
    fn from(e: prost::DecodeError) -> Self {
        CertificateError::Decode(e.to_string())
    }
}

/// An error arising from PEM framing, key files, or encrypted keys.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum PemError {
    /// The input contained no PEM block at all.
    #[error("input contains no PEM banner")]
    MissingBanner,
    /// A block's banner was not one we recognize.
    #[error("unrecognized PEM banner {0:?}")]
    UnknownBanner(String),
    /// A block's BEGIN and END banners disagreed.
    #[error("mismatched PEM banners")]
    MismatchedBanner,
    /// The base64 body would not decode.
    #[error("invalid base64 in PEM body")]
    Base64,
    /// A key body had the wrong length for its banner.
    #[error("wrong key length for banner {0:?}")]
    BadKeyLength(String),
    /// An encrypted key would not decrypt with the given passphrase.
    #[error("invalid passphrase or corrupt private key")]
    BadPassphrase,
    /// An encrypted key record declared an algorithm we do not implement.
    #[error("unsupported key encryption algorithm {0:?}")]
    UnsupportedEncryption(String),
    /// The encrypted key's metadata would not parse.
    #[error("malformed encrypted key: {0}")]
    Decode(String),
    /// The key derivation parameters were rejected by the KDF.
    #[error("unusable key derivation parameters")]
    BadKdfParameters,
}

impl From<prost::DecodeError> for PemError {
    fn from(e: prost::DecodeError) -> Self {
        PemError::Decode(e.to_string())
    }
}
