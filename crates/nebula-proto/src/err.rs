//! Declare error types for nebula-proto.

use thiserror::Error;

/// An error from the encryption or replay machinery of an established
/// tunnel.
///
/// These are per-packet errors: the packet is dropped and counted, and the
/// tunnel stays up until policy decides otherwise.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum CryptoError {
    /// AEAD authentication failed.
    #[error("packet failed authentication")]
    AuthFail,
    /// The counter was already seen, or fell behind the replay window.
    #[error("packet counter replayed or too old")]
    ReplayOrTooOld,
    /// The send counter is about to wrap; the tunnel must re-key first.
    #[error("tunnel send counter exhausted")]
    CounterExhausted,
}

impl From<nebula_crypto::AuthFail> for CryptoError {
    fn from(_: nebula_crypto::AuthFail) -> Self {
        CryptoError::AuthFail
    }
}

/// An error classifying or parsing a packet before any tunnel state is
/// consulted.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ProtocolError {
    /// The packet was shorter than its fixed header, or a field ran off
    /// the end.
    #[error("packet too short")]
    ShortPacket,
    /// The header declared a version we do not speak.
    #[error("unrecognized wire version {0}")]
    UnknownVersion(u8),
    /// The header declared a type we do not recognize.
    #[error("unrecognized packet type {0}")]
    UnknownType(u8),
    /// The packet referenced a tunnel index we do not hold.
    #[error("unknown tunnel index {0}")]
    UnknownIndex(u32),
    /// Trailing bytes after a complete structure.
    #[error("extraneous bytes at end of packet")]
    ExtraneousBytes,
}

/// An error produced while running the tunnel handshake.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum HandshakeError {
    /// A handshake message was too short or structurally invalid.
    #[error("malformed handshake message")]
    Malformed,
    /// An encrypted handshake element failed authentication.
    #[error("handshake message failed authentication")]
    AuthFail,
    /// A Diffie-Hellman operation was given unusable key material.
    #[error("bad handshake key material: {0}")]
    BadKeyMaterial(#[from] nebula_crypto::pk::PkError),
    /// The embedded payload would not parse.
    #[error("malformed handshake payload: {0}")]
    Payload(String),
}

impl From<prost::DecodeError> for HandshakeError {
    fn from(e: prost::DecodeError) -> Self {
        HandshakeError::Payload(e.to_string())
    }
}
