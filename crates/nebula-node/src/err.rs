//! Declare error types for nebula-node.

use thiserror::Error;

/// An error raised while validating or applying configuration.
///
/// Configuration errors are fatal at startup: the embedding binary should
/// exit with status 1.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum ConfigError {
    /// A value failed to parse.
    #[error("bad value for {key}: {problem}")]
    BadValue {
        /// The configuration key at fault.
        key: &'static str,
        /// What was wrong with it.
        problem: String,
    },
    /// The local certificate is missing a required property.
    #[error("unusable local certificate: {0}")]
    BadIdentity(String),
    /// A PKI object would not load.
    #[error("bad PKI material: {0}")]
    Pki(#[from] nebula_cert::CertificateError),
}

/// An error from a node-level operation.
#[derive(Error, Debug, Clone)]
#[non_exhaustive]
pub enum Error {
    /// The node is shutting down; the operation was not performed.
    #[error("node is closed")]
    Closed,
    /// No tunnel to the requested peer, and none could be started.
    #[error("no tunnel to {0}")]
    NoTunnel(std::net::Ipv4Addr),
    /// The peer's certificate failed verification.
    #[error("peer certificate rejected: {0}")]
    PeerCertificate(#[from] nebula_cert::CertificateError),
    /// The handshake failed cryptographically.
    #[error("handshake failed: {0}")]
    Handshake(#[from] nebula_proto::HandshakeError),
    /// A tunnel crypto operation failed.
    #[error("tunnel crypto: {0}")]
    Crypto(#[from] nebula_proto::CryptoError),
    /// The relay policy refused the request.
    #[error("relay refused: {0}")]
    RelayRefused(&'static str),
    /// An internal invariant did not hold.
    #[error("internal error: {0}")]
    Internal(&'static str),
}

impl<T> From<std::sync::PoisonError<T>> for Error {
    fn from(_: std::sync::PoisonError<T>) -> Error {
        Error::Internal("thread failed while holding lock")
    }
}

/// Why the embedding process should terminate, mapped to its exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum FatalKind {
    /// Unusable configuration: exit code 1.
    Config,
    /// The inside device or UDP socket failed while active: exit code 2.
    Io,
}

impl FatalKind {
    /// The process exit code this condition maps to.
    pub fn exit_code(&self) -> i32 {
        match self {
            FatalKind::Config => 1,
            FatalKind::Io => 2,
        }
    }
}
