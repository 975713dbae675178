//! Declare error types for nebula-firewall.

use thiserror::Error;

/// What to do with a packet no rule admits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum DenyAction {
    /// Discard silently.
    #[default]
    Drop,
    /// Discard, and signal refusal to the sender (TCP RST or ICMP
    /// unreachable, emitted by the caller).
    Reject,
}

/// A packet was refused.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[error("packet denied by firewall")]
#[non_exhaustive]
pub struct Denied {
    /// How the caller should dispose of the packet.
    pub action: DenyAction,
}

/// A frame could not even be parsed to a 5-tuple.
///
/// Per policy these are never propagated beyond the dispatch layer: the
/// packet is dropped and a counter incremented.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum ParseError {
    /// Too short for the headers it claimed.
    #[error("truncated IP packet")]
    Truncated,
    /// Not IPv4.
    #[error("unsupported IP version {0}")]
    BadVersion(u8),
    /// The IHL field was impossible.
    #[error("bad IP header length")]
    BadHeaderLength,
}
