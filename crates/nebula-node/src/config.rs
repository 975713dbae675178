//! Configuration consumed by the engine.
//!
//! Only the keys the core acts on are modeled here; the embedding binary
//! owns file loading, merging, and everything device- or socket-shaped.
//! Every field has a default, so an empty document is a valid (if
//! firewall-closed) configuration.

use std::net::Ipv4Addr;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use nebula_crypto::CipherKind;
use nebula_firewall::packet::Protocol;
use nebula_firewall::{DenyAction, PeerMatch, Rule, Timeouts};

use crate::err::ConfigError;

/// Top-level engine configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct NodeConfig {
    /// Which AEAD the network runs; must agree across every node.
    #[serde(default, deserialize_with = "de_cipher")]
    pub cipher: CipherKind,
    /// Firewall rules and conntrack tuning.
    #[serde(default)]
    pub firewall: FirewallConfig,
    /// Handshake pacing and buffering.
    #[serde(default)]
    pub handshakes: HandshakeConfig,
    /// Established-tunnel maintenance.
    #[serde(default)]
    pub tunnels: TunnelConfig,
    /// PKI toggles that the engine (not the loader) consumes.
    #[serde(default)]
    pub pki: PkiConfig,
    /// Listener-adjacent behavior the engine owns.
    #[serde(default)]
    pub listen: ListenConfig,
    /// Symmetric worker thread count.
    #[serde(default = "default_routines")]
    pub routines: u32,
    /// Relay participation.
    #[serde(default)]
    pub relay: RelayConfig,
}

/// Default for `routines`.
fn default_routines() -> u32 {
    1
}

impl Default for NodeConfig {
    fn default() -> Self {
        NodeConfig {
            cipher: CipherKind::default(),
            firewall: FirewallConfig::default(),
            handshakes: HandshakeConfig::default(),
            tunnels: TunnelConfig::default(),
            pki: PkiConfig::default(),
            listen: ListenConfig::default(),
            routines: default_routines(),
            relay: RelayConfig::default(),
        }
    }
}

/// Deserialize a cipher name.
fn de_cipher<'de, D>(d: D) -> Result<CipherKind, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    CipherKind::from_str(&s).map_err(serde::de::Error::custom)
}

/// `firewall.*`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct FirewallConfig {
    /// Conntrack timeouts.
    #[serde(default)]
    pub conntrack: ConntrackConfig,
    /// Disposition for refused inbound packets.
    #[serde(default, deserialize_with = "de_action")]
    pub inbound_action: DenyAction,
    /// Disposition for refused outbound packets.
    #[serde(default, deserialize_with = "de_action")]
    pub outbound_action: DenyAction,
    /// When false and the local certificate carries subnets, rules without
    /// an explicit `local_cidr` match only the node's own address.
    #[serde(default)]
    pub default_local_cidr_any: bool,
    /// Inbound rules, evaluated in order.
    #[serde(default)]
    pub inbound: Vec<RuleConfig>,
    /// Outbound rules, evaluated in order.
    #[serde(default)]
    pub outbound: Vec<RuleConfig>,
}

/// `firewall.conntrack.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct ConntrackConfig {
    /// Idle timeout for TCP flows.
    #[serde(with = "humantime_serde", default = "default_tcp_timeout")]
    pub tcp_timeout: Duration,
    /// Idle timeout for UDP flows.
    #[serde(with = "humantime_serde", default = "default_udp_timeout")]
    pub udp_timeout: Duration,
    /// Idle timeout for other protocols.
    #[serde(with = "humantime_serde", default = "default_default_timeout")]
    pub default_timeout: Duration,
}

/// Default TCP conntrack timeout.
fn default_tcp_timeout() -> Duration {
    Duration::from_secs(12 * 60)
}
/// Default UDP conntrack timeout.
fn default_udp_timeout() -> Duration {
    Duration::from_secs(3 * 60)
}
/// Default conntrack timeout for other protocols.
fn default_default_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for ConntrackConfig {
    fn default() -> Self {
        ConntrackConfig {
            tcp_timeout: default_tcp_timeout(),
            udp_timeout: default_udp_timeout(),
            default_timeout: default_default_timeout(),
        }
    }
}

impl ConntrackConfig {
    /// Convert to the firewall's timeout set.
    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            tcp: self.tcp_timeout,
            udp: self.udp_timeout,
            default: self.default_timeout,
        }
    }
}

/// Deserialize a deny action name.
fn de_action<'de, D>(d: D) -> Result<DenyAction, D::Error>
where
    D: serde::Deserializer<'de>,
{
    let s = String::deserialize(d)?;
    match s.as_str() {
        "drop" => Ok(DenyAction::Drop),
        "reject" => Ok(DenyAction::Reject),
        other => Err(serde::de::Error::custom(format!(
            "unknown action {other:?}; expected \"drop\" or \"reject\""
        ))),
    }
}

/// One rule as written in configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct RuleConfig {
    /// Port: `any`, `fragment`, a number, or `low-high`.
    #[serde(default)]
    pub port: Option<String>,
    /// Protocol: `any`, `tcp`, `udp`, `icmp`, or a number.
    #[serde(default)]
    pub proto: Option<String>,
    /// Peer certificate name to match.
    #[serde(default)]
    pub host: Option<String>,
    /// Single group the peer must carry.
    #[serde(default)]
    pub group: Option<String>,
    /// Groups the peer must all carry.
    #[serde(default)]
    pub groups: Option<Vec<String>>,
    /// Remote-address network to match.
    #[serde(default)]
    pub cidr: Option<ipnet::Ipv4Net>,
    /// Name the peer's signing CA must have.
    #[serde(default)]
    pub ca_name: Option<String>,
    /// Fingerprint the peer's signing CA must have.
    #[serde(default)]
    pub ca_sha: Option<String>,
    /// Local-address network to match.
    #[serde(default)]
    pub local_cidr: Option<ipnet::Ipv4Net>,
}

impl RuleConfig {
    /// Compile to a firewall rule.
    pub fn compile(&self, key: &'static str) -> Result<Rule, ConfigError> {
        let mut rule = Rule::new();
        match self.port.as_deref() {
            None | Some("any") => {}
            Some("fragment") => rule = rule.fragment(),
            Some(spec) => {
                let (low, high) = match spec.split_once('-') {
                    Some((a, b)) => (parse_port(key, a)?, parse_port(key, b)?),
                    None => {
                        let p = parse_port(key, spec)?;
                        (p, p)
                    }
                };
                rule = rule.port_range(low, high);
            }
        }
        match self.proto.as_deref() {
            None | Some("any") => {}
            Some("tcp") => rule = rule.proto(Protocol::Tcp),
            Some("udp") => rule = rule.proto(Protocol::Udp),
            Some("icmp") => rule = rule.proto(Protocol::Icmp),
            Some(n) => {
                let num: u8 = n.parse().map_err(|_| ConfigError::BadValue {
                    key,
                    problem: format!("unknown protocol {n:?}"),
                })?;
                rule = rule.proto(Protocol::from_number(num));
            }
        }
        let peer_selectors = usize::from(self.host.is_some())
            + usize::from(self.group.is_some())
            + usize::from(self.groups.is_some())
            + usize::from(self.cidr.is_some());
        if peer_selectors > 1 {
            return Err(ConfigError::BadValue {
                key,
                problem: "only one of host, group, groups, cidr may be set".to_owned(),
            });
        }
        if let Some(host) = &self.host {
            if host != "any" {
                rule = rule.peer(PeerMatch::Host(host.clone()));
            }
        } else if let Some(group) = &self.group {
            rule = rule.peer(PeerMatch::Group(group.clone()));
        } else if let Some(groups) = &self.groups {
            rule = rule.peer(PeerMatch::Groups(groups.clone()));
        } else if let Some(cidr) = self.cidr {
            rule = rule.peer(PeerMatch::Cidr(cidr));
        }
        if let Some(name) = &self.ca_name {
            rule = rule.ca_name(name);
        }
        if let Some(sha) = &self.ca_sha {
            rule = rule.ca_sha(sha);
        }
        if let Some(local) = self.local_cidr {
            rule = rule.local_cidr(local);
        }
        Ok(rule)
    }
}

/// Parse one port number.
fn parse_port(key: &'static str, s: &str) -> Result<u16, ConfigError> {
    s.trim().parse().map_err(|_| ConfigError::BadValue {
        key,
        problem: format!("bad port {s:?}"),
    })
}

/// `handshakes.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct HandshakeConfig {
    /// Gap between handshake retransmissions (multiplied by the attempt
    /// number, so the schedule is linear).
    #[serde(with = "humantime_serde", default = "default_try_interval")]
    pub try_interval: Duration,
    /// Total transmission attempts before giving up.
    #[serde(default = "default_retries")]
    pub retries: u32,
    /// Capacity of the lighthouse query channel.
    #[serde(default = "default_buffer")]
    pub query_buffer: usize,
    /// Capacity of the handshake trigger channel.
    #[serde(default = "default_buffer")]
    pub trigger_buffer: usize,
}

/// Default handshake retransmission interval.
fn default_try_interval() -> Duration {
    Duration::from_millis(100)
}
/// Default handshake attempt count.
fn default_retries() -> u32 {
    10
}
/// Default trigger/query channel capacity.
fn default_buffer() -> usize {
    64
}

impl Default for HandshakeConfig {
    fn default() -> Self {
        HandshakeConfig {
            try_interval: default_try_interval(),
            retries: default_retries(),
            query_buffer: default_buffer(),
            trigger_buffer: default_buffer(),
        }
    }
}

/// `tunnels.*`.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct TunnelConfig {
    /// Reap tunnels that carry no traffic in either direction.
    #[serde(default)]
    pub drop_inactive: bool,
    /// How long "no traffic" must last before reaping.
    #[serde(with = "humantime_serde", default = "default_inactivity_timeout")]
    pub inactivity_timeout: Duration,
}

/// Default tunnel inactivity timeout.
fn default_inactivity_timeout() -> Duration {
    Duration::from_secs(10 * 60)
}

impl Default for TunnelConfig {
    fn default() -> Self {
        TunnelConfig {
            drop_inactive: false,
            inactivity_timeout: default_inactivity_timeout(),
        }
    }
}

/// `pki.*` toggles the engine consumes.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct PkiConfig {
    /// Evict tunnels whose peer certificate has expired.
    #[serde(default)]
    pub disconnect_invalid: bool,
    /// Fingerprints (hex) of certificates to refuse outright.
    #[serde(default)]
    pub blocklist: Vec<String>,
}

/// `listen.*` behavior the engine owns.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct ListenConfig {
    /// When to answer an unknown tunnel index with `RecvError`.
    #[serde(default)]
    pub send_recv_error: RecvErrorPolicy,
}

/// Policy for `RecvError` replies.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
#[non_exhaustive]
pub enum RecvErrorPolicy {
    /// Reply to anyone.
    Always,
    /// Never reply.
    Never,
    /// Reply only to private (RFC 1918) sources.
    #[default]
    Private,
}

impl RecvErrorPolicy {
    /// Should we answer a packet from `src`?
    pub fn permits(&self, src: std::net::SocketAddr) -> bool {
        match self {
            RecvErrorPolicy::Always => true,
            RecvErrorPolicy::Never => false,
            RecvErrorPolicy::Private => match src.ip() {
                std::net::IpAddr::V4(ip) => ip.is_private() || ip.is_loopback(),
                std::net::IpAddr::V6(ip) => ip.is_loopback() || (ip.segments()[0] & 0xfe00) == 0xfc00,
            },
        }
    }
}

/// `relay.*`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields)]
#[non_exhaustive]
pub struct RelayConfig {
    /// Whether this node forwards for others.
    #[serde(default)]
    pub am_relay: bool,
    /// Whether this node may route its own traffic through relays.
    #[serde(default)]
    pub use_relays: bool,
    /// Overlay addresses of relays this node may use.
    #[serde(default)]
    pub relays: Vec<Ipv4Addr>,
}
