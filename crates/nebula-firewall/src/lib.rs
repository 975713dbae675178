#![cfg_attr(docsrs, feature(doc_auto_cfg, doc_cfg))]
#![doc = include_str!("../README.md")]
// @@ begin lint list maintained by maint/add_warning @@
#![allow(renamed_and_removed_lints)] // @@REMOVE_WHEN(ci_stable)
#![allow(unknown_lints)] // @@REMOVE_WHEN(ci_nightly)
#![warn(missing_docs)]
#![warn(noop_method_call)]
#![warn(unreachable_pub)]
#![warn(clippy::all)]
#![deny(clippy::await_holding_lock)]
#![deny(clippy::cargo_common_metadata)]
#![deny(clippy::cast_lossless)]
#![deny(clippy::checked_conversions)]
#![warn(clippy::cognitive_complexity)]
#![deny(clippy::debug_assert_with_mut_call)]
#![deny(clippy::exhaustive_enums)]
#![deny(clippy::exhaustive_structs)]
#![deny(clippy::expl_impl_clone_on_copy)]
#![deny(clippy::fallible_impl_from)]
#![deny(clippy::implicit_clone)]
#![deny(clippy::large_stack_arrays)]
#![warn(clippy::manual_ok_or)]
#![deny(clippy::missing_docs_in_private_items)]
#![warn(clippy::needless_borrow)]
#![warn(clippy::needless_pass_by_value)]
#![warn(clippy::option_option)]
#![deny(clippy::print_stderr)]
#![deny(clippy::print_stdout)]
#![warn(clippy::rc_buffer)]
#![deny(clippy::ref_option_ref)]
#![warn(clippy::semicolon_if_nothing_returned)]
#![warn(clippy::trait_duplication_in_bounds)]
#![deny(clippy::unchecked_duration_subtraction)]
#![deny(clippy::unnecessary_wraps)]
#![warn(clippy::unseparated_literal_suffix)]
#![deny(clippy::unwrap_used)]
#![allow(clippy::let_unit_value)] // This can reasonably be done for explicitness
#![allow(clippy::uninlined_format_args)]
#![allow(clippy::significant_drop_in_scrutinee)]
#![allow(clippy::result_large_err)]
#![allow(clippy::needless_raw_string_hashes)] // complained-about code is fine, often best
//! <!-- @@ end lint list maintained by maint/add_warning @@ -->

mod conntrack;
mod err;
pub mod packet;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Instant;

use ipnet::Ipv4Net;
use tracing::{debug, info};

use nebula_cert::{CaPool, Certificate};

use conntrack::{Conntrack, TrackResult};
use packet::{PacketMeta, Protocol};

pub use conntrack::Timeouts;
pub use err::{Denied, DenyAction, ParseError};

/// How a rule matches the far end of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum PeerMatch {
    /// Any peer.
    #[default]
    Any,
    /// The peer certificate's name equals this.
    Host(String),
    /// The peer certificate carries this group.
    Group(String),
    /// The peer certificate carries all of these groups.
    Groups(Vec<String>),
    /// The packet's remote address falls in this network.
    Cidr(Ipv4Net),
}

/// How a rule matches the service port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[non_exhaustive]
pub enum PortMatch {
    /// Any port, fragments included.
    #[default]
    Any,
    /// Only non-first fragments (whose ports are unknowable).
    Fragment,
    /// An inclusive port range.
    Range(u16, u16),
}

/// A single firewall rule.  A packet is admitted by the first rule, in
/// registration order, whose every predicate holds.
#[derive(Debug, Clone, Default)]
pub struct Rule {
    /// Protocol; `None` matches any.
    proto: Option<Protocol>,
    /// Service port match.
    port: PortMatch,
    /// Peer match.
    peer: PeerMatch,
    /// Require the peer's signing CA to have this name.
    ca_name: Option<String>,
    /// Require the peer's signing CA to have this fingerprint (hex).
    ca_sha: Option<String>,
    /// Require the packet's local address to fall in this network;
    /// `None` matches any.
    local: Option<Ipv4Net>,
}

impl Rule {
    /// A rule matching everything; restrict it with the other methods.
    pub fn new() -> Self {
        Rule::default()
    }
    /// Restrict to one protocol.
    pub fn proto(mut self, proto: Protocol) -> Self {
        self.proto = Some(proto);
        self
    }
    /// Restrict to an inclusive port range.
    pub fn port_range(mut self, low: u16, high: u16) -> Self {
        self.port = PortMatch::Range(low, high);
        self
    }
    /// Restrict to a single port.
    pub fn port(self, p: u16) -> Self {
        self.port_range(p, p)
    }
    /// Match only non-first fragments.
    pub fn fragment(mut self) -> Self {
        self.port = PortMatch::Fragment;
        self
    }
    /// Restrict the peer.
    pub fn peer(mut self, peer: PeerMatch) -> Self {
        self.peer = peer;
        self
    }
    /// Require a signing CA name.
    pub fn ca_name(mut self, name: &str) -> Self {
        self.ca_name = Some(name.to_owned());
        self
    }
    /// Require a signing CA fingerprint.
    pub fn ca_sha(mut self, sha: &str) -> Self {
        self.ca_sha = Some(sha.to_owned());
        self
    }
    /// Restrict the local address.
    pub fn local_cidr(mut self, net: Ipv4Net) -> Self {
        self.local = Some(net);
        self
    }

    /// Evaluate this rule against a packet and the peer's certificate.
    fn matches(
        &self,
        packet: &PacketMeta,
        incoming: bool,
        cert: &Certificate,
        pool: &CaPool,
    ) -> bool {
        match self.port {
            PortMatch::Any => {}
            PortMatch::Fragment => {
                if !packet.fragment {
                    return false;
                }
            }
            PortMatch::Range(low, high) => {
                if packet.fragment {
                    return false;
                }
                // Inbound rules guard our service port; outbound rules
                // name the remote service being reached.
                let service_port = if incoming {
                    packet.local_port
                } else {
                    packet.remote_port
                };
                if service_port < low || service_port > high {
                    return false;
                }
            }
        }
        if let Some(proto) = self.proto {
            if packet.proto != proto {
                return false;
            }
        }
        if let Some(want) = &self.ca_sha {
            match cert.details().issuer() {
                Some(fp) if fp.to_hex() == *want => {}
                _ => return false,
            }
        }
        if let Some(want) = &self.ca_name {
            let issuer_name = cert
                .details()
                .issuer()
                .and_then(|fp| pool.ca(fp))
                .map(|ca| ca.details().name());
            if issuer_name != Some(want.as_str()) {
                return false;
            }
        }
        let peer_ok = match &self.peer {
            PeerMatch::Any => true,
            PeerMatch::Host(name) => cert.details().name() == name,
            PeerMatch::Group(g) => cert.details().groups().contains(g),
            PeerMatch::Groups(gs) => gs.iter().all(|g| cert.details().groups().contains(g)),
            PeerMatch::Cidr(net) => net.contains(&packet.remote_ip),
        };
        if !peer_ok {
            return false;
        }
        match &self.local {
            None => true,
            Some(net) => net.contains(&packet.local_ip),
        }
    }
}

/// An immutable rule set, swapped wholesale on reload.
#[derive(Debug, Clone, Default)]
pub struct Rules {
    /// Version stamp; assigned when the set is installed.
    version: u32,
    /// Rules for traffic arriving from the overlay.
    inbound: Vec<Rule>,
    /// Rules for traffic leaving through the overlay.
    outbound: Vec<Rule>,
    /// Disposition for refused inbound packets.
    inbound_action: DenyAction,
    /// Disposition for refused outbound packets.
    outbound_action: DenyAction,
}

impl Rules {
    /// Start building a rule set.
    pub fn builder() -> RulesBuilder {
        RulesBuilder {
            rules: Rules::default(),
            default_local: None,
        }
    }

    /// Walk the direction's rule list; first match wins.
    fn admits(
        &self,
        packet: &PacketMeta,
        incoming: bool,
        cert: &Certificate,
        pool: &CaPool,
    ) -> bool {
        let list = if incoming { &self.inbound } else { &self.outbound };
        list.iter().any(|r| r.matches(packet, incoming, cert, pool))
    }

    /// The deny action for the direction.
    fn action(&self, incoming: bool) -> DenyAction {
        if incoming {
            self.inbound_action
        } else {
            self.outbound_action
        }
    }
}

/// Builder for [`Rules`].
#[derive(Debug, Clone)]
pub struct RulesBuilder {
    /// The set under construction.
    rules: Rules,
    /// Default local restriction applied to rules that set none.
    default_local: Option<Ipv4Net>,
}

impl RulesBuilder {
    /// Set the local-CIDR default applied to rules without an explicit
    /// `local_cidr`.
    ///
    /// A node whose certificate carries subnets defaults this to its
    /// primary overlay address (unless configuration says local CIDRs
    /// default to any), so unsafe-route traffic needs explicit rules.
    pub fn default_local_cidr(mut self, net: Ipv4Net) -> Self {
        self.default_local = Some(net);
        self
    }
    /// Set the disposition for refused inbound packets.
    pub fn inbound_action(mut self, action: DenyAction) -> Self {
        self.rules.inbound_action = action;
        self
    }
    /// Set the disposition for refused outbound packets.
    pub fn outbound_action(mut self, action: DenyAction) -> Self {
        self.rules.outbound_action = action;
        self
    }
    /// Append an inbound rule.
    pub fn inbound(mut self, rule: Rule) -> Self {
        self.rules.inbound.push(self.apply_default(rule));
        self
    }
    /// Append an outbound rule.
    pub fn outbound(mut self, rule: Rule) -> Self {
        self.rules.outbound.push(self.apply_default(rule));
        self
    }
    /// Stamp the local default onto a rule that lacks one.
    fn apply_default(&self, mut rule: Rule) -> Rule {
        if rule.local.is_none() {
            rule.local = self.default_local;
        }
        rule
    }
    /// Finish building.
    pub fn build(self) -> Rules {
        self.rules
    }
}

/// The stateful firewall: current rules, live connection table, and
/// reloadable timeouts.
///
/// The conntrack lock is held only across a single flow lookup or insert;
/// rule evaluation runs under the rules read-lock with no await or I/O.
pub struct Firewall {
    /// The installed rule set.
    rules: RwLock<Arc<Rules>>,
    /// Tracked flows; survives rule reloads.
    conntrack: Mutex<Conntrack>,
    /// Per-protocol flow timeouts.
    timeouts: RwLock<Timeouts>,
    /// Packets refused, both directions.
    dropped: AtomicU64,
}

impl Firewall {
    /// Install an initial rule set.
    pub fn new(mut rules: Rules) -> Self {
        rules.version = 1;
        Firewall {
            rules: RwLock::new(Arc::new(rules)),
            conntrack: Mutex::new(Conntrack::default()),
            timeouts: RwLock::new(Timeouts::default()),
            dropped: AtomicU64::new(0),
        }
    }

    /// Replace the rule set, preserving tracked flows.
    ///
    /// Flows admitted under the old rules are lazily re-validated the next
    /// time a packet touches them.  If the version counter wraps to zero
    /// the whole table is flushed rather than risk a stale match.
    pub fn reload(&self, mut rules: Rules) {
        let mut slot = self.rules.write().expect("rules lock poisoned");
        let next = slot.version.wrapping_add(1);
        rules.version = next;
        if next == 0 {
            self.conntrack
                .lock()
                .expect("conntrack lock poisoned")
                .flush();
        }
        info!(version = next, "firewall rules reloaded");
        *slot = Arc::new(rules);
    }

    /// Replace the conntrack timeouts.
    pub fn set_timeouts(&self, timeouts: Timeouts) {
        *self.timeouts.write().expect("timeouts lock poisoned") = timeouts;
    }

    /// The installed rules version.
    pub fn rules_version(&self) -> u32 {
        self.rules.read().expect("rules lock poisoned").version
    }

    /// Number of tracked flows.
    pub fn flow_count(&self) -> usize {
        self.conntrack.lock().expect("conntrack lock poisoned").len()
    }

    /// Packets refused so far.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Judge one packet.  `cert` is the peer's (already verified)
    /// certificate; `pool` resolves CA-name rules.
    pub fn check(
        &self,
        packet: &PacketMeta,
        incoming: bool,
        cert: &Certificate,
        pool: &CaPool,
        now: Instant,
    ) -> Result<(), Denied> {
        let rules = Arc::clone(&self.rules.read().expect("rules lock poisoned"));
        let timeouts = *self.timeouts.read().expect("timeouts lock poisoned");
        let mut ct = self.conntrack.lock().expect("conntrack lock poisoned");

        match ct.lookup(packet, rules.version, &timeouts, now) {
            TrackResult::Pass => Ok(()),
            TrackResult::Stale {
                incoming: original_incoming,
            } => {
                // Re-validate the flow as it was established, whichever
                // direction this particular packet travels.
                if rules.admits(packet, original_incoming, cert, pool) {
                    ct.insert(packet, original_incoming, rules.version, &timeouts, now);
                    Ok(())
                } else {
                    // The reload withdrew this flow's rule: tear it down.
                    ct.remove(packet);
                    debug!(?packet, "tracked flow torn down by rule reload");
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(Denied {
                        action: rules.action(incoming),
                    })
                }
            }
            TrackResult::Miss => {
                if rules.admits(packet, incoming, cert, pool) {
                    ct.insert(packet, incoming, rules.version, &timeouts, now);
                    Ok(())
                } else {
                    self.dropped.fetch_add(1, Ordering::Relaxed);
                    Err(Denied {
                        action: rules.action(incoming),
                    })
                }
            }
        }
    }

    /// Remove the tracked flow for `packet`, if any.
    pub fn remove_flow(&self, packet: &PacketMeta) {
        self.conntrack
            .lock()
            .expect("conntrack lock poisoned")
            .remove(packet);
    }

    /// Sweep expired flows; returns how many were dropped.
    pub fn purge_expired(&self, now: Instant) -> usize {
        self.conntrack
            .lock()
            .expect("conntrack lock poisoned")
            .purge_expired(now)
    }
}
