//! Connection tracking: flows an admitted packet establishes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use crate::packet::{PacketMeta, Protocol};

/// Expiry shortening applied to a TCP flow once FIN or RST is seen.
const TCP_CLOSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Per-protocol conntrack timeouts.  Reloadable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct Timeouts {
    /// Idle timeout for TCP flows.
    pub tcp: Duration,
    /// Idle timeout for UDP flows.
    pub udp: Duration,
    /// Idle timeout for everything else.
    pub default: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            tcp: Duration::from_secs(12 * 60),
            udp: Duration::from_secs(3 * 60),
            default: Duration::from_secs(10 * 60),
        }
    }
}

impl Timeouts {
    /// The idle timeout for `proto`.
    fn for_proto(&self, proto: Protocol) -> Duration {
        match proto {
            Protocol::Tcp => self.tcp,
            Protocol::Udp => self.udp,
            _ => self.default,
        }
    }
}

/// Key identifying a flow, oriented to this node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) struct FlowKey {
    /// IP protocol.
    proto: Protocol,
    /// Local address and port.
    local: (std::net::Ipv4Addr, u16),
    /// Remote address and port.
    remote: (std::net::Ipv4Addr, u16),
}

impl FlowKey {
    /// The key for a parsed packet.
    pub(crate) fn of(packet: &PacketMeta) -> Self {
        FlowKey {
            proto: packet.proto,
            local: (packet.local_ip, packet.local_port),
            remote: (packet.remote_ip, packet.remote_port),
        }
    }
}

/// State kept per tracked flow.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Flow {
    /// When this flow lapses unless refreshed.
    expiry: Instant,
    /// The rules version under which the flow was last admitted.
    pub(crate) rules_version: u32,
    /// True if the flow was established by an inbound packet.
    pub(crate) incoming: bool,
}

/// Outcome of offering a packet to the tracker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TrackResult {
    /// Flow known and admitted under the current rules; expiry refreshed.
    Pass,
    /// Flow known, but admitted under superseded rules; re-validate
    /// against the direction that originally established it.
    Stale {
        /// Whether the flow was established by an inbound packet.
        incoming: bool,
    },
    /// No such flow.
    Miss,
}

/// The connection table.  One of these survives across rule reloads.
#[derive(Debug, Default)]
pub(crate) struct Conntrack {
    /// Tracked flows.
    flows: HashMap<FlowKey, Flow>,
}

impl Conntrack {
    /// Offer `packet` to the table: refresh a live matching flow, flag a
    /// stale one, or report a miss.
    pub(crate) fn lookup(
        &mut self,
        packet: &PacketMeta,
        rules_version: u32,
        timeouts: &Timeouts,
        now: Instant,
    ) -> TrackResult {
        let key = FlowKey::of(packet);
        let Some(flow) = self.flows.get_mut(&key) else {
            return TrackResult::Miss;
        };
        if flow.expiry <= now {
            self.flows.remove(&key);
            return TrackResult::Miss;
        }
        if flow.rules_version != rules_version {
            return TrackResult::Stale {
                incoming: flow.incoming,
            };
        }
        flow.expiry = now + timeouts.for_proto(packet.proto);
        if packet.tcp_closing() {
            flow.expiry = now + TCP_CLOSE_TIMEOUT;
        }
        TrackResult::Pass
    }

    /// Record (or re-stamp) the flow for an admitted packet.
    pub(crate) fn insert(
        &mut self,
        packet: &PacketMeta,
        incoming: bool,
        rules_version: u32,
        timeouts: &Timeouts,
        now: Instant,
    ) {
        let expiry = if packet.tcp_closing() {
            now + TCP_CLOSE_TIMEOUT
        } else {
            now + timeouts.for_proto(packet.proto)
        };
        self.flows.insert(
            FlowKey::of(packet),
            Flow {
                expiry,
                rules_version,
                incoming,
            },
        );
    }

    /// Drop the flow for `packet`, if any.
    pub(crate) fn remove(&mut self, packet: &PacketMeta) {
        self.flows.remove(&FlowKey::of(packet));
    }

    /// Drop every flow.  Used when the rules version wraps to zero.
    pub(crate) fn flush(&mut self) {
        self.flows.clear();
    }

    /// Sweep out expired flows; returns how many were dropped.
    pub(crate) fn purge_expired(&mut self, now: Instant) -> usize {
        let before = self.flows.len();
        self.flows.retain(|_, flow| flow.expiry > now);
        before - self.flows.len()
    }

    /// Number of live flows.
    pub(crate) fn len(&self) -> usize {
        self.flows.len()
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

    /// A UDP packet for 10.0.0.1:1000 -> 10.0.0.2:2000.
    fn udp_packet() -> PacketMeta {
        PacketMeta {
            proto: Protocol::Udp,
            local_ip: "10.0.0.1".parse().unwrap(),
            remote_ip: "10.0.0.2".parse().unwrap(),
            local_port: 1000,
            remote_port: 2000,
            fragment: false,
            tcp_flags: 0,
        }
    }

    #[test]
    fn miss_insert_pass_expire() {
        let mut ct = Conntrack::default();
        let t = Timeouts::default();
        let now = Instant::now();
        let p = udp_packet();

        assert_eq!(ct.lookup(&p, 1, &t, now), TrackResult::Miss);
        ct.insert(&p, false, 1, &t, now);
        assert_eq!(ct.lookup(&p, 1, &t, now), TrackResult::Pass);

        let late = now + t.udp + Duration::from_secs(1);
        assert_eq!(ct.lookup(&p, 1, &t, late), TrackResult::Miss);
    }

    #[test]
    fn stale_version_flagged() {
        let mut ct = Conntrack::default();
        let t = Timeouts::default();
        let now = Instant::now();
        let p = udp_packet();
        ct.insert(&p, false, 1, &t, now);
        assert_eq!(
            ct.lookup(&p, 2, &t, now),
            TrackResult::Stale { incoming: false }
        );
    }

    #[test]
    fn tcp_close_shortens_expiry() {
        let mut ct = Conntrack::default();
        let t = Timeouts::default();
        let now = Instant::now();
        let mut p = udp_packet();
        p.proto = Protocol::Tcp;
        ct.insert(&p, false, 1, &t, now);

        p.tcp_flags = crate::packet::TCP_RST;
        assert_eq!(ct.lookup(&p, 1, &t, now), TrackResult::Pass);
        // Well before the idle timeout, but after the close window:
        let later = now + TCP_CLOSE_TIMEOUT + Duration::from_secs(1);
        p.tcp_flags = 0;
        assert_eq!(ct.lookup(&p, 1, &t, later), TrackResult::Miss);
    }

    #[test]
    fn purge_and_flush() {
        let mut ct = Conntrack::default();
        let t = Timeouts::default();
        let now = Instant::now();
        ct.insert(&udp_packet(), false, 1, &t, now);
        assert_eq!(ct.len(), 1);
        assert_eq!(ct.purge_expired(now + Duration::from_secs(600)), 1);
        ct.insert(&udp_packet(), false, 1, &t, now);
        ct.flush();
        assert_eq!(ct.len(), 0);
    }
}
