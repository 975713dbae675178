//! The connection manager: liveness checking, re-handshake scheduling,
//! and reaping of idle or invalid tunnels.
//!
//! Every established tunnel is enqueued for a trust-but-verify check
//! shortly after its handshake, then re-checked periodically.  A check
//! compares the tunnel's packet counters to their values at the previous
//! check: inbound traffic proves the peer alive; outbound-only traffic
//! earns a probe; a probe that goes unanswered kills the tunnel.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use nebula_proto::header::TestSubtype;

use crate::config::TunnelConfig;
use crate::timerwheel::TimerWheel;
use crate::Node;

/// Resolution of the maintenance wheel.
const WHEEL_TICK: Duration = Duration::from_secs(1);
/// Slots in the maintenance wheel; spans well past the inactivity
/// timeout.
const WHEEL_SLOTS: usize = 1024;

/// Delay before a fresh tunnel's first (trust-but-verify) check.
const TRUST_FIRST_CHECK: Duration = Duration::from_secs(7);
/// Gap between periodic checks thereafter.
const PERIODIC_CHECK: Duration = Duration::from_secs(10);

/// Warn this far ahead of a peer certificate's expiry.
const EXPIRY_WARNING_WINDOW: Duration = Duration::from_secs(24 * 3600);

/// On a relayed tunnel, attempt a direct path after this many inbound
/// packets.
const TRY_PROMOTE_EVERY: u64 = 32;

/// Per-tunnel liveness bookkeeping between checks.
struct Liveness {
    /// Inbound packet count at the previous check.
    last_in: u64,
    /// Outbound packet count at the previous check.
    last_out: u64,
    /// A probe is outstanding; no inbound traffic since it was sent
    /// condemns the tunnel.
    probe_outstanding: bool,
    /// Last time either counter moved.
    last_activity: Instant,
    /// Local rebind generation this tunnel last punched for.
    seen_rebind: u64,
    /// Inbound count when we last attempted direct-path promotion.
    promote_mark: u64,
    /// Whether the imminent-expiry warning has been logged.
    expiry_warned: bool,
}

/// The connection manager.
pub(crate) struct ConnectionManager {
    /// Maintenance configuration.
    cfg: TunnelConfig,
    /// Check schedule, by local index.
    wheel: Mutex<TimerWheel<u32>>,
    /// Liveness state, by local index.
    states: Mutex<HashMap<u32, Liveness>>,
}

impl ConnectionManager {
    /// Create a manager.
    pub(crate) fn new(cfg: TunnelConfig, now: Instant) -> Self {
        ConnectionManager {
            cfg,
            wheel: Mutex::new(TimerWheel::new(WHEEL_TICK, WHEEL_SLOTS, now)),
            states: Mutex::new(HashMap::new()),
        }
    }

    /// Enroll a freshly established tunnel for its first check.
    pub(crate) fn register(&self, node: &Node, local_index: u32, now: Instant) {
        let Some(host) = node.hostmap().by_local_index(local_index) else {
            return;
        };
        self.states.lock().expect("states poisoned").insert(
            local_index,
            Liveness {
                last_in: host.packets_in(),
                last_out: host.packets_out(),
                probe_outstanding: false,
                last_activity: now,
                seen_rebind: node.rebind_generation(),
                promote_mark: 0,
                expiry_warned: false,
            },
        );
        self.wheel
            .lock()
            .expect("wheel poisoned")
            .schedule(local_index, TRUST_FIRST_CHECK);
    }

    /// Stop tracking a tunnel (evicted elsewhere).
    pub(crate) fn forget(&self, local_index: u32) {
        self.states
            .lock()
            .expect("states poisoned")
            .remove(&local_index);
    }

    /// Timer entry point.
    pub(crate) fn tick(&self, node: &Node, now: Instant) {
        let mut due = Vec::new();
        self.wheel
            .lock()
            .expect("wheel poisoned")
            .advance(now, &mut due);
        for local_index in due {
            self.check_one(node, local_index, now);
        }
    }

    /// Run one liveness check; re-enqueue unless the tunnel died.
    fn check_one(&self, node: &Node, local_index: u32, now: Instant) {
        let Some(host) = node.hostmap().by_local_index(local_index) else {
            self.forget(local_index);
            return;
        };
        if !host.is_established() {
            // Still pending; the handshake wheel owns it.
            self.forget(local_index);
            return;
        }
        let ip = host.overlay_ip();
        // A supplanted tunnel lingers in the arena only until its next
        // check.
        let is_main = node
            .hostmap()
            .lookup_main(ip)
            .is_some_and(|main| main.local_index() == local_index);
        if !is_main {
            debug!(peer = %ip, local_index, "reaping supplanted tunnel");
            self.evict(node, local_index, false, now);
            return;
        }

        let wall_now = SystemTime::now();
        let mut states = self.states.lock().expect("states poisoned");
        let Some(st) = states.get_mut(&local_index) else {
            drop(states);
            self.register(node, local_index, now);
            return;
        };

        if let Some(cert) = host.cert() {
            if !st.expiry_warned && cert.expires_within(wall_now, EXPIRY_WARNING_WINDOW) {
                warn!(peer = %ip, "peer certificate expires within 24 hours");
                st.expiry_warned = true;
            }
            if node.disconnect_invalid() && cert.is_expired_at(wall_now) {
                drop(states);
                info!(peer = %ip, "evicting tunnel: peer certificate expired");
                self.evict(node, local_index, true, now);
                return;
            }
        }

        // Rebind: our local endpoint changed; ask the lighthouse to make
        // the peer punch toward the new mapping.
        let rebind = node.rebind_generation();
        if st.seen_rebind != rebind {
            st.seen_rebind = rebind;
            node.lighthouse().punch_notify(ip);
        }

        let inbound = host.packets_in();
        let outbound = host.packets_out();
        let saw_in = inbound > st.last_in;
        let saw_out = outbound > st.last_out;

        if saw_in || saw_out {
            st.last_activity = now;
        }

        if saw_in {
            st.probe_outstanding = false;
            // Relayed tunnels periodically try for a direct path.
            if host.via_relay().is_some() && inbound - st.promote_mark >= TRY_PROMOTE_EVERY {
                st.promote_mark = inbound;
                debug!(peer = %ip, "attempting direct-path promotion of relayed tunnel");
                node.handshakes().trigger(ip);
            }
        } else if saw_out {
            if st.probe_outstanding {
                // We probed last round and heard nothing back: dead.
                drop(states);
                info!(peer = %ip, "evicting tunnel: no inbound traffic after probe");
                self.evict(node, local_index, false, now);
                // The peer was being talked to; try to come back up.
                node.handshakes().trigger(ip);
                return;
            }
            st.probe_outstanding = true;
            drop(states);
            debug!(peer = %ip, "tunnel state unknown; probing");
            node.send_probe(&host, TestSubtype::REQUEST);
            self.reschedule_and_update(node, local_index, inbound, outbound);
            return;
        } else {
            // Totally quiet in both directions.
            if self.cfg.drop_inactive
                && now.duration_since(st.last_activity) >= self.cfg.inactivity_timeout
            {
                drop(states);
                debug!(peer = %ip, "reaping inactive tunnel");
                self.evict(node, local_index, false, now);
                return;
            }
        }

        st.last_in = inbound;
        st.last_out = outbound;
        drop(states);
        self.wheel
            .lock()
            .expect("wheel poisoned")
            .schedule(local_index, PERIODIC_CHECK);
    }

    /// Store counters and re-enqueue (helper for paths that dropped the
    /// states lock early).
    fn reschedule_and_update(&self, _node: &Node, local_index: u32, inbound: u64, outbound: u64) {
        if let Some(st) = self
            .states
            .lock()
            .expect("states poisoned")
            .get_mut(&local_index)
        {
            st.last_in = inbound;
            st.last_out = outbound;
        }
        self.wheel
            .lock()
            .expect("wheel poisoned")
            .schedule(local_index, PERIODIC_CHECK);
    }

    /// Tear a tunnel down: notify the peer (if asked), drop any staged
    /// frames, release indices, and forget liveness state.
    pub(crate) fn evict(&self, node: &Node, local_index: u32, notify_peer: bool, _now: Instant) {
        self.forget(local_index);
        let Some(host) = node.hostmap().delete(local_index) else {
            return;
        };
        if notify_peer && host.is_established() {
            node.send_close(&host);
        }
        node.relays().host_evicted(local_index);
        node.stats().count_outbox_drop(host.drain_outbox().len());
        info!(peer = %host.overlay_ip(), local_index, "tunnel closed");
    }
}
