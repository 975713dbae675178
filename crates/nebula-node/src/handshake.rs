//! The handshake manager: outbound initiation with retransmission, and
//! both sides of the inbound exchange.
//!
//! A handshake is triggered the moment the first outbound frame misses an
//! established tunnel (through a bounded trigger channel, so the packet
//! path never blocks), and retransmits on a linear schedule: attempt `n`
//! waits `n * try_interval` before the next, giving a total window of
//! roughly `try_interval * retries * (retries + 1) / 2`.  Each
//! retransmission rotates to the next candidate endpoint.

use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant, SystemTime};

use tracing::{debug, info, warn};

use nebula_proto::handshake::{self, HandshakeComplete, HandshakePayload, InitiatorState};
use nebula_proto::header::Header;
use nebula_proto::CryptoTunnel;

use crate::config::HandshakeConfig;
use crate::hostmap::PromoteOutcome;
use crate::timerwheel::TimerWheel;
use crate::Node;

/// Resolution of the handshake retry wheel.
const WHEEL_TICK: Duration = Duration::from_millis(100);
/// Slots in the handshake retry wheel (spans 6.4 s at the default tick;
/// longer waits re-enter the wheel).
const WHEEL_SLOTS: usize = 64;

/// One outbound handshake in flight.
struct PendingState {
    /// Our index for the tunnel being built.
    local_index: u32,
    /// The cryptographic half, consumed when the reply arrives.
    initiator: Option<InitiatorState>,
    /// The full message-one packet, kept for retransmission.
    msg1_packet: Vec<u8>,
    /// Transmissions so far.
    attempts: u32,
    /// Which candidate endpoint the last attempt used.
    candidate_cursor: usize,
}

/// The handshake manager.
pub(crate) struct HandshakeManager {
    /// Pacing and buffer configuration.
    cfg: HandshakeConfig,
    /// In-flight outbound handshakes by peer overlay IP.
    pending: Mutex<HashMap<Ipv4Addr, PendingState>>,
    /// Bounded "handshake to X now" channel.
    trigger: Mutex<VecDeque<Ipv4Addr>>,
    /// Triggers dropped because the channel was full.
    trigger_dropped: AtomicU64,
    /// Retransmission schedule.
    wheel: Mutex<TimerWheel<Ipv4Addr>>,
}

impl HandshakeManager {
    /// Create a manager.
    pub(crate) fn new(cfg: HandshakeConfig, now: Instant) -> Self {
        HandshakeManager {
            cfg,
            pending: Mutex::new(HashMap::new()),
            trigger: Mutex::new(VecDeque::new()),
            trigger_dropped: AtomicU64::new(0),
            wheel: Mutex::new(TimerWheel::new(WHEEL_TICK, WHEEL_SLOTS, now)),
        }
    }

    /// Request a handshake to `ip` without waiting for the periodic tick.
    /// Never blocks; a full channel drops the trigger (the next frame
    /// re-triggers).
    pub(crate) fn trigger(&self, ip: Ipv4Addr) {
        let mut q = self.trigger.lock().expect("trigger poisoned");
        if q.contains(&ip) {
            return;
        }
        if q.len() >= self.cfg.trigger_buffer {
            self.trigger_dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        q.push_back(ip);
    }

    /// Triggers dropped so far.
    pub(crate) fn trigger_dropped(&self) -> u64 {
        self.trigger_dropped.load(Ordering::Relaxed)
    }

    /// Timer entry point: start triggered handshakes, then run the
    /// retransmission wheel.
    pub(crate) fn tick(&self, node: &Node, now: Instant) {
        let triggered: Vec<Ipv4Addr> = {
            let mut q = self.trigger.lock().expect("trigger poisoned");
            q.drain(..).collect()
        };
        for ip in triggered {
            self.start(node, ip, now);
        }

        let mut due = Vec::new();
        self.wheel
            .lock()
            .expect("wheel poisoned")
            .advance(now, &mut due);
        for ip in due {
            self.retransmit(node, ip, now);
        }
    }

    /// Begin (or join) an outbound handshake to `ip`.
    pub(crate) fn start(&self, node: &Node, ip: Ipv4Addr, now: Instant) {
        if node.hostmap().lookup_main(ip).is_some() {
            return;
        }
        let mut pending = self.pending.lock().expect("pending poisoned");
        if pending.contains_key(&ip) {
            return;
        }

        let host = node.hostmap().add_pending(ip, now);
        let payload = HandshakePayload {
            certificate: node.local_cert().encode(),
            index: host.local_index(),
            timestamp_ms: unix_ms(SystemTime::now()),
        };
        let (state, msg1) = handshake::initiate(
            node.cipher(),
            node.dh_keypair(),
            &payload,
            &mut rand::thread_rng(),
        );
        let header = Header::for_handshake_stage(1, 0);
        let mut packet = header.encode().to_vec();
        packet.extend_from_slice(&msg1);

        // Register before transmitting, so a fast reply cannot beat the
        // bookkeeping.
        pending.insert(
            ip,
            PendingState {
                local_index: host.local_index(),
                initiator: Some(state),
                msg1_packet: packet.clone(),
                attempts: 1,
                candidate_cursor: 0,
            },
        );
        drop(pending);
        if !node.send_raw_to_host(&host, &packet) {
            // Nowhere to send message one yet: ask the lighthouse and let
            // the wheel retry once an address shows up.
            node.queue_lighthouse_query(ip);
        }
        debug!(peer = %ip, attempt = 1, "handshake started");
        self.schedule(ip, 1, now);
    }

    /// Schedule the retry after attempt `n`.
    fn schedule(&self, ip: Ipv4Addr, attempt: u32, _now: Instant) {
        let delay = self.cfg.try_interval * attempt;
        self.wheel
            .lock()
            .expect("wheel poisoned")
            .schedule(ip, delay);
    }

    /// Retransmit message one, or give up.
    fn retransmit(&self, node: &Node, ip: Ipv4Addr, now: Instant) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        let Some(state) = pending.get_mut(&ip) else {
            return; // completed or failed in the meantime
        };
        if state.attempts >= self.cfg.retries {
            let local_index = state.local_index;
            pending.remove(&ip);
            drop(pending);
            warn!(peer = %ip, "handshake retries exhausted");
            if let Some(host) = node.hostmap().delete(local_index) {
                node.stats().count_outbox_drop(host.drain_outbox().len());
            }
            return;
        }

        let Some(host) = node.hostmap().by_local_index(state.local_index) else {
            pending.remove(&ip);
            return;
        };
        state.attempts += 1;
        state.candidate_cursor += 1;
        // Rotate through candidate endpoints; relayed paths and the
        // last-known address are handled by the routing helper.
        let routed = {
            let candidates = host.candidates();
            if host.via_relay().is_none() && candidates.len() > 1 {
                let dest = candidates[state.candidate_cursor % candidates.len()];
                node.send_outside(dest, &state.msg1_packet);
                true
            } else {
                node.send_raw_to_host(&host, &state.msg1_packet)
            }
        };
        if routed {
            debug!(peer = %ip, attempt = state.attempts, "handshake retransmit");
        } else {
            node.queue_lighthouse_query(ip);
        }
        let attempt = state.attempts;
        drop(pending);
        self.schedule(ip, attempt, now);
    }

    /// Handle an inbound message one: we are the responder.
    /// `from_relay` marks messages that arrived through a relay, whose
    /// source address belongs to the relay rather than the peer.
    pub(crate) fn handle_stage1(
        &self,
        node: &Node,
        src: SocketAddr,
        payload: &[u8],
        now: Instant,
        from_relay: bool,
    ) {
        let responder = match handshake::respond(node.cipher(), node.curve(), payload) {
            Ok(r) => r,
            Err(e) => {
                debug!(%src, error = %e, "undecodable handshake initiation");
                node.stats().count_handshake_error();
                return;
            }
        };
        let peer_cert = match node.verify_peer(
            &responder.peer_payload().certificate,
            responder.peer_static(),
        ) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(%src, error = %e, "rejected handshake initiation");
                node.stats().count_handshake_reject();
                return;
            }
        };
        let Some(peer_ip) = peer_cert.details().primary_ip() else {
            warn!(%src, "initiator certificate carries no overlay address");
            node.stats().count_handshake_reject();
            return;
        };
        let peer_index = responder.peer_payload().index;

        // A fresh entry, even if we are mid-handshake toward the same
        // peer: the two exchanges must keep separate key state, and the
        // promotion tie-break picks the survivor.
        let previous = node.hostmap().lookup_pending(peer_ip);
        let host = node.hostmap().new_pending(peer_ip, now);
        if let Some(prev) = previous {
            host.set_via_relay(prev.via_relay());
            for addr in prev.candidates() {
                host.add_candidate(addr);
            }
        }
        if !from_relay {
            host.set_remote_addr(src, now);
        }

        let our_payload = HandshakePayload {
            certificate: node.local_cert().encode(),
            index: host.local_index(),
            timestamp_ms: unix_ms(SystemTime::now()),
        };
        let (msg2, done) = match responder.finish(node.dh_keypair(), &our_payload, &mut rand::thread_rng()) {
            Ok(v) => v,
            Err(e) => {
                debug!(%src, error = %e, "handshake response construction failed");
                node.stats().count_handshake_error();
                return;
            }
        };

        let tunnel = Arc::new(CryptoTunnel::new(node.cipher(), &done.keys));
        let outcome = node.hostmap().promote(
            host.local_index(),
            peer_index,
            Arc::new(peer_cert),
            tunnel,
            node.firewall().rules_version(),
        );
        match outcome {
            PromoteOutcome::Installed { evicted } => {
                let header = Header::for_handshake_stage(2, peer_index);
                let mut packet = header.encode().to_vec();
                packet.extend_from_slice(&msg2);
                // The reply retraces the initiation's path: directly to the
                // sender, or back through the relay.
                if !node.send_raw_to_host(&host, &packet) {
                    node.send_outside(src, &packet);
                }
                node.on_established(&host, evicted, now);
            }
            PromoteOutcome::Superseded => {
                debug!(peer = %peer_ip, "concurrent handshake superseded ours");
            }
        }
    }

    /// Handle an inbound message two: our initiation got its reply.
    pub(crate) fn handle_stage2(
        &self,
        node: &Node,
        src: SocketAddr,
        header: &Header,
        payload: &[u8],
        now: Instant,
        from_relay: bool,
    ) {
        let mut pending = self.pending.lock().expect("pending poisoned");
        // The responder addresses us by the index we sent in message one.
        let Some((&ip, _)) = pending
            .iter()
            .find(|(_, st)| st.local_index == header.remote_index)
        else {
            node.stats().count_unknown_index();
            return;
        };
        let Some(state) = pending.get_mut(&ip) else { return };
        let Some(initiator) = state.initiator.take() else {
            return;
        };
        let local_index = state.local_index;
        pending.remove(&ip);
        drop(pending);

        let done: HandshakeComplete = match initiator.finish(node.dh_keypair(), payload) {
            Ok(d) => d,
            Err(e) => {
                debug!(%src, error = %e, "handshake reply failed");
                node.stats().count_handshake_error();
                return;
            }
        };
        let peer_cert = match node.verify_peer(&done.payload.certificate, &done.peer_static) {
            Ok(cert) => cert,
            Err(e) => {
                warn!(%src, error = %e, "rejected handshake reply");
                node.stats().count_handshake_reject();
                if let Some(host) = node.hostmap().delete(local_index) {
                    node.stats().count_outbox_drop(host.drain_outbox().len());
                }
                return;
            }
        };
        if peer_cert.details().primary_ip() != Some(ip) {
            warn!(%src, peer = %ip, "responder certificate does not own the dialed address");
            node.stats().count_handshake_reject();
            node.hostmap().delete(local_index);
            return;
        }

        let Some(host) = node.hostmap().by_local_index(local_index) else {
            return;
        };
        if !from_relay {
            host.set_remote_addr(src, now);
        }
        let tunnel = Arc::new(CryptoTunnel::new(node.cipher(), &done.keys));
        let outcome = node.hostmap().promote(
            local_index,
            done.payload.index,
            Arc::new(peer_cert),
            tunnel,
            node.firewall().rules_version(),
        );
        match outcome {
            PromoteOutcome::Installed { evicted } => {
                info!(peer = %ip, "handshake complete as initiator");
                node.on_established(&host, evicted, now);
                node.flush_outbox(&host, now);
            }
            PromoteOutcome::Superseded => {
                debug!(peer = %ip, "our tunnel lost the handshake race");
            }
        }
    }

    /// Drop in-flight state for `ip`, if any (peer evicted, shutdown).
    pub(crate) fn abandon(&self, ip: Ipv4Addr) {
        self.pending.lock().expect("pending poisoned").remove(&ip);
    }

    /// Is a handshake to `ip` in flight?
    pub(crate) fn has_pending(&self, ip: Ipv4Addr) -> bool {
        self.pending.lock().expect("pending poisoned").contains_key(&ip)
    }

    /// Number of handshakes in flight.
    pub(crate) fn pending_len(&self) -> usize {
        self.pending.lock().expect("pending poisoned").len()
    }
}

/// Milliseconds since the Unix epoch.
fn unix_ms(t: SystemTime) -> u64 {
    t.duration_since(SystemTime::UNIX_EPOCH)
        .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
        .unwrap_or(0)
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

    #[test]
    fn trigger_channel_is_bounded_and_deduplicated() {
        let cfg = HandshakeConfig {
            trigger_buffer: 2,
            ..Default::default()
        };
        let mgr = HandshakeManager::new(cfg, Instant::now());
        for i in 0..5 {
            mgr.trigger(Ipv4Addr::new(10, 0, 0, i));
        }
        assert_eq!(mgr.trigger_dropped(), 3);
        // Duplicates of an already-queued address are absorbed, not
        // counted against the cap.
        mgr.trigger(Ipv4Addr::new(10, 0, 0, 0));
        assert_eq!(mgr.trigger_dropped(), 3);
        assert_eq!(mgr.pending_len(), 0);
    }
}
