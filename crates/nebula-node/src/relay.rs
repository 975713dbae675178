//! The relay manager: carrying opaque tunnel frames for peers that
//! cannot reach each other directly.
//!
//! Establishment runs requester -> relay -> target and back: the
//! requester asks its relay, the relay (policy permitting) asks the
//! target, and each hop allocates a relay index for the pairing.  Once
//! established, `RELAY` packets carry the inner encrypted frame verbatim
//! -- the relay re-frames and forwards but can never see plaintext, and
//! its firewall is never consulted on the inner flow.

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::Mutex;
use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};

use nebula_proto::relay::{RelayControl, RelayControlKind};
use nebula_proto::Header;
use nebula_proto::PacketType;

use crate::config::RelayConfig;
use crate::err::Error;
use crate::hostmap::{HostInfo, ViaRelay};
use crate::Node;

/// Which side of a relayed path this binding serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayRole {
    /// We are an endpoint; the peer tunnel leads to our relay.
    ForMe,
    /// We are the relay; frames arriving here are forwarded onward.
    ForThem,
}

/// Establishment progress of a binding.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RelayState {
    /// Waiting for the far side's index.
    Requested,
    /// Ready to carry frames.
    Established,
}

/// One direction of a relayed pairing, keyed by our relay index.
struct Binding {
    /// Endpoint or forwarder.
    role: RelayRole,
    /// Establishment progress.
    state: RelayState,
    /// Local index of the tunnel this binding receives frames over.
    peer_tunnel: u32,
    /// Overlay address of the node that asked for the relay.
    initiator: Ipv4Addr,
    /// Overlay address frames through this binding are destined for.
    target: Ipv4Addr,
    /// The index the node on the other side of `peer_tunnel` assigned,
    /// stamped on frames we send that way.
    remote_relay_index: Option<u32>,
    /// For a forwarder: the mirror binding on the other leg.
    forward_index: Option<u32>,
}

/// The relay manager.
pub(crate) struct RelayManager {
    /// Participation configuration.
    cfg: RelayConfig,
    /// Bindings by our relay index.
    bindings: Mutex<HashMap<u32, Binding>>,
    /// Established-pair dedup: (initiator, target) -> our index for the
    /// initiator-side leg.
    by_pair: Mutex<HashMap<(Ipv4Addr, Ipv4Addr), u32>>,
}

impl RelayManager {
    /// Create a manager.
    pub(crate) fn new(cfg: RelayConfig) -> Self {
        RelayManager {
            cfg,
            bindings: Mutex::new(HashMap::new()),
            by_pair: Mutex::new(HashMap::new()),
        }
    }

    /// Whether this node may route its own traffic through relays.
    pub(crate) fn use_relays(&self) -> bool {
        self.cfg.use_relays
    }

    /// The relays configuration offers us.
    pub(crate) fn configured_relays(&self) -> &[Ipv4Addr] {
        &self.cfg.relays
    }

    /// Allocate an unused relay index.
    fn alloc_index(bindings: &HashMap<u32, Binding>) -> u32 {
        loop {
            let idx: u32 = rand::random();
            if idx != 0 && !bindings.contains_key(&idx) {
                return idx;
            }
        }
    }

    /// Ask `relay_ip` to carry our traffic to `target`.
    ///
    /// The tunnel to the relay must already be established.
    pub(crate) fn request_relay(
        &self,
        node: &Node,
        relay_ip: Ipv4Addr,
        target: Ipv4Addr,
    ) -> Result<(), Error> {
        let me = node.overlay_ip();
        let relay_host = node
            .hostmap()
            .lookup_main(relay_ip)
            .ok_or(Error::NoTunnel(relay_ip))?;
        {
            let pairs = self.by_pair.lock().expect("by_pair poisoned");
            if pairs.contains_key(&(me, target)) {
                return Ok(());
            }
        }
        let idx = {
            let mut bindings = self.bindings.lock().expect("bindings poisoned");
            let idx = Self::alloc_index(&bindings);
            bindings.insert(
                idx,
                Binding {
                    role: RelayRole::ForMe,
                    state: RelayState::Requested,
                    peer_tunnel: relay_host.local_index(),
                    initiator: me,
                    target,
                    remote_relay_index: None,
                    forward_index: None,
                },
            );
            idx
        };
        self.by_pair
            .lock()
            .expect("by_pair poisoned")
            .insert((me, target), idx);
        let msg = RelayControl::request(idx, me, target);
        node.send_relay_control(&relay_host, &msg)?;
        debug!(relay = %relay_ip, %target, "relay requested");
        Ok(())
    }

    /// Handle a decrypted `RELAY_CONTROL` payload from `from_host`.
    pub(crate) fn handle_control(
        &self,
        node: &Node,
        from_host: &HostInfo,
        msg: &RelayControl,
        now: Instant,
    ) {
        match msg.control_kind() {
            Ok(RelayControlKind::Request) => self.handle_request(node, from_host, msg, now),
            Ok(RelayControlKind::Response) => self.handle_response(node, from_host, msg, now),
            Err(_) => {
                debug!("unrecognized relay control kind");
            }
        }
    }

    /// A `Request` arrived: we are either the relay or the target.
    fn handle_request(&self, node: &Node, from_host: &HostInfo, msg: &RelayControl, now: Instant) {
        let initiator = msg.initiator();
        let target = msg.target();
        if target == node.overlay_ip() {
            // We are the far end: accept and hand back our index.
            let idx = {
                let mut bindings = self.bindings.lock().expect("bindings poisoned");
                let idx = Self::alloc_index(&bindings);
                bindings.insert(
                    idx,
                    Binding {
                        role: RelayRole::ForMe,
                        state: RelayState::Established,
                        peer_tunnel: from_host.local_index(),
                        initiator,
                        target: initiator,
                        remote_relay_index: Some(msg.initiator_relay_index),
                        forward_index: None,
                    },
                );
                idx
            };
            self.by_pair
                .lock()
                .expect("by_pair poisoned")
                .insert((initiator, node.overlay_ip()), idx);
            // Frames from the initiator will arrive through the relay; route
            // our return traffic (the handshake included) the same way.
            let peer = node
                .lookup_any_host(initiator)
                .unwrap_or_else(|| node.hostmap().add_pending(initiator, now));
            peer.set_via_relay(Some(ViaRelay {
                relay_ip: from_host.overlay_ip(),
                relay_index: msg.initiator_relay_index,
            }));
            let reply = RelayControl::response(msg, idx);
            if let Err(e) = node.send_relay_control(from_host, &reply) {
                debug!(error = %e, "could not answer relay request");
            }
            info!(%initiator, relay = %from_host.overlay_ip(), "accepting relayed tunnel");
            return;
        }

        // We are being asked to forward.
        if !self.cfg.am_relay {
            debug!(%initiator, %target, "relay request refused: not a relay");
            return;
        }
        let Some(target_host) = node.hostmap().lookup_main(target) else {
            debug!(%initiator, %target, "relay request refused: no tunnel to target");
            return;
        };
        let wall_now = SystemTime::now();
        for host in [from_host, &*target_host] {
            match host.cert() {
                Some(cert)
                    if !cert.is_expired_at(wall_now) && !node.is_blocklisted(cert) => {}
                _ => {
                    warn!(%initiator, %target, "relay request refused: unusable peer certificate");
                    return;
                }
            }
        }

        let mut bindings = self.bindings.lock().expect("bindings poisoned");
        let idx_in = Self::alloc_index(&bindings);
        bindings.insert(
            idx_in,
            Binding {
                role: RelayRole::ForThem,
                state: RelayState::Established,
                peer_tunnel: from_host.local_index(),
                initiator,
                target,
                remote_relay_index: Some(msg.initiator_relay_index),
                forward_index: None, // patched below
            },
        );
        let idx_out = Self::alloc_index(&bindings);
        bindings.insert(
            idx_out,
            Binding {
                role: RelayRole::ForThem,
                state: RelayState::Requested,
                peer_tunnel: target_host.local_index(),
                initiator,
                target: initiator,
                remote_relay_index: None,
                forward_index: Some(idx_in),
            },
        );
        if let Some(b) = bindings.get_mut(&idx_in) {
            b.forward_index = Some(idx_out);
        }
        drop(bindings);
        self.by_pair
            .lock()
            .expect("by_pair poisoned")
            .insert((initiator, target), idx_in);

        let onward = RelayControl {
            kind: RelayControlKind::Request as i32,
            initiator_relay_index: idx_out,
            responder_relay_index: 0,
            initiator_addr: msg.initiator_addr,
            target_addr: msg.target_addr,
        };
        if let Err(e) = node.send_relay_control(&target_host, &onward) {
            debug!(error = %e, "could not extend relay request to target");
        }
        debug!(%initiator, %target, "forwarding relay request to target");
    }

    /// A `Response` arrived: the far side assigned its index.
    fn handle_response(&self, node: &Node, from_host: &HostInfo, msg: &RelayControl, now: Instant) {
        let mut bindings = self.bindings.lock().expect("bindings poisoned");
        let Some(binding) = bindings.get_mut(&msg.initiator_relay_index) else {
            debug!("relay response for unknown binding");
            return;
        };
        binding.state = RelayState::Established;
        binding.remote_relay_index = Some(msg.responder_relay_index);

        match binding.role {
            RelayRole::ForMe => {
                // Our own request went through: route the target via the
                // relay and (re)start the end-to-end handshake.
                let target = binding.target;
                let relay_ip = from_host.overlay_ip();
                drop(bindings);
                info!(%target, relay = %relay_ip, "relay established");
                let host = node.hostmap().lookup_main(target).unwrap_or_else(|| {
                    node.hostmap().add_pending(target, now)
                });
                host.set_via_relay(Some(ViaRelay {
                    relay_ip,
                    relay_index: msg.responder_relay_index,
                }));
                if !host.is_established() {
                    node.handshakes().trigger(target);
                }
            }
            RelayRole::ForThem => {
                // The target answered; unblock the initiator-side leg and
                // tell the requester its path is ready.
                let Some(idx_in) = binding.forward_index else {
                    return;
                };
                let Some(in_binding) = bindings.get_mut(&idx_in) else {
                    return;
                };
                in_binding.state = RelayState::Established;
                let reply_to = in_binding.peer_tunnel;
                let requester_index = in_binding.remote_relay_index.unwrap_or(0);
                drop(bindings);
                let Some(requester) = node.hostmap().by_local_index(reply_to) else {
                    return;
                };
                let reply = RelayControl {
                    kind: RelayControlKind::Response as i32,
                    initiator_relay_index: requester_index,
                    responder_relay_index: idx_in,
                    initiator_addr: msg.initiator_addr,
                    target_addr: msg.target_addr,
                };
                if let Err(e) = node.send_relay_control(&requester, &reply) {
                    debug!(error = %e, "could not confirm relay to requester");
                }
            }
        }
    }

    /// Handle a `RELAY` packet: forward it onward, or unwrap it if we are
    /// the endpoint.  Returns the inner frame when we are the endpoint.
    pub(crate) fn handle_frame(
        &self,
        node: &Node,
        header: &Header,
        inner: &[u8],
    ) -> Option<Vec<u8>> {
        let bindings = self.bindings.lock().expect("bindings poisoned");
        let Some(binding) = bindings.get(&header.remote_index) else {
            node.stats().count_unknown_index();
            return None;
        };
        match binding.role {
            RelayRole::ForMe => {
                if binding.state != RelayState::Established {
                    return None;
                }
                Some(inner.to_vec())
            }
            RelayRole::ForThem => {
                let Some(out_idx) = binding.forward_index else {
                    return None;
                };
                let Some(out) = bindings.get(&out_idx) else {
                    return None;
                };
                if out.state != RelayState::Established {
                    return None;
                }
                let Some(stamp) = out.remote_relay_index else {
                    return None;
                };
                let Some(next_hop) = node.hostmap().by_local_index(out.peer_tunnel) else {
                    return None;
                };
                // Refuse to forward for peers whose certificates have
                // lapsed or been banned.
                let wall_now = SystemTime::now();
                for leg in [&next_hop, &node.hostmap().by_local_index(binding.peer_tunnel)?] {
                    match leg.cert() {
                        Some(cert)
                            if !cert.is_expired_at(wall_now)
                                && !node.is_blocklisted(cert) => {}
                        _ => {
                            debug!("refusing to forward for unusable certificate");
                            return None;
                        }
                    }
                }
                drop(bindings);
                let fwd_header = Header::new(PacketType::RELAY, 0, stamp, 0);
                let mut packet = fwd_header.encode().to_vec();
                packet.extend_from_slice(inner);
                if let Some(addr) = next_hop.remote_addr() {
                    node.send_outside(addr, &packet);
                    node.stats().count_relayed();
                }
                None
            }
        }
    }

    /// The relay index to stamp on outgoing relayed frames toward
    /// `target`, if the path is established.
    pub(crate) fn outgoing_path(&self, me: Ipv4Addr, target: Ipv4Addr) -> Option<u32> {
        let idx = *self
            .by_pair
            .lock()
            .expect("by_pair poisoned")
            .get(&(me, target))?;
        let bindings = self.bindings.lock().expect("bindings poisoned");
        let binding = bindings.get(&idx)?;
        (binding.state == RelayState::Established)
            .then_some(binding.remote_relay_index)
            .flatten()
    }

    /// Drop every binding leaning on an evicted tunnel.
    pub(crate) fn host_evicted(&self, local_index: u32) {
        let mut bindings = self.bindings.lock().expect("bindings poisoned");
        let doomed: Vec<u32> = bindings
            .iter()
            .filter(|(_, b)| b.peer_tunnel == local_index)
            .map(|(idx, _)| *idx)
            .collect();
        let mirrors: Vec<u32> = doomed
            .iter()
            .filter_map(|idx| bindings.get(idx).and_then(|b| b.forward_index))
            .collect();
        for idx in doomed.iter().chain(mirrors.iter()) {
            if let Some(b) = bindings.remove(idx) {
                self.by_pair
                    .lock()
                    .expect("by_pair poisoned")
                    .retain(|_, v| v != idx);
                debug!(initiator = %b.initiator, target = %b.target, "relay binding dropped");
            }
        }
    }

    /// Number of live bindings.
    pub(crate) fn binding_count(&self) -> usize {
        self.bindings.lock().expect("bindings poisoned").len()
    }
}
