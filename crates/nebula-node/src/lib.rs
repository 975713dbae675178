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

pub mod config;
mod conn_manager;
mod dispatch;
mod err;
mod handshake;
pub mod hostmap;
mod lighthouse;
mod relay;
mod timerwheel;

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::{Instant, SystemTime};

use tracing::{debug, info, warn};

use nebula_cert::{CaPool, Certificate, Fingerprint};
use nebula_crypto::pk::DhKeypair;
use nebula_crypto::{CipherKind, Curve};
use nebula_firewall::{Firewall, Rules};
use nebula_proto::header::Header;
use nebula_proto::header::TestSubtype;
use nebula_proto::relay::RelayControl;
use nebula_proto::PacketType;

use config::{FirewallConfig, NodeConfig, RecvErrorPolicy};
use conn_manager::ConnectionManager;
use handshake::HandshakeManager;
use hostmap::{HostInfo, HostMap};
use lighthouse::QueryChannel;
use relay::RelayManager;

pub use config::RuleConfig;
pub use err::{ConfigError, Error, FatalKind};
pub use lighthouse::{LighthouseHandle, NoopLighthouse};

use prost::Message as _;

/// Where encrypted overlay packets leave the node.
///
/// The embedding binary implements this over its UDP socket(s).  Called
/// from every worker thread; implementations must not block beyond the
/// kernel send itself.
pub trait OutsidePipe: Send + Sync {
    /// Transmit one datagram.
    fn send_to(&self, addr: SocketAddr, packet: &[u8]);
}

/// Where cleartext inside frames leave the node.
///
/// The embedding binary implements this over its TUN device.
pub trait InsidePipe: Send + Sync {
    /// Deliver one IP frame to the inside interface.
    fn write_frame(&self, frame: &[u8]);
}

/// Engine counters.  All per-packet failures end up here rather than in
/// return values.
#[derive(Debug, Default)]
#[non_exhaustive]
pub struct NodeStats {
    /// Packets shorter than a header, or otherwise unparseable.
    short_packet: AtomicU64,
    /// Packets with an unrecognized version or type.
    unknown_type: AtomicU64,
    /// Packets referencing an index we do not hold.
    unknown_index: AtomicU64,
    /// Packets rejected by the replay window.
    replay_drop: AtomicU64,
    /// Packets failing AEAD authentication.
    auth_fail: AtomicU64,
    /// Inbound packets refused by the firewall.
    firewall_drop_in: AtomicU64,
    /// Outbound packets refused by the firewall.
    firewall_drop_out: AtomicU64,
    /// Frames dropped with a failed or abandoned handshake.
    outbox_drop: AtomicU64,
    /// Handshake messages that would not parse or authenticate.
    handshake_error: AtomicU64,
    /// Handshakes refused on certificate grounds.
    handshake_reject: AtomicU64,
    /// `RecvError` replies sent.
    recv_error_sent: AtomicU64,
    /// Frames forwarded on behalf of peers.
    relayed: AtomicU64,
}

impl NodeStats {
    /// Packets rejected by the replay window.
    pub fn replay_drop(&self) -> u64 {
        self.replay_drop.load(Ordering::Relaxed)
    }
    /// Packets failing AEAD authentication.
    pub fn auth_fail(&self) -> u64 {
        self.auth_fail.load(Ordering::Relaxed)
    }
    /// Inbound packets refused by the firewall.
    pub fn firewall_drop_in(&self) -> u64 {
        self.firewall_drop_in.load(Ordering::Relaxed)
    }
    /// Outbound packets refused by the firewall.
    pub fn firewall_drop_out(&self) -> u64 {
        self.firewall_drop_out.load(Ordering::Relaxed)
    }
    /// Frames dropped with a failed or abandoned handshake.
    pub fn outbox_drop(&self) -> u64 {
        self.outbox_drop.load(Ordering::Relaxed)
    }
    /// Packets referencing an index we do not hold.
    pub fn unknown_index(&self) -> u64 {
        self.unknown_index.load(Ordering::Relaxed)
    }
    /// Frames forwarded on behalf of peers.
    pub fn relayed(&self) -> u64 {
        self.relayed.load(Ordering::Relaxed)
    }
    /// `RecvError` replies sent.
    pub fn recv_error_sent(&self) -> u64 {
        self.recv_error_sent.load(Ordering::Relaxed)
    }
    /// Handshakes refused on certificate grounds.
    pub fn handshake_reject(&self) -> u64 {
        self.handshake_reject.load(Ordering::Relaxed)
    }

    /// Count a short or unparseable packet.
    pub(crate) fn count_short_packet(&self) {
        self.short_packet.fetch_add(1, Ordering::Relaxed);
    }
    /// Count an unknown version or type.
    pub(crate) fn count_unknown_type(&self) {
        self.unknown_type.fetch_add(1, Ordering::Relaxed);
    }
    /// Count an unknown index.
    pub(crate) fn count_unknown_index(&self) {
        self.unknown_index.fetch_add(1, Ordering::Relaxed);
    }
    /// Count a replay rejection.
    pub(crate) fn count_replay_drop(&self) {
        self.replay_drop.fetch_add(1, Ordering::Relaxed);
    }
    /// Count an authentication failure.
    pub(crate) fn count_auth_fail(&self) {
        self.auth_fail.fetch_add(1, Ordering::Relaxed);
    }
    /// Count a firewall refusal.
    pub(crate) fn count_firewall_drop(&self, incoming: bool) {
        if incoming {
            self.firewall_drop_in.fetch_add(1, Ordering::Relaxed);
        } else {
            self.firewall_drop_out.fetch_add(1, Ordering::Relaxed);
        }
    }
    /// Count `n` staged frames dropped.
    pub(crate) fn count_outbox_drop(&self, n: usize) {
        self.outbox_drop.fetch_add(n as u64, Ordering::Relaxed);
    }
    /// Count a handshake parse/auth failure.
    pub(crate) fn count_handshake_error(&self) {
        self.handshake_error.fetch_add(1, Ordering::Relaxed);
    }
    /// Count a handshake certificate rejection.
    pub(crate) fn count_handshake_reject(&self) {
        self.handshake_reject.fetch_add(1, Ordering::Relaxed);
    }
    /// Count a `RecvError` reply.
    pub(crate) fn count_recv_error_sent(&self) {
        self.recv_error_sent.fetch_add(1, Ordering::Relaxed);
    }
    /// Count a forwarded frame.
    pub(crate) fn count_relayed(&self) {
        self.relayed.fetch_add(1, Ordering::Relaxed);
    }
}

/// A running overlay node engine.
///
/// Thread model: any number of workers may call
/// [`handle_outside_packet`](Node::handle_outside_packet) and
/// [`handle_inside_frame`](Node::handle_inside_frame) concurrently; one
/// timer thread calls [`timer_tick`](Node::timer_tick).  No engine lock is
/// held across a call into either pipe.
pub struct Node {
    /// The network's AEAD.
    cipher: CipherKind,
    /// The identity curve suite.
    curve: Curve,
    /// Our certificate, swapped atomically on PKI reload.
    local_cert: RwLock<Arc<Certificate>>,
    /// Our static Diffie-Hellman keypair.
    dh_key: DhKeypair,
    /// Our primary overlay address.
    overlay_ip: Ipv4Addr,
    /// Trusted CAs plus blocklist, swapped atomically on PKI reload.
    pool: RwLock<Arc<CaPool>>,
    /// The stateful packet filter.
    firewall: Firewall,
    /// Every tunnel, by IP and by index.
    hostmap: HostMap,
    /// Outbound handshakes and inbound exchange handling.
    handshakes: HandshakeManager,
    /// Liveness, re-handshake, reaping.
    conn_manager: ConnectionManager,
    /// Relay establishment and forwarding.
    relays: RelayManager,
    /// Discovery hooks.
    lighthouse: Box<dyn LighthouseHandle>,
    /// Staged lighthouse lookups.
    queries: QueryChannel,
    /// The UDP side.
    outside: Box<dyn OutsidePipe>,
    /// The TUN side.
    inside: Box<dyn InsidePipe>,
    /// When to answer unknown indices.
    recv_error_policy: RwLock<RecvErrorPolicy>,
    /// Evict tunnels whose peer certificate expires.
    disconnect_invalid: AtomicBool,
    /// Bumped each time the local UDP endpoint rebinds.
    rebind_gen: AtomicU64,
    /// Set once by [`close`](Node::close).
    closed: AtomicBool,
    /// Timer ticks seen; paces the occasional housekeeping sweeps.
    ticks: AtomicU64,
    /// Serializes configuration reloads.
    reload_lock: Mutex<()>,
    /// Counters.
    stats: NodeStats,
}

impl Node {
    /// Build a node engine.
    ///
    /// `cert` is this node's certificate; `dh_key` must be the keypair
    /// whose public half the certificate binds.  `pool` holds the
    /// network's CAs (the configured blocklist is folded in here).
    pub fn new(
        cfg: &NodeConfig,
        cert: Certificate,
        dh_key: DhKeypair,
        mut pool: CaPool,
        outside: Box<dyn OutsidePipe>,
        inside: Box<dyn InsidePipe>,
        lighthouse: Box<dyn LighthouseHandle>,
    ) -> Result<Self, ConfigError> {
        let overlay_ip = cert
            .details()
            .primary_ip()
            .ok_or_else(|| ConfigError::BadIdentity("certificate has no overlay address".into()))?;
        if cert.details().public_key() != dh_key.public_bytes() {
            return Err(ConfigError::BadIdentity(
                "private key does not match certificate".into(),
            ));
        }
        for entry in &cfg.pki.blocklist {
            match Fingerprint::from_hex(entry) {
                Some(fp) => pool.block(fp),
                None => {
                    return Err(ConfigError::BadValue {
                        key: "pki.blocklist",
                        problem: format!("bad fingerprint {entry:?}"),
                    })
                }
            }
        }
        let firewall = Firewall::new(build_rules(&cfg.firewall, &cert)?);
        firewall.set_timeouts(cfg.firewall.conntrack.timeouts());

        let now = Instant::now();
        Ok(Node {
            cipher: cfg.cipher,
            curve: dh_key.curve(),
            local_cert: RwLock::new(Arc::new(cert)),
            dh_key,
            overlay_ip,
            pool: RwLock::new(Arc::new(pool)),
            firewall,
            hostmap: HostMap::new(),
            handshakes: HandshakeManager::new(cfg.handshakes.clone(), now),
            conn_manager: ConnectionManager::new(cfg.tunnels.clone(), now),
            relays: RelayManager::new(cfg.relay.clone()),
            lighthouse,
            queries: QueryChannel::new(cfg.handshakes.query_buffer),
            outside,
            inside,
            recv_error_policy: RwLock::new(cfg.listen.send_recv_error),
            disconnect_invalid: AtomicBool::new(cfg.pki.disconnect_invalid),
            rebind_gen: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            ticks: AtomicU64::new(0),
            reload_lock: Mutex::new(()),
            stats: NodeStats::default(),
        })
    }

    /// Our primary overlay address.
    pub fn overlay_ip(&self) -> Ipv4Addr {
        self.overlay_ip
    }
    /// The network cipher.
    pub fn cipher(&self) -> CipherKind {
        self.cipher
    }
    /// The identity curve suite.
    pub(crate) fn curve(&self) -> Curve {
        self.curve
    }
    /// Our static keypair.
    pub(crate) fn dh_keypair(&self) -> &DhKeypair {
        &self.dh_key
    }
    /// Our certificate.
    pub fn local_cert(&self) -> Arc<Certificate> {
        Arc::clone(&self.local_cert.read().expect("local_cert poisoned"))
    }
    /// The CA pool.
    pub fn ca_pool(&self) -> Arc<CaPool> {
        Arc::clone(&self.pool.read().expect("pool poisoned"))
    }
    /// The host map.
    pub fn hostmap(&self) -> &HostMap {
        &self.hostmap
    }
    /// The firewall.
    pub fn firewall(&self) -> &Firewall {
        &self.firewall
    }
    /// Engine counters.
    pub fn stats(&self) -> &NodeStats {
        &self.stats
    }
    /// The handshake manager.
    pub(crate) fn handshakes(&self) -> &HandshakeManager {
        &self.handshakes
    }
    /// The relay manager.
    pub(crate) fn relays(&self) -> &RelayManager {
        &self.relays
    }
    /// The discovery hooks.
    pub(crate) fn lighthouse(&self) -> &dyn LighthouseHandle {
        &*self.lighthouse
    }
    /// Whether expired peer certificates evict their tunnels.
    pub(crate) fn disconnect_invalid(&self) -> bool {
        self.disconnect_invalid.load(Ordering::Relaxed)
    }
    /// Whether the engine has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Relaxed)
    }

    /// The current rebind generation.
    pub(crate) fn rebind_generation(&self) -> u64 {
        self.rebind_gen.load(Ordering::Relaxed)
    }
    /// Note that the local UDP endpoint changed; tunnels will punch anew.
    pub fn notify_rebind(&self) {
        self.rebind_gen.fetch_add(1, Ordering::Relaxed);
    }

    /// Is `cert` on the blocklist?
    pub(crate) fn is_blocklisted(&self, cert: &Certificate) -> bool {
        self.ca_pool().is_blocklisted(cert)
    }

    /// Feed a learned candidate endpoint for `ip` (static host map entry
    /// or lighthouse response).
    pub fn add_candidate(&self, ip: Ipv4Addr, addr: SocketAddr, now: Instant) {
        if let Some(host) = self
            .hostmap
            .lookup_main(ip)
            .or_else(|| self.hostmap.lookup_pending(ip))
        {
            host.add_candidate(addr);
        } else {
            let host = self.hostmap.add_pending(ip, now);
            host.add_candidate(addr);
        }
    }

    /// Request a handshake to `ip` on the next tick.
    pub fn trigger_handshake(&self, ip: Ipv4Addr) {
        self.handshakes.trigger(ip);
    }

    /// Ask `relay_ip` to carry our traffic to `target`.
    pub fn request_relay(&self, relay_ip: Ipv4Addr, target: Ipv4Addr) -> Result<(), Error> {
        self.relays.request_relay(self, relay_ip, target)
    }

    /// Timer entry point; call at roughly 100 ms cadence.
    pub fn timer_tick(&self, now: Instant) {
        if self.is_closed() {
            return;
        }
        self.handshakes.tick(self, now);
        self.conn_manager.tick(self, now);
        for ip in self.queries.drain() {
            self.lighthouse.query(ip);
        }
        // The heavier sweeps run on a coarse cadence.
        if self.ticks.fetch_add(1, Ordering::Relaxed) % 50 == 0 {
            self.firewall.purge_expired(now);
            self.reap_stale_pending(now);
        }
    }

    /// Delete half-open entries that no handshake owns any more
    /// (displaced by a concurrent exchange, or seeded by discovery and
    /// never dialed).
    fn reap_stale_pending(&self, now: Instant) {
        /// How long an ownerless pending entry may linger.
        const PENDING_LIFETIME: std::time::Duration = std::time::Duration::from_secs(30);
        for host in self.hostmap.snapshot() {
            if !host.is_established()
                && now.duration_since(host.created()) >= PENDING_LIFETIME
                && !self.handshakes.has_pending(host.overlay_ip())
            {
                if let Some(host) = self.hostmap.delete(host.local_index()) {
                    self.stats.count_outbox_drop(host.drain_outbox().len());
                }
            }
        }
    }

    /// Shut the engine down: notify every established peer and drop all
    /// tunnel state.  Idempotent.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        info!("engine closing");
        for host in self.hostmap.snapshot() {
            if host.is_established() {
                self.send_close(&host);
            }
            self.handshakes.abandon(host.overlay_ip());
            self.hostmap.delete(host.local_index());
        }
    }

    /// Atomically apply reloadable configuration: firewall rules and
    /// timeouts, recv-error policy, `disconnect_invalid`, and (when
    /// `new_pool` is given) the PKI.
    ///
    /// Readers observe either the old or the new state of each piece;
    /// the single reload lock keeps concurrent reloads ordered.
    pub fn reload(&self, cfg: &NodeConfig, new_pool: Option<CaPool>) -> Result<(), ConfigError> {
        let _guard = self.reload_lock.lock().expect("reload lock poisoned");
        let cert = self.local_cert();
        let rules = build_rules(&cfg.firewall, &cert)?;
        let mut pool = new_pool;
        if let Some(pool) = pool.as_mut() {
            for entry in &cfg.pki.blocklist {
                match Fingerprint::from_hex(entry) {
                    Some(fp) => pool.block(fp),
                    None => {
                        return Err(ConfigError::BadValue {
                            key: "pki.blocklist",
                            problem: format!("bad fingerprint {entry:?}"),
                        })
                    }
                }
            }
        }
        self.firewall.reload(rules);
        self.firewall.set_timeouts(cfg.firewall.conntrack.timeouts());
        *self
            .recv_error_policy
            .write()
            .expect("recv_error_policy poisoned") = cfg.listen.send_recv_error;
        self.disconnect_invalid
            .store(cfg.pki.disconnect_invalid, Ordering::Relaxed);
        if let Some(pool) = pool {
            *self.pool.write().expect("pool poisoned") = Arc::new(pool);
        }
        info!("configuration reloaded");
        Ok(())
    }

    // ---- internal plumbing used by the managers ----

    /// Transmit a raw datagram.
    pub(crate) fn send_outside(&self, addr: SocketAddr, packet: &[u8]) {
        self.outside.send_to(addr, packet);
    }

    /// Deliver a cleartext frame inside.
    pub(crate) fn write_inside(&self, frame: &[u8]) {
        self.inside.write_frame(frame);
    }

    /// An established or pending entry for `ip`, without creating one.
    pub(crate) fn lookup_any_host(&self, ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        self.hostmap
            .lookup_main(ip)
            .or_else(|| self.hostmap.lookup_pending(ip))
    }

    /// Stage a lighthouse lookup.
    pub(crate) fn queue_lighthouse_query(&self, ip: Ipv4Addr) {
        self.queries.push(ip);
    }

    /// Route a fully-framed packet toward `host`: directly, or wrapped
    /// for its relay.  Returns false if no path exists yet.
    pub(crate) fn send_raw_to_host(&self, host: &HostInfo, packet: &[u8]) -> bool {
        if let Some(via) = host.via_relay() {
            let Some(relay_host) = self.hostmap.lookup_main(via.relay_ip) else {
                return false;
            };
            let Some(addr) = relay_host.remote_addr() else {
                return false;
            };
            let header = Header::new(PacketType::RELAY, 0, via.relay_index, 0);
            let mut wrapped = header.encode().to_vec();
            wrapped.extend_from_slice(packet);
            self.send_outside(addr, &wrapped);
            return true;
        }
        let addr = host
            .remote_addr()
            .or_else(|| host.candidates().first().copied());
        match addr {
            Some(addr) => {
                self.send_outside(addr, packet);
                true
            }
            None => false,
        }
    }

    /// Seal `plaintext` into a packet of `typ` on `host`'s tunnel and
    /// send it.
    pub(crate) fn seal_and_send(
        &self,
        host: &HostInfo,
        typ: PacketType,
        subtype: u8,
        plaintext: &[u8],
    ) -> Result<(), Error> {
        let tunnel = host.tunnel().ok_or(Error::NoTunnel(host.overlay_ip()))?;
        let remote_index = host
            .remote_index()
            .ok_or(Error::Internal("established tunnel without remote index"))?;
        let counter = tunnel.next_counter()?;
        let header = Header::new(typ, subtype, remote_index, counter);
        let header_bytes = header.encode();
        let sealed = tunnel.seal(counter, &header_bytes, plaintext);
        let mut packet = header_bytes.to_vec();
        packet.extend_from_slice(&sealed);
        if !self.send_raw_to_host(host, &packet) {
            return Err(Error::NoTunnel(host.overlay_ip()));
        }
        host.record_out();
        Ok(())
    }

    /// Send a liveness probe.
    pub(crate) fn send_probe(&self, host: &HostInfo, subtype: TestSubtype) {
        if let Err(e) = self.seal_and_send(host, PacketType::TEST, subtype.into(), &[]) {
            debug!(peer = %host.overlay_ip(), error = %e, "probe not sent");
        }
    }

    /// Send an authenticated close notice.
    pub(crate) fn send_close(&self, host: &HostInfo) {
        if let Err(e) = self.seal_and_send(host, PacketType::CLOSE_TUNNEL, 0, &[]) {
            debug!(peer = %host.overlay_ip(), error = %e, "close notice not sent");
        }
    }

    /// Send a relay control message over `host`'s tunnel.
    pub(crate) fn send_relay_control(
        &self,
        host: &HostInfo,
        msg: &RelayControl,
    ) -> Result<(), Error> {
        self.seal_and_send(
            host,
            PacketType::RELAY_CONTROL,
            0,
            &msg.encode_to_vec(),
        )
    }

    /// Answer an unknown index, if policy permits.
    pub(crate) fn send_recv_error(&self, src: SocketAddr, index: u32) {
        let policy = *self
            .recv_error_policy
            .read()
            .expect("recv_error_policy poisoned");
        if !policy.permits(src) {
            return;
        }
        let header = Header::new(PacketType::RECV_ERROR, 0, index, 0);
        self.send_outside(src, &header.encode());
        self.stats.count_recv_error_sent();
    }

    /// Decode and fully verify a peer certificate presented in a
    /// handshake, binding it to the static key the peer used.
    pub(crate) fn verify_peer(
        &self,
        cert_blob: &[u8],
        peer_static: &[u8],
    ) -> Result<Certificate, Error> {
        let cert = Certificate::decode(cert_blob).map_err(Error::PeerCertificate)?;
        self.ca_pool()
            .verify(&cert, SystemTime::now())
            .map_err(Error::PeerCertificate)?;
        if cert.details().public_key() != peer_static {
            return Err(Error::Internal(
                "handshake static key does not match certificate",
            ));
        }
        Ok(cert)
    }

    /// Post-promotion bookkeeping: enroll with the connection manager and
    /// queue the supplanted tunnel (if any) for teardown.
    pub(crate) fn on_established(
        &self,
        host: &Arc<HostInfo>,
        evicted: Option<Arc<HostInfo>>,
        now: Instant,
    ) {
        self.conn_manager.register(self, host.local_index(), now);
        if let Some(old) = evicted {
            // The supplanted tunnel is reaped on its next liveness check;
            // carry any useful endpoint knowledge over first.
            for addr in old.candidates() {
                host.add_candidate(addr);
            }
            debug!(peer = %old.overlay_ip(), "tunnel supplanted by new handshake");
        }
        let cert = self.local_cert();
        if cert.expires_within(SystemTime::now(), std::time::Duration::from_secs(24 * 3600)) {
            warn!("local certificate expires within 24 hours");
        }
    }

    /// Push every staged frame through the now-established tunnel.
    pub(crate) fn flush_outbox(&self, host: &Arc<HostInfo>, now: Instant) {
        for frame in host.drain_outbox() {
            self.send_frame_to_established(host, &frame, now);
        }
    }

    /// Evict a tunnel on behalf of dispatch (close notice already
    /// received, or index invalidated).
    pub(crate) fn evict_tunnel(&self, local_index: u32, now: Instant) {
        self.conn_manager.evict(self, local_index, false, now);
    }
}

/// Compile the firewall section of the configuration.
fn build_rules(cfg: &FirewallConfig, cert: &Certificate) -> Result<Rules, ConfigError> {
    let mut builder = Rules::builder()
        .inbound_action(cfg.inbound_action)
        .outbound_action(cfg.outbound_action);
    if !cfg.default_local_cidr_any && !cert.details().subnets().is_empty() {
        if let Some(ip) = cert.details().primary_ip() {
            let host_net = ipnet::Ipv4Net::new(ip, 32).expect("a /32 is always valid");
            builder = builder.default_local_cidr(host_net);
        }
    }
    for rule in &cfg.inbound {
        builder = builder.inbound(rule.compile("firewall.inbound")?);
    }
    for rule in &cfg.outbound {
        builder = builder.outbound(rule.compile("firewall.outbound")?);
    }
    Ok(builder.build())
}
