//! The host map: every active and half-open tunnel, indexed three ways.
//!
//! HostInfos are owned by one arena keyed on `local_index`; the overlay-IP
//! and remote-index maps hold only the index, and every other component
//! carries the bare `u32`, re-resolving under the map's lock.  That keeps
//! the reference graph acyclic: nothing inside a HostInfo points back at
//! the managers that drive it.

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Instant;

use smallvec::SmallVec;
use tracing::{debug, info};

use nebula_cert::Certificate;
use nebula_proto::CryptoTunnel;

/// Cap on frames buffered while a handshake is in flight.
const OUTBOX_MAX_FRAMES: usize = 64;
/// Cap on total bytes buffered while a handshake is in flight.
const OUTBOX_MAX_BYTES: usize = 64 * 1024;

/// Sentinel for "the peer has not told us its index yet".
const REMOTE_INDEX_UNKNOWN: u64 = u64::MAX;

/// Traffic destined for a peer we are still handshaking with.
#[derive(Debug, Default)]
struct Outbox {
    /// The staged inside frames.
    frames: VecDeque<Vec<u8>>,
    /// Total bytes across `frames`.
    bytes: usize,
    /// Frames refused because the box was full.
    dropped: u64,
}

/// How a peer is reached: directly, or through a relay.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[allow(clippy::exhaustive_structs)]
pub struct ViaRelay {
    /// Overlay address of the relay carrying this tunnel.
    pub relay_ip: Ipv4Addr,
    /// The relay's index for this pairing, stamped on relayed frames.
    pub relay_index: u32,
}

/// Per-peer tunnel state.
///
/// Everything mutable is behind its own small lock or an atomic, so a
/// `HostInfo` can be shared freely across worker threads once out of the
/// map's lock.
pub struct HostInfo {
    /// The peer's primary overlay address.
    overlay_ip: Ipv4Addr,
    /// Our index for this tunnel; unique node-wide, never reused while
    /// this HostInfo lives.
    local_index: u32,
    /// The peer's index for this tunnel, once learned.
    remote_index: AtomicU64,
    /// Current remote UDP endpoint.
    remote_addr: Mutex<Option<SocketAddr>>,
    /// Candidate endpoints, preferred first: static entries, then
    /// lighthouse-learned, then calculated.
    candidates: Mutex<SmallVec<[SocketAddr; 4]>>,
    /// AEAD state; empty while the handshake is in flight.
    tunnel: OnceLock<Arc<CryptoTunnel>>,
    /// The peer's verified certificate; empty while pending.
    cert: OnceLock<Arc<Certificate>>,
    /// Firewall rules version when this tunnel was installed.
    rules_version: AtomicU32,
    /// Packets received over this tunnel.
    packets_in: AtomicU64,
    /// Packets sent over this tunnel.
    packets_out: AtomicU64,
    /// Frames awaiting handshake completion.
    outbox: Mutex<Outbox>,
    /// Relay path, when the peer is unreachable directly.
    via_relay: Mutex<Option<ViaRelay>>,
    /// When the remote endpoint last changed on an established tunnel.
    last_roam: Mutex<Option<Instant>>,
    /// When this HostInfo was created.
    created: Instant,
}

impl fmt::Debug for HostInfo {
    // CryptoTunnel/AeadCipher deliberately don't implement Debug (they
    // hold raw AEAD key material), so this reports identity and
    // established-ness only rather than deriving.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HostInfo")
            .field("overlay_ip", &self.overlay_ip)
            .field("local_index", &self.local_index)
            .field("remote_index", &self.remote_index())
            .field("remote_addr", &self.remote_addr)
            .field("established", &self.tunnel.get().is_some())
            .finish()
    }
}

impl HostInfo {
    /// Build a fresh, pending HostInfo.
    fn new(overlay_ip: Ipv4Addr, local_index: u32, now: Instant) -> Self {
        HostInfo {
            overlay_ip,
            local_index,
            remote_index: AtomicU64::new(REMOTE_INDEX_UNKNOWN),
            remote_addr: Mutex::new(None),
            candidates: Mutex::new(SmallVec::new()),
            tunnel: OnceLock::new(),
            cert: OnceLock::new(),
            rules_version: AtomicU32::new(0),
            packets_in: AtomicU64::new(0),
            packets_out: AtomicU64::new(0),
            outbox: Mutex::new(Outbox::default()),
            via_relay: Mutex::new(None),
            last_roam: Mutex::new(None),
            created: now,
        }
    }

    /// The peer's primary overlay address.
    pub fn overlay_ip(&self) -> Ipv4Addr {
        self.overlay_ip
    }
    /// Our index for this tunnel.
    pub fn local_index(&self) -> u32 {
        self.local_index
    }
    /// The peer's index, if known.
    pub fn remote_index(&self) -> Option<u32> {
        match self.remote_index.load(Ordering::Acquire) {
            REMOTE_INDEX_UNKNOWN => None,
            v => Some(v as u32),
        }
    }
    /// Record the peer's index.
    pub(crate) fn set_remote_index(&self, index: u32) {
        self.remote_index.store(u64::from(index), Ordering::Release);
    }

    /// True once the handshake has completed.
    pub fn is_established(&self) -> bool {
        self.tunnel.get().is_some()
    }
    /// The AEAD state, if established.
    pub fn tunnel(&self) -> Option<&Arc<CryptoTunnel>> {
        self.tunnel.get()
    }
    /// The peer's verified certificate, if established.
    pub fn cert(&self) -> Option<&Arc<Certificate>> {
        self.cert.get()
    }
    /// Rules version stamped at installation.
    pub fn rules_version(&self) -> u32 {
        self.rules_version.load(Ordering::Relaxed)
    }

    /// The current remote endpoint.
    pub fn remote_addr(&self) -> Option<SocketAddr> {
        *self.remote_addr.lock().expect("remote_addr poisoned")
    }

    /// Record the endpoint a packet actually came from.  On an
    /// established tunnel a change is a roam and is logged.
    pub fn set_remote_addr(&self, addr: SocketAddr, now: Instant) {
        let mut slot = self.remote_addr.lock().expect("remote_addr poisoned");
        match *slot {
            Some(old) if old == addr => {}
            Some(old) => {
                info!(peer = %self.overlay_ip, %old, new = %addr, "tunnel roamed");
                *slot = Some(addr);
                *self.last_roam.lock().expect("last_roam poisoned") = Some(now);
            }
            None => *slot = Some(addr),
        }
    }

    /// When the tunnel last roamed.
    pub fn last_roam(&self) -> Option<Instant> {
        *self.last_roam.lock().expect("last_roam poisoned")
    }

    /// Add a candidate endpoint, deduplicating.
    pub fn add_candidate(&self, addr: SocketAddr) {
        let mut c = self.candidates.lock().expect("candidates poisoned");
        if !c.contains(&addr) {
            c.push(addr);
        }
    }
    /// Snapshot the candidate endpoints.
    pub fn candidates(&self) -> Vec<SocketAddr> {
        self.candidates
            .lock()
            .expect("candidates poisoned")
            .to_vec()
    }

    /// The relay path, if traffic rides one.
    pub fn via_relay(&self) -> Option<ViaRelay> {
        *self.via_relay.lock().expect("via_relay poisoned")
    }
    /// Set or clear the relay path.
    pub fn set_via_relay(&self, via: Option<ViaRelay>) {
        *self.via_relay.lock().expect("via_relay poisoned") = via;
    }

    /// Count one received packet.
    pub fn record_in(&self) {
        self.packets_in.fetch_add(1, Ordering::Relaxed);
    }
    /// Count one sent packet.
    pub fn record_out(&self) {
        self.packets_out.fetch_add(1, Ordering::Relaxed);
    }
    /// Packets received so far.
    pub fn packets_in(&self) -> u64 {
        self.packets_in.load(Ordering::Relaxed)
    }
    /// Packets sent so far.
    pub fn packets_out(&self) -> u64 {
        self.packets_out.load(Ordering::Relaxed)
    }
    /// When this HostInfo was created.
    pub fn created(&self) -> Instant {
        self.created
    }

    /// Stage an inside frame until the handshake completes.  Returns
    /// false (and counts) when the outbox is full.
    pub fn queue_frame(&self, frame: &[u8]) -> bool {
        let mut outbox = self.outbox.lock().expect("outbox poisoned");
        if outbox.frames.len() >= OUTBOX_MAX_FRAMES
            || outbox.bytes + frame.len() > OUTBOX_MAX_BYTES
        {
            outbox.dropped += 1;
            debug!(peer = %self.overlay_ip, "outbox full; frame dropped");
            return false;
        }
        outbox.bytes += frame.len();
        outbox.frames.push_back(frame.to_vec());
        true
    }

    /// Take every staged frame.
    pub fn drain_outbox(&self) -> Vec<Vec<u8>> {
        let mut outbox = self.outbox.lock().expect("outbox poisoned");
        outbox.bytes = 0;
        outbox.frames.drain(..).collect()
    }

    /// Frames dropped because the outbox was full.
    pub fn outbox_dropped(&self) -> u64 {
        self.outbox.lock().expect("outbox poisoned").dropped
    }

    /// Install the results of a completed handshake.  Single-shot.
    fn establish(&self, cert: Arc<Certificate>, tunnel: Arc<CryptoTunnel>, rules_version: u32) {
        self.rules_version.store(rules_version, Ordering::Relaxed);
        let _ = self.cert.set(cert);
        let _ = self.tunnel.set(tunnel);
    }
}

/// What [`HostMap::promote`] decided.
#[derive(Debug)]
#[non_exhaustive]
pub enum PromoteOutcome {
    /// The tunnel is now the main entry for its overlay IP.
    Installed {
        /// The entry it displaced, scheduled by the caller for teardown.
        evicted: Option<Arc<HostInfo>>,
    },
    /// The race tie-break kept the existing tunnel; this one was
    /// discarded.
    Superseded,
}

/// Inner state of the host map, under one lock.
#[derive(Default)]
struct Inner {
    /// Arena: every live HostInfo, pending or main, by local index.
    hosts: HashMap<u32, Arc<HostInfo>>,
    /// Established tunnels by the peer's primary overlay IP.
    main_by_ip: HashMap<Ipv4Addr, u32>,
    /// Handshakes in progress by the peer's primary overlay IP.
    pending_by_ip: HashMap<Ipv4Addr, u32>,
    /// Peer-assigned indices, for inbound demultiplexing.
    by_remote_index: HashMap<u32, u32>,
}

impl Inner {
    /// Debug-build check of the cross-index invariants.
    fn check_invariants(&self) {
        if cfg!(debug_assertions) {
            for idx in self.main_by_ip.values().chain(self.pending_by_ip.values()) {
                debug_assert!(self.hosts.contains_key(idx), "ip index not in arena");
            }
            for (remote, local) in &self.by_remote_index {
                let host = self.hosts.get(local).expect("remote index not in arena");
                debug_assert_eq!(host.remote_index(), Some(*remote));
            }
        }
    }
}

/// The three-way index over every tunnel on this node.
///
/// One read-write lock guards all indices; it is held only for map
/// operations, never across crypto, I/O, or another component's lock.
#[derive(Default)]
pub struct HostMap {
    /// The indices.
    inner: RwLock<Inner>,
}

impl HostMap {
    /// Create an empty map.
    pub fn new() -> Self {
        HostMap::default()
    }

    /// Fetch or create the pending entry for `ip`, allocating a unique
    /// local index for a new one.
    pub fn add_pending(&self, ip: Ipv4Addr, now: Instant) -> Arc<HostInfo> {
        let mut inner = self.inner.write().expect("hostmap poisoned");
        if let Some(idx) = inner.pending_by_ip.get(&ip) {
            return Arc::clone(&inner.hosts[idx]);
        }
        Self::insert_pending(&mut inner, ip, now)
    }

    /// Create a pending entry for `ip` unconditionally.
    ///
    /// Used on the responder path of a handshake: if we are also
    /// initiating toward the same peer, the two exchanges must not share
    /// one HostInfo, or the loser's keys would silently vanish.  Any
    /// displaced pending entry stays in the arena, reachable by its index,
    /// until its own handshake completes or fails.
    pub fn new_pending(&self, ip: Ipv4Addr, now: Instant) -> Arc<HostInfo> {
        let mut inner = self.inner.write().expect("hostmap poisoned");
        Self::insert_pending(&mut inner, ip, now)
    }

    /// Allocate an index and insert a fresh pending HostInfo.
    fn insert_pending(inner: &mut Inner, ip: Ipv4Addr, now: Instant) -> Arc<HostInfo> {
        let local_index = loop {
            let candidate: u32 = rand::random();
            if candidate != 0 && !inner.hosts.contains_key(&candidate) {
                break candidate;
            }
        };
        let host = Arc::new(HostInfo::new(ip, local_index, now));
        inner.hosts.insert(local_index, Arc::clone(&host));
        inner.pending_by_ip.insert(ip, local_index);
        inner.check_invariants();
        host
    }

    /// Promote a pending tunnel to main after its handshake completes.
    ///
    /// Duplicate suppression: if a main entry already exists for the same
    /// overlay IP, the new tunnel replaces it -- unless the peer
    /// certificate fingerprint and remote endpoint are identical and the
    /// new local index is numerically lower, in which case the new tunnel
    /// is discarded.  Both sides apply the same rule, so a simultaneous
    /// handshake converges on one tunnel instead of replacing forever.
    pub fn promote(
        &self,
        local_index: u32,
        remote_index: u32,
        cert: Arc<Certificate>,
        tunnel: Arc<CryptoTunnel>,
        rules_version: u32,
    ) -> PromoteOutcome {
        let mut inner = self.inner.write().expect("hostmap poisoned");
        let Some(host) = inner.hosts.get(&local_index).map(Arc::clone) else {
            return PromoteOutcome::Superseded;
        };
        let ip = host.overlay_ip();

        let mut evicted = None;
        if let Some(&old_idx) = inner.main_by_ip.get(&ip) {
            if old_idx == local_index {
                // Re-promotion of the entry already installed; nothing to
                // displace.
            } else if let Some(old) = inner.hosts.get(&old_idx).map(Arc::clone) {
                let same_peer = old.cert().map(|c| c.fingerprint())
                    == Some(cert.fingerprint())
                    && old.remote_addr() == host.remote_addr();
                if same_peer && local_index < old_idx {
                    // Keep the existing tunnel; drop the newcomer.
                    if inner.pending_by_ip.get(&ip) == Some(&local_index) {
                        inner.pending_by_ip.remove(&ip);
                    }
                    inner.hosts.remove(&local_index);
                    inner.check_invariants();
                    debug!(peer = %ip, "handshake race: kept existing tunnel");
                    return PromoteOutcome::Superseded;
                }
                inner.main_by_ip.remove(&ip);
                if let Some(r) = old.remote_index() {
                    inner.by_remote_index.remove(&r);
                }
                evicted = Some(old);
            }
        }

        host.set_remote_index(remote_index);
        host.establish(cert, tunnel, rules_version);
        if inner.pending_by_ip.get(&ip) == Some(&local_index) {
            inner.pending_by_ip.remove(&ip);
        }
        inner.main_by_ip.insert(ip, local_index);
        inner.by_remote_index.insert(remote_index, local_index);
        inner.check_invariants();
        info!(peer = %ip, local_index, "tunnel established");
        PromoteOutcome::Installed { evicted }
    }

    /// The established tunnel for `ip`.
    pub fn lookup_main(&self, ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap poisoned");
        inner
            .main_by_ip
            .get(&ip)
            .map(|idx| Arc::clone(&inner.hosts[idx]))
    }

    /// The pending entry for `ip`.
    pub fn lookup_pending(&self, ip: Ipv4Addr) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap poisoned");
        inner
            .pending_by_ip
            .get(&ip)
            .map(|idx| Arc::clone(&inner.hosts[idx]))
    }

    /// Any entry (pending or main) by our index.
    pub fn by_local_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap poisoned");
        inner.hosts.get(&index).map(Arc::clone)
    }

    /// The entry whose peer assigned `index`.
    pub fn by_remote_index(&self, index: u32) -> Option<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap poisoned");
        inner
            .by_remote_index
            .get(&index)
            .map(|idx| Arc::clone(&inner.hosts[idx]))
    }

    /// Remove an entry from every index, returning it.
    pub fn delete(&self, local_index: u32) -> Option<Arc<HostInfo>> {
        let mut inner = self.inner.write().expect("hostmap poisoned");
        let host = inner.hosts.remove(&local_index)?;
        let ip = host.overlay_ip();
        if inner.main_by_ip.get(&ip) == Some(&local_index) {
            inner.main_by_ip.remove(&ip);
        }
        if inner.pending_by_ip.get(&ip) == Some(&local_index) {
            inner.pending_by_ip.remove(&ip);
        }
        if let Some(r) = host.remote_index() {
            if inner.by_remote_index.get(&r) == Some(&local_index) {
                inner.by_remote_index.remove(&r);
            }
        }
        inner.check_invariants();
        Some(host)
    }

    /// Every live entry, pending and main.
    pub fn snapshot(&self) -> Vec<Arc<HostInfo>> {
        let inner = self.inner.read().expect("hostmap poisoned");
        inner.hosts.values().map(Arc::clone).collect()
    }

    /// Number of established tunnels.
    pub fn main_len(&self) -> usize {
        self.inner.read().expect("hostmap poisoned").main_by_ip.len()
    }

    /// Number of pending handshakes.
    pub fn pending_len(&self) -> usize {
        self.inner
            .read()
            .expect("hostmap poisoned")
            .pending_by_ip
            .len()
    }

    /// Size of the arena (pending plus main).
    pub fn len(&self) -> usize {
        self.inner.read().expect("hostmap poisoned").hosts.len()
    }

    /// True when no tunnels exist at all.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
