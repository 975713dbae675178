//! The engine's view of the lighthouse subsystem.
//!
//! Discovery itself (the wire protocol, the lighthouse role) lives
//! outside the engine; this module defines the handle the engine calls
//! into, plus the bounded channel that keeps a burst of address lookups
//! from ballooning.

use std::collections::VecDeque;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use tracing::debug;

/// Hooks the engine calls toward the lighthouse subsystem.
pub trait LighthouseHandle: Send + Sync {
    /// Ask where `ip` is reachable right now.  Learned endpoints come
    /// back through [`crate::Node::add_candidate`].
    fn query(&self, ip: Ipv4Addr);
    /// Ask the lighthouse to nudge `ip` into punching toward us again
    /// (after our local endpoint rebound).
    fn punch_notify(&self, ip: Ipv4Addr);
    /// An inbound `LIGHTHOUSE` packet, verbatim payload.
    fn handle_packet(&self, src: SocketAddr, payload: &[u8]);
}

/// A lighthouse that answers nothing.  Useful standalone and in tests.
#[derive(Debug, Default, Clone, Copy)]
#[allow(clippy::exhaustive_structs)]
pub struct NoopLighthouse;

impl LighthouseHandle for NoopLighthouse {
    fn query(&self, _ip: Ipv4Addr) {}
    fn punch_notify(&self, _ip: Ipv4Addr) {}
    fn handle_packet(&self, _src: SocketAddr, _payload: &[u8]) {}
}

/// Bounded queue of addresses awaiting a lighthouse lookup.
///
/// Queries are staged here on the packet path and drained by the timer
/// thread, so a worker never blocks on discovery.
pub(crate) struct QueryChannel {
    /// Staged lookups.
    queue: Mutex<VecDeque<Ipv4Addr>>,
    /// Capacity; pushes beyond it are dropped and counted.
    capacity: usize,
    /// Lookups dropped due to a full queue.
    dropped: AtomicU64,
}

impl QueryChannel {
    /// Create a channel holding at most `capacity` queries.
    pub(crate) fn new(capacity: usize) -> Self {
        QueryChannel {
            queue: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    /// Stage a lookup, deduplicating against what is already queued.
    pub(crate) fn push(&self, ip: Ipv4Addr) {
        let mut q = self.queue.lock().expect("query channel poisoned");
        if q.contains(&ip) {
            return;
        }
        if q.len() >= self.capacity {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            debug!(%ip, "lighthouse query queue full; lookup dropped");
            return;
        }
        q.push_back(ip);
    }

    /// Drain every staged lookup.
    pub(crate) fn drain(&self) -> Vec<Ipv4Addr> {
        self.queue
            .lock()
            .expect("query channel poisoned")
            .drain(..)
            .collect()
    }

    /// Lookups dropped so far.
    pub(crate) fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}
