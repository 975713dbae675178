//! A fixed-resolution timer wheel.
//!
//! Two of these drive the engine: a 100 ms wheel for handshake
//! retransmission and a 1 s wheel for established-tunnel maintenance.  A
//! wheel is preferred over a priority queue because cancellation is free
//! (stale entries are discarded when they fire) and advancing is O(slots
//! traversed), independent of how many timers are pending.

use std::time::{Duration, Instant};

/// A ring of slots, each holding the items due in that tick.
pub(crate) struct TimerWheel<T> {
    /// The slots.
    slots: Vec<Vec<T>>,
    /// Duration of one tick.
    tick: Duration,
    /// Index of the slot `cursor_time` falls in.
    cursor: usize,
    /// The wheel-time corresponding to `cursor`.
    cursor_time: Instant,
}

impl<T> TimerWheel<T> {
    /// Create a wheel of `slots` ticks of `tick` each, starting at `now`.
    ///
    /// The wheel spans `slots * tick`; a delay beyond that is clamped to
    /// the furthest slot (the consumer re-schedules if it fired early).
    pub(crate) fn new(tick: Duration, slots: usize, now: Instant) -> Self {
        assert!(slots >= 2, "a wheel needs at least two slots");
        TimerWheel {
            slots: (0..slots).map(|_| Vec::new()).collect(),
            tick,
            cursor: 0,
            cursor_time: now,
        }
    }

    /// Schedule `item` to fire `delay` from now.
    pub(crate) fn schedule(&mut self, item: T, delay: Duration) {
        let ticks = delay.as_nanos().div_ceil(self.tick.as_nanos()).max(1);
        let ticks = (ticks as usize).min(self.slots.len() - 1);
        let slot = (self.cursor + ticks) % self.slots.len();
        self.slots[slot].push(item);
    }

    /// Advance the wheel to `now`, appending every due item to `fired`.
    pub(crate) fn advance(&mut self, now: Instant, fired: &mut Vec<T>) {
        while now.duration_since(self.cursor_time) >= self.tick {
            self.cursor_time += self.tick;
            self.cursor = (self.cursor + 1) % self.slots.len();
            fired.append(&mut self.slots[self.cursor]);
        }
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

    #[test]
    fn fires_in_order() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(Duration::from_millis(100), 64, start);
        wheel.schedule("b", Duration::from_millis(250));
        wheel.schedule("a", Duration::from_millis(100));

        let mut fired = Vec::new();
        wheel.advance(start + Duration::from_millis(100), &mut fired);
        assert_eq!(fired, vec!["a"]);

        fired.clear();
        wheel.advance(start + Duration::from_millis(299), &mut fired);
        assert!(fired.is_empty());

        wheel.advance(start + Duration::from_millis(300), &mut fired);
        assert_eq!(fired, vec!["b"]);
    }

    #[test]
    fn zero_delay_fires_next_tick() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(Duration::from_millis(100), 8, start);
        wheel.schedule(1, Duration::ZERO);
        let mut fired = Vec::new();
        wheel.advance(start, &mut fired);
        assert!(fired.is_empty());
        wheel.advance(start + Duration::from_millis(100), &mut fired);
        assert_eq!(fired, vec![1]);
    }

    #[test]
    fn long_delay_clamps_to_span() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(Duration::from_millis(100), 4, start);
        wheel.schedule("far", Duration::from_secs(60));
        let mut fired = Vec::new();
        wheel.advance(start + Duration::from_millis(300), &mut fired);
        assert_eq!(fired, vec!["far"]);
    }

    #[test]
    fn catches_up_over_a_long_gap() {
        let start = Instant::now();
        let mut wheel = TimerWheel::new(Duration::from_millis(100), 8, start);
        wheel.schedule(1, Duration::from_millis(100));
        wheel.schedule(2, Duration::from_millis(500));
        let mut fired = Vec::new();
        // One big jump must fire both, once each.
        wheel.advance(start + Duration::from_secs(10), &mut fired);
        fired.sort_unstable();
        assert_eq!(fired, vec![1, 2]);
    }
}
