//! Wrap-aware TCP sequence arithmetic and the per-connection sequence set
//! (§4.4 "Sequence arithmetic", §3 "TCP sequence set").
//!
//! Comparisons are genuine modular arithmetic on `u32` rooted at a base (the
//! ISN), via wrapping subtraction — not a fixed-width signed-difference
//! trick, which degrades near the wheel's edges (see `DESIGN.md` for why the
//! historical source's formula is not replicated here).

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

/// `lessThan(a, b, base) <=> (a - base) mod 2^32 < (b - base) mod 2^32`.
pub fn less_than(a: u32, b: u32, base: u32) -> bool {
    a.wrapping_sub(base) < b.wrapping_sub(base)
}

pub fn greater_than(a: u32, b: u32, base: u32) -> bool {
    less_than(b, a, base)
}

pub fn equal_to(a: u32, b: u32) -> bool {
    a == b
}

/// A coarse, process-global increasing counter for initial sequence numbers,
/// ticking roughly every few microseconds so successive connections do not
/// collide. Deterministic tests construct a `SequenceSet` directly with a
/// fixed ISN instead of drawing from this generator.
pub struct IsnGenerator {
    counter: AtomicU32,
}

impl IsnGenerator {
    pub fn new() -> Self {
        Self { counter: AtomicU32::new(0) }
    }

    pub fn next(&self) -> u32 {
        let now = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default();
        let ticks = (now.as_micros() / 4) as u32;
        self.counter.fetch_add(ticks.wrapping_add(1), Ordering::Relaxed)
    }
}

impl Default for IsnGenerator {
    fn default() -> Self {
        Self::new()
    }
}

/// `snd_isn, snd_una, snd_nxt, rcv_isn, rcv_nxt` (§3).
pub struct SequenceSet {
    pub snd_isn: u32,
    snd_una: AtomicU32,
    snd_nxt: AtomicU32,
    pub rcv_isn: AtomicU32,
    rcv_nxt: AtomicU32,
    /// Packs (snd_una, snd_nxt) changes behind one counter so waiters can
    /// detect "something advanced" without a separate condvar per field;
    /// the actual blocking waits live on the TCP worker's own CVs.
    _generation: AtomicU64,
}

impl SequenceSet {
    pub fn new(snd_isn: u32) -> Self {
        Self {
            snd_isn,
            snd_una: AtomicU32::new(snd_isn),
            snd_nxt: AtomicU32::new(snd_isn),
            rcv_isn: AtomicU32::new(0),
            rcv_nxt: AtomicU32::new(0),
            _generation: AtomicU64::new(0),
        }
    }

    pub fn snd_una(&self) -> u32 {
        self.snd_una.load(Ordering::SeqCst)
    }

    pub fn set_snd_una(&self, v: u32) {
        self.snd_una.store(v, Ordering::SeqCst);
    }

    pub fn snd_nxt(&self) -> u32 {
        self.snd_nxt.load(Ordering::SeqCst)
    }

    /// `allocateWithLen(n)`: returns `snd_nxt` and advances it by `n`.
    pub fn allocate_with_len(&self, n: u32) -> u32 {
        self.snd_nxt.fetch_add(n, Ordering::SeqCst)
    }

    pub fn rcv_isn(&self) -> u32 {
        self.rcv_isn.load(Ordering::SeqCst)
    }

    pub fn set_rcv_isn(&self, v: u32) {
        self.rcv_isn.store(v, Ordering::SeqCst);
        self.rcv_nxt.store(v, Ordering::SeqCst);
    }

    pub fn rcv_nxt(&self) -> u32 {
        self.rcv_nxt.load(Ordering::SeqCst)
    }

    pub fn set_rcv_nxt(&self, v: u32) {
        self.rcv_nxt.store(v, Ordering::SeqCst);
    }

    /// `sndAckWithLen(n)`: advances `rcv_nxt` by `n` and returns it.
    pub fn snd_ack_with_len(&self, n: u32) -> u32 {
        self.rcv_nxt.fetch_add(n, Ordering::SeqCst).wrapping_add(n)
    }

    pub fn snd_lt(&self, a: u32, b: u32) -> bool {
        less_than(a, b, self.snd_isn)
    }

    pub fn rcv_lt(&self, a: u32, b: u32) -> bool {
        less_than(a, b, self.rcv_isn())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn less_than_is_wrap_aware() {
        let base = u32::MAX - 10;
        assert!(less_than(base, base.wrapping_add(5), base));
        assert!(!less_than(base.wrapping_add(5), base, base));
    }

    #[test]
    fn less_than_forms_total_order_near_wheel_edge() {
        let base = 0u32;
        let a = u32::MAX;
        let b = a.wrapping_add(5); // wraps around to 4
        assert!(less_than(a, b, base));
    }

    #[test]
    fn allocate_with_len_advances_snd_nxt() {
        let seq = SequenceSet::new(1000);
        let first = seq.allocate_with_len(10);
        assert_eq!(first, 1000);
        assert_eq!(seq.snd_nxt(), 1010);
    }

    #[test]
    fn snd_ack_with_len_advances_rcv_nxt_and_returns_new_value() {
        let seq = SequenceSet::new(0);
        seq.set_rcv_isn(500);
        let ack = seq.snd_ack_with_len(20);
        assert_eq!(ack, 520);
        assert_eq!(seq.rcv_nxt(), 520);
    }
}
