//! Lock-free bounded MPMC (Multi-Producer, Multi-Consumer) ring buffer.
//!
//! # Design
//!
//! Sequence-per-slot ring in the style of Vyukov's bounded MPMC queue, the
//! same discipline used by crossbeam's `ArrayQueue` and DPDK's rte_ring.
//! Each slot carries a sequence counter; producers and consumers advance
//! independent monotonically increasing positions and claim slots with a
//! single CAS on their own position.
//!
//! # Key properties
//!
//! - **Wait-free on uncontended paths**: `try_push`/`try_pop` complete in a
//!   bounded number of steps unless another producer/consumer claims the
//!   same slot first, in which case the position is reloaded and retried.
//! - **Never consumes on failure**: `try_push` hands the value back in
//!   `Err(value)` when the ring is full. Callers retry or dispose; nothing
//!   is dropped silently.
//! - **Cache-line padded positions**: producer and consumer positions live
//!   on separate cache lines to prevent false sharing.
//! - **Power-of-2 capacity**: requested capacities are rounded up to the
//!   next power of two (minimum 2), so slot indexing is a single AND.
//!
//! # Slot state machine
//!
//! ```text
//! seq == pos          slot empty, writable by the producer at `pos`
//! seq == pos + 1      slot full, readable by the consumer at `pos`
//! otherwise           slot owned by another lap; reload the position
//! ```
//!
//! # Ordering rationale
//!
//! ```text
//! Producer: CAS enqueue_pos (Relaxed), write slot, Release-store seq = pos+1
//! Consumer: Acquire-load seq, CAS dequeue_pos (Relaxed), read slot,
//!           Release-store seq = pos+capacity
//! ```
//!
//! The Acquire load of a slot's sequence synchronizes with the Release store
//! that published it, so a successful pop happens-after the corresponding
//! push. Position CASes need no ordering of their own; they only arbitrate
//! ownership, and all data movement is fenced by the per-slot sequence.
//!
//! # Safety
//!
//! Uses `unsafe` for `MaybeUninit` slot access. A slot's value is
//! initialized exactly when its sequence marks it readable; both claims are
//! documented at each access site. Run the loom suite (`cfg(loom)`) to
//! validate interleavings.

#[cfg(not(loom))]
use std::sync::atomic::{AtomicUsize, Ordering};

#[cfg(loom)]
use loom::sync::atomic::{AtomicUsize, Ordering};

use std::cell::UnsafeCell;
use std::mem::MaybeUninit;

use crossbeam_utils::CachePadded;

/// One ring slot: a lap counter plus storage for a single value.
struct Slot<T> {
    /// Sequence counter implementing the slot state machine above.
    seq: AtomicUsize,
    /// Value storage. Initialized exactly while `seq` marks the slot
    /// readable for the current lap.
    value: UnsafeCell<MaybeUninit<T>>,
}

/// Bounded lock-free MPMC ring buffer.
///
/// Capacity is fixed at construction and rounded up to a power of two.
/// All operations take `&self`; the ring is shared by reference (typically
/// behind an `Arc`) between any number of producers and consumers.
pub struct MpmcRing<T> {
    buf: Box<[Slot<T>]>,
    /// `capacity - 1`; slot index is `pos & mask`.
    mask: usize,
    /// Next position a producer will claim. Monotonic, wraps via two's
    /// complement; never masked in the atomic itself (avoids ABA).
    enqueue_pos: CachePadded<AtomicUsize>,
    /// Next position a consumer will claim.
    dequeue_pos: CachePadded<AtomicUsize>,
}

// SAFETY: The sequence protocol guarantees that producers and consumers
// access disjoint, properly published slots. `UnsafeCell<MaybeUninit<T>>`
// is safe to share under that discipline for any `T: Send`.
unsafe impl<T: Send> Send for MpmcRing<T> {}
unsafe impl<T: Send> Sync for MpmcRing<T> {}

impl<T> MpmcRing<T> {
    /// Creates a ring with at least `capacity` slots.
    ///
    /// Capacities below 2 are rounded up to 2; everything else is rounded
    /// up to the next power of two.
    pub fn with_capacity(capacity: usize) -> Self {
        let cap = capacity.max(2).next_power_of_two();
        assert!(cap <= usize::MAX / 2, "ring capacity overflow");

        let buf: Box<[Slot<T>]> = (0..cap)
            .map(|i| Slot {
                seq: AtomicUsize::new(i),
                value: UnsafeCell::new(MaybeUninit::uninit()),
            })
            .collect();

        Self {
            buf,
            mask: cap - 1,
            enqueue_pos: CachePadded::new(AtomicUsize::new(0)),
            dequeue_pos: CachePadded::new(AtomicUsize::new(0)),
        }
    }

    /// Slot count (always a power of two >= 2).
    #[inline]
    pub fn capacity(&self) -> usize {
        self.mask + 1
    }

    /// Attempts to enqueue `value`.
    ///
    /// Returns `Err(value)` when the ring is full; the value is handed back
    /// untouched so the caller can retry, divert, or dispose of it.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        let mut pos = self.enqueue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos) as isize;

            if diff == 0 {
                // Slot is writable for this lap; race other producers for it.
                match self.enqueue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: Winning the CAS grants exclusive write
                        // access to this slot until the Release store below
                        // publishes it; no consumer reads before seq = pos+1.
                        unsafe { (*slot.value.get()).write(value) };
                        slot.seq.store(pos.wrapping_add(1), Ordering::Release);
                        return Ok(());
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // The slot still holds last lap's value: ring is full.
                return Err(value);
            } else {
                // Another producer already claimed this position.
                pos = self.enqueue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Attempts to dequeue the oldest value.
    ///
    /// Returns `None` when the ring is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut pos = self.dequeue_pos.load(Ordering::Relaxed);
        loop {
            let slot = &self.buf[pos & self.mask];
            let seq = slot.seq.load(Ordering::Acquire);
            let diff = seq.wrapping_sub(pos.wrapping_add(1)) as isize;

            if diff == 0 {
                // Slot is readable; race other consumers for it.
                match self.dequeue_pos.compare_exchange_weak(
                    pos,
                    pos.wrapping_add(1),
                    Ordering::Relaxed,
                    Ordering::Relaxed,
                ) {
                    Ok(_) => {
                        // SAFETY: The Acquire seq load synchronized with the
                        // producer's Release store, so the slot is
                        // initialized; winning the CAS grants exclusive read
                        // access for this lap.
                        let value = unsafe { (*slot.value.get()).assume_init_read() };
                        // Hand the slot to the producer one full lap ahead.
                        slot.seq
                            .store(pos.wrapping_add(self.capacity()), Ordering::Release);
                        return Some(value);
                    }
                    Err(actual) => pos = actual,
                }
            } else if diff < 0 {
                // The slot has not been written this lap: ring is empty.
                return None;
            } else {
                // Another consumer already claimed this position.
                pos = self.dequeue_pos.load(Ordering::Relaxed);
            }
        }
    }

    /// Best-effort element count. Exact only when no operation is in flight.
    #[inline]
    pub fn approx_len(&self) -> usize {
        let tail = self.enqueue_pos.load(Ordering::Relaxed);
        let head = self.dequeue_pos.load(Ordering::Relaxed);
        tail.wrapping_sub(head)
    }

    /// Best-effort emptiness snapshot.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.approx_len() == 0
    }

    /// Best-effort fullness snapshot.
    #[inline]
    pub fn is_full(&self) -> bool {
        self.approx_len() >= self.capacity()
    }
}

impl<T> Drop for MpmcRing<T> {
    fn drop(&mut self) {
        // Exclusive access: drain whatever is still resident so values with
        // destructors are released.
        while self.try_pop().is_some() {}
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(all(test, not(loom)))]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize as StdAtomicUsize, Ordering as StdOrdering};
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn empty_pop_returns_none() {
        let ring: MpmcRing<u64> = MpmcRing::with_capacity(4);
        assert_eq!(ring.try_pop(), None);
        assert!(ring.is_empty());
        assert!(!ring.is_full());
    }

    #[test]
    fn capacity_rounds_up_to_power_of_two() {
        assert_eq!(MpmcRing::<u8>::with_capacity(0).capacity(), 2);
        assert_eq!(MpmcRing::<u8>::with_capacity(1).capacity(), 2);
        assert_eq!(MpmcRing::<u8>::with_capacity(2).capacity(), 2);
        assert_eq!(MpmcRing::<u8>::with_capacity(3).capacity(), 4);
        assert_eq!(MpmcRing::<u8>::with_capacity(1000).capacity(), 1024);
    }

    #[test]
    fn push_to_capacity_then_full() {
        let ring: MpmcRing<u64> = MpmcRing::with_capacity(4);
        for i in 0..4u64 {
            assert!(ring.try_push(i).is_ok());
        }
        assert!(ring.is_full());
        assert_eq!(ring.try_push(99), Err(99));

        for i in 0..4u64 {
            assert_eq!(ring.try_pop(), Some(i));
        }
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn wraparound_preserves_fifo() {
        let ring: MpmcRing<u64> = MpmcRing::with_capacity(4);
        for round in 0..10u64 {
            let base = round * 4;
            for i in 0..4 {
                assert!(ring.try_push(base + i).is_ok());
            }
            for i in 0..4 {
                assert_eq!(ring.try_pop(), Some(base + i));
            }
            assert_eq!(ring.try_pop(), None);
        }
    }

    #[test]
    fn failed_push_returns_value_intact() {
        // Move-only payload: a failed push must hand the exact value back.
        let ring: MpmcRing<String> = MpmcRing::with_capacity(2);
        assert!(ring.try_push("a".to_string()).is_ok());
        assert!(ring.try_push("b".to_string()).is_ok());

        let rejected = ring.try_push("c".to_string());
        let value = rejected.expect_err("ring should be full");
        assert_eq!(value, "c");

        // The caller can still use (or retry) the returned value.
        assert_eq!(ring.try_pop().as_deref(), Some("a"));
        assert!(ring.try_push(value).is_ok());
        assert_eq!(ring.try_pop().as_deref(), Some("b"));
        assert_eq!(ring.try_pop().as_deref(), Some("c"));
    }

    #[test]
    fn interleaved_push_pop() {
        let ring: MpmcRing<u32> = MpmcRing::with_capacity(8);
        assert!(ring.try_push(1).is_ok());
        assert!(ring.try_push(2).is_ok());
        assert_eq!(ring.try_pop(), Some(1));
        assert!(ring.try_push(3).is_ok());
        assert_eq!(ring.approx_len(), 2);
        assert_eq!(ring.try_pop(), Some(2));
        assert_eq!(ring.try_pop(), Some(3));
        assert_eq!(ring.try_pop(), None);
    }

    #[test]
    fn drop_releases_resident_values() {
        struct DropTracker(Arc<StdAtomicUsize>);
        impl Drop for DropTracker {
            fn drop(&mut self) {
                self.0.fetch_add(1, StdOrdering::Relaxed);
            }
        }

        let drops = Arc::new(StdAtomicUsize::new(0));
        {
            let ring: MpmcRing<DropTracker> = MpmcRing::with_capacity(8);
            for _ in 0..5 {
                assert!(ring.try_push(DropTracker(drops.clone())).is_ok());
            }
            drop(ring.try_pop());
            assert_eq!(drops.load(StdOrdering::Relaxed), 1);
        }
        assert_eq!(drops.load(StdOrdering::Relaxed), 5);
    }

    /// Concurrent producers and consumers: popped multiset equals pushed
    /// multiset, with no losses and no duplicates.
    #[test]
    fn mpmc_no_loss_no_duplication() {
        const PRODUCERS: usize = 4;
        const CONSUMERS: usize = 4;
        const PER_PRODUCER: usize = 25_000;

        let ring = Arc::new(MpmcRing::<usize>::with_capacity(256));
        let popped = Arc::new(StdAtomicUsize::new(0));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut value = p * PER_PRODUCER + i;
                    loop {
                        match ring.try_push(value) {
                            Ok(()) => break,
                            Err(v) => {
                                value = v;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            }));
        }

        let mut consumers = Vec::new();
        for _ in 0..CONSUMERS {
            let ring = Arc::clone(&ring);
            let popped = Arc::clone(&popped);
            consumers.push(thread::spawn(move || {
                let mut seen = Vec::new();
                while popped.load(StdOrdering::Relaxed) < PRODUCERS * PER_PRODUCER {
                    if let Some(v) = ring.try_pop() {
                        popped.fetch_add(1, StdOrdering::Relaxed);
                        seen.push(v);
                    } else {
                        std::hint::spin_loop();
                    }
                }
                seen
            }));
        }

        for p in producers {
            p.join().unwrap();
        }
        let mut all: Vec<usize> = Vec::with_capacity(PRODUCERS * PER_PRODUCER);
        for c in consumers {
            all.extend(c.join().unwrap());
        }

        assert_eq!(all.len(), PRODUCERS * PER_PRODUCER);
        all.sort_unstable();
        for (expected, &actual) in all.iter().enumerate() {
            assert_eq!(expected, actual, "lost or duplicated element");
        }
        assert!(ring.is_empty());
    }

    /// Per-producer FIFO: one consumer observes each producer's elements in
    /// submission order even under contention.
    #[test]
    fn per_producer_order_is_preserved() {
        const PRODUCERS: usize = 3;
        const PER_PRODUCER: u64 = 10_000;

        let ring = Arc::new(MpmcRing::<(usize, u64)>::with_capacity(64));

        let mut producers = Vec::new();
        for p in 0..PRODUCERS {
            let ring = Arc::clone(&ring);
            producers.push(thread::spawn(move || {
                for i in 0..PER_PRODUCER {
                    let mut item = (p, i);
                    loop {
                        match ring.try_push(item) {
                            Ok(()) => break,
                            Err(v) => {
                                item = v;
                                std::hint::spin_loop();
                            }
                        }
                    }
                }
            }));
        }

        let mut next = [0u64; PRODUCERS];
        let mut received = 0usize;
        while received < PRODUCERS * PER_PRODUCER as usize {
            if let Some((p, i)) = ring.try_pop() {
                assert_eq!(next[p], i, "producer {p} reordered");
                next[p] += 1;
                received += 1;
            } else {
                std::hint::spin_loop();
            }
        }

        for p in producers {
            p.join().unwrap();
        }
    }
}

// ============================================================================
// Property Tests
// ============================================================================


// ============================================================================
// Loom Tests
// ============================================================================
