//! Closable blocking adapter over the lock-free MPMC ring.
//!
//! # Design
//!
//! The ring itself never blocks; this adapter adds the condition protocol
//! the pool needs: blocking and timed push/pop, close semantics, a drain
//! primitive for forced shutdown, and the overwrite path used by the
//! Overwrite backpressure policy. The lock-free fast paths are tried first;
//! the mutexes exist only to park waiters.
//!
//! # Parking protocol
//!
//! Each direction has its own mutex/condvar pair (`push`/`not_full`,
//! `pop`/`not_empty`), so producers never contend with consumers for a
//! parking lock. A waiter registers itself in a waiter counter while
//! holding its mutex, re-checks the ring, then parks. The signalling side
//! reads the counter first: if nobody is registered the notify is skipped
//! entirely; if someone is, the signaller acquires the waiter's mutex and
//! releases it before notifying. That acquire serializes with the waiter's
//! check-to-park window, so a wakeup can never fall between the re-check
//! and the park.
//!
//! The register-then-recheck versus operate-then-read-counter pair is a
//! store-buffering pattern, so both sides carry a SeqCst fence: either the
//! waiter's re-check observes the ring operation, or the signaller
//! observes the registered waiter and takes the notify path.
//!
//! Signals are edge-driven: a successful push signals `not_empty`, a
//! successful pop signals `not_full`, and `close` broadcasts both.
//!
//! # Overwrite
//!
//! `overwrite_push` serializes all overwriting producers through a
//! dedicated mutex and displaces the oldest queued item (pop-then-push),
//! reporting each displaced value through a callback so the owner can
//! resolve its completion state. Producers running plain pushes are
//! unaffected; the mutex costs nothing under the Block and Discard
//! policies.

use std::sync::atomic::{fence, AtomicBool, AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::stdx::MpmcRing;

/// Blocking, closable MPMC queue with a fixed capacity.
///
/// All operations take `&self`; the queue is shared by reference between
/// any number of producers and consumers.
pub struct BlockingQueue<T> {
    ring: MpmcRing<T>,

    /// Element count. Tracks the ring exactly once in-flight operations
    /// settle; read by the pool as its `pending` gauge.
    pending: AtomicUsize,

    /// Once set, pushes fail immediately and pops fail once the ring is
    /// empty. Monotonic.
    closed: AtomicBool,

    /// Items dropped by the adapter itself (failed try/timed pushes).
    discards: AtomicUsize,

    push_lock: Mutex<()>,
    not_full: Condvar,
    push_waiters: AtomicUsize,

    pop_lock: Mutex<()>,
    not_empty: Condvar,
    pop_waiters: AtomicUsize,

    /// Serializes overwriting producers against each other.
    overwrite_lock: Mutex<()>,
}

impl<T> BlockingQueue<T> {
    /// Creates a queue with at least `capacity` slots (rounded up to a
    /// power of two >= 2 by the ring).
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            ring: MpmcRing::with_capacity(capacity),
            pending: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
            discards: AtomicUsize::new(0),
            push_lock: Mutex::new(()),
            not_full: Condvar::new(),
            push_waiters: AtomicUsize::new(0),
            pop_lock: Mutex::new(()),
            not_empty: Condvar::new(),
            pop_waiters: AtomicUsize::new(0),
            overwrite_lock: Mutex::new(()),
        }
    }

    /// Slot count.
    #[inline]
    pub fn capacity(&self) -> usize {
        self.ring.capacity()
    }

    /// Current element count (exact at quiescence, best-effort otherwise).
    #[inline]
    pub fn len(&self) -> usize {
        self.pending.load(Ordering::Acquire)
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Whether `close` has been called.
    #[inline]
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// Items the adapter dropped (failed non-blocking or timed pushes).
    #[inline]
    pub fn discard_count(&self) -> usize {
        self.discards.load(Ordering::Relaxed)
    }

    pub fn reset_discard_count(&self) {
        self.discards.store(0, Ordering::Relaxed);
    }

    /// Closes the queue and wakes every waiter on both conditions.
    ///
    /// Subsequent pushes fail immediately; pops keep draining until the
    /// ring is empty and only then fail.
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        drop(self.push_lock.lock().expect("push lock poisoned"));
        self.not_full.notify_all();
        drop(self.pop_lock.lock().expect("pop lock poisoned"));
        self.not_empty.notify_all();
    }

    /// Non-blocking push. Fails when closed or full; a failed push hands
    /// the value back and bumps the discard counter on full.
    pub fn try_push(&self, value: T) -> Result<(), T> {
        if self.is_closed() {
            return Err(value);
        }
        match self.ring.try_push(value) {
            Ok(()) => {
                self.finish_push();
                Ok(())
            }
            Err(value) => {
                self.discards.fetch_add(1, Ordering::Relaxed);
                Err(value)
            }
        }
    }

    /// Non-blocking pop.
    pub fn try_pop(&self) -> Option<T> {
        let value = self.ring.try_pop()?;
        self.finish_pop();
        Some(value)
    }

    /// Blocking push. Returns `Err(value)` only when the queue is closed.
    pub fn wait_push(&self, value: T) -> Result<(), T> {
        self.wait_push_inner(value, None)
    }

    /// Timed push. Returns `Err(value)` when the queue is closed or the
    /// deadline passes; a timeout bumps the discard counter.
    pub fn wait_push_for(&self, value: T, timeout: Duration) -> Result<(), T> {
        self.wait_push_inner(value, Some(Instant::now() + timeout))
    }

    fn wait_push_inner(&self, value: T, deadline: Option<Instant>) -> Result<(), T> {
        if self.is_closed() {
            return Err(value);
        }

        // Fast path: uncontended lock-free push.
        let mut value = match self.ring.try_push(value) {
            Ok(()) => {
                self.finish_push();
                return Ok(());
            }
            Err(value) => value,
        };

        let mut guard = self.push_lock.lock().expect("push lock poisoned");
        self.push_waiters.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let result = loop {
            if self.is_closed() {
                break Err(value);
            }
            match self.ring.try_push(value) {
                Ok(()) => break Ok(()),
                Err(v) => value = v,
            }
            match deadline {
                None => {
                    guard = self.not_full.wait(guard).expect("push lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        self.discards.fetch_add(1, Ordering::Relaxed);
                        break Err(value);
                    }
                    let (g, _timeout) = self
                        .not_full
                        .wait_timeout(guard, deadline - now)
                        .expect("push lock poisoned");
                    guard = g;
                }
            }
        };

        self.push_waiters.fetch_sub(1, Ordering::Relaxed);
        drop(guard);

        if result.is_ok() {
            self.finish_push();
        }
        result
    }

    /// Blocking pop. Returns `None` only when the queue is closed and
    /// empty.
    pub fn wait_pop(&self) -> Option<T> {
        self.wait_pop_inner(None)
    }

    /// Timed pop. Returns `None` when the deadline passes or the queue is
    /// closed and empty.
    pub fn wait_pop_for(&self, timeout: Duration) -> Option<T> {
        self.wait_pop_inner(Some(Instant::now() + timeout))
    }

    fn wait_pop_inner(&self, deadline: Option<Instant>) -> Option<T> {
        // Fast path: uncontended lock-free pop.
        if let Some(value) = self.ring.try_pop() {
            self.finish_pop();
            return Some(value);
        }

        let mut guard = self.pop_lock.lock().expect("pop lock poisoned");
        self.pop_waiters.fetch_add(1, Ordering::Relaxed);
        fence(Ordering::SeqCst);

        let result = loop {
            // Drain before honoring close: closed pops fail only on empty.
            if let Some(value) = self.ring.try_pop() {
                break Some(value);
            }
            if self.is_closed() {
                break None;
            }
            match deadline {
                None => {
                    guard = self.not_empty.wait(guard).expect("pop lock poisoned");
                }
                Some(deadline) => {
                    let now = Instant::now();
                    if now >= deadline {
                        break None;
                    }
                    let (g, _timeout) = self
                        .not_empty
                        .wait_timeout(guard, deadline - now)
                        .expect("pop lock poisoned");
                    guard = g;
                }
            }
        };

        self.pop_waiters.fetch_sub(1, Ordering::Relaxed);
        drop(guard);

        if result.is_some() {
            self.finish_pop();
        }
        result
    }

    /// Push that may displace queued items to make room.
    ///
    /// Fast path is a plain push. On full, overwriting producers serialize
    /// on a dedicated mutex, pop the oldest resident item, hand it to
    /// `on_drop`, and retry. Fails only when the queue is closed or a
    /// racing consumer empties the ring out from under the retry loop.
    pub fn overwrite_push<F>(&self, value: T, mut on_drop: F) -> Result<(), T>
    where
        F: FnMut(T),
    {
        if self.is_closed() {
            return Err(value);
        }
        let mut value = match self.ring.try_push(value) {
            Ok(()) => {
                self.finish_push();
                return Ok(());
            }
            Err(value) => value,
        };

        let _serial = self.overwrite_lock.lock().expect("overwrite lock poisoned");
        loop {
            if self.is_closed() {
                return Err(value);
            }
            match self.ring.try_push(value) {
                Ok(()) => {
                    self.finish_push();
                    return Ok(());
                }
                Err(v) => value = v,
            }
            match self.ring.try_pop() {
                Some(old) => {
                    self.finish_pop();
                    on_drop(old);
                }
                // Consumers emptied the ring between our failed push and
                // the pop; the full-to-empty flip means another producer
                // owns the contended slot. Give up rather than spin.
                None => return Err(value),
            }
        }
    }

    /// Removes every resident item, handing each to `visitor` in FIFO
    /// order, then wakes blocked producers so they observe space or close.
    pub fn drain<F>(&self, mut visitor: F) -> usize
    where
        F: FnMut(T),
    {
        let mut drained = 0;
        while let Some(value) = self.ring.try_pop() {
            self.pending.fetch_sub(1, Ordering::Release);
            visitor(value);
            drained += 1;
        }
        fence(Ordering::SeqCst);
        if self.push_waiters.load(Ordering::Relaxed) > 0 {
            drop(self.push_lock.lock().expect("push lock poisoned"));
            self.not_full.notify_all();
        }
        drained
    }

    /// Best-effort batch push: moves items in until the ring fills, the
    /// queue closes, or the batch is exhausted. Returns the number pushed;
    /// remaining items come back to the caller.
    pub fn try_push_batch(&self, items: Vec<T>) -> (usize, Vec<T>) {
        let mut pushed = 0;
        let mut iter = items.into_iter();
        let mut leftover = Vec::new();

        for item in iter.by_ref() {
            if self.is_closed() {
                leftover.push(item);
                break;
            }
            match self.ring.try_push(item) {
                Ok(()) => {
                    self.pending.fetch_add(1, Ordering::Release);
                    pushed += 1;
                }
                Err(item) => {
                    leftover.push(item);
                    break;
                }
            }
        }
        leftover.extend(iter);

        if pushed > 0 {
            self.signal_not_empty_all();
        }
        (pushed, leftover)
    }

    /// Best-effort batch pop of up to `max` items.
    pub fn try_pop_batch(&self, max: usize) -> Vec<T> {
        let mut out = Vec::with_capacity(max.min(self.capacity()));
        while out.len() < max {
            match self.ring.try_pop() {
                Some(value) => {
                    self.pending.fetch_sub(1, Ordering::Release);
                    out.push(value);
                }
                None => break,
            }
        }
        if !out.is_empty() {
            self.signal_not_full_all();
        }
        out
    }

    /// Post-push bookkeeping: bump the gauge, wake one parked consumer.
    fn finish_push(&self) {
        self.pending.fetch_add(1, Ordering::Release);
        fence(Ordering::SeqCst);
        if self.pop_waiters.load(Ordering::Relaxed) > 0 {
            drop(self.pop_lock.lock().expect("pop lock poisoned"));
            self.not_empty.notify_one();
        }
    }

    /// Post-pop bookkeeping: drop the gauge, wake one parked producer.
    fn finish_pop(&self) {
        self.pending.fetch_sub(1, Ordering::Release);
        fence(Ordering::SeqCst);
        if self.push_waiters.load(Ordering::Relaxed) > 0 {
            drop(self.push_lock.lock().expect("push lock poisoned"));
            self.not_full.notify_one();
        }
    }

    fn signal_not_empty_all(&self) {
        fence(Ordering::SeqCst);
        if self.pop_waiters.load(Ordering::Relaxed) > 0 {
            drop(self.pop_lock.lock().expect("pop lock poisoned"));
            self.not_empty.notify_all();
        }
    }

    fn signal_not_full_all(&self) {
        fence(Ordering::SeqCst);
        if self.push_waiters.load(Ordering::Relaxed) > 0 {
            drop(self.push_lock.lock().expect("push lock poisoned"));
            self.not_full.notify_all();
        }
    }
}
