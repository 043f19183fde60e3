//! Pool statistics: cheap, always-on counters shared by every thread.
//!
//! Hot-path updates are single Relaxed atomic ops; nothing here gates
//! another thread's progress, so no counter carries ordering obligations.
//! Flags that do gate progress (closed, paused, pool state) live with the
//! queue and the controller and use Acquire/Release there.
//!
//! Ratio gauges are `f64` values stored as bit patterns in `AtomicU64`;
//! they are refreshed by the load monitor each tick and read back in
//! snapshots.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::time::Duration;

/// Shared atomic counters and gauges backing [`PoolStats`] snapshots.
#[derive(Default)]
pub(crate) struct StatsBlock {
    /// Tasks accepted for processing: enqueued plus policy-discarded.
    /// Rejected submissions are tracked separately so that at quiescence
    /// `submitted == completed + failed + cancelled + discarded + overwritten`.
    pub submitted: AtomicU64,
    pub completed: AtomicU64,
    pub failed: AtomicU64,
    pub cancelled: AtomicU64,
    pub rejected: AtomicU64,
    pub discarded: AtomicU64,
    pub overwritten: AtomicU64,

    /// Accumulated execution time of every task that ran (ns).
    pub exec_time_ns: AtomicU64,

    /// Times a thread parked on the pause condition.
    pub paused_waits: AtomicU64,

    pub threads_created: AtomicU64,
    pub threads_destroyed: AtomicU64,
    pub peak_threads: AtomicUsize,

    /// Monitor-refreshed gauges, stored as f64 bit patterns.
    busy_ratio_bits: AtomicU64,
    pending_ratio_bits: AtomicU64,
}

impl StatsBlock {
    /// Folds one task execution into the counters.
    ///
    /// Execution time accumulates for every run; the mean reported by
    /// [`PoolStats`] divides by completed tasks only.
    pub fn record_exec(&self, elapsed: Duration, success: bool) {
        self.exec_time_ns
            .fetch_add(elapsed.as_nanos() as u64, Ordering::Relaxed);
        if success {
            self.completed.fetch_add(1, Ordering::Relaxed);
        } else {
            self.failed.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Records a spawned worker and refreshes the peak gauge.
    pub fn record_thread_created(&self, current: usize) {
        self.threads_created.fetch_add(1, Ordering::Relaxed);
        self.refresh_peak(current);
    }

    pub fn record_thread_destroyed(&self) {
        self.threads_destroyed.fetch_add(1, Ordering::Relaxed);
    }

    /// Monotone max update of `peak_threads`.
    pub fn refresh_peak(&self, current: usize) {
        let mut peak = self.peak_threads.load(Ordering::Relaxed);
        while current > peak {
            match self.peak_threads.compare_exchange_weak(
                peak,
                current,
                Ordering::Relaxed,
                Ordering::Relaxed,
            ) {
                Ok(_) => break,
                Err(actual) => peak = actual,
            }
        }
    }

    pub fn store_ratios(&self, busy: f64, pending: f64) {
        self.busy_ratio_bits.store(busy.to_bits(), Ordering::Relaxed);
        self.pending_ratio_bits
            .store(pending.to_bits(), Ordering::Relaxed);
    }

    pub fn busy_ratio(&self) -> f64 {
        f64::from_bits(self.busy_ratio_bits.load(Ordering::Relaxed))
    }

    /// Builds a point-in-time snapshot; live gauges are passed in by the
    /// controller, which owns them.
    pub fn snapshot(
        &self,
        pending: usize,
        queue_capacity: usize,
        current_threads: usize,
        active_threads: usize,
    ) -> PoolStats {
        let completed = self.completed.load(Ordering::Relaxed);
        let exec_ns = self.exec_time_ns.load(Ordering::Relaxed);
        let avg_exec_time = if completed == 0 {
            Duration::ZERO
        } else {
            Duration::from_nanos(exec_ns / completed)
        };

        PoolStats {
            total_submitted: self.submitted.load(Ordering::Relaxed),
            total_completed: completed,
            total_failed: self.failed.load(Ordering::Relaxed),
            total_cancelled: self.cancelled.load(Ordering::Relaxed),
            total_rejected: self.rejected.load(Ordering::Relaxed),
            discarded_tasks: self.discarded.load(Ordering::Relaxed),
            overwritten_tasks: self.overwritten.load(Ordering::Relaxed),
            total_exec_time: Duration::from_nanos(exec_ns),
            avg_exec_time,
            pending_tasks: pending,
            pending_ratio: if queue_capacity == 0 {
                0.0
            } else {
                pending as f64 / queue_capacity as f64
            },
            busy_ratio: self.busy_ratio(),
            current_threads,
            active_threads,
            peak_threads: self.peak_threads.load(Ordering::Relaxed),
            threads_created: self.threads_created.load(Ordering::Relaxed),
            threads_destroyed: self.threads_destroyed.load(Ordering::Relaxed),
            paused_waits: self.paused_waits.load(Ordering::Relaxed),
        }
    }

    /// Clears every counter. Peak restarts from the live thread count.
    pub fn reset(&self, current_threads: usize) {
        self.submitted.store(0, Ordering::Relaxed);
        self.completed.store(0, Ordering::Relaxed);
        self.failed.store(0, Ordering::Relaxed);
        self.cancelled.store(0, Ordering::Relaxed);
        self.rejected.store(0, Ordering::Relaxed);
        self.discarded.store(0, Ordering::Relaxed);
        self.overwritten.store(0, Ordering::Relaxed);
        self.exec_time_ns.store(0, Ordering::Relaxed);
        self.paused_waits.store(0, Ordering::Relaxed);
        self.threads_created.store(0, Ordering::Relaxed);
        self.threads_destroyed.store(0, Ordering::Relaxed);
        self.peak_threads.store(current_threads, Ordering::Relaxed);
        self.store_ratios(0.0, 0.0);
    }
}

/// Point-in-time statistics snapshot returned by the pool.
#[derive(Clone, Debug, Default)]
pub struct PoolStats {
    pub total_submitted: u64,
    pub total_completed: u64,
    pub total_failed: u64,
    pub total_cancelled: u64,
    pub total_rejected: u64,
    pub discarded_tasks: u64,
    pub overwritten_tasks: u64,

    pub total_exec_time: Duration,
    /// Rolling mean over completed tasks.
    pub avg_exec_time: Duration,

    pub pending_tasks: usize,
    /// `pending_tasks / queue_capacity` at snapshot time.
    pub pending_ratio: f64,
    /// `active_threads / current_threads` as of the last monitor tick.
    pub busy_ratio: f64,

    pub current_threads: usize,
    pub active_threads: usize,
    pub peak_threads: usize,
    pub threads_created: u64,
    pub threads_destroyed: u64,

    pub paused_waits: u64,
}

impl PoolStats {
    /// The quiescence identity: every accepted task landed in exactly one
    /// terminal bucket.
    pub fn is_balanced(&self) -> bool {
        self.total_submitted
            == self.total_completed
                + self.total_failed
                + self.total_cancelled
                + self.discarded_tasks
                + self.overwritten_tasks
    }
}
