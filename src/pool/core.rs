//! Pool controller: worker lifecycle, submission policies, dynamic scaling,
//! pause/resume, and stop machinery.
//!
//! # Architecture
//!
//! ```text
//!                      ┌────────────────────────────────────────────────┐
//!                      │                  WorkerPool                    │
//!                      │                                                │
//!  Producers ─────────►│  submit/post ──policy──► BlockingQueue         │
//!  (any thread)        │                              │                 │
//!                      │                              ▼                 │
//!                      │   ┌──────────┬──────────┬──────────┐           │
//!                      │   │ Worker 0 │ Worker 1 │ Worker N │  workers  │
//!                      │   └──────────┴──────────┴──────────┘           │
//!                      │        ▲ spawn                 retire ▼        │
//!                      │   ┌────────────────────────────────────┐       │
//!                      │   │ monitor: pending / busy ratio,     │       │
//!                      │   │ debounce + cooldown, permits       │       │
//!                      │   └────────────────────────────────────┘       │
//!                      └────────────────────────────────────────────────┘
//! ```
//!
//! # State machine
//!
//! ```text
//!  Created ──start()──► Running ──stop()──► Stopping ──joins──► Stopped
//!     │                    │ paused bit (orthogonal)
//!     └──stop()──► Stopped │ toggled by pause()/resume()
//! ```
//!
//! All other transitions are rejected. The paused bit never changes the
//! state: producers keep submitting under the configured policy while
//! workers park at their dequeue point.
//!
//! # Correctness invariants
//!
//! - Every accepted envelope resolves exactly once: run by a worker, or
//!   cancelled by force-stop/overwrite/discard.
//! - `core_threads <= current_threads <= max_threads` while running;
//!   retirement claims both a monitor permit and a thread slot under the
//!   registry lock, so concurrent retirements cannot undershoot.
//! - Stop waits for in-flight submissions before closing the queue, so a
//!   submission that passed the accept check always lands before the
//!   drain sweep.

use std::mem;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use super::config::{PoolConfig, QueueFullPolicy};
use super::queue::BlockingQueue;
use super::stats::{PoolStats, StatsBlock};
use super::task::{Envelope, TaskError, TaskHandle};

/// How `stop` treats tasks still sitting in the queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StopMode {
    /// Drain the queue; every accepted task runs to completion.
    Graceful,
    /// Cancel queued tasks; in-flight tasks still run to completion.
    Force,
}

/// Pool lifecycle states. The paused bit is orthogonal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum PoolState {
    Created = 0,
    Running = 1,
    Stopping = 2,
    Stopped = 3,
}

impl PoolState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Created,
            1 => Self::Running,
            2 => Self::Stopping,
            _ => Self::Stopped,
        }
    }
}

/// Controller misuse and rejection errors.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PoolError {
    /// Submission refused: the pool is not accepting tasks.
    Rejected,
    /// `start` was called on a pool that already left `Created`.
    AlreadyStarted,
    /// `stop` was called before `start`.
    NotStarted,
    /// `stop` was called on a pool that is already stopping or stopped.
    AlreadyStopped,
}

impl std::fmt::Display for PoolError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Rejected => write!(f, "submission rejected: pool is not accepting tasks"),
            Self::AlreadyStarted => write!(f, "pool already started"),
            Self::NotStarted => write!(f, "pool was never started"),
            Self::AlreadyStopped => write!(f, "pool already stopping or stopped"),
        }
    }
}

impl std::error::Error for PoolError {}

/// One live worker: its join handle plus an exit-observed flag the monitor
/// uses to reap finished threads.
struct WorkerHandle {
    id: usize,
    alive: Arc<AtomicBool>,
    join: JoinHandle<()>,
}

/// State shared between the controller, the monitor, and every worker.
struct Shared {
    config: PoolConfig,

    state: AtomicU8,
    /// Set when a stop is forced (directly or by a shutdown deadline).
    force_stop: AtomicBool,
    paused: AtomicBool,

    queue: BlockingQueue<Envelope>,
    policy: AtomicU8,
    stats: StatsBlock,

    /// Workers spawned and not yet exited.
    current_threads: AtomicUsize,
    /// Workers currently inside a user task.
    active_threads: AtomicUsize,
    /// Monitor-granted retirements a surplus worker may consume on an idle
    /// timeout. Mutated only under the registry lock.
    retire_permits: AtomicUsize,
    next_worker_id: AtomicUsize,

    workers: Mutex<Vec<WorkerHandle>>,

    pause_lock: Mutex<()>,
    pause_cv: Condvar,

    /// Submissions between the accept check and their enqueue. Stop waits
    /// for this to reach zero before sweeping the queue.
    submissions_in_flight: AtomicUsize,
    submit_lock: Mutex<()>,
    submit_cv: Condvar,

    monitor_stop: AtomicBool,
    monitor_kick: AtomicBool,
    monitor_lock: Mutex<()>,
    monitor_cv: Condvar,
}

impl Shared {
    #[inline]
    fn state(&self) -> PoolState {
        PoolState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn wake_paused(&self) {
        drop(self.pause_lock.lock().expect("pause lock poisoned"));
        self.pause_cv.notify_all();
    }
}

/// Worker pool over a bounded MPMC queue.
///
/// All methods take `&self`; share the pool behind an `Arc` to submit from
/// many threads.
///
/// # Example
///
/// ```
/// use taskpool::WorkerPool;
///
/// let pool = WorkerPool::new(2, 64);
/// pool.start().unwrap();
/// let handle = pool.submit(|| 2 + 2).unwrap();
/// assert_eq!(handle.wait(), Ok(4));
/// pool.stop(taskpool::StopMode::Graceful).unwrap();
/// ```
pub struct WorkerPool {
    shared: Arc<Shared>,
    monitor: Mutex<Option<JoinHandle<()>>>,
}

impl WorkerPool {
    /// Pool with `core_threads` permanent workers and a queue of at least
    /// `queue_cap` slots; every other knob at its default.
    pub fn new(core_threads: usize, queue_cap: usize) -> Self {
        let mut config = PoolConfig::new(queue_cap);
        config.core_threads = core_threads;
        Self::with_config(config)
    }

    /// Pool from a full configuration record. Invalid combinations are
    /// normalized (see [`PoolConfig`]).
    pub fn with_config(config: PoolConfig) -> Self {
        let config = config.normalized();
        let queue = BlockingQueue::with_capacity(config.queue_cap);
        let policy = AtomicU8::new(config.queue_policy.as_u8());

        tracing::debug!(
            core_threads = config.core_threads,
            max_threads = config.max_threads,
            queue_cap = queue.capacity(),
            policy = %config.queue_policy,
            "pool constructed"
        );

        Self {
            shared: Arc::new(Shared {
                config,
                state: AtomicU8::new(PoolState::Created as u8),
                force_stop: AtomicBool::new(false),
                paused: AtomicBool::new(false),
                queue,
                policy,
                stats: StatsBlock::default(),
                current_threads: AtomicUsize::new(0),
                active_threads: AtomicUsize::new(0),
                retire_permits: AtomicUsize::new(0),
                next_worker_id: AtomicUsize::new(0),
                workers: Mutex::new(Vec::new()),
                pause_lock: Mutex::new(()),
                pause_cv: Condvar::new(),
                submissions_in_flight: AtomicUsize::new(0),
                submit_lock: Mutex::new(()),
                submit_cv: Condvar::new(),
                monitor_stop: AtomicBool::new(false),
                monitor_kick: AtomicBool::new(false),
                monitor_lock: Mutex::new(()),
                monitor_cv: Condvar::new(),
            }),
            monitor: Mutex::new(None),
        }
    }

    /// Spawns the core workers and the load monitor.
    ///
    /// Fails with [`PoolError::AlreadyStarted`] on any second call.
    pub fn start(&self) -> Result<(), PoolError> {
        let shared = &self.shared;
        if shared
            .state
            .compare_exchange(
                PoolState::Created as u8,
                PoolState::Running as u8,
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_err()
        {
            return Err(PoolError::AlreadyStarted);
        }

        {
            let mut registry = shared.workers.lock().expect("worker registry poisoned");
            registry.reserve(shared.config.max_threads);
            for _ in 0..shared.config.core_threads {
                spawn_worker(shared, &mut registry);
            }
        }

        let monitor_shared = Arc::clone(shared);
        let handle = thread::Builder::new()
            .name("taskpool-monitor".to_string())
            .spawn(move || monitor_loop(monitor_shared))
            .expect("failed to spawn monitor thread");
        *self.monitor.lock().expect("monitor handle poisoned") = Some(handle);

        tracing::info!(
            workers = shared.config.core_threads,
            max_threads = shared.config.max_threads,
            queue_cap = shared.queue.capacity(),
            "pool started"
        );
        Ok(())
    }

    /// Submits a result-producing task.
    ///
    /// On success the returned handle resolves with the task's value, a
    /// captured panic, or a policy outcome (`Discarded`, `Overwritten`,
    /// `Cancelled`). Fails with [`PoolError::Rejected`] when the pool is
    /// not accepting or the queue closed mid-submission.
    pub fn submit<R, F>(&self, f: F) -> Result<TaskHandle<R>, PoolError>
    where
        R: Send + 'static,
        F: FnOnce() -> R + Send + 'static,
    {
        let _guard = SubmitGuard::enter(&self.shared)?;
        let (envelope, handle) = Envelope::future(f);
        self.dispatch(envelope)?;
        Ok(handle)
    }

    /// Submits a fire-and-forget task. A panic inside the task is recorded
    /// as a failure; nothing is returned to the caller.
    pub fn post<F>(&self, f: F) -> Result<(), PoolError>
    where
        F: FnOnce() + Send + 'static,
    {
        let _guard = SubmitGuard::enter(&self.shared)?;
        self.dispatch(Envelope::post(f))
    }

    /// Best-effort batch submission of fire-and-forget tasks.
    ///
    /// Pushes tasks until the queue fills and returns how many were
    /// accepted; the remainder is dropped unrecorded, so callers should
    /// resubmit from the returned count.
    pub fn post_batch<I, F>(&self, tasks: I) -> usize
    where
        I: IntoIterator<Item = F>,
        F: FnOnce() + Send + 'static,
    {
        let Ok(_guard) = SubmitGuard::enter(&self.shared) else {
            return 0;
        };
        let envelopes: Vec<Envelope> = tasks.into_iter().map(Envelope::post).collect();
        let (pushed, _leftover) = self.shared.queue.try_push_batch(envelopes);
        self.shared
            .stats
            .submitted
            .fetch_add(pushed as u64, Ordering::Relaxed);
        pushed
    }

    /// Applies the current queue-full policy to one envelope.
    fn dispatch(&self, envelope: Envelope) -> Result<(), PoolError> {
        let shared = &self.shared;
        match QueueFullPolicy::from_u8(shared.policy.load(Ordering::Relaxed)) {
            QueueFullPolicy::Block => match shared.queue.wait_push(envelope) {
                Ok(()) => {}
                Err(envelope) => {
                    // The queue closed while we waited (a stop raced us).
                    shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                    envelope.cancel(TaskError::Rejected);
                    return Err(PoolError::Rejected);
                }
            },
            QueueFullPolicy::Discard => match shared.queue.try_push(envelope) {
                Ok(()) => {}
                Err(envelope) => {
                    // Counted as submitted so the quiescence identity holds:
                    // every accepted task lands in exactly one bucket.
                    shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
                    shared.stats.discarded.fetch_add(1, Ordering::Relaxed);
                    envelope.cancel(TaskError::Discarded);
                    tracing::debug!(pending = shared.queue.len(), "task discarded: queue full");
                    return Ok(());
                }
            },
            QueueFullPolicy::Overwrite => {
                let stats = &shared.stats;
                let result = shared.queue.overwrite_push(envelope, |displaced| {
                    displaced.cancel(TaskError::Overwritten);
                    stats.overwritten.fetch_add(1, Ordering::Relaxed);
                });
                match result {
                    Ok(()) => {}
                    Err(envelope) => {
                        shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
                        envelope.cancel(TaskError::Rejected);
                        return Err(PoolError::Rejected);
                    }
                }
            }
        }
        shared.stats.submitted.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    /// Freezes worker dequeue. Submissions keep flowing under the
    /// configured policy. Idempotent.
    pub fn pause(&self) {
        if !self.shared.paused.swap(true, Ordering::AcqRel) {
            tracing::info!("pool paused");
        }
    }

    /// Releases paused workers. Idempotent.
    pub fn resume(&self) {
        let was_paused = {
            let _gate = self.shared.pause_lock.lock().expect("pause lock poisoned");
            self.shared.paused.swap(false, Ordering::AcqRel)
        };
        if was_paused {
            self.shared.pause_cv.notify_all();
            tracing::info!("pool resumed");
        }
    }

    pub fn paused(&self) -> bool {
        self.shared.paused.load(Ordering::Acquire)
    }

    /// Stops the pool. See [`StopMode`] for queue treatment. Fails with
    /// [`PoolError::AlreadyStopped`] on a second call.
    pub fn stop(&self, mode: StopMode) -> Result<(), PoolError> {
        self.stop_inner(mode, None)
    }

    /// Graceful stop that escalates to force when `timeout` elapses before
    /// the queue drains. In-flight tasks always run to completion.
    pub fn shutdown(&self, timeout: Duration) -> Result<(), PoolError> {
        self.stop_inner(StopMode::Graceful, Some(Instant::now() + timeout))
    }

    fn stop_inner(&self, mode: StopMode, deadline: Option<Instant>) -> Result<(), PoolError> {
        let shared = &self.shared;

        loop {
            match shared.state() {
                PoolState::Created => return Err(PoolError::NotStarted),
                PoolState::Running => {
                    if shared
                        .state
                        .compare_exchange(
                            PoolState::Running as u8,
                            PoolState::Stopping as u8,
                            Ordering::SeqCst,
                            Ordering::SeqCst,
                        )
                        .is_ok()
                    {
                        break;
                    }
                }
                PoolState::Stopping | PoolState::Stopped => return Err(PoolError::AlreadyStopped),
            }
        }

        let force = mode == StopMode::Force;
        if force {
            shared.force_stop.store(true, Ordering::SeqCst);
        }
        tracing::info!(?mode, pending = shared.queue.len(), "pool stopping");

        // Paused workers re-check the state and proceed to drain or exit.
        shared.wake_paused();

        let stats = &shared.stats;
        if force {
            // Close first so blocked producers fail out, then sweep the
            // queue once racing submissions have settled.
            shared.queue.close();
            wait_submissions_drained(shared, None);
            let cancelled = shared.queue.drain(|envelope| {
                envelope.cancel(TaskError::Cancelled);
                stats.cancelled.fetch_add(1, Ordering::Relaxed);
            });
            if cancelled > 0 {
                tracing::warn!(cancelled, "force stop cancelled queued tasks");
            }
        } else {
            let drained_in_time = wait_submissions_drained(shared, deadline);
            shared.queue.close();
            if let Some(deadline) = deadline {
                if !drained_in_time || !wait_queue_empty(shared, deadline) {
                    shared.force_stop.store(true, Ordering::SeqCst);
                    let cancelled = shared.queue.drain(|envelope| {
                        envelope.cancel(TaskError::Cancelled);
                        stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    });
                    tracing::warn!(cancelled, "shutdown deadline reached; escalated to force");
                }
            }
        }

        // Retire the monitor before joining workers so it stops reaping.
        shared.monitor_stop.store(true, Ordering::Release);
        drop(shared.monitor_lock.lock().expect("monitor lock poisoned"));
        shared.monitor_cv.notify_all();
        if let Some(handle) = self.monitor.lock().expect("monitor handle poisoned").take() {
            let _ = handle.join();
        }

        let handles = mem::take(&mut *shared.workers.lock().expect("worker registry poisoned"));
        let joined = handles.len();
        for handle in handles {
            let _ = handle.join.join();
        }

        shared.state.store(PoolState::Stopped as u8, Ordering::SeqCst);
        tracing::info!(
            joined,
            pending = shared.queue.len(),
            cancelled = stats.cancelled.load(Ordering::Relaxed),
            "pool stopped"
        );
        Ok(())
    }

    /// Forces one immediate monitor evaluation, bypassing the cooldown.
    pub fn trigger_load_check(&self) {
        self.shared.monitor_kick.store(true, Ordering::Release);
        drop(self.shared.monitor_lock.lock().expect("monitor lock poisoned"));
        self.shared.monitor_cv.notify_all();
        tracing::trace!("manual load check triggered");
    }

    pub fn queue_full_policy(&self) -> QueueFullPolicy {
        QueueFullPolicy::from_u8(self.shared.policy.load(Ordering::Acquire))
    }

    /// Atomically replaces the queue-full policy; affects subsequent
    /// submissions only.
    pub fn set_queue_full_policy(&self, policy: QueueFullPolicy) {
        self.shared.policy.store(policy.as_u8(), Ordering::Release);
    }

    /// Point-in-time statistics snapshot.
    pub fn statistics(&self) -> PoolStats {
        let shared = &self.shared;
        shared.stats.snapshot(
            shared.queue.len(),
            shared.queue.capacity(),
            shared.current_threads.load(Ordering::Acquire),
            shared.active_threads.load(Ordering::Acquire),
        )
    }

    /// Clears all counters; peak restarts from the live worker count.
    pub fn reset_statistics(&self) {
        self.shared
            .stats
            .reset(self.shared.current_threads.load(Ordering::Acquire));
    }

    // Read-only introspection.

    pub fn state(&self) -> PoolState {
        self.shared.state()
    }

    pub fn running(&self) -> bool {
        self.shared.state() == PoolState::Running
    }

    /// Envelopes currently in the queue.
    pub fn pending(&self) -> usize {
        self.shared.queue.len()
    }

    /// Tasks currently executing.
    pub fn active_tasks(&self) -> usize {
        self.shared.active_threads.load(Ordering::Acquire)
    }

    /// Workers spawned and not yet exited.
    pub fn current_threads(&self) -> usize {
        self.shared.current_threads.load(Ordering::Acquire)
    }

    /// Workers currently inside a user task.
    pub fn active_threads(&self) -> usize {
        self.shared.active_threads.load(Ordering::Acquire)
    }

    pub fn peak_threads(&self) -> usize {
        self.shared.stats.peak_threads.load(Ordering::Relaxed)
    }

    pub fn discarded_tasks(&self) -> u64 {
        self.shared.stats.discarded.load(Ordering::Relaxed)
    }

    pub fn overwritten_tasks(&self) -> u64 {
        self.shared.stats.overwritten.load(Ordering::Relaxed)
    }

    /// Times any thread parked on the pause condition.
    pub fn paused_waits(&self) -> u64 {
        self.shared.stats.paused_waits.load(Ordering::Relaxed)
    }
}

impl Drop for WorkerPool {
    fn drop(&mut self) {
        if self.shared.state() == PoolState::Running {
            let _ = self.stop(StopMode::Graceful);
        }
    }
}

/// RAII over the submission gate.
///
/// `enter` admits a submission only in `Created` or `Running`, and holds
/// the in-flight count up so a concurrent stop cannot sweep the queue
/// between our accept check and the actual enqueue.
struct SubmitGuard<'a> {
    shared: &'a Shared,
}

impl<'a> SubmitGuard<'a> {
    fn enter(shared: &'a Shared) -> Result<Self, PoolError> {
        // SeqCst on both sides of the gate (increment here, state CAS plus
        // in-flight read in stop) makes this a proper store/load fence
        // pair; Acquire/Release alone would allow both sides to miss each
        // other.
        shared.submissions_in_flight.fetch_add(1, Ordering::SeqCst);
        let state = PoolState::from_u8(shared.state.load(Ordering::SeqCst));
        if state == PoolState::Created || state == PoolState::Running {
            Ok(Self { shared })
        } else {
            shared.stats.rejected.fetch_add(1, Ordering::Relaxed);
            drop(Self { shared });
            Err(PoolError::Rejected)
        }
    }
}

impl Drop for SubmitGuard<'_> {
    fn drop(&mut self) {
        let prev = self
            .shared
            .submissions_in_flight
            .fetch_sub(1, Ordering::SeqCst);
        if prev == 1 && self.shared.state() == PoolState::Stopping {
            drop(self.shared.submit_lock.lock().expect("submit lock poisoned"));
            self.shared.submit_cv.notify_all();
        }
    }
}

/// Blocks until no submission sits between its accept check and enqueue.
/// Returns false when `deadline` expires first.
fn wait_submissions_drained(shared: &Shared, deadline: Option<Instant>) -> bool {
    let mut guard = shared.submit_lock.lock().expect("submit lock poisoned");
    while shared.submissions_in_flight.load(Ordering::SeqCst) != 0 {
        match deadline {
            None => {
                guard = shared.submit_cv.wait(guard).expect("submit lock poisoned");
            }
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return false;
                }
                let (g, _timeout) = shared
                    .submit_cv
                    .wait_timeout(guard, deadline - now)
                    .expect("submit lock poisoned");
                guard = g;
            }
        }
    }
    true
}

/// Polls the queue down to empty, bounded by `deadline`.
fn wait_queue_empty(shared: &Shared, deadline: Instant) -> bool {
    while !shared.queue.is_empty() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(1));
    }
    true
}

/// Spawns one worker. Caller holds the registry lock.
fn spawn_worker(shared: &Arc<Shared>, registry: &mut Vec<WorkerHandle>) {
    let id = shared.next_worker_id.fetch_add(1, Ordering::Relaxed);
    let alive = Arc::new(AtomicBool::new(true));
    let current = shared.current_threads.fetch_add(1, Ordering::AcqRel) + 1;
    shared.stats.record_thread_created(current);

    let worker_shared = Arc::clone(shared);
    let worker_alive = Arc::clone(&alive);
    let join = thread::Builder::new()
        .name(format!("taskpool-worker-{id}"))
        .spawn(move || worker_loop(worker_shared, id, worker_alive))
        .expect("failed to spawn worker thread");

    registry.push(WorkerHandle { id, alive, join });
}

fn worker_loop(shared: Arc<Shared>, id: usize, alive: Arc<AtomicBool>) {
    tracing::debug!(worker = id, "worker started");
    let mut retired = false;

    loop {
        wait_while_paused(&shared);

        // Exit only once the queue is closed AND drained. Checking the
        // Stopping state alone would let a worker leave while a racing
        // submission is still about to land.
        if shared.queue.is_closed() && shared.queue.is_empty() {
            break;
        }

        match shared.queue.wait_pop_for(shared.config.keep_alive) {
            Some(envelope) => {
                // Pause may have landed while we waited; hold the envelope
                // at the dequeue point until resume or stop.
                wait_while_paused(&shared);
                if shared.force_stop.load(Ordering::Acquire) {
                    // Not started yet, so a force stop cancels it.
                    envelope.cancel(TaskError::Cancelled);
                    shared.stats.cancelled.fetch_add(1, Ordering::Relaxed);
                    continue;
                }
                run_task(&shared, envelope);
            }
            None => {
                if shared.queue.is_closed() && shared.queue.is_empty() {
                    break;
                }
                // Idle timeout: surplus workers retire if the monitor has
                // asked for a scale-down.
                if try_retire(&shared) {
                    tracing::debug!(worker = id, "surplus worker retiring");
                    retired = true;
                    break;
                }
            }
        }
    }

    if !retired {
        shared.current_threads.fetch_sub(1, Ordering::AcqRel);
    }
    shared.stats.record_thread_destroyed();
    alive.store(false, Ordering::Release);
    tracing::debug!(worker = id, "worker exiting");
}

/// Parks the calling worker while the pool is paused and running.
fn wait_while_paused(shared: &Shared) {
    if !(shared.paused.load(Ordering::Acquire) && shared.state() == PoolState::Running) {
        return;
    }
    let mut guard = shared.pause_lock.lock().expect("pause lock poisoned");
    while shared.paused.load(Ordering::Acquire) && shared.state() == PoolState::Running {
        shared.stats.paused_waits.fetch_add(1, Ordering::Relaxed);
        guard = shared.pause_cv.wait(guard).expect("pause lock poisoned");
    }
}

fn run_task(shared: &Shared, envelope: Envelope) {
    tracing::trace!(
        queued_us = envelope.submitted_at().elapsed().as_micros() as u64,
        "task dequeued"
    );
    shared.active_threads.fetch_add(1, Ordering::AcqRel);
    let started = Instant::now();
    let success = envelope.run();
    shared.active_threads.fetch_sub(1, Ordering::AcqRel);
    shared.stats.record_exec(started.elapsed(), success);
}

/// Consumes one retire permit and the thread slot together, under the
/// registry lock, so concurrent retirements cannot drop below core.
fn try_retire(shared: &Shared) -> bool {
    let _registry = shared.workers.lock().expect("worker registry poisoned");
    let permits = shared.retire_permits.load(Ordering::Acquire);
    if permits == 0 {
        return false;
    }
    if shared.current_threads.load(Ordering::Acquire) <= shared.config.core_threads {
        // Stale permits from an earlier decision; drop them.
        shared.retire_permits.store(0, Ordering::Release);
        return false;
    }
    shared.retire_permits.store(permits - 1, Ordering::Release);
    shared.current_threads.fetch_sub(1, Ordering::AcqRel);
    true
}

/// Load monitor: samples the gauges every `load_check_interval`, applies
/// debounce and cooldown, and spawns a worker or grants a retire permit.
fn monitor_loop(shared: Arc<Shared>) {
    tracing::debug!("load monitor started");
    let config = &shared.config;
    let mut up_hits = 0usize;
    let mut down_hits = 0usize;
    // Backdate so the first decision is not cooldown-gated.
    let mut last_scale = Instant::now()
        .checked_sub(config.cooldown)
        .unwrap_or_else(Instant::now);

    let mut guard = shared.monitor_lock.lock().expect("monitor lock poisoned");
    loop {
        let (g, _timeout) = shared
            .monitor_cv
            .wait_timeout(guard, config.load_check_interval)
            .expect("monitor lock poisoned");
        guard = g;

        if shared.monitor_stop.load(Ordering::Acquire) {
            break;
        }
        let kicked = shared.monitor_kick.swap(false, Ordering::AcqRel);

        reap_finished_workers(&shared);

        let pending = shared.queue.len();
        let capacity = shared.queue.capacity();
        let current = shared.current_threads.load(Ordering::Acquire);
        let active = shared.active_threads.load(Ordering::Acquire);
        let busy_ratio = if current == 0 {
            0.0
        } else {
            active as f64 / current as f64
        };
        let pending_ratio = pending as f64 / capacity as f64;
        shared.stats.store_ratios(busy_ratio, pending_ratio);
        shared.stats.refresh_peak(current);

        // No scaling while paused or stopping; gauges keep refreshing.
        if shared.state() != PoolState::Running || shared.paused.load(Ordering::Acquire) {
            up_hits = 0;
            down_hits = 0;
            continue;
        }

        let grow = pending >= config.pending_hi
            || (busy_ratio >= config.scale_up_threshold
                && pending_ratio >= config.scale_up_threshold);
        let shrink = pending <= config.pending_low && busy_ratio <= config.scale_down_threshold;
        let cooled = kicked || last_scale.elapsed() >= config.cooldown;

        if grow {
            down_hits = 0;
            up_hits += 1;
            if up_hits >= config.debounce_hits && cooled {
                up_hits = 0;
                let mut registry = shared.workers.lock().expect("worker registry poisoned");
                let current = shared.current_threads.load(Ordering::Acquire);
                if current < config.max_threads {
                    spawn_worker(&shared, &mut registry);
                    last_scale = Instant::now();
                    tracing::info!(
                        from = current,
                        to = current + 1,
                        pending,
                        busy_ratio,
                        "scaled up"
                    );
                }
            }
        } else if shrink {
            up_hits = 0;
            down_hits += 1;
            if down_hits >= config.debounce_hits && cooled {
                down_hits = 0;
                let _registry = shared.workers.lock().expect("worker registry poisoned");
                let current = shared.current_threads.load(Ordering::Acquire);
                if current > config.core_threads {
                    let permits = shared.retire_permits.load(Ordering::Acquire);
                    if permits < current - config.core_threads {
                        shared.retire_permits.store(permits + 1, Ordering::Release);
                        last_scale = Instant::now();
                        tracing::info!(current, pending, busy_ratio, "scale-down requested");
                    }
                }
            }
        } else {
            up_hits = 0;
            down_hits = 0;
        }
    }
    tracing::debug!("load monitor exiting");
}

/// Joins workers that already exited (retired or panicked out) so their
/// handles do not pile up in the registry.
fn reap_finished_workers(shared: &Shared) {
    let mut finished = Vec::new();
    {
        let mut registry = shared.workers.lock().expect("worker registry poisoned");
        let mut i = 0;
        while i < registry.len() {
            if !registry[i].alive.load(Ordering::Acquire) {
                finished.push(registry.swap_remove(i));
            } else {
                i += 1;
            }
        }
    }
    for handle in finished {
        tracing::trace!(worker = handle.id, "reaped retired worker");
        let _ = handle.join.join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU64;
    use std::sync::Arc;

    fn small_pool(core: usize, cap: usize) -> WorkerPool {
        let mut config = PoolConfig::new(cap);
        config.core_threads = core;
        config.keep_alive = Duration::from_millis(50);
        config.load_check_interval = Duration::from_millis(10);
        config.cooldown = Duration::from_millis(20);
        WorkerPool::with_config(config)
    }

    #[test]
    fn submit_runs_and_returns_value() {
        let pool = small_pool(2, 16);
        pool.start().unwrap();

        let handle = pool.submit(|| 21 * 2).unwrap();
        assert_eq!(handle.wait(), Ok(42));

        pool.stop(StopMode::Graceful).unwrap();
        assert_eq!(pool.state(), PoolState::Stopped);
    }

    #[test]
    fn post_runs_fire_and_forget() {
        let pool = small_pool(2, 16);
        pool.start().unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..100 {
            let counter = Arc::clone(&counter);
            pool.post(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        pool.stop(StopMode::Graceful).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 100);
    }

    #[test]
    fn double_start_is_rejected() {
        let pool = small_pool(1, 8);
        pool.start().unwrap();
        assert_eq!(pool.start(), Err(PoolError::AlreadyStarted));
        pool.stop(StopMode::Graceful).unwrap();
    }

    #[test]
    fn double_stop_is_rejected() {
        let pool = small_pool(1, 8);
        pool.start().unwrap();
        pool.stop(StopMode::Graceful).unwrap();
        assert_eq!(pool.stop(StopMode::Graceful), Err(PoolError::AlreadyStopped));
    }

    #[test]
    fn stop_before_start_is_rejected() {
        let pool = small_pool(1, 8);
        assert_eq!(pool.stop(StopMode::Graceful), Err(PoolError::NotStarted));
        assert_eq!(pool.state(), PoolState::Created);
    }

    #[test]
    fn submit_before_start_queues_until_workers_arrive() {
        let pool = small_pool(1, 8);
        let handle = pool.submit(|| 7).unwrap();
        assert_eq!(pool.pending(), 1);

        pool.start().unwrap();
        assert_eq!(handle.wait(), Ok(7));
        pool.stop(StopMode::Graceful).unwrap();
    }

    #[test]
    fn submit_after_stop_is_rejected_and_counted() {
        let pool = small_pool(1, 8);
        pool.start().unwrap();
        pool.stop(StopMode::Graceful).unwrap();

        assert_eq!(pool.submit(|| 1).unwrap_err(), PoolError::Rejected);
        assert_eq!(pool.post(|| {}).unwrap_err(), PoolError::Rejected);
        assert_eq!(pool.statistics().total_rejected, 2);
    }

    #[test]
    fn graceful_stop_drains_everything() {
        let pool = small_pool(2, 64);
        pool.start().unwrap();

        let counter = Arc::new(AtomicU64::new(0));
        for _ in 0..50 {
            let counter = Arc::clone(&counter);
            pool.post(move || {
                counter.fetch_add(1, Ordering::Relaxed);
            })
            .unwrap();
        }

        pool.stop(StopMode::Graceful).unwrap();
        assert_eq!(counter.load(Ordering::Relaxed), 50);
        assert_eq!(pool.pending(), 0);
        assert_eq!(pool.active_tasks(), 0);
        assert_eq!(pool.current_threads(), 0);
    }

    #[test]
    fn panicking_task_counts_failed_and_worker_survives() {
        let pool = small_pool(1, 16);
        pool.start().unwrap();

        let handle = pool.submit(|| -> u32 { panic!("intentional test panic") }).unwrap();
        assert!(matches!(handle.wait(), Err(TaskError::Panicked(_))));

        // The same worker keeps serving tasks.
        let handle = pool.submit(|| 5).unwrap();
        assert_eq!(handle.wait(), Ok(5));

        pool.stop(StopMode::Graceful).unwrap();
        let stats = pool.statistics();
        assert_eq!(stats.total_failed, 1);
        assert_eq!(stats.total_completed, 1);
        assert!(stats.is_balanced());
    }

    #[test]
    fn policy_can_be_swapped_at_runtime() {
        let pool = small_pool(1, 8);
        assert_eq!(pool.queue_full_policy(), QueueFullPolicy::Block);
        pool.set_queue_full_policy(QueueFullPolicy::Discard);
        assert_eq!(pool.queue_full_policy(), QueueFullPolicy::Discard);
    }

    #[test]
    fn post_batch_accepts_what_fits() {
        let pool = small_pool(1, 8);
        // Not started: tasks queue up; capacity bounds acceptance.
        let accepted = pool.post_batch((0..20).map(|_| || {}));
        assert_eq!(accepted, 8);
        assert_eq!(pool.pending(), 8);

        pool.start().unwrap();
        pool.stop(StopMode::Graceful).unwrap();
        assert_eq!(pool.statistics().total_submitted, 8);
    }

    #[test]
    fn statistics_balance_at_quiescence() {
        let pool = small_pool(2, 32);
        pool.start().unwrap();

        for i in 0..40u32 {
            let _ = pool.submit(move || i * 2);
        }
        pool.stop(StopMode::Graceful).unwrap();

        let stats = pool.statistics();
        assert_eq!(stats.total_submitted, 40);
        assert_eq!(stats.total_completed, 40);
        assert!(stats.is_balanced());
        assert!(stats.avg_exec_time <= stats.total_exec_time);
    }

    #[test]
    fn reset_statistics_clears_counters() {
        let pool = small_pool(1, 8);
        pool.start().unwrap();
        pool.submit(|| ()).unwrap().wait().unwrap();

        pool.reset_statistics();
        let stats = pool.statistics();
        assert_eq!(stats.total_submitted, 0);
        assert_eq!(stats.total_completed, 0);

        pool.stop(StopMode::Graceful).unwrap();
    }

    #[test]
    fn drop_stops_the_pool() {
        let counter = Arc::new(AtomicU64::new(0));
        {
            let pool = small_pool(2, 32);
            pool.start().unwrap();
            for _ in 0..20 {
                let counter = Arc::clone(&counter);
                pool.post(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                })
                .unwrap();
            }
        }
        assert_eq!(counter.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn trigger_load_check_updates_gauges() {
        let pool = small_pool(1, 8);
        pool.start().unwrap();
        pool.trigger_load_check();
        thread::sleep(Duration::from_millis(50));
        // Idle pool: ratios settle at zero.
        let stats = pool.statistics();
        assert_eq!(stats.busy_ratio, 0.0);
        pool.stop(StopMode::Graceful).unwrap();
    }
}
