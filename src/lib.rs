//! Bounded-queue worker pool with backpressure policies and dynamic scaling.
//!
//! Short-lived units of work flow from many producers into a fixed-capacity
//! lock-free MPMC ring, and out to a worker set that grows and shrinks with
//! observed load:
//!
//! - **Bounded by construction.** The task queue is a sequence-per-slot
//!   ring ([`stdx::mpmc`]); when it fills, the configured
//!   [`QueueFullPolicy`] decides whether the producer blocks, the new task
//!   is discarded, or the oldest queued task is displaced.
//! - **Observable outcomes.** Every submission resolves exactly once:
//!   a value, a captured panic, or a policy outcome (`Discarded`,
//!   `Overwritten`, `Cancelled`) delivered through its [`TaskHandle`].
//! - **Dynamic worker set.** A monitor thread samples queue depth and busy
//!   ratio, debounces, and scales between `core_threads` and
//!   `max_threads`; surplus workers retire after an idle `keep_alive`
//!   window.
//! - **Deliberate shutdown.** Graceful stop drains the queue; force stop
//!   cancels what has not started. In-flight tasks are never interrupted.
//!
//! # Quick start
//!
//! ```
//! use taskpool::{QueueFullPolicy, StopMode, WorkerPool};
//!
//! let pool = WorkerPool::new(4, 256);
//! pool.start().unwrap();
//!
//! let doubled = pool.submit(|| 21 * 2).unwrap();
//! assert_eq!(doubled.wait(), Ok(42));
//!
//! pool.set_queue_full_policy(QueueFullPolicy::Discard);
//! pool.post(|| println!("fire and forget")).unwrap();
//!
//! pool.stop(StopMode::Graceful).unwrap();
//! assert!(pool.statistics().is_balanced());
//! ```
//!
//! Configuration can also come from JSON (string, tree, or file); see
//! [`PoolConfig`].

pub mod pool;
pub mod stdx;

pub use pool::{
    BlockingQueue, ConfigError, PoolConfig, PoolError, PoolState, PoolStats, QueueFullPolicy,
    StopMode, TaskError, TaskHandle, TaskResult, WorkerPool,
};
pub use stdx::MpmcRing;
