//! Small, self-contained concurrency structures used across the crate.
//!
//! # Scope
//! `stdx` hosts the narrow, allocation-light primitives that back the pool's
//! task queue. They are tuned for predictable memory use and fast paths
//! rather than general-purpose ergonomics.
//!
//! # Design themes
//! - Fixed, upfront capacity; backpressure is the caller's problem.
//! - Tight invariants enable `unsafe` fast paths (documented per type).
//! - Failure never consumes the caller's value.
//!
//! # Module map
//! - `mpmc`: lock-free bounded MPMC ring with per-slot sequence counters.
//!
//! # Safety
//! `mpmc` uses `unsafe` internally and relies on invariants called out in
//! its module docs. Read those before extending the internals.

pub mod mpmc;

pub use mpmc::MpmcRing;
