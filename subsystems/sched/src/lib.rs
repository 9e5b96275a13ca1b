//! # PNM Compute-Unit Scheduler
//!
//! Multiplexes a small fixed set of hardware compute units ("cunits") across
//! concurrent requesters.
//!
//! ## Protocol
//!
//! ```text
//!            get_free_cunit (fast path or after wakeup)
//!   ┌──────┐ ─────────────────────────────────────────▶ ┌──────┐
//!   │ FREE │                                            │ BUSY │
//!   └──────┘ ◀───────────────────────────────────────── └──────┘
//!              release_cunit / release_and_wakeup
//! ```
//!
//! A requester that finds no eligible free cunit blocks on a condition
//! variable. Every release wakes all blocked requesters, which then race for
//! the lock and rescan. The first one to find a matching free cunit wins.
//! There is no FIFO ordering between waiters, and a waiter with a narrow
//! request mask can starve under sustained contention.
//!
//! This crate needs `std`: blocking with a deadline requires an OS-backed
//! condition variable and clock.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod scheduler;
pub mod state;

// Re-exports
pub use scheduler::{ComputeUnitScheduler, MAX_CUNITS, NO_TIMEOUT};
pub use state::{CunitInfo, CunitState};
