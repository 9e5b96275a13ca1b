//! # PNM Pool Allocator
//!
//! Address allocation over a fixed set of disjoint device address ranges.
//!
//! ## Architecture
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────┐
//! │                      PoolAllocator                        │
//! │        granularity · aligned policy · one lock            │
//! │                                                           │
//! │  ┌──────────────────┐ ┌──────────────────┐ ┌───────────┐  │
//! │  │ AllocationPool 0 │ │ AllocationPool 1 │ │    ...    │  │
//! │  │  free regions    │ │  free regions    │ │           │  │
//! │  │  reservations    │ │  reservations    │ │           │  │
//! │  └──────────────────┘ └──────────────────┘ └───────────┘  │
//! └───────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Allocator Design
//!
//! Each pool keeps an address-ordered map of free regions. Allocation is
//! first-fit in address order, so the same request sequence always yields the
//! same addresses. Freed regions are merged with their free neighbours.
//!
//! All pools sit behind one allocator-wide lock. Allocation in independent
//! pools is serialized, and there is no lock ordering between pools to get
//! wrong.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod allocator;
pub mod pool;

// Re-exports
pub use allocator::{PoolAllocator, MAX_POOLS};
pub use pool::{AllocationPool, PoolStats};
