//! # PNM Core
//!
//! Types shared by every piece of the near-memory accelerator resource core.
//!
//! The pool allocator, the compute-unit scheduler and the shared allocation
//! registry are independent of each other. What they have in common lives
//! here:
//!
//! - **Error taxonomy**: one [`Error`] enum for every component
//! - **Allocation descriptor**: the fixed-layout record that crosses the
//!   device boundary
//! - **Pool ranges**: the address ranges handed to the allocator
//! - **Cache padding**: false-sharing avoidance for hot scheduler fields
//!
//! ## Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────┐
//! │                         pnm-device                           │
//! │  ┌──────────────┐  ┌──────────────────┐  ┌────────────────┐  │
//! │  │  pnm-alloc   │  │    pnm-sched     │  │   pnm-shared   │  │
//! │  │ PoolAllocator│  │ ComputeUnitSched │  │ SharedRegistry │  │
//! │  └──────┬───────┘  └────────┬─────────┘  └───────┬────────┘  │
//! │         └───────────────────┼────────────────────┘           │
//! │                       ┌─────┴─────┐                          │
//! │                       │  pnm-core │                          │
//! │                       └───────────┘                          │
//! └──────────────────────────────────────────────────────────────┘
//! ```

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

#[cfg(test)]
extern crate std;

pub mod cache;
pub mod error;
pub mod types;

// Re-exports for convenience
pub use cache::CachePadded;
pub use error::{Error, Result};
pub use types::{AllocationDescriptor, PoolRange, DESCRIPTOR_SIZE};
