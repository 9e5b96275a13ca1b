//! # PNM Device
//!
//! One [`PnmDevice`] per processing-near-memory device. It owns the pool
//! allocator, the compute-unit scheduler, the shared allocation registry and
//! the per-consumer resource records, and implements the request flows the
//! driver layer maps its ioctl-style calls onto.
//!
//! ```text
//!   request(consumer) ──▶ PnmDevice ──┬──▶ ConsumerTracker          (who holds what)
//!                                     ├──▶ PoolAllocator            (allocate / deallocate)
//!                                     ├──▶ SharedAllocationRegistry (share / attach / detach)
//!                                     └──▶ ComputeUnitScheduler     (acquire / release)
//! ```
//!
//! The components share no state. Ordering between them, such as
//! allocate-then-share or unshare-then-free, is imposed here.

#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod config;
pub mod consumer;
pub mod device;

pub use config::DeviceConfig;
pub use consumer::{ConsumerId, ConsumerRelease, ConsumerResources, ConsumerTracker};
pub use device::{Deallocation, PnmDevice, PoolSelector};

pub use pnm_alloc::{PoolAllocator, MAX_POOLS};
pub use pnm_core::{AllocationDescriptor, Error, PoolRange, Result};
pub use pnm_sched::{ComputeUnitScheduler, CunitInfo, CunitState, MAX_CUNITS, NO_TIMEOUT};
pub use pnm_shared::SharedAllocationRegistry;
