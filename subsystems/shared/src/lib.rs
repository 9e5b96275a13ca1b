//! # PNM Shared Allocations
//!
//! Reference-counted sharing of allocations between consumers.
//!
//! An allocation is registered once by its owner and may then be attached to
//! by any number of other consumers (for example other processes). Each
//! attach takes a reference; each detach drops one. The entry disappears
//! when the last reference is dropped, and the consumer that dropped it is
//! responsible for returning the memory to its pool.

#![no_std]
#![deny(unsafe_op_in_unsafe_fn)]
#![warn(missing_docs)]
#![warn(clippy::all)]

extern crate alloc;

#[cfg(test)]
extern crate std;

pub mod registry;

pub use registry::SharedAllocationRegistry;
