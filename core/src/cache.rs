//! # Cache Padding
//!
//! Keeps frequently written fields on their own cache line so that contended
//! counters do not invalidate their neighbours on multi-socket hosts.

use core::fmt;
use core::ops::{Deref, DerefMut};

/// Cache line size assumed for padding
pub const CACHE_LINE_SIZE: usize = 64;

/// Value aligned and padded to a full cache line
#[repr(C, align(64))]
#[derive(Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePadded<T> {
    value: T,
}

impl<T> CachePadded<T> {
    /// Create a new cache-padded value
    pub const fn new(value: T) -> Self {
        Self { value }
    }

    /// Unwrap the padded value
    pub fn into_inner(self) -> T {
        self.value
    }
}

impl<T> Deref for CachePadded<T> {
    type Target = T;

    fn deref(&self) -> &Self::Target {
        &self.value
    }
}

impl<T> DerefMut for CachePadded<T> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.value
    }
}

impl<T: fmt::Debug> fmt::Debug for CachePadded<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.value.fmt(f)
    }
}

impl<T> From<T> for CachePadded<T> {
    fn from(value: T) -> Self {
        Self::new(value)
    }
}
