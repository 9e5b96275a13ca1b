//! # Allocation Pool
//!
//! One address range with first-fit allocation and coalescing free.

use alloc::collections::BTreeMap;

use pnm_core::{Error, PoolRange, Result};

// =============================================================================
// RESERVATION
// =============================================================================

/// An outstanding allocation inside a pool
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Reservation {
    /// Size passed by the caller
    requested: u64,
    /// Size actually taken from the pool (after granularity rounding)
    reserved: u64,
}

impl Reservation {
    fn matches(&self, size: u64) -> bool {
        size == self.requested || size == self.reserved
    }
}

// =============================================================================
// POOL STATISTICS
// =============================================================================

/// Pool statistics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    /// Successful allocations
    pub allocations: u64,
    /// Successful frees
    pub frees: u64,
    /// Allocations rejected for lack of a large enough free region
    pub failed_allocations: u64,
    /// High water mark of reserved bytes
    pub peak_used: u64,
}

// =============================================================================
// ALLOCATION POOL
// =============================================================================

/// A single address range managed independently of the other pools
#[derive(Debug)]
pub struct AllocationPool {
    /// Managed range
    range: PoolRange,
    /// Free regions: start -> length, never adjacent to each other
    free: BTreeMap<u64, u64>,
    /// Outstanding allocations by start address
    used: BTreeMap<u64, Reservation>,
    /// Sum of free region lengths
    free_size: u64,
    /// Statistics
    stats: PoolStats,
}

impl AllocationPool {
    /// Create a pool with the whole range free
    pub fn new(range: PoolRange) -> Self {
        let mut free = BTreeMap::new();
        free.insert(range.base(), range.extent());

        Self {
            range,
            free,
            used: BTreeMap::new(),
            free_size: range.extent(),
            stats: PoolStats::default(),
        }
    }

    /// Managed range
    pub fn range(&self) -> PoolRange {
        self.range
    }

    /// Total size of the pool
    pub fn total_size(&self) -> u64 {
        self.range.extent()
    }

    /// Bytes not covered by any outstanding allocation
    pub fn free_size(&self) -> u64 {
        self.free_size
    }

    /// Bytes reserved by outstanding allocations
    pub fn used_size(&self) -> u64 {
        self.total_size() - self.free_size
    }

    /// Number of outstanding allocations
    pub fn outstanding(&self) -> usize {
        self.used.len()
    }

    /// Number of disjoint free regions
    pub fn free_region_count(&self) -> usize {
        self.free.len()
    }

    /// Get pool statistics
    pub fn stats(&self) -> &PoolStats {
        &self.stats
    }

    /// Reserve `reserved` bytes at the lowest address that is a multiple of
    /// `align` and fits in a free region.
    ///
    /// `requested` is remembered so a later free may name either size.
    /// `align` must be a power of two (1 for byte granularity).
    pub fn allocate(&mut self, requested: u64, reserved: u64, align: u64) -> Result<u64> {
        if reserved == 0 || !align.is_power_of_two() {
            return Err(Error::InvalidArgument);
        }

        let mask = align - 1;
        let found = self.free.iter().find_map(|(&start, &len)| {
            let address = start.checked_add(mask)? & !mask;
            let end = address.checked_add(reserved)?;
            (end <= start + len).then_some((start, len, address))
        });

        let Some((start, len, address)) = found else {
            self.stats.failed_allocations += 1;
            return Err(Error::OutOfMemory);
        };

        self.free.remove(&start);
        if address > start {
            self.free.insert(start, address - start);
        }
        let tail_start = address + reserved;
        let region_end = start + len;
        if region_end > tail_start {
            self.free.insert(tail_start, region_end - tail_start);
        }

        self.used.insert(address, Reservation { requested, reserved });
        self.free_size -= reserved;
        self.stats.allocations += 1;
        self.stats.peak_used = self.stats.peak_used.max(self.used_size());

        Ok(address)
    }

    /// Release the allocation starting at `address`.
    ///
    /// `size` must be the size given to the allocation or the size reserved
    /// for it. Returns the number of bytes given back to the pool.
    pub fn free(&mut self, address: u64, size: u64) -> Result<u64> {
        let reservation = self
            .used
            .get(&address)
            .copied()
            .ok_or(Error::InvalidArgument)?;

        if !reservation.matches(size) {
            return Err(Error::InvalidArgument);
        }

        self.used.remove(&address);
        self.insert_free(address, reservation.reserved);
        self.free_size += reservation.reserved;
        self.stats.frees += 1;

        Ok(reservation.reserved)
    }

    /// Drop every outstanding allocation and statistic.
    ///
    /// Returns the number of allocations and bytes that were still held.
    pub fn reset(&mut self) -> (usize, u64) {
        let leaked = (self.outstanding(), self.used_size());

        self.free.clear();
        self.free.insert(self.range.base(), self.range.extent());
        self.used.clear();
        self.free_size = self.range.extent();
        self.stats = PoolStats::default();

        leaked
    }

    /// Insert a free region, merging it with adjacent free regions
    fn insert_free(&mut self, address: u64, len: u64) {
        let mut start = address;
        let mut len = len;
        let end = address + len;

        if let Some((&prev_start, &prev_len)) = self.free.range(..address).next_back() {
            if prev_start + prev_len == address {
                self.free.remove(&prev_start);
                start = prev_start;
                len += prev_len;
            }
        }

        if let Some(next_len) = self.free.remove(&end) {
            len += next_len;
        }

        self.free.insert(start, len);
    }
}
