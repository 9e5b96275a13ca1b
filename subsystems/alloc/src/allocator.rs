//! # Pool Allocator
//!
//! Services malloc/free requests over N disjoint device address pools.

use alloc::vec::Vec;

use log::{debug, error, info, warn};
use spin::Mutex;

use pnm_core::{Error, PoolRange, Result};

use crate::pool::{AllocationPool, PoolStats};

/// Maximum number of pools (pool identifiers are 8-bit)
pub const MAX_POOLS: usize = u8::MAX as usize + 1;

// =============================================================================
// ALLOCATOR STATE
// =============================================================================

/// State guarded by the allocator lock
#[derive(Debug)]
struct AllocatorInner {
    /// Round sizes and addresses to the granularity
    aligned: bool,
    /// Pools in index order
    pools: Vec<AllocationPool>,
}

impl AllocatorInner {
    fn pool(&self, idx: u8) -> Result<&AllocationPool> {
        self.pools.get(idx as usize).ok_or_else(|| {
            error!("Pool[{}] doesn't exist", idx);
            Error::InvalidArgument
        })
    }

    fn pool_mut(&mut self, idx: u8) -> Result<&mut AllocationPool> {
        self.pools.get_mut(idx as usize).ok_or_else(|| {
            error!("Pool[{}] doesn't exist", idx);
            Error::InvalidArgument
        })
    }

    /// Largest free size, ties broken by lowest index
    fn most_free_pool(&self) -> u8 {
        let mut best = 0;
        let mut best_free = 0;
        for (idx, pool) in self.pools.iter().enumerate() {
            if idx == 0 || pool.free_size() > best_free {
                best = idx;
                best_free = pool.free_size();
            }
        }
        best as u8
    }
}

// =============================================================================
// POOL ALLOCATOR
// =============================================================================

/// Pool-based address allocator
///
/// Every operation, per-pool queries included, takes the same allocator-wide
/// lock.
#[derive(Debug)]
pub struct PoolAllocator {
    /// Allocation granularity in bytes (power of two)
    granularity: u64,
    /// Pools and policy
    inner: Mutex<AllocatorInner>,
}

impl PoolAllocator {
    /// Create an allocator with one fully free pool per range
    ///
    /// Fails with [`Error::InvalidArgument`] if `granularity` is not a power
    /// of two, if `ranges` is empty or longer than [`MAX_POOLS`], or if two
    /// ranges overlap.
    pub fn new(granularity: u64, ranges: &[PoolRange]) -> Result<Self> {
        if !granularity.is_power_of_two() {
            error!("Memory granularity should be a power of 2, got {}", granularity);
            return Err(Error::InvalidArgument);
        }

        if ranges.is_empty() || ranges.len() > MAX_POOLS {
            error!("Unsupported number of pools: {}", ranges.len());
            return Err(Error::InvalidArgument);
        }

        for (i, a) in ranges.iter().enumerate() {
            if let Some((j, b)) = ranges
                .iter()
                .enumerate()
                .skip(i + 1)
                .find(|(_, b)| a.overlaps(b))
            {
                error!("Pool[{}] {:?} overlaps pool[{}] {:?}", i, a, j, b);
                return Err(Error::InvalidArgument);
            }
        }

        let pools = ranges
            .iter()
            .enumerate()
            .map(|(idx, &range)| {
                info!(
                    "Memory pool[{}] initialized: granularity=[{}], start=[0x{:x}], size=[{}]",
                    idx,
                    granularity,
                    range.base(),
                    range.extent()
                );
                AllocationPool::new(range)
            })
            .collect();

        Ok(Self {
            granularity,
            inner: Mutex::new(AllocatorInner {
                aligned: false,
                pools,
            }),
        })
    }

    /// Discard every outstanding allocation and recreate all pools fully free
    ///
    /// The caller guarantees that no other operation is in flight.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        for (idx, pool) in inner.pools.iter_mut().enumerate() {
            let (count, bytes) = pool.reset();
            if count != 0 {
                warn!(
                    "Pool[{}]: dropped {} non-deallocated objects ({} bytes) on reset",
                    idx, count, bytes
                );
            }
        }
        info!("Memory pools reset");
    }

    /// Allocate `size` bytes from pool `pool`
    ///
    /// With the aligned policy active the size is rounded up to the
    /// granularity and the returned address is a multiple of it.
    pub fn malloc(&self, pool: u8, size: u64) -> Result<u64> {
        let mut inner = self.inner.lock();
        self.malloc_locked(&mut inner, pool, size)
    }

    /// Allocate `size` bytes from the pool with the most free space
    ///
    /// Pool selection and allocation happen under one lock acquisition.
    /// Returns the chosen pool and the address.
    pub fn malloc_any(&self, size: u64) -> Result<(u8, u64)> {
        let mut inner = self.inner.lock();
        let pool = inner.most_free_pool();
        let address = self.malloc_locked(&mut inner, pool, size)?;
        Ok((pool, address))
    }

    fn malloc_locked(&self, inner: &mut AllocatorInner, pool: u8, size: u64) -> Result<u64> {
        if size == 0 {
            error!("Trying to allocate zero memory");
            return Err(Error::InvalidArgument);
        }

        let aligned = inner.aligned;
        let reserved = if aligned {
            self.align_size(size)?
        } else {
            size
        };
        let align = if aligned { self.granularity } else { 1 };

        let address = inner
            .pool_mut(pool)?
            .allocate(size, reserved, align)
            .inspect_err(|_| {
                error!(
                    "Pool[{}]: no free memory for object with size = [{}]",
                    pool, reserved
                );
            })?;

        debug!(
            "Allocated obj: pool[{}], addr = [0x{:x}], size = [{}], reserved = [{}]",
            pool, address, size, reserved
        );
        Ok(address)
    }

    /// Return an allocation to its pool
    ///
    /// `size` must be the size passed to [`malloc`](Self::malloc) or the
    /// size that was reserved for it.
    pub fn free(&self, pool: u8, address: u64, size: u64) -> Result<()> {
        let mut inner = self.inner.lock();
        let released = inner
            .pool_mut(pool)?
            .free(address, size)
            .inspect_err(|_| {
                error!(
                    "The object at 0x{:x} of size {} from pool[{}] doesn't exist",
                    address, size, pool
                );
            })?;

        debug!(
            "Freed obj: pool[{}], addr = [0x{:x}], size = [{}]",
            pool, address, released
        );
        Ok(())
    }

    /// Total size of all pools
    pub fn total_size(&self) -> u64 {
        self.inner.lock().pools.iter().map(|p| p.total_size()).sum()
    }

    /// Free size across all pools
    pub fn free_size(&self) -> u64 {
        self.inner.lock().pools.iter().map(|p| p.free_size()).sum()
    }

    /// Total size of one pool
    pub fn pool_total_size(&self, pool: u8) -> Result<u64> {
        Ok(self.inner.lock().pool(pool)?.total_size())
    }

    /// Free size of one pool
    pub fn pool_free_size(&self, pool: u8) -> Result<u64> {
        Ok(self.inner.lock().pool(pool)?.free_size())
    }

    /// Range managed by one pool
    pub fn pool_range(&self, pool: u8) -> Result<PoolRange> {
        Ok(self.inner.lock().pool(pool)?.range())
    }

    /// Statistics of one pool
    pub fn pool_stats(&self, pool: u8) -> Result<PoolStats> {
        Ok(*self.inner.lock().pool(pool)?.stats())
    }

    /// Number of outstanding allocations in one pool
    pub fn outstanding(&self, pool: u8) -> Result<usize> {
        Ok(self.inner.lock().pool(pool)?.outstanding())
    }

    /// Index of the pool with the largest free size (lowest index on ties)
    pub fn most_free_pool(&self) -> u8 {
        self.inner.lock().most_free_pool()
    }

    /// Number of pools
    pub fn nr_pools(&self) -> usize {
        self.inner.lock().pools.len()
    }

    /// Allocation granularity in bytes
    pub fn granularity(&self) -> u64 {
        self.granularity
    }

    /// Set the aligned policy for subsequent allocations
    pub fn set_force_aligned(&self, aligned: bool) {
        self.inner.lock().aligned = aligned;
    }

    /// Current aligned policy
    pub fn get_force_aligned(&self) -> bool {
        self.inner.lock().aligned
    }

    fn align_size(&self, size: u64) -> Result<u64> {
        let mask = self.granularity - 1;
        size.checked_add(mask)
            .map(|s| s & !mask)
            .ok_or(Error::InvalidArgument)
    }
}

impl Drop for PoolAllocator {
    fn drop(&mut self) {
        for (idx, pool) in self.inner.get_mut().pools.iter().enumerate() {
            if pool.outstanding() != 0 {
                warn!(
                    "Pool[{}]: non-deallocated objects on teardown, size: {}, avail: {}",
                    idx,
                    pool.total_size(),
                    pool.free_size()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec;
    use std::vec::Vec;

    const MIB: u64 = 1 << 20;
    const GRAN: u64 = 4096;

    fn three_pools() -> PoolAllocator {
        let ranges = [
            PoolRange::new(0, MIB).unwrap(),
            PoolRange::new(MIB, MIB).unwrap(),
            PoolRange::new(2 * MIB, MIB).unwrap(),
        ];
        PoolAllocator::new(GRAN, &ranges).unwrap()
    }

    /// Deterministic xorshift generator for request sequences
    struct XorShift(u64);

    impl XorShift {
        fn next(&mut self) -> u64 {
            self.0 ^= self.0 << 13;
            self.0 ^= self.0 >> 7;
            self.0 ^= self.0 << 17;
            self.0
        }
    }

    #[test]
    fn test_init_validation() {
        let range = PoolRange::new(0, MIB).unwrap();
        assert!(PoolAllocator::new(3000, &[range]).is_err());
        assert!(PoolAllocator::new(0, &[range]).is_err());
        assert_eq!(
            PoolAllocator::new(GRAN, &[]).unwrap_err(),
            Error::InvalidArgument
        );

        let overlapping = [range, PoolRange::new(MIB - 1, MIB).unwrap()];
        assert_eq!(
            PoolAllocator::new(GRAN, &overlapping).unwrap_err(),
            Error::InvalidArgument
        );

        let too_many: Vec<_> = (0..=MAX_POOLS as u64)
            .map(|i| PoolRange::new(i * GRAN, GRAN).unwrap())
            .collect();
        assert!(PoolAllocator::new(GRAN, &too_many).is_err());
        assert!(PoolAllocator::new(GRAN, &too_many[..MAX_POOLS]).is_ok());
    }

    #[test]
    fn test_aligned_round_trip() {
        let alloc = three_pools();
        alloc.set_force_aligned(true);

        let address = alloc.malloc(0, 4097).unwrap();
        assert_eq!(address % GRAN, 0);
        assert_eq!(alloc.pool_free_size(0).unwrap(), MIB - 8192);

        alloc.free(0, address, 4097).unwrap();
        assert_eq!(alloc.pool_free_size(0).unwrap(), MIB);
        assert_eq!(alloc.free_size(), 3 * MIB);
        assert_eq!(alloc.total_size(), 3 * MIB);
    }

    #[test]
    fn test_request_validation() {
        let alloc = three_pools();

        assert_eq!(alloc.malloc(3, 64), Err(Error::InvalidArgument));
        assert_eq!(alloc.malloc(0, 0), Err(Error::InvalidArgument));
        assert_eq!(alloc.malloc(0, MIB + 1), Err(Error::OutOfMemory));
        assert_eq!(alloc.free(7, 0, 64), Err(Error::InvalidArgument));
        assert_eq!(alloc.free(0, 0, 64), Err(Error::InvalidArgument));
        assert_eq!(alloc.pool_free_size(3), Err(Error::InvalidArgument));

        alloc.set_force_aligned(true);
        assert_eq!(alloc.malloc(0, u64::MAX), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_alignment_toggle_is_not_retroactive() {
        let alloc = three_pools();

        let unaligned = alloc.malloc(0, 100).unwrap();
        assert_eq!(unaligned, 0);
        assert_eq!(alloc.pool_free_size(0).unwrap(), MIB - 100);

        alloc.set_force_aligned(true);
        assert!(alloc.get_force_aligned());
        let aligned = alloc.malloc(0, 100).unwrap();
        assert_eq!(aligned, GRAN);
        assert_eq!(alloc.pool_free_size(0).unwrap(), MIB - 100 - GRAN);

        // The earlier allocation keeps its original size
        alloc.free(0, unaligned, 100).unwrap();
        alloc.set_force_aligned(false);
        alloc.free(0, aligned, 100).unwrap();
        assert_eq!(alloc.pool_free_size(0).unwrap(), MIB);
    }

    #[test]
    fn test_most_free_pool() {
        let alloc = three_pools();
        assert_eq!(alloc.most_free_pool(), 0);

        alloc.malloc(0, GRAN).unwrap();
        assert_eq!(alloc.most_free_pool(), 1);

        alloc.malloc(1, 2 * GRAN).unwrap();
        assert_eq!(alloc.most_free_pool(), 2);

        let (pool, _) = alloc.malloc_any(4 * GRAN).unwrap();
        assert_eq!(pool, 2);
        assert_eq!(alloc.most_free_pool(), 0);
    }

    #[test]
    fn test_conservation_and_no_overlap() {
        let alloc = three_pools();
        alloc.set_force_aligned(true);

        let mut rng = XorShift(0x9E37_79B9_7F4A_7C15);
        let mut live: Vec<(u8, u64, u64, u64)> = Vec::new();

        for _ in 0..2000 {
            let pool = (rng.next() % 3) as u8;
            if live.is_empty() || rng.next() % 3 != 0 {
                let size = 1 + rng.next() % (8 * GRAN);
                if let Ok(address) = alloc.malloc(pool, size) {
                    let reserved = (size + GRAN - 1) & !(GRAN - 1);
                    assert_eq!(address % GRAN, 0);
                    live.push((pool, address, size, reserved));
                }
            } else {
                let idx = (rng.next() as usize) % live.len();
                let (pool, address, size, _) = live.swap_remove(idx);
                alloc.free(pool, address, size).unwrap();
            }

            for p in 0..3u8 {
                let held: u64 = live
                    .iter()
                    .filter(|l| l.0 == p)
                    .map(|l| l.3)
                    .sum();
                assert_eq!(alloc.pool_free_size(p).unwrap(), MIB - held);
            }
        }

        for (i, a) in live.iter().enumerate() {
            let range = alloc.pool_range(a.0).unwrap();
            assert!(range.contains(a.1, a.3));
            for b in live.iter().skip(i + 1).filter(|b| b.0 == a.0) {
                assert!(a.1 + a.3 <= b.1 || b.1 + b.3 <= a.1);
            }
        }
    }

    #[test]
    fn test_reset() {
        let alloc = three_pools();
        let address = alloc.malloc(1, 4 * GRAN).unwrap();
        alloc.malloc(2, GRAN).unwrap();

        alloc.reset();
        assert_eq!(alloc.free_size(), 3 * MIB);
        assert_eq!(alloc.outstanding(1).unwrap(), 0);
        assert_eq!(alloc.free(1, address, 4 * GRAN), Err(Error::InvalidArgument));
        assert_eq!(alloc.malloc(1, 4 * GRAN), Ok(address));
    }

    #[test]
    fn test_concurrent_allocations() {
        let alloc = Arc::new(three_pools());
        alloc.set_force_aligned(true);

        let handles: Vec<_> = (0..4u8)
            .map(|t| {
                let alloc = Arc::clone(&alloc);
                thread::spawn(move || {
                    let pool = t % 3;
                    let mut held = vec![];
                    for i in 0..32u64 {
                        let size = GRAN * (1 + i % 3);
                        held.push((alloc.malloc(pool, size).unwrap(), size));
                    }
                    for (address, size) in held {
                        alloc.free(pool, address, size).unwrap();
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(alloc.free_size(), 3 * MIB);
        for pool in 0..3u8 {
            assert_eq!(alloc.outstanding(pool).unwrap(), 0);
        }
    }
}
