//! # PNM Device
//!
//! Composite request flows over the resource components, scoped to the
//! consumer that issues them.

use log::{debug, error, info};
use parking_lot::Mutex;

use pnm_alloc::PoolAllocator;
use pnm_core::{AllocationDescriptor, Error, Result};
use pnm_sched::ComputeUnitScheduler;
use pnm_shared::SharedAllocationRegistry;

use crate::config::DeviceConfig;
use crate::consumer::{ConsumerId, ConsumerRelease, ConsumerResources, ConsumerTracker, Departure};

// =============================================================================
// REQUEST TYPES
// =============================================================================

/// Pool targeted by an allocation request
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PoolSelector {
    /// A specific pool
    Index(u8),
    /// The pool with the most free space at the time of the request
    MostFree,
}

impl From<u8> for PoolSelector {
    fn from(pool: u8) -> Self {
        Self::Index(pool)
    }
}

/// Outcome of [`PnmDevice::deallocate`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Deallocation {
    /// A shared reference was dropped, others remain and the memory stays
    SharedReleased {
        /// References left on the shared entry
        remaining: u64,
    },
    /// The memory went back to its pool
    Freed,
}

// =============================================================================
// DEVICE
// =============================================================================

/// Resource manager of one PNM device
///
/// Every request names the consumer it comes from. A consumer may only free,
/// share or release what is recorded against it, and the descriptor it
/// recorded, not the one passed in, decides how memory is released.
///
/// Memory requests (allocate, deallocate, share, attach) are serialized on a
/// device-level lock so that the allocator, the registry and the consumer
/// records are always seen in agreement. Cunit requests go straight to the
/// scheduler.
#[derive(Debug)]
pub struct PnmDevice {
    allocator: PoolAllocator,
    scheduler: ComputeUnitScheduler,
    shared: SharedAllocationRegistry,
    consumers: ConsumerTracker,
    memory_lock: Mutex<()>,
}

impl PnmDevice {
    /// Build the device resources from `config`
    pub fn new(config: DeviceConfig) -> Result<Self> {
        config.validate()?;

        let allocator = PoolAllocator::new(config.granularity, &config.pools)?;
        allocator.set_force_aligned(config.force_aligned);
        let scheduler =
            ComputeUnitScheduler::new(config.nr_cunits, config.acquisition_timeout_ns)?;

        info!(
            "PNM device initialized: {} pools, {} bytes, {} cunits, aligned = {}, cleanup = {}",
            config.pools.len(),
            config.total_memory(),
            config.nr_cunits,
            config.force_aligned,
            config.cleanup
        );

        Ok(Self {
            allocator,
            scheduler,
            shared: SharedAllocationRegistry::new(),
            consumers: ConsumerTracker::new(config.cleanup),
            memory_lock: Mutex::new(()),
        })
    }

    // -------------------------------------------------------------------------
    // Consumers
    // -------------------------------------------------------------------------

    /// Open a registration for `id`, returns the number of open registrations
    pub fn register_consumer(&self, id: ConsumerId) -> u32 {
        self.consumers.register(id)
    }

    /// Close a registration for `id`
    ///
    /// When the last registration closes, whatever the consumer still holds
    /// is reclaimed if cleanup is enabled and parked on the leaked list
    /// otherwise. Reclaiming keeps going past a failed release and reports
    /// the first error at the end.
    pub fn release_consumer(&self, id: ConsumerId) -> Result<ConsumerRelease> {
        let resources = match self.consumers.release(id)? {
            Departure::Open(refs) => return Ok(ConsumerRelease::Open { refs }),
            Departure::Gone(resources) if resources.is_empty() => {
                return Ok(ConsumerRelease::Clean)
            },
            Departure::Gone(resources) => resources,
        };

        if self.consumers.cleanup_enabled() {
            self.reclaim(id, &resources)
        } else {
            self.consumers.track_leaked(id, resources);
            Ok(ConsumerRelease::Leaked)
        }
    }

    /// Turn cleanup on or off
    ///
    /// Turning it on reclaims everything on the leaked list.
    pub fn set_cleanup(&self, enabled: bool) -> Result<()> {
        debug!("{} cleanup", if enabled { "Enabling" } else { "Disabling" });
        self.consumers.set_cleanup(enabled);
        if !enabled {
            return Ok(());
        }

        let mut result = Ok(());
        for (id, resources) in self.consumers.take_leaked() {
            if let Err(err) = self.reclaim(id, &resources) {
                result = result.and(Err(err));
            }
        }
        result
    }

    /// Whether departing consumers get their resources reclaimed
    pub fn cleanup_enabled(&self) -> bool {
        self.consumers.cleanup_enabled()
    }

    /// Number of departed consumers whose resources are parked
    pub fn leaked(&self) -> usize {
        self.consumers.leaked()
    }

    fn reclaim(&self, id: ConsumerId, resources: &ConsumerResources) -> Result<ConsumerRelease> {
        let mut result = Ok(());
        let mut cunits = 0;

        let mut mask = resources.cunit_mask;
        while mask != 0 {
            let cunit = mask.trailing_zeros() as u8;
            mask &= mask - 1;
            info!("Abnormal release cunit[{}], {}", cunit, id);
            match self.scheduler.release_and_wakeup(cunit) {
                Ok(()) => cunits += 1,
                Err(err) => result = result.and(Err(err)),
            }
        }

        for desc in &resources.allocations {
            info!("Abnormal release {:?}, {}", desc, id);
            let _guard = self.memory_lock.lock();
            if let Err(err) = self.release_memory(*desc) {
                result = result.and(Err(err));
            }
        }

        result.map(|()| ConsumerRelease::Reclaimed {
            allocations: resources.allocations.len(),
            cunits,
        })
    }

    // -------------------------------------------------------------------------
    // Memory
    // -------------------------------------------------------------------------

    /// Allocate `size` bytes for `id` and describe the allocation
    ///
    /// The descriptor carries the requested size, which is what
    /// [`deallocate`](Self::deallocate) hands back to the allocator.
    pub fn allocate(
        &self,
        id: ConsumerId,
        pool: PoolSelector,
        size: u64,
    ) -> Result<AllocationDescriptor> {
        let _guard = self.memory_lock.lock();
        self.ensure_registered(id)?;

        let (pool_id, address) = match pool {
            PoolSelector::Index(idx) => (idx, self.allocator.malloc(idx, size)?),
            PoolSelector::MostFree => self.allocator.malloc_any(size)?,
        };

        let desc = AllocationDescriptor::new(address, size, pool_id);
        if let Err(err) = self.consumers.register_alloc(id, desc) {
            self.allocator.free(pool_id, address, size)?;
            return Err(err);
        }

        debug!("Allocated {:?} for {}", desc, id);
        Ok(desc)
    }

    /// Release an allocation held by `id`
    ///
    /// `desc` names the allocation by pool and address and must carry its
    /// size. The memory only returns to the pool once the last shared
    /// reference is gone.
    pub fn deallocate(&self, id: ConsumerId, desc: AllocationDescriptor) -> Result<Deallocation> {
        let _guard = self.memory_lock.lock();

        let held = self
            .consumers
            .held_alloc(id, desc.pool_id(), desc.address())?;
        if held.size() != desc.size() {
            error!("{} holds {:?}, asked to free {:?}", id, held, desc);
            return Err(Error::InvalidArgument);
        }

        let outcome = self.release_memory(held)?;
        self.consumers
            .remove_alloc(id, held.pool_id(), held.address())?;
        Ok(outcome)
    }

    /// Publish an allocation held by `id` for other consumers
    ///
    /// Returns the stored descriptor, marked global, which also replaces the
    /// owner's record. The owner's reference is the first one on the entry.
    pub fn make_shared(
        &self,
        id: ConsumerId,
        desc: AllocationDescriptor,
    ) -> Result<AllocationDescriptor> {
        let _guard = self.memory_lock.lock();

        let held = self
            .consumers
            .held_alloc(id, desc.pool_id(), desc.address())?;
        if held.size() != desc.size() {
            error!("{} holds {:?}, asked to share {:?}", id, held, desc);
            return Err(Error::InvalidArgument);
        }

        let stored = self.shared.create_entry(held)?;
        self.consumers.update_alloc(id, stored)?;
        Ok(stored)
    }

    /// Attach `id` to the shared allocation at `address`
    ///
    /// Fails with [`Error::AlreadyExists`] if `id` already holds it.
    pub fn get_shared(&self, id: ConsumerId, address: u64) -> Result<AllocationDescriptor> {
        let _guard = self.memory_lock.lock();
        self.ensure_registered(id)?;

        let desc = self.shared.get_alloc(address)?;
        if let Err(err) = self.consumers.register_alloc(id, desc) {
            self.shared.remove_alloc(address)?;
            return Err(err);
        }
        Ok(desc)
    }

    /// Drop one reference to `desc` and free the memory at the last one
    ///
    /// Runs under the memory lock. Nothing changes when an error is returned.
    fn release_memory(&self, desc: AllocationDescriptor) -> Result<Deallocation> {
        let address = desc.address();

        if !desc.is_global() {
            if self.shared.contains(address) {
                error!("Private free of shared allocation {:?}", desc);
                return Err(Error::InvalidState);
            }
            self.allocator.free(desc.pool_id(), address, desc.size())?;
            return Ok(Deallocation::Freed);
        }

        let (stored, refs) = self.shared.lookup(address).ok_or_else(|| {
            error!("No shared allocation for {:?}", desc);
            Error::NotFound
        })?;
        if stored.pool_id() != desc.pool_id() || stored.size() != desc.size() {
            error!("{:?} does not match shared {:?}", desc, stored);
            return Err(Error::InvalidArgument);
        }

        if refs > 1 {
            let remaining = self.shared.remove_alloc(address)?;
            debug!(
                "Shared allocation 0x{:x} still has {} references",
                address, remaining
            );
            return Ok(Deallocation::SharedReleased { remaining });
        }

        self.allocator.free(stored.pool_id(), address, stored.size())?;
        self.shared.remove_alloc(address)?;
        Ok(Deallocation::Freed)
    }

    fn ensure_registered(&self, id: ConsumerId) -> Result<()> {
        if self.consumers.is_registered(id) {
            Ok(())
        } else {
            error!("{} is not registered", id);
            Err(Error::InvalidArgument)
        }
    }

    // -------------------------------------------------------------------------
    // Compute units
    // -------------------------------------------------------------------------

    /// Acquire a free cunit among those set in `mask` for `id`, blocking if
    /// none is
    pub fn acquire_cunit(&self, id: ConsumerId, mask: u64) -> Result<u8> {
        self.ensure_registered(id)?;

        let cunit = self.scheduler.get_free_cunit(mask)?;
        if let Err(err) = self.consumers.register_cunit(id, cunit) {
            // The consumer went away while waiting
            self.scheduler.release_and_wakeup(cunit)?;
            return Err(err);
        }
        Ok(cunit)
    }

    /// Release a cunit held by `id`
    ///
    /// Fails with [`Error::InvalidState`] if `id` does not hold it.
    pub fn release_cunit(&self, id: ConsumerId, cunit: u8) -> Result<()> {
        self.consumers.remove_cunit(id, cunit)?;
        self.scheduler.release_cunit(cunit).inspect_err(|err| {
            error!("Failed to release cunit {}: {}", cunit, err);
        })
    }

    // -------------------------------------------------------------------------
    // Device
    // -------------------------------------------------------------------------

    /// Return every resource to its initial state
    ///
    /// Shared entries are dropped before the pools are recreated, then the
    /// consumer records and the leaked list are cleared, then the cunits are
    /// freed. Consumer registrations stay open. The caller guarantees no
    /// request is in flight.
    pub fn reset(&self) {
        {
            let _guard = self.memory_lock.lock();
            self.shared.reset();
            self.allocator.reset();
            self.consumers.reset();
        }
        self.scheduler.reset();
        info!("PNM device reset");
    }

    /// Pool allocator
    pub fn allocator(&self) -> &PoolAllocator {
        &self.allocator
    }

    /// Compute-unit scheduler
    pub fn scheduler(&self) -> &ComputeUnitScheduler {
        &self.scheduler
    }

    /// Shared allocation registry
    pub fn shared(&self) -> &SharedAllocationRegistry {
        &self.shared
    }

    /// Consumer records
    pub fn consumers(&self) -> &ConsumerTracker {
        &self.consumers
    }
}

// =============================================================================
// TESTS
// =============================================================================
