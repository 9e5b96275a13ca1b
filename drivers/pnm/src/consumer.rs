//! # Consumer Tracking
//!
//! Resources a device hands out are recorded against the consumer (for
//! example a user process) that requested them.
//!
//! ```text
//!   register ──▶ refs += 1
//!   release  ──▶ refs -= 1 ──(0)──┬── nothing held ─────────────▶ gone
//!                                 ├── cleanup on  ──▶ reclaimed ─▶ gone
//!                                 └── cleanup off ──▶ leaked list
//! ```
//!
//! A consumer may only free or release what is recorded against it. While
//! cleanup is off, the resources of a consumer that went away still holding
//! something stay allocated and are parked on the leaked list. Turning
//! cleanup on reclaims everything parked there.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};

use log::{debug, error};
use parking_lot::Mutex;

use pnm_core::{AllocationDescriptor, Error, Result};

// =============================================================================
// IDENTIFIERS
// =============================================================================

/// Identity of a resource consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ConsumerId(pub u64);

impl fmt::Display for ConsumerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "consumer#{}", self.0)
    }
}

/// Allocations are recorded by pool and address
type AllocKey = (u8, u64);

fn key(desc: &AllocationDescriptor) -> AllocKey {
    (desc.pool_id(), desc.address())
}

fn cunit_bit(cunit: u8) -> Option<u64> {
    1u64.checked_shl(u32::from(cunit))
}

// =============================================================================
// RESOURCES
// =============================================================================

/// Everything one consumer holds
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ConsumerResources {
    /// Allocations, as the consumer last received them
    pub allocations: Vec<AllocationDescriptor>,
    /// Held cunits, bit `i` for cunit `i`
    pub cunit_mask: u64,
}

impl ConsumerResources {
    /// Check if nothing is held
    pub fn is_empty(&self) -> bool {
        self.allocations.is_empty() && self.cunit_mask == 0
    }
}

/// Live record of a registered consumer
#[derive(Debug, Default)]
struct ConsumerEntry {
    /// Open registrations
    refs: u32,
    allocations: BTreeMap<AllocKey, AllocationDescriptor>,
    cunit_mask: u64,
}

impl ConsumerEntry {
    fn take_resources(&mut self) -> ConsumerResources {
        ConsumerResources {
            allocations: core::mem::take(&mut self.allocations).into_values().collect(),
            cunit_mask: core::mem::take(&mut self.cunit_mask),
        }
    }
}

/// Result of dropping one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Departure {
    /// Other registrations remain
    Open(u32),
    /// Last registration gone, these resources were still held
    Gone(ConsumerResources),
}

/// Outcome of [`PnmDevice::release_consumer`](crate::PnmDevice::release_consumer)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConsumerRelease {
    /// Other registrations of the consumer remain open
    Open {
        /// Registrations left
        refs: u32,
    },
    /// The consumer held nothing
    Clean,
    /// Held resources were returned to the device
    Reclaimed {
        /// Allocations released
        allocations: usize,
        /// Cunits released
        cunits: u32,
    },
    /// Held resources were parked on the leaked list
    Leaked,
}

// =============================================================================
// TRACKER
// =============================================================================

/// Per-consumer record of allocations and cunits
#[derive(Debug)]
pub struct ConsumerTracker {
    consumers: Mutex<BTreeMap<ConsumerId, ConsumerEntry>>,
    leaked: Mutex<Vec<(ConsumerId, ConsumerResources)>>,
    cleanup: AtomicBool,
}

impl ConsumerTracker {
    /// Create a tracker with the given cleanup policy
    pub fn new(cleanup: bool) -> Self {
        Self {
            consumers: Mutex::new(BTreeMap::new()),
            leaked: Mutex::new(Vec::new()),
            cleanup: AtomicBool::new(cleanup),
        }
    }

    /// Open a registration, returns the number of open registrations
    pub(crate) fn register(&self, id: ConsumerId) -> u32 {
        let mut consumers = self.consumers.lock();
        let entry = consumers.entry(id).or_default();
        entry.refs += 1;
        if entry.refs == 1 {
            debug!("Registered {}", id);
        }
        entry.refs
    }

    /// Close a registration
    pub(crate) fn release(&self, id: ConsumerId) -> Result<Departure> {
        let mut consumers = self.consumers.lock();
        let entry = consumers.get_mut(&id).ok_or_else(|| {
            error!("Tried to release unregistered {}", id);
            Error::InvalidArgument
        })?;

        entry.refs -= 1;
        if entry.refs > 0 {
            return Ok(Departure::Open(entry.refs));
        }

        let resources = entry.take_resources();
        consumers.remove(&id);
        debug!("Releasing {}", id);
        Ok(Departure::Gone(resources))
    }

    /// Check if `id` has an open registration
    pub fn is_registered(&self, id: ConsumerId) -> bool {
        self.consumers.lock().contains_key(&id)
    }

    /// Number of registered consumers
    pub fn len(&self) -> usize {
        self.consumers.lock().len()
    }

    /// Check if no consumer is registered
    pub fn is_empty(&self) -> bool {
        self.consumers.lock().is_empty()
    }

    fn with_entry<T>(
        &self,
        id: ConsumerId,
        f: impl FnOnce(&mut ConsumerEntry) -> Result<T>,
    ) -> Result<T> {
        let mut consumers = self.consumers.lock();
        let entry = consumers.get_mut(&id).ok_or_else(|| {
            error!("{} is not registered", id);
            Error::InvalidArgument
        })?;
        f(entry)
    }

    // -------------------------------------------------------------------------
    // Allocations
    // -------------------------------------------------------------------------

    /// Record an allocation handed to `id`
    ///
    /// Fails with [`Error::AlreadyExists`] if `id` already holds it.
    pub(crate) fn register_alloc(&self, id: ConsumerId, desc: AllocationDescriptor) -> Result<()> {
        self.with_entry(id, |entry| {
            if entry.allocations.contains_key(&key(&desc)) {
                error!("{} already holds {:?}", id, desc);
                return Err(Error::AlreadyExists);
            }
            entry.allocations.insert(key(&desc), desc);
            Ok(())
        })
    }

    /// Replace the record of an allocation `id` holds, keyed by pool and
    /// address
    pub(crate) fn update_alloc(&self, id: ConsumerId, desc: AllocationDescriptor) -> Result<()> {
        self.with_entry(id, |entry| match entry.allocations.get_mut(&key(&desc)) {
            Some(held) => {
                *held = desc;
                Ok(())
            }
            None => {
                error!("{} does not hold {:?}", id, desc);
                Err(Error::NotFound)
            }
        })
    }

    /// Recorded descriptor of the allocation at `pool`/`address` held by `id`
    pub fn held_alloc(&self, id: ConsumerId, pool: u8, address: u64) -> Result<AllocationDescriptor> {
        self.with_entry(id, |entry| {
            entry.allocations.get(&(pool, address)).copied().ok_or_else(|| {
                error!("{} does not hold pool[{}] 0x{:x}", id, pool, address);
                Error::NotFound
            })
        })
    }

    /// Forget an allocation `id` holds
    pub(crate) fn remove_alloc(&self, id: ConsumerId, pool: u8, address: u64) -> Result<AllocationDescriptor> {
        self.with_entry(id, |entry| {
            entry.allocations.remove(&(pool, address)).ok_or(Error::NotFound)
        })
    }

    // -------------------------------------------------------------------------
    // Cunits
    // -------------------------------------------------------------------------

    /// Record a cunit acquired by `id`
    pub(crate) fn register_cunit(&self, id: ConsumerId, cunit: u8) -> Result<()> {
        let bit = cunit_bit(cunit).ok_or(Error::InvalidArgument)?;
        self.with_entry(id, |entry| {
            entry.cunit_mask |= bit;
            Ok(())
        })
    }

    /// Check that `id` holds `cunit`
    pub fn holds_cunit(&self, id: ConsumerId, cunit: u8) -> Result<bool> {
        self.with_entry(id, |entry| {
            Ok(cunit_bit(cunit).is_some_and(|bit| entry.cunit_mask & bit != 0))
        })
    }

    /// Forget a cunit `id` holds
    ///
    /// Fails with [`Error::InvalidState`] if `id` does not hold it.
    pub(crate) fn remove_cunit(&self, id: ConsumerId, cunit: u8) -> Result<()> {
        self.with_entry(id, |entry| {
            match cunit_bit(cunit) {
                Some(bit) if entry.cunit_mask & bit != 0 => {
                    entry.cunit_mask &= !bit;
                    Ok(())
                }
                _ => {
                    error!("{} does not hold cunit[{}]", id, cunit);
                    Err(Error::InvalidState)
                }
            }
        })
    }

    /// Everything `id` currently holds
    pub fn resources(&self, id: ConsumerId) -> Result<ConsumerResources> {
        self.with_entry(id, |entry| {
            Ok(ConsumerResources {
                allocations: entry.allocations.values().copied().collect(),
                cunit_mask: entry.cunit_mask,
            })
        })
    }

    // -------------------------------------------------------------------------
    // Leaks and cleanup policy
    // -------------------------------------------------------------------------

    /// Whether departing consumers get their resources reclaimed
    pub fn cleanup_enabled(&self) -> bool {
        self.cleanup.load(Ordering::Acquire)
    }

    pub(crate) fn set_cleanup(&self, enabled: bool) {
        self.cleanup.store(enabled, Ordering::Release);
    }

    /// Park the resources of a departed consumer
    pub(crate) fn track_leaked(&self, id: ConsumerId, resources: ConsumerResources) {
        debug!(
            "Tracked leakage by {}: cunit_mask = 0x{:x}, {} allocations",
            id,
            resources.cunit_mask,
            resources.allocations.len()
        );
        for desc in &resources.allocations {
            debug!("Leaked memory under {:?}", desc);
        }
        self.leaked.lock().push((id, resources));
    }

    /// Take every parked entry off the leaked list
    pub(crate) fn take_leaked(&self) -> Vec<(ConsumerId, ConsumerResources)> {
        core::mem::take(&mut *self.leaked.lock())
    }

    /// Number of departed consumers whose resources are parked
    pub fn leaked(&self) -> usize {
        self.leaked.lock().len()
    }

    /// Drop the leaked list and every live consumer's records
    ///
    /// Registrations stay open. Used when the device itself is reset and
    /// the recorded resources no longer exist.
    pub(crate) fn reset(&self) {
        self.leaked.lock().clear();
        for entry in self.consumers.lock().values_mut() {
            entry.take_resources();
        }
    }
}

impl Default for ConsumerTracker {
    fn default() -> Self {
        Self::new(false)
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;

    const A: ConsumerId = ConsumerId(10);
    const B: ConsumerId = ConsumerId(20);

    #[test]
    fn test_registration_refs() {
        let tracker = ConsumerTracker::default();
        assert!(!tracker.cleanup_enabled());
        assert_eq!(tracker.register(A), 1);
        assert_eq!(tracker.register(A), 2);
        assert_eq!(tracker.len(), 1);

        assert_eq!(tracker.release(A), Ok(Departure::Open(1)));
        assert_eq!(
            tracker.release(A),
            Ok(Departure::Gone(ConsumerResources::default()))
        );
        assert!(tracker.is_empty());
        assert_eq!(tracker.release(A), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_unregistered_consumer() {
        let tracker = ConsumerTracker::default();
        let desc = AllocationDescriptor::new(0x1000, 0x100, 0);
        assert_eq!(tracker.register_alloc(B, desc), Err(Error::InvalidArgument));
        assert_eq!(tracker.register_cunit(B, 0), Err(Error::InvalidArgument));
        assert_eq!(tracker.resources(B), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_allocation_records() {
        let tracker = ConsumerTracker::default();
        tracker.register(A);
        tracker.register(B);

        let desc = AllocationDescriptor::new(0x1000, 0x100, 2);
        tracker.register_alloc(A, desc).unwrap();
        assert_eq!(tracker.register_alloc(A, desc), Err(Error::AlreadyExists));

        // Same address in another pool is a different allocation
        tracker
            .register_alloc(A, AllocationDescriptor::new(0x1000, 0x100, 3))
            .unwrap();

        assert_eq!(tracker.held_alloc(A, 2, 0x1000), Ok(desc));
        assert_eq!(tracker.held_alloc(B, 2, 0x1000), Err(Error::NotFound));

        tracker.update_alloc(A, desc.with_global(true)).unwrap();
        assert!(tracker.held_alloc(A, 2, 0x1000).unwrap().is_global());

        assert_eq!(tracker.remove_alloc(B, 2, 0x1000), Err(Error::NotFound));
        assert!(tracker.remove_alloc(A, 2, 0x1000).is_ok());
        assert_eq!(tracker.resources(A).unwrap().allocations.len(), 1);
    }

    #[test]
    fn test_cunit_records() {
        let tracker = ConsumerTracker::default();
        tracker.register(A);

        tracker.register_cunit(A, 0).unwrap();
        tracker.register_cunit(A, 63).unwrap();
        assert_eq!(tracker.resources(A).unwrap().cunit_mask, (1 << 63) | 1);
        assert_eq!(tracker.holds_cunit(A, 63), Ok(true));
        assert_eq!(tracker.holds_cunit(A, 5), Ok(false));
        assert_eq!(tracker.holds_cunit(A, 200), Ok(false));

        tracker.remove_cunit(A, 63).unwrap();
        assert_eq!(tracker.remove_cunit(A, 63), Err(Error::InvalidState));
        assert_eq!(tracker.remove_cunit(A, 200), Err(Error::InvalidState));
    }

    #[test]
    fn test_departure_with_resources() {
        let tracker = ConsumerTracker::default();
        tracker.register(A);
        let desc = AllocationDescriptor::new(0x2000, 0x100, 0);
        tracker.register_alloc(A, desc).unwrap();
        tracker.register_cunit(A, 1).unwrap();

        let Ok(Departure::Gone(resources)) = tracker.release(A) else {
            panic!("last registration should depart");
        };
        assert_eq!(resources.allocations, vec![desc]);
        assert_eq!(resources.cunit_mask, 0b10);
        assert!(!resources.is_empty());

        tracker.track_leaked(A, resources.clone());
        assert_eq!(tracker.leaked(), 1);
        assert_eq!(tracker.take_leaked(), vec![(A, resources)]);
        assert_eq!(tracker.leaked(), 0);
    }

    #[test]
    fn test_reset_keeps_registrations() {
        let tracker = ConsumerTracker::new(true);
        tracker.register(A);
        tracker
            .register_alloc(A, AllocationDescriptor::new(0x2000, 0x100, 0))
            .unwrap();
        tracker.register_cunit(A, 0).unwrap();
        tracker.track_leaked(B, ConsumerResources::default());

        tracker.reset();

        assert!(tracker.is_registered(A));
        assert!(tracker.resources(A).unwrap().is_empty());
        assert_eq!(tracker.leaked(), 0);
    }
}
