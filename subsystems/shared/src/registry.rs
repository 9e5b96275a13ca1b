//! # Shared Allocation Registry
//!
//! Address-ordered map of shared allocations with per-entry reference counts.
//!
//! ```text
//!   create_entry ──▶ ref=1 ──get_alloc──▶ ref=2 ──get_alloc──▶ ref=N
//!                      ▲                                         │
//!                      └──────────── remove_alloc ◀──────────────┘
//!                  ref 1 -> 0 : entry erased
//! ```

use alloc::collections::btree_map::{BTreeMap, Entry};

use log::{debug, error, info};
use spin::Mutex;

use pnm_core::{AllocationDescriptor, Error, Result};

// =============================================================================
// ENTRY
// =============================================================================

/// One shared allocation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct SharedEntry {
    /// Stored descriptor, always marked global
    allocation: AllocationDescriptor,
    /// Live references, never zero while the entry exists
    ref_count: u64,
}

// =============================================================================
// REGISTRY
// =============================================================================

/// Registry of reference-counted shared allocations, keyed by address
///
/// Lookups are exact-address matches. Two entries never share an address.
#[derive(Debug, Default)]
pub struct SharedAllocationRegistry {
    entries: Mutex<BTreeMap<u64, SharedEntry>>,
}

impl SharedAllocationRegistry {
    /// Create an empty registry
    pub const fn new() -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    /// Drop every entry regardless of its reference count
    ///
    /// Callers must make sure no consumer still relies on the entries.
    pub fn reset(&self) {
        let mut entries = self.entries.lock();
        let dropped = entries.len();
        entries.clear();
        info!("Shared allocations reset, {} entries dropped", dropped);
    }

    /// Register `allocation` as shared with one reference
    ///
    /// The stored descriptor is marked global and returned. Fails with
    /// [`Error::AlreadyExists`] if an entry with the same address exists.
    pub fn create_entry(&self, allocation: AllocationDescriptor) -> Result<AllocationDescriptor> {
        let allocation = allocation.with_global(true);
        let address = allocation.address();

        match self.entries.lock().entry(address) {
            Entry::Occupied(_) => {
                error!("Shared allocation at 0x{:x} already exists", address);
                Err(Error::AlreadyExists)
            }
            Entry::Vacant(slot) => {
                slot.insert(SharedEntry {
                    allocation,
                    ref_count: 1,
                });
                debug!("Shared allocation registered: {:?}", allocation);
                Ok(allocation)
            }
        }
    }

    /// Attach to the shared allocation at `address`
    ///
    /// Takes a reference and returns the stored descriptor. Fails with
    /// [`Error::NotFound`] if no entry exists at `address`.
    pub fn get_alloc(&self, address: u64) -> Result<AllocationDescriptor> {
        let mut entries = self.entries.lock();
        let entry = entries.get_mut(&address).ok_or_else(|| {
            error!("No shared allocation at 0x{:x}", address);
            Error::NotFound
        })?;

        entry.ref_count += 1;
        debug!(
            "Shared allocation 0x{:x} attached, refs = {}",
            address, entry.ref_count
        );
        Ok(entry.allocation)
    }

    /// Drop one reference to the shared allocation at `address`
    ///
    /// Returns the number of references left. At zero the entry is erased
    /// and the caller owns the underlying memory again. Fails with
    /// [`Error::NotFound`] if no entry exists at `address`.
    pub fn remove_alloc(&self, address: u64) -> Result<u64> {
        let mut entries = self.entries.lock();
        let Entry::Occupied(mut slot) = entries.entry(address) else {
            error!("No shared allocation at 0x{:x}", address);
            return Err(Error::NotFound);
        };

        let entry = slot.get_mut();
        entry.ref_count -= 1;
        let remaining = entry.ref_count;
        if remaining == 0 {
            slot.remove();
            debug!("Shared allocation 0x{:x} released", address);
        } else {
            debug!(
                "Shared allocation 0x{:x} detached, refs = {}",
                address, remaining
            );
        }
        Ok(remaining)
    }

    /// Stored descriptor and reference count of the entry at `address`
    ///
    /// Takes no reference.
    pub fn lookup(&self, address: u64) -> Option<(AllocationDescriptor, u64)> {
        self.entries
            .lock()
            .get(&address)
            .map(|e| (e.allocation, e.ref_count))
    }

    /// Current reference count of the entry at `address`
    pub fn ref_count(&self, address: u64) -> Option<u64> {
        self.entries.lock().get(&address).map(|e| e.ref_count)
    }

    /// Check if an entry exists at `address`
    pub fn contains(&self, address: u64) -> bool {
        self.entries.lock().contains_key(&address)
    }

    /// Number of entries
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    /// Check if the registry has no entries
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }
}

// =============================================================================
// TESTS
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::vec::Vec;

    fn desc(address: u64) -> AllocationDescriptor {
        AllocationDescriptor::new(address, 0x2000, 1)
    }

    #[test]
    fn test_create_marks_global() {
        let registry = SharedAllocationRegistry::new();
        let stored = registry.create_entry(desc(0x1000)).unwrap();

        assert!(stored.is_global());
        assert_eq!(stored.address(), 0x1000);
        assert_eq!(stored.size(), 0x2000);
        assert_eq!(stored.pool_id(), 1);
        assert_eq!(registry.ref_count(0x1000), Some(1));
    }

    #[test]
    fn test_duplicate_address() {
        let registry = SharedAllocationRegistry::new();
        registry.create_entry(desc(0x1000)).unwrap();

        let other = AllocationDescriptor::new(0x1000, 0x10, 0);
        assert_eq!(registry.create_entry(other), Err(Error::AlreadyExists));
        assert_eq!(registry.len(), 1);
        assert_eq!(registry.get_alloc(0x1000).unwrap().size(), 0x2000);
    }

    #[test]
    fn test_exact_address_match() {
        let registry = SharedAllocationRegistry::new();
        registry.create_entry(desc(0x1000)).unwrap();

        // Inside the range but not at its start
        assert_eq!(registry.get_alloc(0x1800), Err(Error::NotFound));
        assert_eq!(registry.remove_alloc(0x1800), Err(Error::NotFound));
        assert!(registry.create_entry(desc(0x1800)).is_ok());
    }

    #[test]
    fn test_refcount_lifecycle() {
        let registry = SharedAllocationRegistry::new();
        registry.create_entry(desc(0x4000)).unwrap();

        const GETS: u64 = 5;
        for _ in 0..GETS {
            assert!(registry.get_alloc(0x4000).unwrap().is_global());
        }
        assert_eq!(registry.ref_count(0x4000), Some(GETS + 1));

        for left in (0..=GETS).rev() {
            assert_eq!(registry.remove_alloc(0x4000), Ok(left));
        }

        assert!(!registry.contains(0x4000));
        assert_eq!(registry.get_alloc(0x4000), Err(Error::NotFound));
        assert_eq!(registry.remove_alloc(0x4000), Err(Error::NotFound));
    }

    #[test]
    fn test_lookup_takes_no_reference() {
        let registry = SharedAllocationRegistry::new();
        assert_eq!(registry.lookup(0x1000), None);

        registry.create_entry(desc(0x1000)).unwrap();
        registry.get_alloc(0x1000).unwrap();

        let (stored, refs) = registry.lookup(0x1000).unwrap();
        assert!(stored.is_global());
        assert_eq!(stored.size(), 0x2000);
        assert_eq!(refs, 2);
        assert_eq!(registry.ref_count(0x1000), Some(2));
    }

    #[test]
    fn test_reset() {
        let registry = SharedAllocationRegistry::new();
        for i in 1..=4 {
            registry.create_entry(desc(i * 0x1000)).unwrap();
        }
        registry.get_alloc(0x2000).unwrap();
        assert_eq!(registry.len(), 4);

        registry.reset();
        assert!(registry.is_empty());
        assert_eq!(registry.get_alloc(0x2000), Err(Error::NotFound));

        // Addresses are reusable after a reset
        registry.create_entry(desc(0x2000)).unwrap();
        assert_eq!(registry.ref_count(0x2000), Some(1));
    }

    #[test]
    fn test_concurrent_attach_detach() {
        let registry = Arc::new(SharedAllocationRegistry::new());
        registry.create_entry(desc(0x8000)).unwrap();

        let handles: Vec<_> = (0..8)
            .map(|_| {
                let registry = Arc::clone(&registry);
                thread::spawn(move || {
                    for _ in 0..500 {
                        registry.get_alloc(0x8000).unwrap();
                        assert!(registry.remove_alloc(0x8000).unwrap() >= 1);
                    }
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        assert_eq!(registry.ref_count(0x8000), Some(1));
        assert_eq!(registry.remove_alloc(0x8000), Ok(0));
        assert!(registry.is_empty());
    }
}
