//! # Compute-Unit Scheduler
//!
//! Blocking acquire / explicit release over `nr_cunits` interchangeable units.

use std::sync::atomic::{AtomicU64, AtomicU8, Ordering};
use std::time::{Duration, Instant};

use log::{debug, error, info};
use parking_lot::{Condvar, Mutex, MutexGuard};

use pnm_core::{CachePadded, Error, Result};

use crate::state::{CunitInfo, CunitState};

/// Timeout value that makes `get_free_cunit` wait indefinitely
pub const NO_TIMEOUT: u64 = 0;

/// Maximum number of cunits (request masks are 64-bit)
pub const MAX_CUNITS: usize = u64::BITS as usize;

// =============================================================================
// PER-CUNIT SLOT
// =============================================================================

/// State and counter of one cunit, each on its own cache line
#[derive(Debug)]
struct CunitSlot {
    state: CachePadded<AtomicU8>,
    acquisition_count: CachePadded<AtomicU64>,
}

impl CunitSlot {
    fn new() -> Self {
        Self {
            state: CachePadded::new(AtomicU8::new(CunitState::Free.as_raw())),
            acquisition_count: CachePadded::new(AtomicU64::new(0)),
        }
    }

    fn state(&self) -> CunitState {
        CunitState::from_raw(self.state.load(Ordering::Acquire))
    }

    fn set_state(&self, state: CunitState) {
        self.state.store(state.as_raw(), Ordering::Release);
    }
}

// =============================================================================
// SCHEDULER
// =============================================================================

/// Compute-unit scheduler
///
/// State transitions happen under `lock`. Cunit states, acquisition counters
/// and the timeout are atomics so diagnostics can read them without the lock.
#[derive(Debug)]
pub struct ComputeUnitScheduler {
    states: Box<[CachePadded<CunitSlot>]>,
    nr_cunits: u8,
    wakeup: CachePadded<Condvar>,
    retry_timeout_ns: CachePadded<AtomicU64>,
    lock: CachePadded<Mutex<()>>,
}

impl ComputeUnitScheduler {
    /// Create a scheduler with every cunit free
    ///
    /// `timeout_ns` bounds the cumulative wait of [`get_free_cunit`]
    /// ([`NO_TIMEOUT`] waits forever).
    ///
    /// [`get_free_cunit`]: Self::get_free_cunit
    pub fn new(nr_cunits: u8, timeout_ns: u64) -> Result<Self> {
        if nr_cunits == 0 || nr_cunits as usize > MAX_CUNITS {
            error!("Unsupported number of cunits: {}", nr_cunits);
            return Err(Error::InvalidArgument);
        }

        debug!("Initializing pnm scheduler: {} cunits, timeout {} ns", nr_cunits, timeout_ns);

        Ok(Self {
            states: (0..nr_cunits).map(|_| CachePadded::new(CunitSlot::new())).collect(),
            nr_cunits,
            wakeup: CachePadded::new(Condvar::new()),
            retry_timeout_ns: CachePadded::new(AtomicU64::new(timeout_ns)),
            lock: CachePadded::new(Mutex::new(())),
        })
    }

    /// Number of cunits
    pub fn nr_cunits(&self) -> u8 {
        self.nr_cunits
    }

    /// Return every cunit to `Free`, zero the counters and wake all waiters
    ///
    /// The caller guarantees that no cunit is still held by anyone.
    pub fn reset(&self) {
        {
            let _guard = self.lock.lock();
            for slot in self.states.iter() {
                slot.set_state(CunitState::Free);
                slot.acquisition_count.store(0, Ordering::Release);
            }
        }
        self.wakeup.notify_all();
        info!("Scheduler reset: {} cunits free", self.nr_cunits());
    }

    /// Acquire a free cunit among those selected by `request_mask`
    ///
    /// Bit `i` of the mask makes cunit `i` acceptable. Eligible cunits are
    /// scanned in index order. When none is free the caller blocks until a
    /// release, then races the other waiters for the lock. Fails with
    /// [`Error::Timeout`] once the configured timeout has elapsed without
    /// success, and with [`Error::InvalidArgument`] for an empty mask or one
    /// naming a cunit that does not exist.
    pub fn get_free_cunit(&self, request_mask: u64) -> Result<u8> {
        if request_mask == 0 || request_mask & !self.valid_mask() != 0 {
            error!("Invalid req_msk value: 0x{:x}", request_mask);
            return Err(Error::InvalidArgument);
        }

        let mut guard = self.lock.lock();
        if let Some(cunit) = self.acquire_locked(&guard, request_mask) {
            debug!("Acquired cunit {} for req_msk 0x{:x}", cunit, request_mask);
            return Ok(cunit);
        }

        debug!("No free cunit for req_msk 0x{:x}, waiting", request_mask);

        // One deadline for the whole wait, across spurious and lost-race wakeups
        let timeout_ns = self.retry_timeout_ns.load(Ordering::Acquire);
        let deadline = if timeout_ns == NO_TIMEOUT {
            None
        } else {
            Instant::now().checked_add(Duration::from_nanos(timeout_ns))
        };

        loop {
            let timed_out = match deadline {
                Some(deadline) => self.wakeup.wait_until(&mut guard, deadline).timed_out(),
                None => {
                    self.wakeup.wait(&mut guard);
                    false
                },
            };

            if let Some(cunit) = self.acquire_locked(&guard, request_mask) {
                debug!("Acquired cunit {} for req_msk 0x{:x} after wait", cunit, request_mask);
                return Ok(cunit);
            }

            if timed_out {
                debug!("Timed out waiting for req_msk 0x{:x}", request_mask);
                return Err(Error::Timeout);
            }
        }
    }

    /// Mark a held cunit `Free` and wake all waiters
    ///
    /// Fails with [`Error::NotFound`] for an unknown cunit and with
    /// [`Error::InvalidState`] if the cunit is already free.
    pub fn release_cunit(&self, cunit: u8) -> Result<()> {
        debug!("Releasing cunit {}", cunit);
        let slot = self.slot(cunit)?;

        {
            let _guard = self.lock.lock();
            if slot.state() == CunitState::Free {
                error!("Cunit {} released while free", cunit);
                return Err(Error::InvalidState);
            }
            slot.set_state(CunitState::Free);
        }

        self.wakeup.notify_all();
        Ok(())
    }

    /// Release a cunit and wake every waiter
    ///
    /// Pure alias of [`release_cunit`](Self::release_cunit), which already
    /// broadcasts on every release. Error and cleanup paths call it by this
    /// name.
    #[inline]
    pub fn release_and_wakeup(&self, cunit: u8) -> Result<()> {
        self.release_cunit(cunit)
    }

    /// Current state of a cunit (lock-free, advisory)
    pub fn get_cunit_state(&self, cunit: u8) -> Result<CunitState> {
        Ok(self.slot(cunit)?.state())
    }

    /// Number of successful acquisitions of a cunit (lock-free, advisory)
    pub fn get_acquisition_count(&self, cunit: u8) -> Result<u64> {
        Ok(self.slot(cunit)?.acquisition_count.load(Ordering::Acquire))
    }

    /// Configured acquisition timeout in nanoseconds
    pub fn get_acquisition_timeout(&self) -> u64 {
        self.retry_timeout_ns.load(Ordering::Acquire)
    }

    /// Change the acquisition timeout for subsequent waits
    pub fn set_acquisition_timeout(&self, timeout_ns: u64) {
        let _guard = self.lock.lock();
        self.retry_timeout_ns.store(timeout_ns, Ordering::Release);
    }

    /// Bit mask of cunits currently `Busy`
    pub fn busy_mask(&self) -> u64 {
        self.states
            .iter()
            .enumerate()
            .filter(|(_, slot)| slot.state().is_busy())
            .fold(0, |mask, (idx, _)| mask | (1 << idx))
    }

    /// State and acquisition count of every cunit
    pub fn snapshot(&self) -> Vec<CunitInfo> {
        self.states
            .iter()
            .enumerate()
            .map(|(idx, slot)| CunitInfo {
                id: idx as u8,
                state: slot.state(),
                acquisition_count: slot.acquisition_count.load(Ordering::Acquire),
            })
            .collect()
    }

    fn slot(&self, cunit: u8) -> Result<&CunitSlot> {
        self.states.get(cunit as usize).map(|s| &**s).ok_or_else(|| {
            error!("Invalid cunit value: {}", cunit);
            Error::NotFound
        })
    }

    fn valid_mask(&self) -> u64 {
        match self.nr_cunits() as usize {
            MAX_CUNITS => u64::MAX,
            n => (1 << n) - 1,
        }
    }

    /// Take the lowest-indexed free cunit selected by `mask`
    fn acquire_locked(&self, _guard: &MutexGuard<'_, ()>, mask: u64) -> Option<u8> {
        let (idx, slot) = self
            .states
            .iter()
            .enumerate()
            .find(|(idx, slot)| mask & (1 << *idx) != 0 && slot.state() == CunitState::Free)?;

        slot.set_state(CunitState::Busy);
        slot.acquisition_count.fetch_add(1, Ordering::AcqRel);
        Some(idx as u8)
    }
}
