//! # Device Configuration
//!
//! Initialization parameters supplied by the configuration loader. Fixed for
//! the lifetime of a [`PnmDevice`](crate::PnmDevice); changing the pool
//! topology or the cunit count means building a new device.

use log::error;

use pnm_alloc::MAX_POOLS;
use pnm_core::{Error, PoolRange, Result};
use pnm_sched::{MAX_CUNITS, NO_TIMEOUT};

// ============================================================================
// CONFIGURATION
// ============================================================================

/// Default allocation granularity (one 4 KiB page)
pub const DEFAULT_GRANULARITY: u64 = 0x1000;

/// PNM device configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    /// Allocation granularity in bytes (power of two)
    pub granularity: u64,
    /// Device address range of each pool, in pool-id order
    pub pools: Vec<PoolRange>,
    /// Number of compute units
    pub nr_cunits: u8,
    /// Bound on a blocked cunit acquisition, [`NO_TIMEOUT`] waits forever
    pub acquisition_timeout_ns: u64,
    /// Round allocation sizes and addresses to the granularity
    pub force_aligned: bool,
    /// Reclaim what a departing consumer still holds instead of parking it
    /// on the leaked list
    pub cleanup: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            granularity: DEFAULT_GRANULARITY,
            pools: Vec::new(),
            nr_cunits: 1,
            acquisition_timeout_ns: NO_TIMEOUT,
            force_aligned: false,
            cleanup: false,
        }
    }
}

impl DeviceConfig {
    /// Create a configuration with the given pools and cunit count
    pub fn new(pools: Vec<PoolRange>, nr_cunits: u8) -> Self {
        Self {
            pools,
            nr_cunits,
            ..Default::default()
        }
    }

    /// Set the allocation granularity
    pub fn with_granularity(mut self, granularity: u64) -> Self {
        self.granularity = granularity;
        self
    }

    /// Append a pool
    pub fn with_pool(mut self, pool: PoolRange) -> Self {
        self.pools.push(pool);
        self
    }

    /// Set the cunit acquisition timeout
    pub fn with_acquisition_timeout(mut self, timeout_ns: u64) -> Self {
        self.acquisition_timeout_ns = timeout_ns;
        self
    }

    /// Enable or disable the aligned allocation policy
    pub fn with_force_aligned(mut self, aligned: bool) -> Self {
        self.force_aligned = aligned;
        self
    }

    /// Enable or disable reclaiming resources of departing consumers
    pub fn with_cleanup(mut self, cleanup: bool) -> Self {
        self.cleanup = cleanup;
        self
    }

    /// Sum of all pool extents
    pub fn total_memory(&self) -> u64 {
        self.pools
            .iter()
            .fold(0u64, |acc, pool| acc.saturating_add(pool.extent()))
    }

    /// Check the configuration before any component is built
    pub fn validate(&self) -> Result<()> {
        if !self.granularity.is_power_of_two() {
            error!("Invalid granularity {}", self.granularity);
            return Err(Error::InvalidArgument);
        }

        if self.pools.is_empty() || self.pools.len() > MAX_POOLS {
            error!("Invalid number of pools {}", self.pools.len());
            return Err(Error::InvalidArgument);
        }

        for (i, a) in self.pools.iter().enumerate() {
            for (j, b) in self.pools.iter().enumerate().skip(i + 1) {
                if a.overlaps(b) {
                    error!("Pool[{}] overlaps pool[{}]", i, j);
                    return Err(Error::InvalidArgument);
                }
            }
        }

        if self.nr_cunits == 0 || self.nr_cunits as usize > MAX_CUNITS {
            error!("Invalid number of cunits {}", self.nr_cunits);
            return Err(Error::InvalidArgument);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIB: u64 = 1 << 20;

    fn range(base: u64, extent: u64) -> PoolRange {
        PoolRange::new(base, extent).unwrap()
    }

    #[test]
    fn test_default() {
        let config = DeviceConfig::default();
        assert_eq!(config.granularity, 4096);
        assert!(config.pools.is_empty());
        assert_eq!(config.nr_cunits, 1);
        assert_eq!(config.acquisition_timeout_ns, NO_TIMEOUT);
        assert!(!config.force_aligned);
        assert!(!config.cleanup);

        // No pools
        assert_eq!(config.validate(), Err(Error::InvalidArgument));
    }

    #[test]
    fn test_builder() {
        let config = DeviceConfig::new(vec![range(0, MIB)], 4)
            .with_pool(range(MIB, MIB))
            .with_granularity(0x200)
            .with_acquisition_timeout(1_000)
            .with_force_aligned(true)
            .with_cleanup(true);

        assert_eq!(config.pools.len(), 2);
        assert!(config.cleanup);
        assert_eq!(config.nr_cunits, 4);
        assert_eq!(config.granularity, 0x200);
        assert_eq!(config.acquisition_timeout_ns, 1_000);
        assert!(config.force_aligned);
        assert_eq!(config.total_memory(), 2 * MIB);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects() {
        let good = DeviceConfig::new(vec![range(0, MIB)], 2);
        assert!(good.validate().is_ok());

        let bad_gran = good.clone().with_granularity(3000);
        assert_eq!(bad_gran.validate(), Err(Error::InvalidArgument));

        let overlap = good.clone().with_pool(range(MIB / 2, MIB));
        assert_eq!(overlap.validate(), Err(Error::InvalidArgument));

        let no_cunits = DeviceConfig::new(vec![range(0, MIB)], 0);
        assert_eq!(no_cunits.validate(), Err(Error::InvalidArgument));

        let too_many = DeviceConfig::new(vec![range(0, MIB)], 65);
        assert_eq!(too_many.validate(), Err(Error::InvalidArgument));
    }
}
