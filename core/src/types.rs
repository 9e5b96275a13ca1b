//! # PNM Core Types
//!
//! Fundamental type definitions shared across the resource core.
//!
//! These types provide:
//! - The boundary-crossing allocation descriptor with a fixed byte layout
//! - Validated pool address ranges

use core::fmt;

use bytemuck::{Pod, Zeroable};
use static_assertions::const_assert_eq;

use crate::error::{Error, Result};

// =============================================================================
// ALLOCATION DESCRIPTOR
// =============================================================================

/// Size in bytes of an encoded [`AllocationDescriptor`]
pub const DESCRIPTOR_SIZE: usize = 18;

/// Allocation descriptor
///
/// Produced by an allocation call and never modified afterwards. The layout
/// is `address` (64-bit), `size` (64-bit), `pool_id` (8-bit) and `is_global`
/// (8-bit flag) packed with no padding, so the record can be copied across a
/// process or privilege boundary byte for byte.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default, Pod, Zeroable)]
#[repr(C, packed)]
pub struct AllocationDescriptor {
    address: u64,
    size: u64,
    pool_id: u8,
    is_global: u8,
}

const_assert_eq!(core::mem::size_of::<AllocationDescriptor>(), DESCRIPTOR_SIZE);
const_assert_eq!(core::mem::align_of::<AllocationDescriptor>(), 1);

impl AllocationDescriptor {
    /// Create a private (non-global) descriptor
    #[inline]
    pub const fn new(address: u64, size: u64, pool_id: u8) -> Self {
        Self {
            address,
            size,
            pool_id,
            is_global: 0,
        }
    }

    /// Copy of this descriptor with the global flag set or cleared
    #[inline]
    pub const fn with_global(self, is_global: bool) -> Self {
        Self {
            is_global: is_global as u8,
            ..self
        }
    }

    /// Start address
    #[inline]
    pub const fn address(&self) -> u64 {
        self.address
    }

    /// Size in bytes
    #[inline]
    pub const fn size(&self) -> u64 {
        self.size
    }

    /// Pool the allocation was taken from
    #[inline]
    pub const fn pool_id(&self) -> u8 {
        self.pool_id
    }

    /// Whether the allocation is shared through the registry
    #[inline]
    pub const fn is_global(&self) -> bool {
        self.is_global != 0
    }

    /// Exclusive end address (saturating)
    #[inline]
    pub const fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    /// Check whether two descriptors in the same pool overlap
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.pool_id == other.pool_id
            && self.address < other.end()
            && other.address < self.end()
    }

    /// Borrow the wire representation
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        bytemuck::bytes_of(self)
    }

    /// Encode to the wire representation
    #[inline]
    pub fn to_bytes(self) -> [u8; DESCRIPTOR_SIZE] {
        bytemuck::cast(self)
    }

    /// Decode from the wire representation
    ///
    /// Fails with [`Error::InvalidArgument`] on a length mismatch or a global
    /// flag other than 0 or 1.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() != DESCRIPTOR_SIZE {
            return Err(Error::InvalidArgument);
        }

        let desc: Self = bytemuck::pod_read_unaligned(bytes);
        if desc.is_global > 1 {
            return Err(Error::InvalidArgument);
        }

        Ok(desc)
    }
}

impl fmt::Debug for AllocationDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Fields of a packed struct cannot be borrowed, copy them out first.
        let (address, size, pool_id) = (self.address, self.size, self.pool_id);
        f.debug_struct("AllocationDescriptor")
            .field("address", &format_args!("0x{:x}", address))
            .field("size", &size)
            .field("pool_id", &pool_id)
            .field("is_global", &self.is_global())
            .finish()
    }
}

// =============================================================================
// POOL RANGE
// =============================================================================

/// Address range `[base, base + extent)` managed as one pool
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PoolRange {
    base: u64,
    extent: u64,
}

impl PoolRange {
    /// Create a range, rejecting empty and overflowing ranges
    pub const fn new(base: u64, extent: u64) -> Result<Self> {
        if extent == 0 {
            return Err(Error::InvalidArgument);
        }
        if base.checked_add(extent).is_none() {
            return Err(Error::InvalidArgument);
        }
        Ok(Self { base, extent })
    }

    /// First address of the range
    #[inline]
    pub const fn base(&self) -> u64 {
        self.base
    }

    /// Length of the range in bytes
    #[inline]
    pub const fn extent(&self) -> u64 {
        self.extent
    }

    /// Exclusive end address
    #[inline]
    pub const fn end(&self) -> u64 {
        self.base + self.extent
    }

    /// Check whether two ranges share at least one address
    #[inline]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.base < other.end() && other.base < self.end()
    }

    /// Check whether `[address, address + size)` lies fully inside the range
    pub const fn contains(&self, address: u64, size: u64) -> bool {
        match address.checked_add(size) {
            Some(end) => address >= self.base && end <= self.end(),
            None => false,
        }
    }
}

impl fmt::Debug for PoolRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PoolRange(0x{:x}..0x{:x})", self.base, self.end())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_layout() {
        let desc = AllocationDescriptor::new(0x1122_3344_5566_7788, 0x1000, 3).with_global(true);
        let bytes = desc.to_bytes();

        assert_eq!(bytes.len(), DESCRIPTOR_SIZE);
        assert_eq!(&bytes[0..8], &0x1122_3344_5566_7788u64.to_ne_bytes());
        assert_eq!(&bytes[8..16], &0x1000u64.to_ne_bytes());
        assert_eq!(bytes[16], 3);
        assert_eq!(bytes[17], 1);
        assert_eq!(desc.as_bytes(), &bytes[..]);
    }

    #[test]
    fn test_descriptor_decode() {
        let desc = AllocationDescriptor::new(0x4000, 0x2000, 1);
        let decoded = AllocationDescriptor::from_bytes(&desc.to_bytes()).unwrap();
        assert_eq!(decoded, desc);
        assert!(!decoded.is_global());

        assert_eq!(
            AllocationDescriptor::from_bytes(&[0u8; 17]),
            Err(Error::InvalidArgument)
        );

        let mut bad = desc.to_bytes();
        bad[17] = 2;
        assert_eq!(
            AllocationDescriptor::from_bytes(&bad),
            Err(Error::InvalidArgument)
        );
    }

    #[test]
    fn test_descriptor_overlap() {
        let a = AllocationDescriptor::new(0x1000, 0x1000, 0);
        let b = AllocationDescriptor::new(0x1800, 0x1000, 0);
        let c = AllocationDescriptor::new(0x2000, 0x1000, 0);
        let d = AllocationDescriptor::new(0x1800, 0x1000, 1);

        assert!(a.overlaps(&b));
        assert!(!a.overlaps(&c));
        assert!(!a.overlaps(&d));
        assert_eq!(a.end(), 0x2000);
    }

    #[test]
    fn test_pool_range() {
        assert_eq!(PoolRange::new(0, 0), Err(Error::InvalidArgument));
        assert_eq!(PoolRange::new(u64::MAX, 2), Err(Error::InvalidArgument));

        let range = PoolRange::new(0x10_0000, 0x10_0000).unwrap();
        assert_eq!(range.end(), 0x20_0000);
        assert!(range.contains(0x10_0000, 0x10_0000));
        assert!(!range.contains(0x1F_F000, 0x2000));
        assert!(!range.contains(u64::MAX, 1));

        let next = PoolRange::new(0x20_0000, 0x1000).unwrap();
        let inner = PoolRange::new(0x1F_F000, 0x2000).unwrap();
        assert!(!range.overlaps(&next));
        assert!(range.overlaps(&inner));
        assert!(inner.overlaps(&next));
    }
}
