//! # Address Space Management
//!
//! The collaborator interface the process lifecycle is written against.
//! Sizes are byte counts of the user region `[0, size)`.

use spindle_hal::{CpuId, VirtAddr};

use crate::MemResult;

/// Address space identifier
///
/// Copyable handle; several schedulable units may hold the same one when
/// they share an address space.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AddressSpaceId(u64);

impl AddressSpaceId {
    /// Build a handle from its raw value
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Raw value
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl core::fmt::Display for AddressSpaceId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Address space operations required by the process lifecycle
pub trait AddressSpaceManager: Send + Sync {
    /// Create a zero-filled address space of `size` bytes
    fn create(&self, size: usize) -> MemResult<AddressSpaceId>;

    /// Deep-copy the first `size` bytes of `src` into a new address space
    fn duplicate(&self, src: AddressSpaceId, size: usize) -> MemResult<AddressSpaceId>;

    /// Grow or shrink `space` from `old_size` to `new_size`, returning the
    /// new size
    fn resize(&self, space: AddressSpaceId, old_size: usize, new_size: usize) -> MemResult<usize>;

    /// Tear down `space` and release its memory
    fn destroy(&self, space: AddressSpaceId);

    /// Check that `[addr, addr + len)` is mapped user memory
    fn validate_region(&self, space: AddressSpaceId, addr: VirtAddr, len: usize) -> bool;

    /// Copy `bytes` into `space` at `addr`
    fn copy_out(&self, space: AddressSpaceId, addr: VirtAddr, bytes: &[u8]) -> MemResult<()>;

    /// Copy `buf.len()` bytes out of `space` at `addr`
    fn copy_in(&self, space: AddressSpaceId, addr: VirtAddr, buf: &mut [u8]) -> MemResult<()>;

    /// Switch `cpu` to `space`, or to the kernel-only mapping for `None`
    fn activate(&self, cpu: CpuId, space: Option<AddressSpaceId>);
}
