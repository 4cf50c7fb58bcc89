//! # Flat Address Spaces
//!
//! Every address space is one byte vector covering `[0, size)`. A global
//! byte budget stands in for physical memory so exhaustion can be
//! exercised.

use alloc::collections::BTreeMap;
use alloc::vec::Vec;

use spin::Mutex;
use spindle_hal::{CpuId, VirtAddr};

use crate::address_space::{AddressSpaceId, AddressSpaceManager};
use crate::{MemError, MemResult};

/// Counters exposed for diagnostics
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlatStats {
    /// Address spaces currently alive
    pub live_spaces: usize,
    /// Bytes held by live address spaces
    pub bytes_in_use: usize,
    /// Address spaces ever created (including duplicates)
    pub created: u64,
    /// Address spaces destroyed
    pub destroyed: u64,
    /// Destroy requests for handles that were not alive
    pub invalid_destroys: u64,
}

#[derive(Debug, Default)]
struct FlatInner {
    spaces: BTreeMap<AddressSpaceId, Vec<u8>>,
    active: BTreeMap<CpuId, AddressSpaceId>,
    next_id: u64,
    stats: FlatStats,
}

impl FlatInner {
    fn allocate(&mut self, limit: usize, size: usize) -> MemResult<Vec<u8>> {
        let used = self.stats.bytes_in_use.checked_add(size).ok_or(MemError::OutOfMemory)?;
        if used > limit {
            return Err(MemError::OutOfMemory);
        }
        let mut bytes = Vec::new();
        bytes.try_reserve_exact(size).map_err(|_| MemError::OutOfMemory)?;
        bytes.resize(size, 0);
        self.stats.bytes_in_use = used;
        Ok(bytes)
    }

    fn insert(&mut self, bytes: Vec<u8>) -> AddressSpaceId {
        self.next_id += 1;
        let id = AddressSpaceId::from_raw(self.next_id);
        self.spaces.insert(id, bytes);
        self.stats.created += 1;
        self.stats.live_spaces = self.spaces.len();
        id
    }

    fn range(&self, space: AddressSpaceId, addr: VirtAddr, len: usize) -> MemResult<core::ops::Range<usize>> {
        let bytes = self.spaces.get(&space).ok_or(MemError::NotMapped)?;
        let start = usize::try_from(addr.as_u64()).map_err(|_| MemError::InvalidAddress)?;
        let end = start.checked_add(len).ok_or(MemError::InvalidAddress)?;
        if end > bytes.len() {
            return Err(MemError::InvalidAddress);
        }
        Ok(start..end)
    }
}

/// Flat byte-array address spaces
#[derive(Debug)]
pub struct FlatMemory {
    inner: Mutex<FlatInner>,
    limit: usize,
}

impl FlatMemory {
    /// Memory without a budget
    pub fn new() -> Self {
        Self::with_limit(usize::MAX)
    }

    /// Memory that refuses to hold more than `limit` bytes in total
    pub fn with_limit(limit: usize) -> Self {
        Self {
            inner: Mutex::new(FlatInner::default()),
            limit,
        }
    }

    /// Current counters
    pub fn stats(&self) -> FlatStats {
        self.inner.lock().stats
    }

    /// Is `space` still alive
    pub fn is_live(&self, space: AddressSpaceId) -> bool {
        self.inner.lock().spaces.contains_key(&space)
    }

    /// Size in bytes of `space`, if alive
    pub fn size_of(&self, space: AddressSpaceId) -> Option<usize> {
        self.inner.lock().spaces.get(&space).map(Vec::len)
    }

    /// The address space `cpu` is currently switched to
    pub fn active_on(&self, cpu: CpuId) -> Option<AddressSpaceId> {
        self.inner.lock().active.get(&cpu).copied()
    }
}

impl Default for FlatMemory {
    fn default() -> Self {
        Self::new()
    }
}

impl AddressSpaceManager for FlatMemory {
    fn create(&self, size: usize) -> MemResult<AddressSpaceId> {
        let mut inner = self.inner.lock();
        let bytes = inner.allocate(self.limit, size)?;
        let id = inner.insert(bytes);
        log::debug!("flat: created {} ({} bytes)", id, size);
        Ok(id)
    }

    fn duplicate(&self, src: AddressSpaceId, size: usize) -> MemResult<AddressSpaceId> {
        let mut inner = self.inner.lock();
        let source_len = inner.spaces.get(&src).ok_or(MemError::NotMapped)?.len();
        if size > source_len {
            return Err(MemError::InvalidSize);
        }
        let mut bytes = inner.allocate(self.limit, size)?;
        if let Some(source) = inner.spaces.get(&src) {
            bytes.copy_from_slice(&source[..size]);
        }
        let id = inner.insert(bytes);
        log::debug!("flat: duplicated {} into {} ({} bytes)", src, id, size);
        Ok(id)
    }

    fn resize(&self, space: AddressSpaceId, old_size: usize, new_size: usize) -> MemResult<usize> {
        let mut inner = self.inner.lock();
        let current = inner.spaces.get(&space).ok_or(MemError::NotMapped)?.len();
        if current != old_size {
            return Err(MemError::InvalidSize);
        }
        if new_size > old_size {
            let grown = inner.allocate(self.limit, new_size - old_size)?;
            if let Some(bytes) = inner.spaces.get_mut(&space) {
                bytes.extend_from_slice(&grown);
            }
        } else if let Some(bytes) = inner.spaces.get_mut(&space) {
            bytes.truncate(new_size);
            inner.stats.bytes_in_use -= old_size - new_size;
        }
        Ok(new_size)
    }

    fn destroy(&self, space: AddressSpaceId) {
        let mut inner = self.inner.lock();
        match inner.spaces.remove(&space) {
            Some(bytes) => {
                inner.stats.bytes_in_use -= bytes.len();
                inner.stats.destroyed += 1;
                inner.stats.live_spaces = inner.spaces.len();
                log::debug!("flat: destroyed {}", space);
            }
            None => {
                inner.stats.invalid_destroys += 1;
                log::error!("flat: destroy of dead address space {}", space);
            }
        }
    }

    fn validate_region(&self, space: AddressSpaceId, addr: VirtAddr, len: usize) -> bool {
        self.inner.lock().range(space, addr, len).is_ok()
    }

    fn copy_out(&self, space: AddressSpaceId, addr: VirtAddr, bytes: &[u8]) -> MemResult<()> {
        let mut inner = self.inner.lock();
        let range = inner.range(space, addr, bytes.len())?;
        let target = inner.spaces.get_mut(&space).ok_or(MemError::NotMapped)?;
        target[range].copy_from_slice(bytes);
        Ok(())
    }

    fn copy_in(&self, space: AddressSpaceId, addr: VirtAddr, buf: &mut [u8]) -> MemResult<()> {
        let inner = self.inner.lock();
        let range = inner.range(space, addr, buf.len())?;
        let source = inner.spaces.get(&space).ok_or(MemError::NotMapped)?;
        buf.copy_from_slice(&source[range]);
        Ok(())
    }

    fn activate(&self, cpu: CpuId, space: Option<AddressSpaceId>) {
        let mut inner = self.inner.lock();
        match space {
            Some(space) => inner.active.insert(cpu, space),
            None => inner.active.remove(&cpu),
        };
    }
}
