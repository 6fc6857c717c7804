//! Off-heap memory for page buffers and the metadata region.

#![allow(unsafe_code)]

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::{CacheError, Result};

/// Allocates aligned off-heap regions.
///
/// Returned regions are zeroed, aligned to the system page size, and stay
/// valid until the manager is dropped. There is no free operation; callers
/// keep the manager alive (the page table holds it in an `Arc`) and buffers
/// are recycled, not returned.
pub trait MemoryManager: Send + Sync + 'static {
    fn allocate_aligned(&self, bytes: usize) -> Result<*mut u8>;
}

/// [`MemoryManager`] backed by anonymous memory mappings.
///
/// Anonymous mappings are page-aligned and zero-filled by the OS, which is
/// exactly the contract the metadata region and page buffers need.
#[derive(Default)]
pub struct MmapMemoryManager {
    regions: Mutex<Vec<MmapMut>>,
}

impl MmapMemoryManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of regions handed out so far.
    pub fn region_count(&self) -> usize {
        self.regions.lock().len()
    }
}

impl MemoryManager for MmapMemoryManager {
    fn allocate_aligned(&self, bytes: usize) -> Result<*mut u8> {
        if bytes == 0 {
            return Err(CacheError::InvalidArgument("cannot allocate zero bytes"));
        }
        let mut region = MmapMut::map_anon(bytes).map_err(CacheError::Io)?;
        let address = region.as_mut_ptr();
        // The mapping itself is stable; moving the `MmapMut` handle into the
        // vector does not move the mapped memory.
        self.regions.lock().push(region);
        Ok(address)
    }
}

/// Allocates the shared scratch page handed to cursors whose fault failed.
pub fn allocate_victim_page(memory: &dyn MemoryManager, page_size: usize) -> Result<*mut u8> {
    memory.allocate_aligned(page_size)
}
