//! Hardware and kernel boundaries consumed by the VM subsystem.
//!
//! Everything the pager needs from the outside world (the MMU, the
//! physical user-page pool, the swap block device, and seekable files)
//! comes in through these traits. The embedding kernel hands a
//! [`Platform`] to `vm_init`; tests substitute in-memory doubles.

use alloc::sync::Arc;

use super::VmResult;

/// Opaque page-table-root token identifying one address space.
pub type Pml4 = u64;

/// Hardware page-table operations for a single address space.
///
/// `set_mapping` installs a new translation or updates an existing one
/// (the fork path re-installs live mappings read-only). The accessed and
/// dirty queries report the hardware-maintained PTE bits; both are false
/// for an absent mapping.
pub trait Mmu: Send + Sync {
    fn set_mapping(&self, pml4: Pml4, va: u64, kva: u64, writable: bool) -> bool;
    fn clear_mapping(&self, pml4: Pml4, va: u64);
    fn is_accessed(&self, pml4: Pml4, va: u64) -> bool;
    fn set_accessed(&self, pml4: Pml4, va: u64, accessed: bool);
    fn is_dirty(&self, pml4: Pml4, va: u64) -> bool;
    fn set_dirty(&self, pml4: Pml4, va: u64, dirty: bool);
}

/// Physical allocator for user-pool pages.
///
/// Returns the kernel virtual address of a page-sized region, or `None`
/// when the pool is exhausted (the frame table then evicts instead).
pub trait UserPool: Send + Sync {
    fn alloc_page(&self, zeroed: bool) -> Option<u64>;
    fn free_page(&self, kva: u64);
}

/// The raw block device backing swap. Sector size is 512 bytes.
pub trait SwapDevice: Send + Sync {
    fn sectors(&self) -> u64;
    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), ()>;
    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), ()>;
}

/// A seekable file usable as mmap backing store.
///
/// `reopen` yields a private handle so closing the original descriptor
/// does not tear the mapping down; the handle itself closes on drop of
/// the last `Arc`.
pub trait MappedFile: Send + Sync {
    fn length(&self) -> u64;
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> VmResult<usize>;
    fn write_at(&self, offset: u64, buf: &[u8]) -> VmResult<usize>;
    fn reopen(&self) -> VmResult<Arc<dyn MappedFile>>;
}

/// The bundle of boundary implementations handed to `vm_init`.
pub struct Platform {
    pub mmu: &'static dyn Mmu,
    pub pool: &'static dyn UserPool,
    pub swap: &'static dyn SwapDevice,
}
