//! In-memory doubles for the boundary traits, used by the test suites.
//!
//! The soft MMU keeps a mapping table with accessed/dirty bits, the pool
//! hands out leaked 4 KB buffers with a hard capacity, the swap device
//! is a flat sector vector, and the mock file shares one inode between
//! reopened handles.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::hal::{MappedFile, Mmu, Platform, Pml4, SwapDevice, UserPool};
use super::{VmResult, DISK_SECTOR_SIZE, PAGE_SIZE};

#[derive(Clone, Copy)]
pub(crate) struct Mapping {
    pub kva: u64,
    pub writable: bool,
    pub accessed: bool,
    pub dirty: bool,
}

/// Software page-table: one mapping entry per (address space, page).
pub(crate) struct SoftMmu {
    entries: Mutex<BTreeMap<(Pml4, u64), Mapping>>,
}

impl SoftMmu {
    pub fn new() -> Self {
        SoftMmu {
            entries: Mutex::new(BTreeMap::new()),
        }
    }

    pub fn translate(&self, pml4: Pml4, va: u64) -> Option<Mapping> {
        self.entries.lock().get(&(pml4, va)).copied()
    }

    pub fn mapping_count(&self, pml4: Pml4) -> usize {
        self.entries
            .lock()
            .keys()
            .filter(|(space, _)| *space == pml4)
            .count()
    }
}

impl Mmu for SoftMmu {
    fn set_mapping(&self, pml4: Pml4, va: u64, kva: u64, writable: bool) -> bool {
        let mut entries = self.entries.lock();
        let entry = entries.entry((pml4, va)).or_insert(Mapping {
            kva,
            writable,
            accessed: false,
            dirty: false,
        });
        entry.kva = kva;
        entry.writable = writable;
        true
    }

    fn clear_mapping(&self, pml4: Pml4, va: u64) {
        self.entries.lock().remove(&(pml4, va));
    }

    fn is_accessed(&self, pml4: Pml4, va: u64) -> bool {
        self.translate(pml4, va).map(|m| m.accessed).unwrap_or(false)
    }

    fn set_accessed(&self, pml4: Pml4, va: u64, accessed: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&(pml4, va)) {
            entry.accessed = accessed;
        }
    }

    fn is_dirty(&self, pml4: Pml4, va: u64) -> bool {
        self.translate(pml4, va).map(|m| m.dirty).unwrap_or(false)
    }

    fn set_dirty(&self, pml4: Pml4, va: u64, dirty: bool) {
        if let Some(entry) = self.entries.lock().get_mut(&(pml4, va)) {
            entry.dirty = dirty;
        }
    }
}

/// Bounded physical pool; pages are leaked heap buffers.
pub(crate) struct TestPool {
    free: Mutex<Vec<u64>>,
}

impl TestPool {
    pub fn new(capacity: usize) -> Self {
        let mut free = Vec::with_capacity(capacity);
        for _ in 0..capacity {
            let page: &'static mut [u8] = Vec::leak(vec![0u8; PAGE_SIZE]);
            free.push(page.as_mut_ptr() as u64);
        }
        TestPool {
            free: Mutex::new(free),
        }
    }

    pub fn free_count(&self) -> usize {
        self.free.lock().len()
    }
}

impl UserPool for TestPool {
    fn alloc_page(&self, zeroed: bool) -> Option<u64> {
        let kva = self.free.lock().pop()?;
        if zeroed {
            unsafe { core::ptr::write_bytes(kva as *mut u8, 0, PAGE_SIZE) };
        }
        Some(kva)
    }

    fn free_page(&self, kva: u64) {
        self.free.lock().push(kva);
    }
}

/// Flat in-memory sector device.
pub(crate) struct TestSwap {
    sectors: u64,
    data: Mutex<Vec<u8>>,
}

impl TestSwap {
    pub fn new(page_slots: usize) -> Self {
        let sectors = (page_slots * PAGE_SIZE / DISK_SECTOR_SIZE) as u64;
        TestSwap {
            sectors,
            data: Mutex::new(vec![0u8; sectors as usize * DISK_SECTOR_SIZE]),
        }
    }
}

impl SwapDevice for TestSwap {
    fn sectors(&self) -> u64 {
        self.sectors
    }

    fn read_sector(&self, sector: u64, buf: &mut [u8]) -> Result<(), ()> {
        if sector >= self.sectors || buf.len() != DISK_SECTOR_SIZE {
            return Err(());
        }
        let start = sector as usize * DISK_SECTOR_SIZE;
        buf.copy_from_slice(&self.data.lock()[start..start + DISK_SECTOR_SIZE]);
        Ok(())
    }

    fn write_sector(&self, sector: u64, buf: &[u8]) -> Result<(), ()> {
        if sector >= self.sectors || buf.len() != DISK_SECTOR_SIZE {
            return Err(());
        }
        let start = sector as usize * DISK_SECTOR_SIZE;
        self.data.lock()[start..start + DISK_SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }
}

/// Mock file: reopened handles share one inode.
pub(crate) struct TestFile {
    inode: Arc<Mutex<Vec<u8>>>,
}

impl TestFile {
    pub fn create(bytes: &[u8]) -> Arc<TestFile> {
        Arc::new(TestFile {
            inode: Arc::new(Mutex::new(bytes.to_vec())),
        })
    }

    pub fn contents(&self) -> Vec<u8> {
        self.inode.lock().clone()
    }
}

impl MappedFile for TestFile {
    fn length(&self) -> u64 {
        self.inode.lock().len() as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> VmResult<usize> {
        let inode = self.inode.lock();
        let offset = offset as usize;
        if offset >= inode.len() {
            return Ok(0);
        }
        let n = buf.len().min(inode.len() - offset);
        buf[..n].copy_from_slice(&inode[offset..offset + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> VmResult<usize> {
        let mut inode = self.inode.lock();
        let offset = offset as usize;
        let end = offset + buf.len();
        if end > inode.len() {
            inode.resize(end, 0);
        }
        inode[offset..end].copy_from_slice(buf);
        Ok(buf.len())
    }

    fn reopen(&self) -> VmResult<Arc<dyn MappedFile>> {
        Ok(Arc::new(TestFile {
            inode: self.inode.clone(),
        }))
    }
}

/// Leaked boundary doubles bundled for one test `Vm`.
#[derive(Clone, Copy)]
pub(crate) struct TestPlatform {
    pub mmu: &'static SoftMmu,
    pub pool: &'static TestPool,
    pub swap: &'static TestSwap,
}

impl TestPlatform {
    pub fn new(frames: usize, swap_slots: usize) -> Self {
        TestPlatform {
            mmu: alloc::boxed::Box::leak(alloc::boxed::Box::new(SoftMmu::new())),
            pool: alloc::boxed::Box::leak(alloc::boxed::Box::new(TestPool::new(frames))),
            swap: alloc::boxed::Box::leak(alloc::boxed::Box::new(TestSwap::new(swap_slots))),
        }
    }

    pub fn platform(&self) -> Platform {
        Platform {
            mmu: self.mmu,
            pool: self.pool,
            swap: self.swap,
        }
    }
}
