//! Virtual-memory subsystem
//!
//! Demand paging for user address spaces. Pages are registered lazily,
//! made resident on first touch, evicted to swap or their backing file
//! under memory pressure, and shared copy-on-write across fork.
//!
//! One [`Vm`] instance owns the global frame table, the swap-slot
//! bitmap, and the boundary implementations; the kernel initializes the
//! singleton once at boot via [`vm_init`].

pub mod hal;

mod anon;
mod file;
mod frame;
mod page;
mod spt;
mod swap;
mod uninit;

#[cfg(test)]
mod testing;

use bitflags::bitflags;
use core::sync::atomic::{AtomicU64, Ordering};
use spin::{Mutex, Once};

use frame::FrameTable;
use hal::{Mmu, Platform, Pml4};
use swap::SwapTable;

pub use anon::AnonPage;
pub use file::{FilePage, FileSeg};
pub use frame::Frame;
pub use page::{Backend, Page, PageKind, SharedPage};
pub use spt::SupPageTable;
pub use swap::SwapSlot;
pub use uninit::{InitFill, PageInit, UninitPage};

use crate::{log, log_debug};

/// Page / frame size (4 KB)
pub const PAGE_SIZE: usize = 4096;
/// Sector size of the swap block device
pub const DISK_SECTOR_SIZE: usize = 512;
/// Sectors occupied by one page-sized swap slot
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / DISK_SECTOR_SIZE;

/// Top of the user stack region
pub const USER_STACK: u64 = 0x4748_0000;
/// Maximum stack size (1 MB below `USER_STACK`)
pub const MAX_STACK: u64 = 1 << 20;
/// Start of kernel space; user addresses lie below
pub const KERNEL_BASE: u64 = 0xFFFF_8000_0000_0000;

/// Round an address down to its page boundary.
pub fn pg_round_down(va: u64) -> u64 {
    va & !(PAGE_SIZE as u64 - 1)
}

pub fn is_user_vaddr(va: u64) -> bool {
    va < KERNEL_BASE
}

pub fn is_kernel_vaddr(va: u64) -> bool {
    !is_user_vaddr(va)
}

/// Error kinds surfaced by the subsystem. The fault handler folds every
/// failure into *unhandled*; the trap layer turns that into process
/// termination.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VmError {
    DuplicateMapping,
    OutOfMemory,
    OutOfSwap,
    IoError,
    BadAddress,
    ProtectionViolation,
}

pub type VmResult<T> = Result<T, VmError>;

bitflags! {
    /// Hardware page-fault error code bits.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct PageFaultCode: u64 {
        /// Fault on a present mapping (protection violation).
        const PRESENT = 1 << 0;
        /// The access was a write.
        const WRITE = 1 << 1;
        /// The access came from user mode.
        const USER = 1 << 2;
    }
}

/// Per-process VM state. The scheduler owns one per thread group and
/// passes it in; the subsystem never reaches for current-process state
/// itself. `saved_user_rsp` is recorded on syscall entry so stack-growth
/// checks work for faults taken in the kernel.
pub struct VmProcess {
    pub pml4: Pml4,
    pub spt: SupPageTable,
    pub saved_user_rsp: u64,
}

impl VmProcess {
    pub fn new(pml4: Pml4) -> Self {
        VmProcess {
            pml4,
            spt: SupPageTable::new(),
            saved_user_rsp: 0,
        }
    }
}

/// Counters exposed for diagnostics.
#[derive(Debug, Clone, Copy)]
pub struct VmStats {
    pub resident_frames: usize,
    pub swap_slots: usize,
    pub swap_slots_used: usize,
    pub swapped_in: u64,
    pub swapped_out: u64,
    pub cow_splits: u64,
}

/// The VM subsystem: boundary implementations plus global tables.
pub struct Vm {
    platform: Platform,
    frames: Mutex<FrameTable>,
    swap: SwapTable,
    /// Serializes positional file I/O for file-backed pages.
    file_io: Mutex<()>,
    swapped_in: AtomicU64,
    swapped_out: AtomicU64,
    cow_splits: AtomicU64,
}

static VM: Once<Vm> = Once::new();

/// Initialize the subsystem singleton. Called once at boot.
pub fn vm_init(platform: Platform) {
    VM.call_once(|| Vm::new(platform));
}

/// The subsystem singleton. `vm_init` must have run.
pub fn vm() -> &'static Vm {
    VM.get().expect("vm_init has not run")
}

impl Vm {
    pub fn new(platform: Platform) -> Self {
        let slots = platform.swap.sectors() as usize / SECTORS_PER_PAGE;
        log!("[VM] swap ready: {} slots ({} KB)", slots, slots * 4);
        Vm {
            platform,
            frames: Mutex::new(FrameTable::new()),
            swap: SwapTable::new(slots),
            file_io: Mutex::new(()),
            swapped_in: AtomicU64::new(0),
            swapped_out: AtomicU64::new(0),
            cow_splits: AtomicU64::new(0),
        }
    }

    fn mmu(&self) -> &dyn Mmu {
        self.platform.mmu
    }

    pub fn stats(&self) -> VmStats {
        VmStats {
            resident_frames: self.resident_frames(),
            swap_slots: self.swap.slots(),
            swap_slots_used: self.swap.used(),
            swapped_in: self.swapped_in.load(Ordering::Relaxed),
            swapped_out: self.swapped_out.load(Ordering::Relaxed),
            cow_splits: self.cow_splits.load(Ordering::Relaxed),
        }
    }

    /// Register a lazy page at `va`. Nothing becomes resident until the
    /// first touch; the initializer runs into the fresh frame then.
    pub fn alloc_page_with_initializer(
        &self,
        proc: &mut VmProcess,
        kind: PageKind,
        va: u64,
        writable: bool,
        init: PageInit,
    ) -> VmResult<()> {
        if va % PAGE_SIZE as u64 != 0 || !is_user_vaddr(va) {
            return Err(VmError::BadAddress);
        }
        match (kind, &init) {
            // File pages page in from their segment; nothing else can.
            (PageKind::File, PageInit::FileSegment(_)) => {}
            (PageKind::File, _) => return Err(VmError::BadAddress),
            (PageKind::Anon, PageInit::FileSegment(_)) => return Err(VmError::BadAddress),
            (PageKind::Anon, _) => {}
        }
        let page = Page::new_uninit(proc.pml4, va, writable, false, kind, init);
        proc.spt.insert(page).map(|_| ())
    }

    /// Register a lazy zero-filled page (`alloc_page_with_initializer`
    /// with the zeroing initializer).
    pub fn alloc_page(
        &self,
        proc: &mut VmProcess,
        kind: PageKind,
        va: u64,
        writable: bool,
    ) -> VmResult<()> {
        self.alloc_page_with_initializer(proc, kind, va, writable, PageInit::Zeroed)
    }

    /// Force the page at `va` resident now.
    pub fn claim_page(&self, proc: &VmProcess, va: u64) -> VmResult<()> {
        let page = match proc.spt.find(va) {
            Some(page) => page,
            None => return Err(VmError::BadAddress),
        };
        self.do_claim_page(&page)
    }

    /// Bind `page` to a frame: acquire one, wire the links, fill it via
    /// the back-end, then install the hardware mapping. Contents land in
    /// the frame before the mapping exists. Partial state is undone on
    /// failure.
    pub(crate) fn do_claim_page(&self, this: &SharedPage) -> VmResult<()> {
        let frame = self.get_frame()?;
        let mut page = this.lock();

        if let Some(existing) = page.frame.clone() {
            // Already resident: just reinstall the mapping.
            let (pml4, va, writable) = (page.pml4(), page.va(), page.writable());
            let kva = existing.kva();
            drop(page);
            self.free_frame(frame);
            self.mmu().set_mapping(pml4, va, kva, writable);
            return Ok(());
        }

        frame.set_owner(Some(alloc::sync::Arc::downgrade(this)));
        page.frame = Some(frame.clone());

        if let Err(err) = page.swap_in(self, frame.kva()) {
            page.frame = None;
            frame.set_owner(None);
            drop(page);
            self.free_frame(frame);
            return Err(err);
        }

        // A fresh frame is private, so the declared writability applies.
        page.writable = page.parent_writable;
        if !self
            .mmu()
            .set_mapping(page.pml4(), page.va(), frame.kva(), page.writable)
        {
            page.frame = None;
            frame.set_owner(None);
            drop(page);
            self.free_frame(frame);
            return Err(VmError::OutOfMemory);
        }
        frame.unpin();
        Ok(())
    }

    /// Classify and resolve a page fault. Returns true when the fault
    /// was handled and user code may resume; false means the access was
    /// bad and the process should be killed.
    pub fn try_handle_fault(
        &self,
        proc: &mut VmProcess,
        fa: u64,
        code: PageFaultCode,
        trap_rsp: u64,
    ) -> bool {
        if fa == 0 || is_kernel_vaddr(fa) {
            return false;
        }

        if !code.contains(PageFaultCode::PRESENT) {
            let rsp = if code.contains(PageFaultCode::USER) {
                trap_rsp
            } else {
                proc.saved_user_rsp
            };
            if fa < USER_STACK && fa >= USER_STACK - MAX_STACK && fa >= rsp.saturating_sub(8) {
                return self.stack_growth(proc, fa).is_ok();
            }
            let page = match proc.spt.find(fa) {
                Some(page) => page,
                None => return false,
            };
            if code.contains(PageFaultCode::WRITE) && !page.lock().parent_writable {
                return false;
            }
            return self.do_claim_page(&page).is_ok();
        }

        // Present mapping, illegal access: only a write to a COW-shared
        // page is recoverable.
        if !code.contains(PageFaultCode::WRITE) {
            return false;
        }
        let page = match proc.spt.find(fa) {
            Some(page) => page,
            None => return false,
        };
        self.handle_wp(&page)
    }

    /// Grow the stack to cover `fa`: an anonymous page with the stack
    /// marker, claimed immediately.
    fn stack_growth(&self, proc: &mut VmProcess, fa: u64) -> VmResult<()> {
        let va = pg_round_down(fa);
        let page = match proc.spt.find(va) {
            Some(page) => page,
            None => {
                log_debug!("[VM] stack growth to va={:#x}", va);
                let page = Page::new_uninit(
                    proc.pml4,
                    va,
                    true,
                    true,
                    PageKind::Anon,
                    PageInit::Zeroed,
                );
                proc.spt.insert(page)?
            }
        };
        self.do_claim_page(&page)
    }

    /// Resolve a write fault on a write-protected page (COW).
    ///
    /// Sole owner: the declared writability is restored in place. Shared
    /// frame: the writer gets a private copy; the peers keep the old
    /// frame with one reference fewer and split the same way on their
    /// own next write.
    fn handle_wp(&self, this: &SharedPage) -> bool {
        let mut page = this.lock();
        if !page.parent_writable {
            return false;
        }
        let old = match page.frame.clone() {
            Some(frame) => frame,
            None => return false,
        };

        if old.ref_count() == 1 {
            page.writable = page.parent_writable;
            old.set_owner(Some(alloc::sync::Arc::downgrade(this)));
            return self
                .mmu()
                .set_mapping(page.pml4(), page.va(), old.kva(), page.writable);
        }

        let fresh = match self.get_frame() {
            Ok(frame) => frame,
            Err(err) => {
                log_debug!("[VM] cow split failed at va={:#x}: {:?}", page.va(), err);
                return false;
            }
        };
        unsafe {
            core::ptr::copy_nonoverlapping(
                old.kva() as *const u8,
                fresh.kva() as *mut u8,
                PAGE_SIZE,
            );
        }
        old.disown(this);
        fresh.set_owner(Some(alloc::sync::Arc::downgrade(this)));
        page.frame = Some(fresh.clone());
        self.mmu().clear_mapping(page.pml4(), page.va());
        page.writable = page.parent_writable;
        let ok = self
            .mmu()
            .set_mapping(page.pml4(), page.va(), fresh.kva(), page.writable);
        fresh.unpin();
        drop(page);
        self.free_frame(old);
        self.cow_splits.fetch_add(1, Ordering::Relaxed);
        ok
    }
}
