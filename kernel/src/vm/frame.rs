//! Frame table and second-chance eviction
//!
//! Every physical user-pool page handed to the pager is wrapped in a
//! [`Frame`] and linked into one global list; the clock hand walks that
//! list when the pool runs dry. Reference counts above one mean the frame
//! is shared copy-on-write.

use alloc::sync::Arc;
use core::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use spin::Mutex;

use super::page::{PageRef, SharedPage};
use super::{Vm, VmError, VmResult, PAGE_SIZE};
use crate::{log_debug, log_warn};

/// Descriptor of one physical user-pool page.
///
/// `owner` is a weak back-pointer used only to locate the resident page
/// during eviction; it is cleared whenever ownership moves. `ref_cnt` is
/// mutated under the frame-table lock. `pinned` holds the frame out of
/// the clock scan between acquisition and MMU install.
pub struct Frame {
    kva: u64,
    ref_cnt: AtomicU32,
    pinned: AtomicBool,
    owner: Mutex<Option<PageRef>>,
}

impl Frame {
    fn new(kva: u64) -> Self {
        Frame {
            kva,
            ref_cnt: AtomicU32::new(1),
            pinned: AtomicBool::new(true),
            owner: Mutex::new(None),
        }
    }

    /// Kernel virtual address of the backing page.
    pub fn kva(&self) -> u64 {
        self.kva
    }

    /// Number of pages sharing this frame (>1 means COW-shared).
    pub fn ref_count(&self) -> u32 {
        self.ref_cnt.load(Ordering::SeqCst)
    }

    pub(super) fn is_pinned(&self) -> bool {
        self.pinned.load(Ordering::SeqCst)
    }

    pub(super) fn pin(&self) {
        self.pinned.store(true, Ordering::SeqCst);
    }

    pub(super) fn unpin(&self) {
        self.pinned.store(false, Ordering::SeqCst);
    }

    pub(super) fn owner(&self) -> Option<PageRef> {
        self.owner.lock().clone()
    }

    pub(super) fn set_owner(&self, owner: Option<PageRef>) {
        *self.owner.lock() = owner;
    }

    /// Drop the back-pointer if it designates `page`.
    pub(super) fn disown(&self, page: &SharedPage) {
        let mut owner = self.owner.lock();
        let points_here = owner
            .as_ref()
            .map(|w| w.as_ptr() == Arc::as_ptr(page))
            .unwrap_or(false);
        if points_here {
            *owner = None;
        }
    }
}

/// Clock list of resident frames. The hand position lives in `clock`;
/// list order is allocation order.
pub(super) struct FrameTable {
    frames: alloc::vec::Vec<Arc<Frame>>,
    clock: usize,
}

impl FrameTable {
    pub(super) const fn new() -> Self {
        FrameTable {
            frames: alloc::vec::Vec::new(),
            clock: 0,
        }
    }

    pub(super) fn len(&self) -> usize {
        self.frames.len()
    }
}

impl Vm {
    /// Obtain a frame, evicting if the physical pool is exhausted.
    ///
    /// The returned frame is zeroed, pinned, has a reference count of one,
    /// and is already linked into the frame table.
    pub(super) fn get_frame(&self) -> VmResult<Arc<Frame>> {
        if let Some(kva) = self.platform.pool.alloc_page(true) {
            let frame = Arc::new(Frame::new(kva));
            self.frames.lock().frames.push(frame.clone());
            return Ok(frame);
        }
        self.evict()
    }

    /// Second-chance scan. Holds the frame-table lock for the entire walk
    /// so no two threads can select the same victim.
    fn evict(&self) -> VmResult<Arc<Frame>> {
        let mut table = self.frames.lock();
        let len = table.frames.len();
        if len == 0 {
            return Err(VmError::OutOfMemory);
        }
        // Each step either returns, clears an accessed bit, or skips an
        // unevictable frame; two passes bound the walk.
        for _ in 0..2 * len {
            let idx = table.clock % len;
            table.clock = (table.clock + 1) % len;
            let frame = table.frames[idx].clone();

            if frame.is_pinned() || frame.ref_count() != 1 {
                continue;
            }
            let page = match frame.owner().and_then(|w| w.upgrade()) {
                Some(p) => p,
                None => continue,
            };
            // A contended page is mid-fault; treat it as recently used.
            let mut guard = match page.try_lock() {
                Some(g) => g,
                None => continue,
            };
            if !guard.is_backed_by(&frame) {
                continue;
            }
            if self.platform.mmu.is_accessed(guard.pml4(), guard.va()) {
                self.platform.mmu.set_accessed(guard.pml4(), guard.va(), false);
                continue;
            }
            match guard.swap_out(self) {
                Ok(()) => {
                    frame.set_owner(None);
                    frame.pin();
                    unsafe {
                        core::ptr::write_bytes(frame.kva() as *mut u8, 0, PAGE_SIZE);
                    }
                    log_debug!("[VM] evicted va={:#x}", guard.va());
                    return Ok(frame);
                }
                Err(err) => {
                    log_debug!("[VM] victim va={:#x} not evictable: {:?}", guard.va(), err);
                    continue;
                }
            }
        }
        log_warn!("[VM] out of frames: eviction found no victim");
        Err(VmError::OutOfMemory)
    }

    /// Release one reference to `frame`; unlink it and hand the page back
    /// to the physical pool once the count reaches zero.
    pub(super) fn free_frame(&self, frame: Arc<Frame>) {
        let mut table = self.frames.lock();
        let prev = frame.ref_cnt.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev >= 1, "frame refcount underflow");
        if prev != 1 {
            return;
        }
        if let Some(pos) = table.frames.iter().position(|f| Arc::ptr_eq(f, &frame)) {
            table.frames.swap_remove(pos);
            let len = table.frames.len();
            table.clock = if len == 0 { 0 } else { table.clock % len };
        }
        frame.set_owner(None);
        self.platform.pool.free_page(frame.kva());
    }

    /// Add one sharer to `frame` (fork).
    pub(super) fn share_frame(&self, frame: &Arc<Frame>) {
        let _table = self.frames.lock();
        frame.ref_cnt.fetch_add(1, Ordering::SeqCst);
    }

    /// Number of frames currently wrapping a physical page.
    pub(super) fn resident_frames(&self) -> usize {
        self.frames.lock().len()
    }
}
