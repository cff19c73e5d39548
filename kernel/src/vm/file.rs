//! File back-end (mmap'd pages)
//!
//! File-backed pages page in from their segment of the backing file and
//! write dirty contents back on eviction and teardown; they never touch
//! swap. `mmap`/`munmap` tile and untile whole mappings; the reopened
//! file handle is shared by every page of the mapping and closes when
//! the last one drops it.

use alloc::sync::Arc;

use super::hal::MappedFile;
use super::page::{Backend, Page, PageKind, SharedPage};
use super::uninit::PageInit;
use super::{pg_round_down, Vm, VmError, VmProcess, VmResult, KERNEL_BASE, PAGE_SIZE};
use crate::log_warn;

/// One page-sized window into a reopened file.
#[derive(Clone)]
pub struct FileSeg {
    pub file: Arc<dyn MappedFile>,
    pub offset: u64,
    pub read_bytes: usize,
    pub zero_bytes: usize,
    /// Total mapping length; set only in the head page.
    pub length: Option<u64>,
}

/// Payload of a file-backed page.
pub struct FilePage {
    pub(super) seg: FileSeg,
}

fn seg(page: &Page) -> &FileSeg {
    match &page.backend {
        Backend::File(file) => &file.seg,
        _ => panic!("file operation on non-file page"),
    }
}

/// Positional read of the segment, zero-filled tail.
pub(super) fn swap_in(vm: &Vm, page: &mut Page, kva: u64) -> VmResult<()> {
    let seg = seg(page).clone();
    let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };
    let _io = vm.file_io.lock();
    let read = seg.file.read_at(seg.offset, &mut buf[..seg.read_bytes])?;
    if read != seg.read_bytes {
        return Err(VmError::IoError);
    }
    buf[seg.read_bytes..].fill(0);
    Ok(())
}

/// Write the segment back if the hardware says it is dirty.
fn write_back(vm: &Vm, page: &Page) {
    let seg = seg(page);
    if seg.read_bytes == 0 {
        return;
    }
    if !vm.platform.mmu.is_dirty(page.pml4(), page.va()) {
        return;
    }
    let frame = match &page.frame {
        Some(frame) => frame,
        None => return,
    };
    let buf = unsafe { core::slice::from_raw_parts(frame.kva() as *const u8, seg.read_bytes) };
    let _io = vm.file_io.lock();
    match seg.file.write_at(seg.offset, buf) {
        Ok(_) => vm.platform.mmu.set_dirty(page.pml4(), page.va(), false),
        // Best effort, same durability as crashing here.
        Err(err) => log_warn!(
            "[VM] mmap write-back failed at va={:#x}: {:?}",
            page.va(),
            err
        ),
    }
}

/// Write back if dirty, then surrender the frame. Never consumes swap.
pub(super) fn swap_out(vm: &Vm, page: &mut Page) -> VmResult<()> {
    if page.frame.is_none() {
        panic!("swap_out of a non-resident page");
    }
    write_back(vm, page);
    vm.platform.mmu.clear_mapping(page.pml4(), page.va());
    page.frame = None;
    Ok(())
}

/// Same write-back as eviction, then release the frame reference. The
/// file handle closes when the mapping's last page drops its `Arc`.
pub(super) fn destroy(vm: &Vm, page: &mut Page, this: &SharedPage) {
    write_back(vm, page);
    if let Some(frame) = page.frame.take() {
        vm.platform.mmu.clear_mapping(page.pml4(), page.va());
        frame.disown(this);
        vm.free_frame(frame);
    }
}

impl Vm {
    /// Map `length` bytes of `file` starting at `offset` into
    /// `[addr, addr + length)` as lazy file-backed pages.
    ///
    /// The file is reopened once so the caller may close its descriptor.
    /// Fails without side effects: partially registered pages are rolled
    /// back.
    pub fn mmap(
        &self,
        proc: &mut VmProcess,
        addr: u64,
        length: u64,
        writable: bool,
        file: &Arc<dyn MappedFile>,
        offset: u64,
    ) -> VmResult<u64> {
        if addr == 0 || addr % PAGE_SIZE as u64 != 0 || offset % PAGE_SIZE as u64 != 0 {
            return Err(VmError::BadAddress);
        }
        if length == 0 {
            return Err(VmError::BadAddress);
        }
        let page_count = match length.checked_add(PAGE_SIZE as u64 - 1) {
            Some(n) => n / PAGE_SIZE as u64,
            None => return Err(VmError::BadAddress),
        };
        let span = match page_count.checked_mul(PAGE_SIZE as u64) {
            Some(span) => span,
            None => return Err(VmError::BadAddress),
        };
        let end = match addr.checked_add(span) {
            Some(end) if end <= KERNEL_BASE => end,
            _ => return Err(VmError::BadAddress),
        };
        for va in (addr..end).step_by(PAGE_SIZE) {
            if proc.spt.find(va).is_some() {
                return Err(VmError::DuplicateMapping);
            }
        }

        let handle = file.reopen()?;
        let available = handle.length().saturating_sub(offset);
        let read_total = if available < length { available } else { length };
        let mut remaining = read_total as usize;
        let mut file_offset = offset;

        for (idx, va) in (addr..end).step_by(PAGE_SIZE).enumerate() {
            let read_bytes = if remaining < PAGE_SIZE { remaining } else { PAGE_SIZE };
            let seg = FileSeg {
                file: handle.clone(),
                offset: file_offset,
                read_bytes,
                zero_bytes: PAGE_SIZE - read_bytes,
                length: if idx == 0 { Some(length) } else { None },
            };
            let result = self.alloc_page_with_initializer(
                proc,
                PageKind::File,
                va,
                writable,
                PageInit::FileSegment(seg),
            );
            if let Err(err) = result {
                for undo in (addr..va).step_by(PAGE_SIZE) {
                    proc.spt.remove(self, undo);
                }
                return Err(err);
            }
            remaining -= read_bytes;
            file_offset += read_bytes as u64;
        }
        Ok(addr)
    }

    /// Tear down the mapping whose head page sits at `addr`, destroying
    /// its pages in address order. `addr` must be the address `mmap`
    /// returned; anything else is an error.
    pub fn munmap(&self, proc: &mut VmProcess, addr: u64) -> VmResult<()> {
        let head = match proc.spt.find(addr) {
            Some(head) => head,
            None => return Err(VmError::BadAddress),
        };
        if pg_round_down(addr) != addr {
            return Err(VmError::BadAddress);
        }
        let length = match head.lock().mapping_length() {
            Some(length) => length,
            None => return Err(VmError::BadAddress),
        };
        let page_count = (length + PAGE_SIZE as u64 - 1) / PAGE_SIZE as u64;
        for i in 0..page_count {
            proc.spt.remove(self, addr + i * PAGE_SIZE as u64);
        }
        Ok(())
    }
}
