//! Lazy (uninitialized) back-end
//!
//! An uninit page carries its initializer and its eventual kind. The
//! first claim runs the initializer into the fresh frame and replaces the
//! back-end in place; uninit pages are never resident, so they have no
//! swap-out path, and destroying one only drops the payload.

use alloc::sync::Arc;

use super::anon::AnonPage;
use super::file::{FilePage, FileSeg};
use super::page::{Backend, Page, PageKind};
use super::{Vm, VmError, VmResult, PAGE_SIZE};

/// Content initializer: fills the page-sized buffer, returning false on
/// failure. The captured environment plays the role of the auxiliary
/// data handed to a raw initializer function.
pub type InitFill = Arc<dyn Fn(&mut [u8]) -> bool + Send + Sync>;

/// How an uninit page obtains its first contents.
#[derive(Clone)]
pub enum PageInit {
    /// All zeroes (fresh anonymous memory).
    Zeroed,
    /// Positional read of a file segment, zero-filled tail.
    FileSegment(FileSeg),
    /// Caller-provided initializer (the loader's lazy segment fill).
    Custom(InitFill),
}

/// Payload of a lazy page. Fork clones it wholesale; the `Arc`s inside
/// `PageInit` make the shared auxiliary data safe to alias until the
/// first fault.
pub struct UninitPage {
    kind: PageKind,
    init: PageInit,
}

impl UninitPage {
    pub(super) fn new(kind: PageKind, init: PageInit) -> Self {
        UninitPage { kind, init }
    }

    pub(super) fn kind(&self) -> PageKind {
        self.kind
    }

    pub(super) fn clone_payload(&self) -> (PageKind, PageInit) {
        (self.kind, self.init.clone())
    }

    pub(super) fn mapping_length(&self) -> Option<u64> {
        match &self.init {
            PageInit::FileSegment(seg) => seg.length,
            _ => None,
        }
    }
}

/// First touch: run the initializer into `kva`, then swap the back-end
/// for the target variant.
pub(super) fn swap_in(vm: &Vm, page: &mut Page, kva: u64) -> VmResult<()> {
    let (kind, init) = match &page.backend {
        Backend::Uninit(u) => u.clone_payload(),
        _ => panic!("uninit swap_in on initialized page"),
    };

    let buf = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };
    match &init {
        PageInit::Zeroed => buf.fill(0),
        PageInit::FileSegment(seg) => {
            let _io = vm.file_io.lock();
            let read = seg.file.read_at(seg.offset, &mut buf[..seg.read_bytes])?;
            if read != seg.read_bytes {
                return Err(VmError::IoError);
            }
            buf[seg.read_bytes..].fill(0);
        }
        PageInit::Custom(fill) => {
            if !fill(buf) {
                return Err(VmError::IoError);
            }
        }
    }

    page.backend = match kind {
        PageKind::Anon => Backend::Anon(AnonPage::new()),
        PageKind::File => {
            let seg = match init {
                PageInit::FileSegment(seg) => seg,
                // Validated at allocation: file pages carry a segment.
                _ => return Err(VmError::BadAddress),
            };
            Backend::File(FilePage { seg })
        }
    };
    Ok(())
}
