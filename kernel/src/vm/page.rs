//! Page descriptors
//!
//! A [`Page`] describes one virtual page of a user address space and owns
//! the state of exactly one back-end at a time. Pages start out lazy
//! (`Backend::Uninit`) and transition one-shot to anonymous or file-backed
//! on first touch.

use alloc::sync::{Arc, Weak};
use spin::Mutex;

use super::anon::{self, AnonPage};
use super::file::{self, FilePage};
use super::frame::Frame;
use super::hal::Pml4;
use super::uninit::{self, PageInit, UninitPage};
use super::{Vm, VmResult};

/// Pages are shared between their SPT and the frame table's weak
/// back-pointer; eviction reaches them through `try_lock`.
pub type SharedPage = Arc<Mutex<Page>>;
pub type PageRef = Weak<Mutex<Page>>;

/// The eventual kind of a page (what an uninit page becomes on first touch).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PageKind {
    Anon,
    File,
}

/// Current back-end of a page. Transitions are uninit to anon or
/// uninit to file, one-shot.
pub enum Backend {
    Uninit(UninitPage),
    Anon(AnonPage),
    File(FilePage),
}

#[derive(Clone, Copy)]
enum BackendTag {
    Uninit,
    Anon,
    File,
}

/// Descriptor of one user virtual page.
pub struct Page {
    va: u64,
    pml4: Pml4,
    /// Effective writability: forced false while the frame is COW-shared.
    pub(super) writable: bool,
    /// Declared writability, restored by the COW split.
    pub(super) parent_writable: bool,
    /// Marker for pages created by stack growth.
    pub(super) stack: bool,
    pub(super) frame: Option<Arc<Frame>>,
    pub(super) backend: Backend,
}

impl Page {
    pub(super) fn new_uninit(
        pml4: Pml4,
        va: u64,
        writable: bool,
        stack: bool,
        kind: PageKind,
        init: PageInit,
    ) -> Self {
        Page {
            va,
            pml4,
            writable,
            parent_writable: writable,
            stack,
            frame: None,
            backend: Backend::Uninit(UninitPage::new(kind, init)),
        }
    }

    /// A fork-created page that shares `frame` copy-on-write. Effective
    /// writability starts false; the declared writability is restored by
    /// the first write fault.
    pub(super) fn new_shared(
        pml4: Pml4,
        va: u64,
        parent_writable: bool,
        stack: bool,
        frame: Arc<Frame>,
        backend: Backend,
    ) -> Self {
        Page {
            va,
            pml4,
            writable: false,
            parent_writable,
            stack,
            frame: Some(frame),
            backend,
        }
    }

    pub fn va(&self) -> u64 {
        self.va
    }

    pub fn pml4(&self) -> Pml4 {
        self.pml4
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_stack(&self) -> bool {
        self.stack
    }

    pub fn writable(&self) -> bool {
        self.writable
    }

    /// The page's eventual kind; uninit pages report their target.
    pub fn kind(&self) -> PageKind {
        match &self.backend {
            Backend::Uninit(u) => u.kind(),
            Backend::Anon(_) => PageKind::Anon,
            Backend::File(_) => PageKind::File,
        }
    }

    pub(super) fn is_backed_by(&self, frame: &Arc<Frame>) -> bool {
        match &self.frame {
            Some(f) => Arc::ptr_eq(f, frame),
            None => false,
        }
    }

    /// Total mapping length, present only in the head page of an mmap.
    pub(super) fn mapping_length(&self) -> Option<u64> {
        match &self.backend {
            Backend::Uninit(u) => u.mapping_length(),
            Backend::File(f) => f.seg.length,
            Backend::Anon(_) => None,
        }
    }

    fn tag(&self) -> BackendTag {
        match &self.backend {
            Backend::Uninit(_) => BackendTag::Uninit,
            Backend::Anon(_) => BackendTag::Anon,
            Backend::File(_) => BackendTag::File,
        }
    }

    /// Fill the freshly acquired frame at `kva` with this page's contents.
    /// For uninit pages this runs the initializer and performs the
    /// one-shot back-end transition.
    pub(super) fn swap_in(&mut self, vm: &Vm, kva: u64) -> VmResult<()> {
        match self.tag() {
            BackendTag::Uninit => uninit::swap_in(vm, self, kva),
            BackendTag::Anon => anon::swap_in(vm, self, kva),
            BackendTag::File => file::swap_in(vm, self, kva),
        }
    }

    /// Surrender residency: write contents to backing store as needed,
    /// clear the hardware mapping, and detach from the frame.
    pub(super) fn swap_out(&mut self, vm: &Vm) -> VmResult<()> {
        match self.tag() {
            BackendTag::Uninit => panic!("uninit page is never resident"),
            BackendTag::Anon => anon::swap_out(vm, self),
            BackendTag::File => file::swap_out(vm, self),
        }
    }

    /// Release everything the page holds: swap slot or frame reference,
    /// plus the hardware mapping. Does not touch the SPT; unlinking is the
    /// caller's job.
    pub(super) fn destroy(&mut self, vm: &Vm, this: &SharedPage) {
        match self.tag() {
            BackendTag::Uninit => {}
            BackendTag::Anon => anon::destroy(vm, self, this),
            BackendTag::File => file::destroy(vm, self, this),
        }
    }
}
