//! Supplemental page table
//!
//! Per-process map from page-aligned user virtual address to page
//! descriptor. The map is owned by its process; other threads reach
//! individual pages only through the frame table's weak back-pointers.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use spin::Mutex;

use super::page::{Backend, Page, SharedPage};
use super::{pg_round_down, Vm, VmError, VmProcess, VmResult};

pub struct SupPageTable {
    pages: BTreeMap<u64, SharedPage>,
}

impl SupPageTable {
    pub const fn new() -> Self {
        SupPageTable {
            pages: BTreeMap::new(),
        }
    }

    /// Look up the page covering `va` (any address within the page).
    pub fn find(&self, va: u64) -> Option<SharedPage> {
        self.pages.get(&pg_round_down(va)).cloned()
    }

    /// Register a new page. Duplicate addresses fail.
    pub(super) fn insert(&mut self, page: Page) -> VmResult<SharedPage> {
        let va = page.va();
        if self.pages.contains_key(&va) {
            return Err(VmError::DuplicateMapping);
        }
        let shared = Arc::new(Mutex::new(page));
        self.pages.insert(va, shared.clone());
        Ok(shared)
    }

    /// Destroy and unlink the page at `va`. Returns false if absent.
    pub fn remove(&mut self, vm: &Vm, va: u64) -> bool {
        match self.pages.remove(&pg_round_down(va)) {
            Some(page) => {
                page.lock().destroy(vm, &page);
                true
            }
            None => false,
        }
    }

    /// Destroy every page, in address order. Tolerates pages in any
    /// state: lazy, resident, or swapped out.
    pub fn kill(&mut self, vm: &Vm) {
        while let Some((_, page)) = self.pages.pop_first() {
            page.lock().destroy(vm, &page);
        }
    }

    pub fn len(&self) -> usize {
        self.pages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pages.is_empty()
    }

    fn entries(&self) -> Vec<(u64, SharedPage)> {
        self.pages
            .iter()
            .map(|(va, page)| (*va, page.clone()))
            .collect()
    }
}

impl Default for SupPageTable {
    fn default() -> Self {
        Self::new()
    }
}

impl Vm {
    /// Fork support: populate `dst`'s table from `src`'s.
    ///
    /// Lazy pages are duplicated sharing the initializer payload. All
    /// other pages end up sharing their frame copy-on-write: both sides
    /// lose hardware write access until the first write fault splits
    /// them. A page that is swapped out is claimed in the parent first;
    /// two pages must never own the same swap slot.
    pub fn spt_copy(&self, dst: &mut VmProcess, src: &VmProcess) -> VmResult<()> {
        for (va, parent_ref) in src.spt.entries() {
            let mut parent = parent_ref.lock();

            if let Backend::Uninit(uninit) = &parent.backend {
                let (kind, init) = uninit.clone_payload();
                let page = Page::new_uninit(
                    dst.pml4,
                    va,
                    parent.parent_writable,
                    parent.is_stack(),
                    kind,
                    init,
                );
                drop(parent);
                dst.spt.insert(page)?;
                continue;
            }

            if !parent.is_resident() {
                drop(parent);
                self.do_claim_page(&parent_ref)?;
                parent = parent_ref.lock();
            }
            let frame = match parent.frame.clone() {
                Some(frame) => frame,
                None => return Err(VmError::OutOfMemory),
            };

            let backend = match &parent.backend {
                Backend::Anon(_) => Backend::Anon(super::anon::AnonPage::new()),
                Backend::File(file) => Backend::File(super::file::FilePage {
                    seg: file.seg.clone(),
                }),
                Backend::Uninit(_) => unreachable!(),
            };
            let child = Page::new_shared(
                dst.pml4,
                va,
                parent.parent_writable,
                parent.is_stack(),
                frame.clone(),
                backend,
            );

            self.share_frame(&frame);
            parent.writable = false;
            self.platform
                .mmu
                .set_mapping(parent.pml4(), va, frame.kva(), false);
            drop(parent);

            if let Err(err) = dst.spt.insert(child) {
                self.free_frame(frame);
                return Err(err);
            }
            self.platform.mmu.set_mapping(dst.pml4, va, frame.kva(), false);
        }
        Ok(())
    }

    /// Process exit: write back dirty file pages, release every frame
    /// and swap slot, clear every hardware mapping.
    pub fn spt_kill(&self, proc: &mut VmProcess) {
        proc.spt.kill(self);
    }
}

#[cfg(test)]
mod tests {
    use super::super::page::PageKind;
    use super::super::testing::TestPlatform;
    use super::super::uninit::PageInit;
    use super::super::{Vm, VmError, VmProcess};

    #[test]
    fn find_rounds_down() {
        let vm = Vm::new(TestPlatform::new(4, 8).platform());
        let mut proc = VmProcess::new(1);
        vm.alloc_page(&mut proc, PageKind::Anon, 0x40_0000, true)
            .unwrap();
        assert!(proc.spt.find(0x40_0123).is_some());
        assert!(proc.spt.find(0x40_1000).is_none());
    }

    #[test]
    fn duplicate_insert_fails() {
        let vm = Vm::new(TestPlatform::new(4, 8).platform());
        let mut proc = VmProcess::new(1);
        vm.alloc_page(&mut proc, PageKind::Anon, 0x40_0000, true)
            .unwrap();
        let again = vm.alloc_page_with_initializer(
            &mut proc,
            PageKind::Anon,
            0x40_0000,
            true,
            PageInit::Zeroed,
        );
        assert_eq!(again, Err(VmError::DuplicateMapping));
    }

    #[test]
    fn remove_destroys_and_unlinks() {
        let vm = Vm::new(TestPlatform::new(4, 8).platform());
        let mut proc = VmProcess::new(1);
        vm.alloc_page(&mut proc, PageKind::Anon, 0x40_0000, true)
            .unwrap();
        vm.claim_page(&proc, 0x40_0000).unwrap();
        assert!(proc.spt.remove(&vm, 0x40_0000));
        assert!(!proc.spt.remove(&vm, 0x40_0000));
        assert!(proc.spt.is_empty());
    }
}
