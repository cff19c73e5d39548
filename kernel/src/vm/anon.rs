//! Anonymous back-end
//!
//! Anonymous pages have no file behind them; when evicted they move to a
//! swap slot and the slot index is recorded on the page. The slot is
//! released only after its contents have been read back out, so a
//! concurrent allocation can never reuse it early.

use core::sync::atomic::Ordering;

use super::page::{Backend, Page, SharedPage};
use super::swap::SwapSlot;
use super::{Vm, VmResult};

/// Payload of an anonymous page: the swap slot, valid only while the
/// page is not resident.
pub struct AnonPage {
    slot: Option<SwapSlot>,
}

impl AnonPage {
    pub(super) fn new() -> Self {
        AnonPage { slot: None }
    }

    pub fn slot(&self) -> Option<SwapSlot> {
        self.slot
    }
}

fn payload(page: &mut Page) -> &mut AnonPage {
    match &mut page.backend {
        Backend::Anon(anon) => anon,
        _ => panic!("anon operation on non-anon page"),
    }
}

/// Read the recorded slot into `kva`, then free the slot.
pub(super) fn swap_in(vm: &Vm, page: &mut Page, kva: u64) -> VmResult<()> {
    let anon = payload(page);
    let slot = match anon.slot {
        Some(slot) => slot,
        None => panic!("anon swap_in without a swap slot"),
    };
    assert!(vm.swap.is_in_use(slot), "anon page holds a free swap slot");

    vm.swap.read_slot(vm.platform.swap, slot, kva)?;
    vm.swap.release(slot);
    payload(page).slot = None;
    vm.swapped_in.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Move the page's contents to a fresh swap slot and surrender the frame.
pub(super) fn swap_out(vm: &Vm, page: &mut Page) -> VmResult<()> {
    let frame = match page.frame.clone() {
        Some(frame) => frame,
        None => panic!("swap_out of a non-resident page"),
    };
    let slot = vm.swap.allocate()?;
    if let Err(err) = vm.swap.write_slot(vm.platform.swap, slot, frame.kva()) {
        vm.swap.release(slot);
        return Err(err);
    }

    vm.platform.mmu.clear_mapping(page.pml4(), page.va());
    payload(page).slot = Some(slot);
    page.frame = None;
    vm.swapped_out.fetch_add(1, Ordering::Relaxed);
    Ok(())
}

/// Release the slot or the frame reference, whichever the page holds.
pub(super) fn destroy(vm: &Vm, page: &mut Page, this: &SharedPage) {
    if let Some(frame) = page.frame.take() {
        vm.platform.mmu.clear_mapping(page.pml4(), page.va());
        frame.disown(this);
        vm.free_frame(frame);
    } else if let Some(slot) = payload(page).slot.take() {
        vm.swap.release(slot);
    }
}
