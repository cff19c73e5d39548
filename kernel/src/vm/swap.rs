//! Swap-slot allocator (bitmap)
//!
//! Tracks page-sized slots on the swap block device via a bitmap.
//! Each bit represents one slot: 0 = free, 1 = in use. A slot spans
//! eight consecutive 512-byte sectors.

use alloc::vec;
use alloc::vec::Vec;
use spin::Mutex;

use super::hal::SwapDevice;
use super::{VmError, VmResult, DISK_SECTOR_SIZE, PAGE_SIZE, SECTORS_PER_PAGE};

/// Index of one page-sized slot on the swap device.
pub type SwapSlot = usize;

/// Bitmap: each bit = one slot. bit set = in use.
struct SwapBitmap {
    words: Vec<u64>,
    slots: usize,
    used: usize,
}

/// Slot accounting for the swap device, one per [`super::Vm`].
pub struct SwapTable {
    bitmap: Mutex<SwapBitmap>,
}

impl SwapTable {
    /// All slots start free; swap contents do not survive a boot.
    pub fn new(slots: usize) -> Self {
        let words = (slots + 63) / 64;
        SwapTable {
            bitmap: Mutex::new(SwapBitmap {
                words: vec![0u64; words],
                slots,
                used: 0,
            }),
        }
    }

    /// Claim the first free slot.
    pub fn allocate(&self) -> VmResult<SwapSlot> {
        let mut bitmap = self.bitmap.lock();
        for idx in 0..bitmap.words.len() {
            let word = bitmap.words[idx];
            if word == u64::MAX {
                continue;
            }
            let bit = (!word).trailing_zeros() as usize;
            let slot = idx * 64 + bit;
            if slot >= bitmap.slots {
                break;
            }
            bitmap.words[idx] |= 1u64 << bit;
            bitmap.used += 1;
            return Ok(slot);
        }
        Err(VmError::OutOfSwap)
    }

    /// Return a slot to the free pool. The slot must be in use.
    pub fn release(&self, slot: SwapSlot) {
        let mut bitmap = self.bitmap.lock();
        debug_assert!(slot < bitmap.slots, "swap slot {} out of range", slot);
        let (word, bit) = (slot / 64, slot % 64);
        debug_assert!(
            bitmap.words[word] & (1u64 << bit) != 0,
            "double release of swap slot {}",
            slot
        );
        bitmap.words[word] &= !(1u64 << bit);
        bitmap.used = bitmap.used.saturating_sub(1);
    }

    pub fn is_in_use(&self, slot: SwapSlot) -> bool {
        let bitmap = self.bitmap.lock();
        if slot >= bitmap.slots {
            return false;
        }
        bitmap.words[slot / 64] & (1u64 << (slot % 64)) != 0
    }

    pub fn slots(&self) -> usize {
        self.bitmap.lock().slots
    }

    pub fn used(&self) -> usize {
        self.bitmap.lock().used
    }

    /// Read one slot into the page at `kva`.
    pub fn read_slot(&self, dev: &dyn SwapDevice, slot: SwapSlot, kva: u64) -> VmResult<()> {
        let page = unsafe { core::slice::from_raw_parts_mut(kva as *mut u8, PAGE_SIZE) };
        let base = (slot * SECTORS_PER_PAGE) as u64;
        for i in 0..SECTORS_PER_PAGE {
            let buf = &mut page[i * DISK_SECTOR_SIZE..(i + 1) * DISK_SECTOR_SIZE];
            dev.read_sector(base + i as u64, buf)
                .map_err(|_| VmError::IoError)?;
        }
        Ok(())
    }

    /// Write the page at `kva` into one slot.
    pub fn write_slot(&self, dev: &dyn SwapDevice, slot: SwapSlot, kva: u64) -> VmResult<()> {
        let page = unsafe { core::slice::from_raw_parts(kva as *const u8, PAGE_SIZE) };
        let base = (slot * SECTORS_PER_PAGE) as u64;
        for i in 0..SECTORS_PER_PAGE {
            let buf = &page[i * DISK_SECTOR_SIZE..(i + 1) * DISK_SECTOR_SIZE];
            dev.write_sector(base + i as u64, buf)
                .map_err(|_| VmError::IoError)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allocate_is_first_fit() {
        let table = SwapTable::new(8);
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(table.allocate().unwrap(), 1);
        table.release(0);
        assert_eq!(table.allocate().unwrap(), 0);
        assert_eq!(table.used(), 2);
    }

    #[test]
    fn exhaustion_reports_out_of_swap() {
        let table = SwapTable::new(2);
        table.allocate().unwrap();
        table.allocate().unwrap();
        assert_eq!(table.allocate(), Err(VmError::OutOfSwap));
        table.release(1);
        assert_eq!(table.allocate().unwrap(), 1);
    }

    #[test]
    #[should_panic(expected = "double release")]
    fn double_release_asserts() {
        let table = SwapTable::new(4);
        let slot = table.allocate().unwrap();
        table.release(slot);
        table.release(slot);
    }
}
