//! Swap area.
//!
//! The swap device is partitioned into page-sized slots of eight sectors
//! each; a bitmap tracks slot occupancy. All operations serialize on one
//! lock and assert slot validity.

use alloc::sync::Arc;
use core::convert::TryInto;

use bitmaps::Bitmap;
use log::trace;

use crate::error::{Error, Result};
use crate::hal::BlockDevice;
use crate::lock::Spinlock;
use crate::param::{NSWAP_MAX, PGSIZE, SECTORS_PER_PAGE, SECTOR_SIZE};

struct SwapInner {
    bits: Bitmap<NSWAP_MAX>,
    slots: usize,
}

pub struct SwapArea {
    dev: Arc<dyn BlockDevice>,
    inner: Spinlock<SwapInner>,
}

impl SwapArea {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        let slots = core::cmp::min(dev.size() as usize / SECTORS_PER_PAGE, NSWAP_MAX);
        assert!(slots > 0, "swap device too small for a single page");
        Self {
            dev,
            inner: Spinlock::new(
                "swap",
                SwapInner {
                    bits: Bitmap::new(),
                    slots,
                },
            ),
        }
    }

    /// Number of page slots the area exposes.
    pub fn slots(&self) -> usize {
        self.inner.lock().slots
    }

    /// Writes `page` to the first free slot and returns its index.
    pub fn swap_out(&self, page: &[u8; PGSIZE]) -> Result<usize> {
        let mut inner = self.inner.lock();
        let index = match inner.bits.first_false_index() {
            Some(i) if i < inner.slots => i,
            _ => return Err(Error::NoSpace),
        };
        inner.bits.set(index, true);
        for i in 0..SECTORS_PER_PAGE {
            let from = i * SECTOR_SIZE;
            let sector: &[u8; SECTOR_SIZE] =
                page[from..from + SECTOR_SIZE].try_into().unwrap();
            self.dev
                .write((index * SECTORS_PER_PAGE + i) as u32, sector);
        }
        trace!("swap: out to slot {}", index);
        Ok(index)
    }

    /// Reads slot `index` back into `page` and frees the slot.
    pub fn swap_in(&self, index: usize, page: &mut [u8; PGSIZE]) {
        let mut inner = self.inner.lock();
        assert!(index < inner.slots, "swap_in: slot {} out of range", index);
        assert!(inner.bits.get(index), "swap_in: slot {} is free", index);
        for i in 0..SECTORS_PER_PAGE {
            let from = i * SECTOR_SIZE;
            let sector: &mut [u8; SECTOR_SIZE] =
                (&mut page[from..from + SECTOR_SIZE]).try_into().unwrap();
            self.dev.read((index * SECTORS_PER_PAGE + i) as u32, sector);
        }
        inner.bits.set(index, false);
        trace!("swap: in from slot {}", index);
    }

    /// Frees slot `index` without reading it.
    pub fn free_slot(&self, index: usize) {
        let mut inner = self.inner.lock();
        assert!(index < inner.slots, "free_slot: slot {} out of range", index);
        assert!(inner.bits.get(index), "free_slot: slot {} is free", index);
        inner.bits.set(index, false);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;
    use std::sync::Arc;

    fn page_of(byte: u8) -> Box<[u8; PGSIZE]> {
        Box::new([byte; PGSIZE])
    }

    #[test]
    fn round_trip_preserves_bytes() {
        let swap = SwapArea::new(Arc::new(MemDisk::new(64)));
        let mut out = page_of(0x5a);
        out[0] = 1;
        out[PGSIZE - 1] = 2;
        let slot = swap.swap_out(&out).unwrap();

        let mut back = page_of(0);
        swap.swap_in(slot, &mut back);
        assert_eq!(out[..], back[..]);
    }

    #[test]
    fn slots_are_not_reissued_while_busy() {
        let swap = SwapArea::new(Arc::new(MemDisk::new(64)));
        assert_eq!(swap.slots(), 8);
        let a = swap.swap_out(&page_of(1)).unwrap();
        let b = swap.swap_out(&page_of(2)).unwrap();
        assert_ne!(a, b);

        // Freeing `a` makes it the first-fit choice again.
        swap.free_slot(a);
        assert_eq!(swap.swap_out(&page_of(3)).unwrap(), a);
    }

    #[test]
    fn full_area_reports_no_space() {
        let swap = SwapArea::new(Arc::new(MemDisk::new(16)));
        assert_eq!(swap.slots(), 2);
        swap.swap_out(&page_of(1)).unwrap();
        swap.swap_out(&page_of(2)).unwrap();
        assert_eq!(swap.swap_out(&page_of(3)), Err(Error::NoSpace));
    }

    #[test]
    #[should_panic(expected = "is free")]
    fn freeing_a_free_slot_panics() {
        let swap = SwapArea::new(Arc::new(MemDisk::new(64)));
        swap.free_slot(0);
    }
}
