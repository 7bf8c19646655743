//! Software page directory.
//!
//! Stands in for the hardware MMU: one per task, mapping user pages to
//! kernel frames with the accessed and dirty bits the clock hand and the
//! eviction write-back read. Clearing a page drops its presence but keeps
//! the entry, so the dirty bit stays readable until the page is freed for
//! good.

use alloc::collections::BTreeMap;

use crate::lock::Spinlock;
use crate::vm::addr::{KPage, UVAddr};

struct Pte {
    kpage: KPage,
    writable: bool,
    present: bool,
    accessed: bool,
    dirty: bool,
}

pub struct PageDir {
    map: Spinlock<BTreeMap<UVAddr, Pte>>,
}

impl PageDir {
    pub fn new() -> Self {
        Self {
            map: Spinlock::new("pagedir", BTreeMap::new()),
        }
    }

    /// Maps `va` to `kpage`. Fails if `va` is already mapped.
    pub(crate) fn install(&self, va: UVAddr, kpage: KPage, writable: bool) -> bool {
        debug_assert!(va.is_page_aligned());
        let mut map = self.map.lock();
        if map.get(&va).map_or(false, |pte| pte.present) {
            return false;
        }
        map.insert(
            va,
            Pte {
                kpage,
                writable,
                present: true,
                accessed: false,
                dirty: false,
            },
        );
        true
    }

    /// The frame behind `va`, if present.
    pub(crate) fn translate(&self, va: UVAddr) -> Option<(KPage, bool)> {
        let map = self.map.lock();
        map.get(&va.round_down())
            .filter(|pte| pte.present)
            .map(|pte| (pte.kpage, pte.writable))
    }

    /// Unmaps `va`, keeping the entry's flag bits readable.
    pub(crate) fn clear_page(&self, va: UVAddr) {
        let mut map = self.map.lock();
        if let Some(pte) = map.get_mut(&va) {
            pte.present = false;
        }
    }

    pub(crate) fn is_accessed(&self, va: UVAddr) -> bool {
        self.map.lock().get(&va).map_or(false, |pte| pte.accessed)
    }

    pub(crate) fn set_accessed(&self, va: UVAddr, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&va) {
            pte.accessed = value;
        }
    }

    pub(crate) fn is_dirty(&self, va: UVAddr) -> bool {
        self.map.lock().get(&va).map_or(false, |pte| pte.dirty)
    }

    pub(crate) fn set_dirty(&self, va: UVAddr, value: bool) {
        if let Some(pte) = self.map.lock().get_mut(&va) {
            pte.dirty = value;
        }
    }

    /// Marks the access the hardware would record for a load or store.
    pub(crate) fn mark_access(&self, va: UVAddr, write: bool) {
        let mut map = self.map.lock();
        if let Some(pte) = map.get_mut(&va.round_down()) {
            pte.accessed = true;
            if write {
                pte.dirty = true;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn install_translate_clear() {
        let pd = PageDir::new();
        let va = UVAddr::new(0x8000_0000);
        assert!(pd.install(va, KPage(3), true));
        assert!(!pd.install(va, KPage(4), true));
        assert_eq!(pd.translate(va + 0x123), Some((KPage(3), true)));

        pd.clear_page(va);
        assert_eq!(pd.translate(va), None);
        // Flag bits survive the unmap.
        pd.set_dirty(va, true);
        assert!(pd.is_dirty(va));
        // And the address can be mapped again.
        assert!(pd.install(va, KPage(5), false));
    }

    #[test]
    fn access_marks_bits() {
        let pd = PageDir::new();
        let va = UVAddr::new(0x4000);
        assert!(pd.install(va, KPage(0), true));
        assert!(!pd.is_accessed(va));
        pd.mark_access(va + 8, false);
        assert!(pd.is_accessed(va));
        assert!(!pd.is_dirty(va));
        pd.mark_access(va + 8, true);
        assert!(pd.is_dirty(va));
    }
}
