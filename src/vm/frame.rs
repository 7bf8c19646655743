//! Frame table.
//!
//! All user frames live in one global table scanned by a clock hand.
//! `alloc` hands out a free page from the pool or, when the pool is dry,
//! evicts a victim chosen by second chance: pinned frames are skipped, an
//! accessed frame loses its accessed bit and gets another lap, and the
//! first frame with neither survives.
//!
//! Victim teardown is made atomic with respect to faults on the same
//! address by holding the victim's SPTE lock from before the mapping is
//! torn down until its contents have been persisted: written back to the
//! backing file for dirty mmap pages, swapped out for everything else that
//! must survive. The fault path takes SPTE locks before the frame-table
//! lock, so the evictor only try-locks a victim and skips it on contention
//! rather than inverting the order.

use alloc::sync::Arc;
use alloc::vec::Vec;

use bitflags::bitflags;
use log::{trace, warn};

use crate::error::{Error, Result};
use crate::lock::Spinlock;
use crate::param::PGSIZE;
use crate::vm::addr::KPage;
use crate::vm::page::{PageType, Spte};
use crate::vm::pagedir::PageDir;
use crate::vm::swap::SwapArea;
use crate::vm::Pid;

bitflags! {
    /// Frame allocation flags.
    pub struct AllocFlags: u32 {
        /// Allocate from the user pool.
        const USER = 1 << 0;
        /// Zero the page, even when it came from eviction.
        const ZERO = 1 << 1;
        /// Failure to allocate is fatal.
        const ASSERT = 1 << 2;
    }
}

/// Fixed pool of user page frames. A `KPage` is an index into the pool.
pub(crate) struct PagePool {
    slots: Vec<Spinlock<[u8; PGSIZE]>>,
    free: Spinlock<Vec<usize>>,
}

impl PagePool {
    fn new(pages: usize) -> Self {
        let mut slots = Vec::with_capacity(pages);
        for _ in 0..pages {
            slots.push(Spinlock::new("kpage", [0u8; PGSIZE]));
        }
        Self {
            slots,
            free: Spinlock::new("page pool", (0..pages).rev().collect()),
        }
    }

    fn alloc(&self) -> Option<KPage> {
        self.free.lock().pop().map(KPage)
    }

    fn dealloc(&self, kpage: KPage) {
        self.free.lock().push(kpage.0);
    }

    /// Runs `f` over the page's contents.
    pub(crate) fn with<R>(&self, kpage: KPage, f: impl FnOnce(&mut [u8; PGSIZE]) -> R) -> R {
        let mut page = self.slots[kpage.0].lock();
        f(&mut *page)
    }
}

struct Fte {
    kpage: KPage,
    spte: Arc<Spte>,
    pagedir: Arc<PageDir>,
    owner: Pid,
    pinned: bool,
}

struct FrameList {
    frames: Vec<Fte>,
    hand: usize,
}

impl FrameList {
    fn remove(&mut self, index: usize) -> Fte {
        let fte = self.frames.remove(index);
        if self.hand > index {
            self.hand -= 1;
        }
        fte
    }
}

pub(crate) struct FrameTable {
    list: Spinlock<FrameList>,
    pub(crate) pool: PagePool,
}

impl FrameTable {
    pub(crate) fn new(pages: usize) -> Self {
        Self {
            list: Spinlock::new(
                "frame table",
                FrameList {
                    frames: Vec::new(),
                    hand: 0,
                },
            ),
            pool: PagePool::new(pages),
        }
    }

    /// Obtains a frame for `spte`, evicting if the pool is dry. The new
    /// frame starts pinned; the caller installs the mapping and unpins.
    pub(crate) fn alloc(
        &self,
        spte: &Arc<Spte>,
        pagedir: &Arc<PageDir>,
        owner: Pid,
        flags: AllocFlags,
        swap: &SwapArea,
    ) -> Result<KPage> {
        let mut list = self.list.lock();
        let kpage = match self.pool.alloc() {
            Some(kpage) => kpage,
            None => match self.evict(&mut *list, swap) {
                Some(kpage) => kpage,
                None => {
                    if flags.contains(AllocFlags::ASSERT) {
                        panic!("frame_alloc: out of memory and eviction failed");
                    }
                    return Err(Error::NoSpace);
                }
            },
        };
        if flags.contains(AllocFlags::ZERO) {
            self.pool.with(kpage, |page| page.fill(0));
        }
        list.frames.push(Fte {
            kpage,
            spte: spte.clone(),
            pagedir: pagedir.clone(),
            owner,
            pinned: true,
        });
        Ok(kpage)
    }

    /// Clock eviction. Returns `None` when every frame is pinned, or when
    /// two full laps find nothing but pinned, freshly accessed, or busy
    /// frames. The bound keeps a fault blocked on this table's lock from
    /// stalling the evictor forever via its held SPTE lock.
    fn evict(&self, list: &mut FrameList, swap: &SwapArea) -> Option<KPage> {
        if list.frames.iter().all(|f| f.pinned) {
            return None;
        }
        let mut scanned = 0;
        loop {
            if scanned > 2 * list.frames.len() {
                return None;
            }
            scanned += 1;
            if list.hand >= list.frames.len() {
                list.hand = 0;
            }
            let index = list.hand;
            list.hand += 1;

            let (pinned, uaddr, pagedir, spte) = {
                let f = &list.frames[index];
                (f.pinned, f.spte.uaddr, f.pagedir.clone(), f.spte.clone())
            };
            if pinned {
                continue;
            }
            if pagedir.is_accessed(uaddr) {
                pagedir.set_accessed(uaddr, false);
                continue;
            }

            // Victim. A frame must not be evicted by two threads at once,
            // and a fault on the same address must not observe a half
            // torn-down mapping, so the entry's lock is held from here
            // until the contents are persisted. A busy entry gets skipped.
            let mut state = match spte.state.try_lock() {
                Some(state) => state,
                None => continue,
            };
            let dirty = pagedir.is_dirty(uaddr);
            state.kpage = None;
            pagedir.clear_page(uaddr);
            let fte = list.remove(index);

            if fte.spte.ty == PageType::Mmap {
                if dirty {
                    let backing = fte.spte.backing.as_ref().expect("mmap page without backing");
                    let read = backing.read_bytes as usize;
                    self.pool.with(fte.kpage, |page| {
                        match backing.inode.write_at(&page[..read], backing.offset) {
                            Ok(n) if n == read => {}
                            _ => warn!(
                                "frame: write-back of {:?} to inode {} fell short",
                                uaddr,
                                backing.inode.inumber()
                            ),
                        }
                    });
                    pagedir.set_dirty(uaddr, false);
                }
                // A clean mmap page is discarded; the file still has it.
            } else {
                let slot = self
                    .pool
                    .with(fte.kpage, |page| swap.swap_out(page))
                    .unwrap_or_else(|_| panic!("swap area full while evicting {:?}", uaddr));
                state.swap_slot = Some(slot);
            }
            drop(state);

            trace!("frame: evicted {:?} of task {}", uaddr, fte.owner);
            return Some(fte.kpage);
        }
    }

    /// Returns the frame to the pool. The mapping must already be gone.
    pub(crate) fn free(&self, kpage: KPage) {
        let mut list = self.list.lock();
        if let Some(index) = list.frames.iter().position(|f| f.kpage == kpage) {
            let _ = list.remove(index);
            self.pool.dealloc(kpage);
        }
    }

    pub(crate) fn pin(&self, kpage: KPage) {
        let mut list = self.list.lock();
        if let Some(f) = list.frames.iter_mut().find(|f| f.kpage == kpage) {
            f.pinned = true;
        }
    }

    pub(crate) fn unpin(&self, kpage: KPage) {
        let mut list = self.list.lock();
        if let Some(f) = list.frames.iter_mut().find(|f| f.kpage == kpage) {
            f.pinned = false;
        }
    }

    /// Unpins every frame `owner` holds; run at each syscall exit.
    pub(crate) fn unpin_all(&self, owner: Pid) {
        let mut list = self.list.lock();
        for f in list.frames.iter_mut() {
            if f.owner == owner {
                f.pinned = false;
            }
        }
    }

    /// Drops every frame `owner` holds and returns the pages to the pool.
    pub(crate) fn free_all(&self, owner: Pid) {
        let mut list = self.list.lock();
        let mut index = 0;
        while index < list.frames.len() {
            if list.frames[index].owner == owner {
                let fte = list.remove(index);
                self.pool.dealloc(fte.kpage);
            } else {
                index += 1;
            }
        }
    }

    /// Number of frames currently in the table.
    pub(crate) fn frame_count(&self) -> usize {
        self.list.lock().frames.len()
    }
}
