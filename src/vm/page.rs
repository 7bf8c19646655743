//! Supplemental page table.
//!
//! Each task keeps one supplemental page table entry (SPTE) per user page,
//! describing where the page's contents live when it is not resident: a
//! backing file region, a swap slot, or nothing at all for zero-fill and
//! stack pages. Every state transition of an entry happens under its lock,
//! which is also what makes frame teardown during eviction atomic with
//! respect to a concurrent fault on the same address.
//!
//! Page categories:
//!
//! | category | on fault                              | on eviction               |
//! |----------|---------------------------------------|---------------------------|
//! | `Zero`   | zero-filled frame                     | swap out                  |
//! | `File`   | read from file, zero the tail         | swap out                  |
//! | `Stack`  | zero-filled frame                     | swap out                  |
//! | `Mmap`   | read from file, zero the tail         | write back if dirty, else |
//! |          |                                       | discard                   |

use alloc::sync::Arc;

use log::trace;

use crate::error::{Error, Result};
use crate::fs::{File, InodeHandle};
use crate::lock::Spinlock;
use crate::param::PGSIZE;
use crate::vm::addr::{KPage, UVAddr};
use crate::vm::frame::AllocFlags;
use crate::vm::{Task, Vm};

/// What a page's contents are when not resident.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum PageType {
    /// All-zero page.
    Zero,
    /// Page read from a file (executable loading).
    File,
    /// Stack page.
    Stack,
    /// Memory-mapped file page; dirty contents go back to the file.
    Mmap,
}

/// File region backing a `File` or `Mmap` page.
pub(crate) struct Backing {
    pub(crate) inode: InodeHandle,
    pub(crate) offset: u32,
    pub(crate) read_bytes: u32,
    pub(crate) zero_bytes: u32,
}

pub(crate) struct SpteState {
    /// Current frame, if resident.
    pub(crate) kpage: Option<KPage>,
    /// Current swap slot, if swapped out.
    pub(crate) swap_slot: Option<usize>,
}

/// Supplemental page table entry.
pub struct Spte {
    pub(crate) uaddr: UVAddr,
    pub(crate) writable: bool,
    pub(crate) ty: PageType,
    pub(crate) backing: Option<Backing>,
    pub(crate) state: Spinlock<SpteState>,
}

impl Spte {
    pub(crate) fn new(uaddr: UVAddr, writable: bool, ty: PageType, backing: Option<Backing>) -> Arc<Spte> {
        Arc::new(Spte {
            uaddr,
            writable,
            ty,
            backing,
            state: Spinlock::new(
                "spte",
                SpteState {
                    kpage: None,
                    swap_slot: None,
                },
            ),
        })
    }
}

impl Vm {
    /// Registers a lazily loaded file-backed page for `task`. No frame is
    /// allocated; the first fault brings the contents in. `read_bytes`
    /// bytes come from `file` at `offset`, the rest of the page is zeroed.
    pub fn lazy_load_file_page(
        &self,
        task: &Task,
        file: &File,
        offset: u32,
        uaddr: UVAddr,
        read_bytes: u32,
        zero_bytes: u32,
        writable: bool,
    ) -> Result<()> {
        debug_assert!(uaddr.is_page_aligned());
        debug_assert_eq!(read_bytes as usize + zero_bytes as usize, PGSIZE);

        let (ty, backing) = if read_bytes == 0 {
            (PageType::Zero, None)
        } else {
            (
                PageType::File,
                Some(Backing {
                    inode: file.inode().reopen(),
                    offset,
                    read_bytes,
                    zero_bytes,
                }),
            )
        };
        let spte = Spte::new(uaddr, writable, ty, backing);

        let mut spt = task.spt.lock();
        if spt.contains_key(&uaddr) {
            return Err(Error::Exists);
        }
        spt.insert(uaddr, spte);
        Ok(())
    }

    /// Makes the page containing `fault_addr` resident, installing the
    /// mapping with the entry's writability. The entry's lock is held for
    /// the whole transition; a page found already resident is only pinned
    /// on request.
    pub fn load_page(&self, task: &Task, fault_addr: UVAddr, pin: bool) -> Result<()> {
        let uaddr = fault_addr.round_down();
        let spte = task
            .spt
            .lock()
            .get(&uaddr)
            .cloned()
            .ok_or(Error::NotFound)?;

        let mut state = spte.state.lock();
        if let Some(kpage) = state.kpage {
            if pin {
                self.frames.pin(kpage);
            }
            return Ok(());
        }

        let kpage = if let Some(slot) = state.swap_slot {
            let kpage =
                self.frames
                    .alloc(&spte, &task.pagedir, task.pid, AllocFlags::USER, &self.swap)?;
            self.frames
                .pool
                .with(kpage, |page| self.swap.swap_in(slot, page));
            state.swap_slot = None;
            trace!("page: {:?} back from swap slot {}", uaddr, slot);
            kpage
        } else {
            match spte.ty {
                PageType::Zero | PageType::Stack => self.frames.alloc(
                    &spte,
                    &task.pagedir,
                    task.pid,
                    AllocFlags::USER | AllocFlags::ZERO,
                    &self.swap,
                )?,
                PageType::File | PageType::Mmap => {
                    let kpage = self.frames.alloc(
                        &spte,
                        &task.pagedir,
                        task.pid,
                        AllocFlags::USER,
                        &self.swap,
                    )?;
                    let backing = spte.backing.as_ref().expect("file page without backing");
                    let read = backing.read_bytes as usize;
                    let zero = backing.zero_bytes as usize;
                    let ok = self.frames.pool.with(kpage, |page| {
                        if backing.inode.read_at(&mut page[..read], backing.offset) != read {
                            return false;
                        }
                        page[read..read + zero].fill(0);
                        true
                    });
                    if !ok {
                        self.frames.free(kpage);
                        return Err(Error::BadUserPointer);
                    }
                    kpage
                }
            }
        };

        state.kpage = Some(kpage);
        if !task.pagedir.install(uaddr, kpage, spte.writable) {
            state.kpage = None;
            self.frames.free(kpage);
            return Err(Error::Exists);
        }
        if !pin {
            self.frames.unpin(kpage);
        }
        Ok(())
    }

    /// Creates a new writable stack page at the faulting address and maps
    /// it. The page is marked dirty up front so eviction takes the swap
    /// path.
    pub fn stack_grow(&self, task: &Task, fault_addr: UVAddr, pin: bool) -> Result<()> {
        let uaddr = fault_addr.round_down();
        let spte = Spte::new(uaddr, true, PageType::Stack, None);

        let kpage = self.frames.alloc(
            &spte,
            &task.pagedir,
            task.pid,
            AllocFlags::USER | AllocFlags::ZERO,
            &self.swap,
        )?;
        spte.state.lock().kpage = Some(kpage);

        if !task.pagedir.install(uaddr, kpage, true) {
            self.frames.free(kpage);
            return Err(Error::Exists);
        }
        {
            let mut spt = task.spt.lock();
            if spt.contains_key(&uaddr) {
                task.pagedir.clear_page(uaddr);
                self.frames.free(kpage);
                return Err(Error::Exists);
            }
            spt.insert(uaddr, spte);
        }
        task.pagedir.set_dirty(uaddr, true);
        if !pin {
            self.frames.unpin(kpage);
        }
        trace!("page: stack grown to {:?}", uaddr);
        Ok(())
    }

    /// Releases whatever backs the page at `uaddr` (frame or swap slot),
    /// tears down the mapping and forgets the entry.
    pub fn free_page(&self, task: &Task, uaddr: UVAddr) {
        let uaddr = uaddr.round_down();
        let spte = match task.spt.lock().remove(&uaddr) {
            Some(spte) => spte,
            None => return,
        };
        let state = spte.state.lock();
        if let Some(slot) = state.swap_slot {
            self.swap.free_slot(slot);
        } else if let Some(kpage) = state.kpage {
            self.frames.free(kpage);
        }
        task.pagedir.clear_page(uaddr);
        task.pagedir.set_dirty(uaddr, false);
        task.pagedir.set_accessed(uaddr, false);
    }
}
