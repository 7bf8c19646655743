//! Demand-paged virtual memory.
//!
//! Three pieces cooperate here: per-task supplemental page tables (`page`),
//! one global frame table with clock eviction (`frame`), and a swap area
//! (`swap`). The hardware page directory is modeled in software
//! (`pagedir`); user loads and stores go through `copy_to_user` /
//! `copy_from_user`, which fault pages in, pin them for the copy the way
//! syscall user-pointer validation does, and record the accessed and dirty
//! bits the MMU would set.
//!
//! Memory-mapped files tie the subsystem to the file layer: pages read
//! from the file on fault, dirty pages written back at eviction and
//! munmap.

use alloc::collections::BTreeMap;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::cmp;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use log::debug;

use crate::error::{Error, Result};
use crate::fs::File;
use crate::hal::BlockDevice;
use crate::lock::Spinlock;
use crate::param::{MAX_STACK_SIZE, PGSIZE, USER_TOP};

pub mod addr;
mod frame;
mod page;
mod pagedir;
mod swap;

pub use addr::{pgrounddown, pgroundup, KPage, UVAddr};
pub use frame::AllocFlags;
pub use page::{PageType, Spte};
pub use pagedir::PageDir;
pub use swap::SwapArea;

use frame::FrameTable;

pub type Pid = u32;
pub type MapId = u32;

/// A fault address is eligible for stack growth when it lies inside the
/// stack window below `USER_TOP` and within 32 bytes below the saved stack
/// pointer (the PUSH/PUSHA rule) or above it.
fn stack_eligible(va: UVAddr, esp: usize) -> bool {
    let a = va.into_usize();
    a < USER_TOP && a >= USER_TOP - MAX_STACK_SIZE && a + 32 >= esp
}

struct MmapFile {
    id: MapId,
    base: UVAddr,
    pages: usize,
}

/// Per-task virtual-memory state.
pub struct Task {
    pub(crate) pid: Pid,
    pub(crate) pagedir: Arc<PageDir>,
    pub(crate) spt: Spinlock<BTreeMap<UVAddr, Arc<Spte>>>,
    mmaps: Spinlock<Vec<MmapFile>>,
    next_mapid: AtomicU32,
    /// Saved user stack pointer, consulted by the growth heuristic.
    esp: AtomicUsize,
}

impl Task {
    pub fn pid(&self) -> Pid {
        self.pid
    }

    /// Records the user stack pointer at kernel entry.
    pub fn set_stack_pointer(&self, esp: usize) {
        self.esp.store(esp, Ordering::Relaxed);
    }

    fn stack_pointer(&self) -> usize {
        self.esp.load(Ordering::Relaxed)
    }

    /// Number of pages the supplemental page table tracks.
    pub fn mapped_pages(&self) -> usize {
        self.spt.lock().len()
    }
}

/// The virtual-memory subsystem: frame pool, frame table and swap area.
pub struct Vm {
    pub(crate) frames: FrameTable,
    pub(crate) swap: SwapArea,
    next_pid: AtomicU32,
}

impl Vm {
    /// Builds the subsystem with a user pool of `user_pages` frames and the
    /// given swap device.
    pub fn new(swap_dev: Arc<dyn BlockDevice>, user_pages: usize) -> Vm {
        Vm {
            frames: FrameTable::new(user_pages),
            swap: SwapArea::new(swap_dev),
            next_pid: AtomicU32::new(1),
        }
    }

    pub fn new_task(&self) -> Task {
        Task {
            pid: self.next_pid.fetch_add(1, Ordering::Relaxed),
            pagedir: Arc::new(PageDir::new()),
            spt: Spinlock::new("spt", BTreeMap::new()),
            mmaps: Spinlock::new("mmaps", Vec::new()),
            next_mapid: AtomicU32::new(1),
            esp: AtomicUsize::new(USER_TOP),
        }
    }

    /// Maps `file` at `addr`, page by page. The address must be page
    /// aligned and non-zero, the file non-empty, and the range unmapped.
    /// The mapping holds its own open of the file's inode, so closing the
    /// file does not tear the mapping down.
    pub fn mmap(&self, task: &Task, file: &File, addr: UVAddr) -> Result<MapId> {
        if addr.is_null() || !addr.is_page_aligned() {
            return Err(Error::Invalid);
        }
        if file.is_dir() {
            return Err(Error::IsDir);
        }
        let len = file.length();
        if len == 0 {
            return Err(Error::Invalid);
        }
        let pages = pgroundup(len as usize) / PGSIZE;

        {
            let spt = task.spt.lock();
            for i in 0..pages {
                if spt.contains_key(&(addr + i * PGSIZE)) {
                    return Err(Error::Exists);
                }
            }
        }

        for i in 0..pages {
            let offset = (i * PGSIZE) as u32;
            let read_bytes = cmp::min(PGSIZE as u32, len - offset);
            let spte = Spte::new(
                addr + i * PGSIZE,
                true,
                PageType::Mmap,
                Some(page::Backing {
                    inode: file.inode().reopen(),
                    offset,
                    read_bytes,
                    zero_bytes: PGSIZE as u32 - read_bytes,
                }),
            );
            task.spt.lock().insert(addr + i * PGSIZE, spte);
        }

        let id = task.next_mapid.fetch_add(1, Ordering::Relaxed);
        task.mmaps.lock().push(MmapFile {
            id,
            base: addr,
            pages,
        });
        debug!("vm: task {} mapped {} pages at {:?}", task.pid, pages, addr);
        Ok(id)
    }

    /// Unmaps mapping `id`: resident dirty pages are written back to the
    /// file, frames freed, entries forgotten, and the mapping's inode
    /// open released.
    pub fn munmap(&self, task: &Task, id: MapId) -> Result<()> {
        let m = {
            let mut mmaps = task.mmaps.lock();
            let pos = mmaps
                .iter()
                .position(|m| m.id == id)
                .ok_or(Error::NotFound)?;
            mmaps.remove(pos)
        };

        for i in 0..m.pages {
            let uaddr = m.base + i * PGSIZE;
            let spte = match task.spt.lock().remove(&uaddr) {
                Some(spte) => spte,
                None => continue,
            };
            let state = spte.state.lock();
            // Mmap pages never reach swap; eviction writes them back or
            // discards them.
            debug_assert!(state.swap_slot.is_none());
            if let Some(kpage) = state.kpage {
                if task.pagedir.is_dirty(uaddr) {
                    let backing = spte.backing.as_ref().expect("mmap page without backing");
                    let read = backing.read_bytes as usize;
                    self.frames.pool.with(kpage, |page| {
                        let _ = backing.inode.write_at(&page[..read], backing.offset);
                    });
                }
                self.frames.free(kpage);
            }
            task.pagedir.clear_page(uaddr);
            task.pagedir.set_dirty(uaddr, false);
            task.pagedir.set_accessed(uaddr, false);
        }
        Ok(())
    }

    /// Tears down every mapping and page of `task` at exit.
    pub fn exit_task(&self, task: &Task) {
        let ids: Vec<MapId> = task.mmaps.lock().iter().map(|m| m.id).collect();
        for id in ids {
            let _ = self.munmap(task, id);
        }
        let pages: Vec<UVAddr> = task.spt.lock().keys().cloned().collect();
        for uaddr in pages {
            self.free_page(task, uaddr);
        }
        self.frames.free_all(task.pid);
    }

    /// Resolves a fault at `uaddr`: loads the page if the task has an
    /// entry for it, grows the stack if the address qualifies, and reports
    /// a bad pointer otherwise.
    pub fn handle_fault(&self, task: &Task, uaddr: UVAddr, pin: bool) -> Result<()> {
        match self.load_page(task, uaddr, pin) {
            Err(Error::NotFound) => {
                if stack_eligible(uaddr, task.stack_pointer()) {
                    self.stack_grow(task, uaddr, pin)
                } else {
                    Err(Error::BadUserPointer)
                }
            }
            other => other,
        }
    }

    /// Runs `f` over the frame backing user page `page`, faulting it in
    /// first. The frame stays pinned for the duration of `f` so eviction
    /// cannot reclaim it mid-copy.
    fn with_user_page<R>(
        &self,
        task: &Task,
        page: UVAddr,
        write: bool,
        f: impl FnOnce(&mut [u8; PGSIZE]) -> R,
    ) -> Result<R> {
        self.handle_fault(task, page, true)?;
        let (kpage, writable) = task
            .pagedir
            .translate(page)
            .ok_or(Error::BadUserPointer)?;
        if write && !writable {
            self.frames.unpin(kpage);
            return Err(Error::BadUserPointer);
        }
        let r = self.frames.pool.with(kpage, f);
        task.pagedir.mark_access(page, write);
        self.frames.unpin(kpage);
        Ok(r)
    }

    /// A user-mode store: copies `src` to user address `addr`, faulting
    /// pages in and recording accessed/dirty bits as the hardware would.
    pub fn copy_to_user(&self, task: &Task, addr: UVAddr, src: &[u8]) -> Result<()> {
        let mut done = 0;
        while done < src.len() {
            let va = addr + done;
            let ofs = va.page_offset();
            let chunk = cmp::min(src.len() - done, PGSIZE - ofs);
            self.with_user_page(task, va.round_down(), true, |page| {
                page[ofs..ofs + chunk].copy_from_slice(&src[done..done + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// A user-mode load: copies from user address `addr` into `dst`.
    pub fn copy_from_user(&self, task: &Task, addr: UVAddr, dst: &mut [u8]) -> Result<()> {
        let mut done = 0;
        while done < dst.len() {
            let va = addr + done;
            let ofs = va.page_offset();
            let chunk = cmp::min(dst.len() - done, PGSIZE - ofs);
            self.with_user_page(task, va.round_down(), false, |page| {
                dst[done..done + chunk].copy_from_slice(&page[ofs..ofs + chunk]);
            })?;
            done += chunk;
        }
        Ok(())
    }

    /// Unpins every frame of `task`; run at each syscall exit.
    pub fn unpin_all(&self, task: &Task) {
        self.frames.unpin_all(task.pid);
    }

    /// Number of frames currently mapped across all tasks.
    pub fn frame_count(&self) -> usize {
        self.frames.frame_count()
    }
}
