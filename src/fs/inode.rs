//! Inodes.
//!
//! An inode describes a single unnamed file or directory. The on-disk
//! structure occupies exactly one sector and holds the length, a directory
//! flag, the parent sector (used by `..`), and the allocation map: twelve
//! direct sector pointers, one singly-indirect pointer and one
//! doubly-indirect pointer, each indirect sector holding 128 pointers.
//! Unallocated pointers store `NO_SECTOR`.
//!
//! The kernel keeps a table of in-use inodes in memory to provide a place
//! for synchronizing access to inodes used by multiple threads. `open`
//! finds or creates a table entry and bumps its open count; dropping the
//! last `InodeHandle` removes the entry and, if the inode was removed while
//! open, returns every sector it owns to the free map.
//!
//! Each in-memory inode carries the access-class lock (`RwxLock`): readers
//! of inode state and directory scans share the reader class, non-extending
//! writes and bookkeeping share the writer class, and extending writes,
//! directory mutation, creation and close take the exclusive class, which
//! keeps both other classes out. `write_at` decides whether it must extend
//! *after* entering the exclusive class and downgrades to the writer class
//! when it does not, so two racing extenders cannot both conclude that the
//! other will do the allocation.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::cmp;
use core::convert::TryInto;
use core::mem;
use core::ops::Deref;

use log::warn;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::fs::FileSys;
use crate::lock::{RwxLock, Spinlock};
use crate::param::{MAX_FILE_SIZE, NDIRECT, NINDIRECT, NO_SECTOR, ROOT_SECTOR, SECTOR_SIZE};

/// Identifies an inode sector.
pub const INODE_MAGIC: u32 = 0x494e_4f44;

/// Number of sectors needed to hold `len` bytes of data.
pub(crate) fn bytes_to_sectors(len: u32) -> u32 {
    (len + SECTOR_SIZE as u32 - 1) / SECTOR_SIZE as u32
}

/// On-disk inode. Must be exactly one sector.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub struct DiskInode {
    /// File size in bytes.
    length: u32,
    /// Non-zero if the inode is a directory.
    is_dir: u8,
    _pad: [u8; 3],
    /// Parent directory's inode sector.
    parent: u32,
    /// Direct data sectors.
    direct: [u32; NDIRECT],
    /// Singly-indirect sector.
    indirect_lv1: u32,
    /// Doubly-indirect sector.
    indirect_lv2: u32,
    magic: u32,
    _unused: [u8; 440],
}

const_assert!(mem::size_of::<DiskInode>() == SECTOR_SIZE);

impl DiskInode {
    fn zeroed() -> Self {
        Self {
            length: 0,
            is_dir: 0,
            _pad: [0; 3],
            parent: 0,
            direct: [0; NDIRECT],
            indirect_lv1: 0,
            indirect_lv2: 0,
            magic: 0,
            _unused: [0; 440],
        }
    }

    /// A fresh inode: all pointers unallocated, parented to the root.
    fn new(length: u32, is_dir: bool) -> Self {
        Self {
            length,
            is_dir: is_dir as u8,
            _pad: [0; 3],
            parent: ROOT_SECTOR,
            direct: [NO_SECTOR; NDIRECT],
            indirect_lv1: NO_SECTOR,
            indirect_lv2: NO_SECTOR,
            magic: INODE_MAGIC,
            _unused: [0; 440],
        }
    }
}

/// A sector of 128 sector pointers.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
struct IndirectBlock {
    slots: [u32; NINDIRECT],
}

const_assert!(mem::size_of::<IndirectBlock>() == SECTOR_SIZE);

impl IndirectBlock {
    fn empty() -> Self {
        Self {
            slots: [NO_SECTOR; NINDIRECT],
        }
    }
}

fn some_sector(sector: u32) -> Option<u32> {
    if sector == NO_SECTOR {
        None
    } else {
        Some(sector)
    }
}

pub(crate) struct InodeInner {
    /// Number of openers.
    pub open_cnt: u32,
    /// Deleted; sectors are reclaimed at last close.
    pub removed: bool,
    /// 0: writes ok, >0: deny writes. Never exceeds `open_cnt`.
    pub deny_write_cnt: u32,
    /// Cached copy of the on-disk inode.
    pub disk: DiskInode,
}

/// In-memory inode.
pub struct Inode {
    sector: u32,
    pub(crate) rwx: RwxLock,
    pub(crate) inner: Spinlock<InodeInner>,
    fs: Weak<FileSys>,
}

impl Inode {
    pub(crate) fn fs(&self) -> Arc<FileSys> {
        self.fs.upgrade().expect("inode outlived its file system")
    }

    /// The inode's number: the sector it lives in.
    pub fn inumber(&self) -> u32 {
        self.sector
    }

    /// File length in bytes.
    pub fn length(&self) -> u32 {
        self.rwx.read_enter();
        let len = self.inner.lock().disk.length;
        self.rwx.read_exit();
        len
    }

    /// Whether the inode is a directory.
    pub fn is_dir(&self) -> bool {
        self.rwx.read_enter();
        let is_dir = self.inner.lock().disk.is_dir != 0;
        self.rwx.read_exit();
        is_dir
    }

    /// Sector of the parent directory's inode.
    pub fn parent(&self) -> u32 {
        self.inner.lock().disk.parent
    }

    /// Number of openers.
    pub fn open_cnt(&self) -> u32 {
        self.rwx.read_enter();
        let cnt = self.inner.lock().open_cnt;
        self.rwx.read_exit();
        cnt
    }

    /// Marks the inode for deletion at last close.
    pub(crate) fn remove_mark(&self) {
        self.rwx.write_enter();
        self.inner.lock().removed = true;
        self.rwx.write_exit();
    }

    /// Disables writes. May be called at most once per opener.
    pub fn deny_write(&self) {
        self.rwx.write_enter();
        {
            let mut inner = self.inner.lock();
            inner.deny_write_cnt += 1;
            assert!(inner.deny_write_cnt <= inner.open_cnt);
        }
        self.rwx.write_exit();
    }

    /// Re-enables writes. Must pair with an earlier `deny_write`.
    pub fn allow_write(&self) {
        self.rwx.write_enter();
        {
            let mut inner = self.inner.lock();
            assert!(inner.deny_write_cnt > 0);
            assert!(inner.deny_write_cnt <= inner.open_cnt);
            inner.deny_write_cnt -= 1;
        }
        self.rwx.write_exit();
    }

    /// Device sector containing byte `pos` of the file, or `None` when
    /// `pos` is past the end.
    fn byte_to_sector(&self, pos: u32) -> Option<u32> {
        const DIRECT_BYTES: usize = NDIRECT * SECTOR_SIZE;
        const INDIRECT_BYTES: usize = NINDIRECT * SECTOR_SIZE;

        let disk = {
            let inner = self.inner.lock();
            if pos >= inner.disk.length {
                return None;
            }
            inner.disk
        };
        let fs = self.fs();
        let pos = pos as usize;

        if pos < DIRECT_BYTES {
            return some_sector(disk.direct[pos / SECTOR_SIZE]);
        }
        if pos < DIRECT_BYTES + INDIRECT_BYTES {
            return indirect_lookup(&fs, disk.indirect_lv1, pos - DIRECT_BYTES);
        }
        if pos < DIRECT_BYTES + (1 + NINDIRECT) * INDIRECT_BYTES {
            let rel = pos - DIRECT_BYTES - INDIRECT_BYTES;
            let index = rel / INDIRECT_BYTES;
            let mut outer = IndirectBlock::empty();
            fs.cache.read_obj(disk.indirect_lv2, &mut outer);
            return indirect_lookup(&fs, outer.slots[index], rel - index * INDIRECT_BYTES);
        }
        None
    }

    /// Reads up to `buf.len()` bytes starting at `offset` under the reader
    /// class. Returns the number of bytes read; reads past the end are
    /// short.
    pub fn read_at(&self, buf: &mut [u8], offset: u32) -> usize {
        self.rwx.read_enter();
        let n = self.read_at_unlocked(buf, offset);
        self.rwx.read_exit();
        n
    }

    /// Read loop without class bookkeeping, for callers that already hold a
    /// class on this inode.
    pub(crate) fn read_at_unlocked(&self, buf: &mut [u8], offset: u32) -> usize {
        let fs = self.fs();
        let mut offset = offset as usize;
        let mut read = 0;
        while read < buf.len() {
            let length = self.inner.lock().disk.length as usize;
            if offset >= length {
                break;
            }
            let sector = match self.byte_to_sector(offset as u32) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(buf.len() - read, length - offset),
                SECTOR_SIZE - sector_ofs,
            );
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let dst = (&mut buf[read..read + SECTOR_SIZE]).try_into().unwrap();
                fs.cache.read(sector, dst);
            } else {
                let mut bounce = [0u8; SECTOR_SIZE];
                fs.cache.read(sector, &mut bounce);
                buf[read..read + chunk].copy_from_slice(&bounce[sector_ofs..sector_ofs + chunk]);
            }
            read += chunk;
            offset += chunk;
        }
        read
    }

    /// Writes `buf` at `offset`, extending the file when the write ends
    /// past the current length. The extension decision is made under the
    /// exclusive class; non-extending writes downgrade to the writer class
    /// so disjoint writers proceed concurrently.
    pub fn write_at(&self, buf: &[u8], offset: u32) -> Result<usize> {
        self.rwx.excl_enter();
        let needs_extend =
            offset as u64 + buf.len() as u64 > self.inner.lock().disk.length as u64;
        if needs_extend {
            let res = self.write_at_excl(buf, offset);
            self.rwx.excl_exit();
            res
        } else {
            if self.inner.lock().deny_write_cnt > 0 {
                self.rwx.excl_exit();
                return Err(Error::Denied);
            }
            self.rwx.downgrade_to_write();
            let n = self.write_at_unlocked(buf, offset);
            self.rwx.write_exit();
            Ok(n)
        }
    }

    /// Write for callers already holding the exclusive class (directory
    /// mutation, the extending branch of `write_at`).
    pub(crate) fn write_at_excl(&self, buf: &[u8], offset: u32) -> Result<usize> {
        let end = offset as u64 + buf.len() as u64;
        if end > MAX_FILE_SIZE as u64 {
            return Err(Error::FileTooLarge);
        }
        let end = end as u32;
        if self.inner.lock().deny_write_cnt > 0 {
            return Err(Error::Denied);
        }
        if end > self.inner.lock().disk.length {
            self.extend_to(end)?;
            self.inner.lock().disk.length = end;
            self.update();
        }
        Ok(self.write_at_unlocked(buf, offset))
    }

    fn write_at_unlocked(&self, buf: &[u8], offset: u32) -> usize {
        let fs = self.fs();
        let mut offset = offset as usize;
        let mut written = 0;
        while written < buf.len() {
            let length = self.inner.lock().disk.length as usize;
            if offset >= length {
                break;
            }
            let sector = match self.byte_to_sector(offset as u32) {
                Some(s) => s,
                None => break,
            };
            let sector_ofs = offset % SECTOR_SIZE;
            let chunk = cmp::min(
                cmp::min(buf.len() - written, length - offset),
                SECTOR_SIZE - sector_ofs,
            );
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let src = (&buf[written..written + SECTOR_SIZE]).try_into().unwrap();
                fs.cache.write(sector, src);
            } else {
                let mut bounce = [0u8; SECTOR_SIZE];
                fs.cache.read(sector, &mut bounce);
                bounce[sector_ofs..sector_ofs + chunk]
                    .copy_from_slice(&buf[written..written + chunk]);
                fs.cache.write(sector, &bounce);
            }
            written += chunk;
            offset += chunk;
        }
        written
    }

    /// Grows the allocation tree to cover `new_len` bytes. On failure the
    /// pointer tree is committed as far as it got, so partially allocated
    /// sectors stay reachable from the inode; the length is untouched.
    fn extend_to(&self, new_len: u32) -> Result<()> {
        let fs = self.fs();
        let mut disk = self.inner.lock().disk;
        let sectors = bytes_to_sectors(new_len) - bytes_to_sectors(disk.length);
        let res = extend_file(&fs, &mut disk, sectors);
        if res.is_err() {
            warn!(
                "inode {}: extension to {} bytes failed, partial allocation kept",
                self.sector, new_len
            );
        }
        self.inner.lock().disk = disk;
        fs.cache.write_obj(self.sector, &disk);
        res
    }

    /// Copies the cached on-disk inode back to the cache. Must be called
    /// after every change to a field that lives on disk.
    pub(crate) fn update(&self) {
        let fs = self.fs();
        let disk = self.inner.lock().disk;
        fs.cache.write_obj(self.sector, &disk);
    }
}

/// Allocates data sectors for `sectors` more sectors of file content,
/// filling unallocated slots direct-first, then through the single- and
/// double-indirect sectors. Every newly allocated data sector is
/// zero-filled through the cache.
fn extend_file(fs: &FileSys, disk: &mut DiskInode, mut sectors: u32) -> Result<()> {
    if sectors == 0 {
        return Ok(());
    }
    for i in 0..NDIRECT {
        if sectors == 0 {
            return Ok(());
        }
        if disk.direct[i] == NO_SECTOR {
            let s = fs.freemap.allocate(1)?;
            fs.cache.zero(s);
            disk.direct[i] = s;
            sectors -= 1;
        }
    }
    if sectors == 0 {
        return Ok(());
    }

    if disk.indirect_lv1 == NO_SECTOR {
        disk.indirect_lv1 = create_indirect(fs)?;
    }
    extend_indirect(fs, disk.indirect_lv1, &mut sectors)?;
    if sectors == 0 {
        return Ok(());
    }

    if disk.indirect_lv2 == NO_SECTOR {
        disk.indirect_lv2 = create_indirect(fs)?;
    }
    let mut outer = IndirectBlock::empty();
    fs.cache.read_obj(disk.indirect_lv2, &mut outer);
    for i in 0..NINDIRECT {
        if sectors == 0 {
            break;
        }
        if outer.slots[i] == NO_SECTOR {
            match create_indirect(fs) {
                Ok(s) => outer.slots[i] = s,
                Err(e) => {
                    fs.cache.write_obj(disk.indirect_lv2, &outer);
                    return Err(e);
                }
            }
        }
        if let Err(e) = extend_indirect(fs, outer.slots[i], &mut sectors) {
            fs.cache.write_obj(disk.indirect_lv2, &outer);
            return Err(e);
        }
    }
    fs.cache.write_obj(disk.indirect_lv2, &outer);
    assert_eq!(sectors, 0, "file exceeds the inode addressing schema");
    Ok(())
}

/// Allocates an indirect sector initialized to all `NO_SECTOR`.
fn create_indirect(fs: &FileSys) -> Result<u32> {
    let sector = fs.freemap.allocate(1)?;
    fs.cache.write_obj(sector, &IndirectBlock::empty());
    Ok(sector)
}

/// Fills unallocated slots of one indirect sector with zeroed data sectors
/// until `sectors` hits zero or the sector is full. The indirect sector is
/// written back whether or not allocation ran dry.
fn extend_indirect(fs: &FileSys, sector: u32, sectors: &mut u32) -> Result<()> {
    let mut ind = IndirectBlock::empty();
    fs.cache.read_obj(sector, &mut ind);
    let mut res = Ok(());
    for slot in ind.slots.iter_mut() {
        if *sectors == 0 {
            break;
        }
        if *slot == NO_SECTOR {
            match fs.freemap.allocate(1) {
                Ok(s) => {
                    fs.cache.zero(s);
                    *slot = s;
                    *sectors -= 1;
                }
                Err(e) => {
                    res = Err(e);
                    break;
                }
            }
        }
    }
    fs.cache.write_obj(sector, &ind);
    res
}

fn indirect_lookup(fs: &FileSys, sector: u32, rel: usize) -> Option<u32> {
    let mut ind = IndirectBlock::empty();
    fs.cache.read_obj(sector, &mut ind);
    some_sector(ind.slots[rel / SECTOR_SIZE])
}

/// Shared-ownership handle to an open inode. Dropping the handle performs
/// the last-release check against the open-inode table.
pub struct InodeHandle(Arc<Inode>);

impl InodeHandle {
    /// Opens the same inode again, bumping the open count.
    pub fn reopen(&self) -> InodeHandle {
        let fs = self.0.fs();
        fs.itable.reopen(&self.0)
    }
}

impl Deref for InodeHandle {
    type Target = Inode;

    fn deref(&self) -> &Inode {
        &self.0
    }
}

impl Drop for InodeHandle {
    fn drop(&mut self) {
        // During file-system teardown the table is being dropped with us;
        // there is nothing left to update.
        if let Some(fs) = self.0.fs.upgrade() {
            fs.itable.close(&self.0, &fs);
        }
    }
}

/// Table of open inodes. Opening a sector twice yields the same in-memory
/// inode; the table lock is the authority for open-count transitions.
pub(crate) struct Itable {
    list: Spinlock<Vec<Arc<Inode>>>,
}

impl Itable {
    pub(crate) const fn new() -> Self {
        Self {
            list: Spinlock::new("itable", Vec::new()),
        }
    }

    pub(crate) fn open(&self, fs: &FileSys, sector: u32) -> InodeHandle {
        let mut list = self.list.lock();
        if let Some(ip) = list.iter().find(|ip| ip.sector == sector) {
            ip.inner.lock().open_cnt += 1;
            return InodeHandle(ip.clone());
        }

        let mut disk = DiskInode::zeroed();
        fs.cache.read_obj(sector, &mut disk);
        assert_eq!(disk.magic, INODE_MAGIC, "bad inode magic in sector {}", sector);

        let ip = Arc::new(Inode {
            sector,
            rwx: RwxLock::new(),
            inner: Spinlock::new(
                "inode",
                InodeInner {
                    open_cnt: 1,
                    removed: false,
                    deny_write_cnt: 0,
                    disk,
                },
            ),
            fs: fs.weak_self.clone(),
        });
        list.push(ip.clone());
        InodeHandle(ip)
    }

    fn reopen(&self, ip: &Arc<Inode>) -> InodeHandle {
        let _list = self.list.lock();
        ip.inner.lock().open_cnt += 1;
        InodeHandle(ip.clone())
    }

    fn close(&self, ip: &Arc<Inode>, fs: &FileSys) {
        let reclaim = {
            let mut list = self.list.lock();
            let mut inner = ip.inner.lock();
            inner.open_cnt -= 1;
            if inner.open_cnt == 0 {
                if let Some(pos) = list.iter().position(|x| Arc::ptr_eq(x, ip)) {
                    list.remove(pos);
                }
                inner.removed
            } else {
                false
            }
        };
        if reclaim {
            let disk = ip.inner.lock().disk;
            release_tree(fs, &disk);
            fs.freemap.release(ip.sector, 1);
        }
    }
}

/// Returns every sector in the inode's pointer tree to the free map.
fn release_tree(fs: &FileSys, disk: &DiskInode) {
    for &s in disk.direct.iter() {
        if s != NO_SECTOR {
            fs.freemap.release(s, 1);
        }
    }
    if disk.indirect_lv1 != NO_SECTOR {
        release_indirect(fs, disk.indirect_lv1);
    }
    if disk.indirect_lv2 != NO_SECTOR {
        let mut outer = IndirectBlock::empty();
        fs.cache.read_obj(disk.indirect_lv2, &mut outer);
        for &inner in outer.slots.iter() {
            if inner != NO_SECTOR {
                release_indirect(fs, inner);
            }
        }
        fs.freemap.release(disk.indirect_lv2, 1);
    }
}

fn release_indirect(fs: &FileSys, sector: u32) {
    let mut ind = IndirectBlock::empty();
    fs.cache.read_obj(sector, &mut ind);
    for &s in ind.slots.iter() {
        if s != NO_SECTOR {
            fs.freemap.release(s, 1);
        }
    }
    fs.freemap.release(sector, 1);
}

impl FileSys {
    /// Finds the inode backed by `sector` in the open-inode table or
    /// constructs it from its cached on-disk contents.
    pub fn inode_open(&self, sector: u32) -> InodeHandle {
        self.itable.open(self, sector)
    }

    /// Initializes an inode of `length` bytes in `sector` and allocates its
    /// data sectors, each zero-filled through the cache. Partial failure
    /// during extension leaves the allocated sectors in place and returns
    /// failure.
    pub(crate) fn inode_create(&self, sector: u32, length: u32, is_dir: bool) -> Result<()> {
        if length > MAX_FILE_SIZE {
            return Err(Error::FileTooLarge);
        }
        // Write a valid skeleton before opening so every observer of the
        // table entry sees a real inode.
        self.cache.write_obj(sector, &DiskInode::new(length, is_dir));

        let ip = self.inode_open(sector);
        ip.rwx.excl_enter();
        let res = {
            let mut disk = ip.inner.lock().disk;
            let res = extend_file(self, &mut disk, bytes_to_sectors(length));
            ip.inner.lock().disk = disk;
            self.cache.write_obj(sector, &disk);
            res
        };
        ip.rwx.excl_exit();
        res
    }

    /// Reparents the inode in `sector` under the writer class.
    pub(crate) fn inode_set_parent(&self, sector: u32, parent: u32) -> Result<()> {
        let ip = self.inode_open(sector);
        ip.rwx.write_enter();
        ip.inner.lock().disk.parent = parent;
        ip.update();
        ip.rwx.write_exit();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn disk_inode_layout_matches_the_wire_format() {
        let mut inode = DiskInode::new(0x11223344, true);
        inode.parent = 0x55667788;
        inode.direct[0] = 0xa1a2a3a4;
        inode.indirect_lv1 = 0xb1b2b3b4;
        inode.indirect_lv2 = 0xc1c2c3c4;

        let bytes = inode.as_bytes();
        assert_eq!(bytes.len(), SECTOR_SIZE);
        assert_eq!(bytes[0..4], 0x11223344u32.to_ne_bytes());
        assert_eq!(bytes[4], 1);
        assert_eq!(bytes[8..12], 0x55667788u32.to_ne_bytes());
        assert_eq!(bytes[12..16], 0xa1a2a3a4u32.to_ne_bytes());
        assert_eq!(bytes[60..64], 0xb1b2b3b4u32.to_ne_bytes());
        assert_eq!(bytes[64..68], 0xc1c2c3c4u32.to_ne_bytes());
        assert_eq!(bytes[68..72], INODE_MAGIC.to_ne_bytes());
    }

    #[test]
    fn fresh_inode_has_no_sectors() {
        let inode = DiskInode::new(0, false);
        assert!(inode.direct.iter().all(|&s| s == NO_SECTOR));
        assert_eq!(inode.indirect_lv1, NO_SECTOR);
        assert_eq!(inode.indirect_lv2, NO_SECTOR);
        assert_eq!(inode.parent, ROOT_SECTOR);
    }

    #[test]
    fn sector_math() {
        assert_eq!(bytes_to_sectors(0), 0);
        assert_eq!(bytes_to_sectors(1), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE as u32), 1);
        assert_eq!(bytes_to_sectors(SECTOR_SIZE as u32 + 1), 2);
    }
}
