//! Directories.
//!
//! A directory is an inode flagged `is_dir` whose bytes are an array of
//! fixed-size entries; free entries have `in_use` clear. `..` does not get
//! an entry: each inode stores its parent's sector instead. Lookups and
//! `readdir` scan under the directory inode's reader class; `add` and
//! `remove` mutate under its exclusive class.
//!
//! Path resolution walks the component chain holding at most two reader
//! classes at a time, releasing the previous directory's hold before the
//! next child's is taken further down the path.

use core::mem;

use arrayvec::ArrayVec;
use static_assertions::const_assert;
use zerocopy::{AsBytes, FromBytes};

use crate::error::{Error, Result};
use crate::fs::inode::InodeHandle;
use crate::fs::path::components;
use crate::fs::FileSys;
use crate::param::{NAME_MAX, ROOT_SECTOR};

/// Size of one on-disk directory entry.
pub(crate) const DIRENT_SIZE: usize = mem::size_of::<Dirent>();

/// Buffer large enough for any entry name.
pub type FileNameBuf = ArrayVec<u8, { NAME_MAX + 1 }>;

/// A single directory entry.
#[repr(C)]
#[derive(Clone, Copy, AsBytes, FromBytes)]
pub(crate) struct Dirent {
    /// Sector of the named inode.
    inode_sector: u32,
    /// NUL-padded name.
    name: [u8; NAME_MAX + 1],
    /// In use or free?
    in_use: u8,
    _pad: [u8; 4],
}

const_assert!(DIRENT_SIZE == 24);

impl Dirent {
    fn empty() -> Self {
        Self {
            inode_sector: 0,
            name: [0; NAME_MAX + 1],
            in_use: 0,
            _pad: [0; 4],
        }
    }

    fn new(name: &str, inode_sector: u32) -> Self {
        debug_assert!(!name.is_empty() && name.len() <= NAME_MAX);
        let mut e = Self::empty();
        e.inode_sector = inode_sector;
        e.name[..name.len()].copy_from_slice(name.as_bytes());
        e.in_use = 1;
        e
    }

    fn is_in_use(&self) -> bool {
        self.in_use != 0
    }

    /// Name bytes up to the first NUL.
    fn name_bytes(&self) -> &[u8] {
        let len = self
            .name
            .iter()
            .position(|&b| b == 0)
            .unwrap_or(self.name.len());
        &self.name[..len]
    }
}

/// An open directory: an owned inode handle plus a read cursor for
/// `readdir`.
pub struct Dir {
    pub(crate) inode: InodeHandle,
    pos: u32,
}

impl Dir {
    /// Takes ownership of `inode`, which must be a directory.
    pub fn open(inode: InodeHandle) -> Result<Dir> {
        Self::open_at(inode, 0)
    }

    pub(crate) fn open_at(inode: InodeHandle, pos: u32) -> Result<Dir> {
        if !inode.is_dir() {
            return Err(Error::NotDir);
        }
        Ok(Dir { inode, pos })
    }

    /// Opens a new directory handle for the same inode.
    pub fn reopen(&self) -> Dir {
        Dir {
            inode: self.inode.reopen(),
            pos: 0,
        }
    }

    pub fn inode(&self) -> &InodeHandle {
        &self.inode
    }

    pub(crate) fn pos(&self) -> u32 {
        self.pos
    }

    /// Scans for an entry by exact name. The caller must hold an access
    /// class on the directory inode.
    fn find_entry(&self, name: &str) -> Option<(Dirent, u32)> {
        let mut ofs = 0;
        loop {
            let mut e = Dirent::empty();
            if self.inode.read_at_unlocked(e.as_bytes_mut(), ofs) != DIRENT_SIZE {
                return None;
            }
            if e.is_in_use() && e.name_bytes() == name.as_bytes() {
                return Some((e, ofs));
            }
            ofs += DIRENT_SIZE as u32;
        }
    }

    /// Looks `name` up and opens the named inode.
    pub fn lookup(&self, name: &str) -> Option<InodeHandle> {
        let fs = self.inode.fs();
        self.inode.rwx.read_enter();
        let found = self.find_entry(name).map(|(e, _)| fs.inode_open(e.inode_sector));
        self.inode.rwx.read_exit();
        found
    }

    /// Adds an entry for `name` backed by `child_sector`, reparenting the
    /// child. The caller holds the directory inode's exclusive class.
    pub(crate) fn add(&self, name: &str, child_sector: u32) -> Result<()> {
        if name.is_empty() || name.len() > NAME_MAX || name.contains('/') {
            return Err(Error::Invalid);
        }
        if self.find_entry(name).is_some() {
            return Err(Error::Exists);
        }

        let fs = self.inode.fs();
        fs.inode_set_parent(child_sector, self.inode.inumber())?;

        // First free slot, or end of file; writing at end of file may
        // extend the directory. A short read only happens at end of file.
        let mut ofs = 0;
        loop {
            let mut e = Dirent::empty();
            if self.inode.read_at_unlocked(e.as_bytes_mut(), ofs) != DIRENT_SIZE {
                break;
            }
            if !e.is_in_use() {
                break;
            }
            ofs += DIRENT_SIZE as u32;
        }

        let e = Dirent::new(name, child_sector);
        if self.inode.write_at_excl(e.as_bytes(), ofs)? != DIRENT_SIZE {
            return Err(Error::NoSpace);
        }
        Ok(())
    }

    /// Removes the entry for `name`. A directory target must be empty and
    /// not open elsewhere; its sectors are reclaimed at last close.
    pub fn remove(&self, name: &str) -> Result<()> {
        let fs = self.inode.fs();
        self.inode.rwx.excl_enter();
        let res = self.remove_locked(&fs, name);
        self.inode.rwx.excl_exit();
        res
    }

    fn remove_locked(&self, fs: &FileSys, name: &str) -> Result<()> {
        let (mut e, ofs) = self.find_entry(name).ok_or(Error::NotFound)?;
        let target = fs.inode_open(e.inode_sector);
        if target.is_dir() {
            if !is_empty(&target) {
                return Err(Error::NotEmpty);
            }
            // We are one of the openers ourselves.
            if target.open_cnt() > 1 {
                return Err(Error::Busy);
            }
        }

        e.in_use = 0;
        if self.inode.write_at_excl(e.as_bytes(), ofs)? != DIRENT_SIZE {
            return Err(Error::NoSpace);
        }
        target.remove_mark();
        Ok(())
    }

    /// Returns the next in-use entry name and advances the cursor.
    pub fn readdir(&mut self) -> Option<FileNameBuf> {
        self.inode.rwx.read_enter();
        let mut out = None;
        loop {
            let mut e = Dirent::empty();
            if self.inode.read_at_unlocked(e.as_bytes_mut(), self.pos) != DIRENT_SIZE {
                break;
            }
            self.pos += DIRENT_SIZE as u32;
            if e.is_in_use() {
                let mut name = FileNameBuf::new();
                name.try_extend_from_slice(e.name_bytes()).unwrap();
                out = Some(name);
                break;
            }
        }
        self.inode.rwx.read_exit();
        out
    }
}

/// Whether the directory behind `inode` has no in-use entry.
pub(crate) fn is_empty(inode: &InodeHandle) -> bool {
    inode.rwx.read_enter();
    let mut empty = true;
    let mut ofs = 0;
    loop {
        let mut e = Dirent::empty();
        if inode.read_at_unlocked(e.as_bytes_mut(), ofs) != DIRENT_SIZE {
            break;
        }
        if e.is_in_use() {
            empty = false;
            break;
        }
        ofs += DIRENT_SIZE as u32;
    }
    inode.rwx.read_exit();
    empty
}

impl FileSys {
    /// Creates a directory inode in `sector` with room for `entries`
    /// entries.
    pub(crate) fn dir_create(&self, sector: u32, entries: u32) -> Result<()> {
        self.inode_create(sector, entries * DIRENT_SIZE as u32, true)
    }

    /// Opens the root directory.
    pub fn open_root(&self) -> Dir {
        Dir::open(self.inode_open(ROOT_SECTOR)).expect("root is not a directory")
    }

    /// Opens the parent directory of `dir`.
    pub(crate) fn open_parent(&self, dir: &Dir) -> Result<Dir> {
        dir.inode.rwx.read_enter();
        let parent = dir.inode.parent();
        dir.inode.rwx.read_exit();
        Dir::open(self.inode_open(parent))
    }

    /// Resolves `path` to an owned directory handle, or `None` when any
    /// component is missing or not a directory.
    ///
    /// The empty path yields the current working directory. Paths starting
    /// with `/`, or any path when no working directory is set, resolve from
    /// the root. `.` is a no-op and `..` follows the stored parent sector.
    /// While descending, the current and immediately preceding directory
    /// inodes are held under the reader class so neither can be removed
    /// out from under the walk.
    pub fn parse_to_dir(&self, path: &str, cwd: Option<&Dir>) -> Option<Dir> {
        let mut cur = if path.starts_with('/') || cwd.is_none() {
            self.open_root()
        } else {
            cwd.unwrap().reopen()
        };
        cur.inode.rwx.read_enter();
        let mut prev: Option<Dir> = None;

        for comp in components(path) {
            match comp {
                "." => {}
                ".." => {
                    let next = match self.open_parent(&cur) {
                        Ok(d) => d,
                        Err(_) => {
                            release_walk(cur, prev);
                            return None;
                        }
                    };
                    if let Some(p) = prev.take() {
                        p.inode.rwx.read_exit();
                    }
                    cur.inode.rwx.read_exit();
                    cur = next;
                    cur.inode.rwx.read_enter();
                }
                name => {
                    let child = match cur.find_entry(name) {
                        Some((e, _)) => self.inode_open(e.inode_sector),
                        None => {
                            release_walk(cur, prev);
                            return None;
                        }
                    };
                    if !child.is_dir() {
                        release_walk(cur, prev);
                        return None;
                    }
                    // At most two reader holds at any moment: let go of the
                    // grandparent before taking the child.
                    if let Some(p) = prev.take() {
                        p.inode.rwx.read_exit();
                    }
                    child.rwx.read_enter();
                    prev = Some(cur);
                    cur = Dir {
                        inode: child,
                        pos: 0,
                    };
                }
            }
        }

        if let Some(p) = prev.take() {
            p.inode.rwx.read_exit();
        }
        cur.inode.rwx.read_exit();
        Some(cur)
    }
}

fn release_walk(cur: Dir, prev: Option<Dir>) {
    if let Some(p) = prev {
        p.inode.rwx.read_exit();
    }
    cur.inode.rwx.read_exit();
}
