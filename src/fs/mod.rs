//! File system implementation. Four layers:
//!   + Free map: persistent allocator for raw device sectors.
//!   + Inodes: sector addressing, growth, reading, writing, metadata.
//!   + Directories: inodes with special contents (lists of other inodes!)
//!   + Names: paths like /a/b/c for convenient naming.
//!
//! This file carries the consumer surface the system-call glue maps onto:
//! mounting, `create`, `open`, `remove`, `mkdir`, `chdir`. Every operation
//! resolves its path against an optional caller-held working directory.
//!
//! All sector traffic goes through the block cache; nothing in this module
//! touches the device directly.

use alloc::sync::{Arc, Weak};

use log::{debug, info};
use scopeguard::ScopeGuard;

use crate::bio::BlockCache;
use crate::error::{Error, Result};
use crate::hal::BlockDevice;
use crate::param::ROOT_SECTOR;

pub mod dir;
mod file;
mod freemap;
mod inode;
mod path;

pub use dir::{Dir, FileNameBuf};
pub use file::File;
pub use freemap::FreeMap;
pub use inode::{Inode, InodeHandle, INODE_MAGIC};
pub use path::split_path;

use inode::Itable;

/// Number of entries a fresh root directory is sized for.
const ROOT_DIR_ENTRIES: u32 = 16;

/// A mounted file system.
pub struct FileSys {
    pub(crate) cache: BlockCache,
    pub(crate) freemap: FreeMap,
    pub(crate) itable: Itable,
    /// Handed to every in-memory inode so handles can reach the cache and
    /// free map from their destructor.
    pub(crate) weak_self: Weak<FileSys>,
}

impl FileSys {
    /// Mounts the file system on `device`, formatting it first when
    /// `format` is set.
    pub fn new(device: Arc<dyn BlockDevice>, format: bool) -> Result<Arc<FileSys>> {
        let size = device.size();
        let fs = Arc::new_cyclic(|weak| FileSys {
            cache: BlockCache::new(device.clone()),
            freemap: FreeMap::new(size),
            itable: Itable::new(),
            weak_self: weak.clone(),
        });
        if format {
            fs.format()?;
        }
        fs.freemap.open(&fs)?;
        info!("file system mounted, {} sectors", device.size());
        Ok(fs)
    }

    /// Formats the device: a fresh free map persisted at sector 0 and an
    /// empty root directory at sector 1.
    fn format(&self) -> Result<()> {
        debug!("formatting file system");
        self.freemap.create(self)?;
        self.dir_create(ROOT_SECTOR, ROOT_DIR_ENTRIES)?;
        self.freemap.close()?;
        Ok(())
    }

    /// Shuts the file system down, writing the free map and every dirty
    /// cache block back to the device.
    pub fn close(&self) -> Result<()> {
        self.freemap.close()?;
        self.cache.close();
        Ok(())
    }

    /// Creates a file (or directory) of `size` bytes at `path`.
    ///
    /// The parent directory's exclusive class is held around the whole
    /// allocate/initialize/link sequence, so a racing create of the same
    /// name observes either nothing or the finished entry.
    pub fn create(
        &self,
        path: &str,
        size: u32,
        is_dir: bool,
        cwd: Option<&Dir>,
    ) -> Result<()> {
        let (parent, leaf) = split_path(path).ok_or(Error::Invalid)?;
        if leaf == "." || leaf == ".." {
            return Err(Error::Invalid);
        }
        let dir = self.parse_to_dir(parent, cwd).ok_or(Error::NotFound)?;
        if dir.lookup(leaf).is_some() {
            return Err(Error::Exists);
        }

        dir.inode().rwx.excl_enter();
        let res = self.create_locked(&dir, leaf, size, is_dir);
        dir.inode().rwx.excl_exit();
        res
    }

    fn create_locked(&self, dir: &Dir, leaf: &str, size: u32, is_dir: bool) -> Result<()> {
        let sector = self.freemap.allocate(1)?;
        let sector = scopeguard::guard(sector, |sector| {
            self.freemap.release(sector, 1);
        });
        self.inode_create(*sector, size, is_dir)?;
        dir.add(leaf, *sector)?;
        let _ = ScopeGuard::into_inner(sector);
        Ok(())
    }

    /// Opens the file or directory at `path`.
    pub fn open(&self, path: &str, cwd: Option<&Dir>) -> Result<File> {
        if path == "/" {
            return Ok(File::new(self.inode_open(ROOT_SECTOR)));
        }
        let (parent, leaf) = split_path(path).ok_or(Error::NotFound)?;
        let dir = self.parse_to_dir(parent, cwd).ok_or(Error::NotFound)?;
        let inode = match leaf {
            "." => dir.inode().reopen(),
            ".." => self.inode_open(dir.inode().parent()),
            name => dir.lookup(name).ok_or(Error::NotFound)?,
        };
        Ok(File::new(inode))
    }

    /// Deletes the file or directory named by `path`. A directory must be
    /// empty and not open elsewhere. An open file survives removal until
    /// its last close; its name is gone immediately.
    pub fn remove(&self, path: &str, cwd: Option<&Dir>) -> Result<()> {
        if path == "/" {
            return Err(Error::Busy);
        }
        let (parent, leaf) = split_path(path).ok_or(Error::NotFound)?;
        let dir = self.parse_to_dir(parent, cwd).ok_or(Error::NotFound)?;
        dir.remove(leaf)
    }

    /// `create` with directory semantics and no initial entries.
    pub fn mkdir(&self, path: &str, cwd: Option<&Dir>) -> Result<()> {
        self.create(path, 0, true, cwd)
    }

    /// Resolves `path` to a directory for use as the caller's new working
    /// directory.
    pub fn chdir(&self, path: &str, cwd: Option<&Dir>) -> Result<Dir> {
        self.parse_to_dir(path, cwd).ok_or(Error::NotFound)
    }

    /// Whether `sector` is currently allocated in the free map.
    pub fn sector_allocated(&self, sector: u32) -> bool {
        self.freemap.test(sector)
    }

    /// One pass of the write-behind daemon. The embedder's timer glue calls
    /// this every `WRITE_BEHIND_INTERVAL` ticks.
    pub fn flush_tick(&self) {
        self.cache.write_behind_tick();
    }
}
