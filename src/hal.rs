//! Hardware abstraction: the block-device contract.
//!
//! The rest of the crate is written against `BlockDevice`; the embedding
//! kernel supplies real drivers. Two device roles exist: one carries the
//! file system, the other carries the swap area. `MemDisk` is an in-memory
//! device used by the tests; it also keeps a log of written sector numbers
//! so tests can observe write-back ordering.

use alloc::sync::Arc;
use alloc::vec;
use alloc::vec::Vec;

use spin::Once;

use crate::lock::Spinlock;
use crate::param::SECTOR_SIZE;

/// A fixed-sector storage device. I/O is synchronous and infallible from
/// this layer's perspective; only the device driver itself may panic.
pub trait BlockDevice: Send + Sync {
    /// Device size in sectors.
    fn size(&self) -> u32;

    /// Reads sector `sector` into `buf`.
    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]);

    /// Writes `buf` to sector `sector`.
    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]);
}

/// One-shot registry of the two device roles.
pub struct DeviceRoles {
    filesys: Once<Arc<dyn BlockDevice>>,
    swap: Once<Arc<dyn BlockDevice>>,
}

impl DeviceRoles {
    pub const fn new() -> Self {
        Self {
            filesys: Once::new(),
            swap: Once::new(),
        }
    }

    pub fn register_filesys(&self, dev: Arc<dyn BlockDevice>) {
        let _ = self.filesys.call_once(|| dev);
    }

    pub fn register_swap(&self, dev: Arc<dyn BlockDevice>) {
        let _ = self.swap.call_once(|| dev);
    }

    pub fn filesys(&self) -> Arc<dyn BlockDevice> {
        self.filesys
            .get()
            .expect("no file system device registered")
            .clone()
    }

    pub fn swap(&self) -> Arc<dyn BlockDevice> {
        self.swap.get().expect("no swap device registered").clone()
    }
}

/// An in-memory block device.
pub struct MemDisk {
    sectors: Spinlock<Vec<[u8; SECTOR_SIZE]>>,
    write_log: Spinlock<Vec<u32>>,
}

impl MemDisk {
    /// Returns a zero-filled device of `size` sectors.
    pub fn new(size: u32) -> Self {
        Self {
            sectors: Spinlock::new("memdisk", vec![[0; SECTOR_SIZE]; size as usize]),
            write_log: Spinlock::new("memdisk log", Vec::new()),
        }
    }

    /// Number of sector writes the device has served.
    pub fn write_count(&self) -> usize {
        self.write_log.lock().len()
    }

    /// Sector numbers of all writes, in order.
    pub fn write_log(&self) -> Vec<u32> {
        self.write_log.lock().clone()
    }
}

impl BlockDevice for MemDisk {
    fn size(&self) -> u32 {
        self.sectors.lock().len() as u32
    }

    fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let sectors = self.sectors.lock();
        buf.copy_from_slice(&sectors[sector as usize]);
    }

    fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut sectors = self.sectors.lock();
        sectors[sector as usize].copy_from_slice(buf);
        self.write_log.lock().push(sector);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memdisk_round_trip() {
        let disk = MemDisk::new(8);
        let mut buf = [0u8; SECTOR_SIZE];
        buf[0] = 0xaa;
        buf[SECTOR_SIZE - 1] = 0x55;
        disk.write(3, &buf);

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(3, &mut out);
        assert_eq!(buf[..], out[..]);
        assert_eq!(disk.write_log(), vec![3]);
    }

    #[test]
    fn roles_resolve_once() {
        let roles = DeviceRoles::new();
        let disk: Arc<dyn BlockDevice> = Arc::new(MemDisk::new(4));
        roles.register_filesys(disk.clone());
        roles.register_filesys(Arc::new(MemDisk::new(2)));
        assert_eq!(roles.filesys().size(), 4);
    }
}
