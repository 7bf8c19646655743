//! Block cache.
//!
//! The cache is a fixed pool of sector-sized buffers holding cached copies
//! of device sector contents. Caching sectors in memory reduces the number
//! of device reads and also provides a synchronization point for sectors
//! used by multiple threads.
//!
//! Interface:
//! * `read` / `write` copy a whole sector between the cache and the
//!   caller's buffer; the sector is resident afterwards.
//! * `zero` fills a sector with zeros in the cache.
//! * `close` flushes every dirty block to the device.
//!
//! All writes are write-back: `write` and `zero` only mark the block dirty.
//! Dirty blocks reach the device when they are evicted, when the
//! write-behind daemon runs `write_behind_tick`, or at `close`. Replacement
//! is second chance over the pool, driven by a persistent clock hand.

use alloc::sync::Arc;

use array_macro::array;
use log::trace;
use zerocopy::{AsBytes, FromBytes};

use crate::hal::BlockDevice;
use crate::lock::Spinlock;
use crate::param::{CACHE_SIZE, NO_SECTOR, SECTOR_SIZE};

struct CacheBlock {
    /// Resident sector number, or `NO_SECTOR`.
    sector: u32,

    /// Modified relative to the device?
    dirty: bool,

    /// Read or written since the clock hand last cleared the flag?
    accessed: bool,

    /// Free slot?
    free: bool,

    data: [u8; SECTOR_SIZE],
}

impl CacheBlock {
    fn new() -> Self {
        Self {
            sector: NO_SECTOR,
            dirty: false,
            accessed: false,
            free: true,
            data: [0; SECTOR_SIZE],
        }
    }
}

struct CachePool {
    blocks: [CacheBlock; CACHE_SIZE],
    hand: usize,
}

impl CachePool {
    /// Index of the block holding `sector`, if resident.
    fn find(&self, sector: u32) -> Option<usize> {
        self.blocks
            .iter()
            .position(|b| !b.free && b.sector == sector)
    }
}

/// Write-back cache over the file system device.
pub struct BlockCache {
    dev: Arc<dyn BlockDevice>,
    pool: Spinlock<CachePool>,
}

impl BlockCache {
    pub fn new(dev: Arc<dyn BlockDevice>) -> Self {
        Self {
            dev,
            pool: Spinlock::new(
                "bcache",
                CachePool {
                    blocks: array![_ => CacheBlock::new(); CACHE_SIZE],
                    hand: 0,
                },
            ),
        }
    }

    /// Evicts a block, second-chance algorithm. Called with the pool lock
    /// held; the returned block has been written back if it was dirty. The
    /// victim's `accessed` flag is left for the caller, which immediately
    /// refills the block.
    fn evict(&self, pool: &mut CachePool) -> usize {
        let victim = loop {
            let hand = pool.hand;
            if !pool.blocks[hand].accessed {
                break hand;
            }
            pool.blocks[hand].accessed = false;
            pool.hand = (hand + 1) % CACHE_SIZE;
        };

        let block = &mut pool.blocks[victim];
        if block.dirty {
            trace!("bcache: evicting dirty sector {}", block.sector);
            self.dev.write(block.sector, &block.data);
            block.dirty = false;
        }
        victim
    }

    /// Returns a free block or evicts one. Called with the pool lock held.
    fn alloc(&self, pool: &mut CachePool) -> usize {
        match pool.blocks.iter().position(|b| b.free) {
            Some(i) => i,
            None => self.evict(pool),
        }
    }

    /// Makes `sector` resident and returns its block index. On a miss the
    /// sector is read from the device first, so partial overwrites preserve
    /// the bytes outside the written region.
    fn ensure_resident(&self, pool: &mut CachePool, sector: u32) -> usize {
        match pool.find(sector) {
            Some(i) => i,
            None => {
                let i = self.alloc(pool);
                let block = &mut pool.blocks[i];
                self.dev.read(sector, &mut block.data);
                block.sector = sector;
                block.free = false;
                block.dirty = false;
                i
            }
        }
    }

    /// Reads sector `sector` into `buf`.
    pub fn read(&self, sector: u32, buf: &mut [u8; SECTOR_SIZE]) {
        let mut pool = self.pool.lock();
        let i = self.ensure_resident(&mut *pool, sector);
        let block = &mut pool.blocks[i];
        buf.copy_from_slice(&block.data);
        block.accessed = true;
    }

    /// Writes `buf` to sector `sector` in the cache and marks it dirty.
    pub fn write(&self, sector: u32, buf: &[u8; SECTOR_SIZE]) {
        let mut pool = self.pool.lock();
        let i = self.ensure_resident(&mut *pool, sector);
        let block = &mut pool.blocks[i];
        block.data.copy_from_slice(buf);
        block.dirty = true;
        block.accessed = true;
    }

    /// Fills sector `sector` with zeros in the cache and marks it dirty.
    pub fn zero(&self, sector: u32) {
        let mut pool = self.pool.lock();
        let i = self.ensure_resident(&mut *pool, sector);
        let block = &mut pool.blocks[i];
        block.data.fill(0);
        block.dirty = true;
        block.accessed = true;
    }

    /// Reads the leading bytes of sector `sector` into `obj`.
    pub fn read_obj<T: AsBytes + FromBytes>(&self, sector: u32, obj: &mut T) {
        let mut pool = self.pool.lock();
        let i = self.ensure_resident(&mut *pool, sector);
        let block = &mut pool.blocks[i];
        let bytes = obj.as_bytes_mut();
        bytes.copy_from_slice(&block.data[..bytes.len()]);
        block.accessed = true;
    }

    /// Writes `obj` over the leading bytes of sector `sector`.
    pub fn write_obj<T: AsBytes>(&self, sector: u32, obj: &T) {
        let mut pool = self.pool.lock();
        let i = self.ensure_resident(&mut *pool, sector);
        let block = &mut pool.blocks[i];
        let bytes = obj.as_bytes();
        block.data[..bytes.len()].copy_from_slice(bytes);
        block.dirty = true;
        block.accessed = true;
    }

    /// One pass of the write-behind daemon: flushes every dirty resident
    /// block, taking the pool lock once per block. The daemon itself is
    /// timer glue owned by the embedder and wakes every
    /// `WRITE_BEHIND_INTERVAL` ticks.
    pub fn write_behind_tick(&self) {
        for i in 0..CACHE_SIZE {
            let mut pool = self.pool.lock();
            let block = &mut pool.blocks[i];
            if block.dirty && !block.free {
                self.dev.write(block.sector, &block.data);
                block.dirty = false;
            }
        }
    }

    /// Flushes every dirty block to the device. Called when the file system
    /// shuts down.
    pub fn close(&self) {
        let mut pool = self.pool.lock();
        for block in pool.blocks.iter_mut() {
            if block.dirty && !block.free {
                self.dev.write(block.sector, &block.data);
                block.dirty = false;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hal::MemDisk;
    use std::sync::Arc;

    fn sector_of(byte: u8) -> [u8; SECTOR_SIZE] {
        [byte; SECTOR_SIZE]
    }

    #[test]
    fn write_is_deferred_until_close() {
        let disk = Arc::new(MemDisk::new(128));
        let cache = BlockCache::new(disk.clone());

        cache.write(7, &sector_of(0xab));
        assert_eq!(disk.write_count(), 0);

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(7, &mut buf);
        assert_eq!(buf, sector_of(0xab));

        cache.close();
        assert_eq!(disk.write_log(), vec![7]);

        let mut raw = [0u8; SECTOR_SIZE];
        disk.read(7, &mut raw);
        assert_eq!(raw, sector_of(0xab));
    }

    #[test]
    fn sixty_fifth_sector_evicts_a_dirty_block() {
        let disk = Arc::new(MemDisk::new(128));
        let cache = BlockCache::new(disk.clone());

        for s in 0..(CACHE_SIZE as u32 + 1) {
            cache.write(s, &sector_of(s as u8));
        }

        // The pool holds 64 blocks, so the 65th write must have evicted the
        // block for sector 0, and the dirty contents must have reached the
        // device before replacement.
        assert_eq!(disk.write_log(), vec![0]);

        let mut buf = [0u8; SECTOR_SIZE];
        for s in 0..(CACHE_SIZE as u32 + 1) {
            cache.read(s, &mut buf);
            assert_eq!(buf, sector_of(s as u8), "sector {}", s);
        }
    }

    #[test]
    fn zero_clears_and_dirties() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BlockCache::new(disk.clone());

        cache.write(2, &sector_of(0xff));
        cache.zero(2);

        let mut buf = [0xaau8; SECTOR_SIZE];
        cache.read(2, &mut buf);
        assert_eq!(buf, sector_of(0));

        cache.close();
        let mut raw = [0xaau8; SECTOR_SIZE];
        disk.read(2, &mut raw);
        assert_eq!(raw, sector_of(0));
    }

    #[test]
    fn write_behind_flushes_and_clears_dirty() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BlockCache::new(disk.clone());

        cache.write(1, &sector_of(1));
        cache.write(2, &sector_of(2));
        cache.write_behind_tick();
        assert_eq!(disk.write_count(), 2);

        // Nothing is dirty any more, so another pass writes nothing.
        cache.write_behind_tick();
        assert_eq!(disk.write_count(), 2);
    }

    #[test]
    fn partial_object_write_preserves_rest_of_sector() {
        let disk = Arc::new(MemDisk::new(16));
        let cache = BlockCache::new(disk.clone());

        cache.write(5, &sector_of(0x77));
        cache.close();

        // Re-create the cache so sector 5 is no longer resident, then
        // overwrite only its first four bytes.
        let cache = BlockCache::new(disk.clone());
        cache.write_obj(5, &0xdead_beefu32);

        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(5, &mut buf);
        assert_eq!(buf[..4], 0xdead_beefu32.to_ne_bytes());
        assert!(buf[4..].iter().all(|&b| b == 0x77));
    }
}
