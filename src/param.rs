//! Design constants shared by the storage and virtual-memory subsystems.

/// Size of a device sector in bytes.
pub const SECTOR_SIZE: usize = 512;

/// Sentinel sector number meaning "no sector".
pub const NO_SECTOR: u32 = 0xffff_ffff;

/// Size of the block cache pool.
pub const CACHE_SIZE: usize = 64;

/// Ticks between wakeups of the cache write-behind daemon.
pub const WRITE_BEHIND_INTERVAL: u64 = 1000;

/// Sector holding the free-map file inode.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Sector holding the root directory inode.
pub const ROOT_SECTOR: u32 = 1;

/// Direct sector pointers per inode.
pub const NDIRECT: usize = 12;

/// Sector pointers per indirect sector.
pub const NINDIRECT: usize = SECTOR_SIZE / 4;

/// Largest number of data sectors a single inode can address.
pub const MAXFILE_SECTORS: usize = NDIRECT + NINDIRECT + NINDIRECT * NINDIRECT;

/// Largest file size in bytes.
pub const MAX_FILE_SIZE: u32 = (MAXFILE_SECTORS * SECTOR_SIZE) as u32;

/// Maximum length of a file name component.
pub const NAME_MAX: usize = 14;

/// Size of a user page in bytes.
pub const PGSIZE: usize = 4096;

/// Device sectors per user page.
pub const SECTORS_PER_PAGE: usize = PGSIZE / SECTOR_SIZE;

/// Top of the user address range; the user stack grows down from here.
pub const USER_TOP: usize = 0xc000_0000;

/// Maximum size of a user stack.
pub const MAX_STACK_SIZE: usize = 1 << 22;

/// Largest number of page slots the swap device may expose.
pub const NSWAP_MAX: usize = 1024;
