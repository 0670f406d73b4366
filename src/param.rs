//! Tunable constants for the storage core.
//!
//! Collected in one place the way the teaching kernel this crate is
//! descended from collects its own knobs in `param.rs`.

/// Size in bytes of one sector on the backing block device.
pub const SECTOR_SIZE: usize = 512;

/// Upper bound on the number of resident buffer-cache entries.
pub const MAX_CACHE_ENTRIES: usize = 64;

/// Reserved sector holding the free-map.
pub const FREE_MAP_SECTOR: u32 = 0;

/// Reserved sector holding the root directory's inode.
pub const ROOT_DIR_SECTOR: u32 = 1;

/// Maximum length in bytes of a single path component.
pub const NAME_MAX: usize = 14;

/// Direct block pointers held by an on-disk inode.
pub const DIRECT_COUNT: usize = 50;

/// Single-indirect block pointers held by an on-disk inode.
pub const SINGLE_INDIRECT_COUNT: usize = 74;

/// Double-indirect block pointers held by an on-disk inode (always 1).
pub const DOUBLE_INDIRECT_COUNT: usize = 1;

/// Pointers held by one indirect block.
pub const POINTERS_PER_INDIRECT: usize = 126;

/// Magic value stamped into every on-disk inode ("INOD" in ASCII).
pub const INODE_MAGIC: u32 = 0x494E_4F44;
