//! A write-back sector buffer cache, an inode layer with a three-level
//! block map, and a path-walking name-space façade, for a teaching-grade
//! Unix-like file system over a fixed-size sector block device.
//!
//! # Lock ordering
//!
//! Every lock this crate takes is ordered top-to-bottom; code that needs
//! two at once always acquires them in this order, never the reverse:
//!
//! 1. open-inode table lock (`InodeLayer`'s internal `table` mutex)
//! 2. an inode's own `meta` lock
//! 3. an inode's `size_lock`
//! 4. the buffer cache's LRU list lock
//! 5. a single cache entry's counters lock
//! 6. device I/O (no lock held across it)
//!
//! A directory's `dir_lock` is orthogonal to this chain: it serializes
//! concurrent mutation of one directory's contents and is held only across
//! that directory's own `read_at`/`write_at` calls, never nested with the
//! locks above.

pub mod alloc;
pub mod cache;
pub mod device;
pub mod dir;
pub mod disk_layout;
pub mod error;
pub mod fs;
pub mod inode;
pub mod param;
pub mod path;

pub use alloc::{BitmapAllocator, SectorAllocator};
pub use cache::BufferCache;
pub use device::{BlockDevice, MemDevice, Sector, SectorId};
pub use dir::DirEntry;
pub use disk_layout::MAX_FILE_SIZE;
pub use error::{FsError, FsResult};
pub use fs::FileSystem;
pub use inode::RcInode;
pub use path::{FileName, Path};
