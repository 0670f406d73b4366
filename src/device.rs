//! Block-device contract consumed by the buffer cache.
//!
//! The real disk, a virtio queue, or anything else that can hand back fixed
//! `SECTOR_SIZE` sectors is a candidate implementor. `MemDevice` below is
//! the in-memory stand-in used throughout this crate's own test suite.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::param::SECTOR_SIZE;

pub type Sector = [u8; SECTOR_SIZE];

/// A fixed-width sector address. `SectorId(0)` and `SectorId(1)` are
/// reserved for the free-map and the root directory inode respectively.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SectorId(pub u32);

impl SectorId {
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }
}

impl From<u32> for SectorId {
    fn from(raw: u32) -> Self {
        Self(raw)
    }
}

/// Opaque handle to the storage medium. Exposes read/write-by-sector plus
/// monotonic counters that the file system forwards verbatim.
pub trait BlockDevice: Send + Sync {
    /// Total number of addressable sectors.
    fn sector_count(&self) -> u64;

    /// Reads `sector_id` into `out`. Fails only on a genuine I/O error; an
    /// out-of-range id is rejected by the caller before this is invoked.
    fn read(&self, sector_id: SectorId, out: &mut Sector) -> std::io::Result<()>;

    /// Writes `data` to `sector_id`.
    fn write(&self, sector_id: SectorId, data: &Sector) -> std::io::Result<()>;

    /// Number of `read` calls observed so far.
    fn reads(&self) -> u64;

    /// Number of `write` calls observed so far.
    fn writes(&self) -> u64;
}

/// An in-memory block device, useful for tests and as a reference
/// implementation of the `BlockDevice` contract.
pub struct MemDevice {
    sectors: Mutex<Vec<Sector>>,
    reads: AtomicU64,
    writes: AtomicU64,
}

impl MemDevice {
    pub fn new(sector_count: usize) -> Self {
        Self {
            sectors: Mutex::new(vec![[0u8; SECTOR_SIZE]; sector_count]),
            reads: AtomicU64::new(0),
            writes: AtomicU64::new(0),
        }
    }
}

impl BlockDevice for MemDevice {
    fn sector_count(&self) -> u64 {
        self.sectors.lock().unwrap().len() as u64
    }

    fn read(&self, sector_id: SectorId, out: &mut Sector) -> std::io::Result<()> {
        let sectors = self.sectors.lock().unwrap();
        let idx = sector_id.raw() as usize;
        let sector = sectors.get(idx).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "sector out of range")
        })?;
        out.copy_from_slice(sector);
        self.reads.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn write(&self, sector_id: SectorId, data: &Sector) -> std::io::Result<()> {
        let mut sectors = self.sectors.lock().unwrap();
        let idx = sector_id.raw() as usize;
        let sector = sectors.get_mut(idx).ok_or_else(|| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, "sector out of range")
        })?;
        sector.copy_from_slice(data);
        self.writes.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }

    fn reads(&self) -> u64 {
        self.reads.load(Ordering::Relaxed)
    }

    fn writes(&self) -> u64 {
        self.writes.load(Ordering::Relaxed)
    }
}
