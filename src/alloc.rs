//! Free-space allocator.
//!
//! `spec.md` treats the free-map allocator as an out-of-scope external
//! collaborator, reachable only through `allocate(n) -> sector | fail` and
//! `release(sector, n)`. This module supplies the default instance the rest
//! of the crate needs to actually create or grow a file: a bitmap, one bit
//! per device sector, itself stored in sectors reached through the same
//! buffer cache everything else goes through (metadata is cached like
//! data). The bitmap's own sectors are reserved up front at format time, the
//! same way the root directory's sector is reserved — so the allocator
//! never has to allocate storage for itself after that.

use std::sync::{Arc, Mutex};

use log::warn;

use crate::cache::BufferCache;
use crate::device::{BlockDevice, Sector, SectorId};
use crate::error::{FsError, FsResult};
use crate::param::{DIRECT_COUNT, FREE_MAP_SECTOR, ROOT_DIR_SECTOR, SECTOR_SIZE};

const BITS_PER_SECTOR: u64 = (SECTOR_SIZE * 8) as u64;

/// Contract consumed by the inode layer to obtain and release storage.
pub trait SectorAllocator: Send + Sync {
    /// Allocates one sector, or fails if none remain.
    fn allocate(&self) -> FsResult<SectorId>;

    /// Releases a previously allocated sector back to the pool.
    fn release(&self, sector: SectorId);
}

fn bit_location(bit: u64) -> (usize, usize) {
    ((bit / BITS_PER_SECTOR) as usize, (bit % BITS_PER_SECTOR) as usize)
}

fn get_bit(sector: &Sector, offset: usize) -> bool {
    sector[offset / 8] & (1 << (offset % 8)) != 0
}

fn set_bit(sector: &mut Sector, offset: usize, value: bool) {
    if value {
        sector[offset / 8] |= 1 << (offset % 8);
    } else {
        sector[offset / 8] &= !(1 << (offset % 8));
    }
}

fn bitmap_sector_count(total_sectors: u64) -> usize {
    ((total_sectors + BITS_PER_SECTOR - 1) / BITS_PER_SECTOR) as usize
}

/// A bitmap-backed allocator, one bit per device sector.
pub struct BitmapAllocator<D> {
    cache: Arc<BufferCache<D>>,
    bitmap_sectors: Vec<SectorId>,
    total_sectors: u64,
    scan_lock: Mutex<()>,
}

impl<D: BlockDevice> BitmapAllocator<D> {
    /// Formats a fresh free-map: reserves the sectors needed for the bitmap
    /// itself (immediately after the reserved root sector), marks sector 0
    /// (free-map), sector 1 (root directory), and the bitmap's own sectors
    /// as used, and persists everything.
    pub fn format(cache: Arc<BufferCache<D>>, total_sectors: u64) -> FsResult<Self> {
        let count = bitmap_sector_count(total_sectors);
        if count > DIRECT_COUNT {
            return Err(FsError::NoSpace);
        }
        let bitmap_sectors: Vec<SectorId> =
            (0..count).map(|i| SectorId::new(ROOT_DIR_SECTOR + 1 + i as u32)).collect();

        let mut scratch = vec![[0u8; SECTOR_SIZE]; count];
        let mark = |scratch: &mut Vec<Sector>, bit: u64| {
            let (sidx, off) = bit_location(bit);
            set_bit(&mut scratch[sidx], off, true);
        };
        mark(&mut scratch, FREE_MAP_SECTOR as u64);
        mark(&mut scratch, ROOT_DIR_SECTOR as u64);
        for s in &bitmap_sectors {
            mark(&mut scratch, s.raw() as u64);
        }
        // Sectors beyond the device's actual size (padding out to a whole
        // sector of bits) are marked used so they are never handed out.
        for bit in total_sectors..(count as u64 * BITS_PER_SECTOR) {
            mark(&mut scratch, bit);
        }

        for (sector_id, data) in bitmap_sectors.iter().zip(scratch.iter()) {
            cache.write(*sector_id, data)?;
        }

        let mut header = crate::disk_layout::InodeDisk::new((count * SECTOR_SIZE) as u32, false);
        for (i, s) in bitmap_sectors.iter().enumerate() {
            header.direct[i] = s.raw();
        }
        cache.write(SectorId::new(FREE_MAP_SECTOR), &header.to_sector())?;

        Ok(Self {
            cache,
            bitmap_sectors,
            total_sectors,
            scan_lock: Mutex::new(()),
        })
    }

    /// Recovers an existing free-map from its header sector.
    pub fn mount(cache: Arc<BufferCache<D>>, total_sectors: u64) -> FsResult<Self> {
        let count = bitmap_sector_count(total_sectors);
        let mut header_sector = [0u8; SECTOR_SIZE];
        cache.read(SectorId::new(FREE_MAP_SECTOR), &mut header_sector)?;
        let header = crate::disk_layout::InodeDisk::from_sector(&header_sector);
        let bitmap_sectors: Vec<SectorId> =
            header.direct[..count].iter().map(|&raw| SectorId::new(raw)).collect();
        Ok(Self {
            cache,
            bitmap_sectors,
            total_sectors,
            scan_lock: Mutex::new(()),
        })
    }
}

impl<D: BlockDevice> SectorAllocator for BitmapAllocator<D> {
    fn allocate(&self) -> FsResult<SectorId> {
        let _guard = self.scan_lock.lock().unwrap();
        for bit in 0..self.total_sectors {
            let (sidx, off) = bit_location(bit);
            let mut buf = [0u8; SECTOR_SIZE];
            self.cache.read(self.bitmap_sectors[sidx], &mut buf)?;
            if !get_bit(&buf, off) {
                set_bit(&mut buf, off, true);
                self.cache.write(self.bitmap_sectors[sidx], &buf)?;
                return Ok(SectorId::new(bit as u32));
            }
        }
        Err(FsError::NoSpace)
    }

    fn release(&self, sector: SectorId) {
        let _guard = self.scan_lock.lock().unwrap();
        let (sidx, off) = bit_location(sector.raw() as u64);
        let mut buf = [0u8; SECTOR_SIZE];
        if self.cache.read(self.bitmap_sectors[sidx], &mut buf).is_err() {
            warn!("free-map: failed to read bitmap sector while releasing {}", sector.raw());
            return;
        }
        if !get_bit(&buf, off) {
            warn!("free-map: releasing already-free sector {}", sector.raw());
        }
        set_bit(&mut buf, off, false);
        let _ = self.cache.write(self.bitmap_sectors[sidx], &buf);
    }
}
