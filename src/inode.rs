//! Inode layer: growable files over the block map, reference-counted
//! in-memory inodes, and the open-inode table that keeps them unique.

use std::collections::HashMap;
use std::mem::ManuallyDrop;
use std::sync::{Arc, Mutex, Weak};

use log::{debug, trace};

use crate::alloc::SectorAllocator;
use crate::cache::BufferCache;
use crate::device::{BlockDevice, SectorId};
use crate::disk_layout::{
    direct_count, double_data_count, double_indirect_count, locate, single_data_count,
    single_indirect_count, IndirectBlock, InodeDisk, Locate, MAX_FILE_SIZE,
};
use crate::error::{FsError, FsResult};
use crate::param::{POINTERS_PER_INDIRECT, SECTOR_SIZE};

struct InodeMeta {
    open_cnt: u32,
    deny_write_cnt: u32,
    removed: bool,
}

/// The in-memory half of an inode: everything not already captured by the
/// on-disk `InodeDisk` that the cache holds for us.
pub struct InodeCell {
    pub sector: SectorId,
    pub is_dir: bool,
    meta: Mutex<InodeMeta>,
    /// Serializes file extension (`write_at` double-checked growth).
    size_lock: Mutex<()>,
    /// Serializes directory-content mutation; consumed by `dir.rs`.
    pub dir_lock: Mutex<()>,
}

impl InodeCell {
    pub fn open_count(&self) -> u32 {
        self.meta.lock().unwrap().open_cnt
    }

    pub fn is_removed(&self) -> bool {
        self.meta.lock().unwrap().removed
    }

    pub fn deny_write_count(&self) -> u32 {
        self.meta.lock().unwrap().deny_write_cnt
    }
}

/// A reference-counted handle to an open inode. Must be released with
/// `InodeLayer::close`, not dropped — mirrors the source's explicit
/// open/close pairing rather than relying on an implicit destructor, so
/// teardown timing (and the sector release it can trigger) stays visible at
/// every call site.
pub struct RcInode<D> {
    layer: Arc<InodeLayerInner<D>>,
    cell: ManuallyDrop<Arc<InodeCell>>,
}

impl<D> std::ops::Deref for RcInode<D> {
    type Target = InodeCell;

    fn deref(&self) -> &InodeCell {
        &self.cell
    }
}

impl<D> Drop for RcInode<D> {
    fn drop(&mut self) {
        panic!("RcInode dropped without calling InodeLayer::close");
    }
}

impl<D: BlockDevice> RcInode<D> {
    /// Releases this handle directly, equivalent to `InodeLayer::close` but
    /// usable at call sites that only hold the handle itself, not the
    /// `InodeLayer` that produced it.
    pub fn close(mut self) {
        let layer = InodeLayer { inner: self.layer.clone() };
        // SAFETY: `self` is consumed by this function and never observed again.
        let cell = unsafe { ManuallyDrop::take(&mut self.cell) };
        std::mem::forget(self);
        layer.close_cell(cell);
    }
}

struct InodeLayerInner<D> {
    cache: Arc<BufferCache<D>>,
    alloc: Arc<dyn SectorAllocator>,
    table: Mutex<HashMap<SectorId, Weak<InodeCell>>>,
}

/// Process-wide inode layer: the open-inode table plus the block-map logic
/// that turns `InodeDisk` and byte offsets into sector reads and writes.
pub struct InodeLayer<D> {
    inner: Arc<InodeLayerInner<D>>,
}

impl<D> Clone for InodeLayer<D> {
    fn clone(&self) -> Self {
        Self { inner: self.inner.clone() }
    }
}

impl<D: BlockDevice> InodeLayer<D> {
    pub fn new(cache: Arc<BufferCache<D>>, alloc: Arc<dyn SectorAllocator>) -> Self {
        Self {
            inner: Arc::new(InodeLayerInner {
                cache,
                alloc,
                table: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Allocates and zeroes a fresh on-disk inode of the given initial
    /// `length`, growing its block map the same way `write_at` would.
    pub fn create(&self, sector: SectorId, length: u64, is_dir: bool) -> FsResult<()> {
        if length > MAX_FILE_SIZE {
            return Err(FsError::NoSpace);
        }
        let mut disk = InodeDisk::new(0, is_dir);
        self.extend(&mut disk, length, 0)?;
        disk.length = length as u32;
        self.inner.cache.write(sector, &disk.to_sector())?;
        Ok(())
    }

    /// Finds or creates the in-memory inode for `sector`. Fails if the
    /// inode is marked removed, preventing resurrection of a deleted file.
    pub fn open(&self, sector: SectorId) -> FsResult<RcInode<D>> {
        let mut table = self.inner.table.lock().unwrap();
        if let Some(weak) = table.get(&sector) {
            if let Some(cell) = weak.upgrade() {
                let mut meta = cell.meta.lock().unwrap();
                if meta.removed {
                    return Err(FsError::NotFound);
                }
                meta.open_cnt += 1;
                drop(meta);
                return Ok(RcInode { layer: self.inner.clone(), cell: ManuallyDrop::new(cell) });
            }
        }

        let mut buf = [0u8; SECTOR_SIZE];
        self.inner.cache.read(sector, &mut buf)?;
        let disk = InodeDisk::from_sector(&buf);
        let cell = Arc::new(InodeCell {
            sector,
            is_dir: disk.is_dir(),
            meta: Mutex::new(InodeMeta { open_cnt: 1, deny_write_cnt: 0, removed: false }),
            size_lock: Mutex::new(()),
            dir_lock: Mutex::new(()),
        });
        table.insert(sector, Arc::downgrade(&cell));
        trace!("opened inode at sector {}", sector.raw());
        Ok(RcInode { layer: self.inner.clone(), cell: ManuallyDrop::new(cell) })
    }

    /// Clones a handle, incrementing the inode's open count (`reopen`).
    pub fn dup(&self, inode: &RcInode<D>) -> RcInode<D> {
        inode.cell.meta.lock().unwrap().open_cnt += 1;
        RcInode { layer: self.inner.clone(), cell: ManuallyDrop::new((*inode.cell).clone()) }
    }

    /// Marks the inode for deletion once the last opener closes it.
    pub fn remove(&self, inode: &RcInode<D>) {
        inode.cell.meta.lock().unwrap().removed = true;
    }

    pub fn deny_write(&self, inode: &RcInode<D>) {
        inode.cell.meta.lock().unwrap().deny_write_cnt += 1;
    }

    pub fn allow_write(&self, inode: &RcInode<D>) {
        let mut meta = inode.cell.meta.lock().unwrap();
        debug_assert!(meta.deny_write_cnt > 0);
        meta.deny_write_cnt -= 1;
    }

    /// Releases `inode`. On the last close of a removed inode, walks the
    /// block map and releases every data, indirect, and inode sector — data
    /// first, then the indirect blocks that pointed to it, then the inode
    /// sector itself, so a teardown interrupted partway never leaves a
    /// still-referenced parent pointing at a sector that could have been
    /// re-allocated to someone else.
    pub fn close(&self, mut inode: RcInode<D>) {
        // SAFETY: `inode` is consumed by this function and never observed again.
        let cell = unsafe { ManuallyDrop::take(&mut inode.cell) };
        std::mem::forget(inode);
        self.close_cell(cell);
    }

    fn close_cell(&self, cell: Arc<InodeCell>) {
        let mut table = self.inner.table.lock().unwrap();
        let mut meta = cell.meta.lock().unwrap();
        meta.open_cnt -= 1;
        if meta.open_cnt > 0 {
            return;
        }
        let removed = meta.removed;
        drop(meta);
        table.remove(&cell.sector);
        drop(table);

        if removed {
            debug!("last close of removed inode at sector {}, releasing blocks", cell.sector.raw());
            self.deallocate_blocks(&cell);
        }
    }

    fn deallocate_blocks(&self, cell: &Arc<InodeCell>) {
        let mut buf = [0u8; SECTOR_SIZE];
        if self.inner.cache.read(cell.sector, &mut buf).is_err() {
            return;
        }
        let disk = InodeDisk::from_sector(&buf);
        let length = disk.length as u64;

        for i in 0..direct_count(length) {
            self.inner.alloc.release(SectorId::new(disk.direct[i]));
        }
        for i in 0..single_indirect_count(length) {
            let indirect_sector = SectorId::new(disk.single_indirect[i]);
            if let Ok(ib) = self.read_indirect(indirect_sector) {
                for j in 0..POINTERS_PER_INDIRECT {
                    self.inner.alloc.release(SectorId::new(ib.pointers[j]));
                }
            }
            self.inner.alloc.release(indirect_sector);
        }
        for i in 0..double_indirect_count(length) {
            let double_sector = SectorId::new(disk.double_indirect[i]);
            if let Ok(dblock) = self.read_indirect(double_sector) {
                for k in 0..POINTERS_PER_INDIRECT {
                    let indirect_sector = SectorId::new(dblock.pointers[k]);
                    if let Ok(ib) = self.read_indirect(indirect_sector) {
                        for j in 0..POINTERS_PER_INDIRECT {
                            self.inner.alloc.release(SectorId::new(ib.pointers[j]));
                        }
                    }
                    self.inner.alloc.release(indirect_sector);
                }
            }
            self.inner.alloc.release(double_sector);
        }
        self.inner.alloc.release(cell.sector);
    }

    fn read_indirect(&self, sector: SectorId) -> FsResult<IndirectBlock> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.inner.cache.read(sector, &mut buf)?;
        Ok(IndirectBlock::from_sector(&buf))
    }

    fn offset_to_sector(&self, disk: &InodeDisk, pos: u64) -> FsResult<SectorId> {
        match locate(pos) {
            Locate::Direct { index } => Ok(SectorId::new(disk.direct[index])),
            Locate::Single { indirect_index, pointer_index } => {
                let ib = self.read_indirect(SectorId::new(disk.single_indirect[indirect_index]))?;
                Ok(SectorId::new(ib.pointers[pointer_index]))
            }
            Locate::Double { pointer_index, inner_index } => {
                let dblock = self.read_indirect(SectorId::new(disk.double_indirect[0]))?;
                let ib = self.read_indirect(SectorId::new(dblock.pointers[pointer_index]))?;
                Ok(SectorId::new(ib.pointers[inner_index]))
            }
        }
    }

    /// Allocates and zero-fills the sectors needed to grow `disk` from
    /// `old_length` to `new_length`, updating its block-map pointers.
    /// `disk.length` is left untouched — callers persist it last.
    ///
    /// Indirect blocks are filled to exactly the byte length requested, not
    /// to a whole 126-pointer block at a time: growing into the middle of
    /// an indirect block's range reads back the block already on disk and
    /// fills only the new trailing pointers, so a file that grows one
    /// sector past a boundary allocates one data sector, not 126.
    fn extend(&self, disk: &mut InodeDisk, new_length: u64, old_length: u64) -> FsResult<()> {
        let zero = [0u8; SECTOR_SIZE];
        let cache = &self.inner.cache;
        let alloc = &self.inner.alloc;

        for i in direct_count(old_length)..direct_count(new_length) {
            let s = alloc.allocate()?;
            cache.write(s, &zero)?;
            disk.direct[i] = s.raw();
        }

        let old_sd = single_data_count(old_length);
        let new_sd = single_data_count(new_length);
        let mut idx = old_sd;
        while idx < new_sd {
            let block = idx / POINTERS_PER_INDIRECT;
            let slot = idx % POINTERS_PER_INDIRECT;
            let mut iblock = if slot == 0 {
                let s = alloc.allocate()?;
                disk.single_indirect[block] = s.raw();
                IndirectBlock::new(s, 0)
            } else {
                self.read_indirect(SectorId::new(disk.single_indirect[block]))?
            };
            let block_end = ((block + 1) * POINTERS_PER_INDIRECT).min(new_sd);
            for s in slot..(block_end - block * POINTERS_PER_INDIRECT) {
                let sector = alloc.allocate()?;
                cache.write(sector, &zero)?;
                iblock.pointers[s] = sector.raw();
            }
            cache.write(SectorId::new(disk.single_indirect[block]), &iblock.to_sector())?;
            idx = block_end;
        }

        let old_dd = double_data_count(old_length);
        let new_dd = double_data_count(new_length);
        if new_dd > old_dd {
            let mut dblock = if old_dd == 0 {
                let s = alloc.allocate()?;
                disk.double_indirect[0] = s.raw();
                IndirectBlock::new(s, 1)
            } else {
                self.read_indirect(SectorId::new(disk.double_indirect[0]))?
            };

            let mut idx = old_dd;
            while idx < new_dd {
                let outer = idx / POINTERS_PER_INDIRECT;
                let inner = idx % POINTERS_PER_INDIRECT;
                let mut iblock = if inner == 0 {
                    let s = alloc.allocate()?;
                    dblock.pointers[outer] = s.raw();
                    IndirectBlock::new(s, 0)
                } else {
                    self.read_indirect(SectorId::new(dblock.pointers[outer]))?
                };
                let block_end = ((outer + 1) * POINTERS_PER_INDIRECT).min(new_dd);
                for s in inner..(block_end - outer * POINTERS_PER_INDIRECT) {
                    let sector = alloc.allocate()?;
                    cache.write(sector, &zero)?;
                    iblock.pointers[s] = sector.raw();
                }
                cache.write(SectorId::new(dblock.pointers[outer]), &iblock.to_sector())?;
                idx = block_end;
            }
            cache.write(SectorId::new(disk.double_indirect[0]), &dblock.to_sector())?;
        }

        Ok(())
    }

    /// Reads up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes actually read, short at end-of-file — never an
    /// error on its own.
    pub fn read_at(&self, inode: &RcInode<D>, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < buf.len() {
            let mut disk_buf = [0u8; SECTOR_SIZE];
            self.inner.cache.read(inode.sector, &mut disk_buf)?;
            let disk = InodeDisk::from_sector(&disk_buf);
            let length = disk.length as u64;
            if pos >= length {
                break;
            }
            let sector_id = self.offset_to_sector(&disk, pos)?;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let inode_left = (length - pos) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            let mut tmp = [0u8; SECTOR_SIZE];
            self.inner.cache.read(sector_id, &mut tmp)?;
            buf[written..written + chunk].copy_from_slice(&tmp[sector_ofs..sector_ofs + chunk]);
            pos += chunk as u64;
            written += chunk;
        }
        Ok(written)
    }

    /// Writes the payload bytes of a single `write_at` call against an
    /// already-resolved block map, `length` being the file's length as of
    /// the start of this call (so a growing writer's own extension is
    /// visible to it without a second read).
    fn write_payload(
        &self,
        disk: &InodeDisk,
        buf: &[u8],
        offset: u64,
        length: u64,
    ) -> FsResult<usize> {
        let mut pos = offset;
        let mut written = 0usize;
        while written < buf.len() {
            let sector_id = self.offset_to_sector(disk, pos)?;
            let sector_ofs = (pos % SECTOR_SIZE as u64) as usize;
            let inode_left = (length - pos) as usize;
            let sector_left = SECTOR_SIZE - sector_ofs;
            let chunk = (buf.len() - written).min(inode_left).min(sector_left);
            if chunk == 0 {
                break;
            }
            if sector_ofs == 0 && chunk == SECTOR_SIZE {
                let mut tmp = [0u8; SECTOR_SIZE];
                tmp.copy_from_slice(&buf[written..written + chunk]);
                self.inner.cache.write(sector_id, &tmp)?;
            } else {
                let mut tmp = [0u8; SECTOR_SIZE];
                self.inner.cache.read(sector_id, &mut tmp)?;
                tmp[sector_ofs..sector_ofs + chunk].copy_from_slice(&buf[written..written + chunk]);
                self.inner.cache.write(sector_id, &tmp)?;
            }
            pos += chunk as u64;
            written += chunk;
        }
        Ok(written)
    }

    /// Writes `buf` at `offset`, extending the file first if necessary.
    /// Returns `Ok(0)` immediately, with no other effect, while writes are
    /// denied (`deny_write_cnt > 0`) — a short return, not an error.
    pub fn write_at(&self, inode: &RcInode<D>, buf: &[u8], offset: u64) -> FsResult<usize> {
        if inode.cell.meta.lock().unwrap().deny_write_cnt > 0 {
            return Ok(0);
        }

        let target_end = offset + buf.len() as u64;

        let mut disk_buf = [0u8; SECTOR_SIZE];
        self.inner.cache.read(inode.sector, &mut disk_buf)?;
        let length = InodeDisk::from_sector(&disk_buf).length as u64;

        if target_end > length {
            // Growing writer: hold size_lock through the block-map
            // extension *and* the payload write, persisting the new length
            // only once the payload is actually on disk (length committed
            // last, per the growth ordering), rather than racing a reader
            // that could otherwise observe a length claiming bytes the
            // payload loop hasn't written yet.
            let _guard = inode.cell.size_lock.lock().unwrap();
            // Q2: re-read after acquiring size_lock. A concurrent grower may
            // have already updated `disk`'s block-map pointers and length;
            // using the copy read before the lock would see stale pointers.
            self.inner.cache.read(inode.sector, &mut disk_buf)?;
            let mut disk = InodeDisk::from_sector(&disk_buf);
            let mut length = disk.length as u64;
            if target_end > length {
                if target_end > MAX_FILE_SIZE {
                    return Err(FsError::NoSpace);
                }
                self.extend(&mut disk, target_end, length)?;
                length = target_end;
            }
            let written = self.write_payload(&disk, buf, offset, length)?;
            disk.length = length as u32;
            self.inner.cache.write(inode.sector, &disk.to_sector())?;
            return Ok(written);
        }

        self.inner.cache.read(inode.sector, &mut disk_buf)?;
        let disk = InodeDisk::from_sector(&disk_buf);
        self.write_payload(&disk, buf, offset, length)
    }

    /// Current file length in bytes, read fresh from the cache.
    pub fn length(&self, inode: &RcInode<D>) -> FsResult<u64> {
        let mut buf = [0u8; SECTOR_SIZE];
        self.inner.cache.read(inode.sector, &mut buf)?;
        Ok(InodeDisk::from_sector(&buf).length as u64)
    }
}
