//! Top-level name-space façade: the surface a caller actually links
//! against. Ties the buffer cache, free-space allocator, inode layer, and
//! directory format together and walks paths over them.

use std::sync::Arc;

use crate::alloc::{BitmapAllocator, SectorAllocator};
use crate::cache::BufferCache;
use crate::device::{BlockDevice, SectorId};
use crate::dir::{self, DirEntry};
use crate::error::{FsError, FsResult};
use crate::inode::{InodeLayer, RcInode};
use crate::param::ROOT_DIR_SECTOR;
use crate::path::{FileName, Path};

/// A mounted (or freshly formatted) file system over one block device.
pub struct FileSystem<D> {
    device: Arc<D>,
    cache: Arc<BufferCache<D>>,
    alloc: Arc<dyn SectorAllocator>,
    inodes: InodeLayer<D>,
}

impl<D: BlockDevice + 'static> FileSystem<D> {
    /// `filesys_init(format: true)`: lays down a fresh free-map and root
    /// directory, discarding anything already on `device`.
    pub fn format(device: Arc<D>) -> FsResult<Self> {
        let cache = Arc::new(BufferCache::new(device.clone()));
        let bitmap = BitmapAllocator::format(cache.clone(), device.sector_count())?;
        let alloc: Arc<dyn SectorAllocator> = Arc::new(bitmap);
        let inodes = InodeLayer::new(cache.clone(), alloc.clone());
        inodes.create(SectorId::new(ROOT_DIR_SECTOR), 0, true)?;
        let root_sector = SectorId::new(ROOT_DIR_SECTOR);
        let root = inodes.open(root_sector)?;
        let root = scopeguard::guard(root, |r| inodes.close(r));
        dir::seed(&inodes, &root, root_sector, root_sector)?;
        inodes.close(scopeguard::ScopeGuard::into_inner(root));
        Ok(Self { device, cache, alloc, inodes })
    }

    /// `filesys_init(format: false)`: recovers an existing free-map and
    /// root directory from `device`.
    pub fn mount(device: Arc<D>) -> FsResult<Self> {
        let cache = Arc::new(BufferCache::new(device.clone()));
        let bitmap = BitmapAllocator::mount(cache.clone(), device.sector_count())?;
        let alloc: Arc<dyn SectorAllocator> = Arc::new(bitmap);
        let inodes = InodeLayer::new(cache.clone(), alloc.clone());
        Ok(Self { device, cache, alloc, inodes })
    }

    /// `filesys_done`: flushes every dirty cache entry back to the device.
    pub fn shutdown(&self) -> FsResult<()> {
        self.cache.flush_all()
    }

    /// Flushes and invalidates the whole cache without closing the file
    /// system — used by tests to force a cold read and by diagnostics.
    pub fn buffer_clear(&self) -> FsResult<()> {
        self.cache.flush_all()
    }

    pub fn reads(&self) -> u64 {
        self.device.reads()
    }

    /// Forwards to the device's own write counter (Q4: not its read counter).
    pub fn writes(&self) -> u64 {
        self.device.writes()
    }

    /// Opens every directory named by `components` in turn, starting from
    /// the root. Closes every intermediate handle as it descends.
    fn walk(&self, components: &[FileName]) -> FsResult<RcInode<D>> {
        let mut current = self.inodes.open(SectorId::new(ROOT_DIR_SECTOR))?;
        for component in components {
            let looked_up = dir::lookup(&self.inodes, &current, component);
            let (sector, is_dir) = match looked_up {
                Ok(Some(found)) => found,
                Ok(None) => {
                    self.inodes.close(current);
                    return Err(FsError::NotFound);
                }
                Err(e) => {
                    self.inodes.close(current);
                    return Err(e);
                }
            };
            if !is_dir {
                self.inodes.close(current);
                return Err(FsError::NotFound);
            }
            let next = self.inodes.open(sector);
            self.inodes.close(current);
            current = next?;
        }
        Ok(current)
    }

    /// Creates a regular file at `path` with `initial_size` bytes,
    /// zero-filled. The parent path must already resolve to a directory;
    /// the final component must not already exist.
    pub fn create(&self, path: &Path, initial_size: u64) -> FsResult<RcInode<D>> {
        if path.is_root() {
            return Err(FsError::InvalidPath);
        }
        let parent = self.walk(path.parent_components())?;
        let parent = scopeguard::guard(parent, |p| self.inodes.close(p));
        let name = path.file_name().expect("non-root path has a final component");
        self.create_in(&parent, name, initial_size, false)
    }

    fn create_in(
        &self,
        parent: &RcInode<D>,
        name: &FileName,
        initial_size: u64,
        is_dir: bool,
    ) -> FsResult<RcInode<D>> {
        if dir::lookup(&self.inodes, parent, name)?.is_some() {
            return Err(FsError::AlreadyExists);
        }
        let sector = self.alloc.allocate()?;
        self.inodes.create(sector, initial_size, is_dir)?;
        dir::add(&self.inodes, parent, name, sector, is_dir)?;
        let handle = self.inodes.open(sector)?;
        if is_dir {
            let handle = scopeguard::guard(handle, |h| self.inodes.close(h));
            dir::seed(&self.inodes, &handle, sector, parent.sector)?;
            Ok(scopeguard::ScopeGuard::into_inner(handle))
        } else {
            Ok(handle)
        }
    }

    /// Creates a directory at `path`. Identical to `create` except the new
    /// inode is marked as a directory.
    pub fn mkdir(&self, path: &Path) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::InvalidPath);
        }
        let parent = self.walk(path.parent_components())?;
        let parent = scopeguard::guard(parent, |p| self.inodes.close(p));
        let name = path.file_name().expect("non-root path has a final component");
        self.create_in(&parent, name, 0, true).map(|handle| self.inodes.close(handle))
    }

    /// Opens the regular file at `path`. Opening `/` fails — use
    /// `open_dir`. The terminal component must resolve to a non-directory.
    pub fn open(&self, path: &Path) -> FsResult<RcInode<D>> {
        if path.is_root() {
            return Err(FsError::InvalidPath);
        }
        let parent = self.walk(path.parent_components())?;
        let parent = scopeguard::guard(parent, |p| self.inodes.close(p));
        let name = path.file_name().expect("non-root path has a final component");
        let (sector, is_dir) = dir::lookup(&self.inodes, &parent, name)?.ok_or(FsError::NotFound)?;
        if is_dir {
            return Err(FsError::InvalidPath);
        }
        self.inodes.open(sector)
    }

    /// Opens the directory at `path`. `/` resolves to the root directory.
    pub fn open_dir(&self, path: &Path) -> FsResult<RcInode<D>> {
        self.walk(path.components())
    }

    /// Removes the name at `path`. A directory target must be empty.
    /// Removing `/` always fails. Removing an open file still succeeds —
    /// its sectors are released only once every handle has been closed.
    pub fn remove(&self, path: &Path) -> FsResult<()> {
        if path.is_root() {
            return Err(FsError::InvalidPath);
        }
        let parent = self.walk(path.parent_components())?;
        let parent = scopeguard::guard(parent, |p| self.inodes.close(p));
        let name = path.file_name().expect("non-root path has a final component");
        self.remove_in(&parent, name)
    }

    fn remove_in(&self, parent: &RcInode<D>, name: &FileName) -> FsResult<()> {
        let (sector, is_dir) = dir::lookup(&self.inodes, parent, name)?.ok_or(FsError::NotFound)?;
        let target = self.inodes.open(sector)?;
        if is_dir {
            match dir::is_empty(&self.inodes, &target) {
                Ok(true) => {}
                Ok(false) => {
                    self.inodes.close(target);
                    return Err(FsError::NotEmpty);
                }
                Err(e) => {
                    self.inodes.close(target);
                    return Err(e);
                }
            }
        }
        self.inodes.remove(&target);
        self.inodes.close(target);
        dir::remove(&self.inodes, parent, name)
    }

    /// Lists the live entries of an already-open directory.
    pub fn read_dir(&self, dir: &RcInode<D>) -> FsResult<Vec<DirEntry>> {
        dir::list(&self.inodes, dir)
    }

    pub fn read_at(&self, inode: &RcInode<D>, buf: &mut [u8], offset: u64) -> FsResult<usize> {
        self.inodes.read_at(inode, buf, offset)
    }

    pub fn write_at(&self, inode: &RcInode<D>, buf: &[u8], offset: u64) -> FsResult<usize> {
        self.inodes.write_at(inode, buf, offset)
    }

    pub fn length(&self, inode: &RcInode<D>) -> FsResult<u64> {
        self.inodes.length(inode)
    }

    pub fn deny_write(&self, inode: &RcInode<D>) {
        self.inodes.deny_write(inode)
    }

    pub fn allow_write(&self, inode: &RcInode<D>) {
        self.inodes.allow_write(inode)
    }

    /// Duplicates a handle (a second opener of the same inode).
    pub fn reopen(&self, inode: &RcInode<D>) -> RcInode<D> {
        self.inodes.dup(inode)
    }

    /// Releases a handle obtained from `create`, `open`, `open_dir`, or
    /// `reopen`. Must be called exactly once per handle.
    pub fn close(&self, inode: RcInode<D>) {
        self.inodes.close(inode)
    }
}
