//! Directory contents: a directory is a regular file (read and written
//! through the same inode interface as any other file) whose bytes are a
//! packed sequence of fixed-width directory-entry records.
//!
//! `spec.md` leaves directory-entry format out of scope; this module
//! supplies the one concrete format the resolver needs to actually create,
//! look up, and remove names. Every directory is seeded with `.` and `..`
//! entries at creation (`seed`, called from `mkdir` and from `format`'s root
//! directory), reserving the two-entry room `filesys_mkdir` requires.
//! `is_empty` ignores both, so "empty" still means "no user entries" rather
//! than "literally zero live dirents". Directories otherwise grow on demand
//! rather than being pre-sized for a fixed entry count at creation.

use zerocopy::{AsBytes, FromBytes};

use crate::error::{FsError, FsResult};
use crate::inode::{InodeLayer, RcInode};
use crate::device::{BlockDevice, SectorId};
use crate::param::NAME_MAX;
use crate::path::FileName;

#[derive(Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
struct DirentRaw {
    inode_sector: u32,
    name: [u8; NAME_MAX],
    in_use: u8,
    is_dir: u8,
}

const DIRENT_SIZE: usize = std::mem::size_of::<DirentRaw>();

impl DirentRaw {
    fn empty() -> Self {
        Self { inode_sector: 0, name: [0; NAME_MAX], in_use: 0, is_dir: 0 }
    }

    fn matches(&self, name: &FileName) -> bool {
        if self.in_use == 0 {
            return false;
        }
        let bytes = name.as_str().as_bytes();
        self.name[..bytes.len()] == *bytes && self.name[bytes.len()..].iter().all(|&b| b == 0)
    }

    fn set_name(&mut self, name: &FileName) {
        self.name = [0; NAME_MAX];
        let bytes = name.as_str().as_bytes();
        self.name[..bytes.len()].copy_from_slice(bytes);
    }
}

/// One directory entry as seen by a caller: the name, the inode it points
/// to, and whether that inode is itself a directory.
pub struct DirEntry {
    pub name: String,
    pub sector: SectorId,
    pub is_dir: bool,
}

fn read_slot<D: BlockDevice>(
    layer: &InodeLayer<D>,
    dir: &RcInode<D>,
    index: usize,
) -> FsResult<Option<DirentRaw>> {
    let mut buf = [0u8; DIRENT_SIZE];
    let n = layer.read_at(dir, &mut buf, (index * DIRENT_SIZE) as u64)?;
    if n < DIRENT_SIZE {
        return Ok(None);
    }
    Ok(Some(DirentRaw::read_from(&buf[..]).expect("fixed-size record")))
}

fn write_slot<D: BlockDevice>(
    layer: &InodeLayer<D>,
    dir: &RcInode<D>,
    index: usize,
    entry: &DirentRaw,
) -> FsResult<()> {
    let mut buf = [0u8; DIRENT_SIZE];
    buf.copy_from_slice(entry.as_bytes());
    layer.write_at(dir, &buf, (index * DIRENT_SIZE) as u64)?;
    Ok(())
}

/// Looks up `name` in `dir`, returning its inode sector and directory-ness
/// if present.
pub fn lookup<D: BlockDevice>(
    layer: &InodeLayer<D>,
    dir: &RcInode<D>,
    name: &FileName,
) -> FsResult<Option<(SectorId, bool)>> {
    let mut index = 0;
    while let Some(slot) = read_slot(layer, dir, index)? {
        if slot.matches(name) {
            return Ok(Some((SectorId::new(slot.inode_sector), slot.is_dir != 0)));
        }
        index += 1;
    }
    Ok(None)
}

/// Adds `name -> sector` to `dir`. Fails with `AlreadyExists` if the name is
/// already present. Reuses the first vacated slot, if any, else appends.
pub fn add<D: BlockDevice>(
    layer: &InodeLayer<D>,
    dir: &RcInode<D>,
    name: &FileName,
    sector: SectorId,
    is_dir: bool,
) -> FsResult<()> {
    let _guard = dir.dir_lock.lock().unwrap();
    let mut index = 0;
    let mut free_slot = None;
    loop {
        match read_slot(layer, dir, index)? {
            Some(slot) if slot.in_use != 0 => {
                if slot.matches(name) {
                    return Err(FsError::AlreadyExists);
                }
            }
            Some(_) => {
                if free_slot.is_none() {
                    free_slot = Some(index);
                }
            }
            None => break,
        }
        index += 1;
    }

    let mut entry = DirentRaw::empty();
    entry.inode_sector = sector.raw();
    entry.in_use = 1;
    entry.is_dir = is_dir as u8;
    entry.set_name(name);

    write_slot(layer, dir, free_slot.unwrap_or(index), &entry)
}

/// Seeds a freshly created directory with `.` (pointing at itself) and `..`
/// (pointing at its parent, or itself for the root). Reserves the room
/// `filesys_mkdir` promises before any caller adds a user entry.
pub fn seed<D: BlockDevice>(
    layer: &InodeLayer<D>,
    new_dir: &RcInode<D>,
    self_sector: SectorId,
    parent_sector: SectorId,
) -> FsResult<()> {
    add(layer, new_dir, &FileName::new(".").expect("\".\" is a valid name"), self_sector, true)?;
    add(layer, new_dir, &FileName::new("..").expect("\"..\" is a valid name"), parent_sector, true)?;
    Ok(())
}

/// Removes `name` from `dir`. Fails with `NotFound` if absent.
pub fn remove<D: BlockDevice>(
    layer: &InodeLayer<D>,
    dir: &RcInode<D>,
    name: &FileName,
) -> FsResult<()> {
    let _guard = dir.dir_lock.lock().unwrap();
    let mut index = 0;
    while let Some(slot) = read_slot(layer, dir, index)? {
        if slot.matches(name) {
            write_slot(layer, dir, index, &DirentRaw::empty())?;
            return Ok(());
        }
        index += 1;
    }
    Err(FsError::NotFound)
}

/// True iff `dir` holds no live entries besides `.` and `..`.
pub fn is_empty<D: BlockDevice>(layer: &InodeLayer<D>, dir: &RcInode<D>) -> FsResult<bool> {
    let mut index = 0;
    while let Some(slot) = read_slot(layer, dir, index)? {
        if slot.in_use != 0 && !is_dot_or_dot_dot(&slot) {
            return Ok(false);
        }
        index += 1;
    }
    Ok(true)
}

fn is_dot_or_dot_dot(slot: &DirentRaw) -> bool {
    slot.matches(&FileName::new(".").expect("\".\" is a valid name"))
        || slot.matches(&FileName::new("..").expect("\"..\" is a valid name"))
}

/// Lists every live entry in `dir`, in on-disk order.
pub fn list<D: BlockDevice>(layer: &InodeLayer<D>, dir: &RcInode<D>) -> FsResult<Vec<DirEntry>> {
    let mut out = Vec::new();
    let mut index = 0;
    while let Some(slot) = read_slot(layer, dir, index)? {
        if slot.in_use != 0 {
            let name_len = slot.name.iter().position(|&b| b == 0).unwrap_or(NAME_MAX);
            let name = String::from_utf8_lossy(&slot.name[..name_len]).into_owned();
            out.push(DirEntry { name, sector: SectorId::new(slot.inode_sector), is_dir: slot.is_dir != 0 });
        }
        index += 1;
    }
    Ok(out)
}
