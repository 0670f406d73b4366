//! On-disk byte layouts for inodes and indirect blocks, and the pure
//! block-map arithmetic built on top of them.
//!
//! Both structures are exactly one sector wide and are read/written through
//! the buffer cache like any other sector — metadata is cached like data.

use static_assertions::const_assert_eq;
use zerocopy::{AsBytes, FromBytes};

use crate::device::{Sector, SectorId};
use crate::param::{
    DIRECT_COUNT, DOUBLE_INDIRECT_COUNT, INODE_MAGIC, POINTERS_PER_INDIRECT, SECTOR_SIZE,
    SINGLE_INDIRECT_COUNT,
};

/// On-disk inode. Exactly one sector.
#[derive(Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub struct InodeDisk {
    pub length: u32,
    pub magic: u32,
    pub is_dir: u8,
    _pad: [u8; 3],
    pub direct: [u32; DIRECT_COUNT],
    pub single_indirect: [u32; SINGLE_INDIRECT_COUNT],
    pub double_indirect: [u32; DOUBLE_INDIRECT_COUNT],
}

const_assert_eq!(core::mem::size_of::<InodeDisk>(), SECTOR_SIZE);

impl InodeDisk {
    pub fn new(length: u32, is_dir: bool) -> Self {
        Self {
            length,
            magic: INODE_MAGIC,
            is_dir: is_dir as u8,
            _pad: [0; 3],
            direct: [0; DIRECT_COUNT],
            single_indirect: [0; SINGLE_INDIRECT_COUNT],
            double_indirect: [0; DOUBLE_INDIRECT_COUNT],
        }
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir != 0
    }

    pub fn from_sector(sector: &Sector) -> Self {
        InodeDisk::read_from(&sector[..]).expect("InodeDisk is exactly one sector wide")
    }

    pub fn to_sector(&self) -> Sector {
        let mut out = [0u8; SECTOR_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// On-disk indirect block. Exactly one sector.
#[derive(Clone, Copy, FromBytes, AsBytes)]
#[repr(C)]
pub struct IndirectBlock {
    pub self_sector: u32,
    pub level: u32,
    pub pointers: [u32; POINTERS_PER_INDIRECT],
}

const_assert_eq!(core::mem::size_of::<IndirectBlock>(), SECTOR_SIZE);

impl IndirectBlock {
    pub fn new(self_sector: SectorId, level: u32) -> Self {
        Self {
            self_sector: self_sector.raw(),
            level,
            pointers: [0; POINTERS_PER_INDIRECT],
        }
    }

    pub fn from_sector(sector: &Sector) -> Self {
        IndirectBlock::read_from(&sector[..]).expect("IndirectBlock is exactly one sector wide")
    }

    pub fn to_sector(&self) -> Sector {
        let mut out = [0u8; SECTOR_SIZE];
        out.copy_from_slice(self.as_bytes());
        out
    }
}

/// Upper bound on file size given the three-level fan-out.
pub const MAX_FILE_SIZE: u64 = (DIRECT_COUNT as u64
    + (SINGLE_INDIRECT_COUNT * POINTERS_PER_INDIRECT) as u64
    + (DOUBLE_INDIRECT_COUNT * POINTERS_PER_INDIRECT * POINTERS_PER_INDIRECT) as u64)
    * SECTOR_SIZE as u64;

const DIRECT_BOUND: u64 = (DIRECT_COUNT * SECTOR_SIZE) as u64;
const SINGLE_INDIRECT_BOUND: u64 =
    DIRECT_BOUND + (SINGLE_INDIRECT_COUNT * POINTERS_PER_INDIRECT * SECTOR_SIZE) as u64;

pub(crate) fn div_round_up(n: u64, d: u64) -> u64 {
    (n + d - 1) / d
}

/// Number of direct blocks needed for a file of `length` bytes.
pub fn direct_count(length: u64) -> usize {
    div_round_up(length.min(DIRECT_BOUND), SECTOR_SIZE as u64) as usize
}

/// Number of single-indirect blocks needed for a file of `length` bytes.
pub fn single_indirect_count(length: u64) -> usize {
    if length <= DIRECT_BOUND {
        0
    } else {
        let span = (POINTERS_PER_INDIRECT * SECTOR_SIZE) as u64;
        div_round_up((length - DIRECT_BOUND).min(span * SINGLE_INDIRECT_COUNT as u64), span)
            as usize
    }
}

/// Number of double-indirect blocks needed for a file of `length` bytes
/// (always 0 or 1, since `DOUBLE_INDIRECT_COUNT == 1`).
pub fn double_indirect_count(length: u64) -> usize {
    if length <= SINGLE_INDIRECT_BOUND {
        0
    } else {
        let span = (POINTERS_PER_INDIRECT * POINTERS_PER_INDIRECT * SECTOR_SIZE) as u64;
        div_round_up(length - SINGLE_INDIRECT_BOUND, span) as usize
    }
}

/// Number of data-sector pointers that live behind single-indirect blocks
/// for a file of `length` bytes — a byte-granular count, unlike
/// `single_indirect_count`'s count of whole indirect blocks. `extend` uses
/// this to fill an indirect block partially rather than allocating all 126
/// of its data pointers whenever any of them is needed.
pub fn single_data_count(length: u64) -> usize {
    if length <= DIRECT_BOUND {
        0
    } else {
        let cap = (SINGLE_INDIRECT_COUNT * POINTERS_PER_INDIRECT) as u64 * SECTOR_SIZE as u64;
        div_round_up((length - DIRECT_BOUND).min(cap), SECTOR_SIZE as u64) as usize
    }
}

/// Data-sector pointers behind the double-indirect block, byte-granular
/// like `single_data_count`.
pub fn double_data_count(length: u64) -> usize {
    if length <= SINGLE_INDIRECT_BOUND {
        0
    } else {
        let cap = (POINTERS_PER_INDIRECT * POINTERS_PER_INDIRECT) as u64 * SECTOR_SIZE as u64;
        div_round_up((length - SINGLE_INDIRECT_BOUND).min(cap), SECTOR_SIZE as u64) as usize
    }
}

/// Which block-map region `pos` falls into, and the index arithmetic needed
/// to find the sector there.
pub enum Locate {
    Direct { index: usize },
    Single { indirect_index: usize, pointer_index: usize },
    Double { pointer_index: usize, inner_index: usize },
}

/// Classifies byte offset `pos` into the region of the block map that holds
/// it. Two explicit branches replace the source's recursive indirect-block
/// walk, since there are only ever two levels of indirection.
pub fn locate(pos: u64) -> Locate {
    if pos < DIRECT_BOUND {
        Locate::Direct {
            index: (pos / SECTOR_SIZE as u64) as usize,
        }
    } else if pos < SINGLE_INDIRECT_BOUND {
        let rel = pos - DIRECT_BOUND;
        let span = (POINTERS_PER_INDIRECT * SECTOR_SIZE) as u64;
        Locate::Single {
            indirect_index: (rel / span) as usize,
            pointer_index: ((rel % span) / SECTOR_SIZE as u64) as usize,
        }
    } else {
        let rel = pos - SINGLE_INDIRECT_BOUND;
        let span = (POINTERS_PER_INDIRECT * SECTOR_SIZE) as u64;
        Locate::Double {
            pointer_index: (rel / (span * POINTERS_PER_INDIRECT as u64)) as usize,
            inner_index: ((rel % (span * POINTERS_PER_INDIRECT as u64)) / span) as usize,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_file_size_matches_fan_out() {
        assert_eq!(
            MAX_FILE_SIZE,
            (50 + 74 * 126 + 1 * 126 * 126) as u64 * SECTOR_SIZE as u64
        );
    }

    #[test]
    fn block_counts_at_boundaries() {
        assert_eq!(direct_count(0), 0);
        assert_eq!(direct_count(SECTOR_SIZE as u64), 1);
        assert_eq!(direct_count(DIRECT_BOUND), DIRECT_COUNT);
        assert_eq!(single_indirect_count(DIRECT_BOUND), 0);
        assert_eq!(single_indirect_count(DIRECT_BOUND + 1), 1);
        assert_eq!(single_indirect_count(SINGLE_INDIRECT_BOUND), SINGLE_INDIRECT_COUNT);
        assert_eq!(double_indirect_count(SINGLE_INDIRECT_BOUND), 0);
        assert_eq!(double_indirect_count(SINGLE_INDIRECT_BOUND + 1), 1);
    }

    #[test]
    fn data_counts_are_byte_granular_not_block_granular() {
        assert_eq!(single_data_count(DIRECT_BOUND), 0);
        assert_eq!(single_data_count(DIRECT_BOUND + 512), 1);
        assert_eq!(single_data_count(DIRECT_BOUND + 512 * 200), 200);
        assert_eq!(double_data_count(SINGLE_INDIRECT_BOUND), 0);
        assert_eq!(double_data_count(SINGLE_INDIRECT_BOUND + 512), 1);
    }

    #[test]
    fn locate_picks_expected_region() {
        match locate(0) {
            Locate::Direct { index } => assert_eq!(index, 0),
            _ => panic!("expected direct"),
        }
        match locate(DIRECT_BOUND) {
            Locate::Single { indirect_index, pointer_index } => {
                assert_eq!(indirect_index, 0);
                assert_eq!(pointer_index, 0);
            }
            _ => panic!("expected single indirect"),
        }
        match locate(SINGLE_INDIRECT_BOUND) {
            Locate::Double { pointer_index, inner_index } => {
                assert_eq!(pointer_index, 0);
                assert_eq!(inner_index, 0);
            }
            _ => panic!("expected double indirect"),
        }
    }
}
