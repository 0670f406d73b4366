//! End-to-end scenarios from the storage-core spec: write amplification
//! under the buffer cache, cold-vs-warm read counts, growth under write,
//! removal of an open file, non-empty `mkdir` rejection, concurrent
//! extension of the same file, and a randomized write/read consistency
//! check against a shadow buffer.

use std::sync::Arc;
use std::thread;

use rand::Rng;
use storage_core::{FileSystem, MemDevice, Path};

const SECTOR_SIZE: u64 = 512;

fn fresh_fs(sector_count: usize) -> FileSystem<MemDevice> {
    let _ = env_logger::try_init();
    let device = Arc::new(MemDevice::new(sector_count));
    FileSystem::format(device).expect("format")
}

#[test]
fn write_amplification_bound() {
    // 66,560 = 130 * 512: spans direct (50 sectors) + single-indirect (80
    // sectors) range. `create` pre-sizes the file to its full length up
    // front, zero-filling all 130 data sectors and the one single-indirect
    // block before this function ever sees it — a footprint far larger
    // than the 64-entry cache, so the cache is already at capacity (and
    // every sector this loop will touch has already been evicted once)
    // before a single one of the per-byte writes below happens.
    //
    // From that saturated starting point, the inode sector is read every
    // call and so never leaves the cache, and the sector currently being
    // written stays resident for its own run of up to 512 consecutive
    // byte writes — but every *distinct* sector the loop first touches is
    // a cache miss that, because the cache is already full, evicts exactly
    // one other entry. That happens once per direct sector (50) and once
    // per single-indirect data sector (80): exactly 130 device writes,
    // regardless of which residual entries from `create` happen to still
    // be resident when the loop starts.
    let fs = fresh_fs(4096);
    let path = Path::parse("/big").unwrap();
    let total = 130 * SECTOR_SIZE as usize;
    let file = fs.create(&path, total as u64).unwrap();

    let writes_before = fs.writes();
    for offset in 0..total {
        let byte = [(offset % 251) as u8];
        fs.write_at(&file, &byte, offset as u64).unwrap();
    }
    fs.close(file);

    let writes = fs.writes() - writes_before;
    assert!(writes > 120 && writes < 135, "writes = {}", writes);
}

#[test]
fn cold_vs_warm_read() {
    let fs = fresh_fs(4096);
    let path = Path::parse("/f").unwrap();
    let file = fs.create(&path, 0).unwrap();

    let total = 50 * SECTOR_SIZE as usize;
    let data = vec![7u8; total];
    fs.write_at(&file, &data, 0).unwrap();
    fs.close(file);
    fs.buffer_clear().unwrap();

    let reads_before = fs.reads();
    let file = fs.open(&path).unwrap();
    let mut buf = [0u8; SECTOR_SIZE as usize];
    let mut offset = 0u64;
    while offset < total as u64 {
        fs.read_at(&file, &mut buf, offset).unwrap();
        offset += SECTOR_SIZE;
    }
    let cold_reads = fs.reads() - reads_before;
    assert_eq!(cold_reads, 51);
    fs.close(file);

    let reads_before_warm = fs.reads();
    let file = fs.open(&path).unwrap();
    let mut offset = 0u64;
    while offset < total as u64 {
        fs.read_at(&file, &mut buf, offset).unwrap();
        offset += SECTOR_SIZE;
    }
    assert_eq!(fs.reads() - reads_before_warm, 0);
    fs.close(file);
}

#[test]
fn growth_under_write_into_single_indirect_range() {
    let fs = fresh_fs(4096);
    let path = Path::parse("/growing").unwrap();
    let file = fs.create(&path, 0).unwrap();

    let payload = [42u8; 512];
    let offset = 50 * SECTOR_SIZE;
    let n = fs.write_at(&file, &payload, offset).unwrap();
    assert_eq!(n, 512);
    assert_eq!(fs.length(&file).unwrap(), offset + 512);

    let mut readback = [0u8; 512];
    let n = fs.read_at(&file, &mut readback, offset).unwrap();
    assert_eq!(n, 512);
    assert_eq!(readback, payload);

    fs.close(file);
}

#[test]
fn removal_of_open_file_defers_teardown() {
    let fs = fresh_fs(4096);
    let path = Path::parse("/doomed").unwrap();
    let file = fs.create(&path, 0).unwrap();
    fs.write_at(&file, b"still here", 0).unwrap();

    fs.remove(&path).unwrap();
    assert!(fs.open(&path).is_err());

    let mut buf = [0u8; 10];
    fs.read_at(&file, &mut buf, 0).unwrap();
    assert_eq!(&buf, b"still here");

    fs.close(file);
}

#[test]
fn non_empty_mkdir_rejection() {
    let fs = fresh_fs(4096);
    fs.mkdir(&Path::parse("/a").unwrap()).unwrap();
    fs.mkdir(&Path::parse("/a/b").unwrap()).unwrap();

    assert!(fs.remove(&Path::parse("/a").unwrap()).is_err());

    fs.remove(&Path::parse("/a/b").unwrap()).unwrap();
    fs.remove(&Path::parse("/a").unwrap()).unwrap();
}

#[test]
fn concurrent_extension_from_two_threads() {
    let fs = Arc::new(fresh_fs(4096));
    let path = Path::parse("/shared").unwrap();
    let initial = fs.create(&path, 0).unwrap();
    fs.close(initial);

    let fs_a = fs.clone();
    let path_a = path.clone();
    let a = thread::spawn(move || {
        let file = fs_a.open(&path_a).unwrap();
        let data = vec![1u8; 512];
        fs_a.write_at(&file, &data, 0).unwrap();
        fs_a.close(file);
    });

    let fs_b = fs.clone();
    let path_b = path.clone();
    let b = thread::spawn(move || {
        let file = fs_b.open(&path_b).unwrap();
        let data = vec![2u8; 512];
        fs_b.write_at(&file, &data, 1024).unwrap();
        fs_b.close(file);
    });

    a.join().unwrap();
    b.join().unwrap();

    let file = fs.open(&path).unwrap();
    assert_eq!(fs.length(&file).unwrap(), 1536);

    let mut first = [0u8; 512];
    fs.read_at(&file, &mut first, 0).unwrap();
    assert_eq!(first, [1u8; 512]);

    let mut second = [0u8; 512];
    fs.read_at(&file, &mut second, 1024).unwrap();
    assert_eq!(second, [2u8; 512]);

    fs.close(file);
}

#[test]
fn last_direct_and_first_single_indirect_sector_are_both_reachable() {
    // Sector 49 (the 50th, 0-indexed) is the last direct block; sector 50 is
    // the first one routed through the single-indirect block.
    let fs = fresh_fs(4096);
    let path = Path::parse("/boundary").unwrap();
    let file = fs.create(&path, 0).unwrap();

    let last_direct_offset = 49 * SECTOR_SIZE;
    let first_indirect_offset = 50 * SECTOR_SIZE;
    fs.write_at(&file, &[1u8; 512], last_direct_offset).unwrap();
    fs.write_at(&file, &[2u8; 512], first_indirect_offset).unwrap();

    let mut a = [0u8; 512];
    fs.read_at(&file, &mut a, last_direct_offset).unwrap();
    assert_eq!(a, [1u8; 512]);

    let mut b = [0u8; 512];
    fs.read_at(&file, &mut b, first_indirect_offset).unwrap();
    assert_eq!(b, [2u8; 512]);

    fs.close(file);
}

#[test]
fn last_single_indirect_and_first_double_indirect_sector_are_both_reachable() {
    // Single-indirect fan-out covers 50 + 74*126 = 9,374 sectors (0-indexed
    // up to 9,373); sector index 9,374 is the first one reached through the
    // double-indirect block.
    let fs = fresh_fs(10_000);
    let path = Path::parse("/deep").unwrap();
    let file = fs.create(&path, 0).unwrap();

    let last_single_index: u64 = 50 + 74 * 126 - 1;
    let first_double_index: u64 = 50 + 74 * 126;
    let last_single_offset = last_single_index * SECTOR_SIZE;
    let first_double_offset = first_double_index * SECTOR_SIZE;

    fs.write_at(&file, &[3u8; 512], last_single_offset).unwrap();
    fs.write_at(&file, &[4u8; 512], first_double_offset).unwrap();

    let mut a = [0u8; 512];
    fs.read_at(&file, &mut a, last_single_offset).unwrap();
    assert_eq!(a, [3u8; 512]);

    let mut b = [0u8; 512];
    fs.read_at(&file, &mut b, first_double_offset).unwrap();
    assert_eq!(b, [4u8; 512]);

    assert_eq!(fs.length(&file).unwrap(), first_double_offset + 512);

    fs.close(file);
}

#[test]
fn removed_file_sectors_are_reclaimed_on_last_close() {
    // Sized so that a second file of the same footprint only fits if the
    // first file's sectors were actually returned to the allocator: 3
    // reserved (free-map, root inode, one bitmap sector) + 1 root-directory
    // data sector + 11 sectors per file (1 inode + 10 data) leaves no slack
    // for a leaked first file.
    let fs = fresh_fs(20);
    let path = Path::parse("/reclaim").unwrap();
    let file = fs.create(&path, 0).unwrap();
    fs.write_at(&file, &[9u8; 512 * 10], 0).unwrap();
    fs.remove(&path).unwrap();
    fs.close(file);

    // Creating a new file of the same size must succeed, proving the
    // previous file's data sectors were actually returned to the allocator
    // rather than leaked.
    let path2 = Path::parse("/reclaim2").unwrap();
    let file2 = fs.create(&path2, 512 * 10).unwrap();
    assert_eq!(fs.length(&file2).unwrap(), 512 * 10);
    fs.close(file2);
}

#[test]
fn random_writes_match_a_shadow_buffer() {
    let fs = fresh_fs(4096);
    let path = Path::parse("/fuzzed").unwrap();
    let file = fs.create(&path, 0).unwrap();

    let mut rng = rand::thread_rng();
    let mut shadow: Vec<u8> = Vec::new();

    for _ in 0..200 {
        let offset = rng.gen_range(0..4096u64);
        let len = rng.gen_range(1..256usize);
        let byte = rng.gen::<u8>();
        let chunk = vec![byte; len];

        fs.write_at(&file, &chunk, offset).unwrap();

        let end = offset as usize + len;
        if shadow.len() < end {
            shadow.resize(end, 0);
        }
        shadow[offset as usize..end].copy_from_slice(&chunk);
    }

    let mut readback = vec![0u8; shadow.len()];
    fs.read_at(&file, &mut readback, 0).unwrap();
    assert_eq!(readback, shadow);
    assert_eq!(fs.length(&file).unwrap(), shadow.len() as u64);

    fs.close(file);
}
