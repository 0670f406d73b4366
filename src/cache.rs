//! Write-back sector buffer cache.
//!
//! A bounded pool of cache entries, each a private readers/writer/evictor
//! state machine, linked into one global MRU-ordered list. Lookups and list
//! membership changes are serialized by the list's own lock (`LRU_lock`);
//! payload access to a given entry's bytes is serialized by that entry's own
//! lock, never across device I/O.
//!
//! Two condition variables resolve three classes of waiter on one entry:
//! ordinary readers/in-place writers (*shared*), and the single evictor that
//! may be rebinding the entry to a new sector (*exclusive*). A shared
//! acquirer waits on `share_cond` while any exclusive activity is pending or
//! in progress; the exclusive acquirer waits on `exclude_cond` while any
//! activity at all — shared or exclusive — is outstanding. Releasing
//! exclusive access hands off to a queued evictor (`exclude_cond`, one
//! waiter) if one exists, otherwise wakes every blocked shared waiter
//! (`share_cond`, broadcast); releasing the last shared access wakes a
//! blocked evictor, if any.

use std::cell::UnsafeCell;
use std::collections::VecDeque;
use std::sync::{Arc, Condvar, Mutex};

use log::{debug, trace};

use crate::device::{BlockDevice, Sector, SectorId};
use crate::error::{FsError, FsResult};
use crate::param::{MAX_CACHE_ENTRIES, SECTOR_SIZE};

struct Counters {
    /// `None` means the entry holds no sector (post-flush, or never filled).
    sector_id: Option<SectorId>,
    dirty: bool,
    share_active: u32,
    share_wait: u32,
    exclude_active: u32,
    exclude_wait: u32,
}

impl Counters {
    const fn new() -> Self {
        Self {
            sector_id: None,
            dirty: false,
            share_active: 0,
            share_wait: 0,
            exclude_active: 0,
            exclude_wait: 0,
        }
    }
}

/// One resident copy of a sector plus its synchronization state.
pub struct CacheEntry {
    counters: Mutex<Counters>,
    share_cond: Condvar,
    exclude_cond: Condvar,
    data: UnsafeCell<Sector>,
}

// SAFETY: `data` is only read or written while the accessor holds shared or
// exclusive access, as tracked by `counters`. Shared accessors never mutate
// concurrently with each other or with an exclusive accessor; there is at
// most one exclusive accessor at a time and it never overlaps a shared one.
unsafe impl Sync for CacheEntry {}

impl CacheEntry {
    fn new(sector_id: SectorId, data: Sector) -> Self {
        Self {
            counters: Mutex::new(Counters {
                sector_id: Some(sector_id),
                ..Counters::new()
            }),
            share_cond: Condvar::new(),
            exclude_cond: Condvar::new(),
            data: UnsafeCell::new(data),
        }
    }

    fn current_sector(&self) -> Option<SectorId> {
        self.counters.lock().unwrap().sector_id
    }

    /// Blocks until shared access is granted, then grants it.
    fn begin_shared(&self) {
        let mut c = self.counters.lock().unwrap();
        while c.exclude_wait + c.exclude_active > 0 {
            c.share_wait += 1;
            c = self.share_cond.wait(c).unwrap();
            c.share_wait -= 1;
        }
        c.share_active += 1;
    }

    fn end_shared(&self) {
        let mut c = self.counters.lock().unwrap();
        c.share_active -= 1;
        if c.share_active == 0 && c.exclude_wait > 0 {
            self.exclude_cond.notify_one();
        }
    }

    /// Marks this entry as a pending evictor so that newcomers queue behind
    /// it, without yet blocking for the activity to drain.
    fn mark_exclude_wait(&self) {
        self.counters.lock().unwrap().exclude_wait += 1;
    }

    /// Blocks until every other shared and exclusive activity has drained,
    /// then transitions the already-marked `exclude_wait` into
    /// `exclude_active`. Returns the entry's state just before the
    /// transition, for the caller to decide whether to flush.
    fn wait_for_exclusive(&self) -> (Option<SectorId>, bool) {
        let mut c = self.counters.lock().unwrap();
        while c.share_active + c.exclude_active > 0 {
            c = self.exclude_cond.wait(c).unwrap();
        }
        c.exclude_wait -= 1;
        c.exclude_active += 1;
        (c.sector_id, c.dirty)
    }

    /// Releases exclusive access. The entry has just been rebound (or
    /// invalidated) and has no logical continuity with whatever waiters
    /// queued behind the prior occupant, so every counter resets to zero
    /// after handing off to at most one class of waiter.
    fn end_exclusive(&self) {
        let mut c = self.counters.lock().unwrap();
        c.exclude_active -= 1;
        if c.exclude_wait > 0 {
            self.exclude_cond.notify_one();
        } else if c.share_wait > 0 {
            self.share_cond.notify_all();
        }
        c.share_wait = 0;
        c.share_active = 0;
        c.exclude_wait = 0;
        c.exclude_active = 0;
    }

    fn set_bound(&self, sector_id: SectorId, data: &Sector) {
        // SAFETY: called only while this entry is held exclusively.
        unsafe {
            *self.data.get() = *data;
        }
        let mut c = self.counters.lock().unwrap();
        c.sector_id = Some(sector_id);
        c.dirty = false;
    }

    fn invalidate(&self) {
        // SAFETY: called only while this entry is held exclusively.
        unsafe {
            *self.data.get() = [0u8; SECTOR_SIZE];
        }
        let mut c = self.counters.lock().unwrap();
        c.sector_id = None;
        c.dirty = false;
    }
}

/// Bounded write-back cache of sector contents.
pub struct BufferCache<D> {
    device: Arc<D>,
    /// MRU-ordered handle list; front is most recently used. Protected as a
    /// unit (`LRU_lock`); individual entries carry their own lock besides.
    lru: Mutex<VecDeque<Arc<CacheEntry>>>,
}

impl<D: BlockDevice> BufferCache<D> {
    pub fn new(device: Arc<D>) -> Self {
        Self {
            device,
            lru: Mutex::new(VecDeque::new()),
        }
    }

    fn touch(&self, entry: &Arc<CacheEntry>) {
        let mut lru = self.lru.lock().unwrap();
        if lru.len() > 1 {
            if let Some(pos) = lru.iter().position(|e| Arc::ptr_eq(e, entry)) {
                let e = lru.remove(pos).unwrap();
                lru.push_front(e);
            }
        }
    }

    fn lookup(&self, sector_id: SectorId) -> Option<Arc<CacheEntry>> {
        let mut lru = self.lru.lock().unwrap();
        let pos = lru.iter().position(|e| e.current_sector() == Some(sector_id))?;
        let entry = lru.remove(pos).unwrap();
        lru.push_front(entry.clone());
        Some(entry)
    }

    /// Inserts a freshly filled entry, unless a duplicate was concurrently
    /// inserted by another thread between the miss and this call — in which
    /// case the duplicate wins and the fresh entry is discarded (Q1).
    fn insert_new(&self, sector_id: SectorId, data: &Sector) -> Arc<CacheEntry> {
        let fresh = Arc::new(CacheEntry::new(sector_id, *data));
        let mut lru = self.lru.lock().unwrap();
        if let Some(pos) = lru.iter().position(|e| e.current_sector() == Some(sector_id)) {
            let existing = lru.remove(pos).unwrap();
            lru.push_front(existing.clone());
            return existing;
        }
        lru.push_front(fresh.clone());
        fresh
    }

    /// Picks an eviction victim under the LRU lock: the least-recently-used
    /// entry with no exclusive activity pending, or the tail unconditionally
    /// if none qualifies. Marks it as excluded before releasing the lock so
    /// newcomers queue behind it.
    fn select_victim(&self) -> Arc<CacheEntry> {
        let lru = self.lru.lock().unwrap();
        let victim = lru
            .iter()
            .rev()
            .find(|e| {
                let c = e.counters.lock().unwrap();
                c.exclude_active + c.exclude_wait == 0
            })
            .cloned()
            .unwrap_or_else(|| lru.back().expect("cache full implies non-empty").clone());
        victim.mark_exclude_wait();
        victim
    }

    fn evict_and_rebind(&self, victim: Arc<CacheEntry>, sector_id: SectorId, data: &Sector) -> FsResult<()> {
        let (old_sector, was_dirty) = victim.wait_for_exclusive();
        if was_dirty {
            if let Some(old) = old_sector {
                // SAFETY: exclusive access held; no other accessor can touch `data`.
                let snapshot = unsafe { *victim.data.get() };
                self.device.write(old, &snapshot).map_err(|_| FsError::IoFail)?;
                debug!("evicted dirty sector {} to make room for {}", old.raw(), sector_id.raw());
            }
        }
        victim.set_bound(sector_id, data);
        self.touch(&victim);
        victim.end_exclusive();
        Ok(())
    }

    fn get_entry(&self, sector_id: SectorId) -> FsResult<Arc<CacheEntry>> {
        if sector_id.raw() as u64 >= self.device.sector_count() {
            return Err(FsError::IoFail);
        }
        if let Some(entry) = self.lookup(sector_id) {
            return Ok(entry);
        }

        let mut buf = [0u8; SECTOR_SIZE];
        self.device.read(sector_id, &mut buf).map_err(|_| FsError::IoFail)?;

        let occupied = self.lru.lock().unwrap().len();
        if occupied < MAX_CACHE_ENTRIES {
            Ok(self.insert_new(sector_id, &buf))
        } else {
            let victim = self.select_victim();
            self.evict_and_rebind(victim.clone(), sector_id, &buf)?;
            Ok(victim)
        }
    }

    /// Reads the current contents of `sector_id` into `out`.
    pub fn read(&self, sector_id: SectorId, out: &mut Sector) -> FsResult<()> {
        loop {
            let entry = self.get_entry(sector_id)?;
            entry.begin_shared();
            if entry.current_sector() != Some(sector_id) {
                // Rebound out from under us between lookup and grant; retry.
                entry.end_shared();
                trace!("stale-miss on sector {}, retrying", sector_id.raw());
                continue;
            }
            // SAFETY: shared access held, and the sector id was just confirmed.
            unsafe {
                out.copy_from_slice(&*entry.data.get());
            }
            entry.end_shared();
            self.touch(&entry);
            return Ok(());
        }
    }

    /// Atomically replaces the contents of `sector_id` with `data` and marks
    /// the entry dirty. Durability is deferred to eviction or `flush_all`.
    pub fn write(&self, sector_id: SectorId, data: &Sector) -> FsResult<()> {
        loop {
            let entry = self.get_entry(sector_id)?;
            entry.begin_shared();
            if entry.current_sector() != Some(sector_id) {
                entry.end_shared();
                trace!("stale-miss on sector {}, retrying", sector_id.raw());
                continue;
            }
            // SAFETY: shared access held, and the sector id was just confirmed.
            unsafe {
                *entry.data.get() = *data;
            }
            entry.counters.lock().unwrap().dirty = true;
            entry.end_shared();
            self.touch(&entry);
            return Ok(());
        }
    }

    /// Writes every dirty entry back to the device, then drops every entry
    /// from the cache entirely so the next access is a genuine miss. Used at
    /// shutdown and by diagnostics/tests.
    pub fn flush_all(&self) -> FsResult<()> {
        let entries: Vec<Arc<CacheEntry>> = self.lru.lock().unwrap().drain(..).collect();
        for entry in entries {
            entry.mark_exclude_wait();
            let (sector_id, dirty) = entry.wait_for_exclusive();
            if dirty {
                if let Some(s) = sector_id {
                    // SAFETY: exclusive access held.
                    let snapshot = unsafe { *entry.data.get() };
                    self.device.write(s, &snapshot).map_err(|_| FsError::IoFail)?;
                }
            }
            entry.invalidate();
            entry.end_exclusive();
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn entry_count(&self) -> usize {
        self.lru.lock().unwrap().len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::device::MemDevice;
    use std::sync::Barrier;
    use std::thread;

    fn device(sectors: usize) -> Arc<MemDevice> {
        Arc::new(MemDevice::new(sectors))
    }

    #[test]
    fn write_then_read_without_flush_sees_the_write() {
        let cache = BufferCache::new(device(8));
        let data = [7u8; SECTOR_SIZE];
        cache.write(SectorId::new(2), &data).unwrap();
        let mut out = [0u8; SECTOR_SIZE];
        cache.read(SectorId::new(2), &mut out).unwrap();
        assert_eq!(out, data);
    }

    #[test]
    fn write_is_deferred_until_eviction_or_flush() {
        let dev = device(8);
        let cache = BufferCache::new(dev.clone());
        let data = [9u8; SECTOR_SIZE];
        cache.write(SectorId::new(0), &data).unwrap();
        assert_eq!(dev.writes(), 0, "write-back cache must not write through immediately");
        cache.flush_all().unwrap();
        assert_eq!(dev.writes(), 1);
        let mut raw = [0u8; SECTOR_SIZE];
        dev.read(SectorId::new(0), &mut raw).unwrap();
        assert_eq!(raw, data);
    }

    #[test]
    fn lru_eviction_flushes_only_the_dirty_victim() {
        let dev = device(MAX_CACHE_ENTRIES + 1);
        let cache = BufferCache::new(dev.clone());
        // Fill the cache with writes, in order: each push-to-front leaves
        // sector 0 (written first) at the tail, i.e. the LRU victim, already
        // dirty.
        for i in 0..MAX_CACHE_ENTRIES {
            cache.write(SectorId::new(i as u32), &[1u8; SECTOR_SIZE]).unwrap();
        }
        assert_eq!(cache.entry_count(), MAX_CACHE_ENTRIES);

        let writes_before = dev.writes();
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(SectorId::new(MAX_CACHE_ENTRIES as u32), &mut buf).unwrap();

        assert_eq!(cache.entry_count(), MAX_CACHE_ENTRIES);
        assert_eq!(dev.writes() - writes_before, 1, "eviction of a dirty entry must flush it");

        let mut flushed = [0u8; SECTOR_SIZE];
        dev.read(SectorId::new(0), &mut flushed).unwrap();
        assert_eq!(flushed, [1u8; SECTOR_SIZE]);
    }

    #[test]
    fn touch_moves_entry_to_front_so_it_survives_eviction() {
        let dev = device(MAX_CACHE_ENTRIES + 1);
        let cache = BufferCache::new(dev);
        let mut buf = [0u8; SECTOR_SIZE];
        for i in 0..MAX_CACHE_ENTRIES {
            cache.read(SectorId::new(i as u32), &mut buf).unwrap();
        }
        // Re-touch sector 0 so it is no longer the LRU victim.
        cache.read(SectorId::new(0), &mut buf).unwrap();
        cache.read(SectorId::new(MAX_CACHE_ENTRIES as u32), &mut buf).unwrap();
        // Sector 0 must still be resident (a later lookup is a hit, i.e. the
        // cache's entry count does not grow past capacity).
        assert_eq!(cache.entry_count(), MAX_CACHE_ENTRIES);
        cache.read(SectorId::new(0), &mut buf).unwrap();
        assert_eq!(cache.entry_count(), MAX_CACHE_ENTRIES);
    }

    #[test]
    fn out_of_range_sector_fails_without_touching_cache() {
        let cache = BufferCache::new(device(4));
        let mut buf = [0u8; SECTOR_SIZE];
        assert_eq!(cache.read(SectorId::new(99), &mut buf), Err(FsError::IoFail));
        assert_eq!(cache.entry_count(), 0);
    }

    #[test]
    fn flush_all_invalidates_so_the_next_access_rereads_the_device() {
        let dev = device(4);
        let cache = BufferCache::new(dev.clone());
        let mut buf = [0u8; SECTOR_SIZE];
        cache.read(SectorId::new(0), &mut buf).unwrap();
        let reads_before = dev.reads();
        cache.flush_all().unwrap();
        assert_eq!(cache.entry_count(), 0);
        cache.read(SectorId::new(0), &mut buf).unwrap();
        assert_eq!(dev.reads() - reads_before, 1);
    }

    #[test]
    fn concurrent_readers_of_the_same_sector_see_identical_bytes() {
        let dev = device(4);
        let cache = Arc::new(BufferCache::new(dev));
        cache.write(SectorId::new(0), &[5u8; SECTOR_SIZE]).unwrap();

        let barrier = Arc::new(Barrier::new(4));
        let handles: Vec<_> = (0..4)
            .map(|_| {
                let cache = cache.clone();
                let barrier = barrier.clone();
                thread::spawn(move || {
                    barrier.wait();
                    let mut out = [0u8; SECTOR_SIZE];
                    cache.read(SectorId::new(0), &mut out).unwrap();
                    out
                })
            })
            .collect();
        for h in handles {
            assert_eq!(h.join().unwrap(), [5u8; SECTOR_SIZE]);
        }
    }
}
