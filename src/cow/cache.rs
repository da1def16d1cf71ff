//! Fully-associative cache of leaf blocks, private to one redo log.
//!
//! Each entry pins while metadata writes against it are in flight
//! (`pending_writers`); eviction never selects a pinned entry, and readers
//! that need a stable view sleep on the entry's condvar until the writers
//! drain.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tracing::debug;

use crate::cow::format::LEAF_BYTES;
use crate::error::{CowError, Result};
use crate::io::sg::SECTOR_SIZE;
use crate::io::FileIo;

/// Associative capacity of the cache.
pub const LEAF_CACHE_ENTRIES: usize = 32;
/// Longest a lookup waits for pending writers to drain.
pub const CACHE_WAIT_TIMEOUT: Duration = Duration::from_millis(5000);

/// How a lookup intends to use the entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum LookupMode {
    /// Fill the entry from the file on a miss.
    Read,
    /// Claim the entry without reading; the caller provides the contents.
    AllocateOnly,
}

/// Interior of one cache entry, all guarded by the entry lock.
pub struct LeafSlot {
    /// Sector of the leaf this entry holds, or `None` while empty.
    pub sector: Option<u32>,
    /// LRU clock value of the last touch.
    pub last_touch: u64,
    /// Metadata writes in flight against this leaf; pins the entry.
    pub pending_writers: u32,
    /// Leaf bytes.
    pub data: Box<[u8]>,
}

/// One cache entry: lock-guarded slot plus the writer-drain condvar.
pub struct CacheEntry {
    slot: Mutex<LeafSlot>,
    writers_gone: Condvar,
    index: usize,
}

impl CacheEntry {
    fn new(index: usize) -> Arc<Self> {
        Arc::new(Self {
            slot: Mutex::new(LeafSlot {
                sector: None,
                last_touch: 0,
                pending_writers: 0,
                data: vec![0u8; LEAF_BYTES].into_boxed_slice(),
            }),
            writers_gone: Condvar::new(),
            index,
        })
    }

    /// Locks the slot.
    pub fn lock(&self) -> parking_lot::MutexGuard<'_, LeafSlot> {
        self.slot.lock()
    }

    /// Position of this entry in the cache; the eviction tie-breaker.
    pub fn index(&self) -> usize {
        self.index
    }

    /// Marks a metadata write in flight against this leaf.
    pub fn pin(&self) {
        self.slot.lock().pending_writers += 1;
    }

    /// Releases one pin and wakes sleepers when the last writer drains.
    pub fn unpin(&self) {
        let mut slot = self.slot.lock();
        debug_assert!(slot.pending_writers > 0);
        slot.pending_writers = slot.pending_writers.saturating_sub(1);
        if slot.pending_writers == 0 {
            self.writers_gone.notify_all();
        }
    }

    /// Reads one mapping entry under the entry lock.
    pub fn entry_at(&self, pos: usize) -> u32 {
        crate::cow::format::leaf_entry(&self.slot.lock().data, pos)
    }
}

/// Point-in-time cache counters.
#[derive(Clone, Copy, Debug, Default)]
pub struct CacheStatsSnapshot {
    /// Total lookups.
    pub lookups: u64,
    /// Lookups satisfied without touching the file.
    pub hits: u64,
    /// Leaf blocks read from the file on a miss.
    pub fills: u64,
}

#[derive(Default)]
struct CacheStats {
    lookups: AtomicU64,
    hits: AtomicU64,
    fills: AtomicU64,
}

/// The per-redo-log leaf cache.
pub struct LeafCache {
    entries: Vec<Arc<CacheEntry>>,
    /// Serializes scans and victim claims; never held across file I/O.
    scan: Mutex<()>,
    clock: AtomicU64,
    stats: CacheStats,
}

impl LeafCache {
    /// Allocates the cache with all entries empty.
    pub fn new() -> Self {
        Self {
            entries: (0..LEAF_CACHE_ENTRIES).map(CacheEntry::new).collect(),
            scan: Mutex::new(()),
            clock: AtomicU64::new(0),
            stats: CacheStats::default(),
        }
    }

    /// Looks up the leaf at `sector`.
    ///
    /// On a hit with `wait_for_writers`, sleeps on the entry condvar until
    /// `pending_writers` reaches zero (bounded by [`CACHE_WAIT_TIMEOUT`]).
    /// On a miss, evicts the least-recently-touched unpinned entry and, in
    /// [`LookupMode::Read`], synchronously fills it from `file`. A fill
    /// error leaves the entry empty and is surfaced verbatim.
    pub fn lookup(
        &self,
        file: &dyn FileIo,
        sector: u32,
        mode: LookupMode,
        wait_for_writers: bool,
    ) -> Result<Arc<CacheEntry>> {
        loop {
            let lookups = self.stats.lookups.fetch_add(1, Ordering::Relaxed) + 1;
            if lookups % 5000 == 0 {
                debug!(
                    lookups,
                    hits = self.stats.hits.load(Ordering::Relaxed),
                    fills = self.stats.fills.load(Ordering::Relaxed),
                    "leaf cache statistics"
                );
            }
            let tick = self.clock.fetch_add(1, Ordering::Relaxed) + 1;

            let scan = self.scan.lock();
            if let Some(entry) = self.find(sector) {
                drop(scan);
                let mut slot = entry.lock();
                if wait_for_writers {
                    let deadline = Instant::now() + CACHE_WAIT_TIMEOUT;
                    while slot.pending_writers > 0 {
                        if entry
                            .writers_gone
                            .wait_until(&mut slot, deadline)
                            .timed_out()
                        {
                            return Err(CowError::NoResources("leaf writer drain timed out"));
                        }
                    }
                }
                if slot.sector != Some(sector) {
                    // Evicted while we slept on the writers; start over.
                    continue;
                }
                slot.last_touch = tick;
                drop(slot);
                self.stats.hits.fetch_add(1, Ordering::Relaxed);
                return Ok(entry);
            }

            let victim = self.select_victim()?;
            // Reserve the sector while still under the scan lock; a
            // concurrent lookup now hits this entry and blocks on its lock
            // until the fill below finishes, instead of claiming a second
            // victim for the same leaf.
            let mut slot = victim.lock();
            slot.sector = Some(sector);
            slot.last_touch = tick;
            slot.pending_writers = 0;
            drop(scan);

            if mode == LookupMode::Read {
                let off = sector as u64 * SECTOR_SIZE;
                if let Err(err) = file.read_at(off, &mut slot.data) {
                    debug!(sector, "leaf fill failed");
                    slot.sector = None;
                    return Err(err);
                }
                self.stats.fills.fetch_add(1, Ordering::Relaxed);
            }
            drop(slot);
            return Ok(victim);
        }
    }

    fn find(&self, sector: u32) -> Option<Arc<CacheEntry>> {
        self.entries
            .iter()
            .find(|entry| entry.lock().sector == Some(sector))
            .cloned()
    }

    fn select_victim(&self) -> Result<Arc<CacheEntry>> {
        let mut best: Option<(u64, Arc<CacheEntry>)> = None;
        for entry in &self.entries {
            let slot = entry.lock();
            if slot.pending_writers > 0 {
                continue;
            }
            // Strict comparison keeps the lowest index on equal touches.
            match &best {
                Some((touch, _)) if slot.last_touch >= *touch => {}
                _ => best = Some((slot.last_touch, Arc::clone(entry))),
            }
        }
        best.map(|(_, entry)| entry)
            .ok_or(CowError::NoResources("all leaf cache entries are pinned"))
    }

    /// Snapshot of the counters.
    pub fn stats(&self) -> CacheStatsSnapshot {
        CacheStatsSnapshot {
            lookups: self.stats.lookups.load(Ordering::Relaxed),
            hits: self.stats.hits.load(Ordering::Relaxed),
            fills: self.stats.fills.load(Ordering::Relaxed),
        }
    }

    /// Sum of `pending_writers` over all entries.
    pub fn pinned_writers(&self) -> u32 {
        self.entries
            .iter()
            .map(|entry| entry.lock().pending_writers)
            .sum()
    }
}

impl Default for LeafCache {
    fn default() -> Self {
        Self::new()
    }
}
