//! Per-redo-log in-memory state: the decoded header fields, the owned root
//! table, the leaf cache, the metadata ordering queues and the free-sector
//! allocator.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::cow::cache::{CacheEntry, CacheStatsSnapshot, LeafCache, LookupMode};
use crate::cow::format::{
    self, Header, FREE_SPACE_MARGIN_BYTES, LEAF_BYTES, LEAF_FANOUT, LEAF_SECTORS,
    MAX_REDO_LOG_BYTES, SIZE_INCREMENT_SECTORS,
};
use crate::error::{CowError, Result};
use crate::io::sg::SECTOR_SIZE;
use crate::io::{FileAttrs, FileIo, SET_LENGTH};

/// One grain mapping recorded by write-translate, applied to the in-memory
/// leaf only after the data write succeeds.
#[derive(Clone, Copy, Debug)]
pub struct GrainEdit {
    /// Virtual sector that was written (grain aligned).
    pub virt_sector: u32,
    /// Newly reserved grain sector in the redo-log file.
    pub grain_sector: u32,
}

/// Pending edits against one leaf-cache entry; holding this pins the entry.
pub struct LeafEdit {
    /// The cache entry carrying the leaf.
    pub entry: Arc<CacheEntry>,
    /// File sector of the leaf, for the metadata writeback.
    pub leaf_sector: u32,
    /// Grain mappings to apply.
    pub edits: Vec<GrainEdit>,
}

/// The metadata delta of one write command, grouped by leaf.
#[derive(Default)]
pub struct WriteEdits {
    /// One record per distinct leaf.
    pub leaves: Vec<LeafEdit>,
}

impl WriteEdits {
    /// True when the command reused existing grains only.
    pub fn is_empty(&self) -> bool {
        self.leaves.is_empty()
    }

    fn record(&mut self, entry: &Arc<CacheEntry>, leaf_sector: u32, edit: GrainEdit) {
        for leaf in &mut self.leaves {
            if Arc::ptr_eq(&leaf.entry, entry) {
                leaf.edits.push(edit);
                return;
            }
        }
        entry.pin();
        self.leaves.push(LeafEdit {
            entry: Arc::clone(entry),
            leaf_sector,
            edits: vec![edit],
        });
    }

    /// Releases every pin taken by [`WriteEdits::record`].
    pub fn release_pins(&mut self) {
        for leaf in self.leaves.drain(..) {
            leaf.entry.unpin();
        }
    }
}

/// Queues and allocator state guarded by the queue lock.
pub struct MdQueues {
    /// Commands whose data write finished, not yet being drained.
    pub ready: VecDeque<Arc<crate::cow::write::WriteCommand>>,
    /// Commands currently owned by the drain pipeline.
    pub active: VecDeque<Arc<crate::cow::write::WriteCommand>>,
    /// Next free sector in the redo-log file.
    pub next_free: u32,
    /// Allocated sectors of the file.
    pub alloc_sectors: u32,
    /// Whether `next_free` moved since open; forces a header rewrite.
    pub free_sector_changed: bool,
}

/// Counters exported for diagnostics.
#[derive(Default)]
pub struct RedoCounters {
    /// Leaf allocations (zeroed leaf plus root-table writes).
    pub leaf_inits: AtomicU64,
    /// Metadata writebacks issued.
    pub md_writes: AtomicU64,
    /// Guest commands routed through this log.
    pub ops: AtomicU64,
}

/// Point-in-time statistics for one redo log.
#[derive(Clone, Copy, Debug, Default)]
pub struct RedoStatsSnapshot {
    /// Leaf cache counters.
    pub cache: CacheStatsSnapshot,
    /// Leaf allocations.
    pub leaf_inits: u64,
    /// Metadata writebacks issued.
    pub md_writes: u64,
    /// Guest commands routed through this log.
    pub ops: u64,
    /// Current `pending_writers` total across cache entries.
    pub pinned_writers: u32,
    /// Current free-sector pointer.
    pub next_free: u32,
}

/// Result of translating a sector against one redo log.
pub enum ReadTranslate {
    /// The log does not map this sector.
    NotHere,
    /// Physical sector in this log's file.
    Mapped(u64),
}

/// In-memory state of one open redo log.
pub struct RedoState {
    /// Backing file.
    pub file: Arc<dyn FileIo>,
    flags: AtomicU32,
    granularity: u32,
    num_sectors: u32,
    root_offset: u32,
    num_root_entries: u32,
    saved_generation: u32,
    root: RwLock<Vec<u32>>,
    /// Leaf cache for this log.
    pub cache: LeafCache,
    queues: Mutex<MdQueues>,
    /// Diagnostic counters.
    pub counters: RedoCounters,
}

impl RedoState {
    /// Opens a redo log: reads and validates the header and root table,
    /// initializes the cache, and runs recovery when the image was not
    /// closed cleanly.
    pub fn open(file: Arc<dyn FileIo>) -> Result<Arc<RedoState>> {
        let header = Header::load(file.as_ref())?;
        let expected = format::required_root_entries(header.num_sectors, header.granularity)?;
        if expected != header.num_root_entries {
            warn!(
                expected,
                stored = header.num_root_entries,
                "root entry count mismatch"
            );
            return Err(CowError::MetadataRead("root entry count mismatch"));
        }
        if header.root_offset < (format::HEADER_BYTES as u64 / SECTOR_SIZE) as u32 {
            return Err(CowError::Corruption("root table overlaps header"));
        }

        let mut table = vec![0u8; header.num_root_entries as usize * 4];
        file.read_at(header.root_offset as u64 * SECTOR_SIZE, &mut table)
            .map_err(|_| CowError::MetadataRead("root table read failed"))?;
        let root = format::decode_root_table(&table, header.num_root_entries as usize);

        let attrs = file.attrs()?;
        let data_start = format::data_start_sector(header.num_root_entries);
        let clean = header.saved_generation == attrs.generation
            && header.free_sector as u64 * SECTOR_SIZE <= attrs.length;
        let next_free = if clean {
            header.free_sector
        } else if header.saved_generation == 0 && header.free_sector == 0 {
            // Created by a tool that stamps neither field; nothing was
            // ever allocated, so start at the data area.
            warn!(
                generation = attrs.generation,
                "unstamped image, assuming newly created disk"
            );
            data_start
        } else {
            warn!(
                saved = header.saved_generation,
                generation = attrs.generation,
                "redo log was not closed cleanly, scanning metadata"
            );
            // The clamp keeps an empty root table from yielding a pointer
            // below the data area.
            check_metadata(file.as_ref(), &root, header.granularity, attrs.length)?
                .max(data_start)
        };

        debug!(
            num_sectors = header.num_sectors,
            granularity = header.granularity,
            next_free,
            "opened redo log"
        );

        Ok(Arc::new(RedoState {
            file,
            flags: AtomicU32::new(header.flags),
            granularity: header.granularity,
            num_sectors: header.num_sectors,
            root_offset: header.root_offset,
            num_root_entries: header.num_root_entries,
            saved_generation: attrs.generation,
            root: RwLock::new(root),
            cache: LeafCache::new(),
            queues: Mutex::new(MdQueues {
                ready: VecDeque::new(),
                active: VecDeque::new(),
                next_free,
                alloc_sectors: (attrs.length / SECTOR_SIZE) as u32,
                free_sector_changed: false,
            }),
            counters: RedoCounters::default(),
        }))
    }

    /// Closes the log: refuses while metadata commands are queued, then
    /// rewrites the header when the generation moved or the free pointer
    /// changed.
    pub fn close(&self) -> Result<()> {
        let (next_free, free_sector_changed) = {
            let queues = self.queues.lock();
            if !queues.ready.is_empty() || !queues.active.is_empty() {
                warn!("close attempted before metadata commands drained");
                return Err(CowError::Busy("metadata commands still queued"));
            }
            (queues.next_free, queues.free_sector_changed)
        };

        let attrs = self.file.attrs()?;
        if self.saved_generation != attrs.generation || free_sector_changed {
            let mut header = Header::load(self.file.as_ref())?;
            header.saved_generation = attrs.generation;
            header.free_sector = next_free;
            header.flags = self.flags.load(Ordering::Relaxed);
            header
                .store(self.file.as_ref())
                .map_err(|_| CowError::MetadataWrite("header rewrite failed"))?;
            debug!(
                generation = attrs.generation,
                next_free, "persisted clean-close header"
            );
        }
        Ok(())
    }

    /// True when the queues hold work; used by the busy check.
    pub fn has_queued_commands(&self) -> bool {
        let queues = self.queues.lock();
        !queues.ready.is_empty() || !queues.active.is_empty()
    }

    /// Grain size in sectors.
    pub fn granularity(&self) -> u32 {
        self.granularity
    }

    /// Virtual disk size in sectors.
    pub fn num_sectors(&self) -> u32 {
        self.num_sectors
    }

    /// Current flag bits.
    pub fn flags(&self) -> u32 {
        self.flags.load(Ordering::Relaxed)
    }

    /// Sets flag bits (splice marks the child a root).
    pub fn set_flags(&self, bits: u32) {
        self.flags.fetch_or(bits, Ordering::Relaxed);
    }

    /// Locks the queue state.
    pub fn queues(&self) -> parking_lot::MutexGuard<'_, MdQueues> {
        self.queues.lock()
    }

    /// Number of root-table entries.
    pub fn root_entry_count(&self) -> u32 {
        self.num_root_entries
    }

    /// Reads the root entry for `idx`, if the table covers it.
    pub fn root_entry(&self, idx: usize) -> Option<u32> {
        self.root.read().get(idx).copied()
    }

    /// Translates a virtual sector for a read. Never mutates state beyond
    /// the cache; a leaf miss fills synchronously from the file.
    pub fn translate_read(&self, sector: u32) -> Result<ReadTranslate> {
        let grain = sector / self.granularity;
        let root_idx = (grain as usize) / LEAF_FANOUT;
        let leaf_pos = (grain as usize) % LEAF_FANOUT;
        let intra = sector % self.granularity;

        let leaf_sector = match self.root_entry(root_idx) {
            None | Some(0) => return Ok(ReadTranslate::NotHere),
            Some(sector) => sector,
        };

        let entry = self
            .cache
            .lookup(self.file.as_ref(), leaf_sector, LookupMode::Read, true)?;
        let mapped = entry.entry_at(leaf_pos);
        if mapped == 0 {
            return Ok(ReadTranslate::NotHere);
        }
        debug_assert!(mapped < self.queues.lock().next_free);
        Ok(ReadTranslate::Mapped(mapped as u64 + intra as u64))
    }

    /// Translates a virtual sector for a write against this (topmost) log,
    /// allocating a leaf and/or a grain as needed. A fresh grain is
    /// recorded in `edits` and applied to the in-memory leaf only after the
    /// guest data write succeeds.
    pub fn translate_write(&self, sector: u32, edits: &mut WriteEdits) -> Result<u64> {
        let grain = sector / self.granularity;
        let root_idx = (grain as usize) / LEAF_FANOUT;
        let leaf_pos = (grain as usize) % LEAF_FANOUT;
        let intra = sector % self.granularity;

        if root_idx >= self.num_root_entries as usize {
            return Err(CowError::MetadataRead("sector beyond root table"));
        }

        let entry = match self.root_entry(root_idx) {
            Some(0) => self.allocate_leaf(root_idx)?,
            Some(leaf_sector) => {
                self.cache
                    .lookup(self.file.as_ref(), leaf_sector, LookupMode::Read, false)?
            }
            None => return Err(CowError::MetadataRead("sector beyond root table")),
        };
        let leaf_sector = self
            .root_entry(root_idx)
            .expect("root entry present after allocation");

        let mapped = entry.entry_at(leaf_pos);
        if mapped != 0 {
            debug_assert!(mapped < self.queues.lock().next_free);
            return Ok(mapped as u64 + intra as u64);
        }

        let grain_sector = self.allocate_sectors(self.granularity)?;
        edits.record(
            &entry,
            leaf_sector,
            GrainEdit {
                virt_sector: sector - intra,
                grain_sector,
            },
        );
        Ok(grain_sector as u64 + intra as u64)
    }

    /// Allocates a leaf for `root_idx`: reserves sectors, claims and zeroes
    /// a cache slot, persists the zeroed leaf and the updated root table,
    /// and only then publishes the in-memory root entry.
    fn allocate_leaf(&self, root_idx: usize) -> Result<Arc<CacheEntry>> {
        let mut root = self.root.write();
        if root[root_idx] != 0 {
            // Another writer allocated the leaf while we waited.
            let leaf_sector = root[root_idx];
            drop(root);
            return self
                .cache
                .lookup(self.file.as_ref(), leaf_sector, LookupMode::Read, false);
        }

        let leaf_sector = self.allocate_sectors(LEAF_SECTORS)?;
        let entry =
            self.cache
                .lookup(self.file.as_ref(), leaf_sector, LookupMode::AllocateOnly, false)?;
        {
            let mut slot = entry.lock();
            slot.data.fill(0);
        }
        self.file
            .write_at(leaf_sector as u64 * SECTOR_SIZE, &vec![0u8; LEAF_BYTES])
            .map_err(|_| CowError::MetadataWrite("leaf init write failed"))?;

        let mut staged = root.clone();
        staged[root_idx] = leaf_sector;
        self.file
            .write_at(
                self.root_offset as u64 * SECTOR_SIZE,
                &format::encode_root_table(&staged),
            )
            .map_err(|_| CowError::MetadataWrite("root table write failed"))?;
        root[root_idx] = leaf_sector;
        self.counters.leaf_inits.fetch_add(1, Ordering::Relaxed);
        debug!(root_idx, leaf_sector, "allocated leaf");
        Ok(entry)
    }

    /// Reserves `count` sectors, growing the file by fixed increments when
    /// the reservation passes the allocated length.
    pub fn allocate_sectors(&self, count: u32) -> Result<u32> {
        let mut queues = self.queues.lock();
        queues.free_sector_changed = true;
        if queues.next_free + count > queues.alloc_sectors {
            let mut grown = queues.alloc_sectors;
            while queues.next_free + count > grown {
                grown += SIZE_INCREMENT_SECTORS;
            }
            let new_len = grown as u64 * SECTOR_SIZE;
            if new_len > MAX_REDO_LOG_BYTES
                || MAX_REDO_LOG_BYTES - new_len < FREE_SPACE_MARGIN_BYTES
            {
                warn!(grown, "redo log reached its size ceiling");
                return Err(CowError::LimitExceeded("redo log file is full"));
            }
            self.file.set_attrs(
                SET_LENGTH,
                &FileAttrs {
                    length: new_len,
                    ..Default::default()
                },
            )?;
            queues.alloc_sectors = grown;
            debug!(alloc_sectors = grown, "extended redo log file");
        }
        let start = queues.next_free;
        queues.next_free += count;
        debug_assert!(queues.next_free <= queues.alloc_sectors);
        Ok(start)
    }

    /// Current free-sector pointer.
    pub fn next_free(&self) -> u32 {
        self.queues.lock().next_free
    }

    /// Statistics snapshot.
    pub fn stats(&self) -> RedoStatsSnapshot {
        RedoStatsSnapshot {
            cache: self.cache.stats(),
            leaf_inits: self.counters.leaf_inits.load(Ordering::Relaxed),
            md_writes: self.counters.md_writes.load(Ordering::Relaxed),
            ops: self.counters.ops.load(Ordering::Relaxed),
            pinned_writers: self.cache.pinned_writers(),
            next_free: self.next_free(),
        }
    }
}

/// Recovery scan after an unclean shutdown: recomputes the free pointer
/// from what is actually referenced on disk and counts structural
/// corruption. Never writes.
fn check_metadata(
    file: &dyn FileIo,
    root: &[u32],
    granularity: u32,
    length: u64,
) -> Result<u32> {
    let mut max_sector: u32 = 0;
    let mut bad_roots = 0u32;
    let mut bad_leaves = 0u32;
    let mut leaf = vec![0u8; LEAF_BYTES];

    for (idx, &entry) in root.iter().enumerate() {
        if entry == 0 {
            continue;
        }
        if entry as u64 * SECTOR_SIZE >= length {
            if bad_roots < 4 {
                warn!(idx, entry, length, "root entry points past allocated length");
            }
            bad_roots += 1;
        }
        file.read_at(entry as u64 * SECTOR_SIZE, &mut leaf)
            .map_err(|_| CowError::MetadataRead("leaf read failed during recovery"))?;
        max_sector = max_sector.max(entry + LEAF_SECTORS);

        for pos in 0..LEAF_FANOUT {
            let mapped = format::leaf_entry(&leaf, pos);
            if mapped == 0 {
                continue;
            }
            let end = mapped + granularity;
            if end as u64 * SECTOR_SIZE > length {
                if bad_leaves < 4 {
                    warn!(pos, mapped, length, "leaf entry points past allocated length");
                }
                bad_leaves += 1;
            }
            max_sector = max_sector.max(end);
        }
    }

    info!(
        next_free = max_sector,
        bad_roots, bad_leaves, "recovery recomputed free pointer"
    );
    Ok(max_sector)
}
