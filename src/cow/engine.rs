//! Process-wide registry of open hierarchies: a fixed-size handle table
//! whose opaque IDs reject stale references, plus the public I/O entry
//! points.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cow::chain::Chain;
use crate::cow::redo::RedoStatsSnapshot;
use crate::cow::{commit, read, write};
use crate::error::{CowError, Result};
use crate::io::exec::{IoExecutor, IoOp, IoToken};
use crate::io::sg::{GuestMem, GuestSg, SECTOR_SIZE};
use crate::io::FileIo;

/// Slots in the handle table.
pub const HANDLE_TABLE_SIZE: usize = 512;

const DEFAULT_IO_THREADS: usize = 4;

/// Opaque chain handle: `slot + k * HANDLE_TABLE_SIZE`, with `k` bumped on
/// every reuse of the slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct HandleId(pub u64);

impl std::fmt::Display for HandleId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

struct HandleSlot {
    id: u64,
    in_use: bool,
    chain: Option<Arc<Chain>>,
}

/// Location of one virtual sector, resolved through the chain.
#[derive(Clone, Copy, Debug)]
pub struct BlockLocation {
    /// Chain level that owns the sector (0 is the base).
    pub level: usize,
    /// Physical sector in that level's file, or `None` for a zero region.
    pub file_sector: Option<u64>,
    /// How many following virtual sectors stay contiguous in that file.
    pub length: u32,
}

/// The copy-on-write disk engine: handle table plus the I/O executor that
/// drives completion callbacks.
pub struct CowEngine {
    slots: Mutex<Vec<HandleSlot>>,
    exec: Arc<IoExecutor>,
}

impl CowEngine {
    /// Engine with the default number of I/O worker threads.
    pub fn new() -> Self {
        Self::with_io_threads(DEFAULT_IO_THREADS)
    }

    /// Engine with an explicit worker count.
    pub fn with_io_threads(threads: usize) -> Self {
        Self {
            slots: Mutex::new(
                (0..HANDLE_TABLE_SIZE)
                    .map(|idx| HandleSlot {
                        id: idx as u64,
                        in_use: false,
                        chain: None,
                    })
                    .collect(),
            ),
            exec: IoExecutor::new(threads),
        }
    }

    /// Opens a hierarchy of image files, base first, and returns its
    /// handle. A failure on any level fails the whole open.
    pub fn open_hierarchy(&self, files: Vec<Arc<dyn FileIo>>) -> Result<HandleId> {
        let (slot_idx, id) = self.allocate_slot()?;
        match Chain::open(files, id) {
            Ok(chain) => {
                let mut slots = self.slots.lock();
                slots[slot_idx].chain = Some(Arc::new(chain));
                info!(handle = id, "opened hierarchy");
                Ok(HandleId(id))
            }
            Err(err) => {
                let mut slots = self.slots.lock();
                slots[slot_idx].in_use = false;
                slots[slot_idx].chain = None;
                Err(err)
            }
        }
    }

    /// Closes a hierarchy. Refuses with `Busy` while any redo log still
    /// has queued metadata commands; otherwise persists clean-close
    /// headers and frees the slot.
    pub fn close_hierarchy(&self, handle: HandleId) -> Result<()> {
        let chain = self.chain(handle)?;
        // The busy probe runs before the exclusive pass: in-flight commands
        // hold shared passes, so taking exclusivity first would wait for the
        // very work the caller is supposed to see as Busy.
        if chain
            .levels()
            .iter()
            .filter_map(|level| level.redo.as_ref())
            .any(|redo| redo.has_queued_commands())
        {
            return Err(CowError::Busy("metadata commands still queued"));
        }
        let result = {
            // Guest I/O in flight holds shared passes; close must not wait
            // behind it, it must refuse.
            let Some(_exclusive) = chain.lock.try_write_pass() else {
                return Err(CowError::Busy("guest I/O still in flight"));
            };
            let levels = chain.levels();
            let mut first_err = None;
            for (idx, level) in levels.iter().enumerate() {
                if let Some(redo) = &level.redo {
                    if let Err(err) = redo.close() {
                        warn!(level = idx, error = %err, "failed to close redo log");
                        first_err.get_or_insert(err);
                    }
                }
            }
            match first_err {
                Some(err) => Err(err),
                None => Ok(()),
            }
        };

        let mut slots = self.slots.lock();
        let slot = &mut slots[(handle.0 as usize) % HANDLE_TABLE_SIZE];
        slot.in_use = false;
        slot.chain = None;
        info!(handle = %handle, "closed hierarchy");
        result
    }

    /// Issues an asynchronous scatter-gather read or write. The token
    /// completes from an executor thread; issue-time validation failures
    /// are returned directly instead.
    pub fn async_io(
        &self,
        handle: HandleId,
        op: IoOp,
        mem: &Arc<GuestMem>,
        sg: &GuestSg,
        token: &Arc<IoToken>,
    ) -> Result<()> {
        let chain = self.chain(handle)?;
        let pass = chain.lock.read_pass();
        self.count_op(&chain);
        match op {
            IoOp::Read => read::async_read(
                chain.levels(),
                chain.num_sectors(),
                Arc::clone(&self.exec),
                Arc::clone(mem),
                sg,
                Arc::clone(token),
                pass,
            ),
            IoOp::Write => write::async_write(
                chain.top(),
                chain.num_sectors(),
                Arc::clone(&self.exec),
                Arc::clone(mem),
                sg,
                Arc::clone(token),
                pass,
            ),
        }
    }

    /// Synchronous read or write; metadata updates are persisted inline.
    pub fn sync_io(
        &self,
        handle: HandleId,
        op: IoOp,
        mem: &GuestMem,
        sg: &GuestSg,
    ) -> Result<()> {
        let chain = self.chain(handle)?;
        let _pass = chain.lock.read_pass();
        self.count_op(&chain);
        match op {
            IoOp::Read => read::sync_read(&chain.levels(), chain.num_sectors(), mem, sg),
            IoOp::Write => write::sync_write(&chain.top(), chain.num_sectors(), mem, sg),
        }
    }

    /// Merges the grains of redo log `level` down into `level - 1` for the
    /// fraction window `[start_fraction, end_fraction)` of the root table
    /// (percent). Restartable from any committed fraction.
    pub fn commit(
        &self,
        handle: HandleId,
        level: usize,
        start_fraction: u32,
        end_fraction: u32,
    ) -> Result<()> {
        let chain = self.chain(handle)?;
        commit::commit(&chain, level, start_fraction, end_fraction)
    }

    /// Removes `level - 1` from the chain after a full commit of `level`.
    pub fn splice_parent(&self, handle: HandleId, level: usize) -> Result<()> {
        let chain = self.chain(handle)?;
        commit::splice_parent(&chain, level)
    }

    /// Virtual size of the chain in bytes plus its block size.
    pub fn capacity(&self, handle: HandleId) -> Result<(u64, u32)> {
        let chain = self.chain(handle)?;
        Ok((chain.num_sectors() * SECTOR_SIZE, chain.block_size()))
    }

    /// Resolves a virtual sector to the image holding it and probes how
    /// far the mapping stays contiguous.
    pub fn block_offset(&self, handle: HandleId, sector: u32) -> Result<BlockLocation> {
        let chain = self.chain(handle)?;
        let _pass = chain.lock.read_pass();
        if sector as u64 >= chain.num_sectors() {
            return Err(CowError::LimitExceeded("sector past end of disk"));
        }
        let levels = chain.levels();
        let first = read::resolve(&levels, sector)?;
        let (level, file_sector) = match first {
            Some((level, phys)) => (level, Some(phys)),
            None => (0, None),
        };

        let mut length = 1u32;
        if let Some(base) = file_sector {
            while ((sector + length) as u64) < chain.num_sectors() {
                match read::resolve(&levels, sector + length)? {
                    Some((lvl, phys)) if lvl == level && phys == base + length as u64 => {
                        length += 1;
                    }
                    _ => break,
                }
            }
        }
        Ok(BlockLocation {
            level,
            file_sector,
            length,
        })
    }

    /// Number of images in the chain.
    pub fn file_count(&self, handle: HandleId) -> Result<usize> {
        Ok(self.chain(handle)?.level_count())
    }

    /// Statistics of the redo log at `level`.
    pub fn redo_stats(&self, handle: HandleId, level: usize) -> Result<RedoStatsSnapshot> {
        let chain = self.chain(handle)?;
        let levels = chain.levels();
        let level = levels.get(level).ok_or(CowError::BadParam("no such level"))?;
        let redo = level
            .redo
            .as_ref()
            .ok_or(CowError::BadParam("level is not a redo log"))?;
        Ok(redo.stats())
    }

    fn count_op(&self, chain: &Chain) {
        if let Some(redo) = &chain.top().redo {
            redo.counters
                .ops
                .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
        }
    }

    fn chain(&self, handle: HandleId) -> Result<Arc<Chain>> {
        let slots = self.slots.lock();
        let slot = &slots[(handle.0 as usize) % HANDLE_TABLE_SIZE];
        if slot.id != handle.0 || !slot.in_use {
            debug!(handle = %handle, "stale or unused handle");
            return Err(CowError::InvalidHandle);
        }
        slot.chain.clone().ok_or(CowError::InvalidHandle)
    }

    fn allocate_slot(&self) -> Result<(usize, u64)> {
        let mut slots = self.slots.lock();
        for (idx, slot) in slots.iter_mut().enumerate() {
            if !slot.in_use {
                slot.id += HANDLE_TABLE_SIZE as u64;
                slot.in_use = true;
                slot.chain = None;
                return Ok((idx, slot.id));
            }
        }
        warn!("handle table exhausted");
        Err(CowError::LimitExceeded("no free chain handles"))
    }
}

impl Default for CowEngine {
    fn default() -> Self {
        Self::new()
    }
}
