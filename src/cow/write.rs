//! Write path: translate the guest scatter list against the topmost redo
//! log, issue the coalesced data write, then drive the per-command state
//! machine through the cache update and the durable metadata write.

use bytes::Bytes;
use parking_lot::Mutex;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{debug, warn};

use crate::cow::chain::Level;
use crate::cow::continuation::Continuation;
use crate::cow::format::{set_leaf_entry, LEAF_FANOUT};
use crate::cow::redo::{RedoState, WriteEdits};
use crate::error::{CowError, Result};
use crate::io::exec::{IoExecutor, IoOp, IoPayload, IoRequest, IoToken, ScsiStatus};
use crate::io::sg::{write_scatter_slice, FileSeg, FileSg, GuestMem, GuestSg, SECTOR_SIZE};

/// States of one guest write command, in progression order.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum IoState {
    /// Command constructed, nothing issued.
    Initialized,
    /// Data write submitted to the file layer.
    DataWriteInProgress,
    /// Data write completed.
    DataWriteDone,
    /// Queued on the ready/active queues for metadata writeback.
    WaitingForMdIo,
    /// Mapping edits applied to the in-memory leaves.
    CacheUpdateDone,
    /// Metadata write submitted.
    MetadataWriteInProgress,
    /// Terminal state.
    MetadataWriteDone,
}

/// One guest write flowing through the state machine.
pub struct WriteCommand {
    pub(crate) redo: Option<Arc<RedoState>>,
    pub(crate) file: Arc<dyn crate::io::FileIo>,
    pub(crate) parent: Arc<IoToken>,
    pub(crate) state: Mutex<IoState>,
    pub(crate) edits: Mutex<WriteEdits>,
    pub(crate) pass: Mutex<Option<crate::sync::ReadPass>>,
    pub(crate) exec: Arc<IoExecutor>,
}

impl WriteCommand {
    /// Current state.
    pub fn state(&self) -> IoState {
        *self.state.lock()
    }

    fn set_state(&self, next: IoState) {
        *self.state.lock() = next;
    }
}

/// Translates a guest scatter list against the top level, reserving grains
/// and recording mapping edits. On failure any pins already taken are
/// released; already reserved sectors stay allocated (a benign leak that
/// recovery tolerates).
pub(crate) fn prepare_write(
    top: &Level,
    chain_sectors: u64,
    sg: &GuestSg,
) -> Result<(FileSg, WriteEdits)> {
    let mut edits = WriteEdits::default();
    match prepare_write_inner(top, chain_sectors, sg, &mut edits) {
        Ok(data_sg) => Ok((data_sg, edits)),
        Err(err) => {
            edits.release_pins();
            Err(err)
        }
    }
}

fn prepare_write_inner(
    top: &Level,
    chain_sectors: u64,
    sg: &GuestSg,
    edits: &mut WriteEdits,
) -> Result<FileSg> {
    let granularity = top.redo.as_ref().map_or(1, |redo| redo.granularity());
    let grain_bytes = granularity as u64 * SECTOR_SIZE;
    let disk_bytes = chain_sectors * SECTOR_SIZE;
    let mut data_sg = FileSg::default();

    for seg in &sg.segs {
        if seg.disk_off % SECTOR_SIZE != 0 || seg.len as u64 % SECTOR_SIZE != 0 {
            return Err(CowError::BadParam("request not sector aligned"));
        }
        if seg.disk_off + seg.len as u64 > disk_bytes {
            return Err(CowError::LimitExceeded("request past end of disk"));
        }

        let mut block_number = seg.disk_off / grain_bytes;
        let mut block_offset = seg.disk_off % grain_bytes;
        let mut bytes_left = seg.len;
        while bytes_left > 0 {
            let to_xfer = ((grain_bytes - block_offset) as usize).min(bytes_left);
            let grain_base = (block_number as u32) * granularity;
            let file_off = match &top.redo {
                Some(redo) => {
                    let phys = redo.translate_write(grain_base, edits)?;
                    phys * SECTOR_SIZE + block_offset
                }
                None => block_number * grain_bytes + block_offset,
            };
            data_sg.push_coalesce(FileSeg {
                file_off,
                mem_off: seg.mem_off + (seg.len - bytes_left),
                len: to_xfer,
            })?;
            bytes_left -= to_xfer;
            block_number += 1;
            block_offset = 0;
        }
    }
    Ok(data_sg)
}

/// Issues an asynchronous guest write. Completion callbacks drive the rest
/// of the state machine; issue failures complete the token with a host
/// error, like any other transport failure.
pub(crate) fn async_write(
    top: Level,
    chain_sectors: u64,
    exec: Arc<IoExecutor>,
    mem: Arc<GuestMem>,
    sg: &GuestSg,
    token: Arc<IoToken>,
    pass: crate::sync::ReadPass,
) -> Result<()> {
    let (data_sg, edits) = prepare_write(&top, chain_sectors, sg)?;

    if data_sg.is_empty() {
        debug_assert!(edits.is_empty());
        token.finish(ScsiStatus::GOOD);
        drop(pass);
        return Ok(());
    }

    let cmd = Arc::new(WriteCommand {
        redo: top.redo.clone(),
        file: Arc::clone(&top.file),
        parent: Arc::clone(&token),
        state: Mutex::new(IoState::Initialized),
        edits: Mutex::new(edits),
        pass: Mutex::new(Some(pass)),
        exec: Arc::clone(&exec),
    });

    let child = IoToken::new();
    child.set_continuation(Continuation::DataWrite(DataWrite {
        cmd: Arc::clone(&cmd),
    }));
    cmd.set_state(IoState::DataWriteInProgress);
    let submit = exec.submit(IoRequest {
        file: Arc::clone(&top.file),
        op: IoOp::Write,
        payload: IoPayload::Guest { mem, sg: data_sg },
        token: child,
    });
    if submit.is_err() {
        warn!("data write submission failed");
        cmd.parent.set_result(ScsiStatus::HOST_ERROR);
        complete_command(&cmd);
    }
    Ok(())
}

/// Continuation of the guest data write.
pub(crate) struct DataWrite {
    pub(crate) cmd: Arc<WriteCommand>,
}

impl DataWrite {
    pub(crate) fn run(self, _token: &Arc<IoToken>, status: ScsiStatus) {
        let cmd = self.cmd;
        debug_assert_eq!(cmd.state(), IoState::DataWriteInProgress);
        cmd.set_state(IoState::DataWriteDone);
        cmd.parent.set_result_if_ok(status);

        let pure_hit = cmd.edits.lock().is_empty();
        if pure_hit || !status.is_ok() {
            // Cache hits carry no metadata delta; failed data writes must
            // not persist their mapping.
            complete_command(&cmd);
            return;
        }

        let redo = Arc::clone(cmd.redo.as_ref().expect("mapping edits imply a redo log"));
        {
            let mut queues = redo.queues();
            cmd.set_state(IoState::WaitingForMdIo);
            queues.ready.push_back(Arc::clone(&cmd));
            if !queues.active.is_empty() {
                // The in-flight drain picks this command up later.
                return;
            }
            while let Some(next) = queues.ready.pop_front() {
                queues.active.push_back(next);
            }
        }
        drain_active(&redo);
    }
}

/// Continuation of the metadata write.
pub(crate) struct MetadataWrite {
    pub(crate) cmd: Arc<WriteCommand>,
}

impl MetadataWrite {
    pub(crate) fn run(self, _token: &Arc<IoToken>, status: ScsiStatus) {
        let cmd = self.cmd;
        debug_assert_eq!(cmd.state(), IoState::MetadataWriteInProgress);
        if !status.is_ok() {
            warn!("metadata write failed; on-disk mapping is stale until recovery");
        }
        cmd.parent.set_result(status);
        let redo = Arc::clone(cmd.redo.as_ref().expect("metadata write has a redo log"));
        complete_command(&cmd);

        {
            let mut queues = redo.queues();
            if queues.active.is_empty() {
                while let Some(next) = queues.ready.pop_front() {
                    queues.active.push_back(next);
                }
            }
        }
        promote_head(&redo);
    }
}

/// Batch walk used by data-write completion after it splices the ready
/// queue onto an empty active queue: promotes every command still waiting
/// for metadata I/O, in queue order — apply its cache update, then issue
/// its metadata write. The claim (cache update plus state transition)
/// runs under the queue lock so concurrent completion threads never
/// promote the same command twice. An issue failure completes that
/// command with an error and the walk moves on to the next waiter.
fn drain_active(redo: &Arc<RedoState>) {
    loop {
        let candidate = {
            let queues = redo.queues();
            let cand = queues
                .active
                .iter()
                .find(|cmd| cmd.state() == IoState::WaitingForMdIo)
                .cloned();
            if let Some(cmd) = &cand {
                apply_cache_update(redo.granularity(), queues.next_free, &cmd.edits.lock());
                cmd.set_state(IoState::CacheUpdateDone);
            }
            cand
        };
        let Some(cmd) = candidate else { break };
        let _ = issue_metadata_write(redo, &cmd);
    }
}

/// Single promotion used by metadata-write completion: if the entry now at
/// the head of the active queue is still waiting, promote it and nothing
/// else. Each completion advances the pipeline by exactly one command, so
/// per redo log the chained metadata writes stay strictly serial. An issue
/// failure completes the head with an error and leaves the queue, so only
/// then does the new head get its turn; at most one write is ever issued.
fn promote_head(redo: &Arc<RedoState>) {
    loop {
        let candidate = {
            let queues = redo.queues();
            match queues.active.front() {
                Some(cmd) if cmd.state() == IoState::WaitingForMdIo => {
                    apply_cache_update(redo.granularity(), queues.next_free, &cmd.edits.lock());
                    cmd.set_state(IoState::CacheUpdateDone);
                    Some(Arc::clone(cmd))
                }
                _ => None,
            }
        };
        let Some(cmd) = candidate else { break };
        if issue_metadata_write(redo, &cmd).is_ok() {
            break;
        }
    }
}

fn issue_metadata_write(redo: &Arc<RedoState>, cmd: &Arc<WriteCommand>) -> std::result::Result<(), ()> {
    debug_assert_eq!(cmd.state(), IoState::CacheUpdateDone);
    let bufs = snapshot_leaves(&cmd.edits.lock());
    cmd.set_state(IoState::MetadataWriteInProgress);
    redo.counters.md_writes.fetch_add(1, Ordering::Relaxed);

    let md_token = IoToken::new();
    md_token.set_continuation(Continuation::MetadataWrite(MetadataWrite {
        cmd: Arc::clone(cmd),
    }));
    let submit = cmd.exec.submit(IoRequest {
        file: Arc::clone(&cmd.file),
        op: IoOp::Write,
        payload: IoPayload::Owned { bufs },
        token: md_token,
    });
    if submit.is_err() {
        warn!("metadata write submission failed");
        cmd.parent.set_result(ScsiStatus::HOST_ERROR);
        complete_command(cmd);
        return Err(());
    }
    Ok(())
}

/// Applies a command's mapping edits to the in-memory leaves, under each
/// entry's lock, validating that every grain lies below the free pointer.
pub(crate) fn apply_cache_update(granularity: u32, next_free: u32, edits: &WriteEdits) {
    for leaf in &edits.leaves {
        let mut slot = leaf.entry.lock();
        debug_assert_eq!(slot.sector, Some(leaf.leaf_sector));
        for edit in &leaf.edits {
            if edit.grain_sector + granularity > next_free {
                warn!(
                    grain = edit.grain_sector,
                    next_free, "mapping points past the free pointer"
                );
            }
            let grain = edit.virt_sector / granularity;
            let pos = (grain as usize) % LEAF_FANOUT;
            set_leaf_entry(&mut slot.data, pos, edit.grain_sector);
        }
    }
}

/// Snapshots the pages of every affected leaf into a gather list.
fn snapshot_leaves(edits: &WriteEdits) -> Vec<(u64, Bytes)> {
    edits
        .leaves
        .iter()
        .map(|leaf| {
            let slot = leaf.entry.lock();
            (
                leaf.leaf_sector as u64 * SECTOR_SIZE,
                Bytes::copy_from_slice(&slot.data),
            )
        })
        .collect()
}

/// Completes a guest write: finishes the token, releases the chain pass,
/// dequeues the command and unpins its leaves.
fn complete_command(cmd: &Arc<WriteCommand>) {
    cmd.set_state(IoState::MetadataWriteDone);
    cmd.parent.finish_stored();
    cmd.pass.lock().take();
    if let Some(redo) = &cmd.redo {
        let mut queues = redo.queues();
        queues.active.retain(|queued| !Arc::ptr_eq(queued, cmd));
        queues.ready.retain(|queued| !Arc::ptr_eq(queued, cmd));
    }
    cmd.edits.lock().release_pins();
    debug!("write command completed");
}

/// Synchronous write of `data` at the guest scatter positions: data write,
/// cache update and metadata writeback all inline. Used by the token-less
/// path and by commit when the destination is itself a redo log.
pub(crate) fn sync_write_slice(
    top: &Level,
    chain_sectors: u64,
    data: &[u8],
    sg: &GuestSg,
) -> Result<()> {
    let (data_sg, mut edits) = prepare_write(top, chain_sectors, sg)?;

    if let Err(err) = write_scatter_slice(top.file.as_ref(), data, &data_sg) {
        warn!(error = %err, "synchronous data write failed");
        edits.release_pins();
        return Err(CowError::Write("data write failed"));
    }

    if edits.is_empty() {
        return Ok(());
    }
    let redo = top.redo.as_ref().expect("mapping edits imply a redo log");
    apply_cache_update(redo.granularity(), redo.next_free(), &edits);
    let mut writeback = Ok(());
    for leaf in &edits.leaves {
        let slot = leaf.entry.lock();
        if let Err(err) = top
            .file
            .write_at(leaf.leaf_sector as u64 * SECTOR_SIZE, &slot.data)
        {
            warn!(error = %err, "synchronous metadata write failed");
            writeback = Err(CowError::MetadataWrite("leaf writeback failed"));
            break;
        }
    }
    if writeback.is_ok() {
        redo.counters.md_writes.fetch_add(1, Ordering::Relaxed);
    }
    edits.release_pins();
    writeback
}

/// Synchronous guest write from a shared memory image.
pub(crate) fn sync_write(
    top: &Level,
    chain_sectors: u64,
    mem: &GuestMem,
    sg: &GuestSg,
) -> Result<()> {
    mem.with_slice(|data| sync_write_slice(top, chain_sectors, data, sg))
}
