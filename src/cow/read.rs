//! Read path: translate each grain slice of the guest scatter list from
//! the top of the chain down, zero-fill what no level maps, and issue the
//! per-level scatter reads in parallel.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::warn;

use crate::cow::chain::Level;
use crate::cow::continuation::Continuation;
use crate::cow::redo::ReadTranslate;
use crate::error::{CowError, Result};
use crate::io::exec::{FanoutOutcome, IoExecutor, IoOp, IoPayload, IoRequest, IoToken, ScsiStatus};
use crate::io::sg::{read_scatter, FileSeg, FileSg, GuestMem, GuestSg, SECTOR_SIZE};
use crate::sync::ReadPass;

/// Builds one scatter list per chain level. Regions no level maps are
/// zero-filled in place and produce no I/O.
pub(crate) fn prepare_read(
    levels: &[Level],
    chain_sectors: u64,
    mem: &GuestMem,
    sg: &GuestSg,
) -> Result<Vec<Option<FileSg>>> {
    let granularity = levels
        .iter()
        .rev()
        .find_map(|level| level.redo.as_ref().map(|redo| redo.granularity()))
        .unwrap_or(1);
    let grain_bytes = granularity as u64 * SECTOR_SIZE;
    let disk_bytes = chain_sectors * SECTOR_SIZE;
    let mut ios: Vec<Option<FileSg>> = levels.iter().map(|_| None).collect();

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
            let mem_off = seg.mem_off + (seg.len - bytes_left);
            let grain_base = (block_number as u32) * granularity;

            match resolve(levels, grain_base)? {
                Some((level_idx, phys_sector)) => {
                    let file_off = phys_sector * SECTOR_SIZE + block_offset;
                    ios[level_idx]
                        .get_or_insert_with(FileSg::default)
                        .push_coalesce(FileSeg {
                            file_off,
                            mem_off,
                            len: to_xfer,
                        })?;
                }
                None => mem.fill(mem_off, to_xfer, 0),
            }

            bytes_left -= to_xfer;
            block_number += 1;
            block_offset = 0;
        }
    }
    Ok(ios)
}

/// Walks the chain from the top, returning the first level that maps the
/// sector. A plain base is an unconditional hit at identity offsets; `None`
/// means the region reads as zeros.
pub(crate) fn resolve(levels: &[Level], sector: u32) -> Result<Option<(usize, u64)>> {
    for (idx, level) in levels.iter().enumerate().rev() {
        match &level.redo {
            Some(redo) => match redo.translate_read(sector)? {
                ReadTranslate::Mapped(phys) => return Ok(Some((idx, phys))),
                ReadTranslate::NotHere => continue,
            },
            None => {
                debug_assert_eq!(idx, 0, "plain image is only legal as the base");
                return Ok(Some((idx, sector as u64)));
            }
        }
    }
    Ok(None)
}

/// Shared tail of a split read: the chain pass released when the parent
/// completes.
pub(crate) struct ReadShared {
    pass: Mutex<Option<ReadPass>>,
}

/// Continuation of one per-level child read.
pub(crate) struct ReadChild {
    pub(crate) parent: Arc<IoToken>,
    pub(crate) shared: Arc<ReadShared>,
}

impl ReadChild {
    pub(crate) fn run(self, _token: &Arc<IoToken>, status: ScsiStatus) {
        if let FanoutOutcome::Completed(final_status) = self.parent.fanout_child_done(status) {
            self.parent.finish(final_status);
            self.shared.pass.lock().take();
        }
    }
}

/// Issues an asynchronous guest read as one child I/O per level that owns
/// data, completing the parent when the last child lands.
pub(crate) fn async_read(
    levels: Vec<Level>,
    chain_sectors: u64,
    exec: Arc<IoExecutor>,
    mem: Arc<GuestMem>,
    sg: &GuestSg,
    token: Arc<IoToken>,
    pass: ReadPass,
) -> Result<()> {
    let ios = prepare_read(&levels, chain_sectors, mem.as_ref(), sg)?;
    let total = ios.iter().filter(|io| io.is_some()).count() as u32;
    if total == 0 {
        token.finish(ScsiStatus::GOOD);
        drop(pass);
        return Ok(());
    }

    token.begin_fanout(total);
    let shared = Arc::new(ReadShared {
        pass: Mutex::new(Some(pass)),
    });

    let mut issued = 0u32;
    for (idx, io) in ios.into_iter().enumerate() {
        let Some(file_sg) = io else { continue };
        let child = IoToken::new();
        child.set_continuation(Continuation::ReadChild(ReadChild {
            parent: Arc::clone(&token),
            shared: Arc::clone(&shared),
        }));
        let submit = exec.submit(IoRequest {
            file: Arc::clone(&levels[idx].file),
            op: IoOp::Read,
            payload: IoPayload::Guest {
                mem: Arc::clone(&mem),
                sg: file_sg,
            },
            token: child,
        });
        if submit.is_err() {
            // No further children launch; the ones already in flight (if
            // any) drive the parent to completion.
            warn!(level = idx, "read child submission failed");
            if let FanoutOutcome::Completed(final_status) = token.fanout_abandon(issued) {
                token.finish(final_status);
                shared.pass.lock().take();
            }
            break;
        }
        issued += 1;
    }
    Ok(())
}

/// Synchronous guest read: per-level scatter reads issued inline, top
/// levels first.
pub(crate) fn sync_read(
    levels: &[Level],
    chain_sectors: u64,
    mem: &GuestMem,
    sg: &GuestSg,
) -> Result<()> {
    let ios = prepare_read(levels, chain_sectors, mem, sg)?;
    for (idx, io) in ios.iter().enumerate().rev() {
        let Some(file_sg) = io else { continue };
        read_scatter(levels[idx].file.as_ref(), mem, file_sg).map_err(|err| {
            warn!(level = idx, error = %err, "synchronous read failed");
            CowError::Read("data read failed")
        })?;
    }
    Ok(())
}
