//! Online commit: merge the grains of one redo log down into its parent,
//! restartable by root-table fraction, followed by the chain splice that
//! drops the consumed parent.

use std::sync::Arc;

use tracing::{debug, info, warn};

use crate::cow::chain::{Chain, Level};
use crate::cow::format::{self, Header, COW_FLAG_ROOT, LEAF_BYTES, LEAF_FANOUT};
use crate::cow::write;
use crate::error::{CowError, Result};
use crate::io::sg::{GuestSg, SECTOR_SIZE};
use crate::io::{SET_GENERATION, SET_TOOLS_VERSION, SET_VIRTUAL_HW_VERSION};

/// Fractions are percentages of the root table.
pub const COMMIT_MAX_FRACTION: u32 = 100;
/// Longest run of grains moved in one I/O.
pub const COMMIT_RUN_GRAINS: usize = 512;

/// Copies every grain of redo log `level` within the fraction window into
/// `level - 1`, at its virtual position. Runs under the shared chain pass;
/// only the splice needs exclusivity.
///
/// Before the first write the parent's generation is frozen by rewriting
/// its attributes with the same value, so re-running a prefix is a no-op.
/// At `end_fraction == 100` the parent inherits the child's generation and
/// version attributes, making incremental commits detectable.
pub(crate) fn commit(
    chain: &Arc<Chain>,
    level: usize,
    start_fraction: u32,
    end_fraction: u32,
) -> Result<()> {
    if level < 1 {
        return Err(CowError::BadParam("commit level must be at least 1"));
    }
    if start_fraction > end_fraction || end_fraction > COMMIT_MAX_FRACTION {
        return Err(CowError::BadParam("bad commit fraction window"));
    }

    let _pass = chain.lock.read_pass();
    let levels = chain.levels();
    if level >= levels.len() {
        return Err(CowError::BadParam("commit level out of range"));
    }
    let child = &levels[level];
    let parent = &levels[level - 1];
    let child_redo = child
        .redo
        .as_ref()
        .ok_or(CowError::BadParam("commit level is not a redo log"))?;

    // Freeze the parent's generation so the copy cannot advance it; this
    // keeps a re-run of any committed prefix idempotent.
    let parent_attrs = parent.file.attrs()?;
    parent.file.set_attrs(SET_GENERATION, &parent_attrs)?;

    let granularity = child_redo.granularity();
    let grain_bytes = granularity as usize * SECTOR_SIZE as usize;
    let entries = child_redo.root_entry_count() as u64;
    let start = (entries * start_fraction as u64 / COMMIT_MAX_FRACTION as u64) as usize;
    let end = (entries * end_fraction as u64 / COMMIT_MAX_FRACTION as u64) as usize;
    info!(level, start, end, "committing redo log window");

    let mut buf = vec![0u8; grain_bytes * COMMIT_RUN_GRAINS];
    let mut leaf = vec![0u8; LEAF_BYTES];

    for root_idx in start..end {
        let leaf_sector = match child_redo.root_entry(root_idx) {
            None | Some(0) => continue,
            Some(sector) => sector,
        };
        child
            .file
            .read_at(leaf_sector as u64 * SECTOR_SIZE, &mut leaf)
            .map_err(|_| CowError::MetadataRead("leaf read failed during commit"))?;

        let mut j = 0usize;
        while j < LEAF_FANOUT {
            if format::leaf_entry(&leaf, j) == 0 {
                j += 1;
                continue;
            }

            // Gather a bounded run of mapped grains; spans that are also
            // physically consecutive in the child are read in one I/O.
            let mut k = j;
            while k < LEAF_FANOUT && k - j < COMMIT_RUN_GRAINS {
                let first = format::leaf_entry(&leaf, k);
                if first == 0 {
                    break;
                }
                let mut l = k + 1;
                while l < LEAF_FANOUT && l - j < COMMIT_RUN_GRAINS {
                    let prev = format::leaf_entry(&leaf, l - 1);
                    let cur = format::leaf_entry(&leaf, l);
                    if cur == 0 || cur != prev + granularity {
                        break;
                    }
                    l += 1;
                }
                child
                    .file
                    .read_at(
                        first as u64 * SECTOR_SIZE,
                        &mut buf[(k - j) * grain_bytes..(l - j) * grain_bytes],
                    )
                    .map_err(|_| CowError::Read("grain read failed during commit"))?;
                k = l;
            }

            let virt_sector = ((root_idx * LEAF_FANOUT + j) as u64) * granularity as u64;
            let run = &buf[..(k - j) * grain_bytes];
            write_to_parent(parent, chain.num_sectors(), virt_sector, run)?;
            debug!(root_idx, j, grains = k - j, "committed grain run");
            j = k;
        }
    }

    if end_fraction == COMMIT_MAX_FRACTION {
        // Stamp the parent with the child's generation and versions so
        // later incremental commits are detectable.
        let child_attrs = child.file.attrs()?;
        parent.file.set_attrs(
            SET_GENERATION | SET_TOOLS_VERSION | SET_VIRTUAL_HW_VERSION,
            &child_attrs,
        )?;
        info!(level, "commit complete, parent stamped with child attributes");
    }
    Ok(())
}

/// Writes one run at its virtual position into the parent: through the
/// parent's own mapping when it is a redo log, raw for a plain base.
fn write_to_parent(parent: &Level, chain_sectors: u64, virt_sector: u64, data: &[u8]) -> Result<()> {
    match &parent.redo {
        Some(_) => write::sync_write_slice(
            parent,
            chain_sectors,
            data,
            &GuestSg::contiguous(virt_sector * SECTOR_SIZE, 0, data.len()),
        ),
        None => parent
            .file
            .write_at(virt_sector * SECTOR_SIZE, data)
            .map_err(|_| CowError::Write("parent write failed during commit")),
    }
}

/// Removes `level - 1` from the chain after a full commit of `level`: the
/// remaining child points past the spliced-out log and becomes a root.
/// Runs under the exclusive chain pass.
pub(crate) fn splice_parent(chain: &Arc<Chain>, level: usize) -> Result<()> {
    let _exclusive = chain.lock.write_pass();
    let levels = chain.levels();
    if level < 1 || level >= levels.len() {
        return Err(CowError::BadParam("splice level out of range"));
    }
    let spliced = &levels[level - 1];
    let child = &levels[level];
    let spliced_redo = spliced
        .redo
        .as_ref()
        .ok_or(CowError::BadParam("cannot splice out a plain base disk"))?;
    let child_redo = child
        .redo
        .as_ref()
        .ok_or(CowError::BadParam("splice level is not a redo log"))?;

    let spliced_header = Header::load(spliced.file.as_ref())?;
    let mut child_header = Header::load(child.file.as_ref())?;
    child_header.parent_file_name = spliced_header.parent_file_name;
    child_header.flags |= COW_FLAG_ROOT;
    child_header
        .store(child.file.as_ref())
        .map_err(|_| CowError::MetadataWrite("child header rewrite failed"))?;
    child_redo.set_flags(COW_FLAG_ROOT);

    if let Err(err) = spliced_redo.close() {
        warn!(level = level - 1, error = %err, "failed to close spliced-out redo log");
    }
    chain.remove_level(level - 1);
    info!(level, "spliced parent out of the chain");
    Ok(())
}
