#![allow(missing_docs)]

mod util;

use std::sync::Arc;

use cowdisk::io::exec::{IoOp, IoToken};
use cowdisk::io::sg::{GuestMem, GuestSg, SECTOR_SIZE};
use cowdisk::io::FileIo;
use cowdisk::CowEngine;
use tempfile::tempdir;
use util::{create_plain_base, create_redo_log, open_file, HookedFileIo};

const NUM_SECTORS: u32 = 1 << 16;
// First leaf lands right past the root table, the first grain after it.
const LEAF_OFF: u64 = 5 * SECTOR_SIZE;
const WATERMARK_AFTER_LEAF: u32 = 5 + 32;

#[test]
fn crash_between_data_and_metadata_leaks_the_grain() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo_path = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    {
        let hooked = HookedFileIo::new(open_file(&redo_path));
        // Let the leaf-init write through, fail the metadata writeback.
        hooked.fail_write_at(LEAF_OFF, 1);

        let engine = CowEngine::new();
        let handle = engine
            .open_hierarchy(vec![open_file(&base), hooked.clone() as Arc<dyn FileIo>])
            .unwrap();

        let mem = Arc::new(GuestMem::from_vec(vec![0x5C; 512]));
        let token = IoToken::new();
        engine
            .async_io(
                handle,
                IoOp::Write,
                &mem,
                &GuestSg::contiguous(4096 * SECTOR_SIZE, 0, 512),
                &token,
            )
            .unwrap();
        assert!(
            !token.wait().is_ok(),
            "metadata failure must surface on the guest command"
        );

        // Within the same open the in-memory mapping is live: the grain was
        // physically written, so reads still succeed.
        let mem = GuestMem::new(512);
        engine
            .sync_io(
                handle,
                IoOp::Read,
                &mem,
                &GuestSg::contiguous(4096 * SECTOR_SIZE, 0, 512),
            )
            .unwrap();
        assert_eq!(mem.snapshot(), vec![0x5C; 512]);

        // Crash: drop everything without closing the hierarchy.
    }

    // Reopen. The generation moved but the header still carries the old
    // saved generation, so recovery scans the metadata.
    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo_path)])
        .unwrap();

    // The pending mapping was not resurrected: the read falls through to
    // the (zero) base disk.
    let mem = GuestMem::from_vec(vec![0xFF; 512]);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &mem,
            &GuestSg::contiguous(4096 * SECTOR_SIZE, 0, 512),
        )
        .unwrap();
    assert_eq!(mem.snapshot(), vec![0u8; 512]);

    // The free pointer covers the leaf that is referenced on disk; the
    // written grain past it is the leaked allocation.
    let stats = engine.redo_stats(handle, 1).unwrap();
    assert_eq!(stats.next_free, WATERMARK_AFTER_LEAF);
    engine.close_hierarchy(handle).unwrap();
}

#[test]
fn recovery_is_idempotent() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo_path = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    // Produce an unclean image: a successful write, then no clean close.
    {
        let engine = CowEngine::new();
        let handle = engine
            .open_hierarchy(vec![open_file(&base), open_file(&redo_path)])
            .unwrap();
        let mem = GuestMem::from_vec(vec![0x31; 512]);
        engine
            .sync_io(
                handle,
                IoOp::Write,
                &mem,
                &GuestSg::contiguous(7 * SECTOR_SIZE, 0, 512),
            )
            .unwrap();
        // No close.
    }

    let probe_free = || {
        let engine = CowEngine::new();
        let handle = engine
            .open_hierarchy(vec![open_file(&base), open_file(&redo_path)])
            .unwrap();
        let free = engine.redo_stats(handle, 1).unwrap().next_free;
        // Close without having written: the image intentionally stays
        // unclean, so the next open runs recovery again.
        engine.close_hierarchy(handle).unwrap();
        free
    };

    let first = probe_free();
    let second = probe_free();
    assert_eq!(first, second, "re-running recovery must be a no-op");
    // Leaf plus the one mapped grain.
    assert_eq!(first, WATERMARK_AFTER_LEAF + 1);

    // The recovered mapping is intact.
    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo_path)])
        .unwrap();
    let mem = GuestMem::new(512);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &mem,
            &GuestSg::contiguous(7 * SECTOR_SIZE, 0, 512),
        )
        .unwrap();
    assert_eq!(mem.snapshot(), vec![0x31; 512]);
    engine.close_hierarchy(handle).unwrap();
}

#[test]
fn clean_close_skips_recovery_on_reopen() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo_path = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo_path)])
        .unwrap();
    let mem = GuestMem::from_vec(vec![0x66; 512]);
    engine
        .sync_io(
            handle,
            IoOp::Write,
            &mem,
            &GuestSg::contiguous(3 * SECTOR_SIZE, 0, 512),
        )
        .unwrap();
    let free_at_close = engine.redo_stats(handle, 1).unwrap().next_free;
    engine.close_hierarchy(handle).unwrap();

    // A hooked reopen shows no leaf reads beyond the ordinary open path:
    // the header already carries the right free pointer.
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo_path)])
        .unwrap();
    assert_eq!(engine.redo_stats(handle, 1).unwrap().next_free, free_at_close);
    let mem = GuestMem::new(512);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &mem,
            &GuestSg::contiguous(3 * SECTOR_SIZE, 0, 512),
        )
        .unwrap();
    assert_eq!(mem.snapshot(), vec![0x66; 512]);
    engine.close_hierarchy(handle).unwrap();
}
