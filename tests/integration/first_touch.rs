#![allow(missing_docs)]

mod util;

use std::sync::Arc;

use cowdisk::io::exec::IoOp;
use cowdisk::io::sg::{GuestMem, GuestSg, SECTOR_SIZE};
use cowdisk::CowEngine;
use tempfile::tempdir;
use util::{create_plain_base, create_redo_log, open_file};

const NUM_SECTORS: u32 = 1 << 16;
// 4 header sectors + 1 root-table sector for 128 entries.
const DATA_START: u64 = 5;
const LEAF_SECTORS: u64 = 32;

#[test]
fn first_touch_write_allocates_leaf_and_grain() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo)])
        .unwrap();

    let mem = Arc::new(GuestMem::from_vec(vec![0xA5; SECTOR_SIZE as usize]));
    let token = cowdisk::io::exec::IoToken::new();
    engine
        .async_io(
            handle,
            IoOp::Write,
            &mem,
            &GuestSg::contiguous(0, 0, SECTOR_SIZE as usize),
            &token,
        )
        .unwrap();
    assert!(token.wait().is_ok());

    // The first leaf sits right past the root table; the grain follows it.
    let location = engine.block_offset(handle, 0).unwrap();
    assert_eq!(location.level, 1);
    assert_eq!(location.file_sector, Some(DATA_START + LEAF_SECTORS));

    // Guest-visible readback, immediately.
    let read_mem = GuestMem::new(SECTOR_SIZE as usize);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &read_mem,
            &GuestSg::contiguous(0, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
    assert_eq!(read_mem.snapshot(), vec![0xA5; SECTOR_SIZE as usize]);

    engine.close_hierarchy(handle).unwrap();

    // Reopen after a clean close: the mapping and the data survive.
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo)])
        .unwrap();
    let read_mem = GuestMem::new(SECTOR_SIZE as usize);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &read_mem,
            &GuestSg::contiguous(0, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
    assert_eq!(read_mem.snapshot(), vec![0xA5; SECTOR_SIZE as usize]);
    let stats = engine.redo_stats(handle, 1).unwrap();
    assert_eq!(stats.next_free as u64, DATA_START + LEAF_SECTORS + 1);
    engine.close_hierarchy(handle).unwrap();
}

#[test]
fn async_write_and_read_roundtrip_multiple_sectors() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo)])
        .unwrap();

    let payload: Vec<u8> = (0..8 * SECTOR_SIZE as usize)
        .map(|i| (i % 251) as u8)
        .collect();
    let mem = Arc::new(GuestMem::from_vec(payload.clone()));
    let token = cowdisk::io::exec::IoToken::new();
    engine
        .async_io(
            handle,
            IoOp::Write,
            &mem,
            &GuestSg::contiguous(40 * SECTOR_SIZE, 0, payload.len()),
            &token,
        )
        .unwrap();
    assert!(token.wait().is_ok());

    let read_mem = Arc::new(GuestMem::new(payload.len()));
    let token = cowdisk::io::exec::IoToken::new();
    engine
        .async_io(
            handle,
            IoOp::Read,
            &read_mem,
            &GuestSg::contiguous(40 * SECTOR_SIZE, 0, payload.len()),
            &token,
        )
        .unwrap();
    assert!(token.wait().is_ok());
    assert_eq!(read_mem.snapshot(), payload);
    engine.close_hierarchy(handle).unwrap();
}

#[test]
fn overwrite_reuses_grain_without_new_allocation() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo)])
        .unwrap();

    let mem = GuestMem::from_vec(vec![0x11; SECTOR_SIZE as usize]);
    engine
        .sync_io(
            handle,
            IoOp::Write,
            &mem,
            &GuestSg::contiguous(9 * SECTOR_SIZE, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
    let free_after_first = engine.redo_stats(handle, 1).unwrap().next_free;

    let mem = GuestMem::from_vec(vec![0x22; SECTOR_SIZE as usize]);
    engine
        .sync_io(
            handle,
            IoOp::Write,
            &mem,
            &GuestSg::contiguous(9 * SECTOR_SIZE, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
    assert_eq!(
        engine.redo_stats(handle, 1).unwrap().next_free,
        free_after_first,
        "rewriting a mapped grain must not allocate"
    );

    let read_mem = GuestMem::new(SECTOR_SIZE as usize);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &read_mem,
            &GuestSg::contiguous(9 * SECTOR_SIZE, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
    assert_eq!(read_mem.snapshot(), vec![0x22; SECTOR_SIZE as usize]);
    engine.close_hierarchy(handle).unwrap();
}
