#![allow(missing_docs)]

mod util;

use cowdisk::io::exec::IoOp;
use cowdisk::io::sg::{GuestMem, GuestSg, SECTOR_SIZE};
use cowdisk::CowEngine;
use tempfile::tempdir;
use util::{create_plain_base, create_redo_log, open_file};

const NUM_SECTORS: u32 = 1 << 16;

fn write_sector(engine: &CowEngine, handle: cowdisk::HandleId, sector: u64, byte: u8) {
    let mem = GuestMem::from_vec(vec![byte; SECTOR_SIZE as usize]);
    engine
        .sync_io(
            handle,
            IoOp::Write,
            &mem,
            &GuestSg::contiguous(sector * SECTOR_SIZE, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
}

fn read_sector(engine: &CowEngine, handle: cowdisk::HandleId, sector: u64) -> Vec<u8> {
    let mem = GuestMem::new(SECTOR_SIZE as usize);
    engine
        .sync_io(
            handle,
            IoOp::Read,
            &mem,
            &GuestSg::contiguous(sector * SECTOR_SIZE, 0, SECTOR_SIZE as usize),
        )
        .unwrap();
    mem.snapshot()
}

fn read_file_sector(path: &std::path::Path, sector: u64) -> Vec<u8> {
    let file = open_file(path);
    let mut buf = vec![0u8; SECTOR_SIZE as usize];
    file.read_at(sector * SECTOR_SIZE, &mut buf).unwrap();
    buf
}

#[test]
fn commit_and_splice_drop_the_middle_redo_log() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo1 = create_redo_log(dir.path(), "r1.redo", NUM_SECTORS, 1);
    let redo2 = create_redo_log(dir.path(), "r2.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![
            open_file(&base),
            open_file(&redo1),
            open_file(&redo2),
        ])
        .unwrap();
    assert_eq!(engine.file_count(handle).unwrap(), 3);

    // The write lands in redo2, the top of the chain.
    write_sector(&engine, handle, 10, 0xD7);

    engine.commit(handle, 2, 0, 100).unwrap();
    engine.splice_parent(handle, 2).unwrap();

    // redo1 (the former parent of redo2) left the chain.
    assert_eq!(engine.file_count(handle).unwrap(), 2);
    assert_eq!(read_sector(&engine, handle, 10), vec![0xD7; SECTOR_SIZE as usize]);
    engine.close_hierarchy(handle).unwrap();

    // redo1 now carries the sector-10 mapping on its own.
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo1)])
        .unwrap();
    assert_eq!(read_sector(&engine, handle, 10), vec![0xD7; SECTOR_SIZE as usize]);
    engine.close_hierarchy(handle).unwrap();
}

#[test]
fn split_commit_matches_full_commit() {
    let dir = tempdir().unwrap();

    let build_chain = |tag: &str| {
        let base = create_plain_base(dir.path(), &format!("base-{tag}.dsk"), NUM_SECTORS as u64);
        let redo = create_redo_log(dir.path(), &format!("r-{tag}.redo"), NUM_SECTORS, 1);
        let engine = CowEngine::new();
        let handle = engine
            .open_hierarchy(vec![open_file(&base), open_file(&redo)])
            .unwrap();
        // One grain in leaf 0, one in leaf 15: the 10% fraction boundary
        // (root entry 12) separates them.
        write_sector(&engine, handle, 10, 0x44);
        write_sector(&engine, handle, 15 * 4096, 0x55);
        (base, redo, engine, handle)
    };

    let (base_a, _redo_a, engine_a, handle_a) = build_chain("split");
    engine_a.commit(handle_a, 1, 0, 10).unwrap();
    engine_a.commit(handle_a, 1, 10, 100).unwrap();
    engine_a.close_hierarchy(handle_a).unwrap();

    let (base_b, _redo_b, engine_b, handle_b) = build_chain("full");
    engine_b.commit(handle_b, 1, 0, 100).unwrap();
    engine_b.close_hierarchy(handle_b).unwrap();

    for sector in [10u64, 15 * 4096] {
        assert_eq!(
            read_file_sector(&base_a, sector),
            read_file_sector(&base_b, sector),
            "split and full commit must produce the same parent, sector {sector}"
        );
    }
    assert_eq!(read_file_sector(&base_a, 10), vec![0x44; SECTOR_SIZE as usize]);
    assert_eq!(
        read_file_sector(&base_a, 15 * 4096),
        vec![0x55; SECTOR_SIZE as usize]
    );
}

#[test]
fn rerunning_a_committed_prefix_is_a_noop() {
    let dir = tempdir().unwrap();
    let base = create_plain_base(dir.path(), "base.dsk", NUM_SECTORS as u64);
    let redo = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo)])
        .unwrap();
    write_sector(&engine, handle, 10, 0x77);

    let attrs_before = open_file(&base).attrs().unwrap();
    engine.commit(handle, 1, 0, 50).unwrap();
    let attrs_mid = open_file(&base).attrs().unwrap();
    assert_eq!(
        attrs_before.generation, attrs_mid.generation,
        "a partial commit must not advance the parent generation"
    );

    let parent_sector = read_file_sector(&base, 10);
    engine.commit(handle, 1, 0, 50).unwrap();
    assert_eq!(
        read_file_sector(&base, 10),
        parent_sector,
        "re-running a committed prefix must not change the parent"
    );

    engine.commit(handle, 1, 50, 100).unwrap();
    engine.close_hierarchy(handle).unwrap();
    assert_eq!(read_file_sector(&base, 10), vec![0x77; SECTOR_SIZE as usize]);
}

#[test]
fn commit_into_a_cow_parent_goes_through_its_mapping() {
    let dir = tempdir().unwrap();
    // COW-formatted sparse base as the parent of the commit.
    let base = create_redo_log(dir.path(), "base.cow", NUM_SECTORS, 1);
    let redo = create_redo_log(dir.path(), "disk.redo", NUM_SECTORS, 1);

    let engine = CowEngine::new();
    let handle = engine
        .open_hierarchy(vec![open_file(&base), open_file(&redo)])
        .unwrap();
    write_sector(&engine, handle, 123, 0x88);
    engine.commit(handle, 1, 0, 100).unwrap();
    engine.close_hierarchy(handle).unwrap();

    // The parent alone now maps the sector through its own metadata.
    let handle = engine.open_hierarchy(vec![open_file(&base)]).unwrap();
    assert_eq!(read_sector(&engine, handle, 123), vec![0x88; SECTOR_SIZE as usize]);
    engine.close_hierarchy(handle).unwrap();
}
