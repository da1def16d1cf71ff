#![allow(dead_code)]

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};

use cowdisk::error::Result;
use cowdisk::io::sg::SECTOR_SIZE;
use cowdisk::io::{FileAttrs, FileIo, StdFileIo, SET_LENGTH};

/// Instrumented pass-through file: records writes, and can gate or fail
/// selected writes to exercise the state machine and crash windows.
pub struct HookedFileIo {
    inner: Arc<dyn FileIo>,
    writes: Mutex<Vec<(u64, usize)>>,
    gate: Mutex<GateState>,
    gate_open: Condvar,
    fail: Mutex<Option<FailRule>>,
}

#[derive(Default)]
struct GateState {
    /// Writes landing at this offset block until the gate is released.
    offset: Option<u64>,
    open: bool,
}

struct FailRule {
    offset: u64,
    /// Matching writes to let through before the one that fails.
    skip: u32,
}

impl HookedFileIo {
    pub fn new(inner: Arc<dyn FileIo>) -> Arc<Self> {
        Arc::new(Self {
            inner,
            writes: Mutex::new(Vec::new()),
            gate: Mutex::new(GateState::default()),
            gate_open: Condvar::new(),
            fail: Mutex::new(None),
        })
    }

    /// All (offset, len) writes observed so far.
    pub fn writes(&self) -> Vec<(u64, usize)> {
        self.writes.lock().clone()
    }

    pub fn clear_writes(&self) {
        self.writes.lock().clear();
    }

    /// Blocks every write landing at `offset` until [`release_gate`].
    pub fn gate_writes_at(&self, offset: u64) {
        let mut gate = self.gate.lock();
        gate.offset = Some(offset);
        gate.open = false;
    }

    pub fn release_gate(&self) {
        let mut gate = self.gate.lock();
        gate.open = true;
        self.gate_open.notify_all();
    }

    /// Fails the (skip + 1)-th write landing at `offset`, once.
    pub fn fail_write_at(&self, offset: u64, skip: u32) {
        *self.fail.lock() = Some(FailRule { offset, skip });
    }
}

impl FileIo for HookedFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        self.inner.read_at(off, dst)
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        {
            let mut fail = self.fail.lock();
            if let Some(rule) = fail.as_mut() {
                if rule.offset == off {
                    if rule.skip == 0 {
                        *fail = None;
                        return Err(cowdisk::CowError::Io(std::io::Error::other(
                            "injected write failure",
                        )));
                    }
                    rule.skip -= 1;
                }
            }
        }
        {
            let mut gate = self.gate.lock();
            if gate.offset == Some(off) {
                while !gate.open {
                    self.gate_open.wait(&mut gate);
                }
            }
        }
        self.writes.lock().push((off, src.len()));
        self.inner.write_at(off, src)
    }

    fn attrs(&self) -> Result<FileAttrs> {
        self.inner.attrs()
    }

    fn set_attrs(&self, op: u32, attrs: &FileAttrs) -> Result<()> {
        self.inner.set_attrs(op, attrs)
    }

    fn sync_all(&self) -> Result<()> {
        self.inner.sync_all()
    }
}

/// Opens (or reopens) a file as the engine would.
pub fn open_file(path: &Path) -> Arc<dyn FileIo> {
    Arc::new(StdFileIo::open(path).expect("open image file"))
}

/// Creates a plain (non-COW) base disk of `sectors` sectors, sparse.
pub fn create_plain_base(dir: &Path, name: &str, sectors: u64) -> PathBuf {
    let path = dir.join(name);
    let io = StdFileIo::open(&path).expect("create base");
    io.set_attrs(
        SET_LENGTH,
        &FileAttrs {
            length: sectors * SECTOR_SIZE,
            ..Default::default()
        },
    )
    .expect("size base");
    path
}

/// Creates and formats an empty redo log.
pub fn create_redo_log(dir: &Path, name: &str, sectors: u32, granularity: u32) -> PathBuf {
    let path = dir.join(name);
    let io = StdFileIo::open(&path).expect("create redo log");
    cowdisk::format_redo_log(&io, sectors, granularity).expect("format redo log");
    path
}

/// Polls `probe` until it returns true or the timeout elapses.
pub fn wait_until(timeout: Duration, mut probe: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if probe() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    probe()
}
