use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

/// In-process readers/writer coordinator for a redo-log chain.
///
/// Guest I/O holds a shared pass for its whole lifetime, including the
/// completion callbacks that run on executor threads, so the guards hold an
/// `Arc` of the coordinator and can be dropped from any thread. Open, close
/// and splice take the exclusive side.
pub struct RwSema {
    state: Mutex<SemaState>,
    cond: Condvar,
}

#[derive(Default)]
struct SemaState {
    readers: u32,
    writer: bool,
}

impl RwSema {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SemaState::default()),
            cond: Condvar::new(),
        })
    }

    /// Acquires a shared pass, blocking while a writer is inside.
    pub fn read_pass(self: &Arc<Self>) -> ReadPass {
        let mut state = self.state.lock();
        while state.writer {
            self.cond.wait(&mut state);
        }
        state.readers += 1;
        ReadPass {
            sema: Arc::clone(self),
        }
    }

    /// Acquires the exclusive pass without blocking, or reports that
    /// readers or another writer are inside.
    pub fn try_write_pass(self: &Arc<Self>) -> Option<WritePass> {
        let mut state = self.state.lock();
        if state.writer || state.readers > 0 {
            return None;
        }
        state.writer = true;
        Some(WritePass {
            sema: Arc::clone(self),
        })
    }

    /// Acquires the exclusive pass, blocking until all readers drain.
    pub fn write_pass(self: &Arc<Self>) -> WritePass {
        let mut state = self.state.lock();
        while state.writer || state.readers > 0 {
            self.cond.wait(&mut state);
        }
        state.writer = true;
        WritePass {
            sema: Arc::clone(self),
        }
    }

    fn end_read(&self) {
        let mut state = self.state.lock();
        state.readers = state.readers.saturating_sub(1);
        if state.readers == 0 {
            self.cond.notify_all();
        }
    }

    fn end_write(&self) {
        let mut state = self.state.lock();
        state.writer = false;
        self.cond.notify_all();
    }
}

/// Shared pass over a chain; released on drop, from any thread.
pub struct ReadPass {
    sema: Arc<RwSema>,
}

impl Drop for ReadPass {
    fn drop(&mut self) {
        self.sema.end_read();
    }
}

/// Exclusive pass over a chain; released on drop.
pub struct WritePass {
    sema: Arc<RwSema>,
}

impl Drop for WritePass {
    fn drop(&mut self) {
        self.sema.end_write();
    }
}
