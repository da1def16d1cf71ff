//! Asynchronous submission layer: completion tokens carrying SCSI-style
//! status, fan-out accounting for split commands, and a small worker pool
//! that drives completions on threads other than the issuer's.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use parking_lot::{Condvar, Mutex};
use tracing::warn;

use crate::error::{CowError, Result};
use crate::io::sg::{read_scatter, write_gather, write_scatter, FileSg, GuestMem};
use crate::io::FileIo;

/// Host-side completion status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HostStatus {
    /// Transport completed the request.
    Ok,
    /// Transport-level failure.
    Error,
    /// The request was cancelled by the caller.
    Cancelled,
}

/// Device-side completion status.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DeviceStatus {
    /// Device reported success.
    Good,
    /// Device reported a check condition.
    CheckCondition,
}

/// Combined completion status delivered to tokens.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ScsiStatus {
    /// Host portion of the status.
    pub host: HostStatus,
    /// Device portion of the status.
    pub device: DeviceStatus,
}

impl ScsiStatus {
    /// Fully successful completion.
    pub const GOOD: ScsiStatus = ScsiStatus {
        host: HostStatus::Ok,
        device: DeviceStatus::Good,
    };

    /// Host-level error with a good device status.
    pub const HOST_ERROR: ScsiStatus = ScsiStatus {
        host: HostStatus::Error,
        device: DeviceStatus::Good,
    };

    /// True when both halves report success.
    pub fn is_ok(&self) -> bool {
        self.host == HostStatus::Ok && self.device == DeviceStatus::Good
    }
}

/// Continuation attached to a token; invoked exactly once on completion.
pub trait TokenHook: Send {
    /// Runs when the token's I/O completes. `token` is the completed token.
    fn on_complete(self: Box<Self>, token: &Arc<IoToken>, status: ScsiStatus);
}

struct Fanout {
    needed: u32,
    handled: u32,
}

struct TokenState {
    result: ScsiStatus,
    done: bool,
    fanout: Option<Fanout>,
}

/// Outcome of accounting one fan-out child completion.
#[derive(Debug, PartialEq, Eq)]
pub enum FanoutOutcome {
    /// More children outstanding.
    Pending,
    /// This was the last child; the stored result is final.
    Completed(ScsiStatus),
}

/// Completion object for one asynchronous request.
///
/// A token may carry a typed continuation (the state-machine hook that runs
/// on the completion thread) and, for split commands, a fan-out counter that
/// makes the last child completion drive the parent.
pub struct IoToken {
    state: Mutex<TokenState>,
    done_cv: Condvar,
    continuation: Mutex<Option<Box<dyn TokenHook>>>,
}

impl IoToken {
    /// Creates a fresh token with a good status and no continuation.
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(TokenState {
                result: ScsiStatus::GOOD,
                done: false,
                fanout: None,
            }),
            done_cv: Condvar::new(),
            continuation: Mutex::new(None),
        })
    }

    /// Attaches the continuation run on completion.
    pub fn set_continuation(&self, hook: impl TokenHook + 'static) {
        *self.continuation.lock() = Some(Box::new(hook));
    }

    /// Current stored status.
    pub fn result(&self) -> ScsiStatus {
        self.state.lock().result
    }

    /// Overwrites the stored status.
    pub fn set_result(&self, status: ScsiStatus) {
        self.state.lock().result = status;
    }

    /// Stores `status` only if the token still holds a good status.
    pub fn set_result_if_ok(&self, status: ScsiStatus) {
        let mut state = self.state.lock();
        if state.result.is_ok() {
            state.result = status;
        }
    }

    /// True once the token has been finished.
    pub fn is_done(&self) -> bool {
        self.state.lock().done
    }

    /// Blocks until the token finishes and returns the final status.
    pub fn wait(&self) -> ScsiStatus {
        let mut state = self.state.lock();
        while !state.done {
            self.done_cv.wait(&mut state);
        }
        state.result
    }

    /// Arms the fan-out counter for `needed` children.
    pub fn begin_fanout(&self, needed: u32) {
        self.state.lock().fanout = Some(Fanout { needed, handled: 0 });
    }

    /// Accounts one child completion. The first child back seeds the parent
    /// status; the first non-OK child overrides a still-good status.
    pub fn fanout_child_done(&self, status: ScsiStatus) -> FanoutOutcome {
        let mut state = self.state.lock();
        let fanout = state.fanout.as_mut().expect("fanout not armed");
        let first_back = fanout.handled == 0;
        fanout.handled += 1;
        let finished = fanout.handled == fanout.needed;
        if first_back || (!status.is_ok() && state.result.is_ok()) {
            state.result = status;
        }
        if finished {
            state.fanout = None;
            FanoutOutcome::Completed(state.result)
        } else {
            FanoutOutcome::Pending
        }
    }

    /// Patches the counter after an issue failure: only the `issued`
    /// children already in flight will complete. Returns `Completed` when
    /// every in-flight child has already been handled.
    pub fn fanout_abandon(&self, issued: u32) -> FanoutOutcome {
        let mut state = self.state.lock();
        state.result = ScsiStatus::HOST_ERROR;
        let fanout = state.fanout.as_mut().expect("fanout not armed");
        if fanout.handled >= issued {
            state.fanout = None;
            FanoutOutcome::Completed(state.result)
        } else {
            fanout.needed = issued;
            FanoutOutcome::Pending
        }
    }

    /// Marks the token done with `status` and wakes waiters.
    pub fn finish(&self, status: ScsiStatus) {
        let mut state = self.state.lock();
        state.result = status;
        state.done = true;
        self.done_cv.notify_all();
    }

    /// Marks the token done with whatever status it already stores.
    pub fn finish_stored(&self) {
        let mut state = self.state.lock();
        state.done = true;
        self.done_cv.notify_all();
    }

    /// Delivers a completion: runs the continuation if one is attached,
    /// otherwise finishes the token directly.
    pub fn complete(self: &Arc<Self>, status: ScsiStatus) {
        let hook = self.continuation.lock().take();
        match hook {
            Some(hook) => {
                self.finish(status);
                hook.on_complete(self, status);
            }
            None => self.finish(status),
        }
    }
}

/// Read or write request class.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum IoOp {
    /// Data flows from the file into memory.
    Read,
    /// Data flows from memory into the file.
    Write,
}

/// Source or destination of an asynchronous request.
pub enum IoPayload {
    /// Scatter list over a shared guest memory image.
    Guest {
        /// Guest memory image.
        mem: Arc<GuestMem>,
        /// Per-file scatter list.
        sg: FileSg,
    },
    /// Gather list of owned buffers (metadata writes).
    Owned {
        /// (file offset, payload) pairs.
        bufs: Vec<(u64, Bytes)>,
    },
}

/// One queued asynchronous request.
pub struct IoRequest {
    /// Target file.
    pub file: Arc<dyn FileIo>,
    /// Request class.
    pub op: IoOp,
    /// Data source or destination.
    pub payload: IoPayload,
    /// Completion token.
    pub token: Arc<IoToken>,
}

struct ExecShared {
    queue: Mutex<VecDeque<IoRequest>>,
    available: Condvar,
    shutdown: AtomicBool,
}

/// Worker pool performing queued requests and driving token completions.
pub struct IoExecutor {
    shared: Arc<ExecShared>,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

impl IoExecutor {
    /// Spawns `threads` workers.
    pub fn new(threads: usize) -> Arc<Self> {
        let shared = Arc::new(ExecShared {
            queue: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            shutdown: AtomicBool::new(false),
        });
        let workers = (0..threads.max(1))
            .map(|idx| {
                let shared = Arc::clone(&shared);
                thread::Builder::new()
                    .name(format!("cow-io-{idx}"))
                    .spawn(move || worker_loop(&shared))
                    .expect("spawn io worker")
            })
            .collect();
        Arc::new(Self {
            shared,
            workers: Mutex::new(workers),
        })
    }

    /// Queues a request. Fails with `NoResources` after shutdown.
    pub fn submit(&self, req: IoRequest) -> Result<()> {
        if self.shared.shutdown.load(Ordering::Acquire) {
            return Err(CowError::NoResources("io executor is shut down"));
        }
        self.shared.queue.lock().push_back(req);
        self.shared.available.notify_one();
        Ok(())
    }
}

impl Drop for IoExecutor {
    fn drop(&mut self) {
        self.shared.shutdown.store(true, Ordering::Release);
        self.shared.available.notify_all();
        for handle in self.workers.lock().drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop(shared: &ExecShared) {
    loop {
        let req = {
            let mut queue = shared.queue.lock();
            loop {
                if let Some(req) = queue.pop_front() {
                    break req;
                }
                if shared.shutdown.load(Ordering::Acquire) {
                    return;
                }
                shared.available.wait(&mut queue);
            }
        };
        let status = match perform(&req) {
            Ok(()) => ScsiStatus::GOOD,
            Err(err) => {
                warn!(error = %err, op = ?req.op, "async file request failed");
                ScsiStatus::HOST_ERROR
            }
        };
        req.token.complete(status);
    }
}

fn perform(req: &IoRequest) -> Result<()> {
    match (&req.payload, req.op) {
        (IoPayload::Guest { mem, sg }, IoOp::Read) => read_scatter(req.file.as_ref(), mem, sg),
        (IoPayload::Guest { mem, sg }, IoOp::Write) => write_scatter(req.file.as_ref(), mem, sg),
        (IoPayload::Owned { bufs }, IoOp::Write) => write_gather(req.file.as_ref(), bufs),
        (IoPayload::Owned { .. }, IoOp::Read) => {
            Err(CowError::BadParam("owned payload is write-only"))
        }
    }
}
