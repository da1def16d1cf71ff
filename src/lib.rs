//! # Cowdisk - Copy-on-Write Virtual Disk Engine
//!
//! Cowdisk presents a chain of disk images (one base disk plus up to 32
//! redo logs) as a single virtual block device. Reads come from the
//! topmost image that maps a sector; writes allocate grains in the topmost
//! redo log and persist the mapping in its two-level metadata, with
//! crash-consistent ordering between data and metadata.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use cowdisk::io::{FileIo, StdFileIo};
//! use cowdisk::io::exec::IoOp;
//! use cowdisk::io::sg::{GuestMem, GuestSg};
//! use cowdisk::{format_redo_log, CowEngine};
//!
//! let base: Arc<dyn FileIo> = Arc::new(StdFileIo::open("base.dsk")?);
//! let redo: Arc<dyn FileIo> = Arc::new(StdFileIo::open("disk.redo")?);
//! format_redo_log(redo.as_ref(), 1 << 20, 1)?;
//!
//! let engine = CowEngine::new();
//! let handle = engine.open_hierarchy(vec![base, redo])?;
//!
//! let mem = GuestMem::from_vec(vec![0xA5; 512]);
//! engine.sync_io(handle, IoOp::Write, &mem, &GuestSg::contiguous(0, 0, 512))?;
//! engine.close_hierarchy(handle)?;
//! # Ok::<(), cowdisk::CowError>(())
//! ```
//!
//! ## Architecture
//!
//! - **File layer**: positioned I/O plus attributes, with an asynchronous
//!   submission executor driving completion callbacks.
//! - **Mapping layer**: per-redo-log root table, leaf cache and free-sector
//!   allocator.
//! - **I/O paths**: parallel per-level reads with zero-fill, and a
//!   five-state write machine ordering data before metadata.
//! - **Chain lifecycle**: open/close with recovery, online commit and
//!   splice.

pub mod cow;
pub mod error;
pub mod io;
pub mod logging;
pub mod sync;

pub use crate::cow::{
    format_redo_log, BlockLocation, Chain, CowEngine, HandleId, IoState, Level,
    RedoStatsSnapshot, COMMIT_MAX_FRACTION,
};
pub use crate::error::{CowError, Result};
