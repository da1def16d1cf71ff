//! The copy-on-write engine: on-disk format, leaf cache, per-log mapping
//! state, the chain, and the read/write/commit paths.

pub mod cache;
pub mod chain;
pub mod commit;
mod continuation;
pub mod engine;
pub mod format;
pub mod read;
pub mod redo;
pub mod write;

pub use chain::{Chain, Level};
pub use commit::COMMIT_MAX_FRACTION;
pub use engine::{BlockLocation, CowEngine, HandleId, HANDLE_TABLE_SIZE};
pub use format::format_redo_log;
pub use redo::{RedoState, RedoStatsSnapshot};
pub use write::IoState;
