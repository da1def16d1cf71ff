//! Typed continuations carried inside completion tokens. The tag tells the
//! completion thread exactly which leg of the engine to resume.

use std::sync::Arc;

use crate::cow::read::ReadChild;
use crate::cow::write::{DataWrite, MetadataWrite};
use crate::io::exec::{IoToken, ScsiStatus, TokenHook};

/// Continuation attached to a child token.
pub(crate) enum Continuation {
    /// One per-level read of a split guest read.
    ReadChild(ReadChild),
    /// The data write of a guest write command.
    DataWrite(DataWrite),
    /// The metadata write of a guest write command.
    MetadataWrite(MetadataWrite),
}

impl TokenHook for Continuation {
    fn on_complete(self: Box<Self>, token: &Arc<IoToken>, status: ScsiStatus) {
        match *self {
            Continuation::ReadChild(hook) => hook.run(token, status),
            Continuation::DataWrite(hook) => hook.run(token, status),
            Continuation::MetadataWrite(hook) => hook.run(token, status),
        }
    }
}
