use std::io;
use thiserror::Error;

/// Convenient result alias used throughout the crate.
pub type Result<T> = std::result::Result<T, CowError>;

/// Errors surfaced by the copy-on-write disk engine.
#[derive(Debug, Error)]
pub enum CowError {
    /// Underlying I/O failure from the file layer.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
    /// The handle ID is stale or was never allocated.
    #[error("invalid handle")]
    InvalidHandle,
    /// A request argument is malformed (misaligned, out of range, ...).
    #[error("invalid argument: {0}")]
    BadParam(&'static str),
    /// The request exceeds the virtual disk size or a chain limit.
    #[error("limit exceeded: {0}")]
    LimitExceeded(&'static str),
    /// An allocation failed or a bounded wait timed out.
    #[error("out of resources: {0}")]
    NoResources(&'static str),
    /// On-disk magic or version mismatch.
    #[error("not supported: {0}")]
    NotSupported(&'static str),
    /// I/O failure while reading the root table or a leaf.
    #[error("metadata read error: {0}")]
    MetadataRead(&'static str),
    /// I/O failure while persisting the root table or a leaf.
    #[error("metadata write error: {0}")]
    MetadataWrite(&'static str),
    /// I/O failure on the data read path.
    #[error("read error: {0}")]
    Read(&'static str),
    /// I/O failure on the data write path.
    #[error("write error: {0}")]
    Write(&'static str),
    /// The operation cannot run while commands are still queued.
    #[error("busy: {0}")]
    Busy(&'static str),
    /// On-disk structures disagree with each other.
    #[error("corruption detected: {0}")]
    Corruption(&'static str),
}
