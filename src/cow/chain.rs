//! A chain of images presented as one virtual disk: the base at level 0
//! plus redo logs ordered parent-to-child, with the hierarchy-wide
//! reader/writer coordinator.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, warn};

use crate::cow::format::MAX_REDO_LOGS;
use crate::cow::redo::RedoState;
use crate::error::{CowError, Result};
use crate::io::sg::SECTOR_SIZE;
use crate::io::FileIo;
use crate::sync::RwSema;

/// One image in the chain.
#[derive(Clone)]
pub struct Level {
    /// Backing file.
    pub file: Arc<dyn FileIo>,
    /// Redo-log state, absent for a plain base disk.
    pub redo: Option<Arc<RedoState>>,
}

/// An open hierarchy of images.
pub struct Chain {
    id: u64,
    /// Hierarchy-wide coordinator: shared for guest I/O and the commit
    /// copy, exclusive for close and splice.
    pub lock: Arc<RwSema>,
    levels: RwLock<Vec<Level>>,
    num_sectors: u64,
    block_size: u32,
}

impl Chain {
    /// Opens every file of the hierarchy. `files[0]` may be a plain base
    /// disk; any other level must carry a redo-log header.
    pub(crate) fn open(files: Vec<Arc<dyn FileIo>>, id: u64) -> Result<Chain> {
        if files.is_empty() {
            return Err(CowError::BadParam("hierarchy needs at least one file"));
        }
        if files.len() > MAX_REDO_LOGS + 1 {
            warn!(count = files.len(), "too many redo logs");
            return Err(CowError::LimitExceeded("too many redo logs"));
        }

        let mut levels = Vec::with_capacity(files.len());
        for (idx, file) in files.into_iter().enumerate() {
            let redo = match RedoState::open(Arc::clone(&file)) {
                Ok(redo) => Some(redo),
                Err(CowError::NotSupported(_)) if idx == 0 => None,
                Err(err) => {
                    warn!(level = idx, error = %err, "failed to open hierarchy level");
                    return Err(err);
                }
            };
            debug!(level = idx, cow = redo.is_some(), "opened hierarchy level");
            levels.push(Level { file, redo });
        }

        let mut granularity = None;
        for level in &levels {
            if let Some(redo) = &level.redo {
                match granularity {
                    None => granularity = Some(redo.granularity()),
                    Some(existing) if existing != redo.granularity() => {
                        return Err(CowError::NotSupported("mixed granularity in one chain"));
                    }
                    Some(_) => {}
                }
            }
        }

        let (num_sectors, block_size) = match &levels[0].redo {
            Some(redo) => (redo.num_sectors() as u64, SECTOR_SIZE as u32),
            None => {
                let attrs = levels[0].file.attrs()?;
                (attrs.length / SECTOR_SIZE, attrs.block_size.max(1))
            }
        };

        Ok(Chain {
            id,
            lock: RwSema::new(),
            levels: RwLock::new(levels),
            num_sectors,
            block_size,
        })
    }

    /// Opaque generation-stamped ID of this chain.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Snapshot of the levels, base first.
    pub fn levels(&self) -> Vec<Level> {
        self.levels.read().clone()
    }

    /// The topmost level, the only one that receives writes.
    pub fn top(&self) -> Level {
        self.levels
            .read()
            .last()
            .expect("chain always has a base")
            .clone()
    }

    /// Number of images currently in the chain.
    pub fn level_count(&self) -> usize {
        self.levels.read().len()
    }

    /// Virtual disk size in sectors.
    pub fn num_sectors(&self) -> u64 {
        self.num_sectors
    }

    /// Block size reported for the virtual disk.
    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    /// Removes a level after a splice; caller holds the exclusive pass.
    pub(crate) fn remove_level(&self, idx: usize) -> Level {
        self.levels.write().remove(idx)
    }
}
