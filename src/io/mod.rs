//! File layer consumed by the engine: positioned synchronous I/O plus the
//! attribute surface (length, generation, version fields) the redo-log
//! lifecycle depends on.

use std::convert::TryInto;
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{CowError, Result};

pub mod exec;
pub mod sg;

/// Set the file length.
pub const SET_LENGTH: u32 = 0x01;
/// Set the generation counter; also disables auto-regeneration for the
/// remainder of this open (the commit-window freeze contract).
pub const SET_GENERATION: u32 = 0x02;
/// Set the tools version.
pub const SET_TOOLS_VERSION: u32 = 0x04;
/// Set the virtual hardware version.
pub const SET_VIRTUAL_HW_VERSION: u32 = 0x08;

/// Attributes reported by the file layer.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct FileAttrs {
    /// Allocated length of the file in bytes.
    pub length: u64,
    /// Counter advanced by the file layer on the first write of an open.
    pub generation: u32,
    /// Native block size of the backing store, in bytes.
    pub block_size: u32,
    /// Tools version recorded for the image.
    pub tools_version: u32,
    /// Virtual hardware version recorded for the image.
    pub virtual_hw_version: u32,
}

/// Trait for positioned file I/O with an attribute surface.
///
/// `generation` advances once per open, on the first write, unless an
/// explicit [`SET_GENERATION`] disarmed regeneration first. This is what
/// lets a clean close record a generation that later writes cannot move,
/// and what makes an unclean shutdown observable on reopen.
pub trait FileIo: Send + Sync + 'static {
    /// Reads bytes from the file at the specified offset into the buffer.
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()>;
    /// Writes bytes to the file at the specified offset from the buffer.
    fn write_at(&self, off: u64, src: &[u8]) -> Result<()>;
    /// Returns the current attributes of the file.
    fn attrs(&self) -> Result<FileAttrs>;
    /// Applies the attributes selected by `op` (`SET_*` flags).
    fn set_attrs(&self, op: u32, attrs: &FileAttrs) -> Result<()>;
    /// Synchronizes file data to stable storage.
    fn sync_all(&self) -> Result<()> {
        Ok(())
    }
}

#[cfg(unix)]
mod stdio_unix {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::unix::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.read_at(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "read_at reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.write_at(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "write_at wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

#[cfg(windows)]
mod stdio_win {
    use std::fs::File;
    use std::io::{self, ErrorKind};
    use std::os::windows::fs::FileExt;

    pub fn read_exact(file: &File, mut off: u64, mut dst: &mut [u8]) -> io::Result<()> {
        while !dst.is_empty() {
            let read = file.seek_read(dst, off)?;
            if read == 0 {
                return Err(io::Error::new(
                    ErrorKind::UnexpectedEof,
                    "seek_read reached EOF",
                ));
            }
            let (_, tail) = dst.split_at_mut(read);
            dst = tail;
            off += read as u64;
        }
        Ok(())
    }

    pub fn write_all(file: &File, mut off: u64, mut src: &[u8]) -> io::Result<()> {
        while !src.is_empty() {
            let written = file.seek_write(src, off)?;
            if written == 0 {
                return Err(io::Error::new(
                    ErrorKind::WriteZero,
                    "seek_write wrote zero bytes",
                ));
            }
            src = &src[written..];
            off += written as u64;
        }
        Ok(())
    }
}

const ATTRS_SIDECAR_SUFFIX: &str = "attrs";
const ATTRS_SIDECAR_LEN: usize = 16;

struct AttrState {
    generation: u32,
    tools_version: u32,
    virtual_hw_version: u32,
    /// Armed at open; the first write bumps the generation and disarms.
    regenerate: bool,
}

/// Production [`FileIo`] over `std::fs::File` positioned I/O.
///
/// The generation counter and version fields live in a small sidecar file
/// next to the data file, so an unclean shutdown is observable across
/// process restarts. The sidecar is rewritten before the generation-bumping
/// write proceeds; a crash in between errs toward running recovery.
pub struct StdFileIo {
    inner: Arc<File>,
    sidecar: PathBuf,
    attrs: Mutex<AttrState>,
    block_size: u32,
}

impl StdFileIo {
    /// Opens or creates a file for read-write access.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(CowError::from)?;
        let sidecar = append_suffix(path, ATTRS_SIDECAR_SUFFIX);
        let (generation, tools_version, virtual_hw_version) = read_sidecar(&sidecar)?;
        Ok(Self {
            inner: Arc::new(file),
            sidecar,
            attrs: Mutex::new(AttrState {
                generation,
                tools_version,
                virtual_hw_version,
                regenerate: true,
            }),
            block_size: 512,
        })
    }

    fn file(&self) -> &File {
        &self.inner
    }

    fn persist_attrs(&self, state: &AttrState) -> Result<()> {
        let mut buf = [0u8; ATTRS_SIDECAR_LEN];
        buf[0..4].copy_from_slice(&state.generation.to_le_bytes());
        buf[4..8].copy_from_slice(&state.tools_version.to_le_bytes());
        buf[8..12].copy_from_slice(&state.virtual_hw_version.to_le_bytes());
        std::fs::write(&self.sidecar, buf).map_err(CowError::from)
    }

    fn bump_generation_if_armed(&self) -> Result<()> {
        let mut state = self.attrs.lock();
        if state.regenerate {
            state.generation = state.generation.wrapping_add(1);
            state.regenerate = false;
            self.persist_attrs(&state)?;
        }
        Ok(())
    }
}

fn append_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.file_name().map(|n| n.to_os_string()).unwrap_or_default();
    name.push(".");
    name.push(suffix);
    path.with_file_name(name)
}

fn read_sidecar(path: &Path) -> Result<(u32, u32, u32)> {
    match std::fs::read(path) {
        Ok(bytes) if bytes.len() >= ATTRS_SIDECAR_LEN => Ok((
            u32::from_le_bytes(bytes[0..4].try_into().expect("slice is 4 bytes")),
            u32::from_le_bytes(bytes[4..8].try_into().expect("slice is 4 bytes")),
            u32::from_le_bytes(bytes[8..12].try_into().expect("slice is 4 bytes")),
        )),
        Ok(_) => Err(CowError::Corruption("attribute sidecar truncated")),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok((0, 0, 0)),
        Err(err) => Err(CowError::Io(err)),
    }
}

impl FileIo for StdFileIo {
    fn read_at(&self, off: u64, dst: &mut [u8]) -> Result<()> {
        #[cfg(unix)]
        return stdio_unix::read_exact(self.file(), off, dst).map_err(CowError::from);
        #[cfg(windows)]
        return stdio_win::read_exact(self.file(), off, dst).map_err(CowError::from);
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (off, dst);
            Err(CowError::Io(std::io::Error::new(
                ErrorKind::Unsupported,
                "StdFileIo unsupported on this platform",
            )))
        }
    }

    fn write_at(&self, off: u64, src: &[u8]) -> Result<()> {
        self.bump_generation_if_armed()?;
        #[cfg(unix)]
        return stdio_unix::write_all(self.file(), off, src).map_err(CowError::from);
        #[cfg(windows)]
        return stdio_win::write_all(self.file(), off, src).map_err(CowError::from);
        #[cfg(not(any(unix, windows)))]
        {
            let _ = (off, src);
            Err(CowError::Io(std::io::Error::new(
                ErrorKind::Unsupported,
                "StdFileIo unsupported on this platform",
            )))
        }
    }

    fn attrs(&self) -> Result<FileAttrs> {
        let length = self.file().metadata().map_err(CowError::from)?.len();
        let state = self.attrs.lock();
        Ok(FileAttrs {
            length,
            generation: state.generation,
            block_size: self.block_size,
            tools_version: state.tools_version,
            virtual_hw_version: state.virtual_hw_version,
        })
    }

    fn set_attrs(&self, op: u32, attrs: &FileAttrs) -> Result<()> {
        if op & SET_LENGTH != 0 {
            self.file().set_len(attrs.length).map_err(CowError::from)?;
        }
        if op & (SET_GENERATION | SET_TOOLS_VERSION | SET_VIRTUAL_HW_VERSION) != 0 {
            let mut state = self.attrs.lock();
            if op & SET_GENERATION != 0 {
                state.generation = attrs.generation;
                state.regenerate = false;
            }
            if op & SET_TOOLS_VERSION != 0 {
                state.tools_version = attrs.tools_version;
            }
            if op & SET_VIRTUAL_HW_VERSION != 0 {
                state.virtual_hw_version = attrs.virtual_hw_version;
            }
            self.persist_attrs(&state)?;
        }
        Ok(())
    }

    fn sync_all(&self) -> Result<()> {
        self.file().sync_all().map_err(CowError::from)
    }
}
