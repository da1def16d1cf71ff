//! Scatter-gather plumbing: a guest memory image shared between the issuer
//! and completion threads, virtual-disk scatter lists, and per-file scatter
//! lists with in-place coalescing.

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::error::{CowError, Result};
use crate::io::FileIo;

/// 512-byte disk sector.
pub const SECTOR_SIZE: u64 = 512;

/// Memory image backing one guest I/O, addressable by byte offset.
pub struct GuestMem {
    data: Mutex<Box<[u8]>>,
}

impl GuestMem {
    /// Allocates a zeroed image of `len` bytes.
    pub fn new(len: usize) -> Self {
        Self {
            data: Mutex::new(vec![0u8; len].into_boxed_slice()),
        }
    }

    /// Wraps an existing buffer.
    pub fn from_vec(data: Vec<u8>) -> Self {
        Self {
            data: Mutex::new(data.into_boxed_slice()),
        }
    }

    /// Length of the image in bytes.
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Returns true if the image is empty.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies `src` into the image at `off`.
    pub fn write_from(&self, off: usize, src: &[u8]) {
        self.data.lock()[off..off + src.len()].copy_from_slice(src);
    }

    /// Copies image bytes at `off` into `dst`.
    pub fn read_into(&self, off: usize, dst: &mut [u8]) {
        dst.copy_from_slice(&self.data.lock()[off..off + dst.len()]);
    }

    /// Fills `len` bytes at `off` with `value`.
    pub fn fill(&self, off: usize, len: usize, value: u8) {
        self.data.lock()[off..off + len].fill(value);
    }

    /// Copies the whole image out.
    pub fn snapshot(&self) -> Vec<u8> {
        self.data.lock().to_vec()
    }

    pub(crate) fn with_slice<R>(&self, f: impl FnOnce(&[u8]) -> R) -> R {
        f(&self.data.lock())
    }

    pub(crate) fn with_slice_mut<R>(&self, f: impl FnOnce(&mut [u8]) -> R) -> R {
        f(&mut self.data.lock())
    }
}

/// One element of a guest scatter list: `len` bytes at virtual-disk byte
/// offset `disk_off`, backed by the image at `mem_off`.
#[derive(Clone, Copy, Debug)]
pub struct GuestSeg {
    /// Byte offset on the virtual disk.
    pub disk_off: u64,
    /// Byte offset into the guest memory image.
    pub mem_off: usize,
    /// Length in bytes.
    pub len: usize,
}

/// Guest-side scatter list for one I/O.
#[derive(Clone, Debug, Default)]
pub struct GuestSg {
    /// Segments, in ascending virtual-disk order for well-formed requests.
    pub segs: SmallVec<[GuestSeg; 4]>,
}

impl GuestSg {
    /// Single contiguous request.
    pub fn contiguous(disk_off: u64, mem_off: usize, len: usize) -> Self {
        let mut sg = Self::default();
        sg.segs.push(GuestSeg {
            disk_off,
            mem_off,
            len,
        });
        sg
    }

    /// Total bytes covered by the list.
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len).sum()
    }
}

/// One element of a per-file scatter list.
#[derive(Clone, Copy, Debug)]
pub struct FileSeg {
    /// Byte offset in the backing file.
    pub file_off: u64,
    /// Byte offset into the guest memory image.
    pub mem_off: usize,
    /// Length in bytes.
    pub len: usize,
}

/// Per-file scatter list with in-place coalescing, so the number of entries
/// stays bounded when consecutive grains land next to each other.
#[derive(Clone, Debug, Default)]
pub struct FileSg {
    /// Coalesced segments.
    pub segs: SmallVec<[FileSeg; 16]>,
}

impl FileSg {
    /// Appends a segment, merging it with the previous one when both the
    /// file offsets and the memory offsets are contiguous. A discontinuity
    /// must land on a sector boundary.
    pub fn push_coalesce(&mut self, seg: FileSeg) -> Result<()> {
        if let Some(last) = self.segs.last_mut() {
            let file_contig = last.file_off + last.len as u64 == seg.file_off;
            let mem_contig = last.mem_off + last.len == seg.mem_off;
            if file_contig && mem_contig {
                last.len += seg.len;
                return Ok(());
            }
            if !file_contig && seg.file_off % SECTOR_SIZE != 0 {
                return Err(CowError::BadParam("discontinuous segment not sector aligned"));
            }
        }
        self.segs.push(seg);
        Ok(())
    }

    /// Total bytes covered by the list.
    pub fn total_len(&self) -> usize {
        self.segs.iter().map(|s| s.len).sum()
    }

    /// Returns true if the list has no segments.
    pub fn is_empty(&self) -> bool {
        self.segs.is_empty()
    }
}

/// Reads every segment of `sg` from `file` into the guest image.
pub fn read_scatter(file: &dyn FileIo, mem: &GuestMem, sg: &FileSg) -> Result<()> {
    mem.with_slice_mut(|data| {
        for seg in &sg.segs {
            file.read_at(seg.file_off, &mut data[seg.mem_off..seg.mem_off + seg.len])?;
        }
        Ok(())
    })
}

/// Writes every segment of `sg` from the guest image to `file`.
pub fn write_scatter(file: &dyn FileIo, mem: &GuestMem, sg: &FileSg) -> Result<()> {
    mem.with_slice(|data| {
        for seg in &sg.segs {
            file.write_at(seg.file_off, &data[seg.mem_off..seg.mem_off + seg.len])?;
        }
        Ok(())
    })
}

/// Writes every segment of `sg` taking bytes from `data` instead of a guest
/// image; used by the synchronous write path and commit.
pub fn write_scatter_slice(file: &dyn FileIo, data: &[u8], sg: &FileSg) -> Result<()> {
    for seg in &sg.segs {
        file.write_at(seg.file_off, &data[seg.mem_off..seg.mem_off + seg.len])?;
    }
    Ok(())
}

/// Writes a gather list of owned buffers.
pub fn write_gather(file: &dyn FileIo, bufs: &[(u64, Bytes)]) -> Result<()> {
    for (off, buf) in bufs {
        file.write_at(*off, buf)?;
    }
    Ok(())
}
