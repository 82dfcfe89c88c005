//! One mapped region of a chain.
//!
//! A `Segment` wraps a raw memory mapping, either anonymous or backed by a
//! byte range of an open file. Segments are created, held for the life of
//! their chain, and dropped; they are never remapped or resized. Growth of
//! a file-backed chain maps the newly extended byte range as a fresh
//! segment, so addresses inside older segments stay valid.

use std::fs::File;

use eyre::{Result, WrapErr};
use memmap2::{MmapOptions, MmapRaw};

#[derive(Debug)]
pub(crate) struct Segment {
    map: MmapRaw,
}

impl Segment {
    pub fn anonymous(len: usize) -> Result<Self> {
        let map = MmapOptions::new()
            .len(len)
            .map_anon()
            .wrap_err_with(|| format!("failed to map {len} anonymous bytes"))?;
        Ok(Self {
            map: MmapRaw::from(map),
        })
    }

    /// Maps `len` bytes of `file` starting at `offset`. The file must be
    /// open for reading and writing, and the range must already exist.
    pub fn file_backed(file: &File, offset: u64, len: usize) -> Result<Self> {
        let map = MmapOptions::new()
            .offset(offset)
            .len(len)
            .map_raw(file)
            .wrap_err_with(|| format!("failed to map {len} bytes at file offset {offset}"))?;
        Ok(Self { map })
    }

    pub fn base(&self) -> *mut u8 {
        self.map.as_mut_ptr()
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    /// Synchronously writes the mapped range back to its file.
    pub fn flush(&self) -> Result<()> {
        self.map.flush().wrap_err("failed to flush segment to disk")
    }

    /// Hints the kernel to fault the whole range in ahead of use.
    pub fn prefetch(&self) {
        #[cfg(unix)]
        // SAFETY: madvise with MADV_WILLNEED is advisory only, and the
        // range [base, base + len) is exactly this live mapping.
        unsafe {
            libc::madvise(
                self.map.as_mut_ptr() as *mut libc::c_void,
                self.map.len(),
                libc::MADV_WILLNEED,
            );
        }
    }
}
