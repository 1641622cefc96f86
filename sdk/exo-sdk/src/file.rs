//! File interfaces used by the program loader
//!
//! The file system itself lives outside this library; the loader only needs
//! to open an image, read and seek, and obtain zero-copy views of whole
//! pages. A handle is closed when it is dropped.

use crate::memory::VirtAddr;
use crate::{ExoError, Result};

/// An open file
pub trait File {
    /// Read up to `buf.len()` bytes at the current offset
    ///
    /// Returns the number of bytes read; `0` at end of file.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Move the current offset to `offset`
    fn seek(&mut self, offset: u32) -> Result<()>;

    /// Map the file page at `offset` read-only into the caller
    ///
    /// `offset` must be page aligned. Returns the caller's virtual address
    /// of the view. The page is the file's own backing page, not a copy.
    fn read_map(&mut self, offset: u32) -> Result<VirtAddr>;
}

/// Something that can open files by path
pub trait FileSystem {
    type File: File;

    fn open(&self, path: &str) -> Result<Self::File>;
}

/// Read until `buf` is full or the file ends
///
/// Returns the number of bytes read.
pub fn read_full<F: File + ?Sized>(file: &mut F, buf: &mut [u8]) -> Result<usize> {
    let mut total = 0;
    while total < buf.len() {
        let n = file.read(&mut buf[total..])?;
        if n == 0 {
            break;
        }
        total += n;
    }
    Ok(total)
}

/// Read exactly `buf.len()` bytes or fail with [`ExoError::Eof`]
pub fn read_exact<F: File + ?Sized>(file: &mut F, buf: &mut [u8]) -> Result<()> {
    if read_full(file, buf)? < buf.len() {
        return Err(ExoError::Eof);
    }
    Ok(())
}
