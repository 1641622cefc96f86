//! Segment table of an executable image
//!
//! Only the first [`ELF_HEADER_SIZE`] bytes of an image are ever read by the
//! loader: the ELF header and the program header table must both fit there.
//! Parsing is done by `xmas-elf`; this module validates the parts of the
//! header `xmas-elf` trusts blindly (table bounds and alignment) so that a
//! corrupt image yields [`ExoError::NotExec`] instead of a panic.

use xmas_elf::header::{self, Class};
use xmas_elf::program::{ProgramHeader, Type};
use xmas_elf::ElfFile;

use crate::memory::{VirtAddr, PAGE_SIZE};
use crate::{ExoError, Result};

/// Bytes of the image read to find the segment table
pub const ELF_HEADER_SIZE: usize = 512;

/// Buffer holding the start of an image
///
/// Aligned so that `xmas-elf` can reinterpret the header and program header
/// table in place.
#[repr(C, align(8))]
pub struct HeaderBuf {
    bytes: [u8; ELF_HEADER_SIZE],
    len: usize,
}

impl HeaderBuf {
    pub const fn new() -> Self {
        Self {
            bytes: [0; ELF_HEADER_SIZE],
            len: 0,
        }
    }

    /// Build a header buffer from the first bytes of an image
    ///
    /// Anything past [`ELF_HEADER_SIZE`] is ignored.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut buf = Self::new();
        let len = data.len().min(ELF_HEADER_SIZE);
        buf.bytes[..len].copy_from_slice(&data[..len]);
        buf.len = len;
        buf
    }

    /// Whole buffer, for filling from a file
    pub fn as_mut_bytes(&mut self) -> &mut [u8; ELF_HEADER_SIZE] {
        &mut self.bytes
    }

    /// Record how many bytes of the buffer hold image data
    pub fn set_len(&mut self, len: usize) {
        self.len = len.min(ELF_HEADER_SIZE);
    }

    /// Image bytes present in the buffer
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.len]
    }
}

impl Default for HeaderBuf {
    fn default() -> Self {
        Self::new()
    }
}

/// A loadable segment
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Offset of the segment in the image
    pub offset: u32,
    /// Virtual address in the child
    pub vaddr: VirtAddr,
    /// Bytes backed by the image
    pub filesz: u32,
    /// Bytes occupied in memory (the tail past `filesz` is zero)
    pub memsz: u32,
    /// Segment is writable (data/bss) rather than text
    pub writable: bool,
}

impl Segment {
    /// File offset just past the file-backed part of the segment
    pub fn file_limit(&self) -> u32 {
        self.offset + self.filesz
    }
}

/// Parsed image header
pub struct ElfImage<'a> {
    file: ElfFile<'a>,
}

impl<'a> ElfImage<'a> {
    /// Parse and validate the header at the start of `buf`
    ///
    /// # Errors
    /// [`ExoError::NotExec`] if the magic is wrong, the class is unknown, or
    /// the program header table does not lie within the buffer.
    pub fn parse(buf: &'a HeaderBuf) -> Result<Self> {
        let data = buf.as_bytes();

        if data.len() < 4 || data[..4] != header::MAGIC {
            return Err(ExoError::NotExec);
        }

        let file = ElfFile::new(data).map_err(|_| ExoError::NotExec)?;

        let (ph_size, ph_align) = match file.header.pt1.class() {
            Class::ThirtyTwo => (32, 4),
            Class::SixtyFour => (56, 8),
            _ => return Err(ExoError::NotExec),
        };

        let pt2 = &file.header.pt2;
        let count = pt2.ph_count() as usize;
        if count > 0 {
            let offset = usize::try_from(pt2.ph_offset()).map_err(|_| ExoError::NotExec)?;
            let entry_size = pt2.ph_entry_size() as usize;
            let table_end = entry_size
                .checked_mul(count)
                .and_then(|len| len.checked_add(offset))
                .ok_or(ExoError::NotExec)?;

            if offset == 0
                || entry_size < ph_size
                || offset % ph_align != 0
                || entry_size % ph_align != 0
                || table_end > data.len()
            {
                return Err(ExoError::NotExec);
            }
        }

        Ok(Self { file })
    }

    /// Entry point of the program
    pub fn entry(&self) -> Result<VirtAddr> {
        let entry = self.file.header.pt2.entry_point();
        u32::try_from(entry)
            .map(VirtAddr::new)
            .map_err(|_| ExoError::NotExec)
    }

    /// Loadable segments in program header order
    pub fn segments(&self) -> impl Iterator<Item = Result<Segment>> + '_ {
        self.file
            .program_iter()
            .filter(|ph| ph.get_type() == Ok(Type::Load))
            .map(|ph| segment_from(&ph))
    }
}

fn segment_from(ph: &ProgramHeader<'_>) -> Result<Segment> {
    let narrow = |value: u64| u32::try_from(value).map_err(|_| ExoError::NotExec);

    let segment = Segment {
        offset: narrow(ph.offset())?,
        vaddr: VirtAddr::new(narrow(ph.virtual_addr())?),
        filesz: narrow(ph.file_size())?,
        memsz: narrow(ph.mem_size())?,
        writable: ph.flags().is_write(),
    };

    // Pages are mapped whole, so file and memory must agree on page offsets
    if segment.offset as usize % PAGE_SIZE != segment.vaddr.page_offset()
        || segment.filesz > segment.memsz
        || segment.offset.checked_add(segment.memsz).is_none()
        || segment.vaddr.as_u32().checked_add(segment.memsz).is_none()
    {
        return Err(ExoError::NotExec);
    }

    Ok(segment)
}
