//! Program loading
//!
//! [`spawn`] starts a new environment running an executable image from the
//! file system:
//!
//! 1. Open the image and parse the header ([`crate::ExoError::NotExec`] on a bad one)
//! 2. `exofork` a paused child
//! 3. Seed the child trapframe from the one `exofork` gave it and point
//!    `eip` at the entry
//! 4. Build the argument stack ([`init_stack`]) and point `esp` at it
//! 5. Map every loadable segment:
//!    - text pages are the image's own pages, shared read-only
//!    - data and bss pages are private copies, zero past the file-backed part
//! 6. Install the trapframe and mark the child runnable
//!
//! If any step after the fork fails, the half-built child is destroyed by
//! [`ChildGuard`] so that none of its pages leak.

use log::{debug, info, warn};

use crate::elf::{ElfImage, HeaderBuf, Segment};
use crate::env::{EnvId, EnvStatus};
use crate::file::{read_exact, read_full, File, FileSystem};
use crate::memory::{round_down, round_up, Perm, VirtAddr, PAGE_SIZE, UTEMP};
use crate::stack::init_stack;
use crate::syscall::{EnvTable, Syscalls, UserMemory};
use crate::Result;

/// Parent scratch page used to fill data pages
pub const DATA_SCRATCH: VirtAddr = UTEMP;

/// Start `path` as a new environment with arguments `argv`
///
/// By convention `argv[0]` is the program name.
///
/// # Arguments
/// * `rt` - Substrate of the calling environment
/// * `fs` - File system holding the image
/// * `path` - Image path
/// * `argv` - Arguments copied onto the child's stack
///
/// # Returns
/// Id of the new, runnable child
///
/// # Errors
/// - [`crate::ExoError::NotFound`] if the image does not exist
/// - [`crate::ExoError::NotExec`] if the image is not a valid executable
/// - [`crate::ExoError::NoMem`] if frames run out or `argv` does not fit
/// - any other substrate error from forking or mapping
pub fn spawn<R, F>(rt: &R, fs: &F, path: &str, argv: &[&str]) -> Result<EnvId>
where
    R: Syscalls + EnvTable + UserMemory + ?Sized,
    F: FileSystem + ?Sized,
{
    let mut file = fs.open(path)?;

    let mut header = HeaderBuf::new();
    let len = read_full(&mut file, header.as_mut_bytes())?;
    header.set_len(len);

    let elf = ElfImage::parse(&header)?;
    let entry = elf.entry()?;
    // Reject a bad segment table before anything is created
    for segment in elf.segments() {
        segment?;
    }

    let child = rt.exofork()?;
    let guard = ChildGuard::new(rt, child);

    let mut tf = rt.trapframe(child)?;
    tf.eip = entry.as_u32();
    tf.esp = init_stack(rt, rt, child, argv)?.as_u32();

    for segment in elf.segments() {
        let segment = segment?;
        if segment.writable {
            map_data_segment(rt, rt, &mut file, child, &segment)?;
        } else {
            map_text_segment(rt, &mut file, child, &segment)?;
        }
    }

    rt.env_set_trapframe(child, &tf)?;
    rt.env_set_status(child, EnvStatus::Runnable)?;

    info!(
        "spawn: {} as {} entry {:#010x} esp {:#010x}",
        path, child, tf.eip, tf.esp
    );

    Ok(guard.disarm())
}

/// Spawn with the arguments listed inline
///
/// ```ignore
/// let child = spawnl!(&rt, &fs, "echo", "echo", "hello")?;
/// ```
#[macro_export]
macro_rules! spawnl {
    ($rt:expr, $fs:expr, $path:expr $(, $arg:expr)* $(,)?) => {
        $crate::spawn::spawn($rt, $fs, $path, &[$($arg),*])
    };
}

/// Share the pages of a read-only segment with `child`
///
/// Each page is the image's backing page obtained through
/// [`File::read_map`], mapped user read-only. Nothing is copied.
pub fn map_text_segment<S, F>(sys: &S, file: &mut F, child: EnvId, segment: &Segment) -> Result<()>
where
    S: Syscalls + ?Sized,
    F: File + ?Sized,
{
    let start = round_down(segment.offset as usize, PAGE_SIZE);
    let end = round_up(segment.file_limit() as usize, PAGE_SIZE);
    let va = segment.vaddr.page_round_down();

    for off in (start..end).step_by(PAGE_SIZE) {
        let blk = file.read_map(off as u32)?;
        let dst = va.offset(off - start);
        sys.page_map(EnvId::SELF, blk, child, dst, Perm::USER_RO)?;
        debug!("spawn: text {:#x} -> {} {}", off, child, dst);
    }

    Ok(())
}

/// Give `child` private pages for a writable segment
///
/// Every page covering `[vaddr, vaddr + memsz)` is freshly allocated at
/// [`DATA_SCRATCH`], filled from the image up to the segment's file limit,
/// left zero beyond it, mapped user read-write into `child` and unmapped
/// again from the caller.
pub fn map_data_segment<S, M, F>(
    sys: &S,
    mem: &M,
    file: &mut F,
    child: EnvId,
    segment: &Segment,
) -> Result<()>
where
    S: Syscalls + ?Sized,
    M: UserMemory + ?Sized,
    F: File + ?Sized,
{
    let start = round_down(segment.offset as usize, PAGE_SIZE);
    let end = round_up(segment.offset as usize + segment.memsz as usize, PAGE_SIZE);
    let limit = segment.file_limit() as usize;
    let va = segment.vaddr.page_round_down();

    for off in (start..end).step_by(PAGE_SIZE) {
        let dst = va.offset(off - start);
        let filled = if off < limit { (limit - off).min(PAGE_SIZE) } else { 0 };

        sys.page_alloc(EnvId::SELF, DATA_SCRATCH, Perm::USER_RW)?;
        let mapped = fill_data_page(sys, mem, file, off, filled, child, dst);
        let unmapped = sys.page_unmap(EnvId::SELF, DATA_SCRATCH);
        mapped?;
        unmapped?;

        debug!(
            "spawn: data {:#x} -> {} {} ({} bytes from file)",
            off, child, dst, filled
        );
    }

    Ok(())
}

fn fill_data_page<S, M, F>(
    sys: &S,
    mem: &M,
    file: &mut F,
    off: usize,
    filled: usize,
    child: EnvId,
    dst: VirtAddr,
) -> Result<()>
where
    S: Syscalls + ?Sized,
    M: UserMemory + ?Sized,
    F: File + ?Sized,
{
    // page_alloc hands out zeroed pages, so only the file part is written
    if filled > 0 {
        let mut page = [0u8; PAGE_SIZE];
        file.seek(off as u32)?;
        read_exact(file, &mut page[..filled])?;
        mem.write(DATA_SCRATCH, &page[..filled])?;
    }
    sys.page_map(EnvId::SELF, DATA_SCRATCH, child, dst, Perm::USER_RW)
}

/// Destroys a partially built child unless disarmed
///
/// Destroying the child releases every page it maps, so a spawn that fails
/// half way leaves nothing behind.
pub struct ChildGuard<'a, S: Syscalls + ?Sized> {
    sys: &'a S,
    child: EnvId,
    armed: bool,
}

impl<'a, S: Syscalls + ?Sized> ChildGuard<'a, S> {
    pub fn new(sys: &'a S, child: EnvId) -> Self {
        Self {
            sys,
            child,
            armed: true,
        }
    }

    pub fn id(&self) -> EnvId {
        self.child
    }

    /// Keep the child and return its id
    pub fn disarm(mut self) -> EnvId {
        self.armed = false;
        self.child
    }
}

impl<S: Syscalls + ?Sized> Drop for ChildGuard<'_, S> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        warn!("spawn: destroying partially built child {}", self.child);
        if let Err(err) = self.sys.env_destroy(self.child) {
            warn!("spawn: failed to destroy child {}: {}", self.child, err);
        }
    }
}
