//! In-memory file system
//!
//! Files are installed whole into physical frames up front. Reads copy out
//! of those frames; [`File::read_map`] maps the backing frame itself into
//! the reader, read-only, at
//! `FILEVA + fd * MAXFILESIZE + offset`, so every reader of a page sees the
//! same physical memory.

use std::collections::BTreeMap;

use log::{debug, warn};

use exo_sdk::file::{File, FileSystem};
use exo_sdk::memory::{FILEVA, MAXFILESIZE, PAGE_SIZE};
use exo_sdk::{ExoError, Perm, Result, VirtAddr};

use crate::env::Pte;
use crate::frame::FrameTable;
use crate::machine::{insert_page, remove_page, EnvHandle};

/// Maximum files open per environment
pub const MAXOPEN: usize = 32;

/// Longest accepted path
pub const MAXPATHLEN: usize = 1024;

pub(crate) struct FileEntry {
    pub frames: Vec<usize>,
    pub size: u32,
}

#[derive(Default)]
pub(crate) struct Files {
    entries: BTreeMap<String, FileEntry>,
}

impl Files {
    pub(crate) fn install(
        &mut self,
        frames: &mut FrameTable,
        path: &str,
        data: &[u8],
    ) -> Result<()> {
        if path.is_empty() || path.len() >= MAXPATHLEN {
            return Err(ExoError::BadPath);
        }
        if self.entries.contains_key(path) {
            return Err(ExoError::FileExists);
        }
        if data.len() > MAXFILESIZE as usize {
            return Err(ExoError::Invalid);
        }

        let mut backing = Vec::with_capacity(data.len().div_ceil(PAGE_SIZE));
        for chunk in data.chunks(PAGE_SIZE) {
            let Some(frame) = frames.alloc() else {
                for &frame in &backing {
                    frames.decref(frame);
                }
                return Err(ExoError::NoMem);
            };
            frames.incref(frame);
            frames.bytes_mut(frame)[..chunk.len()].copy_from_slice(chunk);
            backing.push(frame);
        }

        self.entries.insert(
            path.to_string(),
            FileEntry {
                frames: backing,
                size: data.len() as u32,
            },
        );
        Ok(())
    }

    pub(crate) fn get(&self, path: &str) -> Option<&FileEntry> {
        self.entries.get(path)
    }
}

/// File system as seen by one environment
#[derive(Debug, Clone)]
pub struct MemFs {
    env: EnvHandle,
}

impl MemFs {
    pub(crate) fn new(env: EnvHandle) -> Self {
        Self { env }
    }
}

impl FileSystem for MemFs {
    type File = MemFile;

    fn open(&self, path: &str) -> Result<MemFile> {
        let shared = self.env.shared();
        let mut state = shared.state.lock();
        let state = &mut *state;

        let size = state.files.get(path).ok_or(ExoError::NotFound)?.size;
        let env = state.envs.get_mut(self.env.id())?;
        let fd = (0..state.max_open)
            .find(|fd| !env.open_files.contains(fd))
            .ok_or(ExoError::MaxOpen)?;
        env.open_files.insert(fd);

        debug!("open: {} fd {} {} ({} bytes)", self.env.id(), fd, path, size);
        Ok(MemFile {
            env: self.env.clone(),
            path: path.to_string(),
            fd,
            size,
            pos: 0,
            views: Vec::new(),
        })
    }
}

/// An open file; closed when dropped
#[derive(Debug)]
pub struct MemFile {
    env: EnvHandle,
    path: String,
    fd: usize,
    size: u32,
    pos: u32,
    views: Vec<VirtAddr>,
}

impl MemFile {
    pub fn fd(&self) -> usize {
        self.fd
    }

    pub fn size(&self) -> u32 {
        self.size
    }

    /// Address of the view of the page at `offset`
    fn view_va(&self, offset: u32) -> VirtAddr {
        FILEVA.offset(self.fd * MAXFILESIZE as usize + offset as usize)
    }
}

impl File for MemFile {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let shared = self.env.shared();
        let state = shared.state.lock();
        let file = state.files.get(&self.path).ok_or(ExoError::NotFound)?;

        let remaining = self.size.saturating_sub(self.pos) as usize;
        let n = remaining.min(buf.len());
        for (i, byte) in buf[..n].iter_mut().enumerate() {
            let off = self.pos as usize + i;
            *byte = state.frames.bytes(file.frames[off / PAGE_SIZE])[off % PAGE_SIZE];
        }
        self.pos += n as u32;
        Ok(n)
    }

    fn seek(&mut self, offset: u32) -> Result<()> {
        self.pos = offset;
        Ok(())
    }

    fn read_map(&mut self, offset: u32) -> Result<VirtAddr> {
        if offset as usize % PAGE_SIZE != 0 {
            return Err(ExoError::Invalid);
        }
        if offset >= self.size {
            return Err(ExoError::Eof);
        }

        let va = self.view_va(offset);
        let shared = self.env.shared();
        let mut state = shared.state.lock();
        let state = &mut *state;

        let frame = state.files.get(&self.path).ok_or(ExoError::NotFound)?.frames
            [offset as usize / PAGE_SIZE];
        let env = state.envs.get_mut(self.env.id())?;
        insert_page(
            &mut state.frames,
            env,
            va,
            Pte {
                frame,
                perm: Perm::USER_RO,
            },
        );

        if !self.views.contains(&va) {
            self.views.push(va);
        }
        Ok(va)
    }
}

impl Drop for MemFile {
    fn drop(&mut self) {
        let shared = self.env.shared();
        let mut state = shared.state.lock();
        let state = &mut *state;

        // The environment may already be gone, taking its mappings with it
        let Ok(env) = state.envs.get_mut(self.env.id()) else {
            warn!("close: fd {} outlived env {}", self.fd, self.env.id());
            return;
        };
        for &va in &self.views {
            remove_page(&mut state.frames, env, va);
        }
        env.open_files.remove(&self.fd);
        debug!("close: {} fd {}", self.env.id(), self.fd);
    }
}
