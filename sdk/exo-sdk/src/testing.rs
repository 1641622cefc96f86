//! Scripted substrate for unit tests
//!
//! Single-threaded stand-in for the kernel: records every primitive call,
//! keeps a tiny frame store so page contents can be inspected, and lets a
//! test script send results or inject failures.

use core::cell::RefCell;
use std::collections::{BTreeMap, VecDeque};
use std::string::{String, ToString};
use std::vec::Vec;

use crate::env::{EnvId, EnvStatus, Mailbox, Trapframe, FL_IF};
use crate::file::{File, FileSystem};
use crate::memory::{Perm, VirtAddr, FILEVA, MAXFILESIZE, PAGE_SIZE};
use crate::syscall::{EnvTable, Syscalls, UserMemory};
use crate::{ExoError, Result};

pub(crate) const SELF_ID: EnvId = EnvId::new(0x1000);
pub(crate) const CHILD_ID: EnvId = EnvId::new(0x1001);

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Call {
    Exofork,
    SetTrapframe(EnvId, Trapframe),
    SetStatus(EnvId, EnvStatus),
    Destroy(EnvId),
    PageAlloc(EnvId, VirtAddr, Perm),
    PageMap(EnvId, VirtAddr, EnvId, VirtAddr, Perm),
    PageUnmap(EnvId, VirtAddr),
    Recv(VirtAddr),
    TrySend(EnvId, u32, VirtAddr, Perm),
    Yield,
}

#[derive(Default)]
struct State {
    calls: Vec<Call>,
    frames: Vec<Vec<u8>>,
    pages: BTreeMap<(EnvId, u32), (usize, Perm)>,
    file_frames: BTreeMap<(usize, u32), usize>,
    send_results: VecDeque<Result<()>>,
    recv_error: Option<ExoError>,
    delivery: Option<Mailbox>,
    mailbox: Mailbox,
    mailbox_lookups: Vec<EnvId>,
    fail_map_into: Option<(EnvId, ExoError)>,
}

pub(crate) struct Fake {
    state: RefCell<State>,
}

fn resolve(env: EnvId) -> EnvId {
    if env.is_self() {
        SELF_ID
    } else {
        env
    }
}

impl Fake {
    pub(crate) fn new() -> Self {
        Self {
            state: RefCell::new(State::default()),
        }
    }

    /// Primitive calls made so far, in order
    pub(crate) fn calls(&self) -> Vec<Call> {
        self.state.borrow().calls.clone()
    }

    /// Results returned by successive `ipc_try_send` calls (then `Ok`)
    pub(crate) fn script_sends<I: IntoIterator<Item = Result<()>>>(&self, results: I) {
        self.state.borrow_mut().send_results.extend(results);
    }

    /// Mailbox contents installed by the next `ipc_recv`
    pub(crate) fn deliver(&self, mailbox: Mailbox) {
        self.state.borrow_mut().delivery = Some(mailbox);
    }

    pub(crate) fn fail_recv(&self, err: ExoError) {
        self.state.borrow_mut().recv_error = Some(err);
    }

    /// Fail every `page_map` whose destination is `env`
    pub(crate) fn fail_map_into(&self, env: EnvId, err: ExoError) {
        self.state.borrow_mut().fail_map_into = Some((env, err));
    }

    pub(crate) fn mailbox_lookups(&self) -> Vec<EnvId> {
        self.state.borrow().mailbox_lookups.clone()
    }

    pub(crate) fn is_mapped(&self, env: EnvId, va: VirtAddr) -> bool {
        self.state.borrow().pages.contains_key(&(resolve(env), va.vpn()))
    }

    pub(crate) fn perm_of(&self, env: EnvId, va: VirtAddr) -> Option<Perm> {
        self.state
            .borrow()
            .pages
            .get(&(resolve(env), va.vpn()))
            .map(|&(_, perm)| perm)
    }

    pub(crate) fn frame_of(&self, env: EnvId, va: VirtAddr) -> Option<usize> {
        self.state
            .borrow()
            .pages
            .get(&(resolve(env), va.vpn()))
            .map(|&(frame, _)| frame)
    }

    /// Copy of the page mapped at `va` in `env`
    pub(crate) fn page_bytes(&self, env: EnvId, va: VirtAddr) -> Option<Vec<u8>> {
        let state = self.state.borrow();
        state
            .pages
            .get(&(resolve(env), va.vpn()))
            .map(|&(frame, _)| state.frames[frame].clone())
    }

    /// Backing frame of page `index` of file `file_id`, once it has been mapped
    pub(crate) fn file_frame(&self, file_id: usize, index: u32) -> Option<usize> {
        self.state.borrow().file_frames.get(&(file_id, index)).copied()
    }

    fn new_frame(state: &mut State, contents: &[u8]) -> usize {
        let mut frame = vec![0u8; PAGE_SIZE];
        frame[..contents.len()].copy_from_slice(contents);
        state.frames.push(frame);
        state.frames.len() - 1
    }
}

impl Syscalls for Fake {
    fn getenvid(&self) -> EnvId {
        SELF_ID
    }

    fn exofork(&self) -> Result<EnvId> {
        self.state.borrow_mut().calls.push(Call::Exofork);
        Ok(CHILD_ID)
    }

    fn env_set_trapframe(&self, env: EnvId, tf: &Trapframe) -> Result<()> {
        self.state
            .borrow_mut()
            .calls
            .push(Call::SetTrapframe(env, *tf));
        Ok(())
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<()> {
        self.state.borrow_mut().calls.push(Call::SetStatus(env, status));
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Destroy(env));
        let env = resolve(env);
        state.pages.retain(|&(owner, _), _| owner != env);
        Ok(())
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: Perm) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::PageAlloc(env, va, perm));
        let frame = Self::new_frame(&mut state, &[]);
        state.pages.insert((resolve(env), va.vpn()), (frame, perm));
        Ok(())
    }

    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: Perm,
    ) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state
            .calls
            .push(Call::PageMap(src_env, src_va, dst_env, dst_va, perm));

        if let Some((env, err)) = state.fail_map_into {
            if env == resolve(dst_env) {
                return Err(err);
            }
        }

        let &(frame, _) = state
            .pages
            .get(&(resolve(src_env), src_va.vpn()))
            .ok_or(ExoError::Invalid)?;
        state.pages.insert((resolve(dst_env), dst_va.vpn()), (frame, perm));
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::PageUnmap(env, va));
        state.pages.remove(&(resolve(env), va.vpn()));
        Ok(())
    }

    fn ipc_recv(&self, dstva: VirtAddr) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::Recv(dstva));
        if let Some(err) = state.recv_error {
            return Err(err);
        }
        if let Some(mailbox) = state.delivery.take() {
            state.mailbox = mailbox;
        }
        Ok(())
    }

    fn ipc_try_send(&self, to: EnvId, value: u32, srcva: VirtAddr, perm: Perm) -> Result<()> {
        let mut state = self.state.borrow_mut();
        state.calls.push(Call::TrySend(to, value, srcva, perm));
        state.send_results.pop_front().unwrap_or(Ok(()))
    }

    fn yield_now(&self) {
        self.state.borrow_mut().calls.push(Call::Yield);
    }
}

impl EnvTable for Fake {
    fn mailbox(&self, env: EnvId) -> Result<Mailbox> {
        let mut state = self.state.borrow_mut();
        state.mailbox_lookups.push(env);
        if env == SELF_ID {
            Ok(state.mailbox)
        } else {
            Err(ExoError::BadEnv)
        }
    }

    fn trapframe(&self, _env: EnvId) -> Result<Trapframe> {
        Ok(Trapframe {
            eflags: FL_IF,
            cs: 0x1b,
            ss: 0x23,
            ..Trapframe::default()
        })
    }

    fn status(&self, _env: EnvId) -> Result<EnvStatus> {
        Ok(EnvStatus::NotRunnable)
    }
}

impl UserMemory for Fake {
    fn read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let state = self.state.borrow();
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = va.offset(i);
            let &(frame, _) = state
                .pages
                .get(&(SELF_ID, addr.vpn()))
                .ok_or(ExoError::Fault)?;
            *byte = state.frames[frame][addr.page_offset()];
        }
        Ok(())
    }

    fn write(&self, va: VirtAddr, data: &[u8]) -> Result<()> {
        let mut state = self.state.borrow_mut();
        for (i, &byte) in data.iter().enumerate() {
            let addr = va.offset(i);
            let &(frame, perm) = state
                .pages
                .get(&(SELF_ID, addr.vpn()))
                .ok_or(ExoError::Fault)?;
            if !perm.contains(Perm::W) {
                return Err(ExoError::Fault);
            }
            state.frames[frame][addr.page_offset()] = byte;
        }
        Ok(())
    }
}

/// In-memory file system over a [`Fake`]
pub(crate) struct FakeFs<'a> {
    fake: &'a Fake,
    files: BTreeMap<String, Vec<u8>>,
}

pub(crate) struct FakeFile<'a> {
    fake: &'a Fake,
    id: usize,
    data: Vec<u8>,
    pos: usize,
}

impl<'a> FakeFs<'a> {
    pub(crate) fn new(fake: &'a Fake) -> Self {
        Self {
            fake,
            files: BTreeMap::new(),
        }
    }

    pub(crate) fn add(&mut self, path: &str, data: Vec<u8>) {
        self.files.insert(path.to_string(), data);
    }

    /// Id handed to the next open of `path`
    pub(crate) fn id_of(&self, path: &str) -> Option<usize> {
        self.files.keys().position(|name| name == path)
    }
}

impl<'a> FileSystem for FakeFs<'a> {
    type File = FakeFile<'a>;

    fn open(&self, path: &str) -> Result<FakeFile<'a>> {
        let id = self.id_of(path).ok_or(ExoError::NotFound)?;
        Ok(FakeFile {
            fake: self.fake,
            id,
            data: self.files[path].clone(),
            pos: 0,
        })
    }
}

impl File for FakeFile<'_> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let available = self.data.len().saturating_sub(self.pos);
        let n = available.min(buf.len());
        buf[..n].copy_from_slice(&self.data[self.pos..self.pos + n]);
        self.pos += n;
        Ok(n)
    }

    fn seek(&mut self, offset: u32) -> Result<()> {
        self.pos = offset as usize;
        Ok(())
    }

    fn read_map(&mut self, offset: u32) -> Result<VirtAddr> {
        if offset as usize % PAGE_SIZE != 0 || offset as usize >= self.data.len() {
            return Err(ExoError::Invalid);
        }

        let index = offset / PAGE_SIZE as u32;
        let mut state = self.fake.state.borrow_mut();
        let frame = match state.file_frames.get(&(self.id, index)) {
            Some(&frame) => frame,
            None => {
                let start = offset as usize;
                let end = (start + PAGE_SIZE).min(self.data.len());
                let frame = Fake::new_frame(&mut state, &self.data[start..end]);
                state.file_frames.insert((self.id, index), frame);
                frame
            }
        };

        let va = VirtAddr::new(FILEVA.as_u32() + self.id as u32 * MAXFILESIZE + offset);
        state.pages.insert((SELF_ID, va.vpn()), (frame, Perm::USER_RO));
        Ok(va)
    }
}
