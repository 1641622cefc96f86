//! The simulated machine and per-environment substrate handles

use std::sync::Arc;

use log::{debug, info, trace};
use parking_lot::{Condvar, Mutex};

use exo_sdk::env::FL_IF;
use exo_sdk::memory::{KERNBASE, PAGE_SIZE};
use exo_sdk::{
    EnvId, EnvStatus, EnvTable, ExoError, Mailbox, Perm, PhysAddr, Result, Syscalls, Trapframe,
    UserMemory, VirtAddr,
};

use crate::env::{Env, Envs, Pte};
use crate::error::ConfigError;
use crate::frame::FrameTable;
use crate::fs::{FileEntry, Files, MemFs};

/// User code segment selector (ring 3)
pub const GD_UT_USER: u32 = 0x18 | 3;
/// User data segment selector (ring 3)
pub const GD_UD_USER: u32 = 0x20 | 3;

/// Shape of a simulated machine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MachineConfig {
    /// Physical frames of memory
    pub frames: usize,
    /// Low frames occupied by the kernel image (never allocated)
    pub kernel_frames: usize,
    /// Environment table slots
    pub env_slots: usize,
    /// Files one environment may hold open at once
    pub max_open: usize,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            frames: 1024,
            kernel_frames: 384,
            env_slots: 64,
            max_open: 32,
        }
    }
}

impl MachineConfig {
    /// Check that the configuration describes a machine that can boot
    pub fn validate(&self) -> std::result::Result<(), ConfigError> {
        if self.kernel_frames == 0 {
            return Err(ConfigError::NoKernelFrames);
        }
        if self.frames <= self.kernel_frames {
            return Err(ConfigError::NoFreeFrames {
                frames: self.frames,
                kernel_frames: self.kernel_frames,
            });
        }
        let window = (u32::MAX - KERNBASE) as usize + 1;
        if self.frames > window / PAGE_SIZE {
            return Err(ConfigError::TooManyFrames(self.frames));
        }
        if self.env_slots == 0 || self.env_slots > exo_sdk::env::NENV {
            return Err(ConfigError::EnvSlots(self.env_slots));
        }
        if self.max_open == 0 || self.max_open > crate::fs::MAXOPEN {
            return Err(ConfigError::MaxOpen(self.max_open));
        }
        Ok(())
    }
}

pub(crate) struct State {
    pub frames: FrameTable,
    pub envs: Envs,
    pub files: Files,
    pub max_open: usize,
}

pub(crate) struct Shared {
    pub state: Mutex<State>,
    /// Signalled whenever a mailbox is filled or an environment dies
    pub delivered: Condvar,
}

/// A simulated exokernel
///
/// Cloning a `Machine` yields another reference to the same machine.
#[derive(Clone)]
pub struct Machine {
    shared: Arc<Shared>,
    config: MachineConfig,
}

impl Machine {
    pub fn new(config: MachineConfig) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        info!(
            "machine: {} frames ({} kernel), {} env slots",
            config.frames, config.kernel_frames, config.env_slots
        );

        let state = State {
            frames: FrameTable::new(config.frames, config.kernel_frames),
            envs: Envs::new(config.env_slots),
            files: Files::default(),
            max_open: config.max_open,
        };

        Ok(Self {
            shared: Arc::new(Shared {
                state: Mutex::new(state),
                delivered: Condvar::new(),
            }),
            config,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    /// Create a runnable root environment and return its handle
    pub fn boot(&self) -> Result<EnvHandle> {
        let tf = Trapframe {
            es: GD_UD_USER,
            ds: GD_UD_USER,
            ss: GD_UD_USER,
            cs: GD_UT_USER,
            eflags: FL_IF,
            esp: exo_sdk::memory::USTACKTOP.as_u32(),
            ..Trapframe::default()
        };

        let mut state = self.shared.state.lock();
        let id = state.envs.alloc(EnvId::SELF, tf)?;
        state.envs.get_mut(id)?.status = EnvStatus::Runnable;
        info!("machine: booted root env {}", id);
        Ok(self.handle_unchecked(id))
    }

    /// Handle for acting as environment `id`
    pub fn handle(&self, id: EnvId) -> Result<EnvHandle> {
        self.shared.state.lock().envs.get(id)?;
        Ok(self.handle_unchecked(id))
    }

    fn handle_unchecked(&self, id: EnvId) -> EnvHandle {
        EnvHandle {
            shared: Arc::clone(&self.shared),
            id,
        }
    }

    /// Store a file in the in-memory file system
    ///
    /// # Errors
    /// - [`ExoError::BadPath`] for an empty path
    /// - [`ExoError::FileExists`] if `path` is taken
    /// - [`ExoError::Invalid`] if `data` exceeds the maximum file size
    /// - [`ExoError::NoMem`] if frames run out
    pub fn install_file(&self, path: &str, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        state.files.install(&mut state.frames, path, data)?;
        debug!("machine: installed {} ({} bytes)", path, data.len());
        Ok(())
    }

    /// Physical pages backing `path`, in file order
    pub fn file_frames(&self, path: &str) -> Option<Vec<PhysAddr>> {
        let state = self.shared.state.lock();
        state
            .files
            .get(path)
            .map(|file: &FileEntry| file.frames.iter().map(|&f| PhysAddr::from_ppn(f)).collect())
    }

    /// Physical page mapped at `va` in `env`
    pub fn frame_of(&self, env: EnvId, va: VirtAddr) -> Option<PhysAddr> {
        self.pte(env, va).map(|pte| PhysAddr::from_ppn(pte.frame))
    }

    /// Permissions of the mapping at `va` in `env`
    pub fn perm_of(&self, env: EnvId, va: VirtAddr) -> Option<Perm> {
        self.pte(env, va).map(|pte| pte.perm)
    }

    fn pte(&self, env: EnvId, va: VirtAddr) -> Option<Pte> {
        let state = self.shared.state.lock();
        state.envs.get(env).ok()?.pages.get(&va.vpn()).copied()
    }

    /// Pages mapped by `env`, lowest first
    pub fn mapped_pages(&self, env: EnvId) -> Vec<VirtAddr> {
        let state = self.shared.state.lock();
        state
            .envs
            .get(env)
            .map(|env| {
                env.pages
                    .keys()
                    .map(|&vpn| VirtAddr::new(vpn << exo_sdk::memory::PAGE_SHIFT))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Read memory of `env` ignoring its permissions
    pub fn read_env(&self, env: EnvId, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let state = self.shared.state.lock();
        let env = state.envs.get(env)?;
        copy_out(&state.frames, env, va, buf, Perm::empty())
    }

    pub fn env_status(&self, env: EnvId) -> Option<EnvStatus> {
        let state = self.shared.state.lock();
        state.envs.get(env).ok().map(|env| env.status)
    }

    pub fn trapframe_of(&self, env: EnvId) -> Option<Trapframe> {
        let state = self.shared.state.lock();
        state.envs.get(env).ok().map(|env| env.tf)
    }

    /// Ids of all live environments
    pub fn live_envs(&self) -> Vec<EnvId> {
        let state = self.shared.state.lock();
        state.envs.live().map(|env| env.id).collect()
    }

    pub fn frame_count(&self) -> usize {
        self.config.frames
    }

    pub fn free_frames(&self) -> usize {
        self.shared.state.lock().frames.free_count()
    }

    /// Allocate a frame outside any address space, holding one reference
    pub fn alloc_frame(&self) -> Option<PhysAddr> {
        let mut state = self.shared.state.lock();
        let frame = state.frames.alloc()?;
        state.frames.incref(frame);
        Some(PhysAddr::from_ppn(frame))
    }

    /// Reference count of the frame holding `pa`, `None` outside memory
    pub fn frame_refcount(&self, pa: PhysAddr) -> Option<u32> {
        self.shared.state.lock().frames.refcount(pa)
    }

    /// Drop one reference to the frame holding `pa`
    ///
    /// Frames of the kernel image cannot be released and yield
    /// [`ExoError::Invalid`].
    pub fn frame_decref(&self, pa: PhysAddr) -> Result<()> {
        let mut state = self.shared.state.lock();
        let frame = state.frames.index_of(pa).ok_or(ExoError::Invalid)?;
        if state.frames.is_reserved(frame) {
            return Err(ExoError::Invalid);
        }
        state.frames.decref(frame);
        Ok(())
    }

    /// Copy physical memory starting at `pa` into `buf`
    pub fn read_phys(&self, pa: PhysAddr, buf: &mut [u8]) -> Result<()> {
        let state = self.shared.state.lock();
        for (i, byte) in buf.iter_mut().enumerate() {
            let addr = PhysAddr::new(pa.as_u32().wrapping_add(i as u32));
            let frame = state.frames.index_of(addr).ok_or(ExoError::Fault)?;
            *byte = state.frames.bytes(frame)[addr.as_usize() % PAGE_SIZE];
        }
        Ok(())
    }

    /// Copy `data` to physical memory starting at `pa`
    pub fn write_phys(&self, pa: PhysAddr, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        for (i, &byte) in data.iter().enumerate() {
            let addr = PhysAddr::new(pa.as_u32().wrapping_add(i as u32));
            let frame = state.frames.index_of(addr).ok_or(ExoError::Fault)?;
            state.frames.bytes_mut(frame)[addr.as_usize() % PAGE_SIZE] = byte;
        }
        Ok(())
    }

    /// Translate a kernel virtual address
    ///
    /// The kernel maps all of physical memory at [`KERNBASE`], writable and
    /// kernel-only. Nothing else is mapped in the kernel's own page table.
    pub fn kernel_walk(&self, va: u32) -> Option<(PhysAddr, Perm)> {
        let pa = va.checked_sub(KERNBASE)?;
        let pa = PhysAddr::new(pa & !(PAGE_SIZE as u32 - 1));
        (pa.ppn() < self.config.frames).then_some((pa, Perm::P | Perm::W))
    }
}

/// Substrate as seen by one environment
///
/// Implements the user library's [`Syscalls`], [`EnvTable`] and
/// [`UserMemory`] interfaces. Handles are cheap to clone and may be moved to
/// other threads, so concurrently running environments can each own one.
#[derive(Clone)]
pub struct EnvHandle {
    shared: Arc<Shared>,
    id: EnvId,
}

impl EnvHandle {
    pub fn id(&self) -> EnvId {
        self.id
    }

    /// File system view of this environment
    pub fn fs(&self) -> MemFs {
        MemFs::new(self.clone())
    }

    pub(crate) fn shared(&self) -> &Shared {
        &self.shared
    }
}

impl std::fmt::Debug for EnvHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EnvHandle").field("id", &self.id).finish()
    }
}

fn check_user_va(va: VirtAddr) -> Result<()> {
    if !va.is_user() || !va.is_page_aligned() {
        return Err(ExoError::Invalid);
    }
    Ok(())
}

fn check_perm(perm: Perm) -> Result<()> {
    if !perm.is_valid_user() {
        return Err(ExoError::Invalid);
    }
    Ok(())
}

/// Install `pte` at `va`, releasing whatever was mapped there
pub(crate) fn insert_page(frames: &mut FrameTable, env: &mut Env, va: VirtAddr, pte: Pte) {
    frames.incref(pte.frame);
    if let Some(old) = env.pages.insert(va.vpn(), pte) {
        frames.decref(old.frame);
    }
}

pub(crate) fn remove_page(frames: &mut FrameTable, env: &mut Env, va: VirtAddr) {
    if let Some(old) = env.pages.remove(&va.vpn()) {
        frames.decref(old.frame);
    }
}

/// Copy bytes out of an address space, requiring `need` on every page
fn copy_out(
    frames: &FrameTable,
    env: &Env,
    va: VirtAddr,
    buf: &mut [u8],
    need: Perm,
) -> Result<()> {
    for (i, byte) in buf.iter_mut().enumerate() {
        let addr = va.offset(i);
        let pte = env.pages.get(&addr.vpn()).ok_or(ExoError::Fault)?;
        if !pte.perm.contains(need) {
            return Err(ExoError::Fault);
        }
        *byte = frames.bytes(pte.frame)[addr.page_offset()];
    }
    Ok(())
}

impl Syscalls for EnvHandle {
    fn getenvid(&self) -> EnvId {
        self.id
    }

    fn exofork(&self) -> Result<EnvId> {
        let mut state = self.shared.state.lock();
        let mut tf = state.envs.get(self.id)?.tf;
        // The child sees exofork return 0
        tf.regs.eax = 0;
        let child = state.envs.alloc(self.id, tf)?;
        info!("exofork: {} created {}", self.id, child);
        Ok(child)
    }

    fn env_set_trapframe(&self, env: EnvId, tf: &Trapframe) -> Result<()> {
        let mut state = self.shared.state.lock();
        let env = state.envs.resolve(self.id, env, true)?;
        let target = state.envs.get_mut(env)?;

        // Always return to user mode with interrupts on
        let mut tf = *tf;
        tf.cs = GD_UT_USER;
        tf.ds = GD_UD_USER;
        tf.es = GD_UD_USER;
        tf.ss = GD_UD_USER;
        tf.eflags |= FL_IF;
        target.tf = tf;
        Ok(())
    }

    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<()> {
        if status == EnvStatus::Free {
            return Err(ExoError::Invalid);
        }
        let mut state = self.shared.state.lock();
        let env = state.envs.resolve(self.id, env, true)?;
        state.envs.get_mut(env)?.status = status;
        debug!("env_set_status: {} -> {:?}", env, status);
        Ok(())
    }

    fn env_destroy(&self, env: EnvId) -> Result<()> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let env = state.envs.resolve(self.id, env, true)?;
        let dead = state.envs.remove(env)?;
        for pte in dead.pages.values() {
            state.frames.decref(pte.frame);
        }
        info!(
            "env_destroy: {} freed {} ({} pages)",
            self.id,
            env,
            dead.pages.len()
        );
        self.shared.delivered.notify_all();
        Ok(())
    }

    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: Perm) -> Result<()> {
        check_user_va(va)?;
        check_perm(perm)?;

        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let env = state.envs.resolve(self.id, env, true)?;
        let target = state.envs.get_mut(env)?;
        let frame = state.frames.alloc().ok_or(ExoError::NoMem)?;
        insert_page(&mut state.frames, target, va, Pte { frame, perm });
        trace!("page_alloc: {} {} -> frame {}", env, va, frame);
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
        check_user_va(src_va)?;
        check_user_va(dst_va)?;
        check_perm(perm)?;

        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let src = state.envs.resolve(self.id, src_env, true)?;
        let dst = state.envs.resolve(self.id, dst_env, true)?;

        let src_pte = *state
            .envs
            .get(src)?
            .pages
            .get(&src_va.vpn())
            .ok_or(ExoError::Invalid)?;
        if perm.contains(Perm::W) && !src_pte.perm.contains(Perm::W) {
            return Err(ExoError::Invalid);
        }

        let target = state.envs.get_mut(dst)?;
        insert_page(
            &mut state.frames,
            target,
            dst_va,
            Pte {
                frame: src_pte.frame,
                perm,
            },
        );
        trace!("page_map: {} {} -> {} {}", src, src_va, dst, dst_va);
        Ok(())
    }

    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> Result<()> {
        check_user_va(va)?;

        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let env = state.envs.resolve(self.id, env, true)?;
        let target = state.envs.get_mut(env)?;
        remove_page(&mut state.frames, target, va);
        Ok(())
    }

    fn ipc_recv(&self, dstva: VirtAddr) -> Result<()> {
        if dstva.is_user() && !dstva.is_page_aligned() {
            return Err(ExoError::Invalid);
        }

        let mut state = self.shared.state.lock();
        {
            let env = state.envs.get_mut(self.id)?;
            env.mailbox.recving = true;
            env.mailbox.dstva = dstva;
            env.status = EnvStatus::NotRunnable;
        }
        trace!("ipc_recv: {} waiting (dstva {})", self.id, dstva);

        loop {
            let env = state.envs.get(self.id)?;
            if !env.mailbox.recving {
                return Ok(());
            }
            self.shared.delivered.wait(&mut state);
        }
    }

    fn ipc_try_send(&self, to: EnvId, value: u32, srcva: VirtAddr, perm: Perm) -> Result<()> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let to = state.envs.resolve(self.id, to, false)?;

        let receiver = state.envs.get(to)?;
        if !receiver.mailbox.recving {
            return Err(ExoError::IpcNotRecv);
        }
        let dstva = receiver.mailbox.dstva;

        let mut page = None;
        if srcva.is_user() {
            if !srcva.is_page_aligned() {
                return Err(ExoError::Invalid);
            }
            check_perm(perm)?;
            let pte = *state
                .envs
                .get(self.id)?
                .pages
                .get(&srcva.vpn())
                .ok_or(ExoError::Invalid)?;
            if perm.contains(Perm::W) && !pte.perm.contains(Perm::W) {
                return Err(ExoError::Invalid);
            }
            page = Some(pte.frame);
        }

        let receiver = state.envs.get_mut(to)?;
        let mut delivered_perm = Perm::empty();
        if let Some(frame) = page {
            if dstva.is_user() {
                insert_page(&mut state.frames, receiver, dstva, Pte { frame, perm });
                delivered_perm = perm;
            }
        }

        receiver.mailbox = Mailbox {
            recving: false,
            dstva,
            from: self.id,
            value,
            perm: delivered_perm,
        };
        receiver.status = EnvStatus::Runnable;
        receiver.tf.regs.eax = 0;

        debug!("ipc: {} -> {} value {:#x}", self.id, to, value);
        self.shared.delivered.notify_all();
        Ok(())
    }

    fn yield_now(&self) {
        std::thread::yield_now();
    }
}

impl EnvTable for EnvHandle {
    fn mailbox(&self, env: EnvId) -> Result<Mailbox> {
        let state = self.shared.state.lock();
        let env = state.envs.resolve(self.id, env, false)?;
        Ok(state.envs.get(env)?.mailbox)
    }

    fn trapframe(&self, env: EnvId) -> Result<Trapframe> {
        let state = self.shared.state.lock();
        let env = state.envs.resolve(self.id, env, false)?;
        Ok(state.envs.get(env)?.tf)
    }

    fn status(&self, env: EnvId) -> Result<EnvStatus> {
        let state = self.shared.state.lock();
        let env = state.envs.resolve(self.id, env, false)?;
        Ok(state.envs.get(env)?.status)
    }
}

impl UserMemory for EnvHandle {
    fn read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()> {
        let state = self.shared.state.lock();
        let env = state.envs.get(self.id)?;
        copy_out(&state.frames, env, va, buf, Perm::U)
    }

    fn write(&self, va: VirtAddr, data: &[u8]) -> Result<()> {
        let mut state = self.shared.state.lock();
        let state = &mut *state;
        let env = state.envs.get(self.id)?;

        // Check every page first so a faulting store writes nothing
        for i in (0..data.len()).step_by(PAGE_SIZE).chain(data.len().checked_sub(1)) {
            let pte = env.pages.get(&va.offset(i).vpn()).ok_or(ExoError::Fault)?;
            if !pte.perm.contains(Perm::U | Perm::W) {
                return Err(ExoError::Fault);
            }
        }

        for (i, &byte) in data.iter().enumerate() {
            let addr = va.offset(i);
            let frame = env.pages[&addr.vpn()].frame;
            state.frames.bytes_mut(frame)[addr.page_offset()] = byte;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use exo_sdk::memory::{UTEMP, UTOP};

    fn small() -> Machine {
        Machine::new(MachineConfig {
            frames: 16,
            kernel_frames: 4,
            env_slots: 4,
            max_open: 4,
        })
        .unwrap()
    }

    #[test]
    fn test_config_validation() {
        let bad = MachineConfig {
            frames: 4,
            kernel_frames: 4,
            ..MachineConfig::default()
        };
        assert!(matches!(Machine::new(bad), Err(ConfigError::NoFreeFrames { .. })));
        assert!(MachineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_page_alloc_checks() {
        let machine = small();
        let root = machine.boot().unwrap();

        assert_eq!(
            root.page_alloc(EnvId::SELF, VirtAddr::new(0x1234), Perm::USER_RW),
            Err(ExoError::Invalid)
        );
        assert_eq!(
            root.page_alloc(EnvId::SELF, UTOP, Perm::USER_RW),
            Err(ExoError::Invalid)
        );
        assert_eq!(
            root.page_alloc(EnvId::SELF, UTEMP, Perm::P | Perm::W),
            Err(ExoError::Invalid)
        );
        assert_eq!(root.page_alloc(EnvId::SELF, UTEMP, Perm::USER_RW), Ok(()));
        assert_eq!(machine.perm_of(root.id(), UTEMP), Some(Perm::USER_RW));
    }

    #[test]
    fn test_page_alloc_exhaustion() {
        let machine = small();
        let root = machine.boot().unwrap();
        for i in 0..12 {
            root.page_alloc(EnvId::SELF, UTEMP.offset(i * PAGE_SIZE), Perm::USER_RW)
                .unwrap();
        }
        assert_eq!(
            root.page_alloc(EnvId::SELF, UTEMP.offset(12 * PAGE_SIZE), Perm::USER_RW),
            Err(ExoError::NoMem)
        );
    }

    #[test]
    fn test_page_map_refuses_write_upgrade() {
        let machine = small();
        let root = machine.boot().unwrap();
        root.page_alloc(EnvId::SELF, UTEMP, Perm::USER_RO).unwrap();

        let dst = UTEMP.offset(PAGE_SIZE);
        assert_eq!(
            root.page_map(EnvId::SELF, UTEMP, EnvId::SELF, dst, Perm::USER_RW),
            Err(ExoError::Invalid)
        );
        assert_eq!(
            root.page_map(EnvId::SELF, UTEMP, EnvId::SELF, dst, Perm::USER_RO),
            Ok(())
        );
        assert_eq!(machine.frame_of(root.id(), UTEMP), machine.frame_of(root.id(), dst));
    }

    #[test]
    fn test_unmap_unmapped_is_ok() {
        let machine = small();
        let root = machine.boot().unwrap();
        assert_eq!(root.page_unmap(EnvId::SELF, UTEMP), Ok(()));
    }

    #[test]
    fn test_only_parent_may_touch_child() {
        let machine = small();
        let root = machine.boot().unwrap();
        let child = root.exofork().unwrap();
        let grandchild = machine.handle(child).unwrap().exofork().unwrap();

        assert_eq!(root.page_alloc(child, UTEMP, Perm::USER_RW), Ok(()));
        assert_eq!(
            root.page_alloc(grandchild, UTEMP, Perm::USER_RW),
            Err(ExoError::BadEnv)
        );
        assert_eq!(
            machine.handle(child).unwrap().env_destroy(root.id()),
            Err(ExoError::BadEnv)
        );
    }

    #[test]
    fn test_exofork_copies_trapframe_paused() {
        let machine = small();
        let root = machine.boot().unwrap();
        let child = root.exofork().unwrap();

        assert_eq!(machine.env_status(child), Some(EnvStatus::NotRunnable));
        let tf = root.trapframe(child).unwrap();
        assert_eq!(tf.cs, GD_UT_USER);
        assert_eq!(tf.eflags & FL_IF, FL_IF);
    }

    #[test]
    fn test_set_trapframe_forces_user_mode() {
        let machine = small();
        let root = machine.boot().unwrap();
        let child = root.exofork().unwrap();

        let tf = Trapframe {
            cs: 0x08,
            eip: 0x0080_0020,
            ..Trapframe::default()
        };
        root.env_set_trapframe(child, &tf).unwrap();

        let installed = machine.trapframe_of(child).unwrap();
        assert_eq!(installed.eip, 0x0080_0020);
        assert_eq!(installed.cs, GD_UT_USER);
        assert_eq!(installed.eflags & FL_IF, FL_IF);
        assert_eq!(root.env_set_status(child, EnvStatus::Free), Err(ExoError::Invalid));
    }

    #[test]
    fn test_destroy_releases_frames() {
        let machine = small();
        let root = machine.boot().unwrap();
        let before = machine.free_frames();

        let child = root.exofork().unwrap();
        root.page_alloc(child, UTEMP, Perm::USER_RW).unwrap();
        root.page_alloc(child, UTEMP.offset(PAGE_SIZE), Perm::USER_RW)
            .unwrap();
        assert_eq!(machine.free_frames(), before - 2);

        root.env_destroy(child).unwrap();
        assert_eq!(machine.free_frames(), before);
        assert_eq!(machine.env_status(child), None);
    }

    #[test]
    fn test_user_memory_respects_permissions() {
        let machine = small();
        let root = machine.boot().unwrap();
        root.page_alloc(EnvId::SELF, UTEMP, Perm::USER_RO).unwrap();

        assert_eq!(root.write(UTEMP, b"hi"), Err(ExoError::Fault));
        assert_eq!(root.read_word(UTEMP), Ok(0));
        assert_eq!(
            root.read_word(UTEMP.offset(PAGE_SIZE - 2)),
            Err(ExoError::Fault)
        );
    }

    #[test]
    fn test_try_send_without_receiver() {
        let machine = small();
        let root = machine.boot().unwrap();
        let child = root.exofork().unwrap();

        assert_eq!(
            root.ipc_try_send(child, 1, UTOP, Perm::empty()),
            Err(ExoError::IpcNotRecv)
        );
        assert_eq!(
            root.ipc_try_send(EnvId::new(0x7003), 1, UTOP, Perm::empty()),
            Err(ExoError::BadEnv)
        );
    }

    #[test]
    fn test_kernel_walk_window() {
        let machine = small();
        assert_eq!(
            machine.kernel_walk(KERNBASE + 0x3123),
            Some((PhysAddr::new(0x3000), Perm::P | Perm::W))
        );
        assert_eq!(machine.kernel_walk(KERNBASE + 16 * PAGE_SIZE as u32), None);
        assert_eq!(machine.kernel_walk(0x0080_0000), None);
    }

    #[test]
    fn test_monitor_style_frame_ops() {
        let machine = small();
        let pa = machine.alloc_frame().unwrap();
        assert_eq!(pa, PhysAddr::from_ppn(4));
        assert_eq!(machine.frame_refcount(pa), Some(1));

        machine.write_phys(pa, &[1, 2, 3, 4]).unwrap();
        let mut word = [0u8; 4];
        machine.read_phys(pa, &mut word).unwrap();
        assert_eq!(word, [1, 2, 3, 4]);

        machine.frame_decref(pa).unwrap();
        assert_eq!(machine.frame_refcount(pa), Some(0));
        assert_eq!(machine.frame_refcount(PhysAddr::new(0x10_0000)), None);
    }

    #[test]
    fn test_kernel_frames_cannot_be_released() {
        let machine = small();
        let kernel_page = PhysAddr::from_ppn(machine.config().kernel_frames - 1);
        let free = machine.free_frames();

        assert_eq!(machine.frame_decref(kernel_page), Err(ExoError::Invalid));
        assert_eq!(machine.frame_refcount(kernel_page), Some(1));
        assert_eq!(machine.free_frames(), free);

        while let Some(pa) = machine.alloc_frame() {
            assert!(pa.ppn() >= machine.config().kernel_frames);
        }
    }
}
