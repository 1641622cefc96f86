//! Substrate interfaces
//!
//! The user library never touches kernel data structures directly. It is
//! written against three narrow interfaces that the kernel (or a simulator)
//! provides:
//!
//! - [`Syscalls`]: the privileged primitives (environment creation, page
//!   mapping, IPC rendezvous, yield)
//! - [`EnvTable`]: read-only view of environment state, passed explicitly
//!   instead of being reached through a global table
//! - [`UserMemory`]: loads and stores in the caller's own address space
//!
//! Every environment argument accepts [`EnvId::SELF`] to mean the caller.

use crate::env::{EnvId, EnvStatus, Mailbox, Trapframe};
use crate::memory::{Perm, VirtAddr, WORD_SIZE};
use crate::Result;

/// Kernel primitives available to a user environment
pub trait Syscalls {
    /// Identifier of the calling environment
    fn getenvid(&self) -> EnvId;

    /// Create a child environment
    ///
    /// The child starts [`EnvStatus::NotRunnable`] with an empty address
    /// space and a copy of the caller's trapframe.
    fn exofork(&self) -> Result<EnvId>;

    /// Replace the saved register state of `env`
    fn env_set_trapframe(&self, env: EnvId, tf: &Trapframe) -> Result<()>;

    /// Set `env` runnable or not runnable
    fn env_set_status(&self, env: EnvId, status: EnvStatus) -> Result<()>;

    /// Destroy `env` and release every page it maps
    fn env_destroy(&self, env: EnvId) -> Result<()>;

    /// Allocate a zeroed page and map it at `va` in `env`
    ///
    /// Any page already mapped there is unmapped first.
    fn page_alloc(&self, env: EnvId, va: VirtAddr, perm: Perm) -> Result<()>;

    /// Map the page at `src_va` in `src_env` at `dst_va` in `dst_env`
    ///
    /// Both environments then refer to the same physical page.
    fn page_map(
        &self,
        src_env: EnvId,
        src_va: VirtAddr,
        dst_env: EnvId,
        dst_va: VirtAddr,
        perm: Perm,
    ) -> Result<()>;

    /// Remove the mapping at `va` in `env` (no-op if nothing is mapped)
    fn page_unmap(&self, env: EnvId, va: VirtAddr) -> Result<()>;

    /// Block until a message arrives
    ///
    /// If `dstva` is below [`crate::memory::UTOP`] the caller is willing to
    /// accept a page there. The message lands in the caller's mailbox.
    fn ipc_recv(&self, dstva: VirtAddr) -> Result<()>;

    /// Try once to deliver `value` (and the page at `srcva`) to `to`
    ///
    /// Fails with [`crate::ExoError::IpcNotRecv`] if `to` is not currently
    /// blocked in [`Syscalls::ipc_recv`]. The check of the receiving flag and
    /// the delivery are one atomic step in the kernel.
    fn ipc_try_send(&self, to: EnvId, value: u32, srcva: VirtAddr, perm: Perm) -> Result<()>;

    /// Give up the processor
    fn yield_now(&self);
}

/// Read-only view of the environment table
pub trait EnvTable {
    /// Mailbox of `env`
    fn mailbox(&self, env: EnvId) -> Result<Mailbox>;

    /// Saved register state of `env`
    fn trapframe(&self, env: EnvId) -> Result<Trapframe>;

    /// Scheduling status of `env`
    fn status(&self, env: EnvId) -> Result<EnvStatus>;
}

/// Loads and stores in the calling environment's own address space
pub trait UserMemory {
    /// Copy `buf.len()` bytes starting at `va` into `buf`
    fn read(&self, va: VirtAddr, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` to memory starting at `va`
    fn write(&self, va: VirtAddr, data: &[u8]) -> Result<()>;

    /// Load one little-endian user word
    fn read_word(&self, va: VirtAddr) -> Result<u32> {
        let mut bytes = [0u8; WORD_SIZE];
        self.read(va, &mut bytes)?;
        Ok(u32::from_le_bytes(bytes))
    }
}
