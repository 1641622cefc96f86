//! Exo User Library
//!
//! User-level half of the exokernel: everything an environment needs to talk
//! to other environments and to start new programs, built only on the small
//! set of kernel primitives described in [`syscall`].
//!
//! # Modules
//! - [`syscall`]: Substrate interfaces (kernel primitives, env table, own memory)
//! - [`ipc`]: Synchronous single-slot IPC with optional page transfer
//! - [`stack`]: Initial argument stack construction for a child
//! - [`spawn`]: Program loading from an executable image
//! - [`elf`]: Segment table of an executable image
//! - [`memory`]: Address types, permissions and the user memory layout
//! - [`env`]: Environment identifiers, trapframes and mailboxes
//! - [`file`]: File interfaces used by the loader
//!
//! # Example
//! ```ignore
//! use exo_sdk::{ipc, spawnl};
//!
//! let child = spawnl!(&rt, &fs, "init", "init", "-v")?;
//! ipc::ipc_send(&rt, child, 42, None);
//! ```

#![no_std]

#[cfg(test)]
#[macro_use]
extern crate std;

pub mod env;
pub mod elf;
pub mod error;
pub mod file;
pub mod ipc;
pub mod memory;
pub mod spawn;
pub mod stack;
pub mod syscall;

#[cfg(test)]
mod testing;

pub use env::{EnvId, EnvStatus, Mailbox, Trapframe};
pub use error::{ExoError, Result};
pub use memory::{Perm, PhysAddr, VirtAddr, PAGE_SIZE};
pub use spawn::spawn;
pub use syscall::{EnvTable, Syscalls, UserMemory};

/// SDK version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
