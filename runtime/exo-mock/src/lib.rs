//! Simulated exokernel substrate
//!
//! A hosted, thread-safe model of the kernel side of the system: physical
//! frames with reference counts, per-environment page tables, the
//! environment table with IPC mailboxes, and an in-memory file system.
//! Each environment is driven through an [`EnvHandle`], which implements
//! the user library's substrate traits, so the real `exo-sdk` code runs
//! against it unchanged.
//!
//! The kernel rules follow the real kernel:
//! - only an environment or its parent may change its mappings or state
//! - user mappings must be page aligned, below `UTOP`, and carry `U|P`
//! - a read-only page cannot be remapped writable
//! - `ipc_try_send` succeeds only while the target is blocked receiving,
//!   and a page moves only if the receiver asked for one
//!
//! # Example
//! ```no_run
//! use exo_mock::{Machine, MachineConfig};
//!
//! let machine = Machine::new(MachineConfig::default()).unwrap();
//! machine.install_file("hello", &[0x7f, b'E', b'L', b'F']).unwrap();
//! let root = machine.boot().unwrap();
//! let fs = root.fs();
//! let child = exo_sdk::spawn(&root, &fs, "hello", &["hello"]);
//! ```

mod env;
mod error;
mod frame;
mod fs;
mod machine;

pub use env::ENVGENSHIFT;
pub use error::ConfigError;
pub use fs::{MemFile, MemFs, MAXOPEN, MAXPATHLEN};
pub use machine::{EnvHandle, Machine, MachineConfig, GD_UD_USER, GD_UT_USER};
