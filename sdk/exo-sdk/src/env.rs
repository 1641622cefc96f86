//! Environments: identifiers, saved register state and IPC mailboxes

use crate::memory::{Perm, VirtAddr, UTOP};
use core::fmt;
use static_assertions::assert_eq_size;

/// log2 of the maximum number of environments
pub const LOG2NENV: u32 = 10;

/// Maximum number of environments
pub const NENV: usize = 1 << LOG2NENV;

/// Environment identifier
///
/// The low [`LOG2NENV`] bits select a slot in the environment table; the
/// upper bits are a generation number so that a stale id never names a
/// recycled slot. Id `0` always means "the calling environment".
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct EnvId(u32);

impl EnvId {
    /// The calling environment
    pub const SELF: EnvId = EnvId(0);

    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    pub const fn raw(self) -> u32 {
        self.0
    }

    /// Slot in the environment table
    pub const fn index(self) -> usize {
        (self.0 as usize) & (NENV - 1)
    }

    pub const fn is_self(self) -> bool {
        self.0 == 0
    }
}

impl fmt::Debug for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "EnvId({:08x})", self.0)
    }
}

impl fmt::Display for EnvId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Scheduling status of an environment
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum EnvStatus {
    /// Slot is unused
    #[default]
    Free,
    /// Eligible to run
    Runnable,
    /// Exists but must not be scheduled (freshly forked, or blocked in IPC)
    NotRunnable,
}

/// General purpose registers in `pusha` order
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PushRegs {
    pub edi: u32,
    pub esi: u32,
    pub ebp: u32,
    pub oesp: u32,
    pub ebx: u32,
    pub edx: u32,
    pub ecx: u32,
    pub eax: u32,
}

/// Saved user register state
///
/// The kernel restores this when it next runs the environment, so setting
/// `eip` and `esp` before marking a child runnable decides where it starts.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Trapframe {
    pub regs: PushRegs,
    pub es: u32,
    pub ds: u32,
    pub trapno: u32,
    pub err: u32,
    pub eip: u32,
    pub cs: u32,
    pub eflags: u32,
    pub esp: u32,
    pub ss: u32,
}

assert_eq_size!(PushRegs, [u8; 32]);
assert_eq_size!(Trapframe, [u8; 68]);

/// Interrupt enable flag in `eflags`
pub const FL_IF: u32 = 0x0000_0200;

/// Snapshot of an environment's IPC mailbox
///
/// Holds at most one delivered message. `perm` is non-empty only if a page
/// was actually mapped at `dstva` by the last delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Mailbox {
    /// Blocked waiting for a message
    pub recving: bool,
    /// Where the receiver asked for an incoming page ([`UTOP`] for none)
    pub dstva: VirtAddr,
    /// Sender of the last delivered message
    pub from: EnvId,
    /// Payload of the last delivered message
    pub value: u32,
    /// Permission of the page transferred with the last message
    pub perm: Perm,
}

impl Default for Mailbox {
    fn default() -> Self {
        Self {
            recving: false,
            dstva: UTOP,
            from: EnvId::SELF,
            value: 0,
            perm: Perm::empty(),
        }
    }
}
