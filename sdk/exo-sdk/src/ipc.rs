//! Synchronous IPC between environments
//!
//! Every environment owns a single-slot mailbox. A receiver blocks in
//! [`ipc_recv`] until some sender manages to deliver one 32-bit value and,
//! optionally, one page. Senders never queue: [`ipc_send`] keeps retrying
//! while the target is not receiving and yields the processor in between.
//!
//! ## Page transfer
//!
//! A page travels only if both sides ask for it. The receiver names a slot
//! with `Some(va)`; the sender passes `Some((va, perm))`. After delivery both
//! environments map the same physical page and the receiver's mailbox
//! records `perm`. When no page arrives the recorded permission is empty.
//!
//! "No page" is signalled to the kernel with [`NO_PAGE`] ([`UTOP`]), never
//! with address zero, which is a valid user address.
//!
//! ## Usage
//!
//! ```ignore
//! // Server
//! let msg = ipc_recv(&rt, &rt, Some(VirtAddr::new(0x0a00_0000)))?;
//!
//! // Client
//! ipc_send(&rt, server, 7, Some((UTEMP, Perm::USER_RW)));
//! ```

use core::num::NonZeroU32;

use log::trace;

use crate::env::EnvId;
use crate::memory::{Perm, VirtAddr, UTOP};
use crate::syscall::{EnvTable, Syscalls};
use crate::{ExoError, Result};

/// Sentinel address meaning "no page"
pub const NO_PAGE: VirtAddr = UTOP;

/// A delivered message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Received {
    /// Sender of the message
    pub from: EnvId,
    /// 32-bit payload
    pub value: u32,
    /// Permission of the transferred page; empty if no page was transferred
    pub perm: Perm,
}

/// How long a sender keeps trying while the target is not receiving
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Retry {
    /// Retry until the target receives
    Forever,
    /// Give up after this many failed attempts
    Attempts(NonZeroU32),
}

/// Receive one message
///
/// Blocks until a sender delivers. If `pg` is `Some`, a page sent along
/// with the message is mapped there. The message is read back from the
/// caller's own mailbox in `envs`.
///
/// # Errors
/// Any error from the kernel's receive primitive (for example
/// [`ExoError::Invalid`] for an unaligned `pg`) is returned unchanged.
pub fn ipc_recv<S, T>(sys: &S, envs: &T, pg: Option<VirtAddr>) -> Result<Received>
where
    S: Syscalls + ?Sized,
    T: EnvTable + ?Sized,
{
    sys.ipc_recv(pg.unwrap_or(NO_PAGE))?;

    let mailbox = envs.mailbox(sys.getenvid())?;
    trace!(
        "ipc_recv: {} got {:#x} from {} (perm {:#x})",
        sys.getenvid(),
        mailbox.value,
        mailbox.from,
        mailbox.perm.bits()
    );

    Ok(Received {
        from: mailbox.from,
        value: mailbox.value,
        perm: mailbox.perm,
    })
}

/// Receive one message, reporting sender and permission through slots
///
/// Only the slots that are provided are written. On failure both are
/// cleared to zero and the error is returned; on success the payload is
/// returned.
pub fn ipc_recv_into<S, T>(
    sys: &S,
    envs: &T,
    from_store: Option<&mut EnvId>,
    pg: Option<VirtAddr>,
    perm_store: Option<&mut Perm>,
) -> Result<u32>
where
    S: Syscalls + ?Sized,
    T: EnvTable + ?Sized,
{
    let result = ipc_recv(sys, envs, pg);

    if let Some(from) = from_store {
        *from = result.map(|msg| msg.from).unwrap_or(EnvId::SELF);
    }
    if let Some(perm) = perm_store {
        *perm = result.map(|msg| msg.perm).unwrap_or(Perm::empty());
    }

    result.map(|msg| msg.value)
}

/// Send `value` (and optionally a page) to `to`, retrying until delivered
///
/// While `to` is not receiving, the processor is yielded and the send is
/// tried again, without bound.
///
/// # Panics
/// Any failure other than [`ExoError::IpcNotRecv`] means the protocol is
/// broken (bad target, bad page, bad permission) and aborts the caller.
pub fn ipc_send<S>(sys: &S, to: EnvId, value: u32, page: Option<(VirtAddr, Perm)>)
where
    S: Syscalls + ?Sized,
{
    if ipc_send_with(sys, to, value, page, Retry::Forever, || sys.yield_now()).is_err() {
        unreachable!("ipc_send: unbounded retry gave up");
    }
}

/// Send with an explicit retry policy and yield hook
///
/// `yield_hook` runs after every attempt that failed with
/// [`ExoError::IpcNotRecv`].
///
/// # Errors
/// [`ExoError::IpcNotRecv`] once a bounded policy is exhausted.
///
/// # Panics
/// On any other send failure, like [`ipc_send`].
pub fn ipc_send_with<S, Y>(
    sys: &S,
    to: EnvId,
    value: u32,
    page: Option<(VirtAddr, Perm)>,
    retry: Retry,
    mut yield_hook: Y,
) -> Result<()>
where
    S: Syscalls + ?Sized,
    Y: FnMut(),
{
    let (srcva, perm) = page.unwrap_or((NO_PAGE, Perm::empty()));
    let mut attempts: u32 = 0;

    loop {
        match sys.ipc_try_send(to, value, srcva, perm) {
            Ok(()) => return Ok(()),
            Err(ExoError::IpcNotRecv) => {
                attempts = attempts.saturating_add(1);
                if let Retry::Attempts(limit) = retry {
                    if attempts >= limit.get() {
                        return Err(ExoError::IpcNotRecv);
                    }
                }
                trace!("ipc_send: {} not receiving, attempt {}", to, attempts);
                yield_hook();
            }
            Err(err) => panic!("ipc_send: send message failed. {}", err),
        }
    }
}
