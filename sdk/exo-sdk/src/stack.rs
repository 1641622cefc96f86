//! Initial stack of a child environment
//!
//! The child's first stack page is built in the parent at [`SCRATCH_PAGE`],
//! mapped into the child at [`STACK_PAGE`] and then unmapped from the parent.
//! Every pointer stored in the page must be valid in the child, so the
//! layout is computed in scratch coordinates ([`ScratchAddr`]) and each
//! stored pointer is translated with [`ScratchAddr::to_child`].
//!
//! ```text
//!  STACK_PAGE + PAGE_SIZE ┌──────────────────────┐
//!                         │ "arg0\0arg1\0..."    │ string_store
//!                         ├──────────────────────┤ (rounded down to a word)
//!                         │ argv[argc] = 0       │
//!                         │ argv[argc-1] ...     │
//!                         │ argv[0]              │ argv_store
//!                         ├──────────────────────┤
//!                         │ argv (= argv_store)  │
//!   initial esp ────────► │ argc                 │
//!                         └──────────────────────┘
//! ```

use core::fmt;

use log::debug;

use crate::env::EnvId;
use crate::memory::{round_down, Perm, VirtAddr, PAGE_SIZE, USTACKTOP, UTEMP, WORD_SIZE};
use crate::syscall::{Syscalls, UserMemory};
use crate::{ExoError, Result};

/// Parent address where the stack page is assembled
pub const SCRATCH_PAGE: VirtAddr = UTEMP;

/// Child address where the stack page ends up
pub const STACK_PAGE: VirtAddr = VirtAddr::new(USTACKTOP.as_u32() - PAGE_SIZE as u32);

/// Address inside the parent's scratch page
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ScratchAddr(u32);

/// Address inside the child's stack page
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct ChildAddr(u32);

impl ScratchAddr {
    /// Scratch address at `offset` bytes into the page
    const fn at(offset: usize) -> Self {
        Self(SCRATCH_PAGE.as_u32() + offset as u32)
    }

    /// Offset of this address within the page
    pub const fn page_offset(self) -> usize {
        (self.0 - SCRATCH_PAGE.as_u32()) as usize
    }

    pub const fn va(self) -> VirtAddr {
        VirtAddr::new(self.0)
    }

    /// The same byte of the page as seen by the child
    pub const fn to_child(self) -> ChildAddr {
        ChildAddr(self.0 - SCRATCH_PAGE.as_u32() + STACK_PAGE.as_u32())
    }
}

impl ChildAddr {
    pub const fn va(self) -> VirtAddr {
        VirtAddr::new(self.0)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for ScratchAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ScratchAddr({:#010x})", self.0)
    }
}

impl fmt::Debug for ChildAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ChildAddr({:#010x})", self.0)
    }
}

/// Placement of the argument strings and vectors in the stack page
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StackLayout {
    /// Number of arguments
    pub argc: usize,
    /// First byte of the first string
    pub string_store: ScratchAddr,
    /// `argv[0]`
    pub argv_store: ScratchAddr,
    /// The `argc` word; the child's initial stack pointer
    pub esp: ScratchAddr,
}

impl StackLayout {
    /// Lay out `argv` in one page
    ///
    /// # Errors
    /// - [`ExoError::Invalid`] if an argument contains a NUL byte
    /// - [`ExoError::NoMem`] if the strings, the pointer array and the two
    ///   words below it do not fit in a page
    pub fn compute(argv: &[&str]) -> Result<Self> {
        let mut string_size: usize = 0;
        for arg in argv {
            if arg.as_bytes().contains(&0) {
                return Err(ExoError::Invalid);
            }
            string_size = string_size
                .checked_add(arg.len() + 1)
                .ok_or(ExoError::NoMem)?;
        }
        if string_size > PAGE_SIZE {
            return Err(ExoError::NoMem);
        }

        let argc = argv.len();
        let string_off = PAGE_SIZE - string_size;

        // argv[0..=argc], then the argv and argc words
        let below_strings = (argc + 1 + 2)
            .checked_mul(WORD_SIZE)
            .ok_or(ExoError::NoMem)?;
        let word_top = round_down(string_off, WORD_SIZE);
        if below_strings > word_top {
            return Err(ExoError::NoMem);
        }

        let argv_off = word_top - (argc + 1) * WORD_SIZE;

        Ok(Self {
            argc,
            string_store: ScratchAddr::at(string_off),
            argv_store: ScratchAddr::at(argv_off),
            esp: ScratchAddr::at(argv_off - 2 * WORD_SIZE),
        })
    }

    /// Initial stack pointer in the child
    pub fn child_sp(&self) -> ChildAddr {
        self.esp.to_child()
    }

    /// Fill `page` with the stack image for `argv`
    ///
    /// `argv` must be the slice this layout was computed from.
    pub fn render(&self, argv: &[&str], page: &mut [u8; PAGE_SIZE]) {
        debug_assert_eq!(argv.len(), self.argc);

        let mut put_word = |offset: usize, word: u32| {
            page[offset..offset + WORD_SIZE].copy_from_slice(&word.to_le_bytes());
        };

        let mut string = self.string_store;
        let mut slot = self.argv_store.page_offset();
        for arg in argv {
            put_word(slot, string.to_child().as_u32());
            slot += WORD_SIZE;
            string = ScratchAddr(string.0 + arg.len() as u32 + 1);
        }
        put_word(slot, 0);

        let argv_word = self.esp.page_offset() + WORD_SIZE;
        put_word(argv_word, self.argv_store.to_child().as_u32());
        put_word(self.esp.page_offset(), self.argc as u32);

        let mut offset = self.string_store.page_offset();
        for arg in argv {
            let bytes = arg.as_bytes();
            page[offset..offset + bytes.len()].copy_from_slice(bytes);
            page[offset + bytes.len()] = 0;
            offset += bytes.len() + 1;
        }
    }
}

/// Build the initial stack of `child` and return its stack pointer
///
/// The layout is checked before anything is mapped, so an oversized
/// argument list leaves both address spaces untouched. If filling or
/// mapping the page fails, the scratch mapping is still removed.
///
/// # Errors
/// See [`StackLayout::compute`]; substrate errors are propagated.
pub fn init_stack<S, M>(sys: &S, mem: &M, child: EnvId, argv: &[&str]) -> Result<ChildAddr>
where
    S: Syscalls + ?Sized,
    M: UserMemory + ?Sized,
{
    let layout = StackLayout::compute(argv)?;

    let mut page = [0u8; PAGE_SIZE];
    layout.render(argv, &mut page);

    sys.page_alloc(EnvId::SELF, SCRATCH_PAGE, Perm::USER_RW)?;

    let mapped = fill_and_map(sys, mem, child, &page);
    let unmapped = sys.page_unmap(EnvId::SELF, SCRATCH_PAGE);
    mapped?;
    unmapped?;

    debug!(
        "init_stack: child {} argc {} esp {:#010x}",
        child,
        layout.argc,
        layout.child_sp().as_u32()
    );

    Ok(layout.child_sp())
}

fn fill_and_map<S, M>(sys: &S, mem: &M, child: EnvId, page: &[u8; PAGE_SIZE]) -> Result<()>
where
    S: Syscalls + ?Sized,
    M: UserMemory + ?Sized,
{
    mem.write(SCRATCH_PAGE, page)?;
    sys.page_map(EnvId::SELF, SCRATCH_PAGE, child, STACK_PAGE, Perm::USER_RW)
}
