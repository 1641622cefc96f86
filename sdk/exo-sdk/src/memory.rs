//! Memory layout, address types and page permissions
//!
//! User environments see a flat 32-bit address space. Everything below
//! [`UTOP`] belongs to the environment; the kernel owns the rest.
//!
//! ```text
//!  KERNBASE  0xf0000000  kernel image and physical memory window
//!  UTOP      0xeec00000  top of user-controlled memory (also the "no page" sentinel)
//!  USTACKTOP 0xeebfe000  top of the normal user stack
//!  FILEVA    0xd0000000  read-only views of open files
//!  UTEXT     0x00800000  program text
//!  UTEMP     0x00400000  scratch page used while building children
//! ```

use bitflags::bitflags;
use core::fmt;
use static_assertions::const_assert;

/// Page size (4KB)
pub const PAGE_SIZE: usize = 4096;

/// log2(PAGE_SIZE)
pub const PAGE_SHIFT: u32 = 12;

/// Bytes mapped by one page directory entry
pub const PTSIZE: u32 = 1024 * PAGE_SIZE as u32;

/// Width of a user word (pointers written into child stacks)
pub const WORD_SIZE: usize = 4;

/// Base of the kernel's window onto physical memory
pub const KERNBASE: u32 = 0xF000_0000;

/// Top of user-controlled address space
pub const UTOP: VirtAddr = VirtAddr(0xEEC0_0000);

/// Top of the normal user stack
///
/// The two pages below UTOP hold the exception stack and its guard page.
pub const USTACKTOP: VirtAddr = VirtAddr(UTOP.0 - 2 * PAGE_SIZE as u32);

/// Start of program text
pub const UTEXT: VirtAddr = VirtAddr(2 * PTSIZE);

/// Scratch page for temporary mappings
pub const UTEMP: VirtAddr = VirtAddr(UTEXT.0 / 2);

/// Region where open files are mapped read-only
pub const FILEVA: VirtAddr = VirtAddr(0xD000_0000);

/// Bytes of address space reserved for each open file
pub const MAXFILESIZE: u32 = PTSIZE;

const_assert!(PAGE_SIZE.is_power_of_two());
const_assert!(1 << PAGE_SHIFT == PAGE_SIZE);
const_assert!(UTOP.0 < KERNBASE);
const_assert!(USTACKTOP.0 % PAGE_SIZE as u32 == 0);
const_assert!(UTEMP.0 % PAGE_SIZE as u32 == 0);
const_assert!(FILEVA.0 < USTACKTOP.0);

bitflags! {
    /// Page table entry permission bits
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
    pub struct Perm: u32 {
        /// Present
        const P     = 0x001;
        /// Writeable
        const W     = 0x002;
        /// User accessible
        const U     = 0x004;
        /// Write-through
        const PWT   = 0x008;
        /// Cache disable
        const PCD   = 0x010;
        /// Accessed
        const A     = 0x020;
        /// Dirty
        const D     = 0x040;
        /// Page size
        const PS    = 0x080;
        /// Global
        const G     = 0x100;
        /// Available for software use
        const AVAIL = 0xE00;
        /// Mapping is shared on fork/spawn
        const SHARE = 0x400;

        /// Bits a user environment may pass to the page syscalls
        const SYSCALL = Self::AVAIL.bits() | Self::P.bits() | Self::W.bits() | Self::U.bits();

        /// User read-only mapping
        const USER_RO = Self::U.bits() | Self::P.bits();

        /// User read-write mapping
        const USER_RW = Self::U.bits() | Self::W.bits() | Self::P.bits();
    }
}

impl Perm {
    /// True if `self` is an acceptable permission set for a user page syscall
    ///
    /// Both `U` and `P` must be present and nothing outside
    /// [`Perm::SYSCALL`] may be set.
    pub fn is_valid_user(self) -> bool {
        self.contains(Perm::USER_RO) && Perm::SYSCALL.contains(self)
    }
}

/// Virtual address in a 32-bit user address space
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct VirtAddr(u32);

impl VirtAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Offset of this address within its page
    pub const fn page_offset(self) -> usize {
        (self.0 as usize) & (PAGE_SIZE - 1)
    }

    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    /// Start of the page containing this address
    pub const fn page_round_down(self) -> Self {
        Self(self.0 & !(PAGE_SIZE as u32 - 1))
    }

    /// Virtual page number
    pub const fn vpn(self) -> u32 {
        self.0 >> PAGE_SHIFT
    }

    /// Address `bytes` above this one (32-bit wrapping arithmetic)
    pub const fn offset(self, bytes: usize) -> Self {
        Self(self.0.wrapping_add(bytes as u32))
    }

    /// True if the address lies below [`UTOP`]
    pub const fn is_user(self) -> bool {
        self.0 < UTOP.0
    }
}

impl fmt::Debug for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "VirtAddr({:#010x})", self.0)
    }
}

impl fmt::Display for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#010x}", self.0)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Physical address
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct PhysAddr(u32);

impl PhysAddr {
    pub const fn new(addr: u32) -> Self {
        Self(addr)
    }

    pub const fn as_u32(self) -> u32 {
        self.0
    }

    pub const fn as_usize(self) -> usize {
        self.0 as usize
    }

    /// Physical page number
    pub const fn ppn(self) -> usize {
        (self.0 >> PAGE_SHIFT) as usize
    }

    /// Address of the first byte of physical page `ppn`
    pub const fn from_ppn(ppn: usize) -> Self {
        Self((ppn << PAGE_SHIFT) as u32)
    }

    /// Kernel virtual address of this physical address
    pub const fn kva(self) -> VirtAddr {
        VirtAddr(self.0.wrapping_add(KERNBASE))
    }
}

impl fmt::Debug for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PhysAddr({:#010x})", self.0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Round `value` down to a multiple of `align` (power of two)
pub const fn round_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Round `value` up to a multiple of `align` (power of two)
pub const fn round_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}
