//! The monitor's view of a simulated machine
//!
//! The simulated kernel image occupies the reserved low frames. Its symbol
//! table is fixed, and a short chain of saved frames is written into a
//! freshly allocated page at boot so `backtrace` has something to walk.

use anyhow::{ensure, Context, Result};
use log::{info, warn};

use exo_mock::Machine;
use exo_monitor::{Kernel, KernelSymbols, SourceLocation, SourceResolver};
use exo_sdk::memory::{KERNBASE, PAGE_SIZE, WORD_SIZE};
use exo_sdk::{Perm, PhysAddr};

/// A function of the simulated kernel image
pub struct FunctionInfo {
    pub name: &'static str,
    pub file: &'static str,
    pub addr: u32,
    pub len: u32,
    /// (offset into the function, source line), ascending
    pub lines: &'static [(u32, u32)],
}

pub static KERNEL_FUNCTIONS: &[FunctionInfo] = &[
    FunctionInfo {
        name: "i386_init",
        file: "kern/init.c",
        addr: 0xF010_00A6,
        len: 0x7A,
        lines: &[(0x00, 24), (0x1B, 32), (0x4A, 41), (0x66, 47)],
    },
    FunctionInfo {
        name: "runcmd",
        file: "kern/monitor.c",
        addr: 0xF010_0960,
        len: 0xE0,
        lines: &[(0x00, 189), (0x52, 210), (0x92, 216)],
    },
    FunctionInfo {
        name: "monitor",
        file: "kern/monitor.c",
        addr: 0xF010_0A40,
        len: 0x60,
        lines: &[(0x00, 224), (0x2E, 236), (0x50, 238)],
    },
];

const SYMBOLS: KernelSymbols = KernelSymbols {
    start: 0xF010_000C,
    etext: 0xF010_1A2B,
    edata: 0xF011_2300,
    end: 0xF011_2970,
};

/// Return addresses recorded in the boot stack, innermost first
const RETURN_ADDRS: [u32; 3] = [0xF010_0A8B, 0xF010_0110, 0xF010_003E];

/// Where `backtrace` starts: inside `runcmd`, which called the command
const ENTRY_EIP: u32 = 0xF010_09D2;

/// Offset of the innermost saved frame within the stack page
const STACK_TOP_OFFSET: u32 = 0xF00;

/// Distance between consecutive saved frames
const FRAME_STRIDE: u32 = 0x40;

/// [`Kernel`] backed by a simulated [`Machine`]
pub struct SimulatedKernel {
    machine: Machine,
    ebp: u32,
}

impl SimulatedKernel {
    /// Attach to `machine`, laying out the boot stack in a new page
    pub fn boot(machine: Machine) -> Result<Self> {
        let image_frames = (SYMBOLS.end - KERNBASE) as usize / PAGE_SIZE + 1;
        ensure!(
            image_frames <= machine.config().kernel_frames,
            "kernel image needs {} reserved frames, machine has {}",
            image_frames,
            machine.config().kernel_frames
        );

        let stack = machine
            .alloc_frame()
            .context("No free frame for the kernel stack")?;

        let base = KERNBASE + stack.as_u32() + STACK_TOP_OFFSET;
        for (depth, &ret) in RETURN_ADDRS.iter().enumerate() {
            let ebp = base + depth as u32 * FRAME_STRIDE;
            let saved = if depth + 1 == RETURN_ADDRS.len() {
                0
            } else {
                ebp + FRAME_STRIDE
            };

            let mut words = [0u32; 7];
            words[0] = saved;
            words[1] = ret;
            for (i, arg) in words[2..].iter_mut().enumerate() {
                *arg = (depth * 5 + i) as u32;
            }

            let bytes: Vec<u8> = words.iter().flat_map(|w| w.to_le_bytes()).collect();
            machine
                .write_phys(PhysAddr::new(ebp - KERNBASE), &bytes)
                .context("Failed to write boot stack")?;
        }

        info!("kernel stack at {:#x}, ebp {:#x}", stack.as_u32(), base);
        Ok(Self { machine, ebp: base })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }
}

impl Kernel for SimulatedKernel {
    fn symbols(&self) -> KernelSymbols {
        SYMBOLS
    }

    fn walk(&self, va: u32) -> Option<(PhysAddr, Perm)> {
        self.machine.kernel_walk(va)
    }

    fn alloc_page(&mut self) -> Option<PhysAddr> {
        self.machine.alloc_frame()
    }

    fn page_refcount(&self, pa: PhysAddr) -> Option<u32> {
        self.machine.frame_refcount(pa)
    }

    fn page_decref(&mut self, pa: PhysAddr) -> bool {
        match self.machine.frame_decref(pa) {
            Ok(()) => true,
            Err(err) => {
                warn!("decref {:#x}: {}", pa.as_u32(), err);
                false
            }
        }
    }

    fn read_ebp(&self) -> u32 {
        self.ebp
    }

    fn read_eip(&self) -> u32 {
        ENTRY_EIP
    }

    fn read_word(&self, va: u32) -> Option<u32> {
        self.machine.kernel_walk(va)?;
        let mut word = [0u8; WORD_SIZE];
        self.machine
            .read_phys(PhysAddr::new(va - KERNBASE), &mut word)
            .ok()?;
        Some(u32::from_le_bytes(word))
    }
}

/// Resolves addresses against [`KERNEL_FUNCTIONS`]
pub struct SymbolTable;

impl SourceResolver for SymbolTable {
    fn resolve(&self, eip: u32) -> Option<SourceLocation> {
        let func = KERNEL_FUNCTIONS
            .iter()
            .find(|f| (f.addr..f.addr + f.len).contains(&eip))?;
        let offset = eip - func.addr;
        let line = func
            .lines
            .iter()
            .take_while(|(start, _)| *start <= offset)
            .last()
            .map_or(0, |&(_, line)| line);

        Some(SourceLocation {
            file: func.file.to_string(),
            line,
            fn_name: func.name.to_string(),
            fn_addr: func.addr,
        })
    }
}
