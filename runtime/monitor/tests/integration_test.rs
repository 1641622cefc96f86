//! Monitor sessions driven through the public API

use std::io::{self, Write};

use exo_monitor::{
    Command, Context, Flow, Kernel, KernelSymbols, Monitor, NoSymbols, SourceLocation,
    SourceResolver, PROMPT,
};
use exo_sdk::{Perm, PhysAddr};

/// Four pages of physical memory mapped at KERNBASE, kernel read/write
struct FlatKernel {
    refs: [u32; 4],
}

impl Kernel for FlatKernel {
    fn symbols(&self) -> KernelSymbols {
        KernelSymbols {
            start: 0xF010_0000,
            etext: 0xF010_0800,
            edata: 0xF010_0C00,
            end: 0xF010_1000,
        }
    }

    fn walk(&self, va: u32) -> Option<(PhysAddr, Perm)> {
        let pa = va.checked_sub(0xF000_0000)?;
        (pa < 0x4000).then(|| (PhysAddr::new(pa & !0xFFF), Perm::P | Perm::W))
    }

    fn alloc_page(&mut self) -> Option<PhysAddr> {
        let ppn = self.refs.iter().position(|&r| r == 0)?;
        self.refs[ppn] += 1;
        Some(PhysAddr::from_ppn(ppn))
    }

    fn page_refcount(&self, pa: PhysAddr) -> Option<u32> {
        self.refs.get(pa.ppn()).copied()
    }

    fn page_decref(&mut self, pa: PhysAddr) -> bool {
        self.refs[pa.ppn()] -= 1;
        true
    }

    fn read_ebp(&self) -> u32 {
        0
    }

    fn read_eip(&self) -> u32 {
        0xF010_0100
    }

    fn read_word(&self, _va: u32) -> Option<u32> {
        None
    }
}

struct OneFunction;

impl SourceResolver for OneFunction {
    fn resolve(&self, eip: u32) -> Option<SourceLocation> {
        Some(SourceLocation {
            file: "kern/monitor.c".to_string(),
            line: 1,
            fn_name: "monitor".to_string(),
            fn_addr: eip,
        })
    }
}

fn mon_exit(_argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    writeln!(ctx.out, "bye")?;
    Ok(Flow::Exit)
}

const EXIT: Command = Command {
    name: "exit",
    desc: "Leave the monitor",
    func: mon_exit,
};

fn session(monitor: &Monitor, kernel: &mut FlatKernel, script: &str) -> String {
    let mut out = Vec::new();
    monitor
        .run(script.as_bytes(), kernel, &OneFunction, &mut out)
        .expect("Failed to run monitor");
    String::from_utf8(out).expect("Monitor printed invalid UTF-8")
}

#[test]
fn test_session_allocates_and_frees() {
    let monitor = Monitor::with_commands(&[EXIT]);
    let mut kernel = FlatKernel { refs: [1, 0, 0, 0] };

    let out = session(
        &monitor,
        &mut kernel,
        "alloc_page\npage_status 0x1000\nfree_page 0x1000\npage_status 0x1000\nexit\nhelp\n",
    );

    let expected = "Welcome to the Exo kernel monitor!\n\
                    Type 'help' for a list of commands.\n\
                    K>     0x1000\n\
                    K>     allocated\n\
                    K>     Free successfully!\n\
                    K>     free\n\
                    K> bye\n";
    assert_eq!(out, expected);
    assert_eq!(kernel.refs, [1, 0, 0, 0]);
}

#[test]
fn test_extended_help_lists_extra_command() {
    let monitor = Monitor::with_commands(&[EXIT]);
    assert_eq!(monitor.commands().len(), 8);

    let mut kernel = FlatKernel { refs: [0; 4] };
    let out = session(&monitor, &mut kernel, "help\n");
    assert!(out.contains("exit - Leave the monitor\n"));
}

#[test]
fn test_errors_keep_the_loop_running() {
    let mut kernel = FlatKernel { refs: [0; 4] };
    let out = session(
        &Monitor::new(),
        &mut kernel,
        "bogus\nshowmappings\nshowmappings 0xf0003000 0xf0004000\n",
    );

    assert!(out.contains("Unknown command 'bogus'\n"));
    assert!(out.contains("Usage: showmappings LOWER_VIRTUAL_ADDR HIGHER_VIRTUAL_ADDR\n"));
    assert!(out.contains("0xf0003000 - 0xf0004000    mapped 0x3000  kernel: read/write\n"));
    assert!(out.contains("0xf0004000 - 0xf0005000    not mapped\n"));
    assert_eq!(out.matches(PROMPT).count(), 4);
}

#[test]
fn test_backtrace_with_no_frames() {
    let mut kernel = FlatKernel { refs: [0; 4] };
    let mut out = Vec::new();
    let flow = Monitor::new()
        .run_command("backtrace", &mut kernel, &NoSymbols, &mut out)
        .expect("Failed to run backtrace");

    assert_eq!(flow, Flow::Continue);
    assert_eq!(String::from_utf8(out).unwrap(), "Stack backtrace:\n");
}
