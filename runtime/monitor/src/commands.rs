//! Built-in monitor commands

use std::io;

use colored::Color;
use log::info;

use exo_sdk::memory::{round_down, KERNBASE, PAGE_SIZE, WORD_SIZE};
use exo_sdk::{Perm, PhysAddr};

use crate::parse::strtol;
use crate::{paint, Context, Flow, SourceLocation};

/// Handler signature; `argv[0]` is the command name
pub type CommandFn = fn(&[&str], &mut Context<'_>) -> io::Result<Flow>;

/// One entry of the command table
#[derive(Clone, Copy)]
pub struct Command {
    pub name: &'static str,
    pub desc: &'static str,
    pub func: CommandFn,
}

impl core::fmt::Debug for Command {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("Command")
            .field("name", &self.name)
            .field("desc", &self.desc)
            .finish()
    }
}

pub static COMMANDS: &[Command] = &[
    Command {
        name: "help",
        desc: "Display this list of commands",
        func: mon_help,
    },
    Command {
        name: "kerninfo",
        desc: "Display information about the kernel",
        func: mon_kerninfo,
    },
    Command {
        name: "backtrace",
        desc: "Display a listing of function call frames",
        func: mon_backtrace,
    },
    Command {
        name: "showmappings",
        desc: "Display physical mappings and corresponding info",
        func: mon_showmappings,
    },
    Command {
        name: "alloc_page",
        desc: "Allocate pages explicitly",
        func: mon_alloc_page,
    },
    Command {
        name: "free_page",
        desc: "Free pages explicitly",
        func: mon_free_page,
    },
    Command {
        name: "page_status",
        desc: "Display status of any given page of physical memory",
        func: mon_page_status,
    },
];

/// Frames walked before `backtrace` gives up on a looping chain
const MAX_FRAMES: usize = 64;

/// Highest page-aligned 32-bit address
const LAST_PAGE: u64 = 0xFFFF_F000;

pub fn mon_help(_argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    for cmd in ctx.commands {
        writeln!(
            ctx.out,
            "{} - {}",
            paint(ctx.color, cmd.name, Color::Green),
            paint(ctx.color, cmd.desc, Color::Yellow)
        )?;
    }
    Ok(Flow::Continue)
}

pub fn mon_kerninfo(_argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    let syms = ctx.kernel.symbols();

    writeln!(ctx.out, "{}", paint(ctx.color, "Special kernel symbols:", Color::Green))?;
    for (name, va) in [
        ("_start", syms.start),
        ("etext ", syms.etext),
        ("edata ", syms.edata),
        ("end   ", syms.end),
    ] {
        let line = format!(
            "  {} {:08x} (virt)  {:08x} (phys)",
            name,
            va,
            va.wrapping_sub(KERNBASE)
        );
        writeln!(ctx.out, "{}", paint(ctx.color, &line, Color::Yellow))?;
    }

    let footprint = syms.end.wrapping_sub(syms.start).wrapping_add(1023) / 1024;
    let line = format!("Kernel executable memory footprint: {}KB", footprint);
    writeln!(ctx.out, "{}", paint(ctx.color, &line, Color::Green))?;
    Ok(Flow::Continue)
}

pub fn mon_backtrace(_argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    let mut eip = ctx.kernel.read_eip();
    let mut ebp = ctx.kernel.read_ebp();

    writeln!(ctx.out, "{}", paint(ctx.color, "Stack backtrace:", Color::Green))?;
    for _ in 0..MAX_FRAMES {
        if ebp == 0 {
            return Ok(Flow::Continue);
        }

        let loc = ctx
            .resolver
            .resolve(eip)
            .unwrap_or_else(|| SourceLocation::unknown(eip));
        let line = format!(
            "{}:{}: {}+{:x}",
            loc.file,
            loc.line,
            loc.fn_name,
            eip.wrapping_sub(loc.fn_addr)
        );
        writeln!(ctx.out, "{}", paint(ctx.color, &line, Color::Yellow))?;

        // saved ebp, return address, then five argument words
        let mut frame = [0u32; 7];
        for (i, word) in frame.iter_mut().enumerate() {
            let va = ebp.wrapping_add((i * WORD_SIZE) as u32);
            match ctx.kernel.read_word(va) {
                Some(value) => *word = value,
                None => {
                    let msg = format!("  ebp {:08x}  frame not readable", ebp);
                    writeln!(ctx.out, "{}", paint(ctx.color, &msg, Color::Red))?;
                    return Ok(Flow::Continue);
                }
            }
        }

        writeln!(
            ctx.out,
            "  ebp {:08x}  eip {:08x}  args {:08x} {:08x} {:08x} {:08x} {:08x}",
            ebp, frame[1], frame[2], frame[3], frame[4], frame[5], frame[6]
        )?;
        eip = frame[1];
        ebp = frame[0];
    }

    if ebp != 0 {
        let msg = format!("  ... stopped after {} frames", MAX_FRAMES);
        writeln!(ctx.out, "{}", paint(ctx.color, &msg, Color::Red))?;
    }
    Ok(Flow::Continue)
}

pub fn mon_showmappings(argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    if argv.len() != 3 {
        let msg = "Usage: showmappings LOWER_VIRTUAL_ADDR HIGHER_VIRTUAL_ADDR";
        writeln!(ctx.out, "{}", paint(ctx.color, msg, Color::Green))?;
        return Ok(Flow::Continue);
    }

    let page = PAGE_SIZE as u64;
    let lva = round_down(strtol(argv[1]) as usize, PAGE_SIZE) as u64;
    let hva = (u64::from(strtol(argv[2])).div_ceil(page) * page).min(LAST_PAGE);

    if hva < lva {
        writeln!(
            ctx.out,
            "{}",
            paint(ctx.color, "showmappings: Invalid address", Color::Red)
        )?;
        return Ok(Flow::Continue);
    }

    for va in (lva..=hva).step_by(PAGE_SIZE) {
        let va = va as u32;
        write!(
            ctx.out,
            "{} - {}    ",
            paint(ctx.color, &format!("0x{:x}", va), Color::Green),
            paint(ctx.color, &format!("0x{:x}", va.wrapping_add(PAGE_SIZE as u32)), Color::Green)
        )?;

        match ctx.kernel.walk(va) {
            Some((pa, perm)) if perm.contains(Perm::P) => {
                let who = if perm.contains(Perm::U) { "user: " } else { "kernel: " };
                let access = if perm.contains(Perm::W) {
                    "read/write"
                } else {
                    "read only"
                };
                writeln!(
                    ctx.out,
                    "{}{}  {}{}",
                    paint(ctx.color, "mapped ", Color::Yellow),
                    paint(ctx.color, &format!("0x{:x}", pa.as_u32()), Color::Magenta),
                    paint(ctx.color, who, Color::BrightBlack),
                    paint(ctx.color, access, Color::Magenta)
                )?;
            }
            _ => writeln!(ctx.out, "{}", paint(ctx.color, "not mapped", Color::Red))?,
        }
    }
    Ok(Flow::Continue)
}

pub fn mon_alloc_page(_argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    match ctx.kernel.alloc_page() {
        Some(pa) => {
            info!("monitor: allocated page {:#x}", pa.as_u32());
            let text = format!("0x{:x}", pa.as_u32());
            writeln!(ctx.out, "    {}", paint(ctx.color, &text, Color::Green))?;
        }
        None => writeln!(ctx.out, "    {}", paint(ctx.color, "Allocate failed!", Color::Red))?,
    }
    Ok(Flow::Continue)
}

pub fn mon_free_page(argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    let Some(pa) = page_arg(argv, "free_page", ctx)? else {
        return Ok(Flow::Continue);
    };

    if ctx.kernel.page_refcount(pa) == Some(1) && ctx.kernel.page_decref(pa) {
        info!("monitor: freed page {:#x}", pa.as_u32());
        writeln!(ctx.out, "    {}", paint(ctx.color, "Free successfully!", Color::Green))?;
    } else {
        writeln!(ctx.out, "    {}", paint(ctx.color, "Free failed!", Color::Red))?;
    }
    Ok(Flow::Continue)
}

pub fn mon_page_status(argv: &[&str], ctx: &mut Context<'_>) -> io::Result<Flow> {
    let Some(pa) = page_arg(argv, "page_status", ctx)? else {
        return Ok(Flow::Continue);
    };

    let status = if ctx.kernel.page_refcount(pa).unwrap_or(0) > 0 {
        "allocated"
    } else {
        "free"
    };
    writeln!(ctx.out, "    {}", paint(ctx.color, status, Color::Green))?;
    Ok(Flow::Continue)
}

/// The physical address argument of `free_page` and `page_status`
///
/// Prints usage, or an error for addresses outside physical memory, and
/// yields `None` when the command should stop.
fn page_arg(argv: &[&str], name: &str, ctx: &mut Context<'_>) -> io::Result<Option<PhysAddr>> {
    if argv.len() != 2 {
        let msg = format!("Usage: {} PHYSIC_ADDR", name);
        writeln!(ctx.out, "{}", paint(ctx.color, &msg, Color::Green))?;
        return Ok(None);
    }

    let pa = PhysAddr::new(strtol(argv[1]));
    if ctx.kernel.page_refcount(pa).is_none() {
        let msg = format!("{}: 0x{:x} is not physical memory", name, pa.as_u32());
        writeln!(ctx.out, "    {}", paint(ctx.color, &msg, Color::Red))?;
        return Ok(None);
    }
    Ok(Some(pa))
}
