//! Exo kernel monitor
//!
//! # Purpose
//! An interactive, line-oriented console for poking at the kernel's
//! physical memory and page tables while the system is stopped.
//!
//! # Integration Points
//! - Depends on: a [`Kernel`] introspection interface and a
//!   [`SourceResolver`] for turning return addresses into source locations
//! - Provides to: the console tool (`exo-console`) and kernel panic paths
//!
//! # Architecture
//! Each input line is split on whitespace and its first word looked up in
//! a static table of [`Command`]s. Handlers write plain text (optionally
//! colored) to the output and return a [`Flow`]; the loop ends only when a
//! handler returns [`Flow::Exit`] or input runs out. Malformed arguments
//! print a usage line and leave the monitor running.

pub mod commands;
pub mod parse;

use std::io::{self, BufRead, Write};

use colored::{Color, Colorize};
use log::debug;

use exo_sdk::{Perm, PhysAddr};

pub use commands::{Command, COMMANDS};

/// Prompt printed before every command
pub const PROMPT: &str = "K> ";

/// What the monitor does after a command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Exit,
}

/// Linker symbols bounding the kernel image (virtual addresses)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct KernelSymbols {
    pub start: u32,
    pub etext: u32,
    pub edata: u32,
    pub end: u32,
}

/// Kernel state the monitor can inspect and change
pub trait Kernel {
    /// Linker symbols of the running kernel
    fn symbols(&self) -> KernelSymbols;

    /// Translate `va` through the kernel page table
    ///
    /// Returns the physical page and entry permissions, or `None` if no
    /// present mapping exists.
    fn walk(&self, va: u32) -> Option<(PhysAddr, Perm)>;

    /// Allocate a physical page and take one reference to it
    fn alloc_page(&mut self) -> Option<PhysAddr>;

    /// Reference count of the page holding `pa`; `None` if `pa` is not in
    /// physical memory
    fn page_refcount(&self, pa: PhysAddr) -> Option<u32>;

    /// Drop one reference to the page holding `pa`
    ///
    /// Returns `false` if the page may not be released, such as a page of
    /// the kernel image.
    fn page_decref(&mut self, pa: PhysAddr) -> bool;

    /// Frame pointer of the monitor's caller
    fn read_ebp(&self) -> u32;

    /// Return address of the monitor's caller
    fn read_eip(&self) -> u32;

    /// Load a word of kernel memory
    fn read_word(&self, va: u32) -> Option<u32>;
}

/// Where an instruction address comes from
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceLocation {
    pub file: String,
    pub line: u32,
    pub fn_name: String,
    /// Address of the first instruction of `fn_name`
    pub fn_addr: u32,
}

impl SourceLocation {
    /// Placeholder for addresses without debug information
    pub fn unknown(eip: u32) -> Self {
        Self {
            file: "<unknown>".to_string(),
            line: 0,
            fn_name: "<unknown>".to_string(),
            fn_addr: eip,
        }
    }
}

/// Maps instruction addresses to source locations
pub trait SourceResolver {
    fn resolve(&self, eip: u32) -> Option<SourceLocation>;
}

/// Resolver that knows nothing
pub struct NoSymbols;

impl SourceResolver for NoSymbols {
    fn resolve(&self, _eip: u32) -> Option<SourceLocation> {
        None
    }
}

/// Everything a command handler may touch
pub struct Context<'a> {
    pub kernel: &'a mut dyn Kernel,
    pub resolver: &'a dyn SourceResolver,
    pub out: &'a mut dyn Write,
    /// The table the command was found in
    pub commands: &'a [Command],
    pub color: bool,
}

/// `text` in `color` when `on`
pub fn paint(on: bool, text: &str, color: Color) -> String {
    if on {
        text.color(color).to_string()
    } else {
        text.to_string()
    }
}

/// The command interpreter
pub struct Monitor {
    commands: Vec<Command>,
    color: bool,
}

impl Default for Monitor {
    fn default() -> Self {
        Self::new()
    }
}

impl Monitor {
    /// Monitor with the built-in commands
    pub fn new() -> Self {
        Self::with_commands(&[])
    }

    /// Monitor with the built-in commands followed by `extra`
    pub fn with_commands(extra: &[Command]) -> Self {
        Self {
            commands: COMMANDS.iter().chain(extra).copied().collect(),
            color: false,
        }
    }

    /// Turn ANSI colors on or off
    pub fn color(mut self, on: bool) -> Self {
        self.color = on;
        self
    }

    /// Command table in dispatch order, built-ins first
    pub fn commands(&self) -> &[Command] {
        &self.commands
    }

    /// Parse and execute one command line
    pub fn run_command(
        &self,
        line: &str,
        kernel: &mut dyn Kernel,
        resolver: &dyn SourceResolver,
        out: &mut dyn Write,
    ) -> io::Result<Flow> {
        let mut ctx = Context {
            kernel,
            resolver,
            out,
            commands: &self.commands,
            color: self.color,
        };

        let argv = match parse::tokenize(line) {
            Ok(argv) => argv,
            Err(parse::TooManyArgs) => {
                let msg = format!("Too many arguments (max {})", parse::MAX_ARGS);
                writeln!(ctx.out, "{}", paint(ctx.color, &msg, Color::Red))?;
                return Ok(Flow::Continue);
            }
        };

        let Some(&name) = argv.first() else {
            return Ok(Flow::Continue);
        };

        match self.commands.iter().find(|cmd| cmd.name == name) {
            Some(cmd) => {
                debug!("monitor: {}", line.trim_end());
                (cmd.func)(&argv, &mut ctx)
            }
            None => {
                let msg = format!("Unknown command '{}'", name);
                writeln!(ctx.out, "{}", paint(ctx.color, &msg, Color::Red))?;
                Ok(Flow::Continue)
            }
        }
    }

    /// Run the prompt loop until a command exits or `input` ends
    pub fn run<R: BufRead>(
        &self,
        mut input: R,
        kernel: &mut dyn Kernel,
        resolver: &dyn SourceResolver,
        out: &mut dyn Write,
    ) -> io::Result<()> {
        let welcome = "Welcome to the Exo kernel monitor!";
        let hint = "Type 'help' for a list of commands.";
        if self.color {
            writeln!(out, "{}", welcome.magenta())?;
            writeln!(out, "{}", hint.bright_black())?;
        } else {
            writeln!(out, "{}", welcome)?;
            writeln!(out, "{}", hint)?;
        }

        let mut line = String::new();
        loop {
            write!(out, "{}", PROMPT)?;
            out.flush()?;

            line.clear();
            if input.read_line(&mut line)? == 0 {
                writeln!(out)?;
                return Ok(());
            }

            if self.run_command(&line, kernel, resolver, out)? == Flow::Exit {
                return Ok(());
            }
        }
    }
}


#[cfg(test)]
mod tests {
    use super::testing::{run, FakeKernel};
    use super::*;

    fn quit(_argv: &[&str], _ctx: &mut Context<'_>) -> io::Result<Flow> {
        Ok(Flow::Exit)
    }

    #[test]
    fn test_unknown_command() {
        let mut kernel = FakeKernel::new();
        let (flow, out) = run(&Monitor::new(), &mut kernel, "frobnicate 1 2\n");
        assert_eq!(flow, Flow::Continue);
        assert_eq!(out, "Unknown command 'frobnicate'\n");
    }

    #[test]
    fn test_blank_line_does_nothing() {
        let mut kernel = FakeKernel::new();
        let (flow, out) = run(&Monitor::new(), &mut kernel, "  \t\n");
        assert_eq!(flow, Flow::Continue);
        assert!(out.is_empty());
    }

    #[test]
    fn test_too_many_arguments() {
        let mut kernel = FakeKernel::new();
        let line = vec!["help"; 16].join(" ");
        let (_, out) = run(&Monitor::new(), &mut kernel, &line);
        assert_eq!(out, "Too many arguments (max 16)\n");
    }

    #[test]
    fn test_exact_match_only() {
        let mut kernel = FakeKernel::new();
        let (_, out) = run(&Monitor::new(), &mut kernel, "hel");
        assert_eq!(out, "Unknown command 'hel'\n");
    }

    #[test]
    fn test_run_loop_until_exit() {
        let monitor = Monitor::with_commands(&[Command {
            name: "exit",
            desc: "Leave the monitor",
            func: quit,
        }]);
        let mut kernel = FakeKernel::new();
        let input = b"page_status 0x3000\nexit\npage_status 0x2000\n";
        let mut out = Vec::new();

        monitor
            .run(&input[..], &mut kernel, &NoSymbols, &mut out)
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.starts_with("Welcome to the Exo kernel monitor!\n"));
        assert_eq!(out.matches(PROMPT).count(), 2);
        assert!(out.contains("    allocated\n"));
        assert!(!out.contains("    free\n"));
    }

    #[test]
    fn test_run_loop_ends_at_eof() {
        let mut kernel = FakeKernel::new();
        let mut out = Vec::new();
        Monitor::new()
            .run(&b"kerninfo\n"[..], &mut kernel, &NoSymbols, &mut out)
            .unwrap();

        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("Special kernel symbols:"));
        assert!(out.ends_with("K> \n"));
    }

    #[test]
    fn test_colored_output_keeps_text() {
        colored::control::set_override(true);
        let mut kernel = FakeKernel::new();
        let mut out = Vec::new();
        Monitor::new()
            .color(true)
            .run_command("nope", &mut kernel, &NoSymbols, &mut out)
            .unwrap();
        let out = String::from_utf8(out).unwrap();
        assert!(out.contains("\u{1b}["));
        assert!(out.contains("Unknown command 'nope'"));
    }
}
