//! Exo console
//!
//! Boots a simulated machine and drops into the kernel monitor.
//!
//! Usage:
//!   exo-console [--frames N] [--kernel-frames N] [--script FILE] [--no-color]

mod host;

use std::fs::File;
use std::io::{self, BufRead, BufReader, IsTerminal, Write};
use std::path::PathBuf;

use anyhow::{Context as _, Result};
use clap::Parser;
use colored::Colorize;

use exo_mock::{Machine, MachineConfig};
use exo_monitor::{Command, Context, Flow, Monitor};

use crate::host::{SimulatedKernel, SymbolTable};

#[derive(Parser, Debug)]
#[command(name = "exo-console")]
#[command(version)]
#[command(about = "Exo kernel monitor on a simulated machine", long_about = None)]
struct Args {
    /// Physical frames of simulated memory
    #[arg(long, default_value_t = 1024)]
    frames: usize,

    /// Low frames reserved for the kernel image
    #[arg(long, default_value_t = 384)]
    kernel_frames: usize,

    /// Read commands from a file instead of stdin
    #[arg(short, long)]
    script: Option<PathBuf>,

    /// Disable colored output
    #[arg(long)]
    no_color: bool,
}

fn mon_exit(_argv: &[&str], _ctx: &mut Context<'_>) -> io::Result<Flow> {
    Ok(Flow::Exit)
}

const EXIT: Command = Command {
    name: "exit",
    desc: "Leave the monitor",
    func: mon_exit,
};

fn main() -> Result<()> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let args = Args::parse();

    let machine = Machine::new(MachineConfig {
        frames: args.frames,
        kernel_frames: args.kernel_frames,
        ..MachineConfig::default()
    })
    .context("Invalid machine configuration")?;

    log::info!(
        "machine: {} frames ({} reserved), {} free",
        machine.frame_count(),
        args.kernel_frames,
        machine.free_frames()
    );

    let mut kernel = SimulatedKernel::boot(machine)?;

    let input: Box<dyn BufRead> = match &args.script {
        Some(path) => Box::new(BufReader::new(
            File::open(path).with_context(|| format!("Failed to open {}", path.display()))?,
        )),
        None => Box::new(io::stdin().lock()),
    };

    let color = !args.no_color && io::stdout().is_terminal();
    let monitor = Monitor::with_commands(&[EXIT]).color(color);
    log::debug!(
        "monitor commands: {}",
        monitor.commands().iter().map(|c| c.name).collect::<Vec<_>>().join(" ")
    );

    let mut out = io::stdout().lock();
    monitor
        .run(input, &mut kernel, &SymbolTable, &mut out)
        .context("Console I/O failed")?;
    out.flush()?;

    if color {
        eprintln!("{}", "monitor exited".bright_black());
    }
    Ok(())
}
