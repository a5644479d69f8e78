use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use log::{info, warn};
use sim86_core::logging::{LogCategory, LogConfig, LogLevel};
use sim86_core::{disassemble, flags_string, Cpu8086, EngineConfig, Register};
use std::fs;
use std::path::{Path, PathBuf};

#[derive(Parser)]
#[command(name = "sim86", about = "8086 disassembler and simulator")]
struct Args {
    /// Core log filter: a level ("trace") and/or per-category levels
    /// ("cpu=trace,cycles=debug")
    #[arg(long, global = true)]
    log_level: Option<String>,

    /// Write core logs to this file instead of stderr
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Print a NASM listing of a raw 16-bit binary
    Disasm {
        file: PathBuf,
    },
    /// Run a raw 16-bit binary and print the final registers
    Exec {
        file: PathBuf,

        /// Estimate clock cycles (per-instruction detail at cycles=debug)
        #[arg(long, default_value_t = false)]
        cycles: bool,

        /// Write the 64 KiB memory image here after the run
        #[arg(long)]
        dump: Option<PathBuf>,

        /// Write the final register state here as JSON
        #[arg(long)]
        state: Option<PathBuf>,

        /// Engine configuration (JSON)
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

/// Apply a `--log-level` filter to the core's logging.
fn configure_core_logging(filter: &str) -> Result<()> {
    let config = LogConfig::global();
    for entry in filter.split(',').map(str::trim).filter(|e| !e.is_empty()) {
        match entry.split_once('=') {
            Some((category, level)) => {
                let category = LogCategory::from_str(category)
                    .with_context(|| format!("unknown log category '{}'", category))?;
                let level = LogLevel::from_str(level)
                    .with_context(|| format!("unknown log level '{}'", level))?;
                config.set_level(category, level);
            }
            None => {
                let level = LogLevel::from_str(entry)
                    .with_context(|| format!("unknown log level '{}'", entry))?;
                config.set_global_level(level);
            }
        }
    }
    Ok(())
}

fn read_program(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("failed to read {}", path.display()))
}

fn disasm(path: &Path) -> Result<()> {
    let program = read_program(path)?;
    let listing = disassemble(&program)
        .with_context(|| format!("failed to disassemble {}", path.display()))?;

    println!("bits 16");
    println!();
    for instruction in &listing {
        println!("{}", instruction);
    }
    Ok(())
}

/// "Final registers:" block: non-zero registers, then ip and flags.
fn register_report(cpu: &Cpu8086) -> String {
    let mut lines = vec!["Final registers:".to_string()];
    let order = [
        Register::Ax,
        Register::Bx,
        Register::Cx,
        Register::Dx,
        Register::Sp,
        Register::Bp,
        Register::Si,
        Register::Di,
        Register::Es,
        Register::Cs,
        Register::Ss,
        Register::Ds,
    ];
    let values = order.iter().map(|&reg| (reg.name(), cpu.get(reg)));
    for (name, value) in values.chain([("ip", cpu.ip)]) {
        if value != 0 {
            lines.push(format!("{:>8}: {:#06x} ({})", name, value, value));
        }
    }
    if cpu.flags != 0 {
        lines.push(format!("{:>8}: {}", "flags", flags_string(cpu.flags)));
    }
    lines.join("\n")
}

fn exec(
    path: &Path,
    cycles: bool,
    dump: Option<&Path>,
    state: Option<&Path>,
    config: Option<&Path>,
) -> Result<()> {
    let program = read_program(path)?;
    let mut engine_config = match config {
        Some(config) => EngineConfig::load(config)
            .with_context(|| format!("failed to load {}", config.display()))?,
        None => EngineConfig::default(),
    };
    engine_config.estimate_cycles |= cycles;
    let estimate_cycles = engine_config.estimate_cycles;

    let mut cpu = Cpu8086::with_config(&program, engine_config);
    let outcome = cpu.run();
    info!("executed {} instructions", cpu.steps());

    println!("{}", register_report(&cpu));
    if estimate_cycles {
        println!("\nTotal cycles: {}", cpu.cycles);
    }

    if let Some(dump) = dump {
        fs::write(dump, cpu.memory_image())
            .with_context(|| format!("failed to write {}", dump.display()))?;
        info!("memory image written to {}", dump.display());
    }
    if let Some(state) = state {
        let text = serde_json::to_string_pretty(&cpu.save_state())?;
        fs::write(state, text).with_context(|| format!("failed to write {}", state.display()))?;
    }

    if let Err(e) = outcome {
        warn!("execution stopped early: {}", e);
        return Err(e).context(format!("{} did not run to completion", path.display()));
    }
    Ok(())
}

fn main() -> Result<()> {
    env_logger::init();
    let args = Args::parse();

    if let Some(filter) = args.log_level.as_deref() {
        configure_core_logging(filter)?;
    }
    if let Some(path) = args.log_file {
        if args.log_level.is_none() {
            bail!("--log-file needs --log-level to enable some output");
        }
        LogConfig::global()
            .set_log_file(path.clone())
            .with_context(|| format!("failed to open log file {}", path.display()))?;
    }

    match args.command {
        Command::Disasm { file } => disasm(&file),
        Command::Exec {
            file,
            cycles,
            dump,
            state,
            config,
        } => exec(
            &file,
            cycles,
            dump.as_deref(),
            state.as_deref(),
            config.as_deref(),
        ),
    }
}
