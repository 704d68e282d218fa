//! Runs an assembled image on the register VM.
//!
//! # Usage
//! ```text
//! regvm <image> [--drive <file>] [--memory <bytes>] [--max-steps <n>] [--trace] [--timestamps]
//! ```
//!
//! Program output from the print services goes to stdout. Faults are logged
//! to stderr together with a register dump, and the process exits with 1.

use clap::Parser;
use regvm::utils::log;
use regvm::virtual_machine::host::{Halt, Host, StdHost};
use regvm::virtual_machine::program::Image;
use regvm::virtual_machine::vm::{DEFAULT_MEMORY_SIZE, VM, VmConfig};
use regvm::{error, info};
use std::fs::{self, File};
use std::io;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "regvm", version, about = "Run an assembled image on the register VM")]
struct Cli {
    /// Image produced by the assembler
    image: PathBuf,
    /// Block-storage file backing the READ_DISK service
    #[arg(short, long)]
    drive: Option<PathBuf>,
    /// Memory arena size in bytes
    #[arg(short, long, default_value_t = DEFAULT_MEMORY_SIZE)]
    memory: usize,
    /// Fault after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,
    /// Log every executed instruction
    #[arg(short, long)]
    trace: bool,
    /// Prefix log lines with the elapsed run time
    #[arg(long)]
    timestamps: bool,
}

fn main() {
    let cli = Cli::parse();
    log::set_verbose(cli.trace);
    log::show_elapsed(cli.timestamps);

    let bytes = fs::read(&cli.image).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", cli.image.display(), e);
        process::exit(1);
    });
    let image = Image::from_bytes(&bytes).unwrap_or_else(|e| {
        error!("Invalid image {}: {}", cli.image.display(), e);
        process::exit(1);
    });

    let config = VmConfig {
        memory_size: cli.memory,
        step_limit: cli.max_steps,
    };
    let mut vm = VM::new(image, config).unwrap_or_else(|e| {
        error!("Failed to load {}: {}", cli.image.display(), e);
        process::exit(1);
    });

    let stdout = io::stdout().lock();
    let outcome = match &cli.drive {
        Some(path) => {
            let drive = File::open(path).unwrap_or_else(|e| {
                error!("Failed to open drive {}: {}", path.display(), e);
                process::exit(1);
            });
            execute(&mut vm, &mut StdHost::with_drive(stdout, drive))
        }
        None => execute(&mut vm, &mut StdHost::new(stdout)),
    };

    if let Err(report) = outcome {
        error!("{report}");
        process::exit(1);
    }
}

fn execute<H: Host>(vm: &mut VM, host: &mut H) -> Result<(), String> {
    match vm.run(host) {
        Ok(Halt::Exit) => {
            info!("Halted after {} instruction(s)", vm.steps());
            Ok(())
        }
        Ok(halt) => {
            info!("Stopped ({halt:?}) after {} instruction(s)", vm.steps());
            Ok(())
        }
        Err(e) => Err(format!("{e}\n{}", vm.registers())),
    }
}
