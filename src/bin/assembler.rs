//! Assembly to image compiler CLI.
//!
//! # Usage
//! ```text
//! assembler <input.asm> [-o <output>]
//! ```
//!
//! The output defaults to `<input stem>.bin` next to the input. Nothing is
//! written when assembly fails.

use clap::Parser;
use regvm::virtual_machine::assembler::{assemble_file, render_diagnostic};
use regvm::virtual_machine::program::HEADER_SIZE;
use regvm::{error, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::process;

#[derive(Parser)]
#[command(name = "assembler", version, about = "Assemble a source file into a VM image")]
struct Cli {
    /// Assembly source file to compile
    input: PathBuf,
    /// Output file path (defaults to <input>.bin)
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    if !cli.input.exists() {
        error!("Input file does not exist: {}", cli.input.display());
        process::exit(1);
    }

    let output = cli.output.unwrap_or_else(|| default_output(&cli.input));

    if let Some(parent) = output.parent()
        && !parent.as_os_str().is_empty()
        && !parent.exists()
    {
        error!("Output directory does not exist: {}", parent.display());
        process::exit(1);
    }

    let image = match assemble_file(&cli.input) {
        Ok(image) => image,
        Err(e) => {
            let source = fs::read_to_string(&e.file).ok();
            eprint!("{}", render_diagnostic(&e, source.as_deref()));
            error!("Assembly failed");
            process::exit(1);
        }
    };

    if let Err(e) = image.save(&output) {
        error!("Failed to write output file: {}", e);
        process::exit(1);
    }

    info!(
        "Compiled {} -> {} ({} bytes, code at {})",
        cli.input.display(),
        output.display(),
        HEADER_SIZE + image.len(),
        image.code_start
    );
}

fn default_output(input: &Path) -> PathBuf {
    let stem = input.file_stem().unwrap_or_default().to_string_lossy();
    let parent = input.parent().unwrap_or(Path::new("."));
    parent.join(format!("{stem}.bin"))
}
