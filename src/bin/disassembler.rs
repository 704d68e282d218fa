//! Image to assembly CLI.
//!
//! # Usage
//! ```text
//! disassembler <image> [-o <output>]
//! ```
//!
//! Prints the rendered assembly to stdout unless `-o` is given.

use clap::Parser;
use regvm::virtual_machine::disassembler::render;
use regvm::virtual_machine::program::Image;
use regvm::{error, info};
use std::fs;
use std::path::PathBuf;
use std::process;

#[derive(Parser)]
#[command(name = "disassembler", version, about = "Render a VM image as assembly")]
struct Cli {
    /// Image produced by the assembler
    image: PathBuf,
    /// Write the listing here instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,
}

fn main() {
    let cli = Cli::parse();

    let bytes = fs::read(&cli.image).unwrap_or_else(|e| {
        error!("Failed to read {}: {}", cli.image.display(), e);
        process::exit(1);
    });
    let image = Image::from_bytes(&bytes).unwrap_or_else(|e| {
        error!("Invalid image {}: {}", cli.image.display(), e);
        process::exit(1);
    });
    let text = render(&image).unwrap_or_else(|e| {
        error!("{e}");
        process::exit(1);
    });

    match cli.output {
        Some(path) => {
            if let Err(e) = fs::write(&path, text) {
                error!("Failed to write output file: {}", e);
                process::exit(1);
            }
            info!("Wrote {}", path.display());
        }
        None => print!("{text}"),
    }
}
