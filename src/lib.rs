//! Register virtual machine library.
//!
//! Provides a two-pass assembler producing compact binary images and an
//! interpreter that executes them against an 8/16/32-bit aliased register file.

pub mod utils;
pub mod virtual_machine;
