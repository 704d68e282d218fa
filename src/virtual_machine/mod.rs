//! Register virtual machine with an 8/16/32-bit aliased register file.
//!
//! Programs are written in a small assembly language, assembled into a
//! compact binary image and executed by an interpreter that talks to the
//! outside world through numbered host services.
//!
//! # Architecture
//!
//! - **Registers**: ten 32-bit cells; `AL`/`AH`/`AX` and friends are views onto
//!   the low bits of `EAX`..`EDX`
//! - **Memory**: one flat arena; the image sits at address 0 and the stack grows
//!   upward right after it
//! - **Instruction format**: 1-byte opcode followed by operands whose widths are
//!   fixed by the opcode and the register family
//! - **Flags**: `CMP` sets exactly one of EQ, GT or LS
//! - **Services**: `INT n` reaches the [`host::Host`] (printing, drive reads,
//!   graphics)
//!
//! # Modules
//!
//! - [`assembler`]: Source scanning, label patching, includes and diagnostics
//! - [`disassembler`]: Image decoding and round-trippable rendering
//! - [`errors`]: Assembly, load and execution error types
//! - [`host`]: Host service trait and the console host
//! - [`isa`]: Instruction set, registers, flags and service codes
//! - [`program`]: Binary image format
//! - [`vm`]: Interpreter, register file and memory arena

pub mod assembler;
pub mod disassembler;
pub mod errors;
pub mod host;
pub mod isa;
#[cfg(test)]
mod isa_static_check;
pub mod program;
pub mod vm;
