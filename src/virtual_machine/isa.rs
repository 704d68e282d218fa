//! Instruction Set Architecture (ISA) definitions.
//!
//! Defines the machine's instruction set, register identifiers, flag bits and
//! service codes. The [`for_each_instruction!`](crate::for_each_instruction)
//! macro holds the canonical instruction table and invokes a callback macro for
//! code generation, so the assembler, the disassembler and the interpreter all
//! derive their view of the binary format from one list.
//!
//! This module generates:
//! - The [`Instruction`] enum with opcode mappings
//! - `TryFrom<u8>` for decoding opcodes
//! - [`Instruction::shape`], the operand layout every consumer matches on
//!
//! # Bytecode Format
//!
//! Instructions use variable-length encoding:
//! - Opcode: 1 byte
//! - Register operand: 1 byte (register id)
//! - Immediate: 1, 2 or 4 bytes (little-endian), width chosen by the register
//!   family of the preceding register operand
//! - Service code: 1 byte
//! - Jump/call target: 4 bytes (little-endian, absolute byte offset)

use crate::virtual_machine::errors::Fault;

/// Invokes a callback macro with the complete instruction definition list.
///
/// This macro enables code generation for instructions in multiple modules
/// without duplicating the instruction definitions.
#[macro_export]
macro_rules! for_each_instruction {
    ($callback:ident) => {
        $callback! {
            /// NOP ; do nothing
            Nop = 0x00, "NOP" => Nullary,
            /// INT code ; invoke host service `code`
            Int = 0x01, "INT" => Service,
            /// MOV rd, imm ; rd = imm (imm as wide as rd)
            Mov = 0x02, "MOV" => RegImm,
            /// CPY rd, rs ; rd = rs
            Cpy = 0x03, "CPY" => RegReg,
            /// ADD rd, rs ; rd = rd + rs (wrapping at rd's width)
            Add = 0x04, "ADD" => RegReg,
            /// INC rd, imm ; rd = rd + imm
            Inc = 0x05, "INC" => RegImm,
            /// DEC rd, imm ; rd = rd - imm
            Dec = 0x06, "DEC" => RegImm,
            /// SUB rd, rs ; rd = rd - rs (wrapping at rd's width)
            Sub = 0x07, "SUB" => RegReg,
            /// CMP ra, rb ; FLG = sign(ra - rb)
            Cmp = 0x08, "CMP" => RegReg,
            /// JMP target ; EIP = target
            Jmp = 0x09, "JMP" => Target,
            /// JEQ target ; if FLG & EQ then EIP = target
            Jeq = 0x0A, "JEQ" => Target,
            /// JLE target ; if FLG & LS then EIP = target
            Jle = 0x0B, "JLE" => Target,
            /// JGE target ; if FLG & GT then EIP = target
            Jge = 0x0C, "JGE" => Target,
            /// PUSH rs ; mem[ESP] = rs; ESP += width(rs)
            Push = 0x0D, "PUSH" => Reg,
            /// POP rd ; ESP -= width(rd); rd = mem[ESP]
            Pop = 0x0E, "POP" => Reg,
            /// FETCH rd ; rd = mem[ESI]
            Fetch = 0x0F, "FETCH" => Reg,
            /// WRITE rs ; mem[EDI] = rs
            Write = 0x10, "WRITE" => Reg,
            /// CALL target ; push EIP; EIP = target
            Call = 0x11, "CALL" => Target,
            /// RET ; pop EIP
            Ret = 0x12, "RET" => Nullary,
        }
    };
}

#[macro_export]
macro_rules! define_instructions {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $opcode:literal, $mnemonic:literal => $shape:ident
        ),* $(,)?
    ) => {
        // =========================
        // VM instruction enum
        // =========================
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Instruction {
            $(
                $(#[$doc])*
                $name = $opcode,
            )*
        }

        impl TryFrom<u8> for Instruction {
            type Error = Fault;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $opcode => Ok(Instruction::$name), )*
                    _ => Err(Fault::InvalidInstruction { opcode: value }),
                }
            }
        }

        impl Instruction {
            /// Every instruction, in opcode order.
            pub const ALL: &'static [Instruction] = &[ $( Instruction::$name ),* ];

            /// Returns the assembly mnemonic for this instruction.
            pub const fn mnemonic(&self) -> &'static str {
                match self {
                    $( Instruction::$name => $mnemonic, )*
                }
            }

            /// Returns the operand layout that follows the opcode byte.
            pub const fn shape(&self) -> Shape {
                match self {
                    $( Instruction::$name => Shape::$shape, )*
                }
            }

            /// Looks up an instruction by its (case-sensitive) mnemonic.
            pub fn from_mnemonic(name: &str) -> Option<Instruction> {
                match name {
                    $( $mnemonic => Some(Instruction::$name), )*
                    _ => None,
                }
            }
        }
    };
}

for_each_instruction!(define_instructions);

/// Operand layout of an instruction.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Shape {
    /// No operands.
    Nullary,
    /// One byte selecting a host service.
    Service,
    /// One register.
    Reg,
    /// A register followed by an immediate as wide as that register.
    RegImm,
    /// One 4-byte absolute code offset.
    Target,
    /// Two registers of the same width family.
    RegReg,
}

impl Shape {
    /// Number of operands written after the opcode.
    pub const fn operand_count(&self) -> usize {
        match self {
            Shape::Nullary => 0,
            Shape::Service | Shape::Reg | Shape::Target => 1,
            Shape::RegImm | Shape::RegReg => 2,
        }
    }
}

/// Operand width family.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum Width {
    Byte,
    Short,
    Int,
}

impl Width {
    /// Encoded size in bytes.
    pub const fn size(self) -> usize {
        match self {
            Width::Byte => 1,
            Width::Short => 2,
            Width::Int => 4,
        }
    }

    /// Bit mask covering a value of this width.
    pub const fn mask(self) -> u32 {
        match self {
            Width::Byte => 0xFF,
            Width::Short => 0xFFFF,
            Width::Int => u32::MAX,
        }
    }

    pub const fn name(self) -> &'static str {
        match self {
            Width::Byte => "byte",
            Width::Short => "short",
            Width::Int => "int",
        }
    }

    /// Largest literal accepted for this width.
    pub const fn max_literal(self) -> u64 {
        self.mask() as u64
    }

    /// Largest label offset a deferred patch of this width may receive.
    ///
    /// Narrow patches are range-checked as signed values.
    pub const fn max_label(self) -> u32 {
        match self {
            Width::Byte => i8::MAX as u32,
            Width::Short => i16::MAX as u32,
            Width::Int => u32::MAX,
        }
    }

    /// Interprets the low bits of `value` as a signed number of this width.
    pub const fn sign_extend(self, value: u32) -> i32 {
        match self {
            Width::Byte => value as u8 as i8 as i32,
            Width::Short => value as u16 as i16 as i32,
            Width::Int => value as i32,
        }
    }

    /// Writes the low `size()` bytes of `value` little-endian into `dst`.
    pub fn write_le(self, value: u32, dst: &mut [u8]) {
        dst[..self.size()].copy_from_slice(&value.to_le_bytes()[..self.size()]);
    }

    /// Reads a little-endian value of this width from the start of `src`.
    pub fn read_le(self, src: &[u8]) -> u32 {
        let mut buf = [0u8; 4];
        buf[..self.size()].copy_from_slice(&src[..self.size()]);
        u32::from_le_bytes(buf)
    }
}

/// Which bits of the backing 32-bit cell a register name addresses.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
pub enum View {
    /// Bits 0..8.
    Low8,
    /// Bits 8..16.
    High8,
    /// Bits 0..16.
    Low16,
    /// All 32 bits.
    Full,
}

impl View {
    pub const fn width(self) -> Width {
        match self {
            View::Low8 | View::High8 => Width::Byte,
            View::Low16 => Width::Short,
            View::Full => Width::Int,
        }
    }

    pub const fn shift(self) -> u32 {
        match self {
            View::High8 => 8,
            View::Low8 | View::Low16 | View::Full => 0,
        }
    }
}

macro_rules! define_registers {
    (
        $(
            $(#[$doc:meta])*
            $name:ident = $id:literal, $mnemonic:literal => $cell:ident . $view:ident
        ),* $(,)?
    ) => {
        /// Register identifier as encoded in register operands.
        #[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
        #[repr(u8)]
        pub enum Register {
            $(
                $(#[$doc])*
                $name = $id,
            )*
        }

        impl TryFrom<u8> for Register {
            type Error = Fault;

            fn try_from(value: u8) -> Result<Self, Self::Error> {
                match value {
                    $( $id => Ok(Register::$name), )*
                    _ => Err(Fault::InvalidRegister { register: value }),
                }
            }
        }

        impl Register {
            /// Every register, in id order.
            pub const ALL: &'static [Register] = &[ $( Register::$name ),* ];

            /// Returns the assembly name of this register.
            pub const fn name(self) -> &'static str {
                match self {
                    $( Register::$name => $mnemonic, )*
                }
            }

            /// Looks up a register by its (case-sensitive) assembly name.
            pub fn from_name(name: &str) -> Option<Register> {
                match name {
                    $( $mnemonic => Some(Register::$name), )*
                    _ => None,
                }
            }

            /// The 32-bit register whose storage this register aliases.
            pub const fn cell(self) -> Register {
                match self {
                    $( Register::$name => Register::$cell, )*
                }
            }

            /// The bits of [`Register::cell`] this register reads and writes.
            pub const fn view(self) -> View {
                match self {
                    $( Register::$name => View::$view, )*
                }
            }
        }
    };
}

define_registers! {
    /// Accumulator; EXIT/PRINT services read it.
    Eax = 0, "EAX" => Eax.Full,
    Ebx = 1, "EBX" => Ebx.Full,
    Ecx = 2, "ECX" => Ecx.Full,
    Edx = 3, "EDX" => Edx.Full,
    /// Stack base; pops may not move ESP below it.
    Esb = 4, "ESB" => Esb.Full,
    /// Stack pointer; next free stack byte.
    Esp = 5, "ESP" => Esp.Full,
    /// Source index used by FETCH.
    Esi = 6, "ESI" => Esi.Full,
    /// Destination index used by WRITE.
    Edi = 7, "EDI" => Edi.Full,
    /// Instruction pointer; changed only by control flow.
    Eip = 8, "EIP" => Eip.Full,
    /// Comparison flags.
    Flg = 9, "FLG" => Flg.Full,
    Al = 10, "AL" => Eax.Low8,
    Ah = 11, "AH" => Eax.High8,
    Bl = 12, "BL" => Ebx.Low8,
    Bh = 13, "BH" => Ebx.High8,
    Cl = 14, "CL" => Ecx.Low8,
    Ch = 15, "CH" => Ecx.High8,
    Dl = 16, "DL" => Edx.Low8,
    Dh = 17, "DH" => Edx.High8,
    Ax = 18, "AX" => Eax.Low16,
    Bx = 19, "BX" => Ebx.Low16,
    Cx = 20, "CX" => Ecx.Low16,
    Dx = 21, "DX" => Edx.Low16,
}

/// Number of 32-bit storage cells backing the register file.
pub const CELL_COUNT: usize = 10;

impl Register {
    /// Width family of this register.
    pub const fn width(self) -> Width {
        self.view().width()
    }

    /// Whether data instructions may write this register.
    ///
    /// EIP and FLG only change through control flow and CMP.
    pub const fn is_writable(self) -> bool {
        !matches!(self, Register::Eip | Register::Flg)
    }
}

/// Set by CMP when both operands are equal.
pub const FLAG_EQ: u32 = 1;
/// Set by CMP when the first operand is greater.
pub const FLAG_GT: u32 = 2;
/// Set by CMP when the first operand is less.
pub const FLAG_LS: u32 = 4;

/// Host service selected by the `INT` operand.
#[derive(Copy, Clone, Debug, Eq, PartialEq, Hash)]
#[repr(u8)]
pub enum Service {
    /// Halt the machine.
    Exit = 1,
    /// Print EAX as a signed decimal.
    PrintInt = 2,
    /// Print the low byte of EAX.
    PrintChar = 3,
    /// Copy drive bytes `[EAX, EBX)` onto the stack.
    ReadDisk = 4,
    /// Drain host events; may request a stop.
    Poll = 5,
    /// Present the frame.
    Redraw = 6,
    /// Set the draw color from three bytes at ESI.
    SetColor = 7,
    /// Draw EAX points (f32 pairs) read from ESI.
    Draw = 8,
}

impl Service {
    pub const ALL: [Service; 8] = [
        Service::Exit,
        Service::PrintInt,
        Service::PrintChar,
        Service::ReadDisk,
        Service::Poll,
        Service::Redraw,
        Service::SetColor,
        Service::Draw,
    ];

    pub const fn name(self) -> &'static str {
        match self {
            Service::Exit => "EXIT",
            Service::PrintInt => "PRINT_INT",
            Service::PrintChar => "PRINT_CHAR",
            Service::ReadDisk => "READ_DISK",
            Service::Poll => "POLL",
            Service::Redraw => "REDRAW",
            Service::SetColor => "SET_COLOR",
            Service::Draw => "DRAW",
        }
    }
}

impl TryFrom<u8> for Service {
    type Error = Fault;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Service::ALL
            .into_iter()
            .find(|s| *s as u8 == code)
            .ok_or(Fault::InvalidInterrupt { code })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instruction_try_from_invalid() {
        assert!(matches!(
            Instruction::try_from(0xFF),
            Err(Fault::InvalidInstruction { opcode: 0xFF })
        ));
    }

    #[test]
    fn instruction_opcodes_roundtrip() {
        for instr in Instruction::ALL {
            assert_eq!(Instruction::try_from(*instr as u8).unwrap(), *instr);
            assert_eq!(Instruction::from_mnemonic(instr.mnemonic()), Some(*instr));
        }
        assert_eq!(Instruction::ALL.len(), 19);
    }

    #[test]
    fn mnemonics_are_case_sensitive() {
        assert_eq!(Instruction::from_mnemonic("MOV"), Some(Instruction::Mov));
        assert_eq!(Instruction::from_mnemonic("mov"), None);
        assert_eq!(Register::from_name("EAX"), Some(Register::Eax));
        assert_eq!(Register::from_name("eax"), None);
    }

    #[test]
    fn register_families() {
        assert_eq!(Register::Al.cell(), Register::Eax);
        assert_eq!(Register::Ah.view(), View::High8);
        assert_eq!(Register::Dx.cell(), Register::Edx);
        assert_eq!(Register::Cx.width(), Width::Short);
        assert_eq!(Register::Esp.width(), Width::Int);
        assert_eq!(Register::Bh.width(), Width::Byte);
        for reg in Register::ALL {
            assert!((reg.cell() as usize) < CELL_COUNT);
            assert_eq!(Register::try_from(*reg as u8).unwrap(), *reg);
        }
        assert!(matches!(
            Register::try_from(22),
            Err(Fault::InvalidRegister { register: 22 })
        ));
    }

    #[test]
    fn special_registers_are_read_only() {
        assert!(!Register::Eip.is_writable());
        assert!(!Register::Flg.is_writable());
        assert!(Register::Esp.is_writable());
        assert!(Register::Al.is_writable());
    }

    #[test]
    fn width_ranges() {
        assert_eq!(Width::Byte.max_literal(), 255);
        assert_eq!(Width::Short.max_literal(), 65535);
        assert_eq!(Width::Int.max_literal(), u32::MAX as u64);
        assert_eq!(Width::Byte.max_label(), 127);
        assert_eq!(Width::Short.max_label(), 32767);
        assert_eq!(Width::Byte.sign_extend(0xFF), -1);
        assert_eq!(Width::Short.sign_extend(0x8000), -32768);
        assert_eq!(Width::Int.sign_extend(5), 5);
    }

    #[test]
    fn width_le_codec() {
        let mut buf = [0u8; 4];
        Width::Short.write_le(0xBEEF, &mut buf);
        assert_eq!(buf, [0xEF, 0xBE, 0, 0]);
        assert_eq!(Width::Short.read_le(&buf), 0xBEEF);
        Width::Int.write_le(0x0102_0304, &mut buf);
        assert_eq!(buf, [4, 3, 2, 1]);
        assert_eq!(Width::Byte.read_le(&buf), 4);
    }

    #[test]
    fn service_codes() {
        assert_eq!(Service::try_from(1).unwrap(), Service::Exit);
        assert_eq!(Service::try_from(8).unwrap(), Service::Draw);
        assert!(matches!(
            Service::try_from(0),
            Err(Fault::InvalidInterrupt { code: 0 })
        ));
        assert!(matches!(
            Service::try_from(9),
            Err(Fault::InvalidInterrupt { code: 9 })
        ));
    }

    #[test]
    fn shapes_match_operand_counts() {
        assert_eq!(Instruction::Nop.shape().operand_count(), 0);
        assert_eq!(Instruction::Int.shape(), Shape::Service);
        assert_eq!(Instruction::Mov.shape(), Shape::RegImm);
        assert_eq!(Instruction::Cmp.shape(), Shape::RegReg);
        assert_eq!(Instruction::Call.shape(), Shape::Target);
        assert_eq!(Instruction::Ret.shape(), Shape::Nullary);
    }
}
