//! Binary image decoder.
//!
//! Walks the code region of an [`Image`] with the same operand layouts the
//! assembler writes, and renders the result as assembly text that assembles
//! back to the identical image.

use crate::virtual_machine::assembler::CODE_LABEL;
use crate::virtual_machine::errors::{DecodeError, Fault};
use crate::virtual_machine::isa::{Instruction, Register, Shape, Width};
use crate::virtual_machine::program::Image;
use std::fmt;
use std::fmt::Write;

const DATA_BYTES_PER_LINE: usize = 16;

/// Decoded operands of one instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operands {
    None,
    Service(u8),
    Reg(Register),
    RegImm(Register, u32),
    Target(u32),
    RegReg(Register, Register),
}

/// One decoded instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Decoded {
    /// Address of the opcode byte.
    pub offset: usize,
    pub instruction: Instruction,
    pub operands: Operands,
    /// Encoded length in bytes.
    pub size: usize,
}

impl fmt::Display for Decoded {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.instruction.mnemonic())?;
        match self.operands {
            Operands::None => Ok(()),
            Operands::Service(code) => write!(f, " {code}"),
            Operands::Reg(reg) => write!(f, " {}", reg.name()),
            Operands::RegImm(reg, imm) => write!(f, " {} {imm}", reg.name()),
            Operands::Target(target) => write!(f, " {target}"),
            Operands::RegReg(a, b) => write!(f, " {} {}", a.name(), b.name()),
        }
    }
}

/// Decodes the instruction whose opcode sits at `offset` in `bytes`.
pub fn decode(bytes: &[u8], offset: usize) -> Result<Decoded, DecodeError> {
    let invalid = |fault: Fault| DecodeError::Invalid { offset, fault };
    let opcode = *bytes.get(offset).ok_or(DecodeError::Truncated {
        offset,
        instruction: "opcode",
    })?;
    let instruction = Instruction::try_from(opcode).map_err(invalid)?;

    let mut pos = offset + 1;
    let mut take = |width: Width| {
        let slice = bytes
            .get(pos..pos + width.size())
            .ok_or(DecodeError::Truncated {
                offset,
                instruction: instruction.mnemonic(),
            })?;
        pos += width.size();
        Ok::<u32, DecodeError>(width.read_le(slice))
    };
    let reg = |id: u32| Register::try_from(id as u8).map_err(invalid);

    let operands = match instruction.shape() {
        Shape::Nullary => Operands::None,
        Shape::Service => Operands::Service(take(Width::Byte)? as u8),
        Shape::Target => Operands::Target(take(Width::Int)?),
        Shape::Reg => Operands::Reg(reg(take(Width::Byte)?)?),
        Shape::RegImm => {
            let rd = reg(take(Width::Byte)?)?;
            Operands::RegImm(rd, take(rd.width())?)
        }
        Shape::RegReg => {
            let first = reg(take(Width::Byte)?)?;
            let second = reg(take(Width::Byte)?)?;
            Operands::RegReg(first, second)
        }
    };

    Ok(Decoded {
        offset,
        instruction,
        operands,
        size: pos - offset,
    })
}

/// Decodes every instruction from the entry point to the end of the image.
pub fn disassemble(image: &Image) -> Result<Vec<Decoded>, DecodeError> {
    let mut out = Vec::new();
    let mut offset = image.code_start as usize;
    while offset < image.len() {
        let decoded = decode(&image.body, offset)?;
        offset += decoded.size;
        out.push(decoded);
    }
    Ok(out)
}

/// Renders an image as assembly source.
///
/// Data bytes become `<byte>[...]` arrays ahead of a `_CODE_:` label, and
/// each instruction is annotated with its offset.
pub fn render(image: &Image) -> Result<String, DecodeError> {
    let code = disassemble(image)?;
    let mut text = String::new();
    let _ = writeln!(
        text,
        "; {} data byte(s), {} instruction(s)",
        image.data().len(),
        code.len()
    );

    for chunk in image.data().chunks(DATA_BYTES_PER_LINE) {
        let items: Vec<String> = chunk.iter().map(u8::to_string).collect();
        let _ = writeln!(text, "<byte>[{}]", items.join(", "));
    }

    let _ = writeln!(text, "{CODE_LABEL}:");
    for decoded in &code {
        let _ = writeln!(text, "    {:<20}; {:06}", decoded.to_string(), decoded.offset);
    }
    Ok(text)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::virtual_machine::assembler::assemble_source;

    const PROGRAM: &str = r#"
        msg: "Hello\n" <short>[7, 65535] <int>[loop]
        _CODE_:
            MOV ESI msg
        loop:
            FETCH AL
            CMP AL BL
            JEQ done
            INT 3
            INC ESI 1
            JMP loop
        done:
            PUSH AX
            POP CX
            CPY EDX ECX
            ADD DH AH
            SUB EAX EBX
            DEC DL 9
            MOV EDI msg
            WRITE BH
            CALL fn
            INT 1
        fn: NOP RET
    "#;

    #[test]
    fn render_round_trips() {
        let image = assemble_source(PROGRAM).unwrap();
        let text = render(&image).unwrap();
        let again = assemble_source(&text).unwrap();
        assert_eq!(again, image);
    }

    #[test]
    fn decodes_operand_layouts() {
        let image = assemble_source("MOV AX 258\nINT 2\nCMP AL BH\nPUSH EDX\nJMP 0").unwrap();
        let code = disassemble(&image).unwrap();
        assert_eq!(code.len(), 5);
        assert_eq!(code[0].operands, Operands::RegImm(Register::Ax, 258));
        assert_eq!(code[0].size, 4);
        assert_eq!(code[1].operands, Operands::Service(2));
        assert_eq!(code[2].operands, Operands::RegReg(Register::Al, Register::Bh));
        assert_eq!(code[3].operands, Operands::Reg(Register::Edx));
        assert_eq!(code[4].operands, Operands::Target(0));
        assert_eq!(code[4].offset, 11);
        assert_eq!(code[2].to_string(), "CMP AL BH");
        assert_eq!(code[0].to_string(), "MOV AX 258");
    }

    #[test]
    fn skips_data_region() {
        let image = assemble_source("\"abc\"\n_CODE_: RET").unwrap();
        let code = disassemble(&image).unwrap();
        assert_eq!(code.len(), 1);
        assert_eq!(code[0].offset, 3);
        assert_eq!(code[0].instruction, Instruction::Ret);
    }

    #[test]
    fn rejects_bad_bytes() {
        assert_eq!(
            decode(&[0xEE], 0),
            Err(DecodeError::Invalid {
                offset: 0,
                fault: Fault::InvalidInstruction { opcode: 0xEE }
            })
        );
        assert_eq!(
            decode(&[Instruction::Push as u8, 99], 0),
            Err(DecodeError::Invalid {
                offset: 0,
                fault: Fault::InvalidRegister { register: 99 }
            })
        );
        assert_eq!(
            decode(&[0, Instruction::Jmp as u8, 1, 2], 1),
            Err(DecodeError::Truncated {
                offset: 1,
                instruction: "JMP"
            })
        );
        assert!(matches!(
            decode(&[], 0),
            Err(DecodeError::Truncated { offset: 0, .. })
        ));
    }
}
