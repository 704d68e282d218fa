use crate::virtual_machine::isa::{CELL_COUNT, Register};
use std::fmt;

/// Register file holding VM storage.
///
/// Ten 32-bit cells back all twenty-two register names. `AL`, `AH` and `AX`
/// are views onto the bits of `EAX` (and likewise for B/C/D), so writes
/// through a narrow name preserve the rest of the cell.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Registers {
    cells: [u32; CELL_COUNT],
}

impl Registers {
    /// Creates a register file with every cell zeroed.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the unsigned value visible through `reg`.
    pub fn get(&self, reg: Register) -> u32 {
        let view = reg.view();
        (self.cells[reg.cell() as usize] >> view.shift()) & view.width().mask()
    }

    /// Returns the value visible through `reg`, sign-extended from its width.
    pub fn get_signed(&self, reg: Register) -> i32 {
        reg.width().sign_extend(self.get(reg))
    }

    /// Stores the low bits of `value` through `reg`, leaving the other bits
    /// of the backing cell untouched.
    pub fn set(&mut self, reg: Register, value: u32) {
        let view = reg.view();
        let mask = view.width().mask() << view.shift();
        let cell = &mut self.cells[reg.cell() as usize];
        *cell = (*cell & !mask) | ((value << view.shift()) & mask);
    }

    pub fn ip(&self) -> u32 {
        self.get(Register::Eip)
    }

    pub fn set_ip(&mut self, ip: u32) {
        self.set(Register::Eip, ip);
    }

    pub fn flags(&self) -> u32 {
        self.get(Register::Flg)
    }
}

impl fmt::Display for Registers {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, reg) in Register::ALL[..CELL_COUNT].iter().enumerate() {
            if i > 0 {
                f.write_str(if i % 5 == 0 { "\n" } else { "  " })?;
            }
            write!(f, "{}={:#010x}", reg.name(), self.get(*reg))?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_zeroed() {
        let regs = Registers::new();
        for reg in Register::ALL {
            assert_eq!(regs.get(*reg), 0);
        }
    }

    #[test]
    fn narrow_writes_preserve_the_cell() {
        let mut regs = Registers::new();
        regs.set(Register::Eax, 0x1122_3344);
        assert_eq!(regs.get(Register::Al), 0x44);
        assert_eq!(regs.get(Register::Ah), 0x33);
        assert_eq!(regs.get(Register::Ax), 0x3344);

        regs.set(Register::Ah, 0xAB);
        assert_eq!(regs.get(Register::Eax), 0x1122_AB44);
        regs.set(Register::Al, 0x1FF);
        assert_eq!(regs.get(Register::Eax), 0x1122_ABFF);
        regs.set(Register::Ax, 0x0001_0002);
        assert_eq!(regs.get(Register::Eax), 0x1122_0002);
    }

    #[test]
    fn families_are_independent() {
        let mut regs = Registers::new();
        regs.set(Register::Dh, 7);
        assert_eq!(regs.get(Register::Edx), 0x0700);
        assert_eq!(regs.get(Register::Ecx), 0);
        assert_eq!(regs.get(Register::Dl), 0);
    }

    #[test]
    fn signed_reads_use_register_width() {
        let mut regs = Registers::new();
        regs.set(Register::Ebx, 0xFF);
        assert_eq!(regs.get_signed(Register::Bl), -1);
        assert_eq!(regs.get_signed(Register::Bx), 255);
        assert_eq!(regs.get_signed(Register::Ebx), 255);
    }

    #[test]
    fn display_lists_every_cell() {
        let mut regs = Registers::new();
        regs.set_ip(16);
        let text = regs.to_string();
        assert!(text.contains("EIP=0x00000010"));
        assert!(text.contains("FLG=0x00000000"));
        assert!(!text.contains("AL="));
    }
}
