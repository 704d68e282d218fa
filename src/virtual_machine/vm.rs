use crate::debug;
use crate::utils::log;
use crate::virtual_machine::disassembler::decode;
use crate::virtual_machine::errors::{Fault, ImageError, VMError};
use crate::virtual_machine::host::{Flow, Halt, Host};
use crate::virtual_machine::isa::{
    FLAG_EQ, FLAG_GT, FLAG_LS, Instruction, Register, Service, Width,
};
use crate::virtual_machine::program::Image;
use std::cmp::Ordering as CmpOrdering;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

mod memory;
mod registers;

pub use memory::{DEFAULT_MEMORY_SIZE, Memory};
pub use registers::Registers;

macro_rules! exec_vm {
    // Entry point
    (
        vm = $vm:ident,
        host = $host:ident,
        instr = $instr:ident,
        { $( $variant:ident => $handler:ident $args:tt ),* $(,)? }
    ) => {{
        match $instr {
            $(
                Instruction::$variant => {
                    let instr_name = $instr.mnemonic();
                    exec_vm!(@call $vm, $host, instr_name, $handler, $args)
                }
            ),*
        }
    }};

    // Handler that talks to the host (semicolon separator)
    (@call $vm:ident, $host:ident, $instr_name:expr, $handler:ident,
        (host; $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $vm, $kind)?; )*
        $vm.$handler($instr_name, $host, $( $field ),*)
    }};

    // Handler without host access (no semicolon)
    (@call $vm:ident, $host:ident, $instr_name:expr, $handler:ident,
        ( $( $field:ident : $kind:ident ),* $(,)? )
    ) => {{
        $( let $field = exec_vm!(@read $vm, $kind)?; )*
        $vm.$handler($instr_name, $( $field ),*)
    }};

    // Decode a register id
    (@read $vm:ident, Reg) => {{
        $vm.fetch_register()
    }};

    // Decode a service code (1 byte)
    (@read $vm:ident, Code) => {{
        $vm.fetch(Width::Byte).map(|v| v as u8)
    }};

    // Decode an absolute code offset (little-endian, 4 bytes)
    (@read $vm:ident, Addr) => {{
        $vm.fetch(Width::Int)
    }};
}

/// Registers plus memory: everything a running program can observe.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Machine {
    pub registers: Registers,
    pub memory: Memory,
}

impl Machine {
    /// Creates a machine with zeroed registers and a zeroed arena.
    pub fn new(memory_size: usize) -> Result<Self, ImageError> {
        Ok(Self {
            registers: Registers::new(),
            memory: Memory::new(memory_size)?,
        })
    }

    /// Writes `value` at ESP and advances ESP by `width` bytes.
    pub fn push(&mut self, width: Width, value: u32) -> Result<(), Fault> {
        let sp = self.registers.get(Register::Esp);
        let capacity = self.memory.len();
        self.memory
            .write(sp, width, value)
            .map_err(|_| Fault::StackOverflow {
                pointer: sp,
                size: width.size(),
                capacity,
            })?;
        self.registers
            .set(Register::Esp, sp + width.size() as u32);
        Ok(())
    }

    /// Retreats ESP by `width` bytes and reads the value there.
    ///
    /// ESP never moves below ESB.
    pub fn pop(&mut self, width: Width) -> Result<u32, Fault> {
        let sp = self.registers.get(Register::Esp);
        let base = self.registers.get(Register::Esb);
        let underflow = Fault::StackUnderflow {
            pointer: sp,
            size: width.size(),
            base,
        };
        let top = sp
            .checked_sub(width.size() as u32)
            .filter(|top| *top >= base)
            .ok_or(underflow)?;
        let value = self.memory.read(top, width)?;
        self.registers.set(Register::Esp, top);
        Ok(value)
    }
}

/// Interpreter limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VmConfig {
    /// Arena size in bytes; the image plus the stack must fit.
    pub memory_size: usize,
    /// Fault with [`Fault::StepLimitExceeded`] after this many instructions.
    pub step_limit: Option<u64>,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            memory_size: DEFAULT_MEMORY_SIZE,
            step_limit: None,
        }
    }
}

/// Lifecycle of a [`VM`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum State {
    Running,
    Halted(Halt),
    Faulted(VMError),
}

/// Cloneable flag that asks a running [`VM`] to halt before its next
/// instruction. Safe to trigger from another thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn stop(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Register virtual machine.
///
/// Loads an [`Image`] at address 0 and executes it one instruction at a time
/// until a service halts it or an instruction faults. A halted or faulted VM
/// keeps its registers and memory for inspection.
pub struct VM {
    machine: Machine,
    config: VmConfig,
    state: State,
    /// Instructions completed so far.
    steps: u64,
    stop: StopHandle,
    /// Address of the instruction being executed.
    current_ip: u32,
    current_opcode: Option<u8>,
}

impl VM {
    /// Creates a VM with `image` loaded and EIP at its entry point.
    ///
    /// The stack starts empty right after the image: ESB = ESP = image length.
    pub fn new(image: Image, config: VmConfig) -> Result<Self, ImageError> {
        if config.memory_size > u32::MAX as usize {
            return Err(ImageError::OutOfMemory(config.memory_size));
        }
        if image.code_start as usize > image.len() {
            return Err(ImageError::CodeStartOutOfRange {
                code_start: image.code_start,
                body_len: image.len(),
            });
        }

        let mut machine = Machine::new(config.memory_size)?;
        machine.memory.load(&image.body)?;
        let stack_base = image.len() as u32;
        machine.registers.set_ip(image.code_start);
        machine.registers.set(Register::Esb, stack_base);
        machine.registers.set(Register::Esp, stack_base);

        Ok(Self {
            machine,
            config,
            state: State::Running,
            steps: 0,
            stop: StopHandle::default(),
            current_ip: image.code_start,
            current_opcode: None,
        })
    }

    pub fn machine(&self) -> &Machine {
        &self.machine
    }

    pub fn machine_mut(&mut self) -> &mut Machine {
        &mut self.machine
    }

    pub fn registers(&self) -> &Registers {
        &self.machine.registers
    }

    pub fn memory(&self) -> &Memory {
        &self.machine.memory
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    /// Number of instructions executed so far.
    pub fn steps(&self) -> u64 {
        self.steps
    }

    /// Returns a handle that halts this VM before its next instruction.
    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    /// Executes the bytecode until a halt or a fault.
    pub fn run<H: Host>(&mut self, host: &mut H) -> Result<Halt, VMError> {
        loop {
            if let Flow::Halt(halt) = self.step(host)? {
                return Ok(halt);
            }
        }
    }

    /// Executes exactly one instruction.
    ///
    /// Once halted or faulted, further calls return the same outcome without
    /// executing anything.
    pub fn step<H: Host>(&mut self, host: &mut H) -> Result<Flow, VMError> {
        match &self.state {
            State::Running => {}
            State::Halted(halt) => return Ok(Flow::Halt(*halt)),
            State::Faulted(err) => return Err(err.clone()),
        }
        if self.stop.is_stopped() {
            self.state = State::Halted(Halt::Stopped);
            return Ok(Flow::Halt(Halt::Stopped));
        }

        self.current_ip = self.machine.registers.ip();
        self.current_opcode = None;
        if let Some(limit) = self.config.step_limit
            && self.steps >= limit
        {
            return Err(self.crash(Fault::StepLimitExceeded { limit }));
        }

        match self.cycle(host) {
            Ok(flow) => {
                self.steps += 1;
                if let Flow::Halt(halt) = flow {
                    self.state = State::Halted(halt);
                }
                Ok(flow)
            }
            Err(fault) => Err(self.crash(fault)),
        }
    }

    fn cycle<H: Host>(&mut self, host: &mut H) -> Result<Flow, Fault> {
        if log::verbose() {
            self.trace();
        }
        let opcode = self.fetch(Width::Byte)? as u8;
        self.current_opcode = Some(opcode);
        let instr = Instruction::try_from(opcode)?;
        self.exec(instr, host)
    }

    fn trace(&self) {
        let ip = self.current_ip as usize;
        match decode(self.machine.memory.as_bytes(), ip) {
            Ok(decoded) => debug!("{ip:>6}: {decoded}"),
            Err(err) => debug!("{ip:>6}: <{err}>"),
        }
    }

    fn crash(&mut self, fault: Fault) -> VMError {
        let err = VMError {
            ip: self.current_ip,
            opcode: self.current_opcode,
            fault,
        };
        self.state = State::Faulted(err.clone());
        err
    }

    /// Reads a `width`-sized operand at EIP and advances EIP past it.
    fn fetch(&mut self, width: Width) -> Result<u32, Fault> {
        let ip = self.machine.registers.ip();
        let value = self.machine.memory.read(ip, width)?;
        self.machine
            .registers
            .set_ip(ip.wrapping_add(width.size() as u32));
        Ok(value)
    }

    fn fetch_register(&mut self) -> Result<Register, Fault> {
        Register::try_from(self.fetch(Width::Byte)? as u8)
    }

    /// Executes a single instruction.
    fn exec<H: Host>(&mut self, instruction: Instruction, host: &mut H) -> Result<Flow, Fault> {
        exec_vm! {
            vm = self,
            host = host,
            instr = instruction,
            {
                Nop => op_nop(),
                Int => op_int(host; code: Code),
                // Data movement and arithmetic
                Mov => op_mov(rd: Reg),
                Cpy => op_cpy(rd: Reg, rs: Reg),
                Add => op_add(rd: Reg, rs: Reg),
                Inc => op_inc(rd: Reg),
                Dec => op_dec(rd: Reg),
                Sub => op_sub(rd: Reg, rs: Reg),
                Cmp => op_cmp(ra: Reg, rb: Reg),
                // Control flow
                Jmp => op_jmp(target: Addr),
                Jeq => op_jeq(target: Addr),
                Jle => op_jle(target: Addr),
                Jge => op_jge(target: Addr),
                // Stack and memory
                Push => op_push(rs: Reg),
                Pop => op_pop(rd: Reg),
                Fetch => op_fetch(rd: Reg),
                Write => op_write(rs: Reg),
                Call => op_call(target: Addr),
                Ret => op_ret(),
            }
        }
    }

    fn writable(reg: Register) -> Result<Register, Fault> {
        if reg.is_writable() {
            Ok(reg)
        } else {
            Err(Fault::ReadOnlyRegister {
                register: reg.name(),
            })
        }
    }

    fn same_family(instr: &'static str, a: Register, b: Register) -> Result<(), Fault> {
        if a.width() == b.width() {
            Ok(())
        } else {
            Err(Fault::RegisterSizeMismatch {
                instruction: instr,
                first: a.name(),
                second: b.name(),
            })
        }
    }

    fn jump_if(&mut self, flag: u32, target: u32) -> Result<Flow, Fault> {
        if self.machine.registers.flags() & flag != 0 {
            self.machine.registers.set_ip(target);
        }
        Ok(Flow::Continue)
    }

    fn op_nop(&mut self, _instr: &'static str) -> Result<Flow, Fault> {
        Ok(Flow::Continue)
    }

    fn op_int<H: Host>(&mut self, _instr: &'static str, host: &mut H, code: u8) -> Result<Flow, Fault> {
        let regs = &self.machine.registers;
        match Service::try_from(code)? {
            Service::Exit => Ok(Flow::Halt(Halt::Exit)),
            Service::PrintInt => {
                host.print_int(regs.get_signed(Register::Eax))?;
                Ok(Flow::Continue)
            }
            Service::PrintChar => {
                host.print_char(regs.get(Register::Al) as u8)?;
                Ok(Flow::Continue)
            }
            service => host.service(service, &mut self.machine),
        }
    }

    fn op_mov(&mut self, _instr: &'static str, rd: Register) -> Result<Flow, Fault> {
        let imm = self.fetch(rd.width())?;
        self.machine.registers.set(Self::writable(rd)?, imm);
        Ok(Flow::Continue)
    }

    fn op_cpy(&mut self, instr: &'static str, rd: Register, rs: Register) -> Result<Flow, Fault> {
        Self::same_family(instr, rd, rs)?;
        let regs = &mut self.machine.registers;
        regs.set(Self::writable(rd)?, regs.get(rs));
        Ok(Flow::Continue)
    }

    fn op_add(&mut self, instr: &'static str, rd: Register, rs: Register) -> Result<Flow, Fault> {
        Self::same_family(instr, rd, rs)?;
        let regs = &mut self.machine.registers;
        let sum = regs.get(rd).wrapping_add(regs.get(rs));
        regs.set(Self::writable(rd)?, sum);
        Ok(Flow::Continue)
    }

    fn op_sub(&mut self, instr: &'static str, rd: Register, rs: Register) -> Result<Flow, Fault> {
        Self::same_family(instr, rd, rs)?;
        let regs = &mut self.machine.registers;
        let diff = regs.get(rd).wrapping_sub(regs.get(rs));
        regs.set(Self::writable(rd)?, diff);
        Ok(Flow::Continue)
    }

    fn op_inc(&mut self, _instr: &'static str, rd: Register) -> Result<Flow, Fault> {
        let imm = self.fetch(rd.width())?;
        let regs = &mut self.machine.registers;
        let sum = regs.get(rd).wrapping_add(imm);
        regs.set(Self::writable(rd)?, sum);
        Ok(Flow::Continue)
    }

    fn op_dec(&mut self, _instr: &'static str, rd: Register) -> Result<Flow, Fault> {
        let imm = self.fetch(rd.width())?;
        let regs = &mut self.machine.registers;
        let diff = regs.get(rd).wrapping_sub(imm);
        regs.set(Self::writable(rd)?, diff);
        Ok(Flow::Continue)
    }

    fn op_cmp(&mut self, instr: &'static str, ra: Register, rb: Register) -> Result<Flow, Fault> {
        Self::same_family(instr, ra, rb)?;
        let regs = &mut self.machine.registers;
        let flags = match regs.get_signed(ra).cmp(&regs.get_signed(rb)) {
            CmpOrdering::Equal => FLAG_EQ,
            CmpOrdering::Greater => FLAG_GT,
            CmpOrdering::Less => FLAG_LS,
        };
        regs.set(Register::Flg, flags);
        Ok(Flow::Continue)
    }

    fn op_jmp(&mut self, _instr: &'static str, target: u32) -> Result<Flow, Fault> {
        self.machine.registers.set_ip(target);
        Ok(Flow::Continue)
    }

    fn op_jeq(&mut self, _instr: &'static str, target: u32) -> Result<Flow, Fault> {
        self.jump_if(FLAG_EQ, target)
    }

    fn op_jle(&mut self, _instr: &'static str, target: u32) -> Result<Flow, Fault> {
        self.jump_if(FLAG_LS, target)
    }

    fn op_jge(&mut self, _instr: &'static str, target: u32) -> Result<Flow, Fault> {
        self.jump_if(FLAG_GT, target)
    }

    fn op_push(&mut self, _instr: &'static str, rs: Register) -> Result<Flow, Fault> {
        let value = self.machine.registers.get(rs);
        self.machine.push(rs.width(), value)?;
        Ok(Flow::Continue)
    }

    fn op_pop(&mut self, _instr: &'static str, rd: Register) -> Result<Flow, Fault> {
        let rd = Self::writable(rd)?;
        let value = self.machine.pop(rd.width())?;
        self.machine.registers.set(rd, value);
        Ok(Flow::Continue)
    }

    fn op_fetch(&mut self, _instr: &'static str, rd: Register) -> Result<Flow, Fault> {
        let rd = Self::writable(rd)?;
        let address = self.machine.registers.get(Register::Esi);
        let value = self.machine.memory.read(address, rd.width())?;
        self.machine.registers.set(rd, value);
        Ok(Flow::Continue)
    }

    fn op_write(&mut self, _instr: &'static str, rs: Register) -> Result<Flow, Fault> {
        let address = self.machine.registers.get(Register::Edi);
        let value = self.machine.registers.get(rs);
        self.machine.memory.write(address, rs.width(), value)?;
        Ok(Flow::Continue)
    }

    fn op_call(&mut self, _instr: &'static str, target: u32) -> Result<Flow, Fault> {
        let return_addr = self.machine.registers.ip();
        self.machine.push(Width::Int, return_addr)?;
        self.machine.registers.set_ip(target);
        Ok(Flow::Continue)
    }

    fn op_ret(&mut self, _instr: &'static str) -> Result<Flow, Fault> {
        let return_addr = self.machine.pop(Width::Int)?;
        self.machine.registers.set_ip(return_addr);
        Ok(Flow::Continue)
    }
}
