use thiserror::Error;

/// Diagnosis attached to an [`AsmError`].
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AsmErrorKind {
    /// Unrecognized instruction mnemonic.
    #[error("unknown instruction `{0}`")]
    InvalidInstructionName(String),
    /// Register operand names no register.
    #[error("unknown register `{0}`")]
    InvalidRegister(String),
    /// Two-register instruction mixing width families.
    #[error("{instruction}: `{first}` is a {first_width} register but `{second}` is a {second_width}")]
    RegisterSizeMismatch {
        instruction: &'static str,
        first: &'static str,
        first_width: &'static str,
        second: &'static str,
        second_width: &'static str,
    },
    /// Fewer operands than the instruction needs on its line.
    #[error("{instruction} expects {expected} operand(s)")]
    MissingOperand {
        instruction: &'static str,
        expected: usize,
    },
    /// Literal exceeds the slot it is written to.
    #[error("value `{token}` does not fit in a {width}")]
    ValueOutOfRange { token: String, width: &'static str },
    /// Token in a numeric position is neither a number nor a name.
    #[error("malformed number `{0}`")]
    InvalidNumber(String),
    #[error("unterminated data block")]
    UnterminatedDataBlock,
    #[error("unterminated string literal")]
    UnterminatedString,
    #[error("unterminated character literal")]
    UnterminatedChar,
    #[error("empty character literal")]
    EmptyChar,
    #[error("unknown escape sequence `\\{0}`")]
    UnknownEscape(char),
    #[error("malformed array: {0}")]
    MalformedArray(String),
    #[error("invalid label name `{0}`")]
    InvalidLabelName(String),
    /// Label defined more than once.
    #[error("duplicate label `{0}`")]
    DuplicateLabel(String),
    /// Reference to a label that was never defined.
    #[error("undefined label `{0}`")]
    UnresolvedLabel(String),
    /// Label offset does not fit the narrow slot referencing it.
    #[error("label `{label}` at offset {offset} does not fit in a {width}")]
    LabelOutOfRange {
        label: String,
        offset: u32,
        width: &'static str,
    },
    #[error("malformed directive: {0}")]
    MalformedDirective(String),
    /// Source file could not be read.
    #[error("cannot read `{path}`: {reason}")]
    Include { path: String, reason: String },
    #[error("`{0}` includes itself")]
    IncludeCycle(String),
    /// A growable assembler table could not be extended.
    #[error("out of memory growing the {0}")]
    OutOfMemory(&'static str),
    #[error("image exceeds the 32-bit address space")]
    ImageTooLarge,
}

/// Assembly failure with source position.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{file}:{line}:{column}: {kind}")]
pub struct AsmError {
    pub file: String,
    pub line: usize,
    pub column: usize,
    pub kind: AsmErrorKind,
}

impl AsmError {
    pub fn new(file: impl Into<String>, line: usize, column: usize, kind: AsmErrorKind) -> Self {
        Self {
            file: file.into(),
            line,
            column,
            kind,
        }
    }
}

/// Runtime condition that stops the interpreter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum Fault {
    /// Unknown opcode encountered in bytecode.
    #[error("invalid op-code {opcode}")]
    InvalidInstruction { opcode: u8 },
    /// Register operand byte names no register.
    #[error("invalid register id {register}")]
    InvalidRegister { register: u8 },
    #[error("register {register} cannot be written by data instructions")]
    ReadOnlyRegister { register: &'static str },
    /// Two-register instruction mixing width families.
    #[error("invalid {instruction} operands: {first} and {second} are different sizes")]
    RegisterSizeMismatch {
        instruction: &'static str,
        first: &'static str,
        second: &'static str,
    },
    #[error("bad interrupt {code}")]
    InvalidInterrupt { code: u8 },
    #[error("service {service} is not provided by this host")]
    ServiceUnavailable { service: &'static str },
    #[error("service {service} failed: {reason}")]
    ServiceFailed {
        service: &'static str,
        reason: String,
    },
    #[error("{size}-byte access at {address} is outside the {capacity}-byte arena")]
    MemoryOutOfBounds {
        address: u32,
        size: usize,
        capacity: usize,
    },
    #[error("stack overflow: pushing {size} byte(s) at {pointer} exceeds the {capacity}-byte arena")]
    StackOverflow {
        pointer: u32,
        size: usize,
        capacity: usize,
    },
    #[error("stack underflow: popping {size} byte(s) at {pointer} crosses the stack base {base}")]
    StackUnderflow { pointer: u32, size: usize, base: u32 },
    #[error("step limit of {limit} instructions reached")]
    StepLimitExceeded { limit: u64 },
}

/// Fault together with the instruction that raised it.
///
/// `ip` is the address of the faulting instruction's opcode byte; `opcode` is
/// `None` when the opcode itself could not be fetched.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("vm crash at ip {ip}: {fault}")]
pub struct VMError {
    pub ip: u32,
    pub opcode: Option<u8>,
    pub fault: Fault,
}

/// Binary image rejected by the loader.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ImageError {
    #[error("image is {len} byte(s), shorter than its 4-byte header")]
    Truncated { len: usize },
    #[error("code start {code_start} lies past the {body_len}-byte body")]
    CodeStartOutOfRange { code_start: u32, body_len: usize },
    #[error("{body_len}-byte image does not fit in a {capacity}-byte arena")]
    TooLarge { body_len: usize, capacity: usize },
    #[error("cannot allocate a {0}-byte memory arena")]
    OutOfMemory(usize),
}

/// Instruction stream that cannot be decoded.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum DecodeError {
    #[error("offset {offset}: {fault}")]
    Invalid { offset: usize, fault: Fault },
    #[error("offset {offset}: {instruction} runs past the end of the image")]
    Truncated {
        offset: usize,
        instruction: &'static str,
    },
}
