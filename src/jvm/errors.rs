use super::code::InstrId;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, Error)]
pub enum Error {
    /// The method body is malformed (the caller may move on to other methods)
    #[error("malformed method body: {0}")]
    Format(#[from] FormatError),

    /// The graph disagrees with an invariant the analyses rely on
    ///
    /// These indicate a bug (or a graph edited into an invalid state), so they are never
    /// repaired automatically.
    #[error("internal consistency violation: {0}")]
    Consistency(#[from] ConsistencyError),

    #[error("constant pool is full (next offset would be {offset})")]
    ConstantPoolOverflow { offset: usize },

    /// Re-encoded code is longer than the 65535 bytes a method body may have
    #[error("method code is too long ({0} bytes)")]
    MethodCodeOverflow(usize),

    /// Slot allocation needs more than 65535 local slots
    #[error("method needs too many local slots ({0})")]
    MethodLocalsOverflow(usize),

    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),
}

impl Error {
    /// Can a driver keep processing other methods after this error?
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Consistency(_))
    }
}

/// Decoding errors, each pinned to the bytecode offset (or table row) where it was detected
#[derive(Debug, Error)]
pub enum FormatError {
    #[error("code ends in the middle of an instruction or table")]
    Truncated,

    #[error("code length {0} is not between 1 and 65535")]
    InvalidCodeLength(u32),

    #[error("invalid opcode {opcode:#04x} at {offset}")]
    InvalidOpcode { offset: u32, opcode: u8 },

    #[error("opcode {opcode:#04x} at {offset} cannot follow a `wide` prefix")]
    InvalidWideOpcode { offset: u32, opcode: u8 },

    #[error("local slot {slot} used at {offset} does not fit in {max_locals} locals")]
    InvalidLocalSlot {
        offset: u32,
        slot: u16,
        max_locals: u16,
    },

    #[error("constant pool index {index} is not a valid entry")]
    MissingConstant { index: u16 },

    #[error("constant pool index {index} should be {expected} but is {found}")]
    ConstantTypeMismatch {
        index: u16,
        expected: &'static str,
        found: &'static str,
    },

    #[error("invalid modified UTF-8 in constant pool entry {index}")]
    InvalidUtf8 { index: u16 },

    #[error("constant pool entry has unknown tag {tag}")]
    InvalidConstantTag { tag: u8 },

    #[error("jump at {offset} targets {target}, which is not the start of an instruction")]
    InvalidJumpTarget { offset: u32, target: i64 },

    #[error("switch at {offset} is inconsistent: {reason}")]
    InconsistentSwitch { offset: u32, reason: &'static str },

    #[error("invalid member reference at {offset}: {reason}")]
    InvalidMemberReference { offset: u32, reason: &'static str },

    #[error("invalid array type at {offset}: {descriptor}")]
    InvalidArrayType { offset: u32, descriptor: String },

    #[error("exception handler #{index} has invalid bounds")]
    InvalidHandler { index: usize },

    /// The `jsr` target does not start by storing the return address into a local
    #[error("subroutine at {offset} does not start with `astore`")]
    NonStandardSubroutine { offset: u32 },

    #[error("invalid descriptor {descriptor:?}: {reason}")]
    InvalidDescriptor { descriptor: String, reason: String },

    #[error("malformed {name} attribute")]
    MalformedAttribute { name: &'static str },
}

#[derive(Debug, Error)]
pub enum ConsistencyError {
    #[error("{0} refers to an instruction that was removed")]
    RemovedInstruction(InstrId),

    #[error("jump from {from} to removed {to} has nowhere to go")]
    DanglingJump { from: InstrId, to: InstrId },

    #[error("{instr} (opcode {opcode:#04x}) has {found} successors, expected {expected}")]
    SuccessorCountMismatch {
        instr: InstrId,
        opcode: u8,
        expected: usize,
        found: usize,
    },

    #[error("{0} falls through past the end of the code")]
    FallsOffEnd(InstrId),

    #[error("exception handler #{index} covers no instructions or is out of order")]
    EmptyHandlerRange { index: usize },

    #[error("`ret` at {0} does not read a subroutine return address")]
    RetWithoutSubroutine(InstrId),

    #[error("subroutine at {entry} returns through both {first} and {second}")]
    MultipleRets {
        entry: InstrId,
        first: InstrId,
        second: InstrId,
    },

    #[error("stack height at {instr} is {found} along one path and {expected} along another")]
    StackHeightMismatch {
        instr: InstrId,
        expected: usize,
        found: usize,
    },

    #[error("stack underflow at {0}")]
    StackUnderflow(InstrId),

    #[error("{instr} reads local {slot}, which holds no usable value")]
    UnusableLocal { instr: InstrId, slot: u16 },

    #[error("{instr} (opcode {opcode:#04x}) does not consume plain operands")]
    UnexpectedOpcode { instr: InstrId, opcode: u8 },

    #[error("{instr} was laid out to end at {expected} but was written up to {found}")]
    LayoutMismatch {
        instr: InstrId,
        expected: u32,
        found: u32,
    },
}

/// Map a failed read of class file data, treating a premature end as truncation
pub(crate) fn read_error(err: std::io::Error) -> Error {
    if err.kind() == std::io::ErrorKind::UnexpectedEof {
        Error::Format(FormatError::Truncated)
    } else {
        Error::IoError(err)
    }
}
