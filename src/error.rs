use std::fmt;

use crate::heap::Handle;

/// Runtime error raised during execution. All variants unwind to the host;
/// the engine never catches its own errors.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeError {
    /// Call-frame depth exceeded `MAX_FRAME_DEPTH`. Fatal, not recoverable.
    StackOverflow { depth: usize, limit: usize },
    /// A push would exceed the frame's operand-stack capacity.
    OperandOverflow { limit: usize },
    /// Pop or peek on an empty (or too-shallow) operand stack.
    StackUnderflow,
    /// Operator applied to operand kinds it is not defined for.
    TypeMismatch {
        operator: String,
        lhs: &'static str,
        rhs: &'static str,
    },
    DivisionByZero,
    /// Container index past the end of an array.
    IndexOutOfRange { index: usize, len: usize },
    /// Instruction referenced a variable/upvalue/constant slot that does not exist.
    SlotOutOfRange {
        kind: &'static str,
        index: usize,
        len: usize,
    },
    /// A heap handle that no longer names a live object.
    DanglingHandle(Handle),
    /// CALL applied to a value that is not a closure.
    NotCallable(&'static str),
    /// RETURN executed with no caller frame to restore.
    ReturnWithoutCaller,
    /// Relative jump landed outside the instruction sequence.
    JumpOutOfRange { target: i64, len: usize },
    /// Instruction pointer ran past the end of the instruction sequence.
    EndOfCode { ip: usize },
    /// Compiler-contract violation or host I/O failure.
    Internal(String),
}

impl fmt::Display for RuntimeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RuntimeError::StackOverflow { depth, limit } => {
                write!(f, "Stack overflow: frame depth {} exceeds limit {}", depth, limit)
            }
            RuntimeError::OperandOverflow { limit } => {
                write!(f, "Operand stack overflow: capacity {}", limit)
            }
            RuntimeError::StackUnderflow => write!(f, "Operand stack underflow"),
            RuntimeError::TypeMismatch { operator, lhs, rhs } => {
                write!(f, "Type mismatch: {} not defined for {} and {}", operator, lhs, rhs)
            }
            RuntimeError::DivisionByZero => write!(f, "Division by zero"),
            RuntimeError::IndexOutOfRange { index, len } => {
                write!(f, "Index {} out of range for array of length {}", index, len)
            }
            RuntimeError::SlotOutOfRange { kind, index, len } => {
                write!(f, "{} slot {} out of range ({} slots)", kind, index, len)
            }
            RuntimeError::DanglingHandle(handle) => {
                write!(f, "Dangling heap handle: {}", handle)
            }
            RuntimeError::NotCallable(kind) => {
                write!(f, "Value of kind {} is not callable", kind)
            }
            RuntimeError::ReturnWithoutCaller => {
                write!(f, "RETURN executed with no caller frame")
            }
            RuntimeError::JumpOutOfRange { target, len } => {
                write!(f, "Jump target {} outside code of length {}", target, len)
            }
            RuntimeError::EndOfCode { ip } => {
                write!(f, "Instruction pointer {} past end of code", ip)
            }
            RuntimeError::Internal(msg) => write!(f, "Internal error: {}", msg),
        }
    }
}

impl std::error::Error for RuntimeError {}

/// Result type for VM operations.
pub type Result<T> = std::result::Result<T, RuntimeError>;
