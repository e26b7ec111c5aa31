use strum_macros::{Display, EnumString};

use crate::error::{Result, RuntimeError};
use crate::value::Value;

/// Opcodes of the compiled-unit instruction format. The mnemonics are the
/// wire names other tooling uses.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, EnumString, Display)]
pub enum Op {
    #[strum(serialize = "LOAD_C")]
    LoadConst,
    #[strum(serialize = "LOAD_V")]
    LoadVar,
    #[strum(serialize = "LOAD_UPVAL")]
    LoadUpval,
    #[strum(serialize = "STORE_V")]
    StoreVar,
    #[strum(serialize = "STORE_UPVAL")]
    StoreUpval,
    #[strum(serialize = "PUSH_INT")]
    PushInt,
    #[strum(serialize = "PUSH_BOOL")]
    PushBool,
    #[strum(serialize = "POP")]
    Pop,
    #[strum(serialize = "JMP")]
    Jmp,
    #[strum(serialize = "IFNO")]
    IfNo,
    #[strum(serialize = "NOT")]
    Not,
    #[strum(serialize = "ADD")]
    Add,
    #[strum(serialize = "SUB")]
    Sub,
    #[strum(serialize = "MUL")]
    Mul,
    #[strum(serialize = "DIV")]
    Div,
    #[strum(serialize = "MOD")]
    Mod,
    #[strum(serialize = "GT")]
    Gt,
    #[strum(serialize = "LT")]
    Lt,
    #[strum(serialize = "GTEQ")]
    GtEq,
    #[strum(serialize = "LTEQ")]
    LtEq,
    #[strum(serialize = "EQ")]
    Eq,
    #[strum(serialize = "CLOSURE")]
    Closure,
    #[strum(serialize = "CALL")]
    Call,
    #[strum(serialize = "RETURN")]
    Return,
    #[strum(serialize = "OUT")]
    Out,
    #[strum(serialize = "STOP")]
    Stop,
}

/// One decoded instruction: opcode plus integer parameter. Every instruction
/// carries a parameter slot even when the opcode ignores it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Inst {
    pub op: Op,
    pub param: i32,
}

impl Inst {
    pub fn new(op: Op, param: i32) -> Inst {
        Inst { op, param }
    }
}

/// Decoded upvalue-capture spec entry. The wire encoding is a single integer:
/// `i >= 0` captures local slot `i` of the enclosing frame, `-1 - k` inherits
/// upvalue slot `k` of the enclosing frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CaptureSpec {
    Local(usize),
    Inherit(usize),
}

impl CaptureSpec {
    pub fn from_raw(raw: i32) -> CaptureSpec {
        if raw >= 0 {
            CaptureSpec::Local(raw as usize)
        } else {
            CaptureSpec::Inherit((-1 - raw) as usize)
        }
    }

    pub fn to_raw(self) -> i32 {
        match self {
            CaptureSpec::Local(i) => i as i32,
            CaptureSpec::Inherit(k) => -1 - k as i32,
        }
    }
}

/// Immutable compiled unit: instruction sequence, constant pool, slot layout,
/// and upvalue-capture specs. Produced once by the compiler collaborator and
/// shared read-only by any number of closures and frames.
#[derive(Debug, Clone, Default)]
pub struct CodePack {
    /// Display name; empty for the top-level script.
    pub name: String,
    pub instructions: Vec<Inst>,
    pub constants: Vec<Value>,
    /// Number of call arguments moved into the leading variable slots.
    /// Invariant: `param_count <= var_count`.
    pub param_count: usize,
    /// Variable-slot count of one activation.
    pub var_count: usize,
    /// Upvalue-slot count of one activation.
    pub upvalue_count: usize,
    /// Raw capture spec per upvalue, in slot order. See [`CaptureSpec`].
    pub upvalue_specs: Vec<i32>,
}

impl CodePack {
    pub fn new(name: &str) -> CodePack {
        CodePack {
            name: name.to_string(),
            ..CodePack::default()
        }
    }

    pub fn emit(&mut self, op: Op, param: i32) {
        self.instructions.push(Inst::new(op, param));
    }

    /// Add a constant to the pool, returning its index for LOAD_C.
    pub fn add_constant(&mut self, value: Value) -> usize {
        self.constants.push(value);
        self.constants.len() - 1
    }

    pub fn constant(&self, index: usize) -> Result<Value> {
        self.constants
            .get(index)
            .copied()
            .ok_or(RuntimeError::SlotOutOfRange {
                kind: "constant",
                index,
                len: self.constants.len(),
            })
    }

    pub fn len(&self) -> usize {
        self.instructions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instructions.is_empty()
    }
}
