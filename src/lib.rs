//! Stack-based bytecode virtual machine with lexical closures.
//!
//! A compiled unit ([`CodePack`]) pairs an instruction sequence with its
//! constant pool, slot layout and upvalue-capture specs. [`StackVM`] executes
//! units in a stack of call frames, constructing [`objects::closure::Closure`]
//! values whose captured variables stay live past their declaring frame
//! through the open/close upvalue protocol.

pub mod code_pack;
pub mod constants;
pub mod debug;
pub mod environment;
pub mod error;
pub mod heap;
pub mod objects;
pub mod operators;
pub mod value;
pub mod vm;

pub use code_pack::{CaptureSpec, CodePack, Inst, Op};
pub use error::{Result, RuntimeError};
pub use heap::{Handle, Heap, HeapObject};
pub use value::{format_value, HeapKind, HeapRef, Value};
pub use vm::StackVM;
