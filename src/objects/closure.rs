use std::rc::Rc;

use crate::code_pack::CodePack;
use crate::heap::Handle;

/// Callable value: a compiled unit plus its captured upvalues, populated
/// once by the CLOSURE instruction. `upvalues.len()` equals the unit's
/// upvalue slot count once construction finishes.
#[derive(Debug, Clone)]
pub struct Closure {
    pub code: Rc<CodePack>,
    pub upvalues: Vec<Handle>,
}

impl Closure {
    pub fn new(code: Rc<CodePack>) -> Closure {
        let capacity = code.upvalue_count;
        Closure {
            code,
            upvalues: Vec::with_capacity(capacity),
        }
    }
}
