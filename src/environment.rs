use std::rc::Rc;

use crate::code_pack::CodePack;
use crate::constants::MAX_STACK_SIZE;
use crate::error::{Result, RuntimeError};
use crate::heap::Handle;
use crate::value::Value;

/// One call frame: the operand stack, variable slots and upvalue slots of a
/// single activation. Variable slots start out as `Int(0)`. `opened` records
/// the upvalues this frame's CLOSURE instructions opened over its own
/// variables, so teardown knows exactly which ones to close.
#[derive(Debug)]
pub struct Environment {
    code: Rc<CodePack>,
    stack: Vec<Value>,
    variables: Vec<Value>,
    upvalues: Vec<Handle>,
    opened: Vec<Handle>,
    resume_ip: usize,
    depth: usize,
}

impl Environment {
    pub fn new(code: Rc<CodePack>, depth: usize) -> Environment {
        let var_count = code.var_count;
        let upvalue_count = code.upvalue_count;
        Environment {
            code,
            stack: Vec::new(),
            variables: vec![Value::Int(0); var_count],
            upvalues: Vec::with_capacity(upvalue_count),
            opened: Vec::new(),
            resume_ip: 0,
            depth,
        }
    }

    pub fn code(&self) -> &Rc<CodePack> {
        &self.code
    }

    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn resume_ip(&self) -> usize {
        self.resume_ip
    }

    pub fn set_resume_ip(&mut self, ip: usize) {
        self.resume_ip = ip;
    }

    pub fn constant(&self, index: usize) -> Result<Value> {
        self.code.constant(index)
    }

    pub fn stack(&self) -> &[Value] {
        &self.stack
    }

    pub fn push(&mut self, value: Value) -> Result<()> {
        if self.stack.len() >= MAX_STACK_SIZE {
            return Err(RuntimeError::OperandOverflow {
                limit: MAX_STACK_SIZE,
            });
        }
        self.stack.push(value);
        Ok(())
    }

    pub fn pop(&mut self) -> Result<Value> {
        self.stack.pop().ok_or(RuntimeError::StackUnderflow)
    }

    /// Value `distance` slots below the top, 0 being the top itself.
    pub fn top(&self, distance: usize) -> Result<Value> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::StackUnderflow);
        }
        Ok(self.stack[len - 1 - distance])
    }

    pub fn set_top(&mut self, distance: usize, value: Value) -> Result<()> {
        let len = self.stack.len();
        if distance >= len {
            return Err(RuntimeError::StackUnderflow);
        }
        self.stack[len - 1 - distance] = value;
        Ok(())
    }

    pub fn var(&self, index: usize) -> Result<Value> {
        self.variables
            .get(index)
            .copied()
            .ok_or(RuntimeError::SlotOutOfRange {
                kind: "variable",
                index,
                len: self.variables.len(),
            })
    }

    pub fn set_var(&mut self, index: usize, value: Value) -> Result<()> {
        let len = self.variables.len();
        match self.variables.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::SlotOutOfRange {
                kind: "variable",
                index,
                len,
            }),
        }
    }

    pub fn upvalue_handle(&self, index: usize) -> Result<Handle> {
        self.upvalues
            .get(index)
            .copied()
            .ok_or(RuntimeError::SlotOutOfRange {
                kind: "upvalue",
                index,
                len: self.upvalues.len(),
            })
    }

    /// Fill the next upvalue slot during CALL frame setup.
    pub fn push_upvalue(&mut self, handle: Handle) {
        self.upvalues.push(handle);
    }

    /// Remember an upvalue opened over this frame's own variables.
    pub fn track_opened(&mut self, handle: Handle) {
        self.opened.push(handle);
    }

    pub fn opened(&self) -> &[Handle] {
        &self.opened
    }

    /// Drain the opened list at teardown, handing ownership of the close
    /// step to the caller.
    pub fn take_opened(&mut self) -> Vec<Handle> {
        std::mem::take(&mut self.opened)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(var_count: usize) -> Environment {
        let mut code = CodePack::new("test");
        code.var_count = var_count;
        Environment::new(Rc::new(code), 0)
    }

    #[test]
    fn operand_stack_is_bounded() {
        let mut env = frame(0);
        for i in 0..MAX_STACK_SIZE {
            env.push(Value::Int(i as i64)).unwrap();
        }
        assert_eq!(
            env.push(Value::Int(0)),
            Err(RuntimeError::OperandOverflow {
                limit: MAX_STACK_SIZE
            })
        );
        assert_eq!(env.top(0).unwrap(), Value::Int(MAX_STACK_SIZE as i64 - 1));
    }

    #[test]
    fn pop_on_empty_is_underflow() {
        let mut env = frame(0);
        assert_eq!(env.pop(), Err(RuntimeError::StackUnderflow));
        assert_eq!(env.top(0), Err(RuntimeError::StackUnderflow));
    }

    #[test]
    fn variables_start_as_zero_and_are_bounds_checked() {
        let mut env = frame(2);
        assert_eq!(env.var(0).unwrap(), Value::Int(0));
        assert_eq!(env.var(1).unwrap(), Value::Int(0));
        env.set_var(1, Value::Bool(true)).unwrap();
        assert_eq!(env.var(1).unwrap(), Value::Bool(true));
        assert_eq!(
            env.var(2),
            Err(RuntimeError::SlotOutOfRange {
                kind: "variable",
                index: 2,
                len: 2,
            })
        );
    }

    #[test]
    fn set_top_rewrites_in_place() {
        let mut env = frame(0);
        env.push(Value::Int(1)).unwrap();
        env.push(Value::Int(2)).unwrap();
        env.set_top(1, Value::Int(9)).unwrap();
        assert_eq!(env.top(1).unwrap(), Value::Int(9));
        assert_eq!(env.top(0).unwrap(), Value::Int(2));
    }
}
