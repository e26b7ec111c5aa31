use std::io::{self, Write};
use std::rc::Rc;

use crate::code_pack::{CaptureSpec, CodePack, Inst, Op};
use crate::constants::MAX_FRAME_DEPTH;
use crate::environment::Environment;
use crate::error::{Result, RuntimeError};
use crate::heap::{Handle, Heap, HeapObject};
use crate::objects::closure::Closure;
use crate::objects::upvalue::Upvalue;
use crate::operators::{apply_binary, logical_not, BinaryOp};
use crate::value::{format_value, HeapKind, Value};

/// The dispatch engine. Owns the frame stack and the heap; one instruction
/// pointer, always into the current (topmost) frame's compiled unit.
///
/// After an error unwinds out of [`StackVM::run`], no frame is left behind
/// and every upvalue those frames opened has been closed, so the heap stays
/// consistent and the engine can run another unit.
pub struct StackVM {
    frames: Vec<Environment>,
    heap: Heap,
    ip: usize,
    out: Box<dyn Write>,
}

impl Default for StackVM {
    fn default() -> StackVM {
        StackVM::new()
    }
}

impl StackVM {
    pub fn new() -> StackVM {
        StackVM::with_output(Box::new(io::stdout()))
    }

    /// Engine writing OUT lines to the given sink instead of stdout.
    pub fn with_output(out: Box<dyn Write>) -> StackVM {
        StackVM {
            frames: Vec::new(),
            heap: Heap::new(),
            ip: 0,
            out,
        }
    }

    pub fn heap(&self) -> &Heap {
        &self.heap
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    /// Operand stack of the current frame; empty when no frame is live.
    pub fn operand_stack(&self) -> &[Value] {
        match self.frames.last() {
            Some(frame) => frame.stack(),
            None => &[],
        }
    }

    pub fn frame_depth(&self) -> usize {
        self.frames.len()
    }

    /// Execute a compiled unit in a fresh root frame. On success the root
    /// frame is kept so the host can inspect what STOP left on its stack.
    pub fn run(&mut self, code: Rc<CodePack>) -> Result<()> {
        #[cfg(feature = "debug_print_code")]
        crate::debug::disassemble_code_pack(&code);

        self.frames.clear();
        self.frames.push(Environment::new(code, 0));
        self.ip = 0;
        match self.dispatch() {
            Ok(()) => Ok(()),
            Err(err) => {
                self.unwind();
                Err(err)
            }
        }
    }

    fn frame(&self) -> Result<&Environment> {
        self.frames
            .last()
            .ok_or_else(|| RuntimeError::Internal("no current frame".to_string()))
    }

    fn frame_mut(&mut self) -> Result<&mut Environment> {
        self.frames
            .last_mut()
            .ok_or_else(|| RuntimeError::Internal("no current frame".to_string()))
    }

    fn fetch(&mut self) -> Result<Inst> {
        let frame = self.frame()?;
        let inst = frame
            .code()
            .instructions
            .get(self.ip)
            .copied()
            .ok_or(RuntimeError::EndOfCode { ip: self.ip })?;
        self.ip += 1;
        Ok(inst)
    }

    fn dispatch(&mut self) -> Result<()> {
        loop {
            #[cfg(feature = "debug_trace_execution")]
            self.trace();

            let inst = self.fetch()?;
            match inst.op {
                Op::LoadConst => {
                    let value = self.frame()?.constant(inst.param as usize)?;
                    self.frame_mut()?.push(value)?;
                }
                Op::LoadVar => {
                    let value = self.frame()?.var(inst.param as usize)?;
                    self.frame_mut()?.push(value)?;
                }
                Op::LoadUpval => {
                    let value = self.upvalue_load(inst.param as usize)?;
                    self.frame_mut()?.push(value)?;
                }
                Op::StoreVar => {
                    let value = self.frame_mut()?.pop()?;
                    self.frame_mut()?.set_var(inst.param as usize, value)?;
                }
                Op::StoreUpval => {
                    let value = self.frame_mut()?.pop()?;
                    self.upvalue_store(inst.param as usize, value)?;
                }
                Op::PushInt => {
                    self.frame_mut()?.push(Value::Int(inst.param as i64))?;
                }
                Op::PushBool => {
                    self.frame_mut()?.push(Value::Bool(inst.param != 0))?;
                }
                Op::Pop => {
                    self.frame_mut()?.pop()?;
                }
                Op::Jmp => self.jump(inst.param)?,
                Op::IfNo => {
                    let condition = self.frame_mut()?.pop()?;
                    if !condition.is_truthy() {
                        self.jump(inst.param)?;
                    }
                }
                Op::Not => {
                    let value = self.frame_mut()?.pop()?;
                    self.frame_mut()?.push(logical_not(value))?;
                }
                Op::Add => self.binary(BinaryOp::Add)?,
                Op::Sub => self.binary(BinaryOp::Sub)?,
                Op::Mul => self.binary(BinaryOp::Mul)?,
                Op::Div => self.binary(BinaryOp::Div)?,
                Op::Mod => self.binary(BinaryOp::Mod)?,
                Op::Gt => self.binary(BinaryOp::Gt)?,
                Op::Lt => self.binary(BinaryOp::Lt)?,
                Op::GtEq => self.binary(BinaryOp::GtEq)?,
                Op::LtEq => self.binary(BinaryOp::LtEq)?,
                Op::Eq => self.binary(BinaryOp::Eq)?,
                Op::Closure => self.construct_closure()?,
                Op::Call => self.call()?,
                Op::Return => self.ret(inst.param != 0)?,
                Op::Out => {
                    let value = self.frame_mut()?.pop()?;
                    let text = format_value(&value, &self.heap)?;
                    writeln!(self.out, "{}", text)
                        .map_err(|e| RuntimeError::Internal(format!("output failed: {}", e)))?;
                }
                Op::Stop => return Ok(()),
            }
        }
    }

    /// Relative jump: target = address of the jump instruction + param.
    /// The pointer has already advanced past the instruction when this runs.
    fn jump(&mut self, param: i32) -> Result<()> {
        let target = self.ip as i64 - 1 + param as i64;
        let len = self.frame()?.code().len();
        if target < 0 || target >= len as i64 {
            return Err(RuntimeError::JumpOutOfRange { target, len });
        }
        self.ip = target as usize;
        Ok(())
    }

    /// Replace second-from-top with the operator result, then pop the right
    /// operand. The stack never dips below its pre-instruction depth minus one.
    fn binary(&mut self, op: BinaryOp) -> Result<()> {
        let frame = self.frame()?;
        let lhs = frame.top(1)?;
        let rhs = frame.top(0)?;
        let result = apply_binary(&mut self.heap, op, lhs, rhs)?;
        let frame = self.frame_mut()?;
        frame.set_top(1, result)?;
        frame.pop()?;
        Ok(())
    }

    /// CLOSURE: consume a function prototype from the stack, resolve its
    /// capture specs against the current frame, push the finished closure.
    fn construct_closure(&mut self) -> Result<()> {
        let proto = self.frame_mut()?.pop()?;
        let handle = match proto {
            Value::Ref(r) if r.kind == HeapKind::Function => r.handle,
            other => {
                return Err(RuntimeError::Internal(format!(
                    "CLOSURE applied to a {}",
                    other.kind_name()
                )))
            }
        };
        let code = Rc::clone(self.heap.function(handle)?);
        debug_assert_eq!(code.upvalue_specs.len(), code.upvalue_count);

        let mut closure = Closure::new(Rc::clone(&code));
        for &raw in &code.upvalue_specs {
            let captured = match CaptureSpec::from_raw(raw) {
                CaptureSpec::Local(slot) => self.capture_local(slot)?,
                CaptureSpec::Inherit(k) => self.frame()?.upvalue_handle(k)?,
            };
            closure.upvalues.push(captured);
        }
        let value = self.heap.alloc_value(HeapObject::Closure(closure));
        self.frame_mut()?.push(value)?;
        Ok(())
    }

    /// Open an upvalue over the current frame's variable slot, reusing the
    /// existing one when this frame already opened over the same slot. Reuse
    /// is what lets sibling closures observe each other's writes.
    fn capture_local(&mut self, slot: usize) -> Result<Handle> {
        let depth = self.frame()?.depth();
        for &handle in self.frame()?.opened() {
            if self.heap.upvalue(handle)?.is_open_over(depth, slot) {
                return Ok(handle);
            }
        }
        // Validate the slot before anything starts pointing at it.
        self.frame()?.var(slot)?;
        let handle = self.heap.alloc(HeapObject::Upvalue(Upvalue::open(depth, slot)));
        self.frame_mut()?.track_opened(handle);
        Ok(handle)
    }

    fn upvalue_load(&self, index: usize) -> Result<Value> {
        let handle = self.frame()?.upvalue_handle(index)?;
        match *self.heap.upvalue(handle)? {
            Upvalue::Open { frame, slot } => self.declaring_frame(frame)?.var(slot),
            Upvalue::Closed(value) => Ok(value),
        }
    }

    fn upvalue_store(&mut self, index: usize, value: Value) -> Result<()> {
        let handle = self.frame()?.upvalue_handle(index)?;
        match *self.heap.upvalue(handle)? {
            Upvalue::Open { frame, slot } => {
                let env = self
                    .frames
                    .get_mut(frame)
                    .ok_or_else(StackVM::dead_frame)?;
                env.set_var(slot, value)
            }
            Upvalue::Closed(_) => {
                *self.heap.upvalue_mut(handle)? = Upvalue::Closed(value);
                Ok(())
            }
        }
    }

    fn declaring_frame(&self, depth: usize) -> Result<&Environment> {
        self.frames.get(depth).ok_or_else(StackVM::dead_frame)
    }

    fn dead_frame() -> RuntimeError {
        RuntimeError::Internal("open upvalue names a dead frame".to_string())
    }

    /// CALL: pop the callee, pop its arguments right to left into the new
    /// frame's leading variable slots, copy the captured upvalue handles in,
    /// and make the new frame current.
    fn call(&mut self) -> Result<()> {
        let callee = self.frame_mut()?.pop()?;
        let handle = match callee {
            Value::Ref(r) if r.kind == HeapKind::Closure => r.handle,
            other => return Err(RuntimeError::NotCallable(other.kind_name())),
        };
        if self.frames.len() >= MAX_FRAME_DEPTH {
            return Err(RuntimeError::StackOverflow {
                depth: self.frames.len(),
                limit: MAX_FRAME_DEPTH,
            });
        }
        let closure = self.heap.closure(handle)?;
        let code = Rc::clone(&closure.code);
        let captured = closure.upvalues.clone();

        let resume = self.ip;
        self.frame_mut()?.set_resume_ip(resume);
        let mut callee_frame = Environment::new(Rc::clone(&code), self.frames.len());
        for slot in (0..code.param_count).rev() {
            let arg = self.frame_mut()?.pop()?;
            callee_frame.set_var(slot, arg)?;
        }
        for upvalue in captured {
            callee_frame.push_upvalue(upvalue);
        }
        self.frames.push(callee_frame);
        self.ip = 0;
        Ok(())
    }

    /// RETURN: optionally carry the top value to the caller, close the
    /// frame's opened upvalues, tear the frame down and resume the caller.
    fn ret(&mut self, carries_value: bool) -> Result<()> {
        let returned = if carries_value {
            Some(self.frame_mut()?.pop()?)
        } else {
            None
        };
        self.close_current_frame_upvalues()?;
        self.frames
            .pop()
            .ok_or_else(|| RuntimeError::Internal("no current frame".to_string()))?;
        let caller = match self.frames.last_mut() {
            Some(caller) => caller,
            None => return Err(RuntimeError::ReturnWithoutCaller),
        };
        if let Some(value) = returned {
            caller.push(value)?;
        }
        self.ip = caller.resume_ip();
        Ok(())
    }

    /// Close every upvalue the current frame opened over its own slots.
    /// Must run while the frame is still live, so the slot values are
    /// still readable.
    fn close_current_frame_upvalues(&mut self) -> Result<()> {
        let opened = self.frame_mut()?.take_opened();
        for handle in opened {
            if let Upvalue::Open { frame, slot } = *self.heap.upvalue(handle)? {
                let value = self.declaring_frame(frame)?.var(slot)?;
                self.heap.upvalue_mut(handle)?.close(value);
            }
        }
        Ok(())
    }

    /// Error teardown: same per-frame discipline as RETURN, applied top-down
    /// until no frame is left.
    fn unwind(&mut self) {
        while !self.frames.is_empty() {
            let _ = self.close_current_frame_upvalues();
            self.frames.pop();
        }
        self.ip = 0;
    }

    #[cfg(feature = "debug_trace_execution")]
    fn trace(&self) {
        if let Some(frame) = self.frames.last() {
            print!("          ");
            for value in frame.stack() {
                print!("[ {} ]", value);
            }
            println!();
            crate::debug::disassemble_instruction(frame.code(), self.ip);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;

    #[derive(Clone, Default)]
    struct SharedBuf(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuf {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SharedBuf {
        fn contents(&self) -> String {
            String::from_utf8_lossy(&self.0.borrow()).into_owned()
        }
    }

    fn vm_with_buffer() -> (StackVM, SharedBuf) {
        let buf = SharedBuf::default();
        let vm = StackVM::with_output(Box::new(buf.clone()));
        (vm, buf)
    }

    fn pack(name: &str, program: &[(Op, i32)]) -> CodePack {
        let mut code = CodePack::new(name);
        for &(op, param) in program {
            code.emit(op, param);
        }
        code
    }

    #[test]
    fn add_prints_seven() {
        let code = pack(
            "",
            &[
                (Op::PushInt, 3),
                (Op::PushInt, 4),
                (Op::Add, 0),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(code)).unwrap();
        assert_eq!(buf.contents(), "7\n");
    }

    #[test]
    fn square_call_leaves_result_on_caller_stack() {
        let mut square = pack(
            "square",
            &[
                (Op::LoadVar, 0),
                (Op::LoadVar, 0),
                (Op::Mul, 0),
                (Op::Return, 1),
            ],
        );
        square.param_count = 1;
        square.var_count = 1;

        let (mut vm, _) = vm_with_buffer();
        let proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(square)));

        let mut script = pack(
            "",
            &[
                (Op::PushInt, 5),
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Stop, 0),
            ],
        );
        script.add_constant(proto);

        vm.run(Rc::new(script)).unwrap();
        assert_eq!(vm.operand_stack(), &[Value::Int(25)]);
    }

    #[test]
    fn returned_values_arrive_in_call_order() {
        let mut identity = pack("id", &[(Op::LoadVar, 0), (Op::Return, 1)]);
        identity.param_count = 1;
        identity.var_count = 1;

        let (mut vm, _) = vm_with_buffer();
        let proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(identity)));

        let mut script = pack(
            "",
            &[
                (Op::PushInt, 10),
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::PushInt, 20),
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Stop, 0),
            ],
        );
        script.add_constant(proto);

        vm.run(Rc::new(script)).unwrap();
        assert_eq!(vm.operand_stack(), &[Value::Int(10), Value::Int(20)]);
    }

    #[test]
    fn closure_snapshots_final_value_at_frame_teardown() {
        // inner captures the maker's variable; the maker rewrites it after
        // constructing the closure, so a later call must see the rewrite.
        let inner = {
            let mut code = pack("inner", &[(Op::LoadUpval, 0), (Op::Return, 1)]);
            code.upvalue_count = 1;
            code.upvalue_specs = vec![CaptureSpec::Local(0).to_raw()];
            code
        };

        let (mut vm, buf) = vm_with_buffer();
        let inner_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(inner)));

        let mut maker = pack(
            "maker",
            &[
                (Op::PushInt, 1),
                (Op::StoreVar, 0),
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::PushInt, 2),
                (Op::StoreVar, 0),
                (Op::Return, 1),
            ],
        );
        maker.var_count = 1;
        maker.add_constant(inner_proto);
        let maker_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(maker)));

        let mut script = pack(
            "",
            &[
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Call, 0),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        script.add_constant(maker_proto);

        vm.run(Rc::new(script)).unwrap();
        assert_eq!(buf.contents(), "2\n");
    }

    #[test]
    fn store_through_closed_upvalue_hits_the_private_copy() {
        // The declaring frame is gone by the time inner runs, so both the
        // write and the read-back go through the upvalue's owned copy.
        let inner = {
            let mut code = pack(
                "inner",
                &[
                    (Op::PushInt, 7),
                    (Op::StoreUpval, 0),
                    (Op::LoadUpval, 0),
                    (Op::Return, 1),
                ],
            );
            code.upvalue_count = 1;
            code.upvalue_specs = vec![CaptureSpec::Local(0).to_raw()];
            code
        };

        let (mut vm, buf) = vm_with_buffer();
        let inner_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(inner)));

        let mut maker = pack(
            "maker",
            &[(Op::LoadConst, 0), (Op::Closure, 0), (Op::Return, 1)],
        );
        maker.var_count = 1;
        maker.add_constant(inner_proto);
        let maker_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(maker)));

        let mut script = pack(
            "",
            &[
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Call, 0),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        script.add_constant(maker_proto);

        vm.run(Rc::new(script)).unwrap();
        assert_eq!(buf.contents(), "7\n");
    }

    #[test]
    fn sibling_closures_share_captured_variable() {
        // setter and getter both capture the outer frame's slot 0; while the
        // outer frame is live they must share one open upvalue.
        let setter = {
            let mut code = pack(
                "setter",
                &[(Op::PushInt, 42), (Op::StoreUpval, 0), (Op::Return, 0)],
            );
            code.upvalue_count = 1;
            code.upvalue_specs = vec![CaptureSpec::Local(0).to_raw()];
            code
        };
        let getter = {
            let mut code = pack("getter", &[(Op::LoadUpval, 0), (Op::Return, 1)]);
            code.upvalue_count = 1;
            code.upvalue_specs = vec![CaptureSpec::Local(0).to_raw()];
            code
        };

        let (mut vm, buf) = vm_with_buffer();
        let setter_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(setter)));
        let getter_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(getter)));

        let mut outer = pack(
            "outer",
            &[
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::LoadConst, 1),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Out, 0),
                (Op::Return, 0),
            ],
        );
        outer.var_count = 1;
        outer.add_constant(setter_proto);
        outer.add_constant(getter_proto);
        let outer_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(outer)));

        let mut script = pack(
            "",
            &[
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Stop, 0),
            ],
        );
        script.add_constant(outer_proto);

        vm.run(Rc::new(script)).unwrap();
        assert_eq!(buf.contents(), "42\n");

        // Both capturing closures ended up holding the same upvalue handle,
        // and teardown closed it over the written value.
        let shared: Vec<Handle> = vm
            .heap()
            .iter()
            .filter_map(|(_, obj)| match obj {
                HeapObject::Closure(c) if !c.upvalues.is_empty() => Some(c.upvalues[0]),
                _ => None,
            })
            .collect();
        assert_eq!(shared.len(), 2);
        assert_eq!(shared[0], shared[1]);
        assert_eq!(
            *vm.heap().upvalue(shared[0]).unwrap(),
            Upvalue::Closed(Value::Int(42))
        );
    }

    #[test]
    fn jmp_skips_forward() {
        let code = pack(
            "",
            &[
                (Op::Jmp, 3),
                (Op::PushInt, 99),
                (Op::Out, 0),
                (Op::PushInt, 7),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(code)).unwrap();
        assert_eq!(buf.contents(), "7\n");
    }

    fn branch_program(condition: i32) -> CodePack {
        pack(
            "",
            &[
                (Op::PushBool, condition),
                (Op::IfNo, 4),
                (Op::PushInt, 1),
                (Op::Out, 0),
                (Op::Jmp, 3),
                (Op::PushInt, 2),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        )
    }

    #[test]
    fn ifno_falls_through_on_truthy() {
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(branch_program(1))).unwrap();
        assert_eq!(buf.contents(), "1\n");
    }

    #[test]
    fn ifno_jumps_to_else_on_falsy() {
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(branch_program(0))).unwrap();
        assert_eq!(buf.contents(), "2\n");
    }

    #[test]
    fn backward_jmp_drives_a_countdown_loop() {
        let mut code = pack(
            "",
            &[
                (Op::PushInt, 3),
                (Op::StoreVar, 0),
                (Op::LoadVar, 0),
                (Op::IfNo, 8),
                (Op::LoadVar, 0),
                (Op::Out, 0),
                (Op::LoadVar, 0),
                (Op::PushInt, 1),
                (Op::Sub, 0),
                (Op::StoreVar, 0),
                (Op::Jmp, -8),
                (Op::Stop, 0),
            ],
        );
        code.var_count = 1;
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(code)).unwrap();
        assert_eq!(buf.contents(), "3\n2\n1\n");
    }

    #[test]
    fn type_mismatch_unwinds_every_frame() {
        let code = pack(
            "",
            &[
                (Op::PushInt, 1),
                (Op::PushBool, 1),
                (Op::Add, 0),
                (Op::Stop, 0),
            ],
        );
        let (mut vm, _) = vm_with_buffer();
        let err = vm.run(Rc::new(code)).unwrap_err();
        assert!(matches!(err, RuntimeError::TypeMismatch { .. }));
        assert_eq!(vm.frame_depth(), 0);
        assert!(vm.operand_stack().is_empty());
    }

    #[test]
    fn division_by_zero_surfaces() {
        let code = pack(
            "",
            &[
                (Op::PushInt, 1),
                (Op::PushInt, 0),
                (Op::Div, 0),
                (Op::Stop, 0),
            ],
        );
        let (mut vm, _) = vm_with_buffer();
        assert_eq!(vm.run(Rc::new(code)), Err(RuntimeError::DivisionByZero));
    }

    #[test]
    fn runaway_recursion_hits_the_depth_limit() {
        // rec calls itself through the upvalue holding its own closure.
        let rec = {
            let mut code = pack("rec", &[(Op::LoadUpval, 0), (Op::Call, 0), (Op::Return, 0)]);
            code.upvalue_count = 1;
            code.upvalue_specs = vec![CaptureSpec::Local(0).to_raw()];
            code
        };

        let (mut vm, _) = vm_with_buffer();
        let rec_proto = vm.heap_mut().alloc_value(HeapObject::Function(Rc::new(rec)));

        let mut maker = pack(
            "maker",
            &[
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::StoreVar, 0),
                (Op::LoadVar, 0),
                (Op::Call, 0),
                (Op::Return, 0),
            ],
        );
        maker.var_count = 1;
        maker.add_constant(rec_proto);
        let maker_proto = vm
            .heap_mut()
            .alloc_value(HeapObject::Function(Rc::new(maker)));

        let mut script = pack(
            "",
            &[
                (Op::LoadConst, 0),
                (Op::Closure, 0),
                (Op::Call, 0),
                (Op::Stop, 0),
            ],
        );
        script.add_constant(maker_proto);

        let err = vm.run(Rc::new(script)).unwrap_err();
        assert_eq!(
            err,
            RuntimeError::StackOverflow {
                depth: MAX_FRAME_DEPTH,
                limit: MAX_FRAME_DEPTH,
            }
        );
        assert_eq!(vm.frame_depth(), 0);

        // The engine is reusable after a fatal unwind.
        let again = pack(
            "",
            &[
                (Op::PushInt, 2),
                (Op::PushInt, 2),
                (Op::Add, 0),
                (Op::Stop, 0),
            ],
        );
        vm.run(Rc::new(again)).unwrap();
        assert_eq!(vm.operand_stack(), &[Value::Int(4)]);
    }

    #[test]
    fn eq_across_kinds_is_false_not_an_error() {
        let code = pack(
            "",
            &[
                (Op::PushInt, 0),
                (Op::PushBool, 0),
                (Op::Eq, 0),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(code)).unwrap();
        assert_eq!(buf.contents(), "false\n");
    }

    #[test]
    fn not_negates_truthiness() {
        let code = pack(
            "",
            &[
                (Op::PushInt, 0),
                (Op::Not, 0),
                (Op::Out, 0),
                (Op::PushBool, 1),
                (Op::Not, 0),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        let (mut vm, buf) = vm_with_buffer();
        vm.run(Rc::new(code)).unwrap();
        assert_eq!(buf.contents(), "true\nfalse\n");
    }

    #[test]
    fn out_prints_strings_and_concatenations() {
        let (mut vm, buf) = vm_with_buffer();
        let a = vm
            .heap_mut()
            .alloc_value(HeapObject::Str("foo".to_string()));
        let b = vm
            .heap_mut()
            .alloc_value(HeapObject::Str("bar".to_string()));

        let mut code = pack(
            "",
            &[
                (Op::LoadConst, 0),
                (Op::LoadConst, 1),
                (Op::Add, 0),
                (Op::Out, 0),
                (Op::Stop, 0),
            ],
        );
        code.add_constant(a);
        code.add_constant(b);

        vm.run(Rc::new(code)).unwrap();
        assert_eq!(buf.contents(), "foobar\n");
    }

    #[test]
    fn return_at_top_level_is_an_error() {
        let code = pack("", &[(Op::Return, 0), (Op::Stop, 0)]);
        let (mut vm, _) = vm_with_buffer();
        assert_eq!(
            vm.run(Rc::new(code)),
            Err(RuntimeError::ReturnWithoutCaller)
        );
    }

    #[test]
    fn jump_outside_the_code_is_an_error() {
        let code = pack("", &[(Op::Jmp, -5), (Op::Stop, 0)]);
        let (mut vm, _) = vm_with_buffer();
        assert_eq!(
            vm.run(Rc::new(code)),
            Err(RuntimeError::JumpOutOfRange { target: -5, len: 2 })
        );
    }

    #[test]
    fn running_off_the_end_is_an_error() {
        let code = pack("", &[(Op::PushInt, 1)]);
        let (mut vm, _) = vm_with_buffer();
        assert_eq!(
            vm.run(Rc::new(code)),
            Err(RuntimeError::EndOfCode { ip: 1 })
        );
    }

    #[test]
    fn calling_a_non_closure_fails() {
        let code = pack(
            "",
            &[(Op::PushInt, 3), (Op::Call, 0), (Op::Stop, 0)],
        );
        let (mut vm, _) = vm_with_buffer();
        assert_eq!(
            vm.run(Rc::new(code)),
            Err(RuntimeError::NotCallable("int"))
        );
    }
}
