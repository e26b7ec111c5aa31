use std::rc::Rc;

use crate::code_pack::CodePack;
use crate::error::{Result, RuntimeError};
use crate::objects::closure::Closure;
use crate::objects::upvalue::Upvalue;
use crate::value::{HeapKind, Value};

/// Non-owning name for a heap slot.
pub type Handle = usize;

/// An object living on the collector-managed heap.
#[derive(Debug, Clone)]
pub enum HeapObject {
    /// Function prototype: a compiled unit awaiting capture.
    Function(Rc<CodePack>),
    Closure(Closure),
    Upvalue(Upvalue),
    Array(Vec<Value>),
    Str(String),
    /// Free slot, linking to the next free slot.
    Free(Option<Handle>),
}

impl HeapObject {
    fn kind(&self) -> Option<HeapKind> {
        match self {
            HeapObject::Function(_) => Some(HeapKind::Function),
            HeapObject::Closure(_) => Some(HeapKind::Closure),
            HeapObject::Upvalue(_) => Some(HeapKind::Upvalue),
            HeapObject::Array(_) => Some(HeapKind::Array),
            HeapObject::Str(_) => Some(HeapKind::Str),
            HeapObject::Free(_) => None,
        }
    }

    fn kind_name(&self) -> &'static str {
        match self.kind() {
            Some(kind) => kind.name(),
            None => "free slot",
        }
    }
}

/// Allocation service at the collector boundary. Hands out handles and
/// dereferences them; reclamation is the collector's call, so the engine
/// only ever allocates. `free` exists for the collector's sweep.
#[derive(Debug, Default)]
pub struct Heap {
    objects: Vec<Option<HeapObject>>,
    free_list_head: Option<Handle>,
}

impl Heap {
    pub fn new() -> Heap {
        Heap::default()
    }

    /// Allocate an object, reusing a freed slot when one is available.
    pub fn alloc(&mut self, obj: HeapObject) -> Handle {
        debug_assert!(obj.kind().is_some(), "cannot allocate a free slot");
        if let Some(handle) = self.free_list_head {
            self.free_list_head = match self.objects[handle].take() {
                Some(HeapObject::Free(next)) => next,
                _ => None,
            };
            self.objects[handle] = Some(obj);
            handle
        } else {
            self.objects.push(Some(obj));
            self.objects.len() - 1
        }
    }

    /// Allocate and wrap the handle in a tagged value.
    pub fn alloc_value(&mut self, obj: HeapObject) -> Value {
        let kind = obj.kind().unwrap_or(HeapKind::Str);
        Value::heap_ref(kind, self.alloc(obj))
    }

    /// Release a slot back to the free list. Called by the collector's
    /// sweep, never by the dispatch engine.
    pub fn free(&mut self, handle: Handle) {
        if let Some(slot) = self.objects.get_mut(handle) {
            if matches!(slot, Some(obj) if obj.kind().is_some()) {
                *slot = Some(HeapObject::Free(self.free_list_head));
                self.free_list_head = Some(handle);
            }
        }
    }

    /// Iterate live objects, as a tracing collector would.
    pub fn iter(&self) -> impl Iterator<Item = (Handle, &HeapObject)> {
        self.objects
            .iter()
            .enumerate()
            .filter_map(|(handle, slot)| match slot {
                Some(obj) if obj.kind().is_some() => Some((handle, obj)),
                _ => None,
            })
    }

    pub fn get(&self, handle: Handle) -> Result<&HeapObject> {
        match self.objects.get(handle) {
            Some(Some(obj)) if obj.kind().is_some() => Ok(obj),
            _ => Err(RuntimeError::DanglingHandle(handle)),
        }
    }

    fn get_mut(&mut self, handle: Handle) -> Result<&mut HeapObject> {
        match self.objects.get_mut(handle) {
            Some(Some(obj)) if obj.kind().is_some() => Ok(obj),
            _ => Err(RuntimeError::DanglingHandle(handle)),
        }
    }

    fn kind_error(expected: &'static str, got: &HeapObject) -> RuntimeError {
        RuntimeError::Internal(format!(
            "heap handle names a {}, expected a {}",
            got.kind_name(),
            expected
        ))
    }

    pub fn function(&self, handle: Handle) -> Result<&Rc<CodePack>> {
        match self.get(handle)? {
            HeapObject::Function(code) => Ok(code),
            other => Err(Heap::kind_error("function", other)),
        }
    }

    pub fn closure(&self, handle: Handle) -> Result<&Closure> {
        match self.get(handle)? {
            HeapObject::Closure(closure) => Ok(closure),
            other => Err(Heap::kind_error("closure", other)),
        }
    }

    pub fn upvalue(&self, handle: Handle) -> Result<&Upvalue> {
        match self.get(handle)? {
            HeapObject::Upvalue(upvalue) => Ok(upvalue),
            other => Err(Heap::kind_error("upvalue", other)),
        }
    }

    pub fn upvalue_mut(&mut self, handle: Handle) -> Result<&mut Upvalue> {
        match self.get_mut(handle)? {
            HeapObject::Upvalue(upvalue) => Ok(upvalue),
            other => Err(Heap::kind_error("upvalue", other)),
        }
    }

    pub fn string(&self, handle: Handle) -> Result<&str> {
        match self.get(handle)? {
            HeapObject::Str(s) => Ok(s),
            other => Err(Heap::kind_error("string", other)),
        }
    }

    pub fn array(&self, handle: Handle) -> Result<&Vec<Value>> {
        match self.get(handle)? {
            HeapObject::Array(elements) => Ok(elements),
            other => Err(Heap::kind_error("array", other)),
        }
    }

    fn array_mut(&mut self, handle: Handle) -> Result<&mut Vec<Value>> {
        match self.get_mut(handle)? {
            HeapObject::Array(elements) => Ok(elements),
            other => Err(Heap::kind_error("array", other)),
        }
    }

    /// `At(i)`: element at `i`, out-of-range for every `i >= length`.
    pub fn array_at(&self, handle: Handle, index: usize) -> Result<Value> {
        let elements = self.array(handle)?;
        elements
            .get(index)
            .copied()
            .ok_or(RuntimeError::IndexOutOfRange {
                index,
                len: elements.len(),
            })
    }

    /// `Set(i, v)`: overwrite element at `i`.
    pub fn array_set(&mut self, handle: Handle, index: usize, value: Value) -> Result<()> {
        let elements = self.array_mut(handle)?;
        let len = elements.len();
        match elements.get_mut(index) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(RuntimeError::IndexOutOfRange { index, len }),
        }
    }

    /// `Push(v)`: append, growing the array.
    pub fn array_push(&mut self, handle: Handle, value: Value) -> Result<()> {
        self.array_mut(handle)?.push(value);
        Ok(())
    }

    pub fn array_len(&self, handle: Handle) -> Result<usize> {
        Ok(self.array(handle)?.len())
    }
}
