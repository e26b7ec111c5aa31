use std::fmt;

use crate::error::Result;
use crate::heap::{Handle, Heap};

/// Kind of heap object a `HeapRef` points at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HeapKind {
    Function,
    Closure,
    Upvalue,
    Array,
    Str,
}

impl HeapKind {
    pub fn name(self) -> &'static str {
        match self {
            HeapKind::Function => "function",
            HeapKind::Closure => "closure",
            HeapKind::Upvalue => "upvalue",
            HeapKind::Array => "array",
            HeapKind::Str => "string",
        }
    }
}

/// Non-owning reference to a collector-managed heap object. Copying a
/// `HeapRef` never duplicates the referent.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapRef {
    pub kind: HeapKind,
    pub handle: Handle,
}

/// Tagged immediate-or-reference datum. Cheap to copy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Value {
    Int(i64),
    Bool(bool),
    Ref(HeapRef),
}

impl Value {
    pub fn heap_ref(kind: HeapKind, handle: Handle) -> Value {
        Value::Ref(HeapRef { kind, handle })
    }

    pub fn kind_name(&self) -> &'static str {
        match self {
            Value::Int(_) => "int",
            Value::Bool(_) => "bool",
            Value::Ref(r) => r.kind.name(),
        }
    }

    /// Truthiness used by IFNO and NOT: false and zero are falsy, every
    /// reference is truthy.
    pub fn is_truthy(&self) -> bool {
        match self {
            Value::Bool(b) => *b,
            Value::Int(n) => *n != 0,
            Value::Ref(_) => true,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Int(n) => write!(f, "{}", n),
            Value::Bool(b) => write!(f, "{}", b),
            Value::Ref(r) => write!(f, "<{} #{}>", r.kind.name(), r.handle),
        }
    }
}

/// Render a value as the OUT instruction's formatting collaborator would,
/// following references into the heap.
pub fn format_value(value: &Value, heap: &Heap) -> Result<String> {
    match value {
        Value::Int(n) => Ok(n.to_string()),
        Value::Bool(b) => Ok(b.to_string()),
        Value::Ref(r) => match r.kind {
            HeapKind::Str => Ok(heap.string(r.handle)?.to_string()),
            HeapKind::Function => {
                let code = heap.function(r.handle)?;
                if code.name.is_empty() {
                    Ok("<script>".to_string())
                } else {
                    Ok(format!("<fn {}>", code.name))
                }
            }
            HeapKind::Closure => {
                let closure = heap.closure(r.handle)?;
                if closure.code.name.is_empty() {
                    Ok("<closure>".to_string())
                } else {
                    Ok(format!("<closure {}>", closure.code.name))
                }
            }
            HeapKind::Upvalue => Ok("<upvalue>".to_string()),
            HeapKind::Array => {
                let elements = heap.array(r.handle)?;
                let mut parts = Vec::with_capacity(elements.len());
                for element in elements {
                    parts.push(format_value(element, heap)?);
                }
                Ok(format!("[{}]", parts.join(", ")))
            }
        },
    }
}
