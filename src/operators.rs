use std::collections::HashMap;

use once_cell::sync::Lazy;
use strum_macros::Display;

use crate::error::{Result, RuntimeError};
use crate::heap::{Heap, HeapObject};
use crate::value::{HeapKind, Value};

/// The closed set of binary operators values can be combined with.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Display)]
pub enum BinaryOp {
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
}

/// Dispatch tag: one entry per value kind, heap kinds flattened.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Tag {
    Int,
    Bool,
    Function,
    Closure,
    Upvalue,
    Array,
    Str,
}

pub fn tag_of(value: &Value) -> Tag {
    match value {
        Value::Int(_) => Tag::Int,
        Value::Bool(_) => Tag::Bool,
        Value::Ref(r) => match r.kind {
            HeapKind::Function => Tag::Function,
            HeapKind::Closure => Tag::Closure,
            HeapKind::Upvalue => Tag::Upvalue,
            HeapKind::Array => Tag::Array,
            HeapKind::Str => Tag::Str,
        },
    }
}

type BinFn = fn(&mut Heap, Value, Value) -> Result<Value>;

const SAME_TAG: [Tag; 7] = [
    Tag::Int,
    Tag::Bool,
    Tag::Function,
    Tag::Closure,
    Tag::Upvalue,
    Tag::Array,
    Tag::Str,
];

/// Total dispatch table from (operator, lhs kind, rhs kind) to a result
/// function. Combinations absent here are type mismatches, except EQ which
/// falls back to "unequal".
static BINARY_TABLE: Lazy<HashMap<(BinaryOp, Tag, Tag), BinFn>> = Lazy::new(|| {
    let mut table: HashMap<(BinaryOp, Tag, Tag), BinFn> = HashMap::new();

    let int_ops: [(BinaryOp, BinFn); 9] = [
        (BinaryOp::Add, int_add),
        (BinaryOp::Sub, int_sub),
        (BinaryOp::Mul, int_mul),
        (BinaryOp::Div, int_div),
        (BinaryOp::Mod, int_mod),
        (BinaryOp::Gt, int_gt),
        (BinaryOp::Lt, int_lt),
        (BinaryOp::GtEq, int_gteq),
        (BinaryOp::LtEq, int_lteq),
    ];
    for (op, f) in int_ops {
        table.insert((op, Tag::Int, Tag::Int), f);
    }

    // String concatenation rides the same dispatch as arithmetic.
    table.insert((BinaryOp::Add, Tag::Str, Tag::Str), str_concat);

    // EQ is defined for every same-kind pair; references compare by handle.
    for tag in SAME_TAG {
        table.insert((BinaryOp::Eq, tag, tag), value_eq);
    }

    table
});

/// Apply a binary operator via the dispatch table. EQ on mismatched kinds
/// yields false; any other missing combination is a type mismatch, never a
/// coercion.
pub fn apply_binary(heap: &mut Heap, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value> {
    let key = (op, tag_of(&lhs), tag_of(&rhs));
    if let Some(f) = BINARY_TABLE.get(&key) {
        return f(heap, lhs, rhs);
    }
    if op == BinaryOp::Eq {
        return Ok(Value::Bool(false));
    }
    Err(RuntimeError::TypeMismatch {
        operator: op.to_string(),
        lhs: lhs.kind_name(),
        rhs: rhs.kind_name(),
    })
}

/// Logical negation over truthiness. Total: defined for every kind.
pub fn logical_not(value: Value) -> Value {
    Value::Bool(!value.is_truthy())
}

fn int_pair(lhs: Value, rhs: Value) -> Result<(i64, i64)> {
    match (lhs, rhs) {
        (Value::Int(a), Value::Int(b)) => Ok((a, b)),
        _ => Err(RuntimeError::Internal(
            "integer operator dispatched on non-integers".to_string(),
        )),
    }
}

fn int_add(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Int(a.wrapping_add(b)))
}

fn int_sub(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Int(a.wrapping_sub(b)))
}

fn int_mul(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Int(a.wrapping_mul(b)))
}

fn int_div(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    if b == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    Ok(Value::Int(a.wrapping_div(b)))
}

fn int_mod(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    if b == 0 {
        return Err(RuntimeError::DivisionByZero);
    }
    Ok(Value::Int(a.wrapping_rem(b)))
}

fn int_gt(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Bool(a > b))
}

fn int_lt(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Bool(a < b))
}

fn int_gteq(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Bool(a >= b))
}

fn int_lteq(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = int_pair(lhs, rhs)?;
    Ok(Value::Bool(a <= b))
}

fn value_eq(_: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    Ok(Value::Bool(lhs == rhs))
}

fn str_concat(heap: &mut Heap, lhs: Value, rhs: Value) -> Result<Value> {
    let (a, b) = match (lhs, rhs) {
        (Value::Ref(a), Value::Ref(b)) => (a.handle, b.handle),
        _ => {
            return Err(RuntimeError::Internal(
                "string concat dispatched on non-references".to_string(),
            ))
        }
    };
    let mut joined = String::with_capacity(heap.string(a)?.len() + heap.string(b)?.len());
    joined.push_str(heap.string(a)?);
    joined.push_str(heap.string(b)?);
    Ok(heap.alloc_value(HeapObject::Str(joined)))
}
