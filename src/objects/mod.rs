pub mod closure;
pub mod upvalue;
