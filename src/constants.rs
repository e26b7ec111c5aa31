/// Capacity of a single frame's operand stack.
pub const MAX_STACK_SIZE: usize = 256;

/// Maximum call-frame nesting depth. Exceeding it is fatal.
pub const MAX_FRAME_DEPTH: usize = 64;
