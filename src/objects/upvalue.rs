use crate::value::Value;

/// Boxed variable reference that lets a closure outlive the frame that
/// declared the variable. `Open` names a live variable slot of the frame at
/// the given depth; `Closed` owns a private copy. The transition is
/// one-directional and happens exactly once, when the declaring frame is
/// torn down.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Upvalue {
    Open { frame: usize, slot: usize },
    Closed(Value),
}

impl Upvalue {
    pub fn open(frame: usize, slot: usize) -> Upvalue {
        Upvalue::Open { frame, slot }
    }

    pub fn is_open_over(&self, frame: usize, slot: usize) -> bool {
        matches!(self, Upvalue::Open { frame: f, slot: s } if *f == frame && *s == slot)
    }

    /// Copy the slot's final value into owned storage. Only the declaring
    /// frame's teardown calls this.
    pub fn close(&mut self, value: Value) {
        debug_assert!(
            matches!(self, Upvalue::Open { .. }),
            "upvalue closed twice"
        );
        *self = Upvalue::Closed(value);
    }
}
