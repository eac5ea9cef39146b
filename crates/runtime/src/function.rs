//! Closures: a code pointer bound to an array of upvalue cells.

use wick_core::{ObjRef, Val};

/// A single-value cell shared between closures capturing the same outer
/// binding. GC-scanned as the value it holds.
pub struct BoxCell(pub Val);

/// A code pointer plus the upvalue cells `code.num_upvals` requires. Host
/// functions additionally carry a heap-allocated scratch buffer sized by
/// the code (`HeapObject::State`), referenced here so repeated calls reuse
/// the same storage rather than reallocating per call.
pub struct Function {
    pub code: ObjRef,
    pub upvalues: Vec<ObjRef>,
    pub host_state: Option<ObjRef>,
}

impl Function {
    pub fn new(code: ObjRef, upvalues: Vec<ObjRef>, host_state: Option<ObjRef>) -> Self {
        Function { code, upvalues, host_state }
    }
}
