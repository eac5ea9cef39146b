//! The stable numeric error taxonomy and the error type threaded through
//! every fallible entry point in the runtime.

use crate::value::Val;

/// A stable, numeric error kind.
///
/// Numeric, not just a string message, because host embedders need to
/// switch on error *kind* without string-matching a message (the original
/// engine's `errnum` field serves the same purpose across its FFI boundary).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrNum {
    /// An index key was of a type that cannot be a key (e.g. `Udf`).
    KeyType,
    /// Too many local variable slots requested from the assembler.
    NumLocals,
    /// Too many upvalue slots requested from the assembler.
    NumUpvals,
    /// Too many constant-pool slots requested from the assembler.
    NumConsts,
    /// A parameter name collided with another parameter name.
    ParamName,
    /// An upvalue name collided with another upvalue name.
    UpvalName,
    /// A variadic parameter was followed by more parameters.
    ExtraParams,
    /// A `def` attempted to bind a key to `Udf`.
    SetToUdf,
    /// A `set` targeted a key that was never `def`'d.
    SetUndefined,
    /// A formatter directive was malformed.
    FormatSpec,
    /// Structural equality/ordering encountered a cycle.
    CyclicRecord,
    /// `resume` was called on a fiber that wasn't `Stopped`.
    FibNotStopped,
    /// A host or bytecode call returned more values than the callee declared.
    TooManyReturns,
    /// A host or bytecode call returned fewer values than the callee declared.
    TooFewReturns,
    /// A call supplied more arguments than the callee accepts.
    TooManyArgs,
    /// A call supplied fewer arguments than the callee requires.
    TooFewArgs,
    /// `Udf` was passed where an argument value was required.
    UdfAsArg,
    /// A host function panicked; converted to a catchable engine error.
    Panic,
    /// An error raised by host or bytecode for a reason wick-core has no
    /// dedicated variant for.
    Other,
    /// Allocation failed or a hard memory ceiling was hit.
    Memory,
}

impl ErrNum {
    /// Fatal errors (`Memory`) cannot be caught by a bytecode `try`; every
    /// other kind is recoverable at a barrier boundary.
    pub const fn is_fatal(self) -> bool {
        matches!(self, ErrNum::Memory)
    }
}

/// The error type returned by every fallible runtime operation.
///
/// Carries the stable `ErrNum` discriminant plus the `Val` payload the
/// language-level error handler sees (often a formatted message string, but
/// a bytecode `raise` can attach any value).
#[derive(Debug, Clone, thiserror::Error)]
#[error("{num:?}: {payload:?}")]
pub struct EngineError {
    pub num: ErrNum,
    pub payload: Val,
}

impl EngineError {
    pub fn new(num: ErrNum, payload: Val) -> Self {
        EngineError { num, payload }
    }

    pub fn udf(num: ErrNum) -> Self {
        EngineError { num, payload: Val::Udf }
    }

    pub fn is_fatal(&self) -> bool {
        self.num.is_fatal()
    }
}

pub type EngineResult<T> = Result<T, EngineError>;
