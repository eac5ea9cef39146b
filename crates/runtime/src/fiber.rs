//! Cooperative coroutines: a split value/control stack, argument
//! formatting, and the call/return/yield/resume state machine.
//!
//! The original's control stack is a raw byte buffer of variable-sized
//! activation records, whose `sb` (stack-base) and `prev` fields must be
//! rebased by hand whenever a `realloc` relocates the buffer. Per the
//! redesign note ("model... as explicit activation-record arenas with
//! relocation handled by index-based `sb`"), this port stores activation
//! records in a plain `Vec<ActivationRecord>`: indices into a `Vec` survive
//! reallocation for free in safe Rust, so there is no relocation hazard to
//! guard against in the first place.

use wick_core::{EngineError, ErrNum, ObjRef, Val};

use crate::code::{Code, CodeKind, CodeLoc, Opcode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FibState {
    Stopped,
    Current,
    Paused,
    Finished,
    Failed,
}

/// One activation: either mid-byte-code (`pc` resumes the fetch loop) or a
/// reentrant host call awaiting its next resume point.
pub enum ActivationRecord {
    Byte {
        fun: ObjRef,
        /// Index into the fiber's value stack where this call's locals begin.
        sb: usize,
        pc: CodeLoc,
    },
    Host {
        fun: ObjRef,
        sb: usize,
        resume_point: u32,
        state: Vec<u8>,
    },
}

pub struct Fiber {
    pub parent: Option<ObjRef>,
    pub entry: ObjRef,
    pub state: FibState,
    pub value_stack: Vec<Val>,
    pub control_stack: Vec<ActivationRecord>,
    pub error: Option<EngineError>,
}

impl Fiber {
    pub fn new(entry: ObjRef) -> Self {
        Fiber {
            parent: None,
            entry,
            state: FibState::Stopped,
            value_stack: Vec::new(),
            control_stack: Vec::new(),
            error: None,
        }
    }

    fn ensure_value_room(&mut self, additional: usize) {
        self.value_stack.reserve(additional);
    }

    /// Pushes arguments (already on the value stack) through
    /// parameter-count/variadic formatting, per the spec's argument rules.
    /// Returns the (possibly rewritten, for the variadic-collection case)
    /// argument count.
    pub fn format_args(
        &mut self,
        code: &Code,
        args_base: usize,
        make_record: impl FnOnce(&[Val]) -> Result<Val, EngineError>,
    ) -> Result<usize, EngineError> {
        let given = self.value_stack.len() - args_base;
        for v in &self.value_stack[args_base..] {
            if *v == Val::Udf {
                return Err(EngineError::udf(ErrNum::UdfAsArg));
            }
        }
        let fixed = code.num_fixed_params as usize;
        if given < fixed {
            return Err(EngineError::udf(ErrNum::TooFewArgs));
        }
        if given == fixed {
            if code.has_var_params {
                let empty = make_record(&[])?;
                self.value_stack.push(empty);
                return Ok(fixed + 1);
            }
            return Ok(fixed);
        }
        // given > fixed
        if !code.has_var_params {
            return Err(EngineError::udf(ErrNum::TooManyArgs));
        }
        let extra: Vec<Val> = self.value_stack.drain(args_base + fixed..).collect();
        let collected = make_record(&extra)?;
        self.value_stack.push(collected);
        Ok(fixed + 1)
    }

    pub fn call_byte(&mut self, fun: ObjRef, code: &Code, args_base: usize) -> Result<(), EngineError> {
        self.ensure_value_room(code.v_size());
        self.value_stack.resize(args_base + code.v_size(), Val::Udf);
        let pc = match &code.kind {
            CodeKind::Byte { .. } => CodeLoc { word: 0, shift: 0 },
            CodeKind::Host { .. } => panic!("call_byte on host code"),
        };
        self.control_stack.push(ActivationRecord::Byte { fun, sb: args_base, pc });
        Ok(())
    }

    pub fn call_host(&mut self, fun: ObjRef, state_size: usize, args_base: usize) {
        self.control_stack.push(ActivationRecord::Host {
            fun,
            sb: args_base,
            resume_point: 0,
            state: vec![0; state_size],
        });
    }

    /// Pops the current activation, truncating the value stack back to
    /// what the caller expects to see above `sb`.
    pub fn pop_frame(&mut self) -> Option<ActivationRecord> {
        self.control_stack.pop()
    }

    pub fn current_frame_mut(&mut self) -> Option<&mut ActivationRecord> {
        self.control_stack.last_mut()
    }

    /// Transitions `Current -> Stopped`. The caller is responsible for
    /// making the parent fiber `Current` and handing back the yielded
    /// values, mirroring how `return` hands back its values.
    pub fn yield_now(&mut self) -> Result<(), EngineError> {
        if self.state != FibState::Current {
            return Err(EngineError::udf(ErrNum::FibNotStopped));
        }
        self.state = FibState::Stopped;
        Ok(())
    }

    pub fn resume_check(&self) -> Result<(), EngineError> {
        if self.state != FibState::Stopped {
            return Err(EngineError::udf(ErrNum::FibNotStopped));
        }
        Ok(())
    }

    pub fn fail(&mut self, err: EngineError) {
        self.state = FibState::Failed;
        self.error = Some(err);
    }

    pub fn finish(&mut self) {
        self.state = FibState::Finished;
    }
}

/// Decodes the next opcode from the current byte-code frame, advancing its
/// program counter in place. Returns `None` if the current frame is a host
/// frame (the caller handles those through the host callback protocol
/// instead).
pub fn fetch_next(fiber: &mut Fiber, code: &Code) -> Option<(Opcode, u8, u16)> {
    let frame = fiber.control_stack.last_mut()?;
    match frame {
        ActivationRecord::Byte { pc, .. } => {
            let (instr, next) = crate::assembler::fetch(code, *pc);
            *pc = next;
            Some((instr.opcode, instr.variation, instr.operand))
        }
        ActivationRecord::Host { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wick_core::Type;

    fn dummy_entry() -> ObjRef {
        ObjRef::new(Type::Fun, 0, 0)
    }

    #[test]
    fn initial_state_is_stopped() {
        let fib = Fiber::new(dummy_entry());
        assert_eq!(fib.state, FibState::Stopped);
    }

    #[test]
    fn resuming_non_stopped_fiber_fails() {
        let mut fib = Fiber::new(dummy_entry());
        fib.state = FibState::Finished;
        let err = fib.resume_check().unwrap_err();
        assert_eq!(err.num, ErrNum::FibNotStopped);
    }

    #[test]
    fn yield_requires_current_state() {
        let mut fib = Fiber::new(dummy_entry());
        let err = fib.yield_now().unwrap_err();
        assert_eq!(err.num, ErrNum::FibNotStopped);
        fib.state = FibState::Current;
        fib.yield_now().unwrap();
        assert_eq!(fib.state, FibState::Stopped);
    }

    #[test]
    fn too_few_args_detected() {
        let mut fib = Fiber::new(dummy_entry());
        fib.value_stack.push(Val::Int(1));
        let code = crate::code::Code {
            kind: crate::code::CodeKind::Byte {
                words: crate::code::WordBuffer::new(),
                labels: vec![],
            },
            consts: vec![],
            num_locals: 0,
            num_upvals: 0,
            num_fixed_params: 2,
            has_var_params: false,
            var_params_idx: None,
        };
        let err = fib.format_args(&code, 0, |_| Ok(Val::Udf)).unwrap_err();
        assert_eq!(err.num, ErrNum::TooFewArgs);
    }

    #[test]
    fn udf_argument_rejected() {
        let mut fib = Fiber::new(dummy_entry());
        fib.value_stack.push(Val::Udf);
        let code = crate::code::Code {
            kind: crate::code::CodeKind::Byte {
                words: crate::code::WordBuffer::new(),
                labels: vec![],
            },
            consts: vec![],
            num_locals: 0,
            num_upvals: 0,
            num_fixed_params: 1,
            has_var_params: false,
            var_params_idx: None,
        };
        let err = fib.format_args(&code, 0, |_| Ok(Val::Udf)).unwrap_err();
        assert_eq!(err.num, ErrNum::UdfAsArg);
    }
}
