//! Assembles bytecode: tracks the constant pool, local/upvalue/parameter
//! name tables, and labels, then packs instructions into a `WordBuffer` and
//! finalises into a `Code` object.

use wick_core::types::{RefKind, RefVal};
use wick_core::{EngineError, ErrNum, Val};

use crate::code::{Code, CodeKind, CodeLoc, Instr, Opcode, WordBuffer};

const MAX_SLOT: u16 = RefVal::MAX_INDEX;
const A_FORM_MAX_OPERAND: u16 = 0b111;

pub struct LabelId(usize);

pub struct Assembler {
    name: String,
    consts: Vec<Val>,
    locals: Vec<String>,
    upvals: Vec<String>,
    params: Vec<String>,
    variadic_param: Option<usize>,
    labels: Vec<CodeLoc>,
    words: WordBuffer,
}

impl Assembler {
    pub fn new(name: impl Into<String>) -> Self {
        Assembler {
            name: name.into(),
            consts: Vec::new(),
            locals: Vec::new(),
            upvals: Vec::new(),
            params: Vec::new(),
            variadic_param: None,
            labels: Vec::new(),
            words: WordBuffer::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn add_const(&mut self, v: Val) -> Result<RefVal, EngineError> {
        if self.consts.len() as u16 > MAX_SLOT {
            return Err(EngineError::udf(ErrNum::NumConsts));
        }
        let index = self.consts.len() as u16;
        self.consts.push(v);
        Ok(RefVal::new(RefKind::Const, index))
    }

    pub fn add_local(&mut self, name: impl Into<String>) -> Result<RefVal, EngineError> {
        if self.locals.len() as u16 > MAX_SLOT {
            return Err(EngineError::udf(ErrNum::NumLocals));
        }
        let index = self.locals.len() as u16;
        self.locals.push(name.into());
        Ok(RefVal::new(RefKind::Local, index))
    }

    pub fn add_upval(&mut self, name: impl Into<String>) -> Result<RefVal, EngineError> {
        let name = name.into();
        if self.upvals.iter().any(|u| *u == name) {
            return Err(EngineError::udf(ErrNum::UpvalName));
        }
        if self.upvals.len() as u16 > MAX_SLOT {
            return Err(EngineError::udf(ErrNum::NumUpvals));
        }
        let index = self.upvals.len() as u16;
        self.upvals.push(name);
        Ok(RefVal::new(RefKind::Boxed, index))
    }

    /// Accepts a trailing `...` marking the variadic parameter; exactly one
    /// is allowed, and it must be the last parameter declared.
    pub fn add_param(&mut self, name: impl Into<String>, is_variadic: bool) -> Result<RefVal, EngineError> {
        let name = name.into();
        if self.params.iter().any(|p| *p == name) {
            return Err(EngineError::udf(ErrNum::ParamName));
        }
        if is_variadic {
            if self.variadic_param.is_some() {
                return Err(EngineError::udf(ErrNum::ExtraParams));
            }
            self.variadic_param = Some(self.params.len());
        } else if self.variadic_param.is_some() {
            return Err(EngineError::udf(ErrNum::ExtraParams));
        }
        let index = self.params.len() as u16;
        self.params.push(name);
        Ok(RefVal::new(RefKind::Local, index))
    }

    pub fn add_label(&mut self, pos: CodeLoc) -> LabelId {
        self.labels.push(pos);
        LabelId(self.labels.len() - 1)
    }

    pub fn resolve_label(&self, label: &LabelId) -> CodeLoc {
        self.labels[label.0]
    }

    pub fn add_instr(&mut self, opcode: Opcode, variation: u8, operand: u16) -> Result<CodeLoc, EngineError> {
        if opcode.is_a_form() && operand > A_FORM_MAX_OPERAND {
            return Err(EngineError::udf(ErrNum::Other));
        }
        Ok(self.words.put_instr(opcode, variation, operand))
    }

    pub fn here(&self) -> CodeLoc {
        // best-effort "current position" marker for forward-jump patching;
        // callers that need a stable label should use `add_label` on the
        // `CodeLoc` returned from `add_instr` instead.
        CodeLoc { word: (self.words.len_words() - 1) as u32, shift: 0 }
    }

    pub fn make_assembler(&self, name: impl Into<String>) -> Assembler {
        Assembler::new(name)
    }

    pub fn make_code(self) -> Code {
        let num_fixed_params =
            self.variadic_param.unwrap_or(self.params.len()) as u16;
        Code {
            kind: CodeKind::Byte { words: self.words, labels: self.labels },
            consts: self.consts,
            num_locals: self.locals.len() as u16,
            num_upvals: self.upvals.len() as u16,
            num_fixed_params,
            has_var_params: self.variadic_param.is_some(),
            var_params_idx: self.variadic_param.map(|i| i as u32),
        }
    }
}

/// Decodes the instruction at `loc`, returning it together with the
/// position of the next instruction.
pub fn fetch(code: &Code, loc: CodeLoc) -> (Instr, CodeLoc) {
    match &code.kind {
        CodeKind::Byte { words, .. } => words.fetch(loc),
        CodeKind::Host { .. } => panic!("fetch on host code"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn const_overflow_raises_num_consts() {
        let mut asm = Assembler::new("overflow");
        for i in 0..=(RefVal::MAX_INDEX as i32) {
            asm.add_const(Val::Int(i)).unwrap();
        }
        let err = asm.add_const(Val::Int(0)).unwrap_err();
        assert_eq!(err.num, ErrNum::NumConsts);
    }

    #[test]
    fn a_form_operand_bound_enforced() {
        let mut asm = Assembler::new("bounds");
        assert!(asm.add_instr(Opcode::Add, 0, 8).is_err());
        assert!(asm.add_instr(Opcode::Add, 0, 7).is_ok());
    }

    #[test]
    fn duplicate_param_name_rejected() {
        let mut asm = Assembler::new("params");
        asm.add_param("x", false).unwrap();
        let err = asm.add_param("x", false).unwrap_err();
        assert_eq!(err.num, ErrNum::ParamName);
    }

    #[test]
    fn extra_params_after_variadic_rejected() {
        let mut asm = Assembler::new("params");
        asm.add_param("rest", true).unwrap();
        let err = asm.add_param("more", false).unwrap_err();
        assert_eq!(err.num, ErrNum::ExtraParams);
    }

    #[test]
    fn round_trip_add_consts() {
        let mut asm = Assembler::new("main");
        let k1 = asm.add_const(Val::Int(3)).unwrap();
        let k2 = asm.add_const(Val::Int(4)).unwrap();
        asm.add_instr(Opcode::GetConstB, 0, k1.index).unwrap();
        asm.add_instr(Opcode::GetConstB, 0, k2.index).unwrap();
        asm.add_instr(Opcode::Add, 0, 0).unwrap();
        let code = asm.make_code();
        assert_eq!(code.consts, vec![Val::Int(3), Val::Int(4)]);
    }
}
