//! Process-global collaborators held by the engine: globals, import
//! strategies, and operator overloads.

use wick_core::{Config, ObjRef, Val};

use crate::index::Index;
use crate::strings::StringPool;

/// Globals: an index (name -> slot) plus a parallel value array growing by
/// doubling. Handles resolve to a stable slot the assembler bakes into
/// bytecode as a `GetGlobalB`/`SetGlobalB` operand.
pub struct Globals {
    index: Index,
    values: Vec<Val>,
}

impl Globals {
    pub fn new(config: &Config) -> Self {
        Globals { index: Index::new(config), values: Vec::new() }
    }

    pub fn define(&mut self, name: Val, strings: &mut StringPool) -> Result<u32, wick_core::EngineError> {
        let slot = self.index.insert(name, strings)?;
        if slot as usize >= self.values.len() {
            let new_len = (self.values.len().max(1) * 2).max(slot as usize + 1);
            self.values.resize(new_len, Val::Udf);
        }
        Ok(slot)
    }

    pub fn lookup(&self, name: &Val, strings: &StringPool) -> Result<Option<u32>, wick_core::EngineError> {
        self.index.lookup(name, strings)
    }

    pub fn get(&self, slot: u32) -> Val {
        self.values.get(slot as usize).copied().unwrap_or(Val::Udf)
    }

    pub fn set(&mut self, slot: u32, val: Val) {
        self.values[slot as usize] = val;
    }

    pub fn scan_strings(&self, strings: &mut StringPool) {
        self.index.scan_strings(strings);
    }

    /// Upper bound on currently-assigned global slots, for the GC's root
    /// walk.
    pub fn values_len(&self) -> usize {
        self.values.len()
    }
}

/// The environment: globals plus two record-backed lookup tables (import
/// strategies, operator overloads). The records themselves live on the
/// heap like any other `Rec` object; `Environment` only remembers their
/// `ObjRef`s so the engine can dispatch through `record::get_local` et al.
pub struct Environment {
    pub globals: Globals,
    /// Keyed by strategy name -> loader function.
    pub import_loaders: ObjRef,
    /// Keyed by strategy name -> translator function.
    pub import_translators: ObjRef,
    /// Keyed by operator name -> overload function.
    pub operators: ObjRef,
}

impl Environment {
    pub fn new(config: &Config, import_loaders: ObjRef, import_translators: ObjRef, operators: ObjRef) -> Self {
        Environment { globals: Globals::new(config), import_loaders, import_translators, operators }
    }
}
