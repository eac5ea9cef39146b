//! Index-sharing field container.
//!
//! The original packs a record into two tagged-pointer machine words
//! sharing an index with other record instances until "separation". The
//! redesign note suggests modelling that as a copy-on-write wrapper
//! (`Shared(Arc<Index>)` vs `Owned(Index)`); this port follows that advice
//! but shares through the engine's heap rather than an `Arc`, since the
//! index itself is a GC-scanned heap object other records and the
//! environment may also reference — an `Arc` would create a second,
//! GC-invisible ownership story for the same data.

use wick_core::{EngineError, ErrNum, ObjRef, Val};

use crate::index::Index;
use crate::strings::StringPool;

/// Record's own values-array capacity table: gentler growth than the
/// index's, since most records stay small.
const VALUE_CAPACITIES: [u32; 28] = [
    1, 2, 3, 4, 5, 7, 10, 14, 20, 28, 40, 56, 80, 112, 160, 224, 320, 448, 640, 896, 1280, 1792,
    2560, 3584, 5120, 7168, 10240, 14336, 20480, 28672,
];

fn values_cap(row: usize) -> u32 {
    VALUE_CAPACITIES[row.min(VALUE_CAPACITIES.len() - 1)]
}

pub struct Record {
    /// The heap object backing this record's schema. Shared across every
    /// record that borrowed the same index until separation allocates a
    /// private one.
    pub index: ObjRef,
    /// Set when the record must separate before its next `def`.
    pub sep: bool,
    /// Recursion-visited marker, used by structural equality/ordering to
    /// detect cycles.
    pub rcu: bool,
    values: Vec<Val>,
}

impl Record {
    /// Borrows `index_ref` (an `Idx` heap object), sizing the values array
    /// from the record's own capacity table at the index's current row.
    pub fn new(index_ref: ObjRef, row: usize) -> Self {
        Record {
            index: index_ref,
            sep: false,
            rcu: false,
            values: vec![Val::Udf; values_cap(row) as usize],
        }
    }

    fn ensure_capacity(&mut self, slot: u32) {
        if slot as usize >= self.values.len() {
            let mut row = 0;
            while values_cap(row) <= slot {
                row += 1;
            }
            self.values.resize(values_cap(row) as usize, Val::Udf);
        }
    }

    /// Introduces or overwrites `key`. `idx` is the shared index this
    /// record currently borrows (or has just separated into its own);
    /// inserting a new key here grows the *shared* schema, which is why
    /// `Engine::record_def` is the only caller — it holds the `&mut Index`
    /// checked out of the heap slot this record's `index` field names.
    pub fn def_local(&mut self, idx: &mut Index, strings: &mut StringPool, key: Val, val: Val) -> Result<(), EngineError> {
        if val == Val::Udf {
            return Err(EngineError::udf(ErrNum::SetToUdf));
        }
        let slot = idx.insert(key, strings)?;
        self.ensure_capacity(slot);
        self.values[slot as usize] = val;
        Ok(())
    }

    pub fn set_local(&mut self, idx: &Index, strings: &StringPool, key: Val, val: Val) -> Result<(), EngineError> {
        if val == Val::Udf {
            return Err(EngineError::udf(ErrNum::SetToUdf));
        }
        let slot = idx.lookup(&key, strings)?.ok_or_else(|| EngineError::udf(ErrNum::SetUndefined))?;
        if (slot as usize) >= self.values.len() || self.values[slot as usize] == Val::Udf {
            return Err(EngineError::udf(ErrNum::SetUndefined));
        }
        self.values[slot as usize] = val;
        Ok(())
    }

    pub fn get_local(&self, idx: &Index, strings: &StringPool, key: &Val) -> Result<Val, EngineError> {
        match idx.lookup(key, strings)? {
            Some(slot) if (slot as usize) < self.values.len() => Ok(self.values[slot as usize]),
            _ => Ok(Val::Udf),
        }
    }

    /// Raw access to the values array, for the GC's mark phase — it only
    /// needs to walk every slot looking for `Obj`/`Str` payloads, not the
    /// key each one is paired with.
    pub fn raw_values(&self) -> &[Val] {
        &self.values
    }

    /// Overwrites the values array wholesale — used when constructing a new
    /// record that starts out sharing another's field values (a copy/spread
    /// construction) before either one has diverged.
    pub fn set_raw_values(&mut self, values: Vec<Val>) {
        self.values = values;
    }

    /// Slots currently holding a defined (non-`Udf`) value, paired with the
    /// source-index slot number — used by separation to build a sub-index.
    pub fn defined_slots(&self) -> Vec<u32> {
        self.values
            .iter()
            .enumerate()
            .filter(|(_, v)| **v != Val::Udf)
            .map(|(i, _)| i as u32)
            .collect()
    }

    /// Rebuilds `self.values` densely after separation, given the
    /// `(old_slot -> new_slot)` mapping produced by `Index::sub_index`
    /// (`-1` for slots that were dropped).
    pub fn compact(&mut self, locs: &[i64], old_slots: &[u32]) {
        let new_len = locs.iter().filter(|&&l| l >= 0).count();
        let mut new_values = vec![Val::Udf; new_len.max(1)];
        for (i, &old_slot) in old_slots.iter().enumerate() {
            let new_slot = locs[i];
            if new_slot >= 0 {
                new_values[new_slot as usize] = self.values[old_slot as usize];
            }
        }
        self.values = new_values;
    }

    pub fn iter<'a>(&'a self, idx: &'a Index) -> impl Iterator<Item = (&'a Val, Val)> + 'a {
        idx.iter().filter_map(move |(k, slot)| {
            let v = *self.values.get(slot as usize).unwrap_or(&Val::Udf);
            if v == Val::Udf {
                None
            } else {
                Some((k, v))
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wick_core::{Config, Type};

    fn fresh_index(config: &Config) -> Index {
        Index::new(config)
    }

    #[test]
    fn get_undefined_key_is_udf() {
        let config = Config::default();
        let strings = StringPool::new();
        let idx = fresh_index(&config);
        let rec = Record::new(ObjRef::new(Type::Idx, 0, 0), idx.row());
        assert_eq!(rec.get_local(&idx, &strings, &Val::Int(5)).unwrap(), Val::Udf);
    }

    #[test]
    fn def_then_get_roundtrips() {
        let config = Config::default();
        let mut strings = StringPool::new();
        let mut idx = fresh_index(&config);
        idx.insert(Val::Int(0), &strings).unwrap();
        let mut rec = Record::new(ObjRef::new(Type::Idx, 0, 0), idx.row());
        rec.def_local(&mut idx, &mut strings, Val::Int(0), Val::Int(99)).unwrap();
        assert_eq!(rec.get_local(&idx, &strings, &Val::Int(0)).unwrap(), Val::Int(99));
    }

    #[test]
    fn set_on_undefined_key_fails() {
        let config = Config::default();
        let strings = StringPool::new();
        let idx = fresh_index(&config);
        let mut rec = Record::new(ObjRef::new(Type::Idx, 0, 0), idx.row());
        let err = rec.set_local(&idx, &strings, Val::Int(0), Val::Int(1)).unwrap_err();
        assert_eq!(err.num, ErrNum::SetUndefined);
    }

    #[test]
    fn set_to_udf_fails() {
        let config = Config::default();
        let mut strings = StringPool::new();
        let mut idx = fresh_index(&config);
        idx.insert(Val::Int(0), &strings).unwrap();
        let mut rec = Record::new(ObjRef::new(Type::Idx, 0, 0), idx.row());
        let err = rec.def_local(&mut idx, &mut strings, Val::Int(0), Val::Udf).unwrap_err();
        assert_eq!(err.num, ErrNum::SetToUdf);
    }
}
