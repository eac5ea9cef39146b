//! The engine's object slab: a single, non-moving arena for every
//! GC-scanned heap object.
//!
//! The original keeps objects on an intrusive linked list threaded through
//! their own headers, addressed by raw pointer. This port replaces that
//! with a `Vec`-backed slab addressed by index, as suggested by the
//! "heap graph with cycles" redesign note: `ObjRef` is a stable index plus
//! a generation counter, never a raw pointer, so a stale handle from a
//! freed-and-reused slot is caught rather than dereferenced.

use wick_core::{ObjRef, Type};

use crate::code::Code;
use crate::function::{BoxCell, Function};
use crate::index::Index;
use crate::record::Record;

/// The payload an object slot holds, keyed by `Type`.
pub enum HeapObject {
    Idx(Index),
    Rec(Record),
    Code(Code),
    Fun(Function),
    /// The interpreter's fiber state lives in `fiber::Fiber`; the heap only
    /// needs to know its slot exists for GC root purposes, so fibers are
    /// stored boxed and downcast by the fiber module rather than matched
    /// here (the scheduler never has more than a handful live at once).
    Fib(crate::fiber::Fiber),
    Box_(BoxCell),
    /// Opaque runtime-internal state (host-function scratch, in-flight
    /// resume continuations); scanned as an opaque byte blob.
    State(Vec<u8>),
}

impl HeapObject {
    pub fn ty(&self) -> Type {
        match self {
            HeapObject::Idx(_) => Type::Idx,
            HeapObject::Rec(_) => Type::Rec,
            HeapObject::Code(_) => Type::Code,
            HeapObject::Fun(_) => Type::Fun,
            HeapObject::Fib(_) => Type::Fib,
            HeapObject::Box_(_) => Type::Box_,
            HeapObject::State(_) => Type::State,
        }
    }
}

struct Slot {
    generation: u32,
    mark: bool,
    object: Option<HeapObject>,
}

/// The live-object slab. Allocation never moves an existing object, so
/// `ObjRef`s remain valid (modulo generation checks) across a GC cycle.
#[derive(Default)]
pub struct Heap {
    slots: Vec<Slot>,
    free: Vec<u32>,
    pub(crate) bytes_live: usize,
}

impl Heap {
    pub fn new() -> Self {
        Heap { slots: Vec::new(), free: Vec::new(), bytes_live: 0 }
    }

    /// Reserves a slot and stores `object` in it uncommitted — the caller
    /// (the engine) wraps the returned `ObjRef` in an `ObjAnchor` before
    /// handing it back, so a failure between reservation and commit still
    /// reclaims the slot via the anchor's `Drop`.
    pub fn reserve(&mut self, object: HeapObject) -> ObjRef {
        let ty = object.ty();
        let size = approx_size(&object);
        self.bytes_live += size;
        if let Some(index) = self.free.pop() {
            let slot = &mut self.slots[index as usize];
            slot.object = Some(object);
            slot.mark = false;
            ObjRef::new(ty, index, slot.generation)
        } else {
            let index = self.slots.len() as u32;
            self.slots.push(Slot { generation: 0, mark: false, object: Some(object) });
            ObjRef::new(ty, index, 0)
        }
    }

    fn check(&self, r: ObjRef) -> &Slot {
        let slot = &self.slots[r.index as usize];
        assert_eq!(slot.generation, r.generation, "stale ObjRef: slot was freed and reused");
        slot
    }

    fn check_mut(&mut self, r: ObjRef) -> &mut Slot {
        let slot = &mut self.slots[r.index as usize];
        assert_eq!(slot.generation, r.generation, "stale ObjRef: slot was freed and reused");
        slot
    }

    pub fn get(&self, r: ObjRef) -> &HeapObject {
        self.check(r).object.as_ref().expect("ObjRef points at a freed slot")
    }

    pub fn get_mut(&mut self, r: ObjRef) -> &mut HeapObject {
        self.check_mut(r).object.as_mut().expect("ObjRef points at a freed slot")
    }

    /// Mutably borrows two distinct slots at once, e.g. a record and the
    /// index it currently shares. Panics if the two refs name the same slot
    /// (the caller should special-case that, since it means no separation
    /// is needed).
    pub fn get2_mut(&mut self, a: ObjRef, b: ObjRef) -> (&mut HeapObject, &mut HeapObject) {
        assert_ne!(a.index, b.index, "get2_mut called with the same slot twice");
        let (lo, hi, swapped) = if a.index < b.index { (a, b, false) } else { (b, a, true) };
        let (left, right) = self.slots.split_at_mut(hi.index as usize);
        let lo_slot = &mut left[lo.index as usize];
        let hi_slot = &mut right[0];
        assert_eq!(lo_slot.generation, lo.generation, "stale ObjRef: slot was freed and reused");
        assert_eq!(hi_slot.generation, hi.generation, "stale ObjRef: slot was freed and reused");
        let lo_obj = lo_slot.object.as_mut().expect("ObjRef points at a freed slot");
        let hi_obj = hi_slot.object.as_mut().expect("ObjRef points at a freed slot");
        if swapped {
            (hi_obj, lo_obj)
        } else {
            (lo_obj, hi_obj)
        }
    }

    pub fn mark(&mut self, r: ObjRef) -> bool {
        let slot = self.check_mut(r);
        let was_marked = slot.mark;
        slot.mark = true;
        !was_marked
    }

    pub fn is_marked(&self, r: ObjRef) -> bool {
        self.check(r).mark
    }

    /// Frees every slot whose mark bit is clear; bumps the generation of
    /// freed slots so stale `ObjRef`s are caught, then clears the surviving
    /// marks for the next cycle. Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let mut freed = 0;
        for (i, slot) in self.slots.iter_mut().enumerate() {
            if slot.object.is_none() {
                continue;
            }
            if slot.mark {
                slot.mark = false;
            } else {
                if let Some(obj) = &slot.object {
                    self.bytes_live = self.bytes_live.saturating_sub(approx_size(obj));
                }
                slot.object = None;
                slot.generation = slot.generation.wrapping_add(1);
                self.free.push(i as u32);
                freed += 1;
            }
        }
        freed
    }

    pub fn free_obj(&mut self, r: ObjRef) {
        let slot = self.check_mut(r);
        if let Some(obj) = slot.object.take() {
            self.bytes_live = self.bytes_live.saturating_sub(approx_size(&obj));
        }
        slot.generation = slot.generation.wrapping_add(1);
        self.free.push(r.index);
    }

    pub fn live_count(&self) -> usize {
        self.slots.len() - self.free.len()
    }

    /// All currently-live object handles, for GC mark-phase scanning.
    pub fn live_refs(&self) -> Vec<ObjRef> {
        self.slots
            .iter()
            .enumerate()
            .filter_map(|(i, s)| {
                s.object.as_ref().map(|o| ObjRef::new(o.ty(), i as u32, s.generation))
            })
            .collect()
    }
}

fn approx_size(obj: &HeapObject) -> usize {
    match obj {
        HeapObject::Idx(i) => 32 + i.capacity() * 12,
        HeapObject::Rec(_) => 48,
        HeapObject::Code(c) => 64 + c.approx_bytes(),
        HeapObject::Fun(f) => 24 + f.upvalues.len() * 8,
        HeapObject::Fib(_) => 256,
        HeapObject::Box_(_) => 16,
        HeapObject::State(s) => s.len(),
    }
}
