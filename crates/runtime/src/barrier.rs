//! Tentative allocation and the barrier scope that bounds its lifetime.
//!
//! The original engine threads every allocation through an explicit anchor
//! linked list so that a `setjmp`/`longjmp` interrupt can walk back and free
//! whatever was mid-flight. In Rust the same guarantee falls out of RAII: an
//! [`Anchor`] owns the pending allocation and frees it on `Drop` unless
//! [`Anchor::commit`] has already handed ownership to the engine. Propagate
//! errors with `?`; there is no jump to simulate, because unwinding the
//! `Result` chain runs every intervening `Anchor`'s destructor for free.

use wick_core::{ObjRef, Val};

/// A tentative allocation of a heap object.
///
/// Dropping an uncommitted anchor tells the engine to free the slot it
/// reserved. `commit` consumes the anchor and leaves the object permanently
/// owned by the engine's live set.
#[must_use = "an uncommitted anchor frees its object when dropped"]
pub struct ObjAnchor {
    obj: ObjRef,
    committed: bool,
}

impl ObjAnchor {
    pub(crate) fn new(obj: ObjRef) -> Self {
        ObjAnchor { obj, committed: false }
    }

    pub fn obj(&self) -> ObjRef {
        self.obj
    }

    /// Moves the object into the engine's live set permanently.
    pub fn commit(mut self) -> ObjRef {
        self.committed = true;
        self.obj
    }
}

impl Drop for ObjAnchor {
    fn drop(&mut self) {
        if !self.committed {
            CANCELLED_OBJECTS.with(|c| c.borrow_mut().push(self.obj));
        }
    }
}

thread_local! {
    // Engine::collect_cancellations drains this after a barrier unwinds.
    // The original links anchors directly off the barrier; here the drop
    // glue can't reach back into `Engine` (no handle is threaded through),
    // so cancellations are staged here and reclaimed by the engine on its
    // next allocation or GC cycle.
    static CANCELLED_OBJECTS: std::cell::RefCell<Vec<ObjRef>> = std::cell::RefCell::new(Vec::new());
}

/// Drains objects whose anchors were dropped without committing since the
/// last drain. The engine calls this after any fallible region returns, so
/// cancelled slots are freed promptly rather than waiting for a GC cycle.
pub fn take_cancelled_objects() -> Vec<ObjRef> {
    CANCELLED_OBJECTS.with(|c| std::mem::take(&mut *c.borrow_mut()))
}

/// A stack-declared root set of `Val` slots, traced by the GC while live.
///
/// Mirrors the original's bucket: code that must hold several `Val`s across
/// an allocation site declares a `Bucket`, assigns into its slots, and lets
/// the GC see them as roots for as long as the `Bucket` is in scope.
pub struct Bucket {
    slots: Vec<Val>,
}

impl Bucket {
    pub fn new(size: usize) -> Self {
        Bucket { slots: vec![Val::Udf; size] }
    }

    pub fn get(&self, i: usize) -> Val {
        self.slots[i]
    }

    pub fn set(&mut self, i: usize, v: Val) {
        self.slots[i] = v;
    }

    pub fn as_slice(&self) -> &[Val] {
        &self.slots
    }
}

/// A scope that owns every anchor and bucket created within it, and catches
/// the engine-level failure payload when a fallible operation errs.
///
/// Barriers nest strictly: an interpreter loop or host-call boundary pushes
/// one, runs fallible work under it, and lets `?` unwind back out, at which
/// point the `Barrier`'s buckets are simply dropped (their `Vec<Val>`
/// storage reclaimed like any other stack value) and any `ObjAnchor`s
/// created during the scope run their `Drop` glue.
pub struct Barrier {
    buckets: Vec<Bucket>,
}

impl Barrier {
    pub fn new() -> Self {
        Barrier { buckets: Vec::new() }
    }

    pub fn add_bucket(&mut self, size: usize) -> usize {
        self.buckets.push(Bucket::new(size));
        self.buckets.len() - 1
    }

    pub fn bucket(&self, id: usize) -> &Bucket {
        &self.buckets[id]
    }

    pub fn bucket_mut(&mut self, id: usize) -> &mut Bucket {
        &mut self.buckets[id]
    }

    /// Bucket contents, used by the GC as additional roots.
    pub fn roots(&self) -> impl Iterator<Item = Val> + '_ {
        self.buckets.iter().flat_map(|b| b.as_slice().iter().copied())
    }

    /// Buckets are removed in stack order; popping past a still-registered
    /// one is a logic error in the caller.
    pub fn rem_bucket(&mut self, id: usize) {
        debug_assert_eq!(id, self.buckets.len() - 1, "buckets must be removed in stack order");
        self.buckets.pop();
    }
}

impl Default for Barrier {
    fn default() -> Self {
        Self::new()
    }
}
