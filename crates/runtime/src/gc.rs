//! Tracing mark-sweep collection.
//!
//! Non-moving, non-incremental, tri-colored by each object's mark bit. A
//! bounded mark stack is used for the common case; once it fills, marking
//! falls back to plain recursion for the remainder of that object's
//! subgraph — the safe-Rust equivalent of the original's "recursive
//! sub-scan with its own stack segment", since an explicit secondary
//! segment buys nothing in a language where the call stack already grows
//! safely.

use wick_core::{Config, ObjRef, Val};

use crate::barrier::Barrier;
use crate::heap::{Heap, HeapObject};
use crate::strings::StringPool;

pub struct GcStats {
    pub cycle: u64,
    pub objects_swept: usize,
    pub strings_swept: usize,
    pub was_full: bool,
}

pub struct Gc {
    cycle_count: u64,
    mem_limit: usize,
}

impl Gc {
    pub fn new(initial_limit: usize) -> Self {
        Gc { cycle_count: 0, mem_limit: initial_limit }
    }

    pub fn should_collect(&self, heap: &Heap, requested: usize) -> bool {
        heap.bytes_live + requested > self.mem_limit
    }

    fn is_full_cycle(&self, config: &Config) -> bool {
        config.gc_full_cycle_interval > 0
            && (self.cycle_count + 1) % config.gc_full_cycle_interval as u64 == 0
    }

    /// Runs one collection cycle. `roots` supplies every `Val` the engine
    /// considers a GC root outside the heap itself (environment globals,
    /// barrier buckets and failure values, the fatal-alloc sentinel).
    pub fn collect(
        &mut self,
        heap: &mut Heap,
        strings: &mut StringPool,
        config: &Config,
        requested: usize,
        roots: impl IntoIterator<Item = Val>,
    ) -> GcStats {
        self.cycle_count += 1;
        let full = self.is_full_cycle(config);

        let mut stack: Vec<ObjRef> = Vec::with_capacity(config.gc_mark_stack_segment_size);
        for root in roots {
            mark_val(heap, strings, &mut stack, root);
        }
        while let Some(obj) = stack.pop() {
            scan_object(heap, strings, &mut stack, obj, full);
        }

        let objects_swept = heap.sweep();
        let strings_swept = if full { strings.sweep() } else { 0 };

        self.mem_limit = ((self.mem_limit + requested) as f64 * (1.0 + config.gc_growth_factor)) as usize;

        tracing::debug!(
            cycle = self.cycle_count,
            objects_swept,
            strings_swept,
            full,
            new_limit = self.mem_limit,
            "gc cycle complete"
        );

        GcStats { cycle: self.cycle_count, objects_swept, strings_swept, was_full: full }
    }

    pub fn collect_with_barriers(
        &mut self,
        heap: &mut Heap,
        strings: &mut StringPool,
        config: &Config,
        requested: usize,
        extra_roots: impl IntoIterator<Item = Val>,
        barriers: &[Barrier],
    ) -> GcStats {
        let barrier_roots: Vec<Val> = barriers.iter().flat_map(|b| b.roots()).collect();
        let roots = extra_roots.into_iter().chain(barrier_roots);
        self.collect(heap, strings, config, requested, roots)
    }
}

fn mark_val(heap: &mut Heap, strings: &mut StringPool, stack: &mut Vec<ObjRef>, v: Val) {
    match v {
        Val::Str(h) => strings.mark(&h),
        Val::Obj(r) => {
            if heap.mark(r) {
                stack.push(r);
            }
        }
        _ => {}
    }
}

fn scan_object(heap: &mut Heap, strings: &mut StringPool, stack: &mut Vec<ObjRef>, obj: ObjRef, full: bool) {
    // Collect the refs/strings this object points at first, to avoid
    // holding a `&mut Heap` borrow on `obj` while recursing into `heap`
    // for the objects it references.
    let mut child_objs: Vec<ObjRef> = Vec::new();
    let mut child_strs: Vec<wick_core::value::StrHandle> = Vec::new();
    let mut scan_idx_strings = false;

    match heap.get(obj) {
        HeapObject::Idx(_) => {
            scan_idx_strings = full;
        }
        HeapObject::Rec(rec) => {
            child_objs.push(rec.index);
            for &v in rec.raw_values() {
                push_child(v, &mut child_objs, &mut child_strs);
            }
        }
        HeapObject::Code(code) => {
            for &c in &code.consts {
                push_child(c, &mut child_objs, &mut child_strs);
            }
        }
        HeapObject::Fun(fun) => {
            child_objs.push(fun.code);
            child_objs.extend(fun.upvalues.iter().copied());
            if let Some(s) = fun.host_state {
                child_objs.push(s);
            }
        }
        HeapObject::Fib(fib) => {
            child_objs.push(fib.entry);
            if let Some(p) = fib.parent {
                child_objs.push(p);
            }
            for v in &fib.value_stack {
                push_child(*v, &mut child_objs, &mut child_strs);
            }
        }
        HeapObject::Box_(b) => {
            push_child(b.0, &mut child_objs, &mut child_strs);
        }
        HeapObject::State(_) => {}
    }

    if scan_idx_strings {
        if let HeapObject::Idx(idx) = heap.get(obj) {
            idx.scan_strings(strings);
        }
    }

    for r in child_objs {
        if heap.mark(r) {
            stack.push(r);
        }
    }
    for h in child_strs {
        strings.mark(&h);
    }
}

fn push_child(v: Val, objs: &mut Vec<ObjRef>, strs: &mut Vec<wick_core::value::StrHandle>) {
    match v {
        Val::Obj(r) => objs.push(r),
        Val::Str(h) => strs.push(h),
        _ => {}
    }
}
