//! Wick Runtime: the bytecode virtual machine built on `wick-core`'s value
//! model.
//!
//! # Modules
//!
//! - `barrier`: tentative allocation (`ObjAnchor`) and interrupt-safe root
//!   buckets (`Bucket`/`Barrier`)
//! - `heap`: the object slab every GC-scanned value lives in
//! - `strings`: the three-size-class string pool
//! - `index`: the shared hashmap backing records and globals
//! - `record`: index-sharing field containers
//! - `function`: closures (code pointer + upvalue cells)
//! - `code`: opcodes, packed instruction words, and the `Code` object
//! - `assembler`: turns opcodes into `Code`, resolving labels and operand
//!   bounds
//! - `fiber`: the coroutine/call-stack abstraction
//! - `environment`: globals plus the import/operator lookup tables
//! - `gc`: tracing mark-sweep collection
//! - `engine`: the orchestrator tying every collaborator together

pub mod assembler;
pub mod barrier;
pub mod code;
pub mod engine;
pub mod environment;
pub mod fiber;
pub mod function;
pub mod gc;
pub mod heap;
pub mod index;
pub mod record;
pub mod strings;

pub use assembler::{Assembler, LabelId};
pub use barrier::{Barrier, Bucket, ObjAnchor};
pub use code::{Code, CodeKind, CodeLoc, Instr, Opcode, WordBuffer};
pub use engine::Engine;
pub use environment::{Environment, Globals};
pub use fiber::{ActivationRecord, FibState, Fiber};
pub use function::{BoxCell, Function};
pub use gc::{Gc, GcStats};
pub use heap::{Heap, HeapObject};
pub use index::Index;
pub use record::Record;
pub use strings::{Loan, StringPool};
