//! Wick Core: the tagged value model shared by every layer of the runtime.
//!
//! Key design principles:
//! - `Val`: what the language talks about (ints, strings, records, fibers, ...)
//! - `ObjRef`: an opaque, engine-checked handle to a heap object — never a raw pointer
//! - Representation (NaN-boxed vs. plain tagged struct) is a compile-time choice,
//!   selected by the `nan-tagged` / `tagged-struct` features, behind a single API
//!
//! # Modules
//!
//! - `error`: the stable numeric error taxonomy (`ErrNum`) and `EngineError`
//! - `config`: runtime configuration knobs (GC tuning, dispatch strategy, ...)
//! - `types`: the `Type` discriminant and object-reference newtype
//! - `value`: the `Val` tagged union and both wire encodings

pub mod config;
pub mod error;
pub mod types;
pub mod value;

pub use config::Config;
pub use error::{EngineError, ErrNum};
pub use types::{ObjRef, RefKind, RefVal, Type};
pub use value::{StrHandle, Val};
