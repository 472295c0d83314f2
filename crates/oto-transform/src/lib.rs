//! MIR transformations for Oto
//!
//! Two passes run between MIR generation and code generation:
//!
//! 1. [`ClosureConverter`] eliminates lexical capture. Functions that
//!    reference variables from enclosing scopes become closure records
//!    (function pointer plus capture record), nested definitions are
//!    hoisted to the top level, and every call site is classified as a
//!    direct, closure, or external call.
//! 2. [`MemObjCollector`] computes each function's persistent storage
//!    needs (`self` history and stateful-builtin state, transitively
//!    through callees) and materializes one top-level allocation per
//!    stateful function, so the audio callback never allocates.
//!
//! The passes share one mutable [`TypeEnv`]; types live there, keyed by
//! name, and are rewritten as conversion changes what names mean.

pub mod closure;
pub mod error;
pub mod memobj;

pub use closure::ClosureConverter;
pub use error::{Result, TransformError};
pub use memobj::{FunObjTree, MemObjCollector, MemObjMap};

use oto_mir::Block;
use oto_types::TypeEnv;

/// Run both passes over a top-level block, in order. Returns the
/// memory-object map for code generation.
pub fn transform(toplevel: &mut Block, env: &mut TypeEnv) -> Result<MemObjMap> {
    let mut cc = ClosureConverter::new(env);
    cc.convert(toplevel)?;
    let mut mc = MemObjCollector::new(env);
    mc.process(toplevel)
}
