//! Mid-level Intermediate Representation (MIR) for Oto
//!
//! A flat, typed instruction IR produced by the MIR generator and
//! rewritten by closure conversion and memory-object collection before
//! native code generation.

pub mod builder;
pub mod builtins;
pub mod instr;
pub mod pretty;

pub use builder::MirBuilder;
pub use instr::{BinOp, Block, CallKind, Instr, Operand, UnOp};
