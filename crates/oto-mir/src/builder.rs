//! Helpers for assembling MIR programs
//!
//! The upstream MIR generator (and the tests here) construct blocks
//! through [`MirBuilder`], which owns the counters that keep function
//! identities and generated value names unique across the program.

use crate::instr::{Block, CallKind, Instr, Operand};
use oto_types::FunId;

/// Context for building MIR, tracks id/name uniqueness
#[derive(Debug, Default)]
pub struct MirBuilder {
    /// Counter for generating unique function IDs
    next_fun_id: FunId,
    /// Counter for generating unique value names
    next_tmp: u32,
}

impl MirBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Generate a fresh program-unique value name with the given prefix
    pub fn fresh_name(&mut self, prefix: &str) -> String {
        let name = format!("{}.{}", prefix, self.next_tmp);
        self.next_tmp += 1;
        name
    }

    /// Create a function definition with a fresh identity
    pub fn function(&mut self, name: impl Into<String>, args: Vec<String>, body: Block) -> Instr {
        let id = self.next_fun_id;
        self.next_fun_id += 1;
        Instr::Fun {
            id,
            name: name.into(),
            args,
            body,
            free_vars: Vec::new(),
        }
    }

    /// Create a call instruction; the call kind starts out `Direct` and
    /// is reassigned by the closure converter's classification
    pub fn call(name: impl Into<String>, callee: impl Into<String>, args: Vec<Operand>) -> Instr {
        Instr::Call {
            name: name.into(),
            callee: callee.into(),
            args,
            kind: CallKind::Direct,
        }
    }
}
