//! MIR instruction and block definitions
//!
//! The MIR is a flat, typed, SSA-styled representation the closure
//! converter and memory-object collector rewrite before code generation.
//! Instruction types live in the shared [`TypeEnv`](oto_types::TypeEnv),
//! keyed by instruction name, so that a pass overwriting a name's type is
//! immediately visible to every later consumer.

use oto_types::{FunId, Type};

/// A value operand: either a named SSA value or the `self` sentinel.
///
/// `self` is only meaningful inside a function body and denotes the value
/// the enclosing function returned on its previous invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operand {
    Var(String),
    SelfRef,
}

impl Operand {
    pub fn var(name: impl Into<String>) -> Self {
        Operand::Var(name.into())
    }

    /// The referenced name, if this is not the `self` sentinel
    pub fn as_var(&self) -> Option<&str> {
        match self {
            Operand::Var(name) => Some(name),
            Operand::SelfRef => None,
        }
    }

    pub fn is_self(&self) -> bool {
        matches!(self, Operand::SelfRef)
    }
}

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinOp {
    Add,
    Sub,
    Mul,
    Div,
    Mod,
    Pow,
    Lt,
    Le,
    Gt,
    Ge,
    Eq,
    Ne,
    And,
    Or,
}

/// Unary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnOp {
    Neg,
    Not,
}

/// How a call site reaches its callee.
///
/// `Direct` callees are known functions with no captures; `Closure`
/// callees are reached through a closure record (function pointer plus
/// capture pointer); `External` callees are runtime builtins linked by
/// symbol name.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Direct,
    Closure,
    External,
}

/// An ordered, mutable sequence of instructions.
///
/// Blocks nest: function bodies and `if` branches are blocks. After
/// closure conversion only the single top-level block may contain
/// [`Instr::Fun`] definitions.
#[derive(Debug, Clone, PartialEq)]
pub struct Block {
    pub label: String,
    pub instrs: Vec<Instr>,
}

impl Block {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            instrs: Vec::new(),
        }
    }

    pub fn push(&mut self, instr: Instr) {
        self.instrs.push(instr);
    }

    /// Iterate over the function definitions directly in this block
    pub fn functions(&self) -> impl Iterator<Item = &Instr> {
        self.instrs.iter().filter(|i| i.is_function())
    }
}

/// A single MIR instruction.
///
/// `name` is the SSA destination, unique within the whole program.
/// Instructions without a result (`Store`, `Ret`) carry no name.
#[derive(Debug, Clone, PartialEq)]
pub enum Instr {
    /// Number literal
    Number { name: String, val: f64 },
    /// String literal
    Str { name: String, val: String },
    /// Persistent slot allocation
    Alloca { name: String, ty: Type },
    /// Read a named slot
    Load { name: String, src: Operand },
    /// Write a named slot
    Store { dst: Operand, src: Operand },
    /// Binary operation
    BinOp {
        name: String,
        op: BinOp,
        lhs: Operand,
        rhs: Operand,
    },
    /// Unary operation
    UnOp {
        name: String,
        op: UnOp,
        value: Operand,
    },
    /// Nested function definition; owns its body block exclusively.
    /// `free_vars` is empty until the closure converter fills it for
    /// capturing functions.
    Fun {
        id: FunId,
        name: String,
        args: Vec<String>,
        body: Block,
        free_vars: Vec<String>,
    },
    /// Call; `kind` is (re)assigned by the closure converter
    Call {
        name: String,
        callee: String,
        args: Vec<Operand>,
        kind: CallKind,
    },
    /// Materialize a closure record for `fname` from the listed captures
    MakeClosure {
        name: String,
        fname: String,
        captures: Vec<String>,
    },
    /// Array literal
    Array { name: String, elems: Vec<Operand> },
    /// Array element read
    ArrayAccess {
        name: String,
        array: Operand,
        index: Operand,
    },
    /// Aggregate field read by position
    Field {
        name: String,
        target: Operand,
        index: u32,
    },
    /// Two-armed conditional with nested blocks
    If {
        name: String,
        cond: Operand,
        then_blk: Block,
        else_blk: Block,
    },
    /// Return from the enclosing function
    Ret { value: Operand },
}

impl Instr {
    /// The SSA destination name, if any
    pub fn name(&self) -> Option<&str> {
        match self {
            Instr::Number { name, .. }
            | Instr::Str { name, .. }
            | Instr::Alloca { name, .. }
            | Instr::Load { name, .. }
            | Instr::BinOp { name, .. }
            | Instr::UnOp { name, .. }
            | Instr::Fun { name, .. }
            | Instr::Call { name, .. }
            | Instr::MakeClosure { name, .. }
            | Instr::Array { name, .. }
            | Instr::ArrayAccess { name, .. }
            | Instr::Field { name, .. }
            | Instr::If { name, .. } => Some(name),
            Instr::Store { .. } | Instr::Ret { .. } => None,
        }
    }

    pub fn is_function(&self) -> bool {
        matches!(self, Instr::Fun { .. })
    }
}
