//! Type system for Oto
//!
//! Defines the semantic type representations used throughout the compiler,
//! and the shared type environment both MIR passes mutate.

use std::collections::HashMap;
use std::fmt;

/// Unique identifier for functions (stable across passes, unlike names
/// which gain suffixed companions such as `f_cls` during conversion)
pub type FunId = u32;

/// Core type representation
#[derive(Debug, Clone, PartialEq)]
pub enum Type {
    /// Sample type (f64 at runtime)
    Float,
    /// String literal type (labels, file names)
    String,
    /// No-value type for statement-like instructions
    Unit,
    /// Function type
    Function(FunctionType),
    /// Fixed-size buffer (delay lines)
    Array { elem: Box<Type>, len: u64 },
    /// Structural aggregate (capture records, memory objects)
    Tuple(Vec<Type>),
    /// Reference wrapper (pointer at runtime)
    Ref(Box<Type>),
    /// Closure record: function pointer plus capture record pointer
    Closure {
        fun: Box<Type>,
        captures: Box<Type>,
    },
    /// Named aggregate registered in the type environment
    Alias { name: String, inner: Box<Type> },
}

/// Function type information
#[derive(Debug, Clone, PartialEq)]
pub struct FunctionType {
    /// Parameter types in declaration order
    pub params: Vec<Type>,
    /// Return type
    pub ret: Box<Type>,
}

impl FunctionType {
    pub fn new(params: Vec<Type>, ret: Type) -> Self {
        Self {
            params,
            ret: Box::new(ret),
        }
    }
}

impl Type {
    /// Shorthand for a named alias type
    pub fn alias(name: impl Into<String>, inner: Type) -> Self {
        Type::Alias {
            name: name.into(),
            inner: Box::new(inner),
        }
    }

    /// Shorthand for a reference wrapper
    pub fn reference(inner: Type) -> Self {
        Type::Ref(Box::new(inner))
    }

    /// Shorthand for a function type
    pub fn function(params: Vec<Type>, ret: Type) -> Self {
        Type::Function(FunctionType::new(params, ret))
    }

    /// Check if this type is a primitive value type
    pub fn is_primitive(&self) -> bool {
        matches!(self, Type::Float | Type::String | Type::Unit)
    }

    /// View this type as a function type, looking through aliases and
    /// references
    pub fn as_function(&self) -> Option<&FunctionType> {
        match self {
            Type::Function(f) => Some(f),
            Type::Ref(inner) => inner.as_function(),
            Type::Alias { inner, .. } => inner.as_function(),
            _ => None,
        }
    }

    /// If this type is a named closure (an alias wrapping a closure
    /// record), return the alias name and the closure's function type
    pub fn as_closure_alias(&self) -> Option<(&str, &FunctionType)> {
        match self {
            Type::Alias { name, inner } => match inner.as_ref() {
                Type::Closure { fun, .. } => fun.as_function().map(|f| (name.as_str(), f)),
                _ => None,
            },
            _ => None,
        }
    }

    /// The function type reachable through a closure alias or a plain
    /// function type; callers use this when a name may have been rewritten
    /// to a closure by conversion
    pub fn callee_function(&self) -> Option<&FunctionType> {
        if let Some((_, f)) = self.as_closure_alias() {
            return Some(f);
        }
        self.as_function()
    }

    /// Apply an in-place edit to the function type reachable through this
    /// type — either a plain function type or the function inside a
    /// closure record — and return the rebuilt type. Returns `None` when
    /// no function type is reachable.
    ///
    /// The passes use this to extend a signature with trailing capture or
    /// memory-object parameters after a name's entry may already have
    /// been rewritten to a closure alias.
    pub fn map_function(mut self, edit: impl FnOnce(&mut FunctionType)) -> Option<Type> {
        fn find(ty: &mut Type) -> Option<&mut FunctionType> {
            match ty {
                Type::Function(ft) => Some(ft),
                Type::Ref(inner) => find(inner),
                Type::Alias { inner, .. } => find(inner),
                Type::Closure { fun, .. } => find(fun),
                _ => None,
            }
        }
        edit(find(&mut self)?);
        Some(self)
    }
}

impl fmt::Display for Type {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Type::Float => write!(f, "float"),
            Type::String => write!(f, "string"),
            Type::Unit => write!(f, "unit"),
            Type::Function(ft) => {
                write!(f, "(")?;
                for (i, p) in ft.params.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", ft.ret)
            }
            Type::Array { elem, len } => write!(f, "[{}; {}]", elem, len),
            Type::Tuple(elems) => {
                write!(f, "(")?;
                for (i, e) in elems.iter().enumerate() {
                    if i > 0 {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", e)?;
                }
                write!(f, ")")
            }
            Type::Ref(inner) => write!(f, "&{}", inner),
            Type::Closure { fun, captures } => write!(f, "cls{{{}, {}}}", fun, captures),
            Type::Alias { name, .. } => write!(f, "{}", name),
        }
    }
}

/// Mutable name-to-type environment shared by every pass over one
/// compilation unit. Later passes overwrite entries as names change
/// meaning (a converted function's name resolves to its closure alias).
#[derive(Debug, Default)]
pub struct TypeEnv {
    env: HashMap<String, Type>,
}

impl TypeEnv {
    pub fn new() -> Self {
        Self::default()
    }

    /// Look up a name's current type
    pub fn lookup(&self, name: &str) -> Option<&Type> {
        self.env.get(name)
    }

    /// Insert or overwrite a name's type
    pub fn insert(&mut self, name: impl Into<String>, ty: Type) {
        self.env.insert(name.into(), ty);
    }

    /// Check whether a name is bound
    pub fn contains(&self, name: &str) -> bool {
        self.env.contains_key(name)
    }

    /// Number of bound names
    pub fn len(&self) -> usize {
        self.env.len()
    }

    pub fn is_empty(&self) -> bool {
        self.env.is_empty()
    }
}
