//! Transform errors
//!
//! None of these are recoverable: each aborts compilation of the current
//! source unit so no partial MIR reaches code generation. The `internal`
//! kinds indicate an upstream pass bug rather than a user mistake.

use thiserror::Error;

pub type Result<T> = std::result::Result<T, TransformError>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum TransformError {
    /// A call or free-variable reference names nothing known, external,
    /// or local
    #[error("unresolved symbol: {name}")]
    UnresolvedSymbol { name: String },

    /// `self` used where no previous-value storage can exist
    #[error("invalid use of self: {context}")]
    InvalidSelf { context: String },

    /// Internal: a name expected to carry a type is absent from the type
    /// environment
    #[error("internal error: no type recorded for {name}")]
    MissingType { name: String },

    /// Internal: a function definition survived below the top level
    #[error("internal error: function {name} not hoisted to top level")]
    NestedFunction { name: String },
}
