//! Registry of external runtime symbols
//!
//! Free-variable analysis and call-site classification need to tell a
//! genuinely free name from a reference to a runtime primitive; the
//! memory-object collector needs to know which primitives carry hidden
//! per-call-site state (the unit-delay family) and what their fixed
//! storage type is.

use oto_types::Type;

/// Fixed length of the `delay` builtin's line, in samples.
///
/// Delay sizes are not tracked through SSA, so the line is allocated at
/// its maximum and the runtime masks the read offset.
pub const DELAY_LINE_LEN: u64 = 44100;

/// Names of the external math/IO primitives provided by the runtime
const PURE_BUILTINS: &[&str] = &[
    "sin", "cos", "tan", "sqrt", "abs", "pow", "min", "max", "floor", "random", "print",
    "println", "now",
];

/// Names of the stateful unit-delay primitives
const STATEFUL_BUILTINS: &[&str] = &["mem", "delay"];

/// Check whether a name refers to an external runtime symbol
pub fn is_builtin(name: &str) -> bool {
    PURE_BUILTINS.contains(&name) || STATEFUL_BUILTINS.contains(&name)
}

/// The function type a builtin is linked with, if `name` is a builtin
pub fn signature(name: &str) -> Option<Type> {
    let f = Type::Float;
    let sig = match name {
        "sin" | "cos" | "tan" | "sqrt" | "abs" | "floor" | "mem" => {
            Type::function(vec![f.clone()], f)
        }
        "pow" | "min" | "max" | "delay" => Type::function(vec![f.clone(), f.clone()], f),
        "random" | "now" => Type::function(vec![], f),
        "print" | "println" => Type::function(vec![f], Type::Unit),
        _ => return None,
    };
    Some(sig)
}

/// The fixed persistent-storage type of a stateful builtin, or `None`
/// for pure builtins and unknown names.
///
/// These are the leaf object types of the memory-object collector:
/// stateful builtins are never traversed into.
pub fn memory(name: &str) -> Option<Type> {
    match name {
        "mem" => Some(Type::Float),
        "delay" => Some(Type::Array {
            elem: Box::new(Type::Float),
            len: DELAY_LINE_LEN,
        }),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_is_builtin() {
        assert!(is_builtin("sin"));
        assert!(is_builtin("mem"));
        assert!(is_builtin("delay"));
        assert!(!is_builtin("osc"));
    }

    #[test]
    fn test_signatures_cover_registry() {
        for name in PURE_BUILTINS.iter().chain(STATEFUL_BUILTINS) {
            assert!(signature(name).is_some(), "no signature for {}", name);
        }
        assert!(signature("dsp").is_none());
    }

    #[test]
    fn test_memory_only_for_stateful() {
        assert_eq!(memory("mem"), Some(Type::Float));
        assert!(matches!(memory("delay"), Some(Type::Array { .. })));
        assert_eq!(memory("sin"), None);
    }
}
