//! Memory-object collection pass
//!
//! Runs after closure conversion. Discovers, per function, the tree of
//! persistent storage it transitively needs — because its body reads
//! `self` (its own previous return value) or calls stateful builtins or
//! other stateful functions — and materializes a single top-level
//! allocation per stateful function. The per-sample audio callback must
//! not allocate, so all storage exists for the program's whole lifetime.
//!
//! The call-graph walk is memoized by function identity: every caller of
//! a function shares one `FunObjTree`, and code generation allocates
//! exactly one slot per function. Traversal is read-only over an index
//! built up front; signature and block mutations happen in a separate
//! phase once every function has been visited.

use std::collections::{HashMap, HashSet};
use std::fmt;
use std::rc::Rc;

use oto_mir::{builtins, Block, Instr, Operand};
use oto_types::{FunId, Type, TypeEnv};

use crate::error::{Result, TransformError};

/// Per-function persistent-storage requirements.
///
/// `obj_type` is an aliased tuple of the children's object types, with
/// the function's own return type appended last iff `has_self`. Builtin
/// leaves carry their fixed storage type and no identity.
#[derive(Debug, PartialEq)]
pub struct FunObjTree {
    pub fname: String,
    /// Function identity; `None` for synthetic builtin leaves
    pub id: Option<FunId>,
    pub has_self: bool,
    pub children: Vec<Rc<FunObjTree>>,
    pub obj_type: Type,
}

impl fmt::Display for FunObjTree {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.fname)?;
        if self.has_self {
            write!(f, " [self]")?;
        }
        write!(f, " : {}", self.obj_type)?;
        if !self.children.is_empty() {
            write!(f, " <- (")?;
            for (i, c) in self.children.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", c)?;
            }
            write!(f, ")")?;
        }
        Ok(())
    }
}

/// Map from function identity to its storage tree, for code generation
pub type MemObjMap = HashMap<FunId, Rc<FunObjTree>>;

/// Aggregated storage signal of one instruction or instruction sequence
#[derive(Debug, Default)]
struct Signal {
    has_self: bool,
    children: Vec<Rc<FunObjTree>>,
    elem_types: Vec<Type>,
}

impl Signal {
    fn merge(&mut self, other: Signal) {
        self.has_self |= other.has_self;
        self.children.extend(other.children);
        self.elem_types.extend(other.elem_types);
    }
}

/// Name and position index over the top-level block's functions
struct FunIndex {
    by_name: HashMap<String, FunId>,
    pos: HashMap<FunId, usize>,
    order: Vec<FunId>,
}

impl FunIndex {
    fn build(toplevel: &Block) -> Self {
        let mut by_name = HashMap::new();
        let mut pos = HashMap::new();
        let mut order = Vec::new();
        for (i, instr) in toplevel.instrs.iter().enumerate() {
            if let Instr::Fun { id, name, .. } = instr {
                by_name.insert(name.clone(), *id);
                pos.insert(*id, i);
                order.push(*id);
            }
        }
        Self {
            by_name,
            pos,
            order,
        }
    }

    fn fun<'b>(&self, toplevel: &'b Block, id: FunId) -> (&'b str, &'b Block) {
        match &toplevel.instrs[self.pos[&id]] {
            Instr::Fun { name, body, .. } => (name, body),
            _ => unreachable!("function index points at a non-function"),
        }
    }
}

/// Collects per-function memory objects and injects their top-level
/// allocations.
pub struct MemObjCollector<'a> {
    env: &'a mut TypeEnv,
    /// Memoized traversal results; trivial results are cached too so the
    /// walk runs at most once per function identity
    memo: HashMap<FunId, Option<Rc<FunObjTree>>>,
    /// Functions on the traversal stack; re-entry contributes no storage
    in_progress: HashSet<FunId>,
    /// Shared leaf trees for the stateful builtins
    builtin_leaves: HashMap<String, Rc<FunObjTree>>,
}

impl<'a> MemObjCollector<'a> {
    pub fn new(env: &'a mut TypeEnv) -> Self {
        Self {
            env,
            memo: HashMap::new(),
            in_progress: HashSet::new(),
            builtin_leaves: HashMap::new(),
        }
    }

    /// Run the pass: traverse every top-level function, then mutate the
    /// block (memory-object arguments, top-level allocations). Returns
    /// the storage map consumed by code generation.
    pub fn process(&mut self, toplevel: &mut Block) -> Result<MemObjMap> {
        let index = FunIndex::build(toplevel);
        for &id in &index.order {
            self.traverse(&index, toplevel, id)?;
        }
        let mut allocas = Vec::new();
        let mut results = MemObjMap::new();
        for &id in &index.order {
            let Some(Some(tree)) = self.memo.get(&id) else {
                continue;
            };
            let tree = tree.clone();
            log::debug!("memory object for {}: {}", tree.fname, tree);
            let Instr::Fun { name, args, .. } = &mut toplevel.instrs[index.pos[&id]] else {
                unreachable!("function index points at a non-function");
            };
            let memname = format!("{}.mem", name);
            let slotname = format!("{}.memobj", name);
            args.push(memname.clone());
            self.env
                .insert(memname, Type::reference(tree.obj_type.clone()));
            self.env.insert(slotname.clone(), tree.obj_type.clone());
            self.append_param(&tree.fname, Type::reference(tree.obj_type.clone()))?;
            allocas.push(Instr::Alloca {
                name: slotname,
                ty: tree.obj_type.clone(),
            });
            results.insert(id, tree);
        }
        // one allocation per stateful function, alive for the whole
        // program, in definition order at the very front
        toplevel.instrs.splice(0..0, allocas);
        Ok(results)
    }

    /// Memoized call-graph walk of one function
    fn traverse(
        &mut self,
        index: &FunIndex,
        toplevel: &Block,
        id: FunId,
    ) -> Result<Option<Rc<FunObjTree>>> {
        if let Some(cached) = self.memo.get(&id) {
            return Ok(cached.clone());
        }
        if !self.in_progress.insert(id) {
            // recursive call chain; do not re-descend
            return Ok(None);
        }
        let (fname, body) = index.fun(toplevel, id);
        let fname = fname.to_string();
        let walked = self.walk_block(index, toplevel, &fname, body);
        self.in_progress.remove(&id);
        let mut signal = walked?;
        if signal.has_self {
            // the self slot is always the last element
            let ret = self
                .env
                .lookup(&fname)
                .and_then(|t| t.callee_function())
                .map(|ft| (*ft.ret).clone())
                .ok_or_else(|| TransformError::MissingType {
                    name: fname.clone(),
                })?;
            if ret == Type::Unit {
                return Err(TransformError::InvalidSelf {
                    context: format!("{} has no return value to hold", fname),
                });
            }
            signal.elem_types.push(ret);
        }
        let result = if signal.has_self || !signal.children.is_empty() {
            Some(Rc::new(FunObjTree {
                obj_type: Type::alias(format!("{}.mem", fname), Type::Tuple(signal.elem_types)),
                fname,
                id: Some(id),
                has_self: signal.has_self,
                children: signal.children,
            }))
        } else {
            None
        };
        self.memo.insert(id, result.clone());
        Ok(result)
    }

    /// Aggregate the storage signal of a block in instruction order
    fn walk_block(
        &mut self,
        index: &FunIndex,
        toplevel: &Block,
        fname: &str,
        block: &Block,
    ) -> Result<Signal> {
        let mut signal = Signal::default();
        for instr in &block.instrs {
            signal.merge(self.walk_instr(index, toplevel, fname, instr)?);
        }
        Ok(signal)
    }

    fn walk_instr(
        &mut self,
        index: &FunIndex,
        toplevel: &Block,
        fname: &str,
        instr: &Instr,
    ) -> Result<Signal> {
        let mut signal = Signal::default();
        match instr {
            Instr::Number { .. }
            | Instr::Str { .. }
            | Instr::Alloca { .. }
            | Instr::MakeClosure { .. } => {}
            Instr::Load { src, .. } => signal.has_self = src.is_self(),
            Instr::Store { dst, src } => {
                if dst.is_self() {
                    return Err(TransformError::InvalidSelf {
                        context: format!("self assigned to in {}", fname),
                    });
                }
                signal.has_self = src.is_self();
            }
            Instr::BinOp { lhs, rhs, .. } => signal.has_self = lhs.is_self() || rhs.is_self(),
            Instr::UnOp { value, .. } => signal.has_self = value.is_self(),
            Instr::Array { elems, .. } => signal.has_self = elems.iter().any(Operand::is_self),
            Instr::ArrayAccess { array, index, .. } => {
                signal.has_self = array.is_self() || index.is_self();
            }
            Instr::Field { target, .. } => signal.has_self = target.is_self(),
            Instr::Call { callee, args, .. } => {
                signal.has_self = args.iter().any(Operand::is_self);
                if let Some(leaf) = self.builtin_leaf(callee) {
                    // stateful builtins are fixed leaves, never traversed
                    signal.elem_types.push(leaf.obj_type.clone());
                    signal.children.push(leaf);
                } else if let Some(&callee_id) = index.by_name.get(callee.as_str()) {
                    if let Some(tree) = self.traverse(index, toplevel, callee_id)? {
                        signal.elem_types.push(tree.obj_type.clone());
                        signal.children.push(tree);
                    }
                }
                // closure-valued and pure external callees contribute
                // no statically known storage
            }
            Instr::If {
                cond,
                then_blk,
                else_blk,
                ..
            } => {
                signal.has_self = cond.is_self();
                signal.merge(self.walk_block(index, toplevel, fname, then_blk)?);
                signal.merge(self.walk_block(index, toplevel, fname, else_blk)?);
            }
            Instr::Ret { value } => {
                if value.is_self() {
                    return Err(TransformError::InvalidSelf {
                        context: format!("self returned directly from {}", fname),
                    });
                }
            }
            Instr::Fun { name, .. } => {
                return Err(TransformError::NestedFunction { name: name.clone() });
            }
        }
        Ok(signal)
    }

    /// Shared synthetic leaf for a stateful builtin, if `name` is one
    fn builtin_leaf(&mut self, name: &str) -> Option<Rc<FunObjTree>> {
        if let Some(leaf) = self.builtin_leaves.get(name) {
            return Some(leaf.clone());
        }
        let ty = builtins::memory(name)?;
        let leaf = Rc::new(FunObjTree {
            fname: name.to_string(),
            id: None,
            has_self: false,
            children: Vec::new(),
            obj_type: ty,
        });
        self.builtin_leaves.insert(name.to_string(), leaf.clone());
        Some(leaf)
    }

    /// Append the memory-object parameter to a function's type signature
    /// (which may already be wrapped in a closure alias)
    fn append_param(&mut self, fname: &str, param: Type) -> Result<()> {
        let ty = self
            .env
            .lookup(fname)
            .cloned()
            .ok_or_else(|| TransformError::MissingType {
                name: fname.to_string(),
            })?;
        let rebuilt =
            ty.map_function(|ft| ft.params.push(param))
                .ok_or_else(|| TransformError::MissingType {
                    name: fname.to_string(),
                })?;
        self.env.insert(fname.to_string(), rebuilt);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use oto_mir::{BinOp, MirBuilder};

    fn fun_ty(arity: usize, ret: Type) -> Type {
        Type::function(vec![Type::Float; arity], ret)
    }

    /// `f(x) { return x + self }`
    fn self_fun(b: &mut MirBuilder, env: &mut TypeEnv, name: &str) -> Instr {
        let mut body = Block::new(name);
        body.push(Instr::BinOp {
            name: format!("{}.t0", name),
            op: BinOp::Add,
            lhs: Operand::var("x"),
            rhs: Operand::SelfRef,
        });
        body.push(Instr::Ret {
            value: Operand::var(format!("{}.t0", name)),
        });
        env.insert(name, fun_ty(1, Type::Float));
        env.insert(format!("{}.t0", name), Type::Float);
        b.function(name, vec!["x".into()], body)
    }

    #[test]
    fn test_self_gets_slot_and_allocation() {
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut top = Block::new("top");
        top.push(self_fun(&mut b, &mut env, "f"));
        env.insert("x", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        assert_eq!(map.len(), 1);
        let tree = map.values().next().unwrap();
        assert!(tree.has_self);
        assert!(tree.children.is_empty());
        // object type is a one-element tuple holding the return type
        let Type::Alias { name, inner } = &tree.obj_type else {
            panic!("object type should be an alias");
        };
        assert_eq!(name, "f.mem");
        assert_eq!(**inner, Type::Tuple(vec![Type::Float]));
        // a top-level allocation comes first
        assert!(
            matches!(&top.instrs[0], Instr::Alloca { name, .. } if name == "f.memobj"),
            "allocation must be prepended"
        );
        // the function gained a trailing memory argument and parameter
        let Instr::Fun { args, .. } = &top.instrs[1] else {
            panic!("function follows the allocation");
        };
        assert_eq!(args.last().unwrap(), "f.mem");
        drop(mc);
        let ft = env.lookup("f").unwrap().as_function().unwrap();
        assert_eq!(ft.params.len(), 2);
        assert!(matches!(ft.params.last().unwrap(), Type::Ref(_)));
    }

    #[test]
    fn test_stateless_function_has_no_tree() {
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(Instr::BinOp {
            name: "t0".into(),
            op: BinOp::Mul,
            lhs: Operand::var("x"),
            rhs: Operand::var("x"),
        });
        body.push(Instr::Ret {
            value: Operand::var("t0"),
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec!["x".into()], body));
        env.insert("f", fun_ty(1, Type::Float));
        env.insert("t0", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        assert!(map.is_empty());
        assert!(!top
            .instrs
            .iter()
            .any(|i| matches!(i, Instr::Alloca { .. })));
    }

    #[test]
    fn test_stateful_builtin_is_leaf() {
        // f(x) { return mem(x) }: one child leaf, no self slot
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(MirBuilder::call("t0", "mem", vec![Operand::var("x")]));
        body.push(Instr::Ret {
            value: Operand::var("t0"),
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec!["x".into()], body));
        env.insert("f", fun_ty(1, Type::Float));
        env.insert("t0", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        let tree = map.values().next().unwrap();
        assert!(!tree.has_self);
        assert_eq!(tree.children.len(), 1);
        assert_eq!(tree.children[0].fname, "mem");
        assert_eq!(tree.children[0].obj_type, Type::Float);
        let Type::Alias { inner, .. } = &tree.obj_type else {
            panic!("object type should be an alias");
        };
        assert_eq!(**inner, Type::Tuple(vec![Type::Float]));
    }

    #[test]
    fn test_caller_wraps_callee_tree() {
        // g(x) { return f(x) } where f uses self: g's object nests f's,
        // not flattened
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut top = Block::new("top");
        top.push(self_fun(&mut b, &mut env, "f"));
        let mut g_body = Block::new("g");
        g_body.push(MirBuilder::call("g.t0", "f", vec![Operand::var("x")]));
        g_body.push(Instr::Ret {
            value: Operand::var("g.t0"),
        });
        top.push(b.function("g", vec!["x".into()], g_body));
        env.insert("g", fun_ty(1, Type::Float));
        env.insert("g.t0", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        assert_eq!(map.len(), 2);
        let g_tree = map.values().find(|t| t.fname == "g").unwrap();
        let f_tree = map.values().find(|t| t.fname == "f").unwrap();
        assert!(!g_tree.has_self);
        assert_eq!(g_tree.children.len(), 1);
        assert!(Rc::ptr_eq(&g_tree.children[0], f_tree));
        let Type::Alias { inner, .. } = &g_tree.obj_type else {
            panic!("object type should be an alias");
        };
        assert_eq!(**inner, Type::Tuple(vec![f_tree.obj_type.clone()]));
        let dump = g_tree.to_string();
        assert!(dump.starts_with("g : g.mem"));
        assert!(dump.contains("f [self]"));
    }

    #[test]
    fn test_diamond_call_graph_shares_one_tree() {
        // g and h both call f; dsp calls g and h. f's tree must be one
        // object, reference-equal from both call sites.
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut top = Block::new("top");
        top.push(self_fun(&mut b, &mut env, "f"));
        for name in ["g", "h"] {
            let mut body = Block::new(name);
            body.push(MirBuilder::call(
                format!("{}.t0", name),
                "f",
                vec![Operand::var("x")],
            ));
            body.push(Instr::Ret {
                value: Operand::var(format!("{}.t0", name)),
            });
            top.push(b.function(name, vec!["x".into()], body));
            env.insert(name, fun_ty(1, Type::Float));
            env.insert(format!("{}.t0", name), Type::Float);
        }
        let mut dsp_body = Block::new("dsp");
        dsp_body.push(MirBuilder::call("d0", "g", vec![Operand::var("x")]));
        dsp_body.push(MirBuilder::call("d1", "h", vec![Operand::var("x")]));
        dsp_body.push(Instr::BinOp {
            name: "d2".into(),
            op: BinOp::Add,
            lhs: Operand::var("d0"),
            rhs: Operand::var("d1"),
        });
        dsp_body.push(Instr::Ret {
            value: Operand::var("d2"),
        });
        top.push(b.function("dsp", vec!["x".into()], dsp_body));
        env.insert("dsp", fun_ty(1, Type::Float));
        for n in ["d0", "d1", "d2"] {
            env.insert(n, Type::Float);
        }
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        let g_tree = map.values().find(|t| t.fname == "g").unwrap();
        let h_tree = map.values().find(|t| t.fname == "h").unwrap();
        let f_tree = map.values().find(|t| t.fname == "f").unwrap();
        assert!(Rc::ptr_eq(&g_tree.children[0], f_tree));
        assert!(Rc::ptr_eq(&h_tree.children[0], f_tree));
        let dsp_tree = map.values().find(|t| t.fname == "dsp").unwrap();
        assert_eq!(dsp_tree.children.len(), 2);
        // allocations precede everything, one per stateful function,
        // in definition order
        let alloca_names: Vec<&str> = top
            .instrs
            .iter()
            .take_while(|i| matches!(i, Instr::Alloca { .. }))
            .map(|i| i.name().unwrap())
            .collect();
        assert_eq!(
            alloca_names,
            vec!["f.memobj", "g.memobj", "h.memobj", "dsp.memobj"]
        );
    }

    #[test]
    fn test_self_slot_is_last() {
        // f calls mem and uses self: object type = (mem leaf, ret) with
        // the self slot trailing
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(MirBuilder::call("t0", "mem", vec![Operand::var("x")]));
        body.push(Instr::BinOp {
            name: "t1".into(),
            op: BinOp::Add,
            lhs: Operand::var("t0"),
            rhs: Operand::SelfRef,
        });
        body.push(Instr::Ret {
            value: Operand::var("t1"),
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec!["x".into()], body));
        env.insert("f", fun_ty(1, Type::Float));
        env.insert("t0", Type::Float);
        env.insert("t1", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        let tree = map.values().next().unwrap();
        assert!(tree.has_self);
        let Type::Alias { inner, .. } = &tree.obj_type else {
            panic!("object type should be an alias");
        };
        assert_eq!(**inner, Type::Tuple(vec![Type::Float, Type::Float]));
    }

    #[test]
    fn test_return_of_self_rejected() {
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(Instr::Ret {
            value: Operand::SelfRef,
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec![], body));
        env.insert("f", fun_ty(0, Type::Float));
        let mut mc = MemObjCollector::new(&mut env);
        let err = mc.process(&mut top).unwrap_err();
        assert!(matches!(err, TransformError::InvalidSelf { .. }));
    }

    #[test]
    fn test_self_without_return_type_rejected() {
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(Instr::Load {
            name: "t0".into(),
            src: Operand::SelfRef,
        });
        body.push(Instr::Ret {
            value: Operand::var("t0"),
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec![], body));
        env.insert("f", fun_ty(0, Type::Unit));
        env.insert("t0", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let err = mc.process(&mut top).unwrap_err();
        assert!(matches!(err, TransformError::InvalidSelf { .. }));
    }

    #[test]
    fn test_recursive_function_traversed_once() {
        // f uses self and calls itself; the guard stops re-descent and
        // f still gets exactly one self slot
        let mut env = TypeEnv::new();
        let mut b = MirBuilder::new();
        let mut body = Block::new("f");
        body.push(MirBuilder::call("t0", "f", vec![Operand::var("x")]));
        body.push(Instr::BinOp {
            name: "t1".into(),
            op: BinOp::Add,
            lhs: Operand::var("t0"),
            rhs: Operand::SelfRef,
        });
        body.push(Instr::Ret {
            value: Operand::var("t1"),
        });
        let mut top = Block::new("top");
        top.push(b.function("f", vec!["x".into()], body));
        env.insert("f", fun_ty(1, Type::Float));
        env.insert("t0", Type::Float);
        env.insert("t1", Type::Float);
        let mut mc = MemObjCollector::new(&mut env);
        let map = mc.process(&mut top).unwrap();
        let tree = map.values().next().unwrap();
        assert!(tree.has_self);
        assert!(tree.children.is_empty());
        let Type::Alias { inner, .. } = &tree.obj_type else {
            panic!("object type should be an alias");
        };
        assert_eq!(**inner, Type::Tuple(vec![Type::Float]));
    }
}
