//! Closure conversion pass
//!
//! Eliminates lexical capture from the MIR by:
//! 1. Computing the set of free variables of every function
//! 2. Appending a capture-record parameter to each capturing function
//! 3. Emitting a `MakeClosure` record right after each capturing
//!    function's definition
//! 4. Classifying every call site as Direct / Closure / External
//! 5. Hoisting all nested function definitions to the top-level block
//!
//! A function is optimistically registered as known (directly callable)
//! before its body is scanned so that self-recursion is not mistaken for
//! a free variable. If the scan still finds free variables, the
//! registration is dropped and the body is scanned once more; the second
//! result is final. Scans never mutate the instruction list they walk:
//! `MakeClosure` insertions are collected per block and spliced in after
//! the loop, so inserted nodes are not re-visited.

use std::collections::{HashMap, HashSet};

use oto_mir::{builtins, Block, CallKind, Instr, Operand};
use oto_types::{Type, TypeEnv};

use crate::error::{Result, TransformError};

/// Converts capturing functions into top-level functions plus explicit
/// closure records, mutating the block and the type environment in place.
pub struct ClosureConverter<'a> {
    env: &'a mut TypeEnv,
    /// Functions callable directly, without a closure record
    known: HashSet<String>,
    /// Functions already given a closure record, with their capture list.
    /// Guards re-synthesis when an enclosing function's body is re-scanned.
    converted: HashMap<String, Vec<String>>,
    capture_count: u32,
    closure_count: u32,
}

impl<'a> ClosureConverter<'a> {
    pub fn new(env: &'a mut TypeEnv) -> Self {
        Self {
            env,
            known: HashSet::new(),
            converted: HashMap::new(),
            capture_count: 0,
            closure_count: 0,
        }
    }

    /// Check whether a function ended up directly callable
    pub fn is_known(&self, name: &str) -> bool {
        self.known.contains(name)
    }

    /// The set of functions callable without a closure record
    pub fn known_functions(&self) -> &HashSet<String> {
        &self.known
    }

    /// Run the pass over the top-level block
    pub fn convert(&mut self, toplevel: &mut Block) -> Result<()> {
        let mut locals = Vec::new();
        let mut frees = Vec::new();
        self.scan_block(toplevel, &mut locals, &mut frees)?;
        // nothing encloses the top level, so a leftover free name has no
        // capture to resolve into
        if let Some(name) = frees.first() {
            return Err(TransformError::UnresolvedSymbol { name: name.clone() });
        }
        self.hoist(toplevel);
        self.reclassify(toplevel);
        self.propagate_types(toplevel);
        log::trace!("after closure conversion:\n{}", toplevel);
        Ok(())
    }

    /// Record `name` as free unless it is local, external, or already
    /// recorded. A name that could never resolve anywhere is a fatal
    /// error rather than a capture.
    fn register_fv(
        &self,
        name: &str,
        locals: &[String],
        frees: &mut Vec<String>,
    ) -> Result<()> {
        if locals.iter().any(|l| l == name)
            || builtins::is_builtin(name)
            || frees.iter().any(|f| f == name)
        {
            return Ok(());
        }
        if !self.env.contains(name) {
            return Err(TransformError::UnresolvedSymbol {
                name: name.to_string(),
            });
        }
        frees.push(name.to_string());
        Ok(())
    }

    fn register_operand(
        &self,
        operand: &Operand,
        locals: &[String],
        frees: &mut Vec<String>,
    ) -> Result<()> {
        match operand {
            Operand::Var(name) => self.register_fv(name, locals, frees),
            Operand::SelfRef => Ok(()),
        }
    }

    /// Walk a block in order, growing the local set, recording free
    /// references, classifying calls, and converting nested functions.
    fn scan_block(
        &mut self,
        block: &mut Block,
        locals: &mut Vec<String>,
        frees: &mut Vec<String>,
    ) -> Result<()> {
        // pending (position, MakeClosure) insertions, applied after the loop
        let mut pending: Vec<(usize, Instr)> = Vec::new();
        for idx in 0..block.instrs.len() {
            match &mut block.instrs[idx] {
                Instr::Number { name, .. }
                | Instr::Str { name, .. }
                | Instr::Alloca { name, .. } => locals.push(name.clone()),
                Instr::Load { name, src } => {
                    self.register_operand(src, locals, frees)?;
                    locals.push(name.clone());
                }
                Instr::Store { dst, src } => {
                    // an assignment may overwrite an outer slot
                    self.register_operand(dst, locals, frees)?;
                    self.register_operand(src, locals, frees)?;
                }
                Instr::BinOp { name, lhs, rhs, .. } => {
                    self.register_operand(lhs, locals, frees)?;
                    self.register_operand(rhs, locals, frees)?;
                    locals.push(name.clone());
                }
                Instr::UnOp { name, value, .. } => {
                    self.register_operand(value, locals, frees)?;
                    locals.push(name.clone());
                }
                Instr::Array { name, elems } => {
                    for e in &*elems {
                        self.register_operand(e, locals, frees)?;
                    }
                    locals.push(name.clone());
                }
                Instr::ArrayAccess { name, array, index } => {
                    self.register_operand(array, locals, frees)?;
                    self.register_operand(index, locals, frees)?;
                    locals.push(name.clone());
                }
                Instr::Field { name, target, .. } => {
                    self.register_operand(target, locals, frees)?;
                    locals.push(name.clone());
                }
                Instr::Call {
                    name,
                    callee,
                    args,
                    kind,
                } => {
                    for a in &*args {
                        self.register_operand(a, locals, frees)?;
                    }
                    if self.known.contains(callee.as_str()) {
                        *kind = CallKind::Direct;
                    } else if builtins::is_builtin(callee) {
                        *kind = CallKind::External;
                    } else {
                        *kind = CallKind::Closure;
                        self.register_fv(callee, locals, frees)?;
                    }
                    locals.push(name.clone());
                }
                Instr::MakeClosure { .. } => {
                    // inserted by an earlier scan of this block; skip
                }
                Instr::If {
                    name,
                    cond,
                    then_blk,
                    else_blk,
                } => {
                    self.register_operand(cond, locals, frees)?;
                    let name = name.clone();
                    // branches share the enclosing function's scope
                    self.scan_block(then_blk, locals, frees)?;
                    self.scan_block(else_blk, locals, frees)?;
                    locals.push(name);
                }
                Instr::Ret { value } => self.register_operand(value, locals, frees)?,
                Instr::Fun { .. } => {
                    if let Some(makecls) = self.scan_function(&mut block.instrs[idx])? {
                        pending.push((idx, makecls));
                    }
                    // the function name is local to the enclosing scope
                    if let Some(name) = block.instrs[idx].name() {
                        locals.push(name.to_string());
                    }
                }
            }
        }
        for (idx, makecls) in pending.into_iter().rev() {
            block.instrs.insert(idx + 1, makecls);
        }
        Ok(())
    }

    /// Analyze one function definition; returns the `MakeClosure` to
    /// insert after it in the enclosing block if it captures.
    fn scan_function(&mut self, instr: &mut Instr) -> Result<Option<Instr>> {
        let Instr::Fun {
            name,
            args,
            body,
            free_vars,
            ..
        } = instr
        else {
            unreachable!("scan_function called on a non-function instruction");
        };
        let fname = name.clone();
        let was_converted = self.converted.contains_key(&fname);
        if !was_converted {
            // optimistic: a self-recursive call is not a free variable
            self.known.insert(fname.clone());
        }
        let mut inner_locals: Vec<String> = args.clone();
        let mut frees = Vec::new();
        self.scan_block(body, &mut inner_locals, &mut frees)?;
        if !frees.is_empty() && !was_converted {
            // the first scan may have leaked the optimistic registration
            // into call kinds inside the body; drop it and settle once more
            self.known.remove(&fname);
            inner_locals = args.clone();
            frees.clear();
            self.scan_block(body, &mut inner_locals, &mut frees)?;
        }
        if frees.is_empty() {
            log::debug!("{} is a known function", fname);
            return Ok(None);
        }
        *free_vars = frees.clone();
        if was_converted {
            return Ok(None);
        }
        let makecls = self.synthesize_closure(&fname, &frees)?;
        self.converted.insert(fname, frees);
        Ok(Some(makecls))
    }

    /// Build the capture and closure types for `fname`, overwrite its
    /// type environment entries, and produce its `MakeClosure`.
    fn synthesize_closure(&mut self, fname: &str, frees: &[String]) -> Result<Instr> {
        let mut fvtypes = Vec::with_capacity(frees.len());
        for fv in frees {
            let ty = self
                .env
                .lookup(fv)
                .ok_or_else(|| TransformError::MissingType { name: fv.clone() })?;
            fvtypes.push(Type::reference(ty.clone()));
        }
        let capture = Type::alias(self.fresh_capture_name(), Type::Tuple(fvtypes));
        let mut ftype = self
            .env
            .lookup(fname)
            .and_then(|t| t.as_function())
            .cloned()
            .ok_or_else(|| TransformError::MissingType {
                name: fname.to_string(),
            })?;
        ftype.params.push(Type::reference(capture.clone()));
        let cls_type = Type::alias(
            self.fresh_closure_name(),
            Type::Closure {
                fun: Box::new(Type::reference(Type::Function(ftype))),
                captures: Box::new(capture),
            },
        );
        let cls_name = format!("{}_cls", fname);
        self.env.insert(cls_name.clone(), cls_type.clone());
        // the function's own name now resolves to its closure
        self.env.insert(fname.to_string(), cls_type);
        log::debug!("{} becomes a closure capturing {:?}", fname, frees);
        Ok(Instr::MakeClosure {
            name: cls_name,
            fname: fname.to_string(),
            captures: frees.to_vec(),
        })
    }

    fn fresh_capture_name(&mut self) -> String {
        let name = format!("capture.{}", self.capture_count);
        self.capture_count += 1;
        name
    }

    fn fresh_closure_name(&mut self) -> String {
        let name = format!("closuretype.{}", self.closure_count);
        self.closure_count += 1;
        name
    }

    /// Lift every nested function definition into the front of the
    /// top-level block, innermost first, sibling order preserved.
    fn hoist(&self, toplevel: &mut Block) {
        let mut lifted = Vec::new();
        for instr in &mut toplevel.instrs {
            match instr {
                Instr::Fun { body, .. } => lifted.extend(collect_nested(body)),
                Instr::If {
                    then_blk, else_blk, ..
                } => {
                    lifted.extend(collect_nested(then_blk));
                    lifted.extend(collect_nested(else_blk));
                }
                _ => {}
            }
        }
        if !lifted.is_empty() {
            log::debug!("hoisted {} nested functions to top level", lifted.len());
            toplevel.instrs.splice(0..0, lifted);
        }
    }

    /// Re-derive every call kind from the settled known-function set.
    /// Idempotent: the collector re-reads kinds and must see the same
    /// classification the converter settled on.
    pub fn reclassify(&self, block: &mut Block) {
        for instr in &mut block.instrs {
            match instr {
                Instr::Call { callee, kind, .. } => {
                    *kind = if self.known.contains(callee.as_str()) {
                        CallKind::Direct
                    } else if builtins::is_builtin(callee) {
                        CallKind::External
                    } else {
                        CallKind::Closure
                    };
                }
                Instr::Fun { body, .. } => self.reclassify(body),
                Instr::If {
                    then_blk, else_blk, ..
                } => {
                    self.reclassify(then_blk);
                    self.reclassify(else_blk);
                }
                _ => {}
            }
        }
    }

    /// Propagate closure-ness through loads, stores, returns, and call
    /// results, so higher-order functions keep correct types after
    /// conversion.
    fn propagate_types(&mut self, block: &Block) {
        for instr in &block.instrs {
            match instr {
                Instr::Load {
                    name,
                    src: Operand::Var(src),
                } => self.propagate_name(src, name),
                Instr::Store {
                    dst: Operand::Var(dst),
                    src: Operand::Var(src),
                } => self.propagate_name(src, dst),
                Instr::Call { name, callee, .. } => {
                    if let Some(ft) = self.env.lookup(callee).and_then(|t| t.callee_function()) {
                        if ft.ret.as_closure_alias().is_some() {
                            let ret = (*ft.ret).clone();
                            self.env.insert(name.clone(), ret);
                        }
                    }
                }
                Instr::Fun { name, body, .. } => {
                    self.propagate_types(body);
                    // a function whose returned value is a closure has a
                    // closure return type
                    let ret_ty = body.instrs.iter().find_map(|i| match i {
                        Instr::Ret {
                            value: Operand::Var(v),
                        } => self
                            .env
                            .lookup(v)
                            .filter(|t| t.as_closure_alias().is_some())
                            .cloned(),
                        _ => None,
                    });
                    if let Some(ret_ty) = ret_ty {
                        self.set_return_type(name, ret_ty);
                    }
                }
                Instr::If {
                    then_blk, else_blk, ..
                } => {
                    self.propagate_types(then_blk);
                    self.propagate_types(else_blk);
                }
                _ => {}
            }
        }
    }

    /// Copy `src`'s type onto `dst` when `src` resolves to a closure alias
    fn propagate_name(&mut self, src: &str, dst: &str) {
        if let Some(ty) = self.env.lookup(src) {
            if ty.as_closure_alias().is_some() {
                let ty = ty.clone();
                self.env.insert(dst.to_string(), ty);
            }
        }
    }

    fn set_return_type(&mut self, fname: &str, ret: Type) {
        if let Some(cur) = self.env.lookup(fname).cloned() {
            if let Some(rebuilt) = cur.map_function(|ft| ft.ret = Box::new(ret)) {
                self.env.insert(fname.to_string(), rebuilt);
            }
        }
    }
}

/// Extract nested function definitions from `block`, depth first,
/// innermost first. The extracted functions' bodies contain no further
/// definitions when they are returned.
fn collect_nested(block: &mut Block) -> Vec<Instr> {
    let mut lifted = Vec::new();
    let mut kept = Vec::new();
    for mut instr in std::mem::take(&mut block.instrs) {
        match &mut instr {
            Instr::Fun { body, .. } => {
                lifted.extend(collect_nested(body));
                lifted.push(instr);
            }
            Instr::If {
                then_blk, else_blk, ..
            } => {
                lifted.extend(collect_nested(then_blk));
                lifted.extend(collect_nested(else_blk));
                kept.push(instr);
            }
            _ => kept.push(instr),
        }
    }
    block.instrs = kept;
    lifted
}
