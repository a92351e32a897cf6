//! AST to host-compiled thunks.
//!
//! The emitter is a visitor over the same AST the bytecode compiler
//! consumes; lexicals map to local-variable slots instead of registers, and
//! every emitted call site performs the minimal marker check before using a
//! result. Loop thunks share one [`BlockDispatcher`] per distinct
//! visible-loop set, cached by label signature.

use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

use super::dispatch::{BlockDispatcher, Route};
use super::{Ctl, NativeFrame, NativeSub, Thunk};
use crate::ast::{
    BinaryNode, BinaryOp, BlockNode, CompileCtx, ForNode, ForeachNode, IdentNode, Node, NumLit, Sigil, StrNode,
    StrPart, SubNode, TryNode, UnaryNode, UnaryOp,
};
use crate::bytecode::compiler::{CompileOptions, collect_promotions, compile_sub_body, decorated};
use crate::bytecode::vm::flatten_slots;
use crate::capture::{Capture, free_variables};
use crate::config::Backend;
use crate::env::Environment;
use crate::error::{PerlError, PerlResult};
use crate::function::{CaptureSpec, CodeRef, Flow, Sub};
use crate::run::Interp;
use crate::value::{
    Context, List, Ref, Scalar, ScalarBinOp, ScalarRef, ScalarUnOp, Value, deref_array, deref_code, deref_hash,
    deref_scalar_slot, resolve_code,
};

/// Evaluates a sub-thunk, propagating control flow outward.
macro_rules! eval_val {
    ($thunk:expr, $interp:expr, $frame:expr) => {
        match ($thunk)($interp, $frame)? {
            Ctl::Val(value) => value,
            flow @ Ctl::Flow(_) => return Ok(flow),
        }
    };
}

#[derive(Debug, Clone)]
struct NLex {
    sigil: Sigil,
    name: Arc<str>,
    slot: usize,
    persistent: Option<Arc<str>>,
    global: Option<Arc<str>>,
}

/// Emits a script body as an executable artifact.
pub(crate) fn emit_script(
    env: &Environment,
    body: &BlockNode,
    ctx: &CompileCtx,
    opts: &CompileOptions,
) -> PerlResult<CodeRef> {
    let native = emit_sub_body(env, body, "__SCRIPT__", ctx, opts, Vec::new())?;
    Ok(Arc::new(Sub::native("__SCRIPT__", &ctx.package, native)))
}

/// Emits one subroutine body.
pub(crate) fn emit_sub_body(
    env: &Environment,
    body: &BlockNode,
    name: &str,
    ctx: &CompileCtx,
    opts: &CompileOptions,
    captures: Vec<CaptureSpec>,
) -> PerlResult<Arc<NativeSub>> {
    let mut emitter = Emitter {
        env,
        ctx: ctx.clone(),
        opts: opts.clone(),
        scopes: vec![Vec::new()],
        nslots: 0,
        loops: Vec::new(),
        dispatchers: AHashMap::new(),
        promoted: AHashSet::new(),
        promote_all: false,
        lexical_map: AHashMap::new(),
    };
    let (promoted, has_eval) = collect_promotions(body);
    emitter.promoted = promoted;
    emitter.promote_all = has_eval;

    // Capture prologue: bind persistent slots into the leading slots.
    let mut thunks: Vec<Thunk> = Vec::new();
    for capture in &captures {
        let slot = emitter.alloc_slot();
        let persistent = capture.persistent.clone();
        let sigil = capture.sigil;
        thunks.push(Arc::new(move |interp: &mut Interp, frame: &mut NativeFrame| {
            frame.slots[slot] = match sigil {
                Sigil::Array => Value::Array(interp.env().get_persistent_array(&persistent)),
                Sigil::Hash => Value::Hash(interp.env().get_persistent_hash(&persistent)),
                _ => Value::Scalar(interp.env().get_persistent_scalar(&persistent)),
            };
            Ok(Ctl::Val(Value::None))
        }));
        emitter.declare(NLex {
            sigil: capture.sigil,
            name: capture.name.clone(),
            slot,
            persistent: Some(capture.persistent.clone()),
            global: None,
        });
        emitter
            .lexical_map
            .insert(decorated(capture.sigil, &capture.name), capture.persistent.clone());
    }

    let count = body.stmts.len();
    for (index, stmt) in body.stmts.iter().enumerate() {
        let thunk = emitter.emit_stmt(stmt, index + 1 == count)?;
        thunks.push(thunk);
    }

    let body_thunk: Thunk = Arc::new(move |interp: &mut Interp, frame: &mut NativeFrame| {
        let mut last = Value::None;
        for thunk in &thunks {
            match thunk(interp, frame)? {
                Ctl::Val(value) => last = value,
                flow @ Ctl::Flow(_) => return Ok(flow),
            }
        }
        Ok(Ctl::Val(last))
    });

    Ok(Arc::new(NativeSub {
        body: body_thunk,
        nslots: emitter.nslots,
        captures,
        lexical_map: emitter.lexical_map,
        name: Arc::from(name),
    }))
}

struct Emitter<'e> {
    env: &'e Environment,
    ctx: CompileCtx,
    opts: CompileOptions,
    scopes: Vec<Vec<NLex>>,
    nslots: usize,
    loops: Vec<Option<Arc<str>>>,
    dispatchers: AHashMap<String, Arc<BlockDispatcher>>,
    promoted: AHashSet<(Sigil, Arc<str>)>,
    promote_all: bool,
    lexical_map: AHashMap<Arc<str>, Arc<str>>,
}

impl Emitter<'_> {
    fn alloc_slot(&mut self) -> usize {
        let slot = self.nslots;
        self.nslots += 1;
        slot
    }

    fn declare(&mut self, entry: NLex) {
        self.scopes.last_mut().expect("scope stack never empty").push(entry);
    }

    fn lookup(&self, sigil: Sigil, name: &str) -> Option<&NLex> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.iter().rev().find(|entry| entry.sigil == sigil && &*entry.name == name))
    }

    fn qualified(&self, name: &str) -> Arc<str> {
        self.env.normalize(name, &self.ctx.package)
    }

    fn is_promoted(&self, sigil: Sigil, name: &Arc<str>) -> bool {
        self.promote_all || self.promoted.contains(&(sigil, name.clone()))
    }

    /// The shared dispatcher for the current visible-loop configuration.
    fn dispatcher(&mut self) -> Arc<BlockDispatcher> {
        let key = BlockDispatcher::signature(&self.loops);
        if let Some(existing) = self.dispatchers.get(&key) {
            return existing.clone();
        }
        let dispatcher = Arc::new(BlockDispatcher::new(self.loops.clone()));
        self.dispatchers.insert(key, dispatcher.clone());
        dispatcher
    }

    /// Declares a `my` lexical and returns its slot plus the binding thunk.
    fn declare_my(&mut self, ident: &IdentNode) -> PerlResult<(usize, Thunk)> {
        let slot = self.alloc_slot();
        let sigil = ident.sigil;
        let persistent = if self.is_promoted(sigil, &ident.name) {
            let name: Arc<str> = Arc::from(Environment::persistent_name(self.env.fresh_begin_id(), &ident.name));
            self.lexical_map.insert(decorated(sigil, &ident.name), name.clone());
            Some(name)
        } else {
            None
        };
        self.declare(NLex {
            sigil,
            name: ident.name.clone(),
            slot,
            persistent: persistent.clone(),
            global: None,
        });
        let thunk: Thunk = match persistent {
            Some(name) => Arc::new(move |interp, frame| {
                frame.slots[slot] = match sigil {
                    Sigil::Array => Value::Array(interp.env().get_persistent_array(&name)),
                    Sigil::Hash => Value::Hash(interp.env().get_persistent_hash(&name)),
                    _ => Value::Scalar(interp.env().get_persistent_scalar(&name)),
                };
                Ok(Ctl::Val(frame.slots[slot].clone()))
            }),
            None => Arc::new(move |_, frame| {
                frame.slots[slot] = match sigil {
                    Sigil::Array => Value::Array(crate::container::ArrayRef::new()),
                    Sigil::Hash => Value::Hash(crate::container::HashRef::new()),
                    _ => Value::Scalar(ScalarRef::undef()),
                };
                Ok(Ctl::Val(frame.slots[slot].clone()))
            }),
        };
        Ok((slot, thunk))
    }

    // ------------------------------------------------------------------
    // Statements and blocks
    // ------------------------------------------------------------------

    fn emit_stmt(&mut self, node: &Node, keep_value: bool) -> PerlResult<Thunk> {
        let inner = self.emit_stmt_inner(node, keep_value)?;
        // Errors carry the innermost statement's source location; outer
        // wrappers leave an already-located error untouched.
        let file = self.ctx.file.clone();
        let line = self.ctx.line(node.pos());
        Ok(Arc::new(move |interp, frame| {
            inner(interp, frame).map_err(|error| error.with_location(file.clone(), line))
        }))
    }

    fn emit_stmt_inner(&mut self, node: &Node, keep_value: bool) -> PerlResult<Thunk> {
        match node {
            Node::Flag(_) => Ok(noop_thunk()),
            Node::Sub(sub) if sub.name.is_some() => {
                self.define_named_sub(sub)?;
                Ok(noop_thunk())
            }
            Node::If(if_node) => {
                let cond = self.emit_expr(&if_node.cond, Context::Scalar)?;
                let then_block = self.emit_block(&if_node.then_block)?;
                let else_block = match &if_node.else_branch {
                    Some(Node::Block(block)) => Some(self.emit_block(block)?),
                    Some(other) => Some(self.emit_stmt(other, false)?),
                    None => None,
                };
                Ok(Arc::new(move |interp, frame| {
                    let test = eval_val!(cond, interp, frame).scalar_value();
                    if interp.truthy(&test)? {
                        then_block(interp, frame)
                    } else if let Some(else_block) = &else_block {
                        else_block(interp, frame)
                    } else {
                        Ok(Ctl::Val(Value::None))
                    }
                }))
            }
            Node::Foreach(foreach) => self.emit_foreach(foreach, None),
            Node::For(for_node) => self.emit_for(for_node, None),
            Node::Label(label) => match &label.stmt {
                Node::Foreach(foreach) => self.emit_foreach(foreach, Some(label.name.clone())),
                Node::For(for_node) => self.emit_for(for_node, Some(label.name.clone())),
                other => self.emit_stmt(other, keep_value),
            },
            Node::Block(block) => self.emit_block(block),
            other => self.emit_expr(other, if keep_value { Context::Runtime } else { Context::Void }),
        }
    }

    fn emit_block(&mut self, block: &BlockNode) -> PerlResult<Thunk> {
        self.scopes.push(Vec::new());
        let count = block.stmts.len();
        let mut thunks = Vec::with_capacity(count);
        for (index, stmt) in block.stmts.iter().enumerate() {
            thunks.push(self.emit_stmt(stmt, index + 1 == count)?);
        }
        self.scopes.pop();
        Ok(Arc::new(move |interp, frame| {
            let mut last = Value::None;
            for thunk in &thunks {
                match thunk(interp, frame)? {
                    Ctl::Val(value) => last = value,
                    flow @ Ctl::Flow(_) => return Ok(flow),
                }
            }
            Ok(Ctl::Val(last))
        }))
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn emit_foreach(&mut self, foreach: &ForeachNode, label: Option<Arc<str>>) -> PerlResult<Thunk> {
        self.scopes.push(Vec::new());
        let list = self.emit_expr(&foreach.list, Context::List)?;

        let (var_slot, decl, copy_in) = match &foreach.var {
            Some(var) if foreach.declares_var => {
                let copy_in = self.is_promoted(var.sigil, &var.name);
                let (slot, decl) = self.declare_my(var)?;
                (slot, Some(decl), copy_in)
            }
            Some(var) => match self.lookup(var.sigil, &var.name) {
                Some(entry) => (entry.slot, None, false),
                None => (self.alloc_slot(), None, false),
            },
            None => (self.alloc_slot(), None, false),
        };

        self.loops.push(label);
        let dispatcher = self.dispatcher();
        let body = self.emit_block(&foreach.body)?;
        self.loops.pop();
        self.scopes.pop();

        Ok(Arc::new(move |interp, frame| {
            if let Some(decl) = &decl {
                match decl(interp, frame)? {
                    Ctl::Val(_) => {}
                    flow @ Ctl::Flow(_) => return Ok(flow),
                }
            }
            let source = eval_val!(list, interp, frame);
            // A named array iterates its own element slots so the loop
            // variable aliases them; any other source materializes fresh
            // slots.
            let slots = match &source {
                Value::Array(array) => array.slots(),
                other => crate::container::ArrayRef::from_list(&other.list_value()).slots(),
            };
            'iter: for element in slots {
                if copy_in {
                    if let Value::Scalar(target) = &frame.slots[var_slot] {
                        target.set(element.get());
                    }
                } else {
                    frame.slots[var_slot] = Value::Scalar(element);
                }
                let mut restart = true;
                while restart {
                    restart = false;
                    match body(interp, frame)? {
                        Ctl::Val(_) => {}
                        Ctl::Flow(flow) => match dispatcher.route(&flow) {
                            Route::Exit => break 'iter,
                            Route::Continue => {}
                            Route::Restart => restart = true,
                            Route::Propagate => return Ok(Ctl::Flow(flow)),
                        },
                    }
                }
            }
            Ok(Ctl::Val(Value::None))
        }))
    }

    fn emit_for(&mut self, for_node: &ForNode, label: Option<Arc<str>>) -> PerlResult<Thunk> {
        self.scopes.push(Vec::new());
        let init = match &for_node.init {
            Some(node) => Some(self.emit_stmt(node, false)?),
            None => None,
        };
        let cond = match &for_node.cond {
            Some(node) => Some(self.emit_expr(node, Context::Scalar)?),
            None => None,
        };

        self.loops.push(label);
        let dispatcher = self.dispatcher();
        let body = self.emit_block(&for_node.body)?;
        self.loops.pop();

        let step = match &for_node.step {
            Some(node) => Some(self.emit_stmt(node, false)?),
            None => None,
        };
        self.scopes.pop();

        Ok(Arc::new(move |interp, frame| {
            if let Some(init) = &init {
                match init(interp, frame)? {
                    Ctl::Val(_) => {}
                    flow @ Ctl::Flow(_) => return Ok(flow),
                }
            }
            'iter: loop {
                if let Some(cond) = &cond {
                    let test = eval_val!(cond, interp, frame).scalar_value();
                    if !interp.truthy(&test)? {
                        break;
                    }
                }
                let mut restart = true;
                while restart {
                    restart = false;
                    match body(interp, frame)? {
                        Ctl::Val(_) => {}
                        Ctl::Flow(flow) => match dispatcher.route(&flow) {
                            Route::Exit => break 'iter,
                            Route::Continue => {}
                            Route::Restart => restart = true,
                            Route::Propagate => return Ok(Ctl::Flow(flow)),
                        },
                    }
                }
                if let Some(step) = &step {
                    match step(interp, frame)? {
                        Ctl::Val(_) => {}
                        flow @ Ctl::Flow(_) => return Ok(flow),
                    }
                }
            }
            Ok(Ctl::Val(Value::None))
        }))
    }

    // ------------------------------------------------------------------
    // Subroutines
    // ------------------------------------------------------------------

    fn define_named_sub(&mut self, sub: &SubNode) -> PerlResult<()> {
        let name = sub.name.clone().expect("named sub");
        let code = self.emit_nested_sub(sub, &name)?;
        let qualified = self.qualified(&name);
        self.env.set_code(&qualified, code);
        Ok(())
    }

    fn emit_nested_sub(&mut self, sub: &SubNode, name: &str) -> PerlResult<CodeRef> {
        let mut captures = Vec::new();
        for Capture { sigil, name: free } in free_variables(&sub.body) {
            if let Some(entry) = self.lookup(sigil, &free) {
                let persistent = entry.persistent.clone().ok_or_else(|| {
                    PerlError::internal(format!("captured lexical {free} was not promoted to a persistent slot"))
                })?;
                captures.push(CaptureSpec {
                    sigil,
                    name: free,
                    persistent,
                });
            }
        }
        match self.opts.sub_backend {
            Some(Backend::Interpreter) => {
                let code = compile_sub_body(self.env, &sub.body, name, &self.ctx, &self.opts, captures)?;
                Ok(Arc::new(Sub::bytecode(name, &self.ctx.package, code)))
            }
            _ => {
                let native = emit_sub_body(self.env, &sub.body, name, &self.ctx, &self.opts, captures)?;
                Ok(Arc::new(Sub::native(name, &self.ctx.package, native)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn emit_expr(&mut self, node: &Node, cx: Context) -> PerlResult<Thunk> {
        match node {
            Node::Number(number) => {
                let value = match number.value {
                    NumLit::Int(v) => Scalar::Int(v),
                    NumLit::Num(v) => Scalar::Num(v),
                };
                Ok(Arc::new(move |_, _| Ok(Ctl::Val(Value::Scalar(ScalarRef::new(value.clone()))))))
            }
            Node::Str(string) => self.emit_string(string),
            Node::Ident(ident) => self.emit_ident(ident),
            Node::Unary(unary) => self.emit_unary(unary, cx),
            Node::Binary(binary) => self.emit_binary(binary, cx),
            Node::Ternary(ternary) => {
                let cond = self.emit_expr(&ternary.cond, Context::Scalar)?;
                let then_expr = self.emit_expr(&ternary.then_expr, cx)?;
                let else_expr = self.emit_expr(&ternary.else_expr, cx)?;
                Ok(Arc::new(move |interp, frame| {
                    let test = eval_val!(cond, interp, frame).scalar_value();
                    if interp.truthy(&test)? {
                        then_expr(interp, frame)
                    } else {
                        else_expr(interp, frame)
                    }
                }))
            }
            Node::List(list) => {
                let elems = self.emit_all(&list.elems)?;
                Ok(Arc::new(move |interp, frame| {
                    let mut out = List::new();
                    for thunk in &elems {
                        let value = eval_val!(thunk, interp, frame);
                        out.extend_from(&value.list_value());
                    }
                    Ok(Ctl::Val(Value::List(out)))
                }))
            }
            Node::ArrayLit(list) => {
                let elems = self.emit_all(&list.elems)?;
                Ok(Arc::new(move |interp, frame| {
                    let array = crate::container::ArrayRef::new();
                    for thunk in &elems {
                        let value = eval_val!(thunk, interp, frame);
                        for slot in flatten_slots(&value) {
                            array.push_value(slot.get());
                        }
                    }
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Ref(Ref::Array(array))))))
                }))
            }
            Node::HashLit(list) => {
                let elems = self.emit_all(&list.elems)?;
                Ok(Arc::new(move |interp, frame| {
                    let mut flat = List::new();
                    for thunk in &elems {
                        let value = eval_val!(thunk, interp, frame);
                        flat.extend_from(&value.list_value());
                    }
                    let hash = crate::container::HashRef::new();
                    hash.assign_list(&flat, interp.env().interner());
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Ref(Ref::Hash(hash))))))
                }))
            }
            Node::Sub(sub) => {
                if let Some(name) = sub.name.clone() {
                    self.define_named_sub(sub)?;
                    let qualified = self.qualified(&name);
                    Ok(Arc::new(move |interp, _| {
                        let code = interp
                            .env()
                            .resolve_function(&qualified)
                            .ok_or_else(|| PerlError::runtime(format!("Undefined subroutine &{qualified} called")))?;
                        Ok(Ctl::Val(Value::Code(code)))
                    }))
                } else {
                    let code = self.emit_nested_sub(sub, "__ANON__")?;
                    Ok(Arc::new(move |_, _| Ok(Ctl::Val(Value::Code(code.clone())))))
                }
            }
            Node::Try(try_node) => self.emit_try(try_node),
            Node::Block(block) => self.emit_block(block),
            Node::If(_) | Node::Foreach(_) | Node::For(_) | Node::Label(_) | Node::Flag(_) => {
                self.emit_stmt(node, false)
            }
        }
    }

    fn emit_all(&mut self, nodes: &[Node]) -> PerlResult<Vec<Thunk>> {
        nodes.iter().map(|node| self.emit_expr(node, Context::List)).collect()
    }

    fn emit_string(&mut self, string: &StrNode) -> PerlResult<Thunk> {
        if let [StrPart::Lit(text)] = string.parts.as_slice() {
            let text = text.clone();
            return Ok(Arc::new(move |_, _| {
                Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Str(text.clone())))))
            }));
        }
        enum Part {
            Lit(Arc<str>),
            Expr(Thunk),
        }
        let mut parts = Vec::with_capacity(string.parts.len());
        for segment in &string.parts {
            parts.push(match segment {
                StrPart::Lit(text) => Part::Lit(text.clone()),
                StrPart::Expr(expr) => Part::Expr(self.emit_expr(expr, Context::Scalar)?),
            });
        }
        Ok(Arc::new(move |interp, frame| {
            let mut out = String::new();
            for part in &parts {
                match part {
                    Part::Lit(text) => out.push_str(text),
                    Part::Expr(thunk) => {
                        let value = eval_val!(thunk, interp, frame).scalar_value();
                        out.push_str(&interp.stringify(&value)?);
                    }
                }
            }
            Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::from_string(out)))))
        }))
    }

    fn emit_ident(&mut self, ident: &IdentNode) -> PerlResult<Thunk> {
        match ident.sigil {
            Sigil::Scalar => {
                if let Some(entry) = self.lookup(Sigil::Scalar, &ident.name) {
                    if let Some(global) = entry.global.clone() {
                        return Ok(global_scalar_thunk(global));
                    }
                    let slot = entry.slot;
                    return Ok(Arc::new(move |_, frame| Ok(Ctl::Val(frame.slots[slot].clone()))));
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Scalar, &ident.name)) {
                    let persistent = persistent.clone();
                    return Ok(Arc::new(move |interp, _| {
                        Ok(Ctl::Val(Value::Scalar(interp.env().get_persistent_scalar(&persistent))))
                    }));
                }
                Ok(global_scalar_thunk(self.qualified(&ident.name)))
            }
            Sigil::Array => {
                if &*ident.name == "_" {
                    return Ok(Arc::new(|_, frame| Ok(Ctl::Val(Value::Array(frame.args.clone())))));
                }
                if let Some(entry) = self.lookup(Sigil::Array, &ident.name) {
                    if entry.global.is_none() {
                        let slot = entry.slot;
                        return Ok(Arc::new(move |_, frame| Ok(Ctl::Val(frame.slots[slot].clone()))));
                    }
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Array, &ident.name)) {
                    let persistent = persistent.clone();
                    return Ok(Arc::new(move |interp, _| {
                        Ok(Ctl::Val(Value::Array(interp.env().get_persistent_array(&persistent))))
                    }));
                }
                let name = self.qualified(&ident.name);
                Ok(Arc::new(move |interp, _| {
                    Ok(Ctl::Val(Value::Array(interp.env().get_array(&name))))
                }))
            }
            Sigil::Hash => {
                if let Some(entry) = self.lookup(Sigil::Hash, &ident.name) {
                    if entry.global.is_none() {
                        let slot = entry.slot;
                        return Ok(Arc::new(move |_, frame| Ok(Ctl::Val(frame.slots[slot].clone()))));
                    }
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Hash, &ident.name)) {
                    let persistent = persistent.clone();
                    return Ok(Arc::new(move |interp, _| {
                        Ok(Ctl::Val(Value::Hash(interp.env().get_persistent_hash(&persistent))))
                    }));
                }
                let name = self.qualified(&ident.name);
                Ok(Arc::new(move |interp, _| {
                    Ok(Ctl::Val(Value::Hash(interp.env().get_hash(&name))))
                }))
            }
            Sigil::Code | Sigil::Bare => {
                let name = self.qualified(&ident.name);
                Ok(Arc::new(move |interp, _| {
                    let code = interp
                        .env()
                        .resolve_function(&name)
                        .ok_or_else(|| PerlError::runtime(format!("Undefined subroutine &{name} called")))?;
                    Ok(Ctl::Val(Value::Code(code)))
                }))
            }
        }
    }

    fn emit_unary(&mut self, unary: &UnaryNode, cx: Context) -> PerlResult<Thunk> {
        let operand = unary.operand.as_ref();
        match &unary.op {
            UnaryOp::Neg | UnaryOp::Not | UnaryOp::Abs | UnaryOp::Int | UnaryOp::Sqrt | UnaryOp::Log
            | UnaryOp::Exp | UnaryOp::Chr | UnaryOp::Ord | UnaryOp::Uc | UnaryOp::Lc | UnaryOp::Length => {
                let kind = match unary.op {
                    UnaryOp::Neg => ScalarUnOp::Negate,
                    UnaryOp::Not => ScalarUnOp::Not,
                    UnaryOp::Abs => ScalarUnOp::Abs,
                    UnaryOp::Int => ScalarUnOp::Int,
                    UnaryOp::Sqrt => ScalarUnOp::Sqrt,
                    UnaryOp::Log => ScalarUnOp::Log,
                    UnaryOp::Exp => ScalarUnOp::Exp,
                    UnaryOp::Chr => ScalarUnOp::Chr,
                    UnaryOp::Ord => ScalarUnOp::Ord,
                    UnaryOp::Uc => ScalarUnOp::Uc,
                    UnaryOp::Lc => ScalarUnOp::Lc,
                    _ => ScalarUnOp::Length,
                };
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    let result = interp.un_op(kind, &value)?;
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
            UnaryOp::Defined => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    let defined = match value {
                        Scalar::Undef => false,
                        Scalar::Weak(weak) => !weak.upgrade().is_undef(),
                        _ => true,
                    };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::from_bool(defined)))))
                }))
            }
            UnaryOp::MakeRef => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame);
                    let handle = match &value {
                        Value::Scalar(slot) => Ref::Scalar(slot.clone()),
                        Value::Array(array) => Ref::Array(array.clone()),
                        Value::Hash(hash) => Ref::Hash(hash.clone()),
                        Value::Code(code) => Ref::Code(code.clone()),
                        Value::List(list) => Ref::Array(crate::container::ArrayRef::from_list(list)),
                        other => {
                            return Err(PerlError::internal(format!(
                                "cannot take a reference to {}",
                                other.kind_name()
                            )));
                        }
                    };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Ref(handle)))))
                }))
            }
            UnaryOp::DerefScalar => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    Ok(Ctl::Val(Value::Scalar(deref_scalar_slot(&value)?)))
                }))
            }
            UnaryOp::DerefArray => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame);
                    if let Value::Array(array) = &value {
                        return Ok(Ctl::Val(Value::Array(array.clone())));
                    }
                    Ok(Ctl::Val(Value::Array(deref_array(&value.scalar_value())?)))
                }))
            }
            UnaryOp::DerefHash => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame);
                    if let Value::Hash(hash) = &value {
                        return Ok(Ctl::Val(Value::Hash(hash.clone())));
                    }
                    Ok(Ctl::Val(Value::Hash(deref_hash(&value.scalar_value())?)))
                }))
            }
            UnaryOp::DerefCode => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    Ok(Ctl::Val(Value::Code(deref_code(&value)?)))
                }))
            }
            UnaryOp::RefType => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    let name: Arc<str> = match &value {
                        Scalar::Ref(handle) => match handle.blessed() {
                            Some(class) => interp.env().interner().name(class),
                            None => handle.type_str().into(),
                        },
                        Scalar::Code(_) => "CODE".into(),
                        _ => "".into(),
                    };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Str(name)))))
                }))
            }
            UnaryOp::My => match operand {
                Some(Node::Ident(ident)) => {
                    let (_, decl) = self.declare_my(ident)?;
                    Ok(decl)
                }
                Some(Node::List(list)) => {
                    let mut decls = Vec::new();
                    for elem in &list.elems {
                        match elem {
                            Node::Ident(ident) => decls.push(self.declare_my(ident)?.1),
                            other => {
                                return Err(PerlError::compile("my list must contain variables", other.pos()));
                            }
                        }
                    }
                    Ok(Arc::new(move |interp, frame| {
                        for decl in &decls {
                            match decl(interp, frame)? {
                                Ctl::Val(_) => {}
                                flow @ Ctl::Flow(_) => return Ok(flow),
                            }
                        }
                        Ok(Ctl::Val(Value::None))
                    }))
                }
                _ => Err(PerlError::compile("my requires a variable", unary.pos)),
            },
            UnaryOp::Our => match operand {
                Some(Node::Ident(ident)) => {
                    let qualified = self.qualified(&ident.name);
                    let slot = self.alloc_slot();
                    self.declare(NLex {
                        sigil: ident.sigil,
                        name: ident.name.clone(),
                        slot,
                        persistent: None,
                        global: Some(qualified),
                    });
                    Ok(noop_thunk())
                }
                _ => Err(PerlError::compile("our requires a variable", unary.pos)),
            },
            UnaryOp::Local => match operand {
                Some(Node::Ident(ident)) if ident.sigil == Sigil::Scalar => {
                    let name = self.qualified(&ident.name);
                    Ok(Arc::new(move |interp, frame| {
                        let slot = interp.env().get_scalar(&name);
                        frame.saved_locals.push((name.clone(), slot.get()));
                        Ok(Ctl::Val(Value::Scalar(slot)))
                    }))
                }
                _ => Err(PerlError::compile("local requires a global scalar", unary.pos)),
            },
            UnaryOp::Return => match operand {
                Some(node) => {
                    let value = self.emit_expr(node, Context::Runtime)?;
                    Ok(Arc::new(move |interp, frame| {
                        let result = eval_val!(value, interp, frame);
                        Ok(Ctl::Flow(Flow::Ret(result.list_value())))
                    }))
                }
                None => Ok(Arc::new(|_, _| Ok(Ctl::Flow(Flow::empty())))),
            },
            UnaryOp::Wantarray => Ok(Arc::new(|_, frame| {
                let value = match frame.cx {
                    Context::List => Scalar::Int(1),
                    Context::Scalar => Scalar::from_str_slice(""),
                    _ => Scalar::Undef,
                };
                Ok(Ctl::Val(Value::Scalar(ScalarRef::new(value))))
            })),
            UnaryOp::Last | UnaryOp::Next | UnaryOp::Redo => {
                let label = match operand {
                    Some(Node::Ident(ident)) if ident.sigil == Sigil::Bare => Some(ident.name.clone()),
                    _ => None,
                };
                let pos = unary.pos;
                let op = unary.op.clone();
                Ok(Arc::new(move |_, _| {
                    let marker = match op {
                        UnaryOp::Last => Flow::Last {
                            label: label.clone(),
                            pos,
                        },
                        UnaryOp::Next => Flow::Next {
                            label: label.clone(),
                            pos,
                        },
                        _ => Flow::Redo {
                            label: label.clone(),
                            pos,
                        },
                    };
                    Ok(Ctl::Flow(marker))
                }))
            }
            UnaryOp::Goto => {
                let (callee, args) = match operand {
                    Some(Node::List(list)) if !list.elems.is_empty() => {
                        let callee = self.emit_expr(&list.elems[0], Context::Scalar)?;
                        let args = if list.elems.len() > 1 {
                            Some(self.emit_all(&list.elems[1..])?)
                        } else {
                            None
                        };
                        (callee, args)
                    }
                    Some(node) => (self.emit_expr(node, Context::Scalar)?, None),
                    None => return Err(PerlError::compile("goto requires a subroutine", unary.pos)),
                };
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(callee, interp, frame);
                    let code = resolve_code(&target)?;
                    let new_args = match &args {
                        None => frame.args.clone(),
                        Some(thunks) => {
                            let array = crate::container::ArrayRef::new();
                            for thunk in thunks {
                                let value = eval_val!(thunk, interp, frame);
                                for slot in flatten_slots(&value) {
                                    array.push_slot(slot);
                                }
                            }
                            array
                        }
                    };
                    Ok(Ctl::Flow(Flow::TailCall {
                        code,
                        args: new_args,
                    }))
                }))
            }
            UnaryOp::EvalStr => {
                let src = self.emit_operand(operand, unary)?;
                let lexicals = Arc::new(self.lexical_map.clone());
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    let source = interp.stringify(&value)?;
                    let cx = if frame.cx == Context::Runtime { Context::List } else { frame.cx };
                    let result = interp.eval_string(&source, &lexicals, cx)?;
                    Ok(Ctl::Val(Value::List(result)))
                }))
            }
            UnaryOp::Die => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    let value = if value.is_undef() { Scalar::from_str_slice("Died") } else { value };
                    Err(PerlError::die_value(value))
                }))
            }
            UnaryOp::Warn => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    let mut text = interp.stringify(&value)?.to_string();
                    if !text.ends_with('\n') {
                        text.push('\n');
                    }
                    interp.write_err(&text);
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Int(1)))))
                }))
            }
            UnaryOp::Pop | UnaryOp::Shift => {
                let array = match operand {
                    Some(node) => Some(self.emit_array_operand(node)?),
                    None => None,
                };
                let take_last = unary.op == UnaryOp::Pop;
                Ok(Arc::new(move |interp, frame| {
                    let target = match &array {
                        Some(thunk) => {
                            let value = eval_val!(thunk, interp, frame);
                            value.expect_array()?.clone()
                        }
                        None => frame.args.clone(),
                    };
                    let value = if take_last { target.pop() } else { target.shift() };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(value))))
                }))
            }
            UnaryOp::Keys | UnaryOp::Values => {
                let hash = self.emit_hash_operand(operand.ok_or_else(|| {
                    PerlError::compile("keys/values require a hash", unary.pos)
                })?)?;
                let keys = unary.op == UnaryOp::Keys;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(hash, interp, frame);
                    let hash = value.expect_hash()?;
                    let list = if keys { hash.keys() } else { hash.values() };
                    Ok(Ctl::Val(Value::List(list)))
                }))
            }
            UnaryOp::ScalarCtx => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame).scalar_value();
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(value))))
                }))
            }
            UnaryOp::Delete | UnaryOp::Exists => {
                let Some(Node::Binary(elem)) = operand else {
                    return Err(PerlError::compile("delete/exists require a hash element", unary.pos));
                };
                if elem.op != BinaryOp::ElemHash {
                    return Err(PerlError::compile("delete/exists require a hash element", elem.pos));
                }
                let hash = self.emit_hash_operand(&elem.lhs)?;
                let key = self.emit_expr(&elem.rhs, Context::Scalar)?;
                let remove = unary.op == UnaryOp::Delete;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(hash, interp, frame);
                    let target = target.expect_hash()?.clone();
                    let key_value = eval_val!(key, interp, frame).scalar_value();
                    let key = interp.stringify(&key_value)?;
                    let result = if remove {
                        target.delete(&key)
                    } else {
                        Scalar::from_bool(target.exists(&key))
                    };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
            UnaryOp::Splice => {
                let Some(Node::List(args)) = operand else {
                    return Err(PerlError::compile("splice requires an argument list", unary.pos));
                };
                if args.elems.is_empty() {
                    return Err(PerlError::compile("splice requires an array", unary.pos));
                }
                let array = self.emit_array_operand(&args.elems[0])?;
                let offset = match args.elems.get(1) {
                    Some(node) => Some(self.emit_expr(node, Context::Scalar)?),
                    None => None,
                };
                let length = match args.elems.get(2) {
                    Some(node) => Some(self.emit_expr(node, Context::Scalar)?),
                    None => None,
                };
                let replacement = if args.elems.len() > 3 {
                    Some(self.emit_all(&args.elems[3..])?)
                } else {
                    None
                };
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(array, interp, frame);
                    let target = target.expect_array()?.clone();
                    let at = match &offset {
                        Some(thunk) => eval_val!(thunk, interp, frame).scalar_value().as_int(),
                        None => 0,
                    };
                    let len = match &length {
                        Some(thunk) => {
                            let value = eval_val!(thunk, interp, frame).scalar_value();
                            if value.is_undef() { None } else { Some(value.as_int()) }
                        }
                        None => None,
                    };
                    let mut values = List::new();
                    if let Some(thunks) = &replacement {
                        for thunk in thunks {
                            let value = eval_val!(thunk, interp, frame);
                            values.extend_from(&value.list_value());
                        }
                    }
                    Ok(Ctl::Val(Value::List(target.splice(at, len, &values))))
                }))
            }
            UnaryOp::Weaken => {
                let src = self.emit_operand(operand, unary)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame);
                    let slot = value.expect_scalar()?;
                    let weakened = match slot.get() {
                        Scalar::Ref(Ref::Scalar(target)) => Scalar::Weak(target.downgrade()),
                        Scalar::Ref(Ref::Array(array)) => Scalar::Weak(array.downgrade()),
                        Scalar::Ref(Ref::Hash(hash)) => Scalar::Weak(hash.downgrade()),
                        Scalar::Weak(existing) => Scalar::Weak(existing),
                        _ => return Err(PerlError::runtime("Can't weaken a nonreference")),
                    };
                    slot.set(weakened);
                    Ok(Ctl::Val(Value::None))
                }))
            }
            UnaryOp::PreInc | UnaryOp::PreDec | UnaryOp::PostInc | UnaryOp::PostDec => {
                let node = operand.ok_or_else(|| PerlError::compile("lvalue required", unary.pos))?;
                let lvalue = self.emit_lvalue(node)?;
                let delta: i64 = if matches!(unary.op, UnaryOp::PreInc | UnaryOp::PostInc) { 1 } else { -1 };
                let post = matches!(unary.op, UnaryOp::PostInc | UnaryOp::PostDec);
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(lvalue, interp, frame);
                    let slot = value.expect_scalar()?;
                    let old = slot.get();
                    let stepped = interp.bin_op(ScalarBinOp::Add, &old, &Scalar::Int(delta))?;
                    slot.set(stepped);
                    let result = if post { old } else { slot.get() };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
        }
    }

    fn emit_operand(&mut self, operand: Option<&Node>, unary: &UnaryNode) -> PerlResult<Thunk> {
        match operand {
            Some(node) => self.emit_expr(node, Context::Scalar),
            None => Err(PerlError::compile("operator requires an operand", unary.pos)),
        }
    }

    /// Emits an lvalue expression evaluating to the scalar slot.
    fn emit_lvalue(&mut self, node: &Node) -> PerlResult<Thunk> {
        match node {
            Node::Ident(ident) if ident.sigil == Sigil::Scalar => self.emit_ident(ident),
            Node::Unary(inner) if inner.op == UnaryOp::My => match &inner.operand {
                Some(Node::Ident(ident)) => Ok(self.declare_my(ident)?.1),
                _ => Err(PerlError::compile("my requires a variable", inner.pos)),
            },
            Node::Unary(inner) if inner.op == UnaryOp::DerefScalar => self.emit_unary(inner, Context::Scalar),
            Node::Binary(binary) if matches!(binary.op, BinaryOp::ElemArray | BinaryOp::ElemHash) => {
                self.emit_binary(binary, Context::Scalar)
            }
            other => Err(PerlError::compile("not an lvalue", other.pos())),
        }
    }

    fn emit_array_operand(&mut self, node: &Node) -> PerlResult<Thunk> {
        match node {
            Node::Ident(ident) if ident.sigil == Sigil::Array => self.emit_ident(ident),
            Node::Unary(unary) if unary.op == UnaryOp::DerefArray => self.emit_unary(unary, Context::List),
            other => {
                let src = self.emit_expr(other, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame);
                    if let Value::Array(array) = &value {
                        return Ok(Ctl::Val(Value::Array(array.clone())));
                    }
                    Ok(Ctl::Val(Value::Array(deref_array(&value.scalar_value())?)))
                }))
            }
        }
    }

    fn emit_hash_operand(&mut self, node: &Node) -> PerlResult<Thunk> {
        match node {
            Node::Ident(ident) if ident.sigil == Sigil::Hash => self.emit_ident(ident),
            Node::Unary(unary) if unary.op == UnaryOp::DerefHash => self.emit_unary(unary, Context::Scalar),
            other => {
                let src = self.emit_expr(other, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let value = eval_val!(src, interp, frame);
                    if let Value::Hash(hash) = &value {
                        return Ok(Ctl::Val(Value::Hash(hash.clone())));
                    }
                    Ok(Ctl::Val(Value::Hash(deref_hash(&value.scalar_value())?)))
                }))
            }
        }
    }

    fn emit_binary(&mut self, binary: &BinaryNode, cx: Context) -> PerlResult<Thunk> {
        match &binary.op {
            BinaryOp::Assign => self.emit_assign(&binary.lhs, &binary.rhs),
            BinaryOp::AddAssign
            | BinaryOp::SubtractAssign
            | BinaryOp::MultiplyAssign
            | BinaryOp::DivideAssign
            | BinaryOp::ConcatAssign => {
                let kind = match binary.op {
                    BinaryOp::AddAssign => ScalarBinOp::Add,
                    BinaryOp::SubtractAssign => ScalarBinOp::Subtract,
                    BinaryOp::MultiplyAssign => ScalarBinOp::Multiply,
                    BinaryOp::DivideAssign => ScalarBinOp::Divide,
                    _ => ScalarBinOp::Concat,
                };
                let lvalue = self.emit_lvalue(&binary.lhs)?;
                let rhs = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(lvalue, interp, frame);
                    let slot = target.expect_scalar()?.clone();
                    let addend = eval_val!(rhs, interp, frame).scalar_value();
                    let current = slot.get();
                    let result = interp.bin_op(kind, &current, &addend)?;
                    slot.set(result);
                    Ok(Ctl::Val(Value::Scalar(slot)))
                }))
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::DefinedOr => {
                let op = binary.op.clone();
                let lhs = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let rhs = self.emit_expr(&binary.rhs, cx)?;
                Ok(Arc::new(move |interp, frame| {
                    let left = eval_val!(lhs, interp, frame);
                    let scalar = left.scalar_value();
                    let short_circuit = match op {
                        BinaryOp::And => !interp.truthy(&scalar)?,
                        BinaryOp::Or => interp.truthy(&scalar)?,
                        _ => !scalar.is_undef(),
                    };
                    if short_circuit {
                        Ok(Ctl::Val(left))
                    } else {
                        rhs(interp, frame)
                    }
                }))
            }
            BinaryOp::Call => self.emit_call(&binary.lhs, &binary.rhs, cx),
            BinaryOp::MethodCall(name) => {
                let name = name.clone();
                let invocant = match &binary.lhs {
                    Node::Ident(ident) if ident.sigil == Sigil::Bare => {
                        let text = ident.name.clone();
                        let thunk: Thunk = Arc::new(move |_, _| {
                            Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Str(text.clone())))))
                        });
                        thunk
                    }
                    other => self.emit_expr(other, Context::Scalar)?,
                };
                let args = self.emit_args(&binary.rhs)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(invocant, interp, frame).scalar_value();
                    let array = crate::container::ArrayRef::new();
                    for thunk in &args {
                        let value = eval_val!(thunk, interp, frame);
                        for slot in flatten_slots(&value) {
                            array.push_slot(slot);
                        }
                    }
                    let cx = if frame.cx == Context::Runtime { Context::List } else { frame.cx };
                    match interp.call_method(&target, &name, &array, cx)? {
                        Flow::Ret(list) => Ok(Ctl::Val(Value::List(list))),
                        marker => Ok(Ctl::Flow(marker)),
                    }
                }))
            }
            BinaryOp::ElemArray => {
                let array = self.emit_array_operand(&binary.lhs)?;
                let index = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(array, interp, frame);
                    let target = target.expect_array()?.clone();
                    let at = eval_val!(index, interp, frame).scalar_value().as_int();
                    Ok(Ctl::Val(Value::Scalar(target.slot(at))))
                }))
            }
            BinaryOp::ElemHash => {
                let hash = self.emit_hash_operand(&binary.lhs)?;
                let key = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(hash, interp, frame);
                    let target = target.expect_hash()?.clone();
                    let key_value = eval_val!(key, interp, frame).scalar_value();
                    let key = interp.stringify(&key_value)?;
                    Ok(Ctl::Val(Value::Scalar(target.slot(&key))))
                }))
            }
            BinaryOp::Push | BinaryOp::Unshift => {
                let array = self.emit_array_operand(&binary.lhs)?;
                let values = self.emit_expr(&binary.rhs, Context::List)?;
                let push_back = binary.op == BinaryOp::Push;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(array, interp, frame);
                    let target = target.expect_array()?.clone();
                    let value = eval_val!(values, interp, frame);
                    let slots = flatten_slots(&value);
                    if push_back {
                        for slot in slots {
                            target.push_slot(slot);
                        }
                    } else {
                        target.unshift_slots(slots);
                    }
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Int(target.len() as i64)))))
                }))
            }
            BinaryOp::Join => {
                let sep = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let values = self.emit_expr(&binary.rhs, Context::List)?;
                Ok(Arc::new(move |interp, frame| {
                    let sep_value = eval_val!(sep, interp, frame).scalar_value();
                    let separator = interp.stringify(&sep_value)?;
                    let list = eval_val!(values, interp, frame).list_value();
                    let mut parts = Vec::with_capacity(list.len());
                    for value in list.values() {
                        parts.push(interp.stringify(value)?.to_string());
                    }
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::from_string(
                        parts.join(&separator),
                    )))))
                }))
            }
            BinaryOp::StrIndex => {
                let haystack = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let needle = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let hay_value = eval_val!(haystack, interp, frame).scalar_value();
                    let needle_value = eval_val!(needle, interp, frame).scalar_value();
                    let hay = interp.stringify(&hay_value)?;
                    let sub = interp.stringify(&needle_value)?;
                    let result = match hay.find(&*sub) {
                        Some(byte_offset) => hay[..byte_offset].chars().count() as i64,
                        None => -1,
                    };
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(Scalar::Int(result)))))
                }))
            }
            BinaryOp::Bless => {
                let reference = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let class = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(reference, interp, frame).scalar_value();
                    let class_value = eval_val!(class, interp, frame).scalar_value();
                    let class_name = interp.stringify(&class_value)?;
                    let class = interp.env().class_id(&class_name);
                    let overloaded = interp.env().classes().has_overloads(class);
                    match &target {
                        Scalar::Ref(Ref::Array(array)) => array.bless(class, overloaded),
                        Scalar::Ref(Ref::Hash(hash)) => hash.bless(class, overloaded),
                        Scalar::Ref(_) => {
                            return Err(PerlError::runtime("Can only bless ARRAY or HASH references"));
                        }
                        _ => return Err(PerlError::runtime("Can't bless non-reference value")),
                    }
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(target))))
                }))
            }
            BinaryOp::Substr => {
                let string = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let (offset, length) = match &binary.rhs {
                    Node::List(list) if !list.elems.is_empty() => {
                        let offset = self.emit_expr(&list.elems[0], Context::Scalar)?;
                        let length = match list.elems.get(1) {
                            Some(node) => Some(self.emit_expr(node, Context::Scalar)?),
                            None => None,
                        };
                        (offset, length)
                    }
                    other => (self.emit_expr(other, Context::Scalar)?, None),
                };
                Ok(Arc::new(move |interp, frame| {
                    let text = eval_val!(string, interp, frame).scalar_value();
                    let at = eval_val!(offset, interp, frame).scalar_value().as_int();
                    let len = match &length {
                        Some(thunk) => Some(eval_val!(thunk, interp, frame).scalar_value().as_int()),
                        None => None,
                    };
                    let result = crate::value::substr_plain(&text, at, len, interp.env().interner())?;
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
            BinaryOp::ArraySlice => {
                let array = self.emit_array_operand(&binary.lhs)?;
                let indices = self.emit_expr(&binary.rhs, Context::List)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(array, interp, frame);
                    let target = target.expect_array()?.clone();
                    let picks = eval_val!(indices, interp, frame).list_value();
                    Ok(Ctl::Val(Value::List(target.slice(&picks))))
                }))
            }
            BinaryOp::HashSlice => {
                let hash = self.emit_hash_operand(&binary.lhs)?;
                let keys = self.emit_expr(&binary.rhs, Context::List)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(hash, interp, frame);
                    let target = target.expect_hash()?.clone();
                    let picks = eval_val!(keys, interp, frame).list_value();
                    Ok(Ctl::Val(Value::List(target.slice(&picks, interp.env().interner()))))
                }))
            }
            BinaryOp::Range => {
                let lo = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let hi = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let from = eval_val!(lo, interp, frame).scalar_value().as_int();
                    let to = eval_val!(hi, interp, frame).scalar_value().as_int();
                    let mut list = List::new();
                    let mut current = from;
                    while current <= to {
                        list.push(Scalar::Int(current));
                        current += 1;
                    }
                    Ok(Ctl::Val(Value::List(list)))
                }))
            }
            op => {
                let kind = scalar_bin_kind(op)
                    .ok_or_else(|| PerlError::compile(format!("unsupported binary operator {op:?}"), binary.pos))?;
                let lhs = self.emit_expr(&binary.lhs, Context::Scalar)?;
                let rhs = self.emit_expr(&binary.rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let left = eval_val!(lhs, interp, frame).scalar_value();
                    let right = eval_val!(rhs, interp, frame).scalar_value();
                    let result = interp.bin_op(kind, &left, &right)?;
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
        }
    }

    fn emit_args(&mut self, args: &Node) -> PerlResult<Vec<Thunk>> {
        match args {
            Node::List(list) => self.emit_all(&list.elems),
            other => Ok(vec![self.emit_expr(other, Context::List)?]),
        }
    }

    fn emit_call(&mut self, callee: &Node, args: &Node, cx: Context) -> PerlResult<Thunk> {
        let callee = match callee {
            Node::Ident(ident) if matches!(ident.sigil, Sigil::Bare | Sigil::Code) => {
                let name = self.qualified(&ident.name);
                let thunk: Thunk = Arc::new(move |interp, _| {
                    let code = interp
                        .env()
                        .resolve_function(&name)
                        .ok_or_else(|| PerlError::runtime(format!("Undefined subroutine &{name} called")))?;
                    Ok(Ctl::Val(Value::Code(code)))
                });
                thunk
            }
            other => self.emit_expr(other, Context::Scalar)?,
        };
        let args = self.emit_args(args)?;
        Ok(Arc::new(move |interp, frame| {
            let target = eval_val!(callee, interp, frame);
            let code = resolve_code(&target)?;
            let array = crate::container::ArrayRef::new();
            for thunk in &args {
                let value = eval_val!(thunk, interp, frame);
                for slot in flatten_slots(&value) {
                    array.push_slot(slot);
                }
            }
            let cx = if cx == Context::Runtime { frame.cx } else { cx };
            // The call-site marker check: a normal return yields a value;
            // anything else threads toward the enclosing dispatcher.
            match interp.apply(&code, array, cx)? {
                Flow::Ret(list) => Ok(Ctl::Val(Value::List(list))),
                marker => Ok(Ctl::Flow(marker)),
            }
        }))
    }

    fn emit_assign(&mut self, lhs: &Node, rhs: &Node) -> PerlResult<Thunk> {
        match lhs {
            Node::Unary(unary) if unary.op == UnaryOp::My => match &unary.operand {
                Some(Node::Ident(ident)) => {
                    let sigil = ident.sigil;
                    let (_, decl) = self.declare_my(ident)?;
                    let value = self.emit_expr(
                        rhs,
                        if sigil == Sigil::Scalar { Context::Scalar } else { Context::List },
                    )?;
                    Ok(Arc::new(move |interp, frame| {
                        let target = match decl(interp, frame)? {
                            Ctl::Val(target) => target,
                            flow @ Ctl::Flow(_) => return Ok(flow),
                        };
                        let result = eval_val!(value, interp, frame);
                        assign_into(interp, &target, &result)?;
                        Ok(Ctl::Val(target))
                    }))
                }
                Some(Node::List(targets)) => {
                    let mut decls = Vec::new();
                    let mut sigils = Vec::new();
                    for target in &targets.elems {
                        match target {
                            Node::Ident(ident) => {
                                sigils.push(ident.sigil);
                                decls.push(self.declare_my(ident)?.1);
                            }
                            other => {
                                return Err(PerlError::compile("my list must contain variables", other.pos()));
                            }
                        }
                    }
                    let value = self.emit_expr(rhs, Context::List)?;
                    Ok(Arc::new(move |interp, frame| {
                        let list = eval_val!(value, interp, frame).list_value();
                        let mut position = 0usize;
                        for (decl, sigil) in decls.iter().zip(&sigils) {
                            let target = match decl(interp, frame)? {
                                Ctl::Val(target) => target,
                                flow @ Ctl::Flow(_) => return Ok(flow),
                            };
                            match sigil {
                                Sigil::Array | Sigil::Hash => {
                                    let rest: List =
                                        list.values().iter().skip(position).cloned().collect();
                                    assign_into(interp, &target, &Value::List(rest))?;
                                    break;
                                }
                                _ => {
                                    let element = list.values().get(position).cloned().unwrap_or(Scalar::Undef);
                                    assign_into(interp, &target, &Value::Scalar(ScalarRef::new(element)))?;
                                    position += 1;
                                }
                            }
                        }
                        Ok(Ctl::Val(Value::List(list)))
                    }))
                }
                _ => Err(PerlError::compile("my requires a variable", unary.pos)),
            },
            Node::Unary(unary) if unary.op == UnaryOp::Local => match &unary.operand {
                Some(Node::Ident(ident)) if ident.sigil == Sigil::Scalar => {
                    let name = self.qualified(&ident.name);
                    let value = self.emit_expr(rhs, Context::Scalar)?;
                    Ok(Arc::new(move |interp, frame| {
                        let slot = interp.env().get_scalar(&name);
                        frame.saved_locals.push((name.clone(), slot.get()));
                        let result = eval_val!(value, interp, frame).scalar_value();
                        slot.set(result);
                        Ok(Ctl::Val(Value::Scalar(slot)))
                    }))
                }
                _ => Err(PerlError::compile("local requires a global scalar", unary.pos)),
            },
            Node::Ident(ident) => {
                let sigil = ident.sigil;
                let target = self.emit_assign_target(ident)?;
                let value = self.emit_expr(
                    rhs,
                    if sigil == Sigil::Scalar { Context::Scalar } else { Context::List },
                )?;
                Ok(Arc::new(move |interp, frame| {
                    let destination = eval_val!(target, interp, frame);
                    let result = eval_val!(value, interp, frame);
                    assign_into(interp, &destination, &result)?;
                    Ok(Ctl::Val(destination))
                }))
            }
            Node::Binary(binary) if binary.op == BinaryOp::ElemArray => {
                let array = self.emit_array_operand(&binary.lhs)?;
                let index = self.emit_expr(&binary.rhs, Context::Scalar)?;
                let value = self.emit_expr(rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(array, interp, frame);
                    let target = target.expect_array()?.clone();
                    let at = eval_val!(index, interp, frame).scalar_value().as_int();
                    let result = eval_val!(value, interp, frame).scalar_value();
                    target.set(at, result.clone());
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
            Node::Binary(binary) if binary.op == BinaryOp::ElemHash => {
                let hash = self.emit_hash_operand(&binary.lhs)?;
                let key = self.emit_expr(&binary.rhs, Context::Scalar)?;
                let value = self.emit_expr(rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(hash, interp, frame);
                    let target = target.expect_hash()?.clone();
                    let key_value = eval_val!(key, interp, frame).scalar_value();
                    let key = interp.stringify(&key_value)?;
                    let result = eval_val!(value, interp, frame).scalar_value();
                    target.set(&key, result.clone());
                    Ok(Ctl::Val(Value::Scalar(ScalarRef::new(result))))
                }))
            }
            Node::Unary(unary) if unary.op == UnaryOp::DerefScalar => {
                let slot = self.emit_unary(unary, Context::Scalar)?;
                let value = self.emit_expr(rhs, Context::Scalar)?;
                Ok(Arc::new(move |interp, frame| {
                    let target = eval_val!(slot, interp, frame);
                    let target = target.expect_scalar()?.clone();
                    let result = eval_val!(value, interp, frame).scalar_value();
                    target.set(result);
                    Ok(Ctl::Val(Value::Scalar(target)))
                }))
            }
            Node::List(targets) => {
                let mut lvalues = Vec::new();
                for target in &targets.elems {
                    lvalues.push(self.emit_lvalue(target)?);
                }
                let value = self.emit_expr(rhs, Context::List)?;
                Ok(Arc::new(move |interp, frame| {
                    let list = eval_val!(value, interp, frame).list_value();
                    for (position, lvalue) in lvalues.iter().enumerate() {
                        let target = eval_val!(lvalue, interp, frame);
                        let element = list.values().get(position).cloned().unwrap_or(Scalar::Undef);
                        target.expect_scalar()?.set(element);
                    }
                    Ok(Ctl::Val(Value::List(list)))
                }))
            }
            other => Err(PerlError::compile("cannot assign to this expression", other.pos())),
        }
    }

    /// The assignment destination for a bare identifier: the lexical slot
    /// value, the `our` global, an outer eval lexical, or a package global.
    fn emit_assign_target(&mut self, ident: &IdentNode) -> PerlResult<Thunk> {
        if ident.sigil == Sigil::Array && &*ident.name == "_" {
            return Ok(Arc::new(|_, frame| Ok(Ctl::Val(Value::Array(frame.args.clone())))));
        }
        if let Some(entry) = self.lookup(ident.sigil, &ident.name) {
            if entry.global.is_none() {
                let slot = entry.slot;
                return Ok(Arc::new(move |_, frame| Ok(Ctl::Val(frame.slots[slot].clone()))));
            }
        }
        self.emit_ident(ident)
    }

    fn emit_try(&mut self, try_node: &TryNode) -> PerlResult<Thunk> {
        let body = self.emit_block(&try_node.body)?;
        self.scopes.push(Vec::new());
        let catch_slot = match (&try_node.catch_var, &try_node.catch) {
            (Some(var), Some(_)) => {
                let slot = self.alloc_slot();
                self.declare(NLex {
                    sigil: var.sigil,
                    name: var.name.clone(),
                    slot,
                    persistent: None,
                    global: None,
                });
                Some(slot)
            }
            _ => None,
        };
        let catch = match &try_node.catch {
            Some(block) => Some(self.emit_block(block)?),
            None => None,
        };
        self.scopes.pop();
        let finally = match &try_node.finally {
            Some(block) => Some(self.emit_block(block)?),
            None => None,
        };

        Ok(Arc::new(move |interp, frame| {
            let outcome = body(interp, frame);
            let result = match outcome {
                Ok(Ctl::Val(value)) => {
                    interp.env().clear_err_var();
                    Ok(Ctl::Val(value))
                }
                Ok(flow @ Ctl::Flow(_)) => Ok(flow),
                Err(error) if error.catchable() => {
                    interp.env().set_err_var(error.to_err_var());
                    if let Some(slot) = catch_slot {
                        frame.slots[slot] = Value::Scalar(ScalarRef::new(error.to_err_var()));
                    }
                    match &catch {
                        Some(catch) => catch(interp, frame),
                        None => Ok(Ctl::Val(Value::Scalar(ScalarRef::undef()))),
                    }
                }
                Err(error) => Err(error),
            };
            if let Some(finally) = &finally {
                match finally(interp, frame)? {
                    Ctl::Val(_) => {}
                    flow @ Ctl::Flow(_) => return Ok(flow),
                }
            }
            result
        }))
    }
}

fn noop_thunk() -> Thunk {
    Arc::new(|_, _| Ok(Ctl::Val(Value::None)))
}

fn global_scalar_thunk(name: Arc<str>) -> Thunk {
    Arc::new(move |interp, _| Ok(Ctl::Val(Value::Scalar(interp.env().get_scalar(&name)))))
}

/// Writes a result into an assignment destination with the correct
/// semantics per destination kind (value-set for scalars, content
/// replacement for containers).
fn assign_into(interp: &mut Interp, destination: &Value, result: &Value) -> PerlResult<()> {
    match destination {
        Value::Scalar(slot) => {
            slot.set(result.scalar_value());
            Ok(())
        }
        Value::Array(array) => {
            array.assign_list(&result.list_value());
            Ok(())
        }
        Value::Hash(hash) => {
            hash.assign_list(&result.list_value(), interp.env().interner());
            Ok(())
        }
        other => Err(PerlError::internal(format!(
            "cannot assign into {}",
            other.kind_name()
        ))),
    }
}

fn scalar_bin_kind(op: &BinaryOp) -> Option<ScalarBinOp> {
    Some(match op {
        BinaryOp::Add => ScalarBinOp::Add,
        BinaryOp::Subtract => ScalarBinOp::Subtract,
        BinaryOp::Multiply => ScalarBinOp::Multiply,
        BinaryOp::Divide => ScalarBinOp::Divide,
        BinaryOp::Modulus => ScalarBinOp::Modulus,
        BinaryOp::Power => ScalarBinOp::Power,
        BinaryOp::Concat => ScalarBinOp::Concat,
        BinaryOp::Repeat => ScalarBinOp::Repeat,
        BinaryOp::NumEq => ScalarBinOp::NumEq,
        BinaryOp::NumNe => ScalarBinOp::NumNe,
        BinaryOp::NumLt => ScalarBinOp::NumLt,
        BinaryOp::NumLe => ScalarBinOp::NumLe,
        BinaryOp::NumGt => ScalarBinOp::NumGt,
        BinaryOp::NumGe => ScalarBinOp::NumGe,
        BinaryOp::StrEq => ScalarBinOp::StrEq,
        BinaryOp::StrNe => ScalarBinOp::StrNe,
        BinaryOp::StrLt => ScalarBinOp::StrLt,
        BinaryOp::StrLe => ScalarBinOp::StrLe,
        BinaryOp::StrGt => ScalarBinOp::StrGt,
        BinaryOp::StrGe => ScalarBinOp::StrGe,
        BinaryOp::NumCmp => ScalarBinOp::NumCmp,
        BinaryOp::StrCmp => ScalarBinOp::StrCmp,
        _ => return None,
    })
}
