//! AST to register bytecode.
//!
//! Register allocation is a single forward pass: every expression result
//! goes into a freshly allocated register; lexicals are pinned to a
//! register for their lifetime; temporaries are reclaimed between
//! statements. Registers 0–2 are reserved (closure/self, `@_`, calling
//! context), captures bind from register 3 upward, locals and temporaries
//! follow.
//!
//! Superinstruction emission is pattern-matched on the AST; a missed match
//! emits the general form with no correctness impact.

use ahash::{AHashMap, AHashSet};
use std::sync::Arc;

use super::builder::{CodeBuilder, JumpLabel};
use super::code::{Code, ExceptionEntry};
use super::op::{NO_LABEL, Op, SlowOp};
use crate::ast::{
    BinaryNode, BinaryOp, BlockNode, CompileCtx, ForNode, ForeachNode, IdentNode, Node, NumLit, Pos,
    Sigil, StrNode, StrPart, SubNode, TryNode, UnaryNode, UnaryOp,
};
use crate::capture::{Capture, free_variables};
use crate::config::Backend;
use crate::env::Environment;
use crate::error::{PerlError, PerlResult};
use crate::function::{CaptureSpec, CodeRef, Sub};
use crate::native;
use crate::value::{Context, Scalar};

/// Options threaded through a compilation.
#[derive(Debug, Clone, Default)]
pub struct CompileOptions {
    /// Backend for nested subroutine literals; `None` keeps the enclosing
    /// compiler's own backend.
    pub sub_backend: Option<Backend>,
    /// Lexicals visible from an enclosing frame (dynamic eval): decorated
    /// name (`$w`, `@rows`) to persistent-slot name.
    pub outer_lexicals: AHashMap<Arc<str>, Arc<str>>,
}

/// The register holding the argument array (`@_`).
const ARGS_REG: u8 = 1;

#[derive(Debug, Clone)]
struct LexEntry {
    sigil: Sigil,
    name: Arc<str>,
    reg: u8,
    /// Persistent-slot name for promoted lexicals.
    persistent: Option<Arc<str>>,
    /// `our` aliases: the qualified global this name resolves to.
    global: Option<Arc<str>>,
}

#[derive(Debug)]
struct LoopFrame {
    label: Option<Arc<str>>,
    redo_pc: usize,
    next_jumps: Vec<JumpLabel>,
    last_jumps: Vec<JumpLabel>,
    enter_patches: (JumpLabel, JumpLabel, JumpLabel),
}

/// Limit operand for the fused loop-induction form.
#[derive(Debug, Clone, Copy)]
enum Limit {
    Literal(i32),
    Reg(u8),
}

/// The bytecode compiler for one subroutine body.
pub struct Compiler<'e> {
    env: &'e Environment,
    ctx: CompileCtx,
    opts: CompileOptions,
    b: CodeBuilder,
    scopes: Vec<Vec<LexEntry>>,
    loops: Vec<LoopFrame>,
    next_reg: u16,
    floor: u16,
    max_reg: u16,
    /// Lexical names that must bind persistent slots when declared.
    promoted: AHashSet<(Sigil, Arc<str>)>,
    /// Promote every declaration (the unit contains a string eval).
    promote_all: bool,
    lexical_map: AHashMap<Arc<str>, Arc<str>>,
    name: Arc<str>,
}

/// Compiles a script body (the top-level compilation unit).
pub fn compile_script(
    env: &Environment,
    body: &BlockNode,
    ctx: &CompileCtx,
    opts: &CompileOptions,
) -> PerlResult<CodeRef> {
    let code = compile_sub_body(env, body, "__SCRIPT__", ctx, opts, Vec::new())?;
    Ok(Arc::new(Sub::bytecode("__SCRIPT__", &ctx.package, code)))
}

/// Compiles one subroutine body into a bytecode artifact.
pub(crate) fn compile_sub_body(
    env: &Environment,
    body: &BlockNode,
    name: &str,
    ctx: &CompileCtx,
    opts: &CompileOptions,
    captures: Vec<CaptureSpec>,
) -> PerlResult<Arc<Code>> {
    let mut compiler = Compiler::new(env, ctx.clone(), opts.clone(), name);
    compiler.prologue(&captures)?;
    compiler.scan_promotions(body);
    let result = compiler.block_value(body)?;
    match result {
        Some(reg) => compiler.b.emit_r(Op::Return, reg),
        None => compiler.b.emit(Op::ReturnEmpty),
    }
    Ok(Arc::new(compiler.finish(captures)))
}

impl<'e> Compiler<'e> {
    fn new(env: &'e Environment, ctx: CompileCtx, opts: CompileOptions, name: &str) -> Self {
        Self {
            env,
            ctx,
            opts,
            b: CodeBuilder::new(),
            scopes: vec![Vec::new()],
            loops: Vec::new(),
            next_reg: 3,
            floor: 3,
            max_reg: 3,
            promoted: AHashSet::new(),
            promote_all: false,
            lexical_map: AHashMap::new(),
            name: Arc::from(name),
        }
    }

    /// Binds captures into their designated registers via the persistent
    /// retrieval sub-ops.
    fn prologue(&mut self, captures: &[CaptureSpec]) -> PerlResult<()> {
        for capture in captures {
            let reg = self.alloc_pinned()?;
            let index = self.b.add_str(&capture.persistent);
            let sub = match capture.sigil {
                Sigil::Array => SlowOp::RetrievePersistentArray,
                Sigil::Hash => SlowOp::RetrievePersistentHash,
                _ => SlowOp::RetrievePersistentScalar,
            };
            self.b.emit_slow_r_str(sub, reg, index);
            self.declare_entry(LexEntry {
                sigil: capture.sigil,
                name: capture.name.clone(),
                reg,
                persistent: Some(capture.persistent.clone()),
                global: None,
            });
            self.lexical_map
                .insert(decorated(capture.sigil, &capture.name), capture.persistent.clone());
        }
        Ok(())
    }

    /// Pre-pass: find which lexical names nested subroutines capture, and
    /// whether a string eval forces blanket promotion.
    fn scan_promotions(&mut self, body: &BlockNode) {
        let (promoted, has_eval) = collect_promotions(body);
        self.promoted.extend(promoted);
        self.promote_all = has_eval;
    }

    fn finish(self, captures: Vec<CaptureSpec>) -> Code {
        self.b.build(
            self.max_reg + 1,
            captures,
            self.lexical_map,
            &self.name,
            &self.ctx.file,
        )
    }

    // ------------------------------------------------------------------
    // Registers and scopes
    // ------------------------------------------------------------------

    fn alloc_temp(&mut self) -> PerlResult<u8> {
        let reg = self.next_reg;
        if reg > u16::from(u8::MAX) {
            return Err(PerlError::compile("subroutine too complex: out of registers", 0));
        }
        self.next_reg += 1;
        self.max_reg = self.max_reg.max(reg);
        Ok(reg as u8)
    }

    /// Allocates a register that survives statement-boundary reclamation
    /// (lexicals and loop working registers).
    fn alloc_pinned(&mut self) -> PerlResult<u8> {
        let reg = self.alloc_temp()?;
        self.floor = self.next_reg;
        Ok(reg)
    }

    fn declare_entry(&mut self, entry: LexEntry) {
        self.scopes.last_mut().expect("scope stack never empty").push(entry);
    }

    fn lookup(&self, sigil: Sigil, name: &str) -> Option<&LexEntry> {
        self.scopes
            .iter()
            .rev()
            .find_map(|scope| scope.iter().rev().find(|entry| entry.sigil == sigil && &*entry.name == name))
    }

    fn lookup_reg(&self, sigil: Sigil, name: &str) -> Option<(u8, Option<Arc<str>>)> {
        self.lookup(sigil, name).map(|entry| (entry.reg, entry.global.clone()))
    }

    fn push_scope(&mut self) {
        self.scopes.push(Vec::new());
    }

    fn pop_scope(&mut self) {
        self.scopes.pop();
    }

    fn is_promoted(&self, sigil: Sigil, name: &Arc<str>) -> bool {
        self.promote_all || self.promoted.contains(&(sigil, name.clone()))
    }

    /// Declares a `my` lexical, promoting it to a persistent slot when a
    /// nested subroutine or a string eval needs to see it.
    fn declare_my(&mut self, ident: &IdentNode) -> PerlResult<u8> {
        let reg = self.alloc_pinned()?;
        let persistent = if self.is_promoted(ident.sigil, &ident.name) {
            let slot_name: Arc<str> =
                Arc::from(Environment::persistent_name(self.env.fresh_begin_id(), &ident.name));
            let index = self.b.add_str(&slot_name);
            let sub = match ident.sigil {
                Sigil::Array => SlowOp::RetrievePersistentArray,
                Sigil::Hash => SlowOp::RetrievePersistentHash,
                _ => SlowOp::RetrievePersistentScalar,
            };
            self.b.emit_slow_r_str(sub, reg, index);
            self.lexical_map.insert(decorated(ident.sigil, &ident.name), slot_name.clone());
            Some(slot_name)
        } else {
            let op = match ident.sigil {
                Sigil::Array => Op::NewArray,
                Sigil::Hash => Op::NewHash,
                _ => Op::NewScalar,
            };
            self.b.emit_r(op, reg);
            None
        };
        self.declare_entry(LexEntry {
            sigil: ident.sigil,
            name: ident.name.clone(),
            reg,
            persistent,
            global: None,
        });
        Ok(reg)
    }

    fn qualified(&self, name: &str) -> Arc<str> {
        self.env.normalize(name, &self.ctx.package)
    }

    /// Interns a qualified global name in the string pool.
    fn global_str(&mut self, name: &str) -> u16 {
        let qualified = self.qualified(name);
        self.b.add_str(&qualified)
    }

    // ------------------------------------------------------------------
    // Statements
    // ------------------------------------------------------------------

    /// Compiles a block, returning the register of the final expression
    /// statement (the implicit return value).
    fn block_value(&mut self, block: &BlockNode) -> PerlResult<Option<u8>> {
        self.push_scope();
        let mut result = None;
        let count = block.stmts.len();
        for (index, stmt) in block.stmts.iter().enumerate() {
            result = self.stmt(stmt)?;
            if index + 1 != count {
                result = None;
                self.next_reg = self.floor;
            }
        }
        self.pop_scope();
        Ok(result)
    }

    /// Compiles one statement; returns the value register for expression
    /// statements.
    fn stmt(&mut self, node: &Node) -> PerlResult<Option<u8>> {
        self.b.set_line(self.ctx.line(node.pos()));
        match node {
            Node::Flag(_) => Ok(None),
            Node::Sub(sub) if sub.name.is_some() => {
                self.define_named_sub(sub)?;
                Ok(None)
            }
            Node::If(if_node) => {
                let cond = self.expr(&if_node.cond, Context::Scalar)?;
                let to_else = self.b.emit_jump_if(Op::JumpIfFalse, cond);
                self.block_stmts(&if_node.then_block)?;
                let to_end = self.b.emit_jump();
                self.b.patch_jump(to_else);
                if let Some(else_branch) = &if_node.else_branch {
                    match else_branch {
                        Node::Block(block) => self.block_stmts(block)?,
                        other => {
                            let _ = self.stmt(other)?;
                        }
                    }
                }
                self.b.patch_jump(to_end);
                Ok(None)
            }
            Node::Foreach(foreach) => {
                self.compile_foreach(foreach, None)?;
                Ok(None)
            }
            Node::For(for_node) => {
                self.compile_for(for_node, None)?;
                Ok(None)
            }
            Node::Label(label) => {
                match &label.stmt {
                    Node::Foreach(foreach) => self.compile_foreach(foreach, Some(label.name.clone()))?,
                    Node::For(for_node) => self.compile_for(for_node, Some(label.name.clone()))?,
                    other => {
                        let _ = self.stmt(other)?;
                    }
                }
                Ok(None)
            }
            Node::Block(block) => {
                self.block_stmts(block)?;
                Ok(None)
            }
            other => Ok(Some(self.expr(other, Context::Void)?)),
        }
    }

    fn block_stmts(&mut self, block: &BlockNode) -> PerlResult<()> {
        self.push_scope();
        for stmt in &block.stmts {
            let _ = self.stmt(stmt)?;
            self.next_reg = self.floor;
        }
        self.pop_scope();
        Ok(())
    }

    // ------------------------------------------------------------------
    // Loops
    // ------------------------------------------------------------------

    fn compile_foreach(&mut self, foreach: &ForeachNode, label: Option<Arc<str>>) -> PerlResult<()> {
        self.push_scope();

        // Iterate array storage directly when the list is a named array so
        // the loop variable aliases its element slots.
        let arr = self.alloc_pinned()?;
        if matches!(&foreach.list, Node::Ident(ident) if ident.sigil == Sigil::Array) {
            let src = self.array_operand(&foreach.list)?;
            self.b.emit_rr(Op::Move, arr, src);
        } else {
            let list = self.expr(&foreach.list, Context::List)?;
            let tmp = self.alloc_temp()?;
            self.b.emit_rr(Op::ToList, tmp, list);
            self.b.emit_rr(Op::ArrayFromList, arr, tmp);
        }

        let idx = self.alloc_pinned()?;
        self.b.emit_r_imm(Op::LoadInt, idx, 0);
        let len = self.alloc_pinned()?;
        self.b.emit_rr(Op::ArrayLen, len, arr);
        let cond = self.alloc_pinned()?;
        self.b.emit_r(Op::NewScalar, cond);

        // When the loop variable is promoted (captured by a nested sub),
        // values copy in through the stable slot instead of rebinding the
        // register, trading element aliasing for cross-artifact visibility.
        let mut copy_in = false;
        let var_reg = match &foreach.var {
            Some(var) if foreach.declares_var => {
                copy_in = self.is_promoted(var.sigil, &var.name);
                self.declare_my(var)?
            }
            Some(var) => match self.lookup_reg(var.sigil, &var.name) {
                Some((reg, _)) => reg,
                None => self.alloc_pinned()?,
            },
            // Implicit $_ iterates through a pinned register.
            None => self.alloc_pinned()?,
        };

        let label_index = match &label {
            Some(name) => self.b.add_str(name),
            None => NO_LABEL,
        };
        let enter = self.b.emit_enter_loop(label_index);
        self.loops.push(LoopFrame {
            label,
            redo_pc: 0,
            next_jumps: Vec::new(),
            last_jumps: Vec::new(),
            enter_patches: enter,
        });

        let cond_pc = self.b.current_offset();
        self.b.emit_rrr(Op::NumLt, cond, idx, len);
        let to_exit = self.b.emit_jump_if(Op::JumpIfFalse, cond);

        let body_pc = self.b.current_offset();
        if let Some(frame) = self.loops.last_mut() {
            frame.redo_pc = body_pc;
        }
        if copy_in {
            let element = self.alloc_pinned()?;
            self.b.emit_rrr(Op::ArrayGet, element, arr, idx);
            self.b.emit_rr(Op::SetScalar, var_reg, element);
        } else {
            self.b.emit_rrr(Op::ArrayGet, var_reg, arr, idx);
        }
        self.block_stmts(&foreach.body)?;

        let next_pc = self.b.current_offset();
        self.b.emit_r(Op::Inc, idx);
        self.b.emit_jump_to(cond_pc);

        self.finish_loop(vec![to_exit], body_pc, next_pc);
        self.pop_scope();
        Ok(())
    }

    fn compile_for(&mut self, for_node: &ForNode, label: Option<Arc<str>>) -> PerlResult<()> {
        self.push_scope();
        if let Some(init) = &for_node.init {
            let _ = self.stmt(init)?;
            self.next_reg = self.floor;
        }

        // Loop-induction fusion: `step` increments a lexical that `cond`
        // compares below a literal or lexical limit.
        let fused = self.fusible_induction(for_node);
        let fused = match fused {
            Some((var, Limit::Literal(value))) => {
                let reg = self.alloc_pinned()?;
                self.b.emit_r_imm(Op::LoadInt, reg, value);
                Some((var, reg))
            }
            Some((var, Limit::Reg(reg))) => Some((var, reg)),
            None => None,
        };

        let label_index = match &label {
            Some(name) => self.b.add_str(name),
            None => NO_LABEL,
        };
        let enter = self.b.emit_enter_loop(label_index);
        self.loops.push(LoopFrame {
            label,
            redo_pc: 0,
            next_jumps: Vec::new(),
            last_jumps: Vec::new(),
            enter_patches: enter,
        });

        let cond_pc = self.b.current_offset();
        let to_exit = match &for_node.cond {
            Some(cond) => {
                let reg = self.expr(cond, Context::Scalar)?;
                Some(self.b.emit_jump_if(Op::JumpIfFalse, reg))
            }
            None => None,
        };

        let body_pc = self.b.current_offset();
        if let Some(frame) = self.loops.last_mut() {
            frame.redo_pc = body_pc;
        }
        self.block_stmts(&for_node.body)?;

        let next_pc = self.b.current_offset();
        if let Some((var, limit)) = fused {
            self.b.emit_inc_cmp_br(var, limit, body_pc);
        } else {
            if let Some(step) = &for_node.step {
                let _ = self.stmt(step)?;
                self.next_reg = self.floor;
            }
            self.b.emit_jump_to(cond_pc);
        }

        self.finish_loop(to_exit.into_iter().collect(), body_pc, next_pc);
        self.pop_scope();
        Ok(())
    }

    fn finish_loop(&mut self, to_exit: Vec<JumpLabel>, redo_pc: usize, next_pc: usize) {
        let frame = self.loops.pop().expect("loop frame present");
        let exit_pc = self.b.current_offset();
        for label in to_exit {
            self.b.patch_to(label, exit_pc);
        }
        self.b.emit(Op::ExitLoop);
        let end_pc = self.b.current_offset();
        for jump in frame.last_jumps {
            self.b.patch_to(jump, end_pc);
        }
        for jump in frame.next_jumps {
            self.b.patch_to(jump, next_pc);
        }
        let (redo_label, next_label, last_label) = frame.enter_patches;
        self.b.patch_to(redo_label, redo_pc);
        self.b.patch_to(next_label, next_pc);
        self.b.patch_to(last_label, end_pc);
    }

    fn fusible_induction(&self, for_node: &ForNode) -> Option<(u8, Limit)> {
        let step = for_node.step.as_ref()?;
        let cond = for_node.cond.as_ref()?;
        let step_var = match step {
            Node::Unary(unary) if matches!(unary.op, UnaryOp::PostInc | UnaryOp::PreInc) => match &unary.operand {
                Some(Node::Ident(ident)) if ident.sigil == Sigil::Scalar => ident.name.clone(),
                _ => return None,
            },
            _ => return None,
        };
        let Node::Binary(binary) = cond else { return None };
        if binary.op != BinaryOp::NumLt {
            return None;
        }
        let Node::Ident(lhs) = &binary.lhs else { return None };
        if lhs.sigil != Sigil::Scalar || lhs.name != step_var {
            return None;
        }
        let entry = self.lookup(Sigil::Scalar, &step_var)?;
        if entry.global.is_some() {
            return None;
        }
        let var_reg = entry.reg;
        match &binary.rhs {
            Node::Number(number) => match number.value {
                NumLit::Int(value) => i32::try_from(value).ok().map(|v| (var_reg, Limit::Literal(v))),
                NumLit::Num(_) => None,
            },
            Node::Ident(rhs) if rhs.sigil == Sigil::Scalar => self
                .lookup(Sigil::Scalar, &rhs.name)
                .filter(|entry| entry.global.is_none())
                .map(|entry| (var_reg, Limit::Reg(entry.reg))),
            _ => None,
        }
    }

    /// Emits loop-control flow for `last`/`next`/`redo`.
    ///
    /// A locally visible target gets direct jumps (zero allocation); an
    /// invisible one emits the marker-constructing opcode and call sites
    /// dispatch the returned marker.
    fn loop_control(&mut self, op: &UnaryOp, label: Option<&Arc<str>>) -> PerlResult<()> {
        let found = match label {
            None => self.loops.len().checked_sub(1),
            Some(name) => self
                .loops
                .iter()
                .rposition(|frame| frame.label.as_deref() == Some(&**name)),
        };
        match found {
            Some(index) => {
                let depth = self.loops.len() - 1 - index;
                match op {
                    UnaryOp::Last => {
                        for _ in 0..=depth {
                            self.b.emit(Op::ExitLoop);
                        }
                        let jump = self.b.emit_jump();
                        self.loops[index].last_jumps.push(jump);
                    }
                    UnaryOp::Next => {
                        for _ in 0..depth {
                            self.b.emit(Op::ExitLoop);
                        }
                        let jump = self.b.emit_jump();
                        self.loops[index].next_jumps.push(jump);
                    }
                    UnaryOp::Redo => {
                        for _ in 0..depth {
                            self.b.emit(Op::ExitLoop);
                        }
                        let target = self.loops[index].redo_pc;
                        self.b.emit_jump_to(target);
                    }
                    _ => unreachable!("loop_control called with a non-loop operator"),
                }
            }
            None => {
                let index = match label {
                    Some(name) => self.b.add_str(name),
                    None => NO_LABEL,
                };
                let ctl = match op {
                    UnaryOp::Last => Op::CtrlLast,
                    UnaryOp::Next => Op::CtrlNext,
                    UnaryOp::Redo => Op::CtrlRedo,
                    _ => unreachable!("loop_control called with a non-loop operator"),
                };
                self.b.emit_ctl(ctl, index);
            }
        }
        Ok(())
    }

    // ------------------------------------------------------------------
    // Subroutines
    // ------------------------------------------------------------------

    fn define_named_sub(&mut self, sub: &SubNode) -> PerlResult<()> {
        let name = sub.name.clone().expect("named sub");
        let code = self.compile_nested_sub(sub, &name)?;
        let qualified = self.qualified(&name);
        self.env.set_code(&qualified, code);
        Ok(())
    }

    /// Compiles a nested subroutine with captures resolved against this
    /// compiler's scopes, in the configured backend.
    fn compile_nested_sub(&mut self, sub: &SubNode, name: &str) -> PerlResult<CodeRef> {
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
            Some(Backend::Native) => {
                let native = native::emit_sub_body(self.env, &sub.body, name, &self.ctx, &self.opts, captures)?;
                Ok(Arc::new(Sub::native(name, &self.ctx.package, native)))
            }
            _ => {
                let code = compile_sub_body(self.env, &sub.body, name, &self.ctx, &self.opts, captures)?;
                Ok(Arc::new(Sub::bytecode(name, &self.ctx.package, code)))
            }
        }
    }

    // ------------------------------------------------------------------
    // Expressions
    // ------------------------------------------------------------------

    fn expr(&mut self, node: &Node, cx: Context) -> PerlResult<u8> {
        match node {
            Node::Number(number) => self.load_number(number.value),
            Node::Str(string) => self.compile_string(string),
            Node::Ident(ident) => self.compile_ident(ident),
            Node::Unary(unary) => self.compile_unary(unary, cx),
            Node::Binary(binary) => self.compile_binary(binary, cx),
            Node::Ternary(ternary) => {
                let dst = self.alloc_temp()?;
                let cond = self.expr(&ternary.cond, Context::Scalar)?;
                let to_else = self.b.emit_jump_if(Op::JumpIfFalse, cond);
                let then_reg = self.expr(&ternary.then_expr, cx)?;
                self.b.emit_rr(Op::Move, dst, then_reg);
                let to_end = self.b.emit_jump();
                self.b.patch_jump(to_else);
                let else_reg = self.expr(&ternary.else_expr, cx)?;
                self.b.emit_rr(Op::Move, dst, else_reg);
                self.b.patch_jump(to_end);
                Ok(dst)
            }
            Node::List(list) => {
                let dst = self.alloc_temp()?;
                self.b.emit_r(Op::NewList, dst);
                for elem in &list.elems {
                    let value = self.expr(elem, Context::List)?;
                    self.b.emit_rr(Op::ListPush, dst, value);
                }
                Ok(dst)
            }
            Node::ArrayLit(list) => {
                let dst = self.alloc_temp()?;
                let values = self.alloc_temp()?;
                self.b.emit_r(Op::NewList, values);
                for elem in &list.elems {
                    let value = self.expr(elem, Context::List)?;
                    self.b.emit_rr(Op::ListPush, values, value);
                }
                let array = self.alloc_temp()?;
                self.b.emit_r(Op::NewArray, array);
                self.b.emit_rr(Op::ArrayAssign, array, values);
                self.b.emit_rr(Op::MakeRef, dst, array);
                Ok(dst)
            }
            Node::HashLit(list) => {
                let dst = self.alloc_temp()?;
                let values = self.alloc_temp()?;
                self.b.emit_r(Op::NewList, values);
                for elem in &list.elems {
                    let value = self.expr(elem, Context::List)?;
                    self.b.emit_rr(Op::ListPush, values, value);
                }
                let hash = self.alloc_temp()?;
                self.b.emit_r(Op::NewHash, hash);
                self.b.emit_rr(Op::HashAssign, hash, values);
                self.b.emit_rr(Op::MakeRef, dst, hash);
                Ok(dst)
            }
            Node::Sub(sub) => {
                if let Some(name) = sub.name.clone() {
                    self.define_named_sub(sub)?;
                    let dst = self.alloc_temp()?;
                    let index = self.global_str(&name);
                    self.b.emit_r_idx(Op::LoadGlobalCode, dst, index);
                    Ok(dst)
                } else {
                    let code = self.compile_nested_sub(sub, "__ANON__")?;
                    let dst = self.alloc_temp()?;
                    let index = self.b.add_const(Scalar::Code(code));
                    self.b.emit_r_idx(Op::MakeSub, dst, index);
                    Ok(dst)
                }
            }
            Node::Try(try_node) => self.compile_try(try_node),
            Node::Block(block) => {
                let result = self.block_value(block)?;
                match result {
                    Some(reg) => Ok(reg),
                    None => {
                        let dst = self.alloc_temp()?;
                        self.b.emit_r(Op::LoadUndef, dst);
                        Ok(dst)
                    }
                }
            }
            Node::If(_) | Node::Foreach(_) | Node::For(_) | Node::Label(_) | Node::Flag(_) => {
                let _ = self.stmt(node)?;
                let dst = self.alloc_temp()?;
                self.b.emit_r(Op::LoadUndef, dst);
                Ok(dst)
            }
        }
    }

    fn load_number(&mut self, value: NumLit) -> PerlResult<u8> {
        let dst = self.alloc_temp()?;
        match value {
            NumLit::Int(value) => match i32::try_from(value) {
                Ok(small) => self.b.emit_r_imm(Op::LoadInt, dst, small),
                Err(_) => {
                    let index = self.b.add_const(Scalar::Int(value));
                    self.b.emit_r_idx(Op::LoadConst, dst, index);
                }
            },
            NumLit::Num(value) => {
                let index = self.b.add_const(Scalar::Num(value));
                self.b.emit_r_idx(Op::LoadConst, dst, index);
            }
        }
        Ok(dst)
    }

    fn compile_string(&mut self, string: &StrNode) -> PerlResult<u8> {
        if let [StrPart::Lit(text)] = string.parts.as_slice() {
            let dst = self.alloc_temp()?;
            let index = self.b.add_str(text);
            self.b.emit_r_idx(Op::LoadStr, dst, index);
            return Ok(dst);
        }
        // Interpolation folds into a concat chain; Concat stringifies with
        // overload dispatch, which is what interpolation requires.
        let acc = self.alloc_temp()?;
        let empty = self.b.add_str("");
        self.b.emit_r_idx(Op::LoadStr, acc, empty);
        for segment in &string.parts {
            let part = match segment {
                StrPart::Lit(text) => {
                    let reg = self.alloc_temp()?;
                    let index = self.b.add_str(text);
                    self.b.emit_r_idx(Op::LoadStr, reg, index);
                    reg
                }
                StrPart::Expr(expr) => self.expr(expr, Context::Scalar)?,
            };
            self.b.emit_rrr(Op::Concat, acc, acc, part);
        }
        Ok(acc)
    }

    fn compile_ident(&mut self, ident: &IdentNode) -> PerlResult<u8> {
        match ident.sigil {
            Sigil::Scalar => {
                if let Some((reg, global)) = self.lookup_reg(Sigil::Scalar, &ident.name) {
                    if let Some(global) = global {
                        let dst = self.alloc_temp()?;
                        let index = self.b.add_str(&global);
                        self.b.emit_r_idx(Op::LoadGlobalScalar, dst, index);
                        return Ok(dst);
                    }
                    return Ok(reg);
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Scalar, &ident.name)).cloned()
                {
                    let dst = self.alloc_temp()?;
                    let index = self.b.add_str(&persistent);
                    self.b.emit_slow_r_str(SlowOp::RetrievePersistentScalar, dst, index);
                    return Ok(dst);
                }
                let dst = self.alloc_temp()?;
                let index = self.global_str(&ident.name);
                self.b.emit_r_idx(Op::LoadGlobalScalar, dst, index);
                Ok(dst)
            }
            Sigil::Array => {
                if &*ident.name == "_" {
                    return Ok(ARGS_REG);
                }
                if let Some((reg, global)) = self.lookup_reg(Sigil::Array, &ident.name) {
                    if global.is_none() {
                        return Ok(reg);
                    }
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Array, &ident.name)).cloned()
                {
                    let dst = self.alloc_temp()?;
                    let index = self.b.add_str(&persistent);
                    self.b.emit_slow_r_str(SlowOp::RetrievePersistentArray, dst, index);
                    return Ok(dst);
                }
                let dst = self.alloc_temp()?;
                let index = self.global_str(&ident.name);
                self.b.emit_r_idx(Op::LoadGlobalArray, dst, index);
                Ok(dst)
            }
            Sigil::Hash => {
                if let Some((reg, global)) = self.lookup_reg(Sigil::Hash, &ident.name) {
                    if global.is_none() {
                        return Ok(reg);
                    }
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Hash, &ident.name)).cloned() {
                    let dst = self.alloc_temp()?;
                    let index = self.b.add_str(&persistent);
                    self.b.emit_slow_r_str(SlowOp::RetrievePersistentHash, dst, index);
                    return Ok(dst);
                }
                let dst = self.alloc_temp()?;
                let index = self.global_str(&ident.name);
                self.b.emit_r_idx(Op::LoadGlobalHash, dst, index);
                Ok(dst)
            }
            Sigil::Code | Sigil::Bare => {
                let dst = self.alloc_temp()?;
                let index = self.global_str(&ident.name);
                self.b.emit_r_idx(Op::LoadGlobalCode, dst, index);
                Ok(dst)
            }
        }
    }

    fn compile_unary(&mut self, unary: &UnaryNode, cx: Context) -> PerlResult<u8> {
        let operand = unary.operand.as_ref();
        match &unary.op {
            UnaryOp::Neg => {
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::Negate, dst, src);
                Ok(dst)
            }
            UnaryOp::Not => {
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::Not, dst, src);
                Ok(dst)
            }
            UnaryOp::Defined => {
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::Defined, dst, src);
                Ok(dst)
            }
            UnaryOp::Length => {
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::StrLength, dst, src);
                Ok(dst)
            }
            UnaryOp::Abs
            | UnaryOp::Int
            | UnaryOp::Sqrt
            | UnaryOp::Log
            | UnaryOp::Exp
            | UnaryOp::Chr
            | UnaryOp::Ord
            | UnaryOp::Uc
            | UnaryOp::Lc => {
                let sub = match unary.op {
                    UnaryOp::Abs => SlowOp::Abs,
                    UnaryOp::Int => SlowOp::Int,
                    UnaryOp::Sqrt => SlowOp::Sqrt,
                    UnaryOp::Log => SlowOp::Log,
                    UnaryOp::Exp => SlowOp::Exp,
                    UnaryOp::Chr => SlowOp::Chr,
                    UnaryOp::Ord => SlowOp::Ord,
                    UnaryOp::Uc => SlowOp::Uc,
                    _ => SlowOp::Lc,
                };
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rr(sub, dst, src);
                Ok(dst)
            }
            UnaryOp::MakeRef => {
                let src = match operand {
                    Some(node) => match node {
                        Node::Ident(ident) if ident.sigil == Sigil::Array => self.array_operand(node)?,
                        Node::Ident(ident) if ident.sigil == Sigil::Hash => self.hash_operand(node)?,
                        _ => self.expr(node, Context::Scalar)?,
                    },
                    None => return Err(PerlError::compile("operator requires an operand", unary.pos)),
                };
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::MakeRef, dst, src);
                Ok(dst)
            }
            UnaryOp::DerefScalar | UnaryOp::DerefArray | UnaryOp::DerefHash | UnaryOp::DerefCode => {
                let op = match unary.op {
                    UnaryOp::DerefScalar => Op::DerefScalar,
                    UnaryOp::DerefArray => Op::DerefArray,
                    UnaryOp::DerefHash => Op::DerefHash,
                    _ => Op::DerefCode,
                };
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(op, dst, src);
                Ok(dst)
            }
            UnaryOp::RefType => {
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rr(SlowOp::RefType, dst, src);
                Ok(dst)
            }
            UnaryOp::My => match operand {
                Some(Node::Ident(ident)) => self.declare_my(ident),
                Some(Node::List(list)) => {
                    for elem in &list.elems {
                        match elem {
                            Node::Ident(ident) => {
                                let _ = self.declare_my(ident)?;
                            }
                            other => {
                                return Err(PerlError::compile("my list must contain variables", other.pos()));
                            }
                        }
                    }
                    let dst = self.alloc_temp()?;
                    self.b.emit_r(Op::LoadUndef, dst);
                    Ok(dst)
                }
                _ => Err(PerlError::compile("my requires a variable", unary.pos)),
            },
            UnaryOp::Our => match operand {
                Some(Node::Ident(ident)) => {
                    let qualified = self.qualified(&ident.name);
                    let reg = self.alloc_pinned()?;
                    let index = self.b.add_str(&qualified);
                    let op = match ident.sigil {
                        Sigil::Array => Op::LoadGlobalArray,
                        Sigil::Hash => Op::LoadGlobalHash,
                        _ => Op::LoadGlobalScalar,
                    };
                    self.b.emit_r_idx(op, reg, index);
                    self.declare_entry(LexEntry {
                        sigil: ident.sigil,
                        name: ident.name.clone(),
                        reg,
                        persistent: None,
                        global: Some(qualified),
                    });
                    Ok(reg)
                }
                _ => Err(PerlError::compile("our requires a variable", unary.pos)),
            },
            UnaryOp::Local => match operand {
                Some(Node::Ident(ident)) if ident.sigil == Sigil::Scalar => {
                    let index = self.global_str(&ident.name);
                    self.b.emit_slow_str(SlowOp::LocalSave, index);
                    let dst = self.alloc_temp()?;
                    self.b.emit_r_idx(Op::LoadGlobalScalar, dst, index);
                    Ok(dst)
                }
                _ => Err(PerlError::compile("local requires a global scalar", unary.pos)),
            },
            UnaryOp::Return => {
                match operand {
                    Some(node) => {
                        let reg = self.expr(node, Context::Runtime)?;
                        self.b.emit_r(Op::Return, reg);
                    }
                    None => self.b.emit(Op::ReturnEmpty),
                }
                let dst = self.alloc_temp()?;
                self.b.emit_r(Op::LoadUndef, dst);
                Ok(dst)
            }
            UnaryOp::Wantarray => {
                let dst = self.alloc_temp()?;
                self.b.emit_r(Op::Wantarray, dst);
                Ok(dst)
            }
            UnaryOp::Last | UnaryOp::Next | UnaryOp::Redo => {
                let label = match operand {
                    Some(Node::Ident(ident)) if ident.sigil == Sigil::Bare => Some(ident.name.clone()),
                    _ => None,
                };
                self.b.set_line(self.ctx.line(unary.pos));
                self.loop_control(&unary.op, label.as_ref())?;
                let dst = self.alloc_temp()?;
                self.b.emit_r(Op::LoadUndef, dst);
                Ok(dst)
            }
            UnaryOp::Goto => {
                let (code_reg, args_reg) = match operand {
                    Some(Node::List(list)) if !list.elems.is_empty() => {
                        let code = self.expr(&list.elems[0], Context::Scalar)?;
                        let args = if list.elems.len() == 1 {
                            ARGS_REG
                        } else {
                            let args = self.alloc_temp()?;
                            self.b.emit_r(Op::NewArray, args);
                            for elem in &list.elems[1..] {
                                let value = self.expr(elem, Context::List)?;
                                self.b.emit_rr(Op::ArrayPush, args, value);
                            }
                            args
                        };
                        (code, args)
                    }
                    Some(node) => (self.expr(node, Context::Scalar)?, ARGS_REG),
                    None => return Err(PerlError::compile("goto requires a subroutine", unary.pos)),
                };
                self.b.emit_rr(Op::TailCall, code_reg, args_reg);
                let dst = self.alloc_temp()?;
                self.b.emit_r(Op::LoadUndef, dst);
                Ok(dst)
            }
            UnaryOp::EvalStr => {
                let src = self.operand_expr(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rr_ctx(SlowOp::EvalString, dst, src, cx as u8);
                Ok(dst)
            }
            UnaryOp::Die => {
                let src = self.operand_expr(operand, unary.pos)?;
                self.b.emit_slow_r(SlowOp::Die, src);
                Ok(src)
            }
            UnaryOp::Warn => {
                let src = self.operand_expr(operand, unary.pos)?;
                self.b.emit_slow_r(SlowOp::Warn, src);
                Ok(src)
            }
            UnaryOp::Pop | UnaryOp::Shift => {
                let array = match operand {
                    Some(node) => self.array_operand(node)?,
                    None => ARGS_REG,
                };
                let dst = self.alloc_temp()?;
                let op = if unary.op == UnaryOp::Pop { Op::ArrayPop } else { Op::ArrayShift };
                self.b.emit_rr(op, dst, array);
                Ok(dst)
            }
            UnaryOp::Keys | UnaryOp::Values => {
                let hash = match operand {
                    Some(node) => self.hash_operand(node)?,
                    None => return Err(PerlError::compile("keys/values require a hash", unary.pos)),
                };
                let dst = self.alloc_temp()?;
                let op = if unary.op == UnaryOp::Keys { Op::HashKeys } else { Op::HashValues };
                self.b.emit_rr(op, dst, hash);
                Ok(dst)
            }
            UnaryOp::ScalarCtx => {
                let src = self.operand_expr_cx(operand, unary.pos, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::ToScalar, dst, src);
                Ok(dst)
            }
            UnaryOp::Delete | UnaryOp::Exists => {
                let Some(Node::Binary(elem)) = operand else {
                    return Err(PerlError::compile("delete/exists require a hash element", unary.pos));
                };
                if elem.op != BinaryOp::ElemHash {
                    return Err(PerlError::compile("delete/exists require a hash element", elem.pos));
                }
                let hash = self.hash_operand(&elem.lhs)?;
                let key = self.expr(&elem.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                let op = if unary.op == UnaryOp::Delete { Op::HashDelete } else { Op::HashExists };
                self.b.emit_rrr(op, dst, hash, key);
                Ok(dst)
            }
            UnaryOp::Splice => {
                let Some(Node::List(args)) = operand else {
                    return Err(PerlError::compile("splice requires an argument list", unary.pos));
                };
                if args.elems.is_empty() {
                    return Err(PerlError::compile("splice requires an array", unary.pos));
                }
                let array = self.array_operand(&args.elems[0])?;
                let offset = match args.elems.get(1) {
                    Some(node) => self.expr(node, Context::Scalar)?,
                    None => {
                        let reg = self.alloc_temp()?;
                        self.b.emit_r_imm(Op::LoadInt, reg, 0);
                        reg
                    }
                };
                let length = match args.elems.get(2) {
                    Some(node) => self.expr(node, Context::Scalar)?,
                    None => {
                        let reg = self.alloc_temp()?;
                        self.b.emit_r(Op::LoadUndef, reg);
                        reg
                    }
                };
                let replacement = self.alloc_temp()?;
                self.b.emit_r(Op::NewList, replacement);
                for elem in args.elems.iter().skip(3) {
                    let value = self.expr(elem, Context::List)?;
                    self.b.emit_rr(Op::ListPush, replacement, value);
                }
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rrrrr(SlowOp::Splice, dst, array, offset, length, replacement);
                Ok(dst)
            }
            UnaryOp::Weaken => {
                let src = self.operand_expr(operand, unary.pos)?;
                self.b.emit_slow_r(SlowOp::Weaken, src);
                Ok(src)
            }
            UnaryOp::PreInc | UnaryOp::PreDec => {
                let reg = self.lvalue_slot(operand, unary.pos)?;
                let op = if unary.op == UnaryOp::PreInc { Op::Inc } else { Op::Dec };
                self.b.emit_r(op, reg);
                Ok(reg)
            }
            UnaryOp::PostInc | UnaryOp::PostDec => {
                let reg = self.lvalue_slot(operand, unary.pos)?;
                let dst = self.alloc_temp()?;
                let op = if unary.op == UnaryOp::PostInc { Op::PostInc } else { Op::PostDec };
                self.b.emit_rr(op, dst, reg);
                Ok(dst)
            }
        }
    }

    fn operand_expr(&mut self, operand: Option<&Node>, pos: Pos) -> PerlResult<u8> {
        self.operand_expr_cx(operand, pos, Context::Scalar)
    }

    fn operand_expr_cx(&mut self, operand: Option<&Node>, pos: Pos, cx: Context) -> PerlResult<u8> {
        match operand {
            Some(node) => self.expr(node, cx),
            None => Err(PerlError::compile("operator requires an operand", pos)),
        }
    }

    /// Compiles an lvalue to the register holding its scalar slot.
    fn lvalue_slot(&mut self, node: Option<&Node>, pos: Pos) -> PerlResult<u8> {
        let node = node.ok_or_else(|| PerlError::compile("lvalue required", pos))?;
        match node {
            Node::Ident(ident) if ident.sigil == Sigil::Scalar => self.compile_ident(ident),
            Node::Unary(unary) if unary.op == UnaryOp::My => match &unary.operand {
                Some(Node::Ident(ident)) => self.declare_my(ident),
                _ => Err(PerlError::compile("my requires a variable", pos)),
            },
            Node::Unary(unary) if unary.op == UnaryOp::DerefScalar => {
                let src = self.operand_expr(unary.operand.as_ref(), unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::DerefScalar, dst, src);
                Ok(dst)
            }
            Node::Binary(binary) if binary.op == BinaryOp::ElemArray => {
                let array = self.array_operand(&binary.lhs)?;
                let index = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rrr(Op::ArrayGet, dst, array, index);
                Ok(dst)
            }
            Node::Binary(binary) if binary.op == BinaryOp::ElemHash => {
                let hash = self.hash_operand(&binary.lhs)?;
                let key = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rrr(Op::HashGet, dst, hash, key);
                Ok(dst)
            }
            other => Err(PerlError::compile("not an lvalue", other.pos())),
        }
    }

    /// Compiles an expression that must produce an array register.
    fn array_operand(&mut self, node: &Node) -> PerlResult<u8> {
        match node {
            Node::Ident(ident) if ident.sigil == Sigil::Array => self.compile_ident(ident),
            Node::Unary(unary) if unary.op == UnaryOp::DerefArray => {
                let src = self.operand_expr(unary.operand.as_ref(), unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::DerefArray, dst, src);
                Ok(dst)
            }
            other => {
                // A scalar expression holding an array reference.
                let src = self.expr(other, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::DerefArray, dst, src);
                Ok(dst)
            }
        }
    }

    /// Compiles an expression that must produce a hash register.
    fn hash_operand(&mut self, node: &Node) -> PerlResult<u8> {
        match node {
            Node::Ident(ident) if ident.sigil == Sigil::Hash => self.compile_ident(ident),
            Node::Unary(unary) if unary.op == UnaryOp::DerefHash => {
                let src = self.operand_expr(unary.operand.as_ref(), unary.pos)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::DerefHash, dst, src);
                Ok(dst)
            }
            other => {
                let src = self.expr(other, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::DerefHash, dst, src);
                Ok(dst)
            }
        }
    }

    fn compile_binary(&mut self, binary: &BinaryNode, cx: Context) -> PerlResult<u8> {
        if let Some(folded) = fold_binary(binary) {
            return self.load_number(folded);
        }
        match &binary.op {
            BinaryOp::Assign => self.compile_assign(&binary.lhs, &binary.rhs),
            BinaryOp::AddAssign => {
                let var = self.lvalue_slot(Some(&binary.lhs), binary.pos)?;
                if let Some(imm) = small_int_literal(&binary.rhs) {
                    self.b.emit_r_imm(Op::AddAssignImm, var, imm);
                } else {
                    let rhs = self.expr(&binary.rhs, Context::Scalar)?;
                    self.b.emit_rr(Op::AddAssign, var, rhs);
                }
                Ok(var)
            }
            BinaryOp::SubtractAssign | BinaryOp::MultiplyAssign | BinaryOp::DivideAssign | BinaryOp::ConcatAssign => {
                let op = match binary.op {
                    BinaryOp::SubtractAssign => Op::Subtract,
                    BinaryOp::MultiplyAssign => Op::Multiply,
                    BinaryOp::DivideAssign => Op::Divide,
                    _ => Op::Concat,
                };
                let var = self.lvalue_slot(Some(&binary.lhs), binary.pos)?;
                let rhs = self.expr(&binary.rhs, Context::Scalar)?;
                let tmp = self.alloc_temp()?;
                self.b.emit_rrr(op, tmp, var, rhs);
                self.b.emit_rr(Op::SetScalar, var, tmp);
                Ok(var)
            }
            BinaryOp::And | BinaryOp::Or | BinaryOp::DefinedOr => {
                let dst = self.alloc_temp()?;
                let lhs = self.expr(&binary.lhs, Context::Scalar)?;
                self.b.emit_rr(Op::Move, dst, lhs);
                let skip = match binary.op {
                    BinaryOp::And => self.b.emit_jump_if(Op::JumpIfFalse, dst),
                    BinaryOp::Or => self.b.emit_jump_if(Op::JumpIfTrue, dst),
                    _ => {
                        let defined = self.alloc_temp()?;
                        self.b.emit_rr(Op::Defined, defined, dst);
                        self.b.emit_jump_if(Op::JumpIfTrue, defined)
                    }
                };
                let rhs = self.expr(&binary.rhs, cx)?;
                self.b.emit_rr(Op::Move, dst, rhs);
                self.b.patch_jump(skip);
                Ok(dst)
            }
            BinaryOp::Call => self.compile_call(&binary.lhs, &binary.rhs, cx),
            BinaryOp::MethodCall(name) => {
                let name = name.clone();
                let invocant = match &binary.lhs {
                    Node::Ident(ident) if ident.sigil == Sigil::Bare => {
                        let dst = self.alloc_temp()?;
                        let index = self.b.add_str(&ident.name);
                        self.b.emit_r_idx(Op::LoadStr, dst, index);
                        dst
                    }
                    other => self.expr(other, Context::Scalar)?,
                };
                let args = self.build_args(&binary.rhs)?;
                let dst = self.alloc_temp()?;
                let index = self.b.add_str(&name);
                self.b.emit_call_method(dst, invocant, index, args, cx as u8);
                Ok(dst)
            }
            BinaryOp::ElemArray => {
                let array = self.array_operand(&binary.lhs)?;
                let index = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rrr(Op::ArrayGet, dst, array, index);
                Ok(dst)
            }
            BinaryOp::ElemHash => {
                let hash = self.hash_operand(&binary.lhs)?;
                let key = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rrr(Op::HashGet, dst, hash, key);
                Ok(dst)
            }
            BinaryOp::Push => {
                let array = self.array_operand(&binary.lhs)?;
                match &binary.rhs {
                    Node::List(list) => {
                        for elem in &list.elems {
                            let value = self.expr(elem, Context::List)?;
                            self.b.emit_rr(Op::ArrayPush, array, value);
                        }
                    }
                    other => {
                        let value = self.expr(other, Context::List)?;
                        self.b.emit_rr(Op::ArrayPush, array, value);
                    }
                }
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::ArrayLen, dst, array);
                Ok(dst)
            }
            BinaryOp::Unshift => {
                let array = self.array_operand(&binary.lhs)?;
                // One list keeps multiple values in order at the front.
                let values = self.expr(&binary.rhs, Context::List)?;
                let list = self.alloc_temp()?;
                self.b.emit_rr(Op::ToList, list, values);
                self.b.emit_rr(Op::ArrayUnshift, array, list);
                let dst = self.alloc_temp()?;
                self.b.emit_rr(Op::ArrayLen, dst, array);
                Ok(dst)
            }
            BinaryOp::Join => {
                let sep = self.expr(&binary.lhs, Context::Scalar)?;
                let values = self.expr(&binary.rhs, Context::List)?;
                let list = self.alloc_temp()?;
                self.b.emit_rr(Op::ToList, list, values);
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rrr(SlowOp::Join, dst, sep, list);
                Ok(dst)
            }
            BinaryOp::StrIndex => {
                let haystack = self.expr(&binary.lhs, Context::Scalar)?;
                let needle = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rrr(SlowOp::StrIndex, dst, haystack, needle);
                Ok(dst)
            }
            BinaryOp::Bless => {
                let reference = self.expr(&binary.lhs, Context::Scalar)?;
                let class = self.expr(&binary.rhs, Context::Scalar)?;
                self.b.emit_slow_rr(SlowOp::Bless, reference, class);
                Ok(reference)
            }
            BinaryOp::Substr => {
                let string = self.expr(&binary.lhs, Context::Scalar)?;
                let (offset, len) = match &binary.rhs {
                    Node::List(list) if !list.elems.is_empty() => {
                        let offset = self.expr(&list.elems[0], Context::Scalar)?;
                        let len = match list.elems.get(1) {
                            Some(node) => self.expr(node, Context::Scalar)?,
                            None => {
                                let undef = self.alloc_temp()?;
                                self.b.emit_r(Op::LoadUndef, undef);
                                undef
                            }
                        };
                        (offset, len)
                    }
                    other => {
                        let offset = self.expr(other, Context::Scalar)?;
                        let undef = self.alloc_temp()?;
                        self.b.emit_r(Op::LoadUndef, undef);
                        (offset, undef)
                    }
                };
                let dst = self.alloc_temp()?;
                self.b.emit_rrrr(Op::Substr, dst, string, offset, len);
                Ok(dst)
            }
            BinaryOp::Range => {
                let lo = self.expr(&binary.lhs, Context::Scalar)?;
                let hi = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rrr(Op::Range, dst, lo, hi);
                Ok(dst)
            }
            BinaryOp::ArraySlice => {
                let array = self.array_operand(&binary.lhs)?;
                let indices = self.expr(&binary.rhs, Context::List)?;
                let list = self.alloc_temp()?;
                self.b.emit_rr(Op::ToList, list, indices);
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rrr(SlowOp::ArraySlice, dst, array, list);
                Ok(dst)
            }
            BinaryOp::HashSlice => {
                let hash = self.hash_operand(&binary.lhs)?;
                let keys = self.expr(&binary.rhs, Context::List)?;
                let list = self.alloc_temp()?;
                self.b.emit_rr(Op::ToList, list, keys);
                let dst = self.alloc_temp()?;
                self.b.emit_slow_rrr(SlowOp::HashSlice, dst, hash, list);
                Ok(dst)
            }
            op => {
                // Fused immediate form for `expr + small-int`.
                if *op == BinaryOp::Add
                    && let Some(imm) = small_int_literal(&binary.rhs)
                {
                    let lhs = self.expr(&binary.lhs, Context::Scalar)?;
                    let dst = self.alloc_temp()?;
                    self.b.emit_rr_imm(Op::AddImm, dst, lhs, imm);
                    return Ok(dst);
                }
                let opcode = binop_opcode(op)
                    .ok_or_else(|| PerlError::compile(format!("unsupported binary operator {op:?}"), binary.pos))?;
                let lhs = self.expr(&binary.lhs, Context::Scalar)?;
                let rhs = self.expr(&binary.rhs, Context::Scalar)?;
                let dst = self.alloc_temp()?;
                self.b.emit_rrr(opcode, dst, lhs, rhs);
                Ok(dst)
            }
        }
    }

    fn build_args(&mut self, args: &Node) -> PerlResult<u8> {
        let reg = self.alloc_temp()?;
        self.b.emit_r(Op::NewArray, reg);
        match args {
            Node::List(list) => {
                for elem in &list.elems {
                    let value = self.expr(elem, Context::List)?;
                    self.b.emit_rr(Op::ArrayPush, reg, value);
                }
            }
            other => {
                let value = self.expr(other, Context::List)?;
                self.b.emit_rr(Op::ArrayPush, reg, value);
            }
        }
        Ok(reg)
    }

    fn compile_call(&mut self, callee: &Node, args: &Node, cx: Context) -> PerlResult<u8> {
        let code = match callee {
            Node::Ident(ident) if matches!(ident.sigil, Sigil::Bare | Sigil::Code) => {
                let dst = self.alloc_temp()?;
                let index = self.global_str(&ident.name);
                self.b.emit_r_idx(Op::LoadGlobalCode, dst, index);
                dst
            }
            other => self.expr(other, Context::Scalar)?,
        };
        let args_reg = self.build_args(args)?;
        let dst = self.alloc_temp()?;
        self.b.emit_call(dst, code, args_reg, cx as u8);
        Ok(dst)
    }

    fn compile_assign(&mut self, lhs: &Node, rhs: &Node) -> PerlResult<u8> {
        match lhs {
            Node::Unary(unary) if unary.op == UnaryOp::My => match &unary.operand {
                Some(Node::Ident(ident)) => match ident.sigil {
                    Sigil::Scalar => {
                        let reg = self.declare_my(ident)?;
                        let value = self.expr(rhs, Context::Scalar)?;
                        self.b.emit_rr(Op::SetScalar, reg, value);
                        Ok(reg)
                    }
                    Sigil::Array => {
                        let reg = self.declare_my(ident)?;
                        let value = self.expr(rhs, Context::List)?;
                        let list = self.alloc_temp()?;
                        self.b.emit_rr(Op::ToList, list, value);
                        self.b.emit_rr(Op::ArrayAssign, reg, list);
                        Ok(reg)
                    }
                    Sigil::Hash => {
                        let reg = self.declare_my(ident)?;
                        let value = self.expr(rhs, Context::List)?;
                        let list = self.alloc_temp()?;
                        self.b.emit_rr(Op::ToList, list, value);
                        self.b.emit_rr(Op::HashAssign, reg, list);
                        Ok(reg)
                    }
                    _ => Err(PerlError::compile("cannot declare this as my", unary.pos)),
                },
                Some(Node::List(targets)) => {
                    let mut regs = Vec::new();
                    for target in &targets.elems {
                        match target {
                            Node::Ident(ident) => regs.push((ident.sigil, self.declare_my(ident)?)),
                            other => return Err(PerlError::compile("my list must contain variables", other.pos())),
                        }
                    }
                    self.assign_list_targets(&regs, rhs)
                }
                _ => Err(PerlError::compile("my requires a variable", unary.pos)),
            },
            Node::Unary(unary) if unary.op == UnaryOp::Local => match &unary.operand {
                Some(Node::Ident(ident)) if ident.sigil == Sigil::Scalar => {
                    let index = self.global_str(&ident.name);
                    self.b.emit_slow_str(SlowOp::LocalSave, index);
                    let value = self.expr(rhs, Context::Scalar)?;
                    self.b.emit_idx_r(Op::StoreGlobalScalar, index, value);
                    Ok(value)
                }
                _ => Err(PerlError::compile("local requires a global scalar", unary.pos)),
            },
            Node::Ident(ident) => self.assign_ident(ident, rhs),
            Node::Binary(binary) if binary.op == BinaryOp::ElemArray => {
                let array = self.array_operand(&binary.lhs)?;
                let index = self.expr(&binary.rhs, Context::Scalar)?;
                let value = self.expr(rhs, Context::Scalar)?;
                self.b.emit_rrr(Op::ArraySet, array, index, value);
                Ok(value)
            }
            Node::Binary(binary) if binary.op == BinaryOp::ElemHash => {
                let hash = self.hash_operand(&binary.lhs)?;
                let key = self.expr(&binary.rhs, Context::Scalar)?;
                let value = self.expr(rhs, Context::Scalar)?;
                self.b.emit_rrr(Op::HashSet, hash, key, value);
                Ok(value)
            }
            Node::Unary(unary) if unary.op == UnaryOp::DerefScalar => {
                let slot = self.lvalue_slot(Some(lhs), unary.pos)?;
                let value = self.expr(rhs, Context::Scalar)?;
                self.b.emit_rr(Op::SetScalar, slot, value);
                Ok(slot)
            }
            Node::List(targets) => {
                let mut regs = Vec::new();
                for target in &targets.elems {
                    let reg = self.lvalue_slot(Some(target), target.pos())?;
                    regs.push((Sigil::Scalar, reg));
                }
                self.assign_list_targets(&regs, rhs)
            }
            other => Err(PerlError::compile("cannot assign to this expression", other.pos())),
        }
    }

    fn assign_ident(&mut self, ident: &IdentNode, rhs: &Node) -> PerlResult<u8> {
        match ident.sigil {
            Sigil::Scalar => {
                if let Some((reg, global)) = self.lookup_reg(Sigil::Scalar, &ident.name) {
                    if let Some(global) = global {
                        let index = self.b.add_str(&global);
                        let value = self.expr(rhs, Context::Scalar)?;
                        self.b.emit_idx_r(Op::StoreGlobalScalar, index, value);
                        return Ok(value);
                    }
                    let value = self.expr(rhs, Context::Scalar)?;
                    self.b.emit_rr(Op::SetScalar, reg, value);
                    return Ok(reg);
                }
                if let Some(persistent) = self.opts.outer_lexicals.get(&decorated(Sigil::Scalar, &ident.name)).cloned()
                {
                    // Write-through to an enclosing frame's lexical via its
                    // persistent slot, using set semantics.
                    let slot = self.alloc_temp()?;
                    let index = self.b.add_str(&persistent);
                    self.b.emit_slow_r_str(SlowOp::RetrievePersistentScalar, slot, index);
                    let value = self.expr(rhs, Context::Scalar)?;
                    self.b.emit_rr(Op::SetScalar, slot, value);
                    return Ok(slot);
                }
                let index = self.global_str(&ident.name);
                let value = self.expr(rhs, Context::Scalar)?;
                self.b.emit_idx_r(Op::StoreGlobalScalar, index, value);
                Ok(value)
            }
            Sigil::Array => {
                let value = self.expr(rhs, Context::List)?;
                let list = self.alloc_temp()?;
                self.b.emit_rr(Op::ToList, list, value);
                if &*ident.name == "_" || self.lookup(Sigil::Array, &ident.name).is_some() {
                    let array = self.compile_ident(ident)?;
                    self.b.emit_rr(Op::ArrayAssign, array, list);
                    Ok(array)
                } else {
                    let index = self.global_str(&ident.name);
                    self.b.emit_idx_r(Op::StoreGlobalArray, index, list);
                    Ok(list)
                }
            }
            Sigil::Hash => {
                let value = self.expr(rhs, Context::List)?;
                let list = self.alloc_temp()?;
                self.b.emit_rr(Op::ToList, list, value);
                if self.lookup(Sigil::Hash, &ident.name).is_some() {
                    let hash = self.compile_ident(ident)?;
                    self.b.emit_rr(Op::HashAssign, hash, list);
                    Ok(hash)
                } else {
                    let index = self.global_str(&ident.name);
                    self.b.emit_idx_r(Op::StoreGlobalHash, index, list);
                    Ok(list)
                }
            }
            _ => Err(PerlError::compile("cannot assign to this", ident.pos)),
        }
    }

    /// Distributes a right-hand list across scalar targets, with an
    /// optional trailing array/hash target slurping the rest.
    fn assign_list_targets(&mut self, targets: &[(Sigil, u8)], rhs: &Node) -> PerlResult<u8> {
        let value = self.expr(rhs, Context::List)?;
        let list = self.alloc_temp()?;
        self.b.emit_rr(Op::ToList, list, value);
        let spread = self.alloc_temp()?;
        self.b.emit_rr(Op::ArrayFromList, spread, list);
        for (position, (sigil, reg)) in targets.iter().enumerate() {
            let position_imm = i32::try_from(position).unwrap_or(i32::MAX);
            match sigil {
                Sigil::Array | Sigil::Hash => {
                    let offset = self.alloc_temp()?;
                    self.b.emit_r_imm(Op::LoadInt, offset, position_imm);
                    let tail = self.alloc_temp()?;
                    self.b.emit_slow_rrr(SlowOp::TailList, tail, spread, offset);
                    let op = if *sigil == Sigil::Array { Op::ArrayAssign } else { Op::HashAssign };
                    self.b.emit_rr(op, *reg, tail);
                    break;
                }
                _ => {
                    let index = self.alloc_temp()?;
                    self.b.emit_r_imm(Op::LoadInt, index, position_imm);
                    let element = self.alloc_temp()?;
                    self.b.emit_rrr(Op::ArrayGet, element, spread, index);
                    self.b.emit_rr(Op::SetScalar, *reg, element);
                }
            }
        }
        Ok(list)
    }

    fn compile_try(&mut self, try_node: &TryNode) -> PerlResult<u8> {
        let dst = self.alloc_pinned()?;
        self.b.emit_r(Op::NewScalar, dst);
        let start = self.b.current_offset();

        let body_value = self.block_value(&try_node.body)?;
        match body_value {
            Some(reg) => self.b.emit_rr(Op::Move, dst, reg),
            None => self.b.emit_r(Op::LoadUndef, dst),
        }
        // Successful completion clears $@.
        let empty = self.alloc_temp()?;
        let empty_index = self.b.add_str("");
        self.b.emit_r_idx(Op::LoadStr, empty, empty_index);
        let err_index = self.b.add_str("main::@");
        self.b.emit_idx_r(Op::StoreGlobalScalar, err_index, empty);
        if let Some(finally) = &try_node.finally {
            self.block_stmts(finally)?;
        }
        let to_end = self.b.emit_jump();

        let handler = self.b.current_offset();
        self.b.emit_r(Op::LoadUndef, dst);
        self.push_scope();
        let catch_reg = match (&try_node.catch_var, &try_node.catch) {
            (Some(var), Some(_)) => {
                let reg = self.alloc_pinned()?;
                self.declare_entry(LexEntry {
                    sigil: var.sigil,
                    name: var.name.clone(),
                    reg,
                    persistent: None,
                    global: None,
                });
                Some(reg)
            }
            _ => None,
        };
        if let Some(catch) = &try_node.catch {
            self.block_stmts(catch)?;
        }
        self.pop_scope();
        if let Some(finally) = &try_node.finally {
            self.block_stmts(finally)?;
        }
        self.b.patch_jump(to_end);

        self.b.add_exception_entry(ExceptionEntry {
            start: u32::try_from(start).expect("offset fits u32"),
            end: u32::try_from(handler).expect("offset fits u32"),
            handler: u32::try_from(handler).expect("offset fits u32"),
            catch_reg,
        });
        Ok(dst)
    }
}

/// Decorated lexical-map key (`$w`, `@rows`, `%seen`).
pub(crate) fn decorated(sigil: Sigil, name: &str) -> Arc<str> {
    let mark = match sigil {
        Sigil::Scalar => '$',
        Sigil::Array => '@',
        Sigil::Hash => '%',
        Sigil::Code => '&',
        Sigil::Bare => '*',
    };
    Arc::from(format!("{mark}{name}"))
}

/// Scans a compilation unit for lexicals captured by nested subroutines
/// and for the presence of a string eval. Shared by both compilers.
pub(crate) fn collect_promotions(body: &BlockNode) -> (AHashSet<(Sigil, Arc<str>)>, bool) {
    let mut promoted = AHashSet::new();
    let mut has_eval = false;
    for stmt in &body.stmts {
        scan_node(stmt, &mut promoted, &mut has_eval);
    }
    (promoted, has_eval)
}

fn scan_node(node: &Node, promoted: &mut AHashSet<(Sigil, Arc<str>)>, has_eval: &mut bool) {
    match node {
        Node::Sub(sub) => {
            for Capture { sigil, name } in free_variables(&sub.body) {
                promoted.insert((sigil, name));
            }
            // Deeper nesting is handled when the inner sub compiles.
        }
        Node::Unary(unary) => {
            if unary.op == UnaryOp::EvalStr {
                *has_eval = true;
            }
            if let Some(operand) = &unary.operand {
                scan_node(operand, promoted, has_eval);
            }
        }
        Node::Binary(binary) => {
            scan_node(&binary.lhs, promoted, has_eval);
            scan_node(&binary.rhs, promoted, has_eval);
        }
        Node::Ternary(ternary) => {
            scan_node(&ternary.cond, promoted, has_eval);
            scan_node(&ternary.then_expr, promoted, has_eval);
            scan_node(&ternary.else_expr, promoted, has_eval);
        }
        Node::Str(string) => {
            for segment in &string.parts {
                if let StrPart::Expr(expr) = segment {
                    scan_node(expr, promoted, has_eval);
                }
            }
        }
        Node::Block(block) => {
            for stmt in &block.stmts {
                scan_node(stmt, promoted, has_eval);
            }
        }
        Node::List(list) | Node::ArrayLit(list) | Node::HashLit(list) => {
            for elem in &list.elems {
                scan_node(elem, promoted, has_eval);
            }
        }
        Node::If(if_node) => {
            scan_node(&if_node.cond, promoted, has_eval);
            for stmt in &if_node.then_block.stmts {
                scan_node(stmt, promoted, has_eval);
            }
            if let Some(else_branch) = &if_node.else_branch {
                scan_node(else_branch, promoted, has_eval);
            }
        }
        Node::Foreach(foreach) => {
            scan_node(&foreach.list, promoted, has_eval);
            for stmt in &foreach.body.stmts {
                scan_node(stmt, promoted, has_eval);
            }
        }
        Node::For(for_node) => {
            for part in [&for_node.init, &for_node.cond, &for_node.step].into_iter().flatten() {
                scan_node(part, promoted, has_eval);
            }
            for stmt in &for_node.body.stmts {
                scan_node(stmt, promoted, has_eval);
            }
        }
        Node::Try(try_node) => {
            for stmt in &try_node.body.stmts {
                scan_node(stmt, promoted, has_eval);
            }
            for block in [&try_node.catch, &try_node.finally].into_iter().flatten() {
                for stmt in &block.stmts {
                    scan_node(stmt, promoted, has_eval);
                }
            }
        }
        Node::Label(label) => scan_node(&label.stmt, promoted, has_eval),
        Node::Number(_) | Node::Ident(_) | Node::Flag(_) => {}
    }
}

fn binop_opcode(op: &BinaryOp) -> Option<Op> {
    Some(match op {
        BinaryOp::Add => Op::Add,
        BinaryOp::Subtract => Op::Subtract,
        BinaryOp::Multiply => Op::Multiply,
        BinaryOp::Divide => Op::Divide,
        BinaryOp::Modulus => Op::Modulus,
        BinaryOp::Power => Op::Power,
        BinaryOp::Concat => Op::Concat,
        BinaryOp::Repeat => Op::Repeat,
        BinaryOp::NumEq => Op::NumEq,
        BinaryOp::NumNe => Op::NumNe,
        BinaryOp::NumLt => Op::NumLt,
        BinaryOp::NumLe => Op::NumLe,
        BinaryOp::NumGt => Op::NumGt,
        BinaryOp::NumGe => Op::NumGe,
        BinaryOp::StrEq => Op::StrEq,
        BinaryOp::StrNe => Op::StrNe,
        BinaryOp::StrLt => Op::StrLt,
        BinaryOp::StrLe => Op::StrLe,
        BinaryOp::StrGt => Op::StrGt,
        BinaryOp::StrGe => Op::StrGe,
        BinaryOp::NumCmp => Op::NumCmp,
        BinaryOp::StrCmp => Op::StrCmp,
        _ => return None,
    })
}

fn small_int_literal(node: &Node) -> Option<i32> {
    match node {
        Node::Number(number) => match number.value {
            NumLit::Int(value) => i32::try_from(value).ok(),
            NumLit::Num(_) => None,
        },
        _ => None,
    }
}

/// Folds numeric-literal subtrees at compile time.
fn fold_binary(binary: &BinaryNode) -> Option<NumLit> {
    fn fold(node: &Node) -> Option<NumLit> {
        match node {
            Node::Number(number) => Some(number.value),
            Node::Binary(binary) => fold_binary(binary),
            _ => None,
        }
    }
    let lhs = fold(&binary.lhs)?;
    let rhs = fold(&binary.rhs)?;
    match binary.op {
        BinaryOp::Add => fold_arith(lhs, rhs, i64::checked_add, |a, b| a + b),
        BinaryOp::Subtract => fold_arith(lhs, rhs, i64::checked_sub, |a, b| a - b),
        BinaryOp::Multiply => fold_arith(lhs, rhs, i64::checked_mul, |a, b| a * b),
        _ => None,
    }
}

fn fold_arith(
    lhs: NumLit,
    rhs: NumLit,
    int_op: impl Fn(i64, i64) -> Option<i64>,
    num_op: impl Fn(f64, f64) -> f64,
) -> Option<NumLit> {
    match (lhs, rhs) {
        (NumLit::Int(a), NumLit::Int(b)) => int_op(a, b).map(NumLit::Int),
        (a, b) => {
            let widen = |value: NumLit| match value {
                NumLit::Int(v) => v as f64,
                NumLit::Num(v) => v,
            };
            Some(NumLit::Num(num_op(widen(a), widen(b))))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::build::{binary, block, call, for_loop, int, my_scalar, scalar, unary};
    use crate::bytecode::disassemble;

    fn compile(body: BlockNode) -> Arc<Code> {
        let env = Environment::new();
        compile_sub_body(
            &env,
            &body,
            "t",
            &CompileCtx::new("t.pl"),
            &CompileOptions::default(),
            Vec::new(),
        )
        .unwrap()
    }

    #[test]
    fn test_constant_folding() {
        let code = compile(block(vec![my_scalar(
            "x",
            binary(BinaryOp::Add, int(2), binary(BinaryOp::Multiply, int(3), int(4))),
        )]));
        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("LoadInt"), "folded literal expected:\n{listing}");
        assert!(listing.contains("14"), "folded value expected:\n{listing}");
        assert!(!listing.contains("Multiply"), "fold should remove the multiply:\n{listing}");
    }

    #[test]
    fn test_add_imm_fast_path() {
        let code = compile(block(vec![my_scalar(
            "x",
            binary(BinaryOp::Add, scalar("y"), int(1)),
        )]));
        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("AddImm"), "unboxed add expected:\n{listing}");
    }

    #[test]
    fn test_compound_add_uses_superinstruction() {
        let code = compile(block(vec![
            my_scalar("x", int(0)),
            binary(BinaryOp::AddAssign, scalar("x"), int(5)),
        ]));
        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("AddAssignImm"), "fused += imm expected:\n{listing}");
    }

    #[test]
    fn test_loop_induction_fuses() {
        let body = block(vec![for_loop(
            Some(my_scalar("i", int(0))),
            Some(binary(BinaryOp::NumLt, scalar("i"), int(10))),
            Some(unary(UnaryOp::PostInc, scalar("i"))),
            block(vec![call("print", vec![scalar("i")])]),
        )]);
        let listing = disassemble(&compile(body)).unwrap();
        assert!(listing.contains("IncCmpBr"), "fused induction expected:\n{listing}");
    }

    #[test]
    fn test_nonlocal_last_emits_marker_op() {
        let code = compile(block(vec![unary0_last()]));
        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("CtrlLast"), "marker op expected:\n{listing}");
    }

    fn unary0_last() -> Node {
        crate::ast::build::unary0(UnaryOp::Last)
    }

    #[test]
    fn test_store_global_scalar_for_package_vars() {
        let code = compile(block(vec![binary(BinaryOp::Assign, scalar("w"), int(20))]));
        let listing = disassemble(&code).unwrap();
        assert!(listing.contains("StoreGlobalScalar"), "{listing}");
        assert!(listing.contains("main::w"), "{listing}");
    }

    #[test]
    fn test_captured_lexical_binds_persistent_slot() {
        let env = Environment::new();
        let body = block(vec![
            my_scalar("w", int(20)),
            crate::ast::build::sub_named(
                "neighbors",
                block(vec![crate::ast::build::ret(binary(
                    BinaryOp::Multiply,
                    scalar("w"),
                    int(2),
                ))]),
            ),
        ]);
        let code = compile_sub_body(
            &env,
            &body,
            "t",
            &CompileCtx::new("t.pl"),
            &CompileOptions::default(),
            Vec::new(),
        )
        .unwrap();
        let listing = disassemble(&code).unwrap();
        assert!(
            listing.contains("RetrievePersistentScalar"),
            "outer my should bind a persistent slot:\n{listing}"
        );
        let inner = env.get_code("main::neighbors").expect("named sub defined at compile time");
        match inner.kind() {
            crate::function::SubKind::Bytecode(inner_code) => {
                let inner_listing = disassemble(inner_code).unwrap();
                assert!(
                    inner_listing.contains("RetrievePersistentScalar"),
                    "capture prologue expected:\n{inner_listing}"
                );
            }
            other => panic!("expected bytecode sub, got {other:?}"),
        }
    }

    #[test]
    fn test_disassembly_is_deterministic() {
        let body = block(vec![
            my_scalar("x", int(1)),
            call("print", vec![scalar("x")]),
        ]);
        let a = disassemble(&compile(body.clone())).unwrap();
        let b = disassemble(&compile(body)).unwrap();
        assert_eq!(a, b);
    }
}
