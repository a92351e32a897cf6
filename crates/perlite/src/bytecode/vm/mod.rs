//! The register-machine dispatch loop.
//!
//! A single dense `match` on the opcode byte forms the hot path; the Rust
//! compiler lowers the gap-free discriminant space to a jump table. Cold
//! opcode groups (comparisons, container operations, reference operations)
//! are delegated to secondary functions at the match tail, keeping the hot
//! function small; the `Slow` gateway decodes a sub-opcode and performs its
//! own dense dispatch.
//!
//! Each frame owns its registers, program counter, loop-scope stack, and
//! `local` save list. Loop scopes are how control-flow markers returned by
//! callees find their target: the scope stack is scanned innermost-out,
//! and an unmatched marker propagates to the caller.

mod cold;
mod slow;

use std::sync::Arc;

use super::code::Code;
use super::op::{NO_LABEL, Op};
use crate::container::ArrayRef;
use crate::error::{PerlError, PerlResult};
use crate::function::{CodeRef, Flow};
use crate::run::Interp;
use crate::value::{Context, List, Scalar, ScalarRef, Value, resolve_code};

/// Fetches one bytecode byte, advancing the program counter.
macro_rules! fetch_u8 {
    ($f:expr) => {{
        let byte = $f.code.bytecode()[$f.pc];
        $f.pc += 1;
        byte
    }};
}

/// Fetches a little-endian `u16` operand.
macro_rules! fetch_u16 {
    ($f:expr) => {{
        let lo = $f.code.bytecode()[$f.pc];
        let hi = $f.code.bytecode()[$f.pc + 1];
        $f.pc += 2;
        u16::from_le_bytes([lo, hi])
    }};
}

/// Fetches a little-endian `i32` immediate.
macro_rules! fetch_i32 {
    ($f:expr) => {{
        let bytes = [
            $f.code.bytecode()[$f.pc],
            $f.code.bytecode()[$f.pc + 1],
            $f.code.bytecode()[$f.pc + 2],
            $f.code.bytecode()[$f.pc + 3],
        ];
        $f.pc += 4;
        i32::from_le_bytes(bytes)
    }};
}

pub(crate) use {fetch_u8, fetch_u16};

/// An active loop within a frame, pushed by `EnterLoop`.
#[derive(Debug)]
struct LoopScope {
    label: Option<Arc<str>>,
    redo_pc: usize,
    next_pc: usize,
    last_pc: usize,
}

/// One bytecode activation record.
pub(crate) struct Frame<'c> {
    pub(crate) code: &'c Code,
    pub(crate) pc: usize,
    pub(crate) regs: Vec<Value>,
    pub(crate) cx: Context,
    loops: Vec<LoopScope>,
    saved_locals: Vec<(Arc<str>, Scalar)>,
}

/// Executes a bytecode artifact under the shared `apply` ABI.
pub(crate) fn run(interp: &mut Interp, code: &Code, me: &CodeRef, args: &ArrayRef, cx: Context) -> PerlResult<Flow> {
    let cx = if cx == Context::Runtime { Context::List } else { cx };
    let mut frame = Frame {
        code,
        pc: 0,
        regs: vec![Value::None; usize::from(code.max_regs().max(3))],
        cx,
        loops: Vec::new(),
        saved_locals: Vec::new(),
    };
    frame.regs[0] = Value::Code(me.clone());
    frame.regs[1] = Value::Array(args.clone());
    frame.regs[2] = Value::Ctx(cx);

    let result = exec_loop(interp, &mut frame);

    // `local` teardown runs on every exit path, reverse order.
    for (name, saved) in frame.saved_locals.drain(..).rev() {
        interp.env().get_scalar(&name).set(saved);
    }
    result
}

fn exec_loop(interp: &mut Interp, f: &mut Frame<'_>) -> PerlResult<Flow> {
    loop {
        let instr_pc = f.pc;
        match step(interp, f) {
            Ok(None) => {}
            Ok(Some(flow)) => return Ok(flow),
            Err(err) => {
                let pc = u32::try_from(instr_pc).unwrap_or(u32::MAX);
                let line = f.code.line_for(pc).unwrap_or(0);
                let err = err.with_location(f.code.file().clone(), line);
                if err.catchable()
                    && let Some(entry) = f.code.handler_for(pc)
                {
                    interp.env().set_err_var(err.to_err_var());
                    if let Some(catch_reg) = entry.catch_reg {
                        f.regs[usize::from(catch_reg)] = Value::Scalar(ScalarRef::new(err.to_err_var()));
                    }
                    f.pc = entry.handler as usize;
                    continue;
                }
                return Err(err);
            }
        }
    }
}

/// Decodes and executes one instruction.
///
/// Returns `Some(flow)` when the frame is done (normal return or an
/// unmatched control marker propagating to the caller).
fn step(interp: &mut Interp, f: &mut Frame<'_>) -> PerlResult<Option<Flow>> {
    let byte = fetch_u8!(f);
    let Some(op) = Op::from_repr(byte) else {
        // An undispatched opcode is an implementation bug; surface it
        // loudly with the opcode number and program counter.
        return Err(PerlError::internal(format!(
            "no dispatch case for opcode {byte:#04x} at pc {}",
            f.pc - 1
        )));
    };
    interp.trace_op(f.pc - 1, op);

    match op {
        Op::Nop => {}
        Op::Jump => {
            let target = fetch_u16!(f);
            f.pc = usize::from(target);
        }
        Op::JumpIfTrue => {
            let reg = fetch_u8!(f);
            let target = fetch_u16!(f);
            let value = f.regs[usize::from(reg)].scalar_value();
            if interp.truthy(&value)? {
                f.pc = usize::from(target);
            }
        }
        Op::JumpIfFalse => {
            let reg = fetch_u8!(f);
            let target = fetch_u16!(f);
            let value = f.regs[usize::from(reg)].scalar_value();
            if !interp.truthy(&value)? {
                f.pc = usize::from(target);
            }
        }
        Op::Return => {
            let reg = fetch_u8!(f);
            return Ok(Some(Flow::Ret(f.regs[usize::from(reg)].list_value())));
        }
        Op::ReturnEmpty => return Ok(Some(Flow::empty())),
        Op::EnterLoop => {
            let label_index = fetch_u16!(f);
            let redo_pc = usize::from(fetch_u16!(f));
            let next_pc = usize::from(fetch_u16!(f));
            let last_pc = usize::from(fetch_u16!(f));
            let label = (label_index != NO_LABEL).then(|| f.code.string(label_index).clone());
            f.loops.push(LoopScope {
                label,
                redo_pc,
                next_pc,
                last_pc,
            });
        }
        Op::ExitLoop => {
            f.loops.pop();
        }
        Op::CtrlLast | Op::CtrlNext | Op::CtrlRedo => {
            let label_index = fetch_u16!(f);
            let label = (label_index != NO_LABEL).then(|| f.code.string(label_index).clone());
            let marker = match op {
                Op::CtrlLast => Flow::Last { label, pos: 0 },
                Op::CtrlNext => Flow::Next { label, pos: 0 },
                _ => Flow::Redo { label, pos: 0 },
            };
            return Ok(Some(marker));
        }
        Op::TailCall => {
            let code_reg = fetch_u8!(f);
            let args_reg = fetch_u8!(f);
            let code = resolve_code(&f.regs[usize::from(code_reg)])?;
            let args = f.regs[usize::from(args_reg)].expect_array()?.clone();
            return Ok(Some(Flow::TailCall { code, args }));
        }
        Op::LoadUndef => {
            let reg = fetch_u8!(f);
            f.regs[usize::from(reg)] = Value::Scalar(ScalarRef::undef());
        }
        Op::LoadInt => {
            let reg = fetch_u8!(f);
            let imm = fetch_i32!(f);
            f.regs[usize::from(reg)] = Value::Scalar(ScalarRef::new(Scalar::Int(i64::from(imm))));
        }
        Op::LoadConst => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let value = f.code.constant(index).clone();
            f.regs[usize::from(reg)] = Value::Scalar(ScalarRef::new(value));
        }
        Op::LoadStr => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let text = f.code.string(index).clone();
            f.regs[usize::from(reg)] = Value::Scalar(ScalarRef::new(Scalar::Str(text)));
        }
        Op::LoadGlobalScalar => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index);
            f.regs[usize::from(reg)] = Value::Scalar(interp.env().get_scalar(name));
        }
        Op::LoadGlobalArray => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index);
            f.regs[usize::from(reg)] = Value::Array(interp.env().get_array(name));
        }
        Op::LoadGlobalHash => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index);
            f.regs[usize::from(reg)] = Value::Hash(interp.env().get_hash(name));
        }
        Op::LoadGlobalCode => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index).clone();
            let code = interp
                .env()
                .resolve_function(&name)
                .ok_or_else(|| PerlError::runtime(format!("Undefined subroutine &{name} called")))?;
            f.regs[usize::from(reg)] = Value::Code(code);
        }
        Op::StoreGlobalScalar => {
            let index = fetch_u16!(f);
            let reg = fetch_u8!(f);
            let name = f.code.string(index);
            // Value-set: mutate the existing slot so captured aliases in
            // compiled peers observe the update.
            let value = f.regs[usize::from(reg)].scalar_value();
            interp.env().get_scalar(name).set(value);
        }
        Op::StoreGlobalArray => {
            let index = fetch_u16!(f);
            let reg = fetch_u8!(f);
            let name = f.code.string(index);
            let list = f.regs[usize::from(reg)].list_value();
            interp.env().get_array(name).assign_list(&list);
        }
        Op::StoreGlobalHash => {
            let index = fetch_u16!(f);
            let reg = fetch_u8!(f);
            let name = f.code.string(index).clone();
            let list = f.regs[usize::from(reg)].list_value();
            interp.env().get_hash(&name).assign_list(&list, interp.env().interner());
        }
        Op::Move => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            f.regs[usize::from(dst)] = f.regs[usize::from(src)].clone();
        }
        Op::SetScalar => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            f.regs[usize::from(dst)].expect_scalar()?.set(value);
        }
        Op::NewScalar => {
            let reg = fetch_u8!(f);
            f.regs[usize::from(reg)] = Value::Scalar(ScalarRef::undef());
        }
        Op::NewArray => {
            let reg = fetch_u8!(f);
            f.regs[usize::from(reg)] = Value::Array(ArrayRef::new());
        }
        Op::NewHash => {
            let reg = fetch_u8!(f);
            f.regs[usize::from(reg)] = Value::Hash(crate::container::HashRef::new());
        }
        Op::NewList => {
            let reg = fetch_u8!(f);
            f.regs[usize::from(reg)] = Value::List(List::new());
        }
        Op::Add | Op::Subtract | Op::Multiply | Op::Divide | Op::Modulus | Op::Power | Op::Concat | Op::Repeat => {
            cold::step_binary(interp, f, op)?;
        }
        Op::Negate => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            let result = interp.un_op(crate::value::ScalarUnOp::Negate, &value)?;
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
        }
        Op::AddImm => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let imm = fetch_i32!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            // Unboxed fast path: integer addition without overload checks
            // or pool traffic.
            let result = match value {
                Scalar::Int(x) => match x.checked_add(i64::from(imm)) {
                    Some(sum) => Scalar::Int(sum),
                    None => Scalar::Num(x as f64 + f64::from(imm)),
                },
                other => interp.bin_op(crate::value::ScalarBinOp::Add, &other, &Scalar::Int(i64::from(imm)))?,
            };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
        }
        Op::StrLength => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            let result = if value.is_undef() {
                Scalar::Undef
            } else {
                let text = interp.stringify(&value)?;
                Scalar::Int(text.chars().count() as i64)
            };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
        }
        Op::Substr => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let off = fetch_u8!(f);
            let len = fetch_u8!(f);
            let text = f.regs[usize::from(src)].scalar_value();
            let offset = f.regs[usize::from(off)].scalar_value().as_int();
            let length = f.regs[usize::from(len)].scalar_value();
            let length = if length.is_undef() { None } else { Some(length.as_int()) };
            let result = crate::value::substr_plain(&text, offset, length, interp.env().interner())?;
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
        }
        Op::NumEq
        | Op::NumNe
        | Op::NumLt
        | Op::NumLe
        | Op::NumGt
        | Op::NumGe
        | Op::StrEq
        | Op::StrNe
        | Op::StrLt
        | Op::StrLe
        | Op::StrGt
        | Op::StrGe
        | Op::NumCmp
        | Op::StrCmp => cold::step_compare(interp, f, op)?,
        Op::Not => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            let result = Scalar::from_bool(!interp.truthy(&value)?);
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
        }
        Op::Defined => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            let defined = match value {
                Scalar::Undef => false,
                Scalar::Weak(weak) => !weak.upgrade().is_undef(),
                _ => true,
            };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::from_bool(defined)));
        }
        Op::ArrayPush
        | Op::ArrayPop
        | Op::ArrayShift
        | Op::ArrayUnshift
        | Op::ArrayGet
        | Op::ArraySet
        | Op::ArrayLen
        | Op::ArrayFromList
        | Op::ArrayAssign
        | Op::ListPush
        | Op::Range
        | Op::HashAssign
        | Op::HashGet
        | Op::HashSet
        | Op::HashDelete
        | Op::HashExists
        | Op::HashKeys
        | Op::HashValues => cold::step_container(interp, f, op)?,
        Op::Call => {
            let dst = fetch_u8!(f);
            let code_reg = fetch_u8!(f);
            let args_reg = fetch_u8!(f);
            let cx_byte = fetch_u8!(f);
            let cx = resolve_ctx(cx_byte, f.cx);
            let code = resolve_code(&f.regs[usize::from(code_reg)])?;
            let args = f.regs[usize::from(args_reg)].expect_array()?.clone();
            match interp.apply(&code, args, cx)? {
                Flow::Ret(list) => f.regs[usize::from(dst)] = Value::List(list),
                marker => {
                    // The minimal post-call check: a marker dispatches
                    // against this frame's loop scopes or propagates.
                    if let Some(flow) = route_marker(f, marker) {
                        return Ok(Some(flow));
                    }
                }
            }
        }
        Op::CallMethod => {
            let dst = fetch_u8!(f);
            let invocant_reg = fetch_u8!(f);
            let name_index = fetch_u16!(f);
            let args_reg = fetch_u8!(f);
            let cx_byte = fetch_u8!(f);
            let cx = resolve_ctx(cx_byte, f.cx);
            let invocant = f.regs[usize::from(invocant_reg)].scalar_value();
            let name = f.code.string(name_index).clone();
            let args = f.regs[usize::from(args_reg)].expect_array()?.clone();
            match interp.call_method(&invocant, &name, &args, cx)? {
                Flow::Ret(list) => f.regs[usize::from(dst)] = Value::List(list),
                marker => {
                    if let Some(flow) = route_marker(f, marker) {
                        return Ok(Some(flow));
                    }
                }
            }
        }
        Op::Wantarray => {
            let reg = fetch_u8!(f);
            let value = match f.cx {
                Context::List => Scalar::Int(1),
                Context::Scalar => Scalar::from_str_slice(""),
                _ => Scalar::Undef,
            };
            f.regs[usize::from(reg)] = Value::Scalar(ScalarRef::new(value));
        }
        Op::ToScalar => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(value));
        }
        Op::ToList => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let list = f.regs[usize::from(src)].list_value();
            f.regs[usize::from(dst)] = Value::List(list);
        }
        Op::MakeRef | Op::DerefScalar | Op::DerefArray | Op::DerefHash | Op::DerefCode => {
            cold::step_refs(f, op)?;
        }
        Op::MakeSub => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            match f.code.constant(index) {
                Scalar::Code(code) => f.regs[usize::from(reg)] = Value::Code(code.clone()),
                other => {
                    return Err(PerlError::internal(format!(
                        "MakeSub constant holds {} instead of code",
                        other.plain_message()
                    )));
                }
            }
        }
        Op::Slow => slow::dispatch(interp, f)?,
        Op::Inc => {
            let reg = fetch_u8!(f);
            let slot = f.regs[usize::from(reg)].expect_scalar()?;
            slot.update(|value| *value = scalar_step(value, 1));
        }
        Op::Dec => {
            let reg = fetch_u8!(f);
            let slot = f.regs[usize::from(reg)].expect_scalar()?;
            slot.update(|value| *value = scalar_step(value, -1));
        }
        Op::PostInc | Op::PostDec => {
            let dst = fetch_u8!(f);
            let var = fetch_u8!(f);
            let delta = if op == Op::PostInc { 1 } else { -1 };
            let slot = f.regs[usize::from(var)].expect_scalar()?.clone();
            let old = slot.update(|value| {
                let previous = value.clone();
                *value = scalar_step(value, delta);
                previous
            });
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(old));
        }
        Op::AddAssign => {
            let var = fetch_u8!(f);
            let rhs = fetch_u8!(f);
            let addend = f.regs[usize::from(rhs)].scalar_value();
            let slot = f.regs[usize::from(var)].expect_scalar()?.clone();
            let current = slot.get();
            let result = interp.bin_op(crate::value::ScalarBinOp::Add, &current, &addend)?;
            slot.set(result);
        }
        Op::AddAssignImm => {
            let var = fetch_u8!(f);
            let imm = fetch_i32!(f);
            let slot = f.regs[usize::from(var)].expect_scalar()?.clone();
            let current = slot.get();
            let result = match current {
                Scalar::Int(x) => match x.checked_add(i64::from(imm)) {
                    Some(sum) => Scalar::Int(sum),
                    None => Scalar::Num(x as f64 + f64::from(imm)),
                },
                other => interp.bin_op(crate::value::ScalarBinOp::Add, &other, &Scalar::Int(i64::from(imm)))?,
            };
            slot.set(result);
        }
        Op::IncCmpBr => {
            let var = fetch_u8!(f);
            let limit = fetch_u8!(f);
            let target = fetch_u16!(f);
            let slot = f.regs[usize::from(var)].expect_scalar()?;
            slot.update(|value| *value = scalar_step(value, 1));
            let current = f.regs[usize::from(var)].scalar_value();
            let bound = f.regs[usize::from(limit)].scalar_value();
            if crate::value::num_cmp_plain(&current, &bound) == Some(std::cmp::Ordering::Less) {
                f.pc = usize::from(target);
            }
        }
    }
    Ok(None)
}

fn resolve_ctx(byte: u8, frame_cx: Context) -> Context {
    match Context::from_u8(byte) {
        Context::Runtime => frame_cx,
        concrete => concrete,
    }
}

/// In-place increment/decrement used by the superinstructions.
fn scalar_step(value: &Scalar, delta: i64) -> Scalar {
    match value {
        Scalar::Int(x) => match x.checked_add(delta) {
            Some(stepped) => Scalar::Int(stepped),
            None => Scalar::Num(*x as f64 + delta as f64),
        },
        Scalar::Undef => Scalar::Int(delta.max(0)),
        other => match other.numify() {
            crate::value::Numeric::Int(x) => Scalar::Int(x.wrapping_add(delta)),
            crate::value::Numeric::Num(x) => Scalar::Num(x + delta as f64),
        },
    }
}

/// Dispatches a control marker against the frame's loop scopes.
///
/// Returns `None` when the marker was consumed (the program counter has
/// been redirected) or the marker itself when it must propagate.
fn route_marker(f: &mut Frame<'_>, marker: Flow) -> Option<Flow> {
    let (label, kind) = match &marker {
        Flow::Last { label, .. } => (label.clone(), 0u8),
        Flow::Next { label, .. } => (label.clone(), 1),
        Flow::Redo { label, .. } => (label.clone(), 2),
        _ => return Some(marker),
    };
    let index = match &label {
        // Unlabeled markers take the innermost loop without a scan.
        None => f.loops.len().checked_sub(1),
        Some(name) => f.loops.iter().rposition(|scope| scope.label.as_deref() == Some(&**name)),
    };
    let Some(index) = index else {
        return Some(marker);
    };
    match kind {
        0 => {
            let target = f.loops[index].last_pc;
            f.loops.truncate(index);
            f.pc = target;
        }
        1 => {
            let target = f.loops[index].next_pc;
            f.loops.truncate(index + 1);
            f.pc = target;
        }
        _ => {
            let target = f.loops[index].redo_pc;
            f.loops.truncate(index + 1);
            f.pc = target;
        }
    }
    None
}

/// Flattens a register value into element slots, preserving aliasing for
/// scalars and array elements (`@_` sees caller variables).
pub(crate) fn flatten_slots(value: &Value) -> Vec<ScalarRef> {
    match value {
        Value::None | Value::Ctx(_) => Vec::new(),
        Value::Scalar(slot) => vec![slot.clone()],
        Value::Array(array) => array.slots(),
        Value::Hash(hash) => hash.to_list().into_iter().map(ScalarRef::new).collect(),
        Value::Code(code) => vec![ScalarRef::new(Scalar::Code(code.clone()))],
        Value::List(list) => list.values().iter().cloned().map(ScalarRef::new).collect(),
    }
}
