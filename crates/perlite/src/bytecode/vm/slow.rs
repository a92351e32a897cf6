//! The slow-op gateway.
//!
//! `Op::Slow` decodes an 8-bit sub-opcode and dispatches over the cold
//! operations in a second dense table, trading a few nanoseconds of
//! indirection on rare paths for the preserved fast-opcode numbering.

use super::{Frame, fetch_u8, fetch_u16};
use crate::bytecode::op::SlowOp;
use crate::error::{PerlError, PerlResult};
use crate::run::Interp;
use crate::value::{Context, List, Ref, Scalar, ScalarRef, ScalarUnOp, Value};

pub(super) fn dispatch(interp: &mut Interp, f: &mut Frame<'_>) -> PerlResult<()> {
    let byte = fetch_u8!(f);
    let Some(sub) = SlowOp::from_repr(byte) else {
        return Err(PerlError::internal(format!(
            "no dispatch case for slow-op {byte:#04x} at pc {}",
            f.pc - 1
        )));
    };

    match sub {
        SlowOp::RetrievePersistentScalar => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index);
            f.regs[usize::from(reg)] = Value::Scalar(interp.env().get_persistent_scalar(name));
        }
        SlowOp::RetrievePersistentArray => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index);
            f.regs[usize::from(reg)] = Value::Array(interp.env().get_persistent_array(name));
        }
        SlowOp::RetrievePersistentHash => {
            let reg = fetch_u8!(f);
            let index = fetch_u16!(f);
            let name = f.code.string(index);
            f.regs[usize::from(reg)] = Value::Hash(interp.env().get_persistent_hash(name));
        }
        SlowOp::Splice => {
            let dst = fetch_u8!(f);
            let array_reg = fetch_u8!(f);
            let off_reg = fetch_u8!(f);
            let len_reg = fetch_u8!(f);
            let repl_reg = fetch_u8!(f);
            let array = f.regs[usize::from(array_reg)].expect_array()?.clone();
            let offset = f.regs[usize::from(off_reg)].scalar_value().as_int();
            let len_value = f.regs[usize::from(len_reg)].scalar_value();
            let length = if len_value.is_undef() { None } else { Some(len_value.as_int()) };
            let replacement = f.regs[usize::from(repl_reg)].list_value();
            let removed = array.splice(offset, length, &replacement);
            f.regs[usize::from(dst)] = Value::List(removed);
        }
        SlowOp::ArraySlice => {
            let dst = fetch_u8!(f);
            let array_reg = fetch_u8!(f);
            let index_reg = fetch_u8!(f);
            let array = f.regs[usize::from(array_reg)].expect_array()?.clone();
            let indices = f.regs[usize::from(index_reg)].list_value();
            f.regs[usize::from(dst)] = Value::List(array.slice(&indices));
        }
        SlowOp::HashSlice => {
            let dst = fetch_u8!(f);
            let hash_reg = fetch_u8!(f);
            let key_reg = fetch_u8!(f);
            let hash = f.regs[usize::from(hash_reg)].expect_hash()?.clone();
            let keys = f.regs[usize::from(key_reg)].list_value();
            f.regs[usize::from(dst)] = Value::List(hash.slice(&keys, interp.env().interner()));
        }
        SlowOp::Bless => {
            let ref_reg = fetch_u8!(f);
            let class_reg = fetch_u8!(f);
            let class_value = f.regs[usize::from(class_reg)].scalar_value();
            let class_name = interp.stringify(&class_value)?;
            let class = interp.env().class_id(&class_name);
            let overloaded = interp.env().classes().has_overloads(class);
            let target = f.regs[usize::from(ref_reg)].scalar_value();
            match target {
                Scalar::Ref(Ref::Array(array)) => array.bless(class, overloaded),
                Scalar::Ref(Ref::Hash(hash)) => hash.bless(class, overloaded),
                Scalar::Ref(_) => {
                    return Err(PerlError::runtime("Can only bless ARRAY or HASH references"));
                }
                _ => return Err(PerlError::runtime("Can't bless non-reference value")),
            }
        }
        SlowOp::Weaken => {
            let reg = fetch_u8!(f);
            let slot = f.regs[usize::from(reg)].expect_scalar()?;
            let weakened = match slot.get() {
                Scalar::Ref(Ref::Scalar(target)) => Scalar::Weak(target.downgrade()),
                Scalar::Ref(Ref::Array(array)) => Scalar::Weak(array.downgrade()),
                Scalar::Ref(Ref::Hash(hash)) => Scalar::Weak(hash.downgrade()),
                Scalar::Weak(existing) => Scalar::Weak(existing),
                _ => return Err(PerlError::runtime("Can't weaken a nonreference")),
            };
            slot.set(weakened);
        }
        SlowOp::Die => {
            let reg = fetch_u8!(f);
            let value = f.regs[usize::from(reg)].scalar_value();
            let value = if value.is_undef() { Scalar::from_str_slice("Died") } else { value };
            return Err(PerlError::die_value(value));
        }
        SlowOp::Warn => {
            let reg = fetch_u8!(f);
            let value = f.regs[usize::from(reg)].scalar_value();
            let mut text = interp.stringify(&value)?.to_string();
            if !text.ends_with('\n') {
                text.push('\n');
            }
            interp.write_err(&text);
        }
        SlowOp::Sqrt | SlowOp::Log | SlowOp::Exp | SlowOp::Abs | SlowOp::Int | SlowOp::Chr | SlowOp::Ord
        | SlowOp::Uc | SlowOp::Lc => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let kind = match sub {
                SlowOp::Sqrt => ScalarUnOp::Sqrt,
                SlowOp::Log => ScalarUnOp::Log,
                SlowOp::Exp => ScalarUnOp::Exp,
                SlowOp::Abs => ScalarUnOp::Abs,
                SlowOp::Int => ScalarUnOp::Int,
                SlowOp::Chr => ScalarUnOp::Chr,
                SlowOp::Ord => ScalarUnOp::Ord,
                SlowOp::Uc => ScalarUnOp::Uc,
                _ => ScalarUnOp::Lc,
            };
            let value = f.regs[usize::from(src)].scalar_value();
            let result = interp.un_op(kind, &value)?;
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
        }
        SlowOp::Join => {
            let dst = fetch_u8!(f);
            let sep_reg = fetch_u8!(f);
            let list_reg = fetch_u8!(f);
            let sep_value = f.regs[usize::from(sep_reg)].scalar_value();
            let separator = interp.stringify(&sep_value)?;
            let list = f.regs[usize::from(list_reg)].list_value();
            let mut parts = Vec::with_capacity(list.len());
            for value in list.values() {
                parts.push(interp.stringify(value)?.to_string());
            }
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::from_string(parts.join(&separator))));
        }
        SlowOp::StrIndex => {
            let dst = fetch_u8!(f);
            let hay_reg = fetch_u8!(f);
            let needle_reg = fetch_u8!(f);
            let hay_value = f.regs[usize::from(hay_reg)].scalar_value();
            let needle_value = f.regs[usize::from(needle_reg)].scalar_value();
            let haystack = interp.stringify(&hay_value)?;
            let needle = interp.stringify(&needle_value)?;
            let result = match haystack.find(&*needle) {
                Some(byte_offset) => haystack[..byte_offset].chars().count() as i64,
                None => -1,
            };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::Int(result)));
        }
        SlowOp::RefType => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            let name = match &value {
                Scalar::Ref(handle) => match handle.blessed() {
                    Some(class) => interp.env().interner().name(class),
                    None => handle.type_str().into(),
                },
                Scalar::Code(_) => "CODE".into(),
                _ => "".into(),
            };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::Str(name)));
        }
        SlowOp::EvalString => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let cx_byte = fetch_u8!(f);
            let cx = match Context::from_u8(cx_byte) {
                Context::Runtime => f.cx,
                concrete => concrete,
            };
            let source_value = f.regs[usize::from(src)].scalar_value();
            let source = interp.stringify(&source_value)?;
            let lexicals = f.code.lexical_map().clone();
            let result = interp.eval_string(&source, &lexicals, cx)?;
            f.regs[usize::from(dst)] = Value::List(result);
        }
        SlowOp::LocalSave => {
            let index = fetch_u16!(f);
            let name = f.code.string(index).clone();
            let slot = interp.env().get_scalar(&name);
            f.saved_locals.push((name, slot.get()));
        }
        SlowOp::TailList => {
            let dst = fetch_u8!(f);
            let array_reg = fetch_u8!(f);
            let off_reg = fetch_u8!(f);
            let array = f.regs[usize::from(array_reg)].expect_array()?.clone();
            let offset = f.regs[usize::from(off_reg)].scalar_value().as_int().max(0) as usize;
            let mut list = List::new();
            for value in array.to_list().into_iter().skip(offset) {
                list.push(value);
            }
            f.regs[usize::from(dst)] = Value::List(list);
        }
    }
    Ok(())
}
