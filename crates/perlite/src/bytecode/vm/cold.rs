//! Secondary dispatch for cold opcode groups.
//!
//! Comparisons, container operations, and reference operations live here as
//! dense sub-matches invoked from the main switch's tail, keeping the hot
//! dispatch function within JIT-friendly size.

use super::{Frame, fetch_u8, flatten_slots};
use crate::bytecode::op::Op;
use crate::container::{ArrayRef, HashRef};
use crate::error::{PerlError, PerlResult};
use crate::run::Interp;
use crate::value::{List, Ref, Scalar, ScalarBinOp, ScalarRef, Value};

/// Binary arithmetic and string operators.
pub(super) fn step_binary(interp: &mut Interp, f: &mut Frame<'_>, op: Op) -> PerlResult<()> {
    let dst = fetch_u8!(f);
    let lhs_reg = fetch_u8!(f);
    let rhs_reg = fetch_u8!(f);
    let lhs = f.regs[usize::from(lhs_reg)].scalar_value();
    let rhs = f.regs[usize::from(rhs_reg)].scalar_value();
    let kind = match op {
        Op::Add => ScalarBinOp::Add,
        Op::Subtract => ScalarBinOp::Subtract,
        Op::Multiply => ScalarBinOp::Multiply,
        Op::Divide => ScalarBinOp::Divide,
        Op::Modulus => ScalarBinOp::Modulus,
        Op::Power => ScalarBinOp::Power,
        Op::Concat => ScalarBinOp::Concat,
        Op::Repeat => ScalarBinOp::Repeat,
        other => return Err(PerlError::internal(format!("{} is not a binary opcode", other.name()))),
    };
    let result = interp.bin_op(kind, &lhs, &rhs)?;
    f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
    Ok(())
}

/// The comparison opcode group.
pub(super) fn step_compare(interp: &mut Interp, f: &mut Frame<'_>, op: Op) -> PerlResult<()> {
    let dst = fetch_u8!(f);
    let lhs_reg = fetch_u8!(f);
    let rhs_reg = fetch_u8!(f);
    let lhs = f.regs[usize::from(lhs_reg)].scalar_value();
    let rhs = f.regs[usize::from(rhs_reg)].scalar_value();
    let kind = match op {
        Op::NumEq => ScalarBinOp::NumEq,
        Op::NumNe => ScalarBinOp::NumNe,
        Op::NumLt => ScalarBinOp::NumLt,
        Op::NumLe => ScalarBinOp::NumLe,
        Op::NumGt => ScalarBinOp::NumGt,
        Op::NumGe => ScalarBinOp::NumGe,
        Op::StrEq => ScalarBinOp::StrEq,
        Op::StrNe => ScalarBinOp::StrNe,
        Op::StrLt => ScalarBinOp::StrLt,
        Op::StrLe => ScalarBinOp::StrLe,
        Op::StrGt => ScalarBinOp::StrGt,
        Op::StrGe => ScalarBinOp::StrGe,
        Op::NumCmp => ScalarBinOp::NumCmp,
        Op::StrCmp => ScalarBinOp::StrCmp,
        other => return Err(PerlError::internal(format!("{} is not a comparison opcode", other.name()))),
    };
    let result = interp.bin_op(kind, &lhs, &rhs)?;
    f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(result));
    Ok(())
}

/// The array, list, and hash opcode group.
pub(super) fn step_container(interp: &mut Interp, f: &mut Frame<'_>, op: Op) -> PerlResult<()> {
    match op {
        Op::ArrayPush => {
            let array_reg = fetch_u8!(f);
            let value_reg = fetch_u8!(f);
            let slots = flatten_slots(&f.regs[usize::from(value_reg)]);
            let array = f.regs[usize::from(array_reg)].expect_array()?;
            for slot in slots {
                array.push_slot(slot);
            }
        }
        Op::ArrayPop | Op::ArrayShift => {
            let dst = fetch_u8!(f);
            let array_reg = fetch_u8!(f);
            let array = f.regs[usize::from(array_reg)].expect_array()?.clone();
            let value = if op == Op::ArrayPop { array.pop() } else { array.shift() };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(value));
        }
        Op::ArrayUnshift => {
            let array_reg = fetch_u8!(f);
            let value_reg = fetch_u8!(f);
            let slots = flatten_slots(&f.regs[usize::from(value_reg)]);
            let array = f.regs[usize::from(array_reg)].expect_array()?;
            array.unshift_slots(slots);
        }
        Op::ArrayGet => {
            let dst = fetch_u8!(f);
            let array_reg = fetch_u8!(f);
            let index_reg = fetch_u8!(f);
            let index = f.regs[usize::from(index_reg)].scalar_value().as_int();
            let array = f.regs[usize::from(array_reg)].expect_array()?.clone();
            // The destination aliases the element slot.
            f.regs[usize::from(dst)] = Value::Scalar(array.slot(index));
        }
        Op::ArraySet => {
            let array_reg = fetch_u8!(f);
            let index_reg = fetch_u8!(f);
            let value_reg = fetch_u8!(f);
            let index = f.regs[usize::from(index_reg)].scalar_value().as_int();
            let value = f.regs[usize::from(value_reg)].scalar_value();
            f.regs[usize::from(array_reg)].expect_array()?.set(index, value);
        }
        Op::ArrayLen => {
            let dst = fetch_u8!(f);
            let array_reg = fetch_u8!(f);
            let len = f.regs[usize::from(array_reg)].expect_array()?.len();
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::Int(len as i64)));
        }
        Op::ArrayFromList => {
            let dst = fetch_u8!(f);
            let list_reg = fetch_u8!(f);
            let list = f.regs[usize::from(list_reg)].list_value();
            f.regs[usize::from(dst)] = Value::Array(ArrayRef::from_list(&list));
        }
        Op::ArrayAssign => {
            let array_reg = fetch_u8!(f);
            let list_reg = fetch_u8!(f);
            let list = f.regs[usize::from(list_reg)].list_value();
            f.regs[usize::from(array_reg)].expect_array()?.assign_list(&list);
        }
        Op::ListPush => {
            let list_reg = fetch_u8!(f);
            let value_reg = fetch_u8!(f);
            let addition = f.regs[usize::from(value_reg)].list_value();
            match &mut f.regs[usize::from(list_reg)] {
                Value::List(list) => list.extend_from(&addition),
                other => {
                    return Err(PerlError::internal(format!(
                        "ListPush destination holds {}",
                        other.kind_name()
                    )));
                }
            }
        }
        Op::Range => {
            let dst = fetch_u8!(f);
            let lo_reg = fetch_u8!(f);
            let hi_reg = fetch_u8!(f);
            let lo = f.regs[usize::from(lo_reg)].scalar_value().as_int();
            let hi = f.regs[usize::from(hi_reg)].scalar_value().as_int();
            let mut list = List::new();
            let mut current = lo;
            while current <= hi {
                list.push(Scalar::Int(current));
                current += 1;
            }
            f.regs[usize::from(dst)] = Value::List(list);
        }
        Op::HashAssign => {
            let hash_reg = fetch_u8!(f);
            let list_reg = fetch_u8!(f);
            let list = f.regs[usize::from(list_reg)].list_value();
            let hash = f.regs[usize::from(hash_reg)].expect_hash()?;
            hash.assign_list(&list, interp.env().interner());
        }
        Op::HashGet => {
            let dst = fetch_u8!(f);
            let hash_reg = fetch_u8!(f);
            let key_reg = fetch_u8!(f);
            let key_value = f.regs[usize::from(key_reg)].scalar_value();
            let key = interp.stringify(&key_value)?;
            let hash = f.regs[usize::from(hash_reg)].expect_hash()?.clone();
            f.regs[usize::from(dst)] = Value::Scalar(hash.slot(&key));
        }
        Op::HashSet => {
            let hash_reg = fetch_u8!(f);
            let key_reg = fetch_u8!(f);
            let value_reg = fetch_u8!(f);
            let key_value = f.regs[usize::from(key_reg)].scalar_value();
            let key = interp.stringify(&key_value)?;
            let value = f.regs[usize::from(value_reg)].scalar_value();
            f.regs[usize::from(hash_reg)].expect_hash()?.set(&key, value);
        }
        Op::HashDelete => {
            let dst = fetch_u8!(f);
            let hash_reg = fetch_u8!(f);
            let key_reg = fetch_u8!(f);
            let key_value = f.regs[usize::from(key_reg)].scalar_value();
            let key = interp.stringify(&key_value)?;
            let removed = f.regs[usize::from(hash_reg)].expect_hash()?.delete(&key);
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(removed));
        }
        Op::HashExists => {
            let dst = fetch_u8!(f);
            let hash_reg = fetch_u8!(f);
            let key_reg = fetch_u8!(f);
            let key_value = f.regs[usize::from(key_reg)].scalar_value();
            let key = interp.stringify(&key_value)?;
            let exists = f.regs[usize::from(hash_reg)].expect_hash()?.exists(&key);
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::from_bool(exists)));
        }
        Op::HashKeys | Op::HashValues => {
            let dst = fetch_u8!(f);
            let hash_reg = fetch_u8!(f);
            let hash = f.regs[usize::from(hash_reg)].expect_hash()?;
            let list = if op == Op::HashKeys { hash.keys() } else { hash.values() };
            f.regs[usize::from(dst)] = Value::List(list);
        }
        other => return Err(PerlError::internal(format!("{} is not a container opcode", other.name()))),
    }
    Ok(())
}

/// The reference opcode group.
pub(super) fn step_refs(f: &mut Frame<'_>, op: Op) -> PerlResult<()> {
    match op {
        Op::MakeRef => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let handle = match &f.regs[usize::from(src)] {
                Value::Scalar(slot) => Ref::Scalar(slot.clone()),
                Value::Array(array) => Ref::Array(array.clone()),
                Value::Hash(hash) => Ref::Hash(hash.clone()),
                Value::Code(code) => Ref::Code(code.clone()),
                Value::List(list) => Ref::Array(ArrayRef::from_list(list)),
                other => {
                    return Err(PerlError::internal(format!(
                        "cannot take a reference to {}",
                        other.kind_name()
                    )));
                }
            };
            f.regs[usize::from(dst)] = Value::Scalar(ScalarRef::new(Scalar::Ref(handle)));
        }
        Op::DerefScalar => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            f.regs[usize::from(dst)] = Value::Scalar(crate::value::deref_scalar_slot(&value)?);
        }
        Op::DerefArray => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            // Pass an array register through; dereference a scalar one.
            if let Value::Array(array) = &f.regs[usize::from(src)] {
                let array = array.clone();
                f.regs[usize::from(dst)] = Value::Array(array);
                return Ok(());
            }
            let value = f.regs[usize::from(src)].scalar_value();
            f.regs[usize::from(dst)] = Value::Array(crate::value::deref_array(&value)?);
        }
        Op::DerefHash => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            if let Value::Hash(hash) = &f.regs[usize::from(src)] {
                let hash = hash.clone();
                f.regs[usize::from(dst)] = Value::Hash(hash);
                return Ok(());
            }
            let value = f.regs[usize::from(src)].scalar_value();
            f.regs[usize::from(dst)] = Value::Hash(crate::value::deref_hash(&value)?);
        }
        Op::DerefCode => {
            let dst = fetch_u8!(f);
            let src = fetch_u8!(f);
            let value = f.regs[usize::from(src)].scalar_value();
            f.regs[usize::from(dst)] = Value::Code(crate::value::deref_code(&value)?);
        }
        other => return Err(PerlError::internal(format!("{} is not a reference opcode", other.name()))),
    }
    Ok(())
}
