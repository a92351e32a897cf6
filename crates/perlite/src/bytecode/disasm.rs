//! Bytecode disassembler.
//!
//! Walks the instruction stream reading exactly the operand widths the
//! interpreter reads, driven by the shared operand-shape table. Every
//! opcode and slow sub-opcode decodes here; a missing case would
//! desynchronize the program counter and corrupt all subsequent output,
//! which is why coverage is property-tested rather than hoped for.

use std::fmt::Write as _;

use super::code::Code;
use super::op::{NO_LABEL, Op, OperandKind, SlowOp};
use crate::error::{PerlError, PerlResult};

/// Disassembles a whole artifact into a deterministic listing.
pub fn disassemble(code: &Code) -> PerlResult<String> {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "; sub {} ({} bytes, {} regs, {} consts, {} strings)",
        code.name(),
        code.bytecode().len(),
        code.max_regs(),
        code.consts().len(),
        code.strings().len(),
    );
    let mut pc = 0usize;
    while pc < code.bytecode().len() {
        let (line, next) = disassemble_at(code, pc)?;
        let _ = writeln!(out, "{line}");
        pc = next;
    }
    Ok(out)
}

/// Disassembles the instruction at `pc`, returning the rendered line and
/// the offset of the next instruction.
pub fn disassemble_at(code: &Code, pc: usize) -> PerlResult<(String, usize)> {
    let bytes = code.bytecode();
    let byte = *bytes
        .get(pc)
        .ok_or_else(|| PerlError::internal(format!("disassembly ran past end of bytecode at pc {pc}")))?;
    let op = Op::from_repr(byte)
        .ok_or_else(|| PerlError::internal(format!("unknown opcode {byte:#04x} at pc {pc}")))?;

    let mut line = format!("{pc:04}  {:<18}", op.name());
    let mut cursor = pc + 1;

    if op == Op::Slow {
        let sub_byte = *bytes
            .get(cursor)
            .ok_or_else(|| PerlError::internal(format!("truncated slow-op at pc {pc}")))?;
        let sub = SlowOp::from_repr(sub_byte)
            .ok_or_else(|| PerlError::internal(format!("unknown slow-op {sub_byte:#04x} at pc {pc}")))?;
        cursor += 1;
        let _ = write!(line, "{:<14}", sub.name());
        cursor = render_operands(code, &mut line, cursor, sub.operands())?;
    } else {
        cursor = render_operands(code, &mut line, cursor, op.operands())?;
    }

    Ok((line.trim_end().to_string(), cursor))
}

fn render_operands(code: &Code, line: &mut String, mut cursor: usize, operands: &[OperandKind]) -> PerlResult<usize> {
    let bytes = code.bytecode();
    let mut first = true;
    for operand in operands {
        if !first {
            line.push_str(", ");
        } else {
            line.push(' ');
            first = false;
        }
        match operand {
            OperandKind::Reg => {
                let r = fetch_u8(bytes, &mut cursor)?;
                let _ = write!(line, "r{r}");
            }
            OperandKind::StrIdx => {
                let index = fetch_u16(bytes, &mut cursor)?;
                if index == NO_LABEL {
                    line.push('-');
                } else {
                    let _ = write!(line, "s{index}({:?})", &**code.string(index));
                }
            }
            OperandKind::ConstIdx => {
                let index = fetch_u16(bytes, &mut cursor)?;
                let _ = write!(line, "c{index}");
            }
            OperandKind::Target => {
                let target = fetch_u16(bytes, &mut cursor)?;
                let _ = write!(line, "->{target:04}");
            }
            OperandKind::Imm => {
                let mut buf = [0u8; 4];
                for slot in &mut buf {
                    *slot = fetch_u8(bytes, &mut cursor)?;
                }
                let _ = write!(line, "{}", i32::from_le_bytes(buf));
            }
            OperandKind::Ctx => {
                let ctx = fetch_u8(bytes, &mut cursor)?;
                let name = match ctx {
                    0 => "VOID",
                    1 => "SCALAR",
                    3 => "RUNTIME",
                    _ => "LIST",
                };
                line.push_str(name);
            }
            OperandKind::SubOp => {
                return Err(PerlError::internal("nested slow-op operand in shape table"));
            }
        }
    }
    Ok(cursor)
}

fn fetch_u8(bytes: &[u8], cursor: &mut usize) -> PerlResult<u8> {
    let byte = *bytes
        .get(*cursor)
        .ok_or_else(|| PerlError::internal(format!("truncated operand at offset {}", *cursor)))?;
    *cursor += 1;
    Ok(byte)
}

fn fetch_u16(bytes: &[u8], cursor: &mut usize) -> PerlResult<u16> {
    let lo = fetch_u8(bytes, cursor)?;
    let hi = fetch_u8(bytes, cursor)?;
    Ok(u16::from_le_bytes([lo, hi]))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use ahash::AHashMap;
    use strum::EnumCount as _;

    use super::*;
    use crate::value::Scalar;

    fn synth_code(bytes: Vec<u8>) -> Code {
        Code::new(
            bytes,
            vec![Arc::from("main::x")],
            vec![Scalar::Int(7)],
            8,
            Vec::new(),
            AHashMap::new(),
            Vec::new(),
            Vec::new(),
            Arc::from("synth"),
            Arc::from("t.pl"),
        )
    }

    fn zero_operands(width: usize) -> impl Iterator<Item = u8> {
        std::iter::repeat_n(0u8, width)
    }

    /// Every opcode must have a disassembly case that consumes exactly its
    /// operand bytes; a missing or misaligned case desynchronizes the
    /// program counter for everything after it.
    #[test]
    fn test_every_opcode_disassembles_with_exact_width() {
        for byte in 0..Op::COUNT as u8 {
            let op = Op::from_repr(byte).expect("contiguous opcode space");
            if op == Op::Slow {
                continue;
            }
            let mut bytes = vec![byte];
            bytes.extend(zero_operands(op.width() - 1));
            let code = synth_code(bytes);
            let (line, next) = disassemble_at(&code, 0)
                .unwrap_or_else(|e| panic!("{} failed to disassemble: {e}", op.name()));
            assert_eq!(next, op.width(), "pc advance for {}", op.name());
            assert!(line.contains(op.name()), "listing names {}: {line}", op.name());
        }
    }

    #[test]
    fn test_every_slow_op_disassembles_with_exact_width() {
        for byte in 0..SlowOp::COUNT as u8 {
            let sub = SlowOp::from_repr(byte).expect("contiguous slow-op space");
            let mut bytes = vec![Op::Slow as u8, byte];
            bytes.extend(zero_operands(sub.width()));
            let code = synth_code(bytes);
            let (line, next) = disassemble_at(&code, 0)
                .unwrap_or_else(|e| panic!("{} failed to disassemble: {e}", sub.name()));
            assert_eq!(next, 2 + sub.width(), "pc advance for {}", sub.name());
            assert!(line.contains(sub.name()), "listing names {}: {line}", sub.name());
        }
    }

    #[test]
    fn test_unknown_opcode_reports_number_and_pc() {
        let code = synth_code(vec![0xfe]);
        let err = disassemble_at(&code, 0).unwrap_err();
        assert!(err.message().contains("0xfe"), "{}", err.message());
        assert!(err.message().contains("pc 0"), "{}", err.message());
    }

    #[test]
    fn test_full_listing_walks_every_instruction_once() {
        let mut bytes = vec![Op::LoadInt as u8, 3];
        bytes.extend_from_slice(&42i32.to_le_bytes());
        bytes.push(Op::Return as u8);
        bytes.push(3);
        let code = synth_code(bytes);
        let listing = disassemble(&code).unwrap();
        assert_eq!(listing.matches("LoadInt").count(), 1);
        assert_eq!(listing.matches("Return").count(), 1);
        assert!(listing.contains("42"));
    }
}
