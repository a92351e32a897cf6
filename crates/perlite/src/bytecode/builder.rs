//! Builder for emitting bytecode during compilation.
//!
//! `CodeBuilder` encodes opcodes and operands into raw bytes, manages
//! forward jumps with patching, interns pool entries, and tracks source
//! locations for diagnostics.

use std::sync::Arc;

use ahash::AHashMap;

use super::code::{Code, ExceptionEntry, LocationEntry};
use super::op::{Op, SlowOp};
use crate::function::CaptureSpec;
use crate::value::Scalar;

/// Label for a forward jump that needs patching.
///
/// Stores the byte offset of the target operand. Pass it to `patch_jump()`
/// once the destination is known.
#[derive(Debug, Clone, Copy)]
pub struct JumpLabel(usize);

/// Builder for one bytecode artifact.
#[derive(Debug, Default)]
pub struct CodeBuilder {
    bytecode: Vec<u8>,
    strings: Vec<Arc<str>>,
    string_ids: AHashMap<Arc<str>, u16>,
    consts: Vec<Scalar>,
    locations: Vec<LocationEntry>,
    exception_table: Vec<ExceptionEntry>,
    current_line: u32,
    recorded_line: Option<u32>,
}

impl CodeBuilder {
    /// Creates a new empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the source line for subsequently emitted instructions.
    pub fn set_line(&mut self, line: u32) {
        self.current_line = line;
    }

    /// The current bytecode offset.
    #[must_use]
    pub fn current_offset(&self) -> usize {
        self.bytecode.len()
    }

    fn start_instruction(&mut self) {
        if self.recorded_line != Some(self.current_line) {
            self.locations.push(LocationEntry {
                offset: u32::try_from(self.bytecode.len()).expect("bytecode length exceeds u32"),
                line: self.current_line,
            });
            self.recorded_line = Some(self.current_line);
        }
    }

    /// Emits a no-operand instruction.
    pub fn emit(&mut self, op: Op) {
        self.start_instruction();
        self.bytecode.push(op as u8);
    }

    /// Emits an instruction with one register operand.
    pub fn emit_r(&mut self, op: Op, r: u8) {
        self.emit(op);
        self.bytecode.push(r);
    }

    /// Emits an instruction with two register operands.
    pub fn emit_rr(&mut self, op: Op, a: u8, b: u8) {
        self.emit(op);
        self.bytecode.push(a);
        self.bytecode.push(b);
    }

    /// Emits an instruction with three register operands.
    pub fn emit_rrr(&mut self, op: Op, a: u8, b: u8, c: u8) {
        self.emit(op);
        self.bytecode.push(a);
        self.bytecode.push(b);
        self.bytecode.push(c);
    }

    /// Emits an instruction with four register operands.
    pub fn emit_rrrr(&mut self, op: Op, a: u8, b: u8, c: u8, d: u8) {
        self.emit(op);
        self.bytecode.push(a);
        self.bytecode.push(b);
        self.bytecode.push(c);
        self.bytecode.push(d);
    }

    /// Emits an instruction with a register and a `u16` pool index.
    pub fn emit_r_idx(&mut self, op: Op, r: u8, index: u16) {
        self.emit(op);
        self.bytecode.push(r);
        self.bytecode.extend_from_slice(&index.to_le_bytes());
    }

    /// Emits an instruction with a `u16` pool index then a register
    /// (the store-global shape).
    pub fn emit_idx_r(&mut self, op: Op, index: u16, r: u8) {
        self.emit(op);
        self.bytecode.extend_from_slice(&index.to_le_bytes());
        self.bytecode.push(r);
    }

    /// Emits an instruction with a register and an `i32` immediate.
    pub fn emit_r_imm(&mut self, op: Op, r: u8, imm: i32) {
        self.emit(op);
        self.bytecode.push(r);
        self.bytecode.extend_from_slice(&imm.to_le_bytes());
    }

    /// Emits an instruction with two registers and an `i32` immediate.
    pub fn emit_rr_imm(&mut self, op: Op, a: u8, b: u8, imm: i32) {
        self.emit(op);
        self.bytecode.push(a);
        self.bytecode.push(b);
        self.bytecode.extend_from_slice(&imm.to_le_bytes());
    }

    /// Emits an unconditional forward jump, returning its patch label.
    #[must_use]
    pub fn emit_jump(&mut self) -> JumpLabel {
        self.emit(Op::Jump);
        self.placeholder_target()
    }

    /// Emits a conditional forward jump, returning its patch label.
    #[must_use]
    pub fn emit_jump_if(&mut self, op: Op, r: u8) -> JumpLabel {
        self.emit(op);
        self.bytecode.push(r);
        self.placeholder_target()
    }

    /// Emits an unconditional jump to a known target.
    pub fn emit_jump_to(&mut self, target: usize) {
        self.emit(Op::Jump);
        self.push_target(target);
    }

    /// Emits a conditional jump to a known target.
    pub fn emit_jump_if_to(&mut self, op: Op, r: u8, target: usize) {
        self.emit(op);
        self.bytecode.push(r);
        self.push_target(target);
    }

    /// Emits the fused increment-compare-branch with a known backward
    /// target.
    pub fn emit_inc_cmp_br(&mut self, var: u8, limit: u8, target: usize) {
        self.emit(Op::IncCmpBr);
        self.bytecode.push(var);
        self.bytecode.push(limit);
        self.push_target(target);
    }

    /// Emits a loop-control marker op (`CtrlLast`/`CtrlNext`/`CtrlRedo`)
    /// with its label operand.
    pub fn emit_ctl(&mut self, op: Op, label: u16) {
        self.emit(op);
        self.bytecode.extend_from_slice(&label.to_le_bytes());
    }

    /// Emits `Call dst, code, args, ctx`.
    pub fn emit_call(&mut self, dst: u8, code: u8, args: u8, ctx: u8) {
        self.emit(Op::Call);
        self.bytecode.push(dst);
        self.bytecode.push(code);
        self.bytecode.push(args);
        self.bytecode.push(ctx);
    }

    /// Emits `CallMethod dst, invocant, name, args, ctx`.
    pub fn emit_call_method(&mut self, dst: u8, invocant: u8, name: u16, args: u8, ctx: u8) {
        self.emit(Op::CallMethod);
        self.bytecode.push(dst);
        self.bytecode.push(invocant);
        self.bytecode.extend_from_slice(&name.to_le_bytes());
        self.bytecode.push(args);
        self.bytecode.push(ctx);
    }

    /// Emits `EnterLoop`, returning patch labels for the redo/next/last
    /// targets.
    #[must_use]
    pub fn emit_enter_loop(&mut self, label: u16) -> (JumpLabel, JumpLabel, JumpLabel) {
        self.emit(Op::EnterLoop);
        self.bytecode.extend_from_slice(&label.to_le_bytes());
        let redo = self.placeholder_target();
        let next = self.placeholder_target();
        let last = self.placeholder_target();
        (redo, next, last)
    }

    /// Reserves a `u16` target operand for later patching.
    #[must_use]
    pub fn placeholder_target(&mut self) -> JumpLabel {
        let label = JumpLabel(self.bytecode.len());
        self.bytecode.extend_from_slice(&0u16.to_le_bytes());
        label
    }

    /// Patches a reserved target operand to the current offset.
    pub fn patch_jump(&mut self, label: JumpLabel) {
        let target = self.current_offset();
        self.patch_to(label, target);
    }

    /// Patches a reserved target operand to an explicit offset.
    pub fn patch_to(&mut self, label: JumpLabel, target: usize) {
        let target = u16::try_from(target).expect("bytecode target exceeds u16; subroutine too large");
        let bytes = target.to_le_bytes();
        self.bytecode[label.0] = bytes[0];
        self.bytecode[label.0 + 1] = bytes[1];
    }

    fn push_target(&mut self, target: usize) {
        let target = u16::try_from(target).expect("bytecode target exceeds u16; subroutine too large");
        self.bytecode.extend_from_slice(&target.to_le_bytes());
    }

    /// Emits a slow-table instruction with operand bytes supplied raw.
    fn emit_slow_raw(&mut self, sub: SlowOp, operands: &[u8]) {
        debug_assert_eq!(operands.len(), sub.width(), "slow-op operand shape mismatch");
        self.emit(Op::Slow);
        self.bytecode.push(sub as u8);
        self.bytecode.extend_from_slice(operands);
    }

    /// Emits a slow op with one register operand.
    pub fn emit_slow_r(&mut self, sub: SlowOp, r: u8) {
        self.emit_slow_raw(sub, &[r]);
    }

    /// Emits a slow op with two register operands.
    pub fn emit_slow_rr(&mut self, sub: SlowOp, a: u8, b: u8) {
        self.emit_slow_raw(sub, &[a, b]);
    }

    /// Emits a slow op with three register operands.
    pub fn emit_slow_rrr(&mut self, sub: SlowOp, a: u8, b: u8, c: u8) {
        self.emit_slow_raw(sub, &[a, b, c]);
    }

    /// Emits a slow op with five register operands.
    pub fn emit_slow_rrrrr(&mut self, sub: SlowOp, a: u8, b: u8, c: u8, d: u8, e: u8) {
        self.emit_slow_raw(sub, &[a, b, c, d, e]);
    }

    /// Emits a slow op with a register and a string-pool index.
    pub fn emit_slow_r_str(&mut self, sub: SlowOp, r: u8, index: u16) {
        let bytes = index.to_le_bytes();
        self.emit_slow_raw(sub, &[r, bytes[0], bytes[1]]);
    }

    /// Emits a slow op with a string-pool index only.
    pub fn emit_slow_str(&mut self, sub: SlowOp, index: u16) {
        let bytes = index.to_le_bytes();
        self.emit_slow_raw(sub, &[bytes[0], bytes[1]]);
    }

    /// Emits a slow op with two registers and a context byte.
    pub fn emit_slow_rr_ctx(&mut self, sub: SlowOp, a: u8, b: u8, ctx: u8) {
        self.emit_slow_raw(sub, &[a, b, ctx]);
    }

    /// Interns a string in the pool, returning its index.
    ///
    /// # Panics
    /// Panics past 65534 entries (the top index is the no-label sentinel).
    #[must_use]
    pub fn add_str(&mut self, text: &str) -> u16 {
        if let Some(id) = self.string_ids.get(text) {
            return *id;
        }
        let id = u16::try_from(self.strings.len()).expect("string pool exceeds u16");
        assert!(id != u16::MAX, "string pool exhausted");
        let text: Arc<str> = Arc::from(text);
        self.strings.push(text.clone());
        self.string_ids.insert(text, id);
        id
    }

    /// Adds a constant to the pool, returning its index.
    #[must_use]
    pub fn add_const(&mut self, value: Scalar) -> u16 {
        let id = u16::try_from(self.consts.len()).expect("constant pool exceeds u16");
        self.consts.push(value);
        id
    }

    /// Adds an exception-handler entry. Entries are added innermost-first.
    pub fn add_exception_entry(&mut self, entry: ExceptionEntry) {
        self.exception_table.push(entry);
    }

    /// Builds the final artifact.
    #[must_use]
    pub fn build(
        self,
        max_regs: u16,
        captures: Vec<CaptureSpec>,
        lexical_map: AHashMap<Arc<str>, Arc<str>>,
        name: &str,
        file: &str,
    ) -> Code {
        Code::new(
            self.bytecode,
            self.strings,
            self.consts,
            max_regs,
            captures,
            lexical_map,
            self.exception_table,
            self.locations,
            Arc::from(name),
            Arc::from(file),
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn build(builder: CodeBuilder) -> Code {
        builder.build(8, Vec::new(), AHashMap::new(), "test", "t.pl")
    }

    #[test]
    fn test_emit_basic() {
        let mut builder = CodeBuilder::new();
        builder.emit_r(Op::LoadUndef, 3);
        builder.emit(Op::ReturnEmpty);
        let code = build(builder);
        assert_eq!(code.bytecode(), &[Op::LoadUndef as u8, 3, Op::ReturnEmpty as u8]);
    }

    #[test]
    fn test_emit_r_idx_little_endian() {
        let mut builder = CodeBuilder::new();
        builder.emit_r_idx(Op::LoadConst, 4, 0x1234);
        let code = build(builder);
        assert_eq!(code.bytecode(), &[Op::LoadConst as u8, 4, 0x34, 0x12]);
    }

    #[test]
    fn test_forward_jump_patches_absolute_target() {
        let mut builder = CodeBuilder::new();
        let jump = builder.emit_jump();
        builder.emit_r(Op::LoadUndef, 3);
        builder.patch_jump(jump);
        builder.emit(Op::ReturnEmpty);
        let code = build(builder);
        // Jump occupies offsets 0..3, LoadUndef 3..5, target is offset 5.
        assert_eq!(code.bytecode(), &[Op::Jump as u8, 5, 0, Op::LoadUndef as u8, 3, Op::ReturnEmpty as u8]);
    }

    #[test]
    fn test_backward_jump_encodes_absolute_target() {
        let mut builder = CodeBuilder::new();
        let top = builder.current_offset();
        builder.emit_r(Op::Inc, 3);
        builder.emit_jump_to(top);
        let code = build(builder);
        assert_eq!(code.bytecode(), &[Op::Inc as u8, 3, Op::Jump as u8, 0, 0]);
    }

    #[test]
    fn test_string_pool_interns() {
        let mut builder = CodeBuilder::new();
        let a = builder.add_str("main::x");
        let b = builder.add_str("main::y");
        let c = builder.add_str("main::x");
        assert_eq!(a, c);
        assert_ne!(a, b);
    }

    #[test]
    fn test_slow_op_encoding() {
        let mut builder = CodeBuilder::new();
        let name = builder.add_str("Perlite::_BEGIN_0::w");
        builder.emit_slow_r_str(SlowOp::RetrievePersistentScalar, 3, name);
        let code = build(builder);
        assert_eq!(
            code.bytecode(),
            &[Op::Slow as u8, SlowOp::RetrievePersistentScalar as u8, 3, 0, 0]
        );
    }

    #[test]
    fn test_location_table_tracks_lines() {
        let mut builder = CodeBuilder::new();
        builder.set_line(1);
        builder.emit(Op::Nop);
        builder.emit(Op::Nop);
        builder.set_line(2);
        builder.emit(Op::ReturnEmpty);
        let code = build(builder);
        assert_eq!(code.line_for(0), Some(1));
        assert_eq!(code.line_for(1), Some(1));
        assert_eq!(code.line_for(2), Some(2));
    }
}
