//! Opcode definitions.
//!
//! The opcode identifier space is strictly contiguous: the dispatch loop
//! relies on the dense `match` compiling to a jump table, so adding an
//! opcode means taking the next sequential number and removing one means
//! renumbering. Every opcode has a fixed operand-shape signature, declared
//! once here and consumed by the compiler, the interpreter, and the
//! disassembler — the single source of truth the round-trip tests check.
//!
//! `Slow` is the gateway into the second, equally dense [`SlowOp`] table
//! for rarely used operations, preserving the main opcode space for the
//! hot path.

use strum::{EnumCount, FromRepr, IntoStaticStr};

/// Operand shapes. Registers are one byte; pool indices and jump targets
/// are little-endian `u16` (jump targets are absolute bytecode positions);
/// integer immediates are little-endian `i32`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperandKind {
    /// Register index (1 byte).
    Reg,
    /// String-pool index (2 bytes). `u16::MAX` is the "no label" sentinel
    /// where a label operand is optional.
    StrIdx,
    /// Constant-pool index (2 bytes).
    ConstIdx,
    /// Absolute bytecode position (2 bytes).
    Target,
    /// Signed integer immediate (4 bytes).
    Imm,
    /// Calling-context tag (1 byte).
    Ctx,
    /// Slow-op sub-opcode (1 byte) followed by that sub-op's own operands.
    SubOp,
}

impl OperandKind {
    /// Encoded width in bytes. `SubOp` counts only the sub-opcode byte; the
    /// sub-op's own operands follow.
    #[must_use]
    pub fn width(self) -> usize {
        match self {
            Self::Reg | Self::Ctx | Self::SubOp => 1,
            Self::StrIdx | Self::ConstIdx | Self::Target => 2,
            Self::Imm => 4,
        }
    }
}

/// String-pool sentinel for an absent optional label.
pub const NO_LABEL: u16 = u16::MAX;

/// The main opcode table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, EnumCount, IntoStaticStr)]
#[repr(u8)]
pub enum Op {
    // -- control flow --
    /// No operation.
    Nop = 0,
    /// Unconditional jump.
    Jump,
    /// Jump when the register is true.
    JumpIfTrue,
    /// Jump when the register is false.
    JumpIfFalse,
    /// Return the register's value as the result list.
    Return,
    /// Return an empty list.
    ReturnEmpty,
    /// Push a loop scope: label, redo/next/last targets.
    EnterLoop,
    /// Pop the innermost loop scope.
    ExitLoop,
    /// Non-local `last`: return a control marker.
    CtrlLast,
    /// Non-local `next`.
    CtrlNext,
    /// Non-local `redo`.
    CtrlRedo,
    /// `goto &NAME`: return a tail-call marker for the trampoline.
    TailCall,

    // -- constants --
    /// Load undef.
    LoadUndef,
    /// Load a small integer immediate without touching the constant pool.
    LoadInt,
    /// Load a constant-pool scalar.
    LoadConst,
    /// Load a string-pool string.
    LoadStr,

    // -- global access --
    /// Load the global scalar slot named by the string operand.
    LoadGlobalScalar,
    /// Load a global array.
    LoadGlobalArray,
    /// Load a global hash.
    LoadGlobalHash,
    /// Load a global code entry (with `CORE::` fallback).
    LoadGlobalCode,
    /// Value-set the global scalar slot (mutates in place; aliases observe).
    StoreGlobalScalar,
    /// Replace a global array's contents.
    StoreGlobalArray,
    /// Replace a global hash's contents.
    StoreGlobalHash,

    // -- moves and bindings --
    /// Copy a register (handle copy: a new binding, not a value set).
    Move,
    /// Value-set the scalar slot in the destination register from the
    /// source register's scalar value.
    SetScalar,
    /// Bind a fresh undef scalar slot.
    NewScalar,
    /// Bind a fresh empty array.
    NewArray,
    /// Bind a fresh empty hash.
    NewHash,
    /// Bind a fresh empty list.
    NewList,

    // -- arithmetic --
    /// `dst = a + b`
    Add,
    /// `dst = a - b`
    Subtract,
    /// `dst = a * b`
    Multiply,
    /// `dst = a / b`
    Divide,
    /// `dst = a % b`
    Modulus,
    /// `dst = a ** b`
    Power,
    /// `dst = -a`
    Negate,
    /// `dst = a + imm` — unboxed integer fast path.
    AddImm,

    // -- strings --
    /// `dst = a . b`
    Concat,
    /// `dst = a x count`
    Repeat,
    /// `dst = length a`
    StrLength,
    /// `dst = substr(s, off, len)`; an undef length register means "to end".
    Substr,

    // -- comparison --
    /// `==`
    NumEq,
    /// `!=`
    NumNe,
    /// `<`
    NumLt,
    /// `<=`
    NumLe,
    /// `>`
    NumGt,
    /// `>=`
    NumGe,
    /// `eq`
    StrEq,
    /// `ne`
    StrNe,
    /// `lt`
    StrLt,
    /// `le`
    StrLe,
    /// `gt`
    StrGt,
    /// `ge`
    StrGe,
    /// `<=>`
    NumCmp,
    /// `cmp`
    StrCmp,

    // -- logic --
    /// Boolean negation.
    Not,
    /// `defined`
    Defined,

    // -- arrays --
    /// Flattening push of a register value onto an array.
    ArrayPush,
    /// `dst = pop @arr`
    ArrayPop,
    /// `dst = shift @arr`
    ArrayShift,
    /// Flattening unshift.
    ArrayUnshift,
    /// `dst = element slot` (aliasing lvalue; autovivifies).
    ArrayGet,
    /// `arr[idx] = value`
    ArraySet,
    /// `dst = scalar @arr`
    ArrayLen,
    /// Build a fresh array of fresh slots from a list register.
    ArrayFromList,
    /// Replace an array's contents from a list register.
    ArrayAssign,

    // -- lists --
    /// Flattening push of a register value onto a list.
    ListPush,
    /// `dst = (a .. b)`
    Range,

    // -- hashes --
    /// Replace a hash's contents from a flat key/value list register.
    HashAssign,
    /// `dst = element slot` (aliasing lvalue; autovivifies).
    HashGet,
    /// `hash{key} = value`
    HashSet,
    /// `dst = delete hash{key}`
    HashDelete,
    /// `dst = exists hash{key}`
    HashExists,
    /// `dst = keys %hash`
    HashKeys,
    /// `dst = values %hash`
    HashValues,

    // -- calls --
    /// Apply a code register to an argument array with a context tag.
    Call,
    /// Resolve and apply a method on an invocant.
    CallMethod,
    /// `dst = wantarray` from the frame's context register.
    Wantarray,

    // -- context conversion --
    /// Convert any register to a fresh scalar slot.
    ToScalar,
    /// Convert any register to a list.
    ToList,

    // -- references --
    /// Take a reference to the register's storage.
    MakeRef,
    /// Dereference to the scalar slot (aliasing).
    DerefScalar,
    /// Dereference to an array handle.
    DerefArray,
    /// Dereference to a hash handle.
    DerefHash,
    /// Dereference to a code handle.
    DerefCode,

    // -- misc --
    /// Materialize a subroutine value from the constant pool.
    MakeSub,
    /// Gateway into the dense [`SlowOp`] sub-table.
    Slow,

    // -- superinstructions --
    /// In-place `++` on the scalar slot in the register.
    Inc,
    /// In-place `--`.
    Dec,
    /// `dst = var` then `var++`.
    PostInc,
    /// `dst = var` then `var--`.
    PostDec,
    /// `var += rhs` in place.
    AddAssign,
    /// `var += imm` in place, unboxed for integers.
    AddAssignImm,
    /// Increment `var`; jump to the target while `var < limit`. The fused
    /// loop-induction step.
    IncCmpBr,
}

impl Op {
    /// The operand-shape signature: the single source of truth shared by
    /// the compiler emitter, the interpreter decode, and the disassembler.
    #[must_use]
    pub fn operands(self) -> &'static [OperandKind] {
        use OperandKind::{ConstIdx, Ctx, Imm, Reg, StrIdx, SubOp, Target};
        match self {
            Self::Nop | Self::ReturnEmpty | Self::ExitLoop => &[],
            Self::Jump => &[Target],
            Self::JumpIfTrue | Self::JumpIfFalse => &[Reg, Target],
            Self::Return
            | Self::LoadUndef
            | Self::NewScalar
            | Self::NewArray
            | Self::NewHash
            | Self::NewList
            | Self::Wantarray
            | Self::Inc
            | Self::Dec => &[Reg],
            Self::EnterLoop => &[StrIdx, Target, Target, Target],
            Self::CtrlLast | Self::CtrlNext | Self::CtrlRedo => &[StrIdx],
            Self::TailCall => &[Reg, Reg],
            Self::LoadInt => &[Reg, Imm],
            Self::LoadConst | Self::MakeSub => &[Reg, ConstIdx],
            Self::LoadStr
            | Self::LoadGlobalScalar
            | Self::LoadGlobalArray
            | Self::LoadGlobalHash
            | Self::LoadGlobalCode => &[Reg, StrIdx],
            Self::StoreGlobalScalar | Self::StoreGlobalArray | Self::StoreGlobalHash => &[StrIdx, Reg],
            Self::Move
            | Self::SetScalar
            | Self::Negate
            | Self::StrLength
            | Self::Not
            | Self::Defined
            | Self::ArrayPush
            | Self::ArrayPop
            | Self::ArrayShift
            | Self::ArrayUnshift
            | Self::ArrayLen
            | Self::ArrayFromList
            | Self::ArrayAssign
            | Self::ListPush
            | Self::HashAssign
            | Self::HashKeys
            | Self::HashValues
            | Self::ToScalar
            | Self::ToList
            | Self::MakeRef
            | Self::DerefScalar
            | Self::DerefArray
            | Self::DerefHash
            | Self::DerefCode
            | Self::PostInc
            | Self::PostDec
            | Self::AddAssign => &[Reg, Reg],
            Self::Add
            | Self::Subtract
            | Self::Multiply
            | Self::Divide
            | Self::Modulus
            | Self::Power
            | Self::Concat
            | Self::Repeat
            | Self::NumEq
            | Self::NumNe
            | Self::NumLt
            | Self::NumLe
            | Self::NumGt
            | Self::NumGe
            | Self::StrEq
            | Self::StrNe
            | Self::StrLt
            | Self::StrLe
            | Self::StrGt
            | Self::StrGe
            | Self::NumCmp
            | Self::StrCmp
            | Self::ArrayGet
            | Self::ArraySet
            | Self::Range
            | Self::HashGet
            | Self::HashSet
            | Self::HashDelete
            | Self::HashExists => &[Reg, Reg, Reg],
            Self::AddImm => &[Reg, Reg, Imm],
            Self::Substr => &[Reg, Reg, Reg, Reg],
            Self::Call => &[Reg, Reg, Reg, Ctx],
            Self::CallMethod => &[Reg, Reg, StrIdx, Reg, Ctx],
            Self::Slow => &[SubOp],
            Self::AddAssignImm => &[Reg, Imm],
            Self::IncCmpBr => &[Reg, Reg, Target],
        }
    }

    /// Total encoded width of this instruction, excluding any slow-op tail.
    #[must_use]
    pub fn width(self) -> usize {
        1 + self.operands().iter().map(|operand| operand.width()).sum::<usize>()
    }

    /// Static opcode name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

/// The slow-op sub-table behind the [`Op::Slow`] gateway.
///
/// Equally dense; its sub-opcode is a single byte decoded by the gateway
/// handler, which performs its own jump-table dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, FromRepr, EnumCount, IntoStaticStr)]
#[repr(u8)]
pub enum SlowOp {
    /// Bind the persistent scalar slot named by the string operand.
    RetrievePersistentScalar = 0,
    /// Bind a persistent array.
    RetrievePersistentArray,
    /// Bind a persistent hash.
    RetrievePersistentHash,
    /// `dst = splice(arr, off, len, replacement-list)`.
    Splice,
    /// Array slice: `dst = @arr[indices-list]`.
    ArraySlice,
    /// Hash slice: `dst = @hash{keys-list}`.
    HashSlice,
    /// Bless the reference into the named class.
    Bless,
    /// Demote the reference in the register to a weak handle, in place.
    Weaken,
    /// Raise the register's value as an error.
    Die,
    /// Print the register's value to standard error.
    Warn,
    /// `sqrt`
    Sqrt,
    /// `log`
    Log,
    /// `exp`
    Exp,
    /// `abs`
    Abs,
    /// `int`
    Int,
    /// `chr`
    Chr,
    /// `ord`
    Ord,
    /// `uc`
    Uc,
    /// `lc`
    Lc,
    /// `dst = join(sep, list)`
    Join,
    /// `dst = index(str, substr)`
    StrIndex,
    /// `dst = ref EXPR`
    RefType,
    /// Dynamic string evaluation with a context tag.
    EvalString,
    /// Save a global scalar's value for `local`; restored at frame exit.
    LocalSave,
    /// `dst = list of elements from offset to end` (list-assign slurp).
    TailList,
}

impl SlowOp {
    /// Operand shapes for this sub-op, following the sub-opcode byte.
    #[must_use]
    pub fn operands(self) -> &'static [OperandKind] {
        use OperandKind::{Ctx, Reg, StrIdx};
        match self {
            Self::RetrievePersistentScalar | Self::RetrievePersistentArray | Self::RetrievePersistentHash => {
                &[Reg, StrIdx]
            }
            Self::Splice => &[Reg, Reg, Reg, Reg, Reg],
            Self::ArraySlice | Self::HashSlice | Self::Join | Self::StrIndex | Self::TailList => &[Reg, Reg, Reg],
            Self::Bless => &[Reg, Reg],
            Self::Weaken | Self::Die | Self::Warn => &[Reg],
            Self::Sqrt | Self::Log | Self::Exp | Self::Abs | Self::Int | Self::Chr | Self::Ord | Self::Uc
            | Self::Lc | Self::RefType => &[Reg, Reg],
            Self::EvalString => &[Reg, Reg, Ctx],
            Self::LocalSave => &[StrIdx],
        }
    }

    /// Encoded width of the sub-op's own operands (sub-opcode byte not
    /// included).
    #[must_use]
    pub fn width(self) -> usize {
        self.operands().iter().map(|operand| operand.width()).sum()
    }

    /// Static sub-op name.
    #[must_use]
    pub fn name(self) -> &'static str {
        self.into()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use strum::EnumCount as _;

    #[test]
    fn test_opcode_space_is_contiguous() {
        // FromRepr over 0..COUNT must hit every variant exactly once; a gap
        // would break the jump-table dispatch the interpreter depends on.
        for byte in 0..Op::COUNT {
            assert!(
                Op::from_repr(byte as u8).is_some(),
                "opcode gap at {byte}: renumber the table"
            );
        }
        assert!(Op::from_repr(Op::COUNT as u8).is_none());
    }

    #[test]
    fn test_slow_op_space_is_contiguous() {
        for byte in 0..SlowOp::COUNT {
            assert!(
                SlowOp::from_repr(byte as u8).is_some(),
                "slow-op gap at {byte}: renumber the table"
            );
        }
        assert!(SlowOp::from_repr(SlowOp::COUNT as u8).is_none());
    }

    #[test]
    fn test_widths_follow_operand_shapes() {
        assert_eq!(Op::Nop.width(), 1);
        assert_eq!(Op::Jump.width(), 3);
        assert_eq!(Op::Add.width(), 4);
        assert_eq!(Op::LoadInt.width(), 6);
        assert_eq!(Op::CallMethod.width(), 7);
        assert_eq!(Op::EnterLoop.width(), 9);
        assert_eq!(SlowOp::Splice.width(), 5);
        assert_eq!(SlowOp::EvalString.width(), 3);
    }
}
