//! The native half of the dual-mode core.
//!
//! Instead of producing bytecode, this backend compiles the AST once into a
//! tree of composed `Fn` objects that the host compiler has already
//! optimized. Emitted thunks call the same runtime value API as the
//! interpreter and expose the same `apply` ABI, so call sites cannot tell
//! the two modes apart.
//!
//! Control flow uses tagged returns end to end: a thunk evaluates to either
//! a value or a [`Flow`] marker, and markers thread outward through block
//! and loop thunks until a [`dispatch::BlockDispatcher`] claims them or the
//! subroutine boundary propagates them to the caller. All evaluation
//! temporaries live in host locals owned by each thunk; there is no shared
//! operand stack to desynchronize.

pub(crate) mod dispatch;
mod emit;

use std::fmt;
use std::sync::Arc;

use ahash::AHashMap;

pub(crate) use emit::{emit_script, emit_sub_body};

use crate::container::ArrayRef;
use crate::error::PerlResult;
use crate::function::{CaptureSpec, Flow};
use crate::run::Interp;
use crate::value::{Context, Scalar, Value};

/// The outcome of one emitted thunk: a value, or control flow threading
/// outward.
pub(crate) enum Ctl {
    /// A normal expression value.
    Val(Value),
    /// A return or control-flow marker unwinding toward its target.
    Flow(Flow),
}

/// One emitted code unit.
pub(crate) type Thunk = Arc<dyn Fn(&mut Interp, &mut NativeFrame) -> PerlResult<Ctl> + Send + Sync>;

/// An emitted subroutine.
pub struct NativeSub {
    pub(crate) body: Thunk,
    pub(crate) nslots: usize,
    pub(crate) captures: Vec<CaptureSpec>,
    pub(crate) lexical_map: AHashMap<Arc<str>, Arc<str>>,
    pub(crate) name: Arc<str>,
}

impl fmt::Debug for NativeSub {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeSub")
            .field("name", &self.name)
            .field("nslots", &self.nslots)
            .field("captures", &self.captures)
            .finish_non_exhaustive()
    }
}

impl NativeSub {
    /// Bare lexical name → persistent-slot name, for lexicals visible to
    /// dynamic eval.
    #[must_use]
    pub(crate) fn lexical_map(&self) -> &AHashMap<Arc<str>, Arc<str>> {
        &self.lexical_map
    }
}

/// One native activation record: local-variable slots plus the call inputs.
pub(crate) struct NativeFrame {
    pub(crate) slots: Vec<Value>,
    pub(crate) args: ArrayRef,
    pub(crate) cx: Context,
    pub(crate) saved_locals: Vec<(Arc<str>, Scalar)>,
}

/// Executes an emitted subroutine under the shared `apply` ABI.
pub(crate) fn run_native(interp: &mut Interp, sub: &NativeSub, args: &ArrayRef, cx: Context) -> PerlResult<Flow> {
    let cx = if cx == Context::Runtime { Context::List } else { cx };
    let mut frame = NativeFrame {
        slots: vec![Value::None; sub.nslots],
        args: args.clone(),
        cx,
        saved_locals: Vec::new(),
    };
    let result = (sub.body)(interp, &mut frame);

    // `local` teardown runs on every exit path, reverse order.
    for (name, saved) in frame.saved_locals.drain(..).rev() {
        interp.env().get_scalar(&name).set(saved);
    }

    match result? {
        Ctl::Val(value) => Ok(Flow::Ret(value.list_value())),
        Ctl::Flow(flow) => Ok(flow),
    }
}
