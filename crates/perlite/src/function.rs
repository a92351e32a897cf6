//! Invocable subroutines and the tagged-return flow type.
//!
//! Every subroutine — interpreter bytecode, emitted native code, a host
//! runtime function, or an eval-marker wrapper — exposes the single `apply`
//! ABI through the interpreter facade. Callers cannot tell the kinds apart.
//!
//! Non-local control flow travels as a [`Flow`] value, never as a host
//! exception: a subroutine that executes `last`/`next`/`redo` without a
//! locally visible target returns a marker, and every call site checks for
//! one before using the result.

use std::sync::Arc;

use crate::ast::{Pos, Sigil};
use crate::bytecode::Code;
use crate::container::ArrayRef;
use crate::error::PerlResult;
use crate::native::NativeSub;
use crate::run::Interp;
use crate::value::{Context, List};

/// A host-provided runtime function using the shared `apply` ABI.
pub type HostFn = fn(&mut Interp, &ArrayRef, Context) -> PerlResult<Flow>;

/// Shared handle to a subroutine.
pub type CodeRef = Arc<Sub>;

/// A capture binding: an outer lexical promoted to a persistent slot.
///
/// The artifact's prologue retrieves `persistent` from the environment into
/// a designated register or slot; `name` is the bare lexical name it binds.
#[derive(Debug, Clone)]
pub struct CaptureSpec {
    /// The variable's sigil.
    pub sigil: Sigil,
    /// Bare lexical name as written in source.
    pub name: Arc<str>,
    /// Fully qualified persistent-slot name.
    pub persistent: Arc<str>,
}

/// The implementation behind a subroutine.
#[derive(Debug)]
pub enum SubKind {
    /// Interpreter-compiled register bytecode.
    Bytecode(Arc<Code>),
    /// Host-compiled thunk tree.
    Native(Arc<NativeSub>),
    /// A host runtime function.
    Host(HostFn),
    /// The fixed eval wrapper: resolves the id in the process-wide eval
    /// registry and delegates `apply` to the interpreter-compiled artifact.
    EvalMarker(u64),
}

/// An invocable subroutine.
#[derive(Debug)]
pub struct Sub {
    name: Arc<str>,
    package: Arc<str>,
    kind: SubKind,
}

impl Sub {
    /// Wraps a bytecode artifact.
    #[must_use]
    pub fn bytecode(name: &str, package: &str, code: Arc<Code>) -> Self {
        Self {
            name: Arc::from(name),
            package: Arc::from(package),
            kind: SubKind::Bytecode(code),
        }
    }

    /// Wraps an emitted native artifact.
    #[must_use]
    pub fn native(name: &str, package: &str, body: Arc<NativeSub>) -> Self {
        Self {
            name: Arc::from(name),
            package: Arc::from(package),
            kind: SubKind::Native(body),
        }
    }

    /// Wraps a host function.
    #[must_use]
    pub fn host(name: &str, package: &str, f: HostFn) -> Self {
        Self {
            name: Arc::from(name),
            package: Arc::from(package),
            kind: SubKind::Host(f),
        }
    }

    /// Creates the eval-marker wrapper for a registry id.
    #[must_use]
    pub fn eval_marker(id: u64) -> Self {
        Self {
            name: Arc::from("__EVAL__"),
            package: Arc::from("main"),
            kind: SubKind::EvalMarker(id),
        }
    }

    /// Subroutine name (`__ANON__` for anonymous subs).
    #[must_use]
    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    /// Owning package.
    #[must_use]
    pub fn package(&self) -> &Arc<str> {
        &self.package
    }

    /// Implementation kind. Callers outside the dispatcher should not
    /// branch on this; it exists for `apply` and diagnostics.
    #[must_use]
    pub fn kind(&self) -> &SubKind {
        &self.kind
    }
}

/// The result of applying a subroutine: either values, or a control-flow
/// marker unwinding toward its target.
#[derive(Debug, Clone)]
pub enum Flow {
    /// A normal return carrying the result list.
    Ret(List),
    /// `last` seeking a loop (`label` of `None` means the innermost).
    Last {
        /// Target label, if written.
        label: Option<Arc<str>>,
        /// Source position of the operator, for diagnostics.
        pos: Pos,
    },
    /// `next` seeking a loop.
    Next {
        /// Target label, if written.
        label: Option<Arc<str>>,
        /// Source position of the operator.
        pos: Pos,
    },
    /// `redo` seeking a loop.
    Redo {
        /// Target label, if written.
        label: Option<Arc<str>>,
        /// Source position of the operator.
        pos: Pos,
    },
    /// `goto &NAME`: the trampoline re-enters with this code and arguments.
    TailCall {
        /// Target subroutine.
        code: CodeRef,
        /// The new `@_`.
        args: ArrayRef,
    },
}

impl Flow {
    /// An empty normal return.
    #[must_use]
    pub fn empty() -> Self {
        Self::Ret(List::new())
    }

    /// A normal return of one scalar.
    #[must_use]
    pub fn scalar(value: crate::value::Scalar) -> Self {
        Self::Ret(List::of(value))
    }

    /// The marker kind name, or `None` for a normal return.
    #[must_use]
    pub fn marker_kind(&self) -> Option<&'static str> {
        match self {
            Self::Ret(_) => None,
            Self::Last { .. } => Some("last"),
            Self::Next { .. } => Some("next"),
            Self::Redo { .. } => Some("redo"),
            Self::TailCall { .. } => Some("tailcall"),
        }
    }

    /// The marker's label, if it is a labeled loop-control marker.
    #[must_use]
    pub fn label(&self) -> Option<&Arc<str>> {
        match self {
            Self::Last { label, .. } | Self::Next { label, .. } | Self::Redo { label, .. } => label.as_ref(),
            _ => None,
        }
    }

    /// Whether this is any control-flow marker (not a normal return).
    #[must_use]
    pub fn is_marker(&self) -> bool {
        !matches!(self, Self::Ret(_))
    }
}
