#![doc = include_str!("../../../README.md")]
#![expect(clippy::unnecessary_wraps, reason = "dispatch signatures are uniform")]
#![expect(clippy::cast_possible_truncation, reason = "numeric narrowing is checked")]
#![expect(clippy::cast_sign_loss, reason = "sign-changing casts are intentional")]
#![expect(clippy::cast_possible_wrap, reason = "wrap behavior mirrors perl")]

pub mod ast;
mod bytecode;
mod capture;
mod config;
mod container;
mod env;
mod error;
mod eval;
mod function;
mod intern;
mod io;
mod native;
mod overload;
mod run;
pub mod tracer;
mod value;

pub use crate::{
    bytecode::{Code, CompileOptions, NO_LABEL, Op, OperandKind, SlowOp, compile_script, disassemble, disassemble_at},
    capture::{Capture, free_variables},
    config::{Backend, Config},
    container::{Array, ArrayRef, Hash, HashRef},
    env::{Environment, forces_main},
    error::{ErrorKind, PerlError, PerlResult},
    function::{CaptureSpec, CodeRef, Flow, HostFn, Sub, SubKind},
    intern::{ClassId, Interner},
    io::{CollectStringPrint, NoPrint, PrintWriter, StdPrint},
    native::NativeSub,
    overload::ClassRegistry,
    run::{DEFAULT_MAX_DEPTH, Interp, ParseHook},
    value::{
        Context, GlobRef, List, Numeric, Ref, Scalar, ScalarBinOp, ScalarRef, ScalarUnOp, Value, WeakRef, format_f64,
        parse_numeric_prefix,
    },
};
