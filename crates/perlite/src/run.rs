//! The interpreter facade: the shared `apply` ABI, the tail-call
//! trampoline, and the overload-aware operation layer both execution modes
//! call into.

use std::sync::Arc;

use ahash::AHashMap;

use crate::ast::{BlockNode, CompileCtx};
use crate::bytecode::{self, CompileOptions};
use crate::config::{Backend, Config};
use crate::container::ArrayRef;
use crate::env::Environment;
use crate::error::{PerlError, PerlResult};
use crate::function::{CodeRef, Flow, SubKind};
use crate::io::{PrintWriter, StdPrint};
use crate::native;
use crate::tracer::{ExecTracer, TraceEvent};
use crate::value::{
    Context, List, Numeric, Scalar, ScalarBinOp, ScalarUnOp, host_code,
};

/// Parser hook: the front end is an external collaborator, so dynamic eval
/// borrows its parser through this callback.
pub type ParseHook = Arc<dyn Fn(&str) -> PerlResult<BlockNode> + Send + Sync>;

/// Default recursion-depth ceiling for non-tail calls.
pub const DEFAULT_MAX_DEPTH: usize = 1000;

/// One evaluation context.
///
/// Strictly synchronous; multiple `Interp`s may run on separate threads
/// over one shared [`Environment`].
pub struct Interp {
    env: Arc<Environment>,
    config: Config,
    out: Box<dyn PrintWriter>,
    tracer: Option<Box<dyn ExecTracer>>,
    depth: usize,
    max_depth: usize,
    parse_hook: Option<ParseHook>,
    pub(crate) eval_cache: AHashMap<String, CodeRef>,
}

impl Interp {
    /// Creates an interpreter over an environment, registering the core
    /// runtime functions.
    #[must_use]
    pub fn new(env: Arc<Environment>) -> Self {
        register_core(&env);
        Self {
            env,
            config: Config::default(),
            out: Box::new(StdPrint),
            tracer: None,
            depth: 0,
            max_depth: DEFAULT_MAX_DEPTH,
            parse_hook: None,
            eval_cache: AHashMap::new(),
        }
    }

    /// Replaces the configuration.
    #[must_use]
    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Replaces the output writer.
    #[must_use]
    pub fn with_writer(mut self, out: Box<dyn PrintWriter>) -> Self {
        self.out = out;
        self
    }

    /// Installs a tracer.
    #[must_use]
    pub fn with_tracer(mut self, tracer: Box<dyn ExecTracer>) -> Self {
        self.tracer = Some(tracer);
        self
    }

    /// Installs the parser hook used by dynamic eval.
    #[must_use]
    pub fn with_parser(mut self, hook: ParseHook) -> Self {
        self.parse_hook = Some(hook);
        self
    }

    /// Raises the recursion ceiling (tests with deep non-tail recursion).
    #[must_use]
    pub fn with_max_depth(mut self, max_depth: usize) -> Self {
        self.max_depth = max_depth;
        self
    }

    /// The shared environment.
    #[must_use]
    pub fn env(&self) -> &Environment {
        &self.env
    }

    /// The active configuration.
    #[must_use]
    pub(crate) fn config(&self) -> &Config {
        &self.config
    }

    /// Takes the tracer back out (to inspect a recording tracer).
    #[must_use]
    pub fn take_tracer(&mut self) -> Option<Box<dyn ExecTracer>> {
        self.tracer.take()
    }

    pub(crate) fn parse_source(&self, source: &str) -> PerlResult<BlockNode> {
        match &self.parse_hook {
            Some(hook) => hook(source),
            None => Err(PerlError::compile("no parser installed for string eval", 0)),
        }
    }

    /// Writes to the standard-output stream.
    pub fn write_out(&mut self, text: &str) {
        self.out.write_out(text);
    }

    /// Writes to the standard-error stream.
    pub fn write_err(&mut self, text: &str) {
        self.out.write_err(text);
    }

    #[inline]
    pub(crate) fn trace_op(&mut self, pc: usize, op: crate::bytecode::Op) {
        if let Some(tracer) = &mut self.tracer {
            tracer.event(&TraceEvent::Op { pc, op: op.name() });
        }
    }

    pub(crate) fn trace(&mut self, event: TraceEvent) {
        if let Some(tracer) = &mut self.tracer {
            tracer.event(&event);
        }
    }

    // ------------------------------------------------------------------
    // The apply ABI
    // ------------------------------------------------------------------

    /// Applies a subroutine: the single polymorphic entry point shared by
    /// every implementation kind.
    ///
    /// The iterative loop here is the tail-call trampoline: a returned
    /// `TailCall` marker re-enters with the new code and arguments at
    /// constant host-stack depth.
    pub fn apply(&mut self, code: &CodeRef, args: ArrayRef, cx: Context) -> PerlResult<Flow> {
        let mut code = code.clone();
        let mut args = args;
        loop {
            if self.depth >= self.max_depth {
                return Err(PerlError::recursion(self.depth));
            }
            self.depth += 1;
            if self.tracer.is_some() {
                let name = code.name().clone();
                self.trace(TraceEvent::Call { name, context: cx });
            }
            let outcome = self.apply_once(&code, &args, cx);
            self.depth -= 1;
            let flow = outcome?;
            if self.tracer.is_some() {
                self.trace(TraceEvent::Return {
                    marker: flow.marker_kind(),
                });
            }
            match flow {
                Flow::TailCall {
                    code: next_code,
                    args: next_args,
                } => {
                    code = next_code;
                    args = next_args;
                }
                other => return Ok(other),
            }
        }
    }

    fn apply_once(&mut self, code: &CodeRef, args: &ArrayRef, cx: Context) -> PerlResult<Flow> {
        match code.kind() {
            SubKind::Bytecode(chunk) => {
                let chunk = chunk.clone();
                bytecode::vm::run(self, &chunk, code, args, cx)
            }
            SubKind::Native(body) => {
                let body = body.clone();
                native::run_native(self, &body, args, cx)
            }
            SubKind::Host(f) => f(self, args, cx),
            SubKind::EvalMarker(id) => {
                // The fixed eval wrapper: resolve the artifact through the
                // process-wide registry and delegate.
                let inner = self
                    .env
                    .lookup_eval(*id)
                    .ok_or_else(|| PerlError::internal(format!("eval registry has no artifact for id {id}")))?;
                self.apply_once(&inner, args, cx)
            }
        }
    }

    /// Applies a subroutine and converts any unconsumed control marker to
    /// the catchable top-frame error.
    pub fn call(&mut self, code: &CodeRef, args: ArrayRef, cx: Context) -> PerlResult<List> {
        match self.apply(code, args, cx)? {
            Flow::Ret(list) => Ok(list),
            marker => Err(flow_to_error(&marker)),
        }
    }

    /// Resolves and applies a method on an invocant (a blessed reference
    /// or a package name).
    pub fn call_method(&mut self, invocant: &Scalar, name: &str, args: &ArrayRef, cx: Context) -> PerlResult<Flow> {
        let class = match invocant.blessed() {
            Some(class) => class,
            None => match invocant {
                Scalar::Str(package) => self.env.class_id(package),
                Scalar::Ref(_) => {
                    return Err(PerlError::runtime(format!(
                        "Can't call method \"{name}\" on unblessed reference"
                    )));
                }
                other => {
                    return Err(PerlError::runtime(format!(
                        "Can't call method \"{name}\" without a package or object reference ({})",
                        other.plain_message()
                    )));
                }
            },
        };
        let method = self.env.resolve_method(class, name).ok_or_else(|| {
            let package = self.env.interner().name(class);
            PerlError::runtime(format!("Can't locate object method \"{name}\" via package \"{package}\""))
        })?;
        let with_invocant = ArrayRef::new();
        with_invocant.push_value(invocant.clone());
        for slot in args.slots() {
            with_invocant.push_slot(slot);
        }
        self.apply(&method, with_invocant, cx)
    }

    // ------------------------------------------------------------------
    // Compilation entry points
    // ------------------------------------------------------------------

    /// Compiles a script body with the configured backend.
    pub fn compile_script(&mut self, body: &BlockNode, ctx: &CompileCtx) -> PerlResult<CodeRef> {
        self.compile_script_with(body, ctx, self.config.script_backend(), &CompileOptions::default())
    }

    /// Compiles a script body with an explicit backend and options.
    pub fn compile_script_with(
        &mut self,
        body: &BlockNode,
        ctx: &CompileCtx,
        backend: Backend,
        opts: &CompileOptions,
    ) -> PerlResult<CodeRef> {
        let mut opts = opts.clone();
        if self.config.interpreter_only {
            opts.sub_backend = Some(Backend::Interpreter);
        }
        match backend {
            Backend::Interpreter => bytecode::compile_script(&self.env, body, ctx, &opts),
            Backend::Native => native::emit_script(&self.env, body, ctx, &opts),
        }
        .map_err(|error| {
            let line = ctx.line(error.pos().unwrap_or(0));
            error.with_location(ctx.file.clone(), line)
        })
    }

    /// Compiles and runs a script body, returning its result list.
    pub fn run_script(&mut self, body: &BlockNode, ctx: &CompileCtx) -> PerlResult<List> {
        let code = self.compile_script(body, ctx)?;
        self.call(&code, ArrayRef::new(), Context::Void)
    }

    // ------------------------------------------------------------------
    // Overload-aware operations (C1 entry points)
    // ------------------------------------------------------------------

    /// Overload-aware truthiness.
    pub fn truthy(&mut self, value: &Scalar) -> PerlResult<bool> {
        if value.overloaded()
            && let Some(converted) = self.convert_overloaded(value, &["bool", "\"\"", "0+"])?
        {
            return Ok(converted.truthy());
        }
        Ok(value.truthy())
    }

    /// Overload-aware stringification (the `""` conversion).
    pub fn stringify(&mut self, value: &Scalar) -> PerlResult<Arc<str>> {
        if value.overloaded()
            && let Some(converted) = self.convert_overloaded(value, &["\"\"", "0+", "bool"])?
        {
            return Ok(converted.str_plain(self.env.interner()));
        }
        Ok(value.str_plain(self.env.interner()))
    }

    /// Overload-aware numification (the `0+` conversion).
    pub fn numify(&mut self, value: &Scalar) -> PerlResult<Numeric> {
        if value.overloaded()
            && let Some(converted) = self.convert_overloaded(value, &["0+", "\"\"", "bool"])?
        {
            return Ok(converted.numify());
        }
        Ok(value.numify())
    }

    /// Binary operation with the full overload resolution ladder: direct
    /// overload, the `()` nomethod handler, conversion fallbacks, then the
    /// default type-specific behavior.
    pub fn bin_op(&mut self, op: ScalarBinOp, a: &Scalar, b: &Scalar) -> PerlResult<Scalar> {
        if a.overloaded() || b.overloaded() {
            if let Some(result) = self.try_overload_bin(op, a, b)? {
                return Ok(result);
            }
            let left = self.convert_operand(op, a)?;
            let right = self.convert_operand(op, b)?;
            return op.apply_plain(&left, &right, self.env.interner());
        }
        op.apply_plain(a, b, self.env.interner())
    }

    /// Unary operation with overload dispatch where Perl allows it.
    pub fn un_op(&mut self, op: ScalarUnOp, a: &Scalar) -> PerlResult<Scalar> {
        if op == ScalarUnOp::Not {
            return Ok(Scalar::from_bool(!self.truthy(a)?));
        }
        if a.overloaded() {
            if let Some(symbol) = op.symbol()
                && let Some(class) = a.blessed()
                && let Some(handler) = self.env.classes().find_overload(class, symbol)
            {
                return self.call_overload(&handler, &[a.clone(), Scalar::Undef, Scalar::from_str_slice("")]);
            }
            if let Some(converted) = self.convert_overloaded(a, &["0+", "\"\"", "bool"])? {
                return op.apply_plain(&converted, self.env.interner());
            }
        }
        op.apply_plain(a, self.env.interner())
    }

    fn try_overload_bin(&mut self, op: ScalarBinOp, a: &Scalar, b: &Scalar) -> PerlResult<Option<Scalar>> {
        let direct = |interp: &Self, operand: &Scalar| {
            operand
                .blessed()
                .filter(|_| operand.overloaded())
                .and_then(|class| interp.env.classes().find_overload(class, op.symbol()))
        };
        if let Some(handler) = direct(self, a) {
            let result =
                self.call_overload(&handler, &[a.clone(), b.clone(), Scalar::from_str_slice("")])?;
            return Ok(Some(result));
        }
        if let Some(handler) = direct(self, b) {
            let result = self.call_overload(&handler, &[b.clone(), a.clone(), Scalar::Int(1)])?;
            return Ok(Some(result));
        }
        // The `()` handler is the declared catch-all before conversion
        // fallbacks; it receives the operator name as a fourth argument.
        for (operand, other, swapped) in [(a, b, Scalar::from_str_slice("")), (b, a, Scalar::Int(1))] {
            if let Some(class) = operand.blessed().filter(|_| operand.overloaded())
                && let Some(handler) = self.env.classes().find_overload(class, "()")
            {
                let result = self.call_overload(
                    &handler,
                    &[
                        operand.clone(),
                        other.clone(),
                        swapped,
                        Scalar::from_str_slice(op.symbol()),
                    ],
                )?;
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    /// Runs the declared conversion-fallback ladder for one operand.
    fn convert_overloaded(&mut self, value: &Scalar, ladder: &[&str]) -> PerlResult<Option<Scalar>> {
        let Some(class) = value.blessed() else {
            return Ok(None);
        };
        for symbol in ladder {
            if let Some(handler) = self.env.classes().find_overload(class, symbol) {
                let result =
                    self.call_overload(&handler, &[value.clone(), Scalar::Undef, Scalar::from_str_slice("")])?;
                return Ok(Some(result));
            }
        }
        Ok(None)
    }

    fn convert_operand(&mut self, op: ScalarBinOp, value: &Scalar) -> PerlResult<Scalar> {
        if !value.overloaded() {
            return Ok(value.clone());
        }
        let stringy = matches!(
            op,
            ScalarBinOp::Concat
                | ScalarBinOp::Repeat
                | ScalarBinOp::StrEq
                | ScalarBinOp::StrNe
                | ScalarBinOp::StrLt
                | ScalarBinOp::StrLe
                | ScalarBinOp::StrGt
                | ScalarBinOp::StrGe
                | ScalarBinOp::StrCmp
        );
        if stringy {
            Ok(Scalar::Str(self.stringify(value)?))
        } else {
            Ok(self.numify(value)?.into_scalar())
        }
    }

    fn call_overload(&mut self, handler: &CodeRef, args: &[Scalar]) -> PerlResult<Scalar> {
        let array = ArrayRef::new();
        for value in args {
            array.push_value(value.clone());
        }
        match self.apply(handler, array, Context::Scalar)? {
            Flow::Ret(list) => Ok(list.scalar_value()),
            marker => Err(flow_to_error(&marker)),
        }
    }
}

/// Converts an unconsumed control marker into the catchable error raised
/// at the top frame.
pub(crate) fn flow_to_error(flow: &Flow) -> PerlError {
    match flow.marker_kind() {
        Some("tailcall") => PerlError::internal("tail-call marker escaped the trampoline"),
        Some(kind) => PerlError::unmatched_control(kind, flow.label().map(|l| &**l)),
        None => PerlError::internal("normal return treated as control marker"),
    }
}

// ----------------------------------------------------------------------
// Core runtime functions (outbound ABI)
// ----------------------------------------------------------------------

fn register_core(env: &Environment) {
    env.set_code("CORE::print", host_code("print", "CORE", core_print));
    env.set_code("CORE::say", host_code("say", "CORE", core_say));
    env.set_code("CORE::warn", host_code("warn", "CORE", core_warn));
    env.set_code("CORE::die", host_code("die", "CORE", core_die));
    env.set_code("CORE::join", host_code("join", "CORE", core_join));
    env.set_code("CORE::ref", host_code("ref", "CORE", core_ref));
    env.set_code("CORE::defined", host_code("defined", "CORE", core_defined));
}

fn core_print(interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let mut out = String::new();
    for value in args.to_list().values() {
        out.push_str(&interp.stringify(value)?);
    }
    interp.write_out(&out);
    Ok(Flow::scalar(Scalar::Int(1)))
}

fn core_say(interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let mut out = String::new();
    for value in args.to_list().values() {
        out.push_str(&interp.stringify(value)?);
    }
    out.push('\n');
    interp.write_out(&out);
    Ok(Flow::scalar(Scalar::Int(1)))
}

fn core_warn(interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let mut text = String::new();
    for value in args.to_list().values() {
        text.push_str(&interp.stringify(value)?);
    }
    if text.is_empty() {
        text.push_str("Warning: something's wrong");
    }
    if !text.ends_with('\n') {
        text.push('\n');
    }
    interp.write_err(&text);
    Ok(Flow::scalar(Scalar::Int(1)))
}

fn core_die(interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let list = args.to_list();
    match list.values() {
        [] => Err(PerlError::die_value(Scalar::from_str_slice("Died"))),
        [single] if !single.is_plain_message() => Err(PerlError::die_value(single.clone())),
        values => {
            let mut text = String::new();
            for value in values {
                text.push_str(&interp.stringify(value)?);
            }
            Err(PerlError::die_value(Scalar::from_string(text)))
        }
    }
}

fn core_join(interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let list = args.to_list();
    let Some((sep, rest)) = list.values().split_first() else {
        return Ok(Flow::scalar(Scalar::from_str_slice("")));
    };
    let separator = interp.stringify(sep)?;
    let mut parts = Vec::with_capacity(rest.len());
    for value in rest {
        parts.push(interp.stringify(value)?.to_string());
    }
    Ok(Flow::scalar(Scalar::from_string(parts.join(&separator))))
}

fn core_ref(interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let value = args.get(0);
    let name: std::sync::Arc<str> = match &value {
        Scalar::Ref(handle) => match handle.blessed() {
            Some(class) => interp.env().interner().name(class),
            None => handle.type_str().into(),
        },
        Scalar::Code(_) => "CODE".into(),
        _ => "".into(),
    };
    Ok(Flow::scalar(Scalar::Str(name)))
}

fn core_defined(_interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    let defined = match args.get(0) {
        Scalar::Undef => false,
        Scalar::Weak(weak) => !weak.upgrade().is_undef(),
        _ => true,
    };
    Ok(Flow::scalar(Scalar::from_bool(defined)))
}
