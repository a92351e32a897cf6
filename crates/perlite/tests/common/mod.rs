//! Shared harness for the end-to-end tests: a capturing writer, a tiny
//! expression parser for dynamic-eval tests, and backend-parameterized
//! script runners.

use std::sync::{Arc, Mutex};

use perlite::ast::build::{binary, block, int, scalar};
use perlite::ast::{BinaryOp, BlockNode, CompileCtx, Node};
use perlite::{
    ArrayRef, Backend, CompileOptions, Config, Context, Environment, Interp, List, ParseHook, PerlError, PerlResult,
    PrintWriter,
};

/// Writer that shares its buffers with the test body.
#[derive(Clone, Default)]
pub struct SharedPrint {
    out: Arc<Mutex<String>>,
    err: Arc<Mutex<String>>,
}

impl SharedPrint {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn output(&self) -> String {
        self.out.lock().unwrap().clone()
    }

    pub fn errors(&self) -> String {
        self.err.lock().unwrap().clone()
    }
}

impl PrintWriter for SharedPrint {
    fn write_out(&mut self, text: &str) {
        self.out.lock().unwrap().push_str(text);
    }

    fn write_err(&mut self, text: &str) {
        self.err.lock().unwrap().push_str(text);
    }
}

/// A minimal front-end parser covering the expression forms the eval tests
/// feed in: `$name`, integer literals, and space-separated binary forms
/// like `$var3 = 3` or `$w * 2`.
pub fn mini_parser() -> ParseHook {
    Arc::new(|source: &str| Ok(block(vec![parse_expr(source)?])))
}

fn parse_expr(source: &str) -> PerlResult<Node> {
    let parts: Vec<&str> = source.split_whitespace().collect();
    match parts.as_slice() {
        [one] => parse_token(one),
        [lhs, op, rhs] => {
            let op = match *op {
                "=" => BinaryOp::Assign,
                "+" => BinaryOp::Add,
                "-" => BinaryOp::Subtract,
                "*" => BinaryOp::Multiply,
                "/" => BinaryOp::Divide,
                "." => BinaryOp::Concat,
                "==" => BinaryOp::NumEq,
                other => return Err(PerlError::compile(format!("unknown operator {other}"), 0)),
            };
            Ok(binary(op, parse_token(lhs)?, parse_token(rhs)?))
        }
        _ => Err(PerlError::compile("unsupported expression shape", 0)),
    }
}

fn parse_token(token: &str) -> PerlResult<Node> {
    if let Some(name) = token.strip_prefix('$') {
        return Ok(scalar(name));
    }
    token
        .parse::<i64>()
        .map(int)
        .map_err(|_| PerlError::compile(format!("unparsable token {token}"), 0))
}

/// The outcome of one scripted run.
pub struct Run {
    pub result: PerlResult<List>,
    pub out: String,
    pub err: String,
    pub env: Arc<Environment>,
}

/// Compiles and runs `body` with an explicit backend choice.
pub fn run_backend(body: &BlockNode, backend: Backend, sub_backend: Option<Backend>) -> Run {
    let env = Environment::new();
    run_in_env(&env, body, backend, sub_backend, Config::default())
}

/// Compiles and runs `body` in an existing environment.
pub fn run_in_env(
    env: &Arc<Environment>,
    body: &BlockNode,
    backend: Backend,
    sub_backend: Option<Backend>,
    config: Config,
) -> Run {
    let writer = SharedPrint::new();
    let mut interp = Interp::new(env.clone())
        .with_writer(Box::new(writer.clone()))
        .with_config(config)
        .with_parser(mini_parser());
    let ctx = CompileCtx::new("t.pl");
    let opts = CompileOptions {
        sub_backend,
        ..CompileOptions::default()
    };
    let result = interp
        .compile_script_with(body, &ctx, backend, &opts)
        .and_then(|code| interp.call(&code, ArrayRef::new(), Context::Void));
    Run {
        result,
        out: writer.output(),
        err: writer.errors(),
        env: env.clone(),
    }
}

/// Every backend pairing used by the cross-mode matrix.
pub const MODE_MATRIX: [(Backend, Option<Backend>); 4] = [
    (Backend::Interpreter, None),
    (Backend::Native, None),
    (Backend::Interpreter, Some(Backend::Native)),
    (Backend::Native, Some(Backend::Interpreter)),
];
