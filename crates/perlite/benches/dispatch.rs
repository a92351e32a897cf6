//! Dispatch-loop and eval-policy benchmarks.
//!
//! The counting loop exercises both execution modes (the interpreter path
//! hits the fused induction superinstruction `IncCmpBr` and the in-place
//! `AddAssignImm`). The eval benchmark measures the policy trade-off: for
//! distinct strings the interpreter backend skips per-eval artifact
//! construction entirely.

use std::sync::Arc;

use criterion::{Criterion, criterion_group, criterion_main};
use perlite::ast::BinaryOp;
use perlite::ast::build::{binary, block, for_loop, int, my_scalar, scalar, unary};
use perlite::ast::{BlockNode, CompileCtx, UnaryOp};
use perlite::{ArrayRef, Backend, CodeRef, CompileOptions, Config, Context, Environment, Interp, NoPrint, PerlError};

fn counting_loop(limit: i64) -> BlockNode {
    block(vec![
        my_scalar("sum", int(0)),
        for_loop(
            Some(my_scalar("i", int(0))),
            Some(binary(BinaryOp::NumLt, scalar("i"), int(limit))),
            Some(unary(UnaryOp::PostInc, scalar("i"))),
            block(vec![binary(BinaryOp::AddAssign, scalar("sum"), int(1))]),
        ),
        scalar("sum"),
    ])
}

fn compile(interp: &mut Interp, backend: Backend) -> CodeRef {
    interp
        .compile_script_with(
            &counting_loop(10_000),
            &CompileCtx::new("bench.pl"),
            backend,
            &CompileOptions::default(),
        )
        .expect("bench program compiles")
}

fn bench_dispatch(c: &mut Criterion) {
    let env = Environment::new();
    let mut interp = Interp::new(env).with_writer(Box::new(NoPrint));
    let bytecode = compile(&mut interp, Backend::Interpreter);
    let native = compile(&mut interp, Backend::Native);

    c.bench_function("counting_loop_interpreter", |b| {
        b.iter(|| {
            interp
                .call(&bytecode, ArrayRef::new(), Context::Scalar)
                .expect("loop runs")
        });
    });
    c.bench_function("counting_loop_native", |b| {
        b.iter(|| {
            interp
                .call(&native, ArrayRef::new(), Context::Scalar)
                .expect("loop runs")
        });
    });
}

/// A front-end stand-in parsing only `$name = INT`.
fn assignment_parser() -> perlite::ParseHook {
    Arc::new(|source: &str| {
        let mut parts = source.split_whitespace();
        let (Some(lhs), Some("="), Some(rhs)) = (parts.next(), parts.next(), parts.next()) else {
            return Err(PerlError::compile("unsupported bench expression", 0));
        };
        let name = lhs
            .strip_prefix('$')
            .ok_or_else(|| PerlError::compile("expected a scalar", 0))?;
        let value: i64 = rhs.parse().map_err(|_| PerlError::compile("expected an integer", 0))?;
        Ok(block(vec![binary(BinaryOp::Assign, scalar(name), int(value))]))
    })
}

fn bench_eval_policy(c: &mut Criterion) {
    for (label, eval_use_interpreter) in [("eval_distinct_native", false), ("eval_distinct_interpreter", true)] {
        c.bench_function(label, |b| {
            let env = Environment::new();
            let mut interp = Interp::new(env)
                .with_writer(Box::new(NoPrint))
                .with_parser(assignment_parser())
                .with_config(Config {
                    eval_use_interpreter,
                    ..Config::default()
                });
            let mut counter = 0u64;
            b.iter(|| {
                counter += 1;
                let source = format!("$var{counter} = {counter}");
                interp
                    .eval_string(&source, &Default::default(), Context::Void)
                    .expect("eval runs")
            });
        });
    }
}

criterion_group!(benches, bench_dispatch, bench_eval_policy);
criterion_main!(benches);
