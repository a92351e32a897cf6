//! Dynamic-evaluation policy: backend selection, the eval-marker registry,
//! per-string caching, and error discipline.

mod common;

use common::{mini_parser, run_in_env, SharedPrint};
use perlite::ast::build::{binary, block, call, int, interp as interp_str, lit, part, scalar, text, unary};
use perlite::ast::{BinaryOp, UnaryOp};
use perlite::tracer::{RecordingTracer, TraceEvent};
use perlite::{Backend, Config, Context, Environment, Interp};
use pretty_assertions::assert_eq;

#[test]
fn test_distinct_eval_strings_under_the_interpreter_backend() {
    // for my $i (1..N) { eval "$var<i> = <i>" } — every string distinct,
    // which is exactly the workload the interpreter backend is for.
    let program = block(vec![perlite::ast::build::foreach(
        "i",
        binary(BinaryOp::Range, int(1), int(500)),
        block(vec![unary(
            UnaryOp::EvalStr,
            interp_str(vec![lit("$var"), part(scalar("i")), lit(" = "), part(scalar("i"))]),
        )]),
    )]);
    let config = Config {
        eval_use_interpreter: true,
        ..Config::default()
    };
    for backend in [Backend::Native, Backend::Interpreter] {
        let env = Environment::new();
        let run = run_in_env(&env, &program, backend, None, config);
        run.result.as_ref().unwrap_or_else(|e| panic!("{backend:?}: {e}"));
        assert_eq!(env.get_scalar("main::var1").get().as_int(), 1);
        assert_eq!(env.get_scalar("main::var250").get().as_int(), 250);
        assert_eq!(env.get_scalar("main::var500").get().as_int(), 500);
    }
}

#[test]
fn test_eval_result_matches_across_backends() {
    // For a side-effect-free eval string the two backends agree.
    let mut results = Vec::new();
    for eval_use_interpreter in [false, true] {
        let env = Environment::new();
        let mut interp = Interp::new(env)
            .with_parser(mini_parser())
            .with_config(Config {
                eval_use_interpreter,
                ..Config::default()
            });
        let list = interp
            .eval_string("6 * 7", &Default::default(), Context::Scalar)
            .unwrap();
        results.push(list.scalar_value().as_int());
    }
    assert_eq!(results, vec![42, 42]);
}

#[test]
fn test_interpreter_backend_registers_marker_artifacts() {
    let env = Environment::new();
    let mut interp = Interp::new(env)
        .with_parser(mini_parser())
        .with_config(Config {
            eval_use_interpreter: true,
            ..Config::default()
        });
    let _ = interp
        .eval_string("$x = 9", &Default::default(), Context::Void)
        .unwrap();
    // The artifact is reachable through the process-wide registry the
    // fixed wrapper consults.
    assert!(interp.env().lookup_eval(0).is_some());
    assert_eq!(interp.env().get_scalar("main::x").get().as_int(), 9);
}

#[test]
fn test_native_backend_caches_repeated_strings() {
    let env = Environment::new();
    let recorder = RecordingTracer::new();
    let mut interp = Interp::new(env)
        .with_parser(mini_parser())
        .with_tracer(Box::new(recorder.clone()));
    for _ in 0..3 {
        let _ = interp
            .eval_string("1 + 2", &Default::default(), Context::Scalar)
            .unwrap();
    }
    // One cold compile, then cache hits for the identical string.
    let evals: Vec<bool> = recorder
        .snapshot()
        .iter()
        .filter_map(|event| match event {
            TraceEvent::EvalCompile { cached, .. } => Some(*cached),
            _ => None,
        })
        .collect();
    assert_eq!(evals, vec![false, true, true]);
}

#[test]
fn test_eval_error_sets_err_var_and_continues() {
    let program = block(vec![
        unary(UnaryOp::EvalStr, text("this is not ; parseable")),
        call("say", vec![scalar("@")]),
        binary(BinaryOp::Assign, scalar("main::after"), int(1)),
    ]);
    let env = Environment::new();
    let run = run_in_env(&env, &program, Backend::Interpreter, None, Config::default());
    assert!(run.result.is_ok(), "eval failure must not abort the script");
    assert!(!run.out.trim().is_empty(), "$@ holds the compile error");
    assert_eq!(env.get_scalar("main::after").get().as_int(), 1);
}

#[test]
fn test_eval_verbose_escalates_compile_errors_to_stderr() {
    for verbose in [false, true] {
        let env = Environment::new();
        let writer = SharedPrint::new();
        let mut interp = Interp::new(env)
            .with_writer(Box::new(writer.clone()))
            .with_parser(mini_parser())
            .with_config(Config {
                eval_verbose: verbose,
                ..Config::default()
            });
        let _ = interp
            .eval_string("not ; parseable", &Default::default(), Context::Void)
            .unwrap();
        assert_eq!(
            !writer.errors().is_empty(),
            verbose,
            "stderr escalation follows EVAL_VERBOSE"
        );
    }
}

#[test]
fn test_runtime_error_inside_eval_is_caught() {
    let env = Environment::new();
    let mut interp = Interp::new(env).with_parser(mini_parser());
    let result = interp
        .eval_string("1 / 0", &Default::default(), Context::Scalar)
        .unwrap();
    assert!(result.is_empty());
    assert!(
        interp
            .env()
            .err_var()
            .plain_message()
            .contains("Illegal division by zero")
    );
    // A successful eval afterwards clears $@.
    let ok = interp
        .eval_string("1 + 1", &Default::default(), Context::Scalar)
        .unwrap();
    assert_eq!(ok.scalar_value().as_int(), 2);
    assert_eq!(interp.env().err_var().plain_message(), "");
}

