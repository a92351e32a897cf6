//! `goto &NAME` tail calls run on the trampoline in constant host-stack
//! space; ordinary deep recursion trips the recursion guard instead of
//! overflowing the host stack.

mod common;

use common::{MODE_MATRIX, run_backend};
use perlite::ast::BinaryOp;
use perlite::ast::build::{binary, block, call, code, if_stmt, int, list, my_scalar, ret, scalar, sub_named, unary};
use perlite::ast::{BlockNode, Node, UnaryOp};
use perlite::ErrorKind;
use pretty_assertions::assert_eq;

/// sub factorial {
///     my ($n, $acc) = @_;
///     if ($n <= 1) { return $acc; }
///     goto &factorial, $n - 1, $n * $acc;
/// }
fn factorial_def() -> Node {
    sub_named(
        "factorial",
        block(vec![
            binary(
                BinaryOp::Assign,
                unary(UnaryOp::My, list(vec![scalar("n"), scalar("acc")])),
                perlite::ast::build::array("_"),
            ),
            if_stmt(
                binary(BinaryOp::NumLe, scalar("n"), int(1)),
                block(vec![ret(scalar("acc"))]),
                None,
            ),
            unary(
                UnaryOp::Goto,
                list(vec![
                    code("factorial"),
                    binary(BinaryOp::Subtract, scalar("n"), int(1)),
                    binary(BinaryOp::Multiply, scalar("n"), scalar("acc")),
                ]),
            ),
        ]),
    )
}

#[test]
fn test_tail_recursive_factorial() {
    let program = block(vec![
        factorial_def(),
        call("say", vec![call("factorial", vec![int(10), int(1)])]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        run.result
            .as_ref()
            .unwrap_or_else(|e| panic!("{backend:?}/{sub_backend:?}: {e}"));
        assert_eq!(run.out, "3628800\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

/// A self-`goto` loop of depth far past the recursion guard: only the
/// trampoline's constant stack depth lets this complete.
#[test]
fn test_goto_depth_is_constant_stack() {
    fn countdown(depth: i64) -> BlockNode {
        block(vec![
            sub_named(
                "countdown",
                block(vec![
                    my_scalar("n", unary(UnaryOp::Shift, perlite::ast::build::array("_"))),
                    if_stmt(
                        binary(BinaryOp::NumLe, scalar("n"), int(0)),
                        block(vec![ret(perlite::ast::build::text("done"))]),
                        None,
                    ),
                    unary(
                        UnaryOp::Goto,
                        list(vec![code("countdown"), binary(BinaryOp::Subtract, scalar("n"), int(1))]),
                    ),
                ]),
            ),
            call("say", vec![call("countdown", vec![int(depth)])]),
        ])
    }
    let program = countdown(100_000);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        run.result
            .as_ref()
            .unwrap_or_else(|e| panic!("{backend:?}/{sub_backend:?}: {e}"));
        assert_eq!(run.out, "done\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_goto_without_args_passes_current_args_through() {
    // goto &target with no list reuses the live @_.
    let program = block(vec![
        sub_named(
            "target",
            block(vec![ret(binary(
                BinaryOp::ElemArray,
                perlite::ast::build::array("_"),
                int(0),
            ))]),
        ),
        sub_named(
            "bounce",
            block(vec![unary(UnaryOp::Goto, list(vec![code("target")]))]),
        ),
        call("say", vec![call("bounce", vec![int(42)])]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok());
        assert_eq!(run.out, "42\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_plain_recursion_trips_the_guard() {
    use perlite::ast::CompileCtx;
    use perlite::{ArrayRef, Backend, CompileOptions, Context, Environment, Interp, NoPrint};

    let program = block(vec![
        sub_named("blow", block(vec![call("blow", vec![])])),
        call("blow", vec![]),
    ]);
    // A low ceiling keeps the host stack shallow while still proving the
    // guard converts runaway recursion into a loud error.
    for backend in [Backend::Interpreter, Backend::Native] {
        let env = Environment::new();
        let mut interp = Interp::new(env)
            .with_writer(Box::new(NoPrint))
            .with_max_depth(64);
        let code = interp
            .compile_script_with(&program, &CompileCtx::new("t.pl"), backend, &CompileOptions::default())
            .unwrap();
        let err = interp.call(&code, ArrayRef::new(), Context::Void).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Recursion, "backend {backend:?}");
    }
}
