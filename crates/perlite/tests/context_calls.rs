//! Calling-context propagation and `wantarray`.

mod common;

use common::{MODE_MATRIX, run_backend};
use perlite::ast::BinaryOp;
use perlite::ast::build::{
    array, binary, block, call, int, list, my_array, my_scalar, ret, scalar, sub_named, ternary, text, unary, unary0,
};
use perlite::ast::{Node, UnaryOp};
use pretty_assertions::assert_eq;

/// sub ctx { return wantarray ? (1, 2, 3) : "scalar"; }
fn ctx_def() -> Node {
    sub_named(
        "ctx",
        block(vec![ret(ternary(
            unary0(UnaryOp::Wantarray),
            list(vec![int(1), int(2), int(3)]),
            text("scalar"),
        ))]),
    )
}

#[test]
fn test_context_follows_the_assignment_target() {
    let program = block(vec![
        ctx_def(),
        my_scalar("x", call("ctx", vec![])),
        my_array("a", call("ctx", vec![])),
        call("ctx", vec![]),
        call("say", vec![scalar("x")]),
        call("say", vec![unary(UnaryOp::ScalarCtx, array("a"))]),
        int(1),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        run.result
            .as_ref()
            .unwrap_or_else(|e| panic!("{backend:?}/{sub_backend:?}: {e}"));
        assert_eq!(run.out, "scalar\n3\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_runtime_context_defers_to_the_caller() {
    // sub relay { return ctx(); } — the inner call compiles with the
    // RUNTIME tag and resolves against relay's own calling context.
    let program = block(vec![
        ctx_def(),
        sub_named("relay", block(vec![ret(call("ctx", vec![]))])),
        my_scalar("x", call("relay", vec![])),
        my_array("a", call("relay", vec![])),
        call("say", vec![scalar("x")]),
        call("say", vec![unary(UnaryOp::ScalarCtx, array("a"))]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok(), "pairing {backend:?}/{sub_backend:?}");
        assert_eq!(run.out, "scalar\n3\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_void_context_is_undef_wantarray() {
    let program = block(vec![
        sub_named(
            "observe",
            block(vec![binary(
                BinaryOp::Assign,
                scalar("main::seen"),
                ternary(
                    unary(UnaryOp::Defined, unary0(UnaryOp::Wantarray)),
                    text("defined"),
                    text("undef"),
                ),
            )]),
        ),
        call("observe", vec![]),
        int(1),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok());
        assert_eq!(
            run.env.get_scalar("main::seen").get().plain_message(),
            "undef",
            "pairing {backend:?}/{sub_backend:?}"
        );
    }
}
