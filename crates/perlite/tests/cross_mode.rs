//! Captured lexicals shared across execution modes.
//!
//! A lexical captured by a subroutine is promoted to a persistent slot;
//! a write observed through either mode is immediately visible through
//! the other, in every pairing of outer/inner backends.

mod common;

use common::{MODE_MATRIX, run_backend, run_in_env};
use perlite::Environment;
use perlite::ast::BinaryOp;
use perlite::ast::build::{binary, block, call, int, my_scalar, ret, scalar, sub_named, unary};
use perlite::ast::{BlockNode, UnaryOp};
use perlite::{Backend, Config};
use pretty_assertions::assert_eq;

/// my $w = 20;
/// sub neighbors { return $w * 2 }
/// say neighbors();
/// $w = 30;
/// say neighbors();
fn neighbors_program() -> BlockNode {
    block(vec![
        my_scalar("w", int(20)),
        sub_named(
            "neighbors",
            block(vec![ret(binary(BinaryOp::Multiply, scalar("w"), int(2)))]),
        ),
        call("say", vec![call("neighbors", vec![])]),
        binary(BinaryOp::Assign, scalar("w"), int(30)),
        call("say", vec![call("neighbors", vec![])]),
    ])
}

#[test]
fn test_capture_shared_in_every_mode_pairing() {
    let program = neighbors_program();
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        run.result
            .as_ref()
            .unwrap_or_else(|e| panic!("{backend:?}/{sub_backend:?} failed: {e}"));
        assert_eq!(run.out, "40\n60\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_write_through_assignment_updates_the_same_slot() {
    // The assignment between the calls must mutate the existing slot
    // (set semantics), not rebind it, or the captured peer keeps seeing
    // the old storage.
    let program = block(vec![
        my_scalar("w", int(1)),
        sub_named("peek", block(vec![ret(scalar("w"))])),
        binary(BinaryOp::Assign, scalar("w"), int(7)),
        call("say", vec![call("peek", vec![])]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok());
        assert_eq!(run.out, "7\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_eval_reads_and_writes_enclosing_lexicals() {
    // String eval resolves enclosing lexicals through the artifact's
    // lexical map; with the interpreter eval backend under a native
    // outer frame this crosses modes.
    let program = block(vec![
        my_scalar("w", int(20)),
        my_scalar("doubled", unary(UnaryOp::EvalStr, perlite::ast::build::text("$w * 2"))),
        call("say", vec![scalar("doubled")]),
        unary(UnaryOp::EvalStr, perlite::ast::build::text("$w = 30")),
        call("say", vec![scalar("w")]),
    ]);
    let config = Config {
        eval_use_interpreter: true,
        ..Config::default()
    };
    for backend in [Backend::Native, Backend::Interpreter] {
        let env = Environment::new();
        let run = run_in_env(&env, &program, backend, None, config);
        run.result.as_ref().unwrap_or_else(|e| panic!("{backend:?} failed: {e}"));
        assert_eq!(run.out, "40\n30\n", "outer backend {backend:?}");
    }
}

#[test]
fn test_globals_are_shared_without_promotion() {
    // Package globals live in the environment already; both modes bind
    // the same slot by qualified name.
    let program = block(vec![
        binary(BinaryOp::Assign, scalar("main::count"), int(5)),
        sub_named("bump", block(vec![binary(BinaryOp::AddAssign, scalar("main::count"), int(1))])),
        call("bump", vec![]),
        call("bump", vec![]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok());
        assert_eq!(
            run.env.get_scalar("main::count").get().as_int(),
            7,
            "pairing {backend:?}/{sub_backend:?}"
        );
    }
}
