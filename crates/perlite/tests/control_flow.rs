//! Non-local loop control across subroutine boundaries.
//!
//! `last`/`next`/`redo` without a locally visible target return a tagged
//! marker; call sites dispatch it against their loop scopes or propagate
//! it outward. A marker that escapes the top frame becomes a catchable
//! error.

mod common;

use common::{MODE_MATRIX, run_backend};
use perlite::ast::BinaryOp;
use perlite::ast::build::{
    bare, binary, block, call, foreach, int, interp, labeled, lit, my_scalar, part, scalar, sub_named, unary, unary0,
};
use perlite::ast::{Node, UnaryOp};
use perlite::ErrorKind;
use pretty_assertions::assert_eq;

fn last_op() -> Node {
    unary0(UnaryOp::Last)
}

#[test]
fn test_nonlocal_last_through_a_subroutine() {
    // sub inner { last }
    // for my $i (1..10) { inner(); print "$i\n"; }
    // The loop terminates on the first iteration producing no output.
    let program = block(vec![
        sub_named("inner", block(vec![last_op()])),
        foreach(
            "i",
            binary(BinaryOp::Range, int(1), int(10)),
            block(vec![
                call("inner", vec![]),
                call("print", vec![interp(vec![part(scalar("i")), lit("\n")])]),
            ]),
        ),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        run.result
            .as_ref()
            .unwrap_or_else(|e| panic!("{backend:?}/{sub_backend:?}: {e}"));
        assert_eq!(run.out, "", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_labeled_last_unwinds_nested_loops_through_a_call() {
    // sub hop { last OUTER }
    // OUTER: for my $i (1..3) { for my $j (1..3) { hop(); $count++ } }
    let program = block(vec![
        sub_named(
            "hop",
            block(vec![unary(UnaryOp::Last, bare("OUTER"))]),
        ),
        labeled(
            "OUTER",
            foreach(
                "i",
                binary(BinaryOp::Range, int(1), int(3)),
                block(vec![foreach(
                    "j",
                    binary(BinaryOp::Range, int(1), int(3)),
                    block(vec![
                        call("hop", vec![]),
                        unary(UnaryOp::PostInc, scalar("count")),
                    ]),
                )]),
            ),
        ),
        call("say", vec![binary(BinaryOp::Add, scalar("count"), int(0))]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok(), "pairing {backend:?}/{sub_backend:?}");
        assert_eq!(run.out, "0\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_nonlocal_next_skips_to_the_following_iteration() {
    // sub skip_even { next if $_[0] % 2 == 0 }
    let program = block(vec![
        sub_named(
            "skip_even",
            block(vec![perlite::ast::build::if_stmt(
                binary(
                    BinaryOp::NumEq,
                    binary(BinaryOp::Modulus, binary(BinaryOp::ElemArray, perlite::ast::build::array("_"), int(0)), int(2)),
                    int(0),
                ),
                block(vec![unary0(UnaryOp::Next)]),
                None,
            )]),
        ),
        foreach(
            "i",
            binary(BinaryOp::Range, int(1), int(6)),
            block(vec![
                call("skip_even", vec![scalar("i")]),
                call("print", vec![scalar("i")]),
            ]),
        ),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok());
        assert_eq!(run.out, "135", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_local_redo_restarts_the_iteration() {
    // Redo reruns the body without advancing; a counter keeps it finite.
    let program = block(vec![
        my_scalar("tries", int(0)),
        foreach(
            "i",
            binary(BinaryOp::Range, int(1), int(2)),
            block(vec![
                unary(UnaryOp::PostInc, scalar("tries")),
                perlite::ast::build::if_stmt(
                    binary(BinaryOp::NumLt, scalar("tries"), int(4)),
                    block(vec![unary0(UnaryOp::Redo)]),
                    None,
                ),
            ]),
        ),
        call("say", vec![scalar("tries")]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        assert!(run.result.is_ok());
        // Three redos on the first element, then both elements complete.
        assert_eq!(run.out, "5\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_marker_escaping_the_top_frame_is_a_catchable_error() {
    let program = block(vec![sub_named("inner", block(vec![last_op()])), call("inner", vec![])]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        let err = run.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ControlFlow);
        assert_eq!(err.message(), "Can't \"last\" outside a loop block");
    }
}

#[test]
fn test_labeled_marker_with_no_target_reports_the_label() {
    let program = block(vec![
        sub_named("lost", block(vec![unary(UnaryOp::Last, bare("NOWHERE"))])),
        foreach(
            "i",
            binary(BinaryOp::Range, int(1), int(2)),
            block(vec![call("lost", vec![])]),
        ),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let run = run_backend(&program, backend, sub_backend);
        let err = run.result.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::ControlFlow);
        assert!(err.message().contains("NOWHERE"), "{}", err.message());
    }
}
