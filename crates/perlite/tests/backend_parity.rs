//! For side-effect-free programs the interpreter-executed value equals the
//! native-executed value; programs with output produce identical output.

mod common;

use common::run_backend;
use perlite::ast::build::{
    array, binary, block, call, eval_block, for_loop, foreach, hash, if_stmt, int, interp, labeled, list, lit,
    my_array, my_scalar, num, part, scalar, sub_named, ternary, text, try_catch, unary, unary0,
};
use perlite::ast::{BinaryOp, BlockNode, Node, Sigil, UnaryOp};
use perlite::Backend;
use pretty_assertions::assert_eq;

fn parity(program: &BlockNode) -> (String, String) {
    let native = run_backend(program, Backend::Native, None);
    let interp = run_backend(program, Backend::Interpreter, None);
    native.result.as_ref().unwrap_or_else(|e| panic!("native: {e}"));
    interp.result.as_ref().unwrap_or_else(|e| panic!("interpreter: {e}"));
    (native.out, interp.out)
}

fn assert_parity(program: BlockNode, expected: &str) {
    let (native, interpreted) = parity(&program);
    assert_eq!(native, expected, "native output");
    assert_eq!(interpreted, expected, "interpreter output");
}

#[test]
fn test_arithmetic_and_number_formatting() {
    assert_parity(
        block(vec![
            my_scalar("a", int(10)),
            my_scalar("b", num(2.5)),
            call("say", vec![binary(BinaryOp::Add, scalar("a"), scalar("b"))]),
            call("say", vec![binary(BinaryOp::Divide, int(10), int(4))]),
            call("say", vec![binary(BinaryOp::Modulus, int(-7), int(3))]),
            call("say", vec![binary(BinaryOp::Power, int(2), int(10))]),
            call("say", vec![unary(UnaryOp::Neg, scalar("a"))]),
            call("say", vec![binary(BinaryOp::Add, text("3 apples"), int(4))]),
        ]),
        "12.5\n2.5\n2\n1024\n-10\n7\n",
    );
}

#[test]
fn test_string_operations() {
    assert_parity(
        block(vec![
            my_scalar("s", text("hello")),
            call("say", vec![binary(BinaryOp::Concat, scalar("s"), text(" world"))]),
            call("say", vec![binary(BinaryOp::Repeat, text("ab"), int(3))]),
            call("say", vec![unary(UnaryOp::Length, scalar("s"))]),
            call("say", vec![unary(UnaryOp::Uc, scalar("s"))]),
            call("say", vec![binary(BinaryOp::Substr, scalar("s"), list(vec![int(1), int(3)]))]),
            call("say", vec![binary(BinaryOp::StrIndex, scalar("s"), text("llo"))]),
            call("say", vec![binary(BinaryOp::Join, text("-"), list(vec![int(1), int(2), int(3)]))]),
        ]),
        "hello world\nababab\n5\nHELLO\nell\n2\n1-2-3\n",
    );
}

#[test]
fn test_comparisons_and_logic() {
    assert_parity(
        block(vec![
            call("say", vec![binary(BinaryOp::NumCmp, int(3), int(7))]),
            call("say", vec![binary(BinaryOp::StrCmp, text("b"), text("a"))]),
            call("say", vec![ternary(binary(BinaryOp::StrLt, text("apple"), text("banana")), int(1), int(0))]),
            call("say", vec![binary(BinaryOp::Or, text(""), text("fallback"))]),
            call("say", vec![binary(BinaryOp::DefinedOr, unary0(UnaryOp::Wantarray), text("default"))]),
            call("say", vec![unary(UnaryOp::Not, int(0))]),
        ]),
        "-1\n1\n1\nfallback\ndefault\n1\n",
    );
}

#[test]
fn test_array_operations() {
    assert_parity(
        block(vec![
            my_array("stack", list(vec![int(1), int(2), int(3)])),
            binary(BinaryOp::Push, array("stack"), list(vec![int(4), int(5)])),
            call("say", vec![unary(UnaryOp::ScalarCtx, array("stack"))]),
            call("say", vec![unary(UnaryOp::Pop, array("stack"))]),
            call("say", vec![unary(UnaryOp::Shift, array("stack"))]),
            binary(BinaryOp::Unshift, array("stack"), list(vec![int(8), int(9)])),
            call("say", vec![binary(BinaryOp::ElemArray, array("stack"), int(0))]),
            call("say", vec![binary(BinaryOp::ElemArray, array("stack"), int(-1))]),
            call("say", vec![unary(UnaryOp::Splice, list(vec![array("stack"), int(1), int(2)]))]),
            call("say", vec![binary(BinaryOp::ArraySlice, array("stack"), list(vec![int(0), int(1)]))]),
        ]),
        "5\n5\n1\n8\n4\n92\n83\n",
    );
}

#[test]
fn test_hash_operations() {
    assert_parity(
        block(vec![
            binary(
                BinaryOp::Assign,
                unary(UnaryOp::My, hash("h")),
                list(vec![text("a"), int(1), text("b"), int(2)]),
            ),
            call("say", vec![binary(BinaryOp::ElemHash, hash("h"), text("a"))]),
            binary(BinaryOp::Assign, binary(BinaryOp::ElemHash, hash("h"), text("c")), int(3)),
            call("say", vec![unary(UnaryOp::Exists, binary(BinaryOp::ElemHash, hash("h"), text("c")))]),
            call("say", vec![unary(UnaryOp::Delete, binary(BinaryOp::ElemHash, hash("h"), text("b")))]),
            call("say", vec![unary(UnaryOp::Keys, hash("h"))]),
            call("say", vec![binary(BinaryOp::HashSlice, hash("h"), list(vec![text("a"), text("c")]))]),
        ]),
        "1\n1\n2\nac\n13\n",
    );
}

#[test]
fn test_references_and_aliasing() {
    assert_parity(
        block(vec![
            my_scalar("x", int(5)),
            my_scalar("r", unary(UnaryOp::MakeRef, scalar("x"))),
            binary(
                BinaryOp::Assign,
                unary(UnaryOp::DerefScalar, scalar("r")),
                int(9),
            ),
            call("say", vec![scalar("x")]),
            call("say", vec![unary(UnaryOp::RefType, scalar("r"))]),
            my_scalar("aref", Node::ArrayLit(perlite::ast::ListNode { elems: vec![int(1), int(2)], pos: 0 })),
            binary(BinaryOp::Push, unary(UnaryOp::DerefArray, scalar("aref")), list(vec![int(3)])),
            call("say", vec![unary(UnaryOp::ScalarCtx, unary(UnaryOp::DerefArray, scalar("aref")))]),
        ]),
        "9\nSCALAR\n3\n",
    );
}

#[test]
fn test_loops_with_labels_and_induction() {
    assert_parity(
        block(vec![
            for_loop(
                Some(my_scalar("i", int(0))),
                Some(binary(BinaryOp::NumLt, scalar("i"), int(5))),
                Some(unary(UnaryOp::PostInc, scalar("i"))),
                block(vec![call("print", vec![scalar("i")])]),
            ),
            call("print", vec![text("\n")]),
            labeled(
                "OUTER",
                foreach(
                    "i",
                    binary(BinaryOp::Range, int(1), int(3)),
                    block(vec![foreach(
                        "j",
                        binary(BinaryOp::Range, int(1), int(3)),
                        block(vec![
                            if_stmt(
                                binary(BinaryOp::NumEq, scalar("j"), int(2)),
                                block(vec![unary(UnaryOp::Next, perlite::ast::build::bare("OUTER"))]),
                                None,
                            ),
                            call("print", vec![interp(vec![part(scalar("i")), part(scalar("j"))])]),
                        ]),
                    )]),
                ),
            ),
            call("print", vec![text("\n")]),
        ]),
        "01234\n112131\n",
    );
}

#[test]
fn test_eval_block_catches_die() {
    assert_parity(
        block(vec![
            eval_block(block(vec![
                unary(UnaryOp::Die, text("kaboom")),
                call("say", vec![text("unreached")]),
            ])),
            call("print", vec![interp(vec![lit("err="), part(scalar("@"))])]),
            eval_block(block(vec![int(1)])),
            call("print", vec![interp(vec![lit("clear="), part(scalar("@")), lit("|\n")])]),
        ]),
        "err=kaboom at t.pl line 1.\nclear=|\n",
    );
}

#[test]
fn test_try_catch_binds_the_error() {
    assert_parity(
        block(vec![
            try_catch(
                block(vec![binary(BinaryOp::Divide, int(1), int(0))]),
                Some(perlite::ast::build::ident(Sigil::Scalar, "e")),
                block(vec![call("print", vec![interp(vec![lit("caught: "), part(scalar("e"))])])]),
            ),
            call("say", vec![text("alive")]),
        ]),
        "caught: Illegal division by zero at t.pl line 1.\nalive\n",
    );
}

#[test]
fn test_local_restores_on_exit() {
    assert_parity(
        block(vec![
            binary(BinaryOp::Assign, scalar("main::g"), int(1)),
            sub_named("probe", block(vec![call("print", vec![scalar("main::g")])])),
            sub_named(
                "shadow",
                block(vec![
                    binary(
                        BinaryOp::Assign,
                        unary(UnaryOp::Local, scalar("main::g")),
                        int(2),
                    ),
                    call("probe", vec![]),
                ]),
            ),
            call("probe", vec![]),
            call("shadow", vec![]),
            call("probe", vec![]),
            call("print", vec![text("\n")]),
        ]),
        "121\n",
    );
}

#[test]
fn test_weak_references_do_not_keep_targets_alive() {
    assert_parity(
        block(vec![
            my_scalar("r", Node::ArrayLit(perlite::ast::ListNode { elems: vec![int(1)], pos: 0 })),
            my_scalar("w", scalar("r")),
            unary(UnaryOp::Weaken, scalar("w")),
            call("say", vec![ternary(unary(UnaryOp::Defined, scalar("w")), int(1), int(0))]),
            binary(BinaryOp::Assign, scalar("r"), int(0)),
            call("say", vec![ternary(unary(UnaryOp::Defined, scalar("w")), int(1), int(0))]),
        ]),
        "1\n0\n",
    );
}

#[test]
fn test_string_increment_family() {
    assert_parity(
        block(vec![
            my_scalar("n", int(5)),
            call("say", vec![unary(UnaryOp::PostInc, scalar("n"))]),
            call("say", vec![unary(UnaryOp::PreInc, scalar("n"))]),
            binary(BinaryOp::AddAssign, scalar("n"), int(10)),
            call("say", vec![scalar("n")]),
            binary(BinaryOp::ConcatAssign, scalar("n"), text("!")),
            call("say", vec![scalar("n")]),
        ]),
        "5\n7\n17\n17!\n",
    );
}
