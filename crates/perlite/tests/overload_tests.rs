//! Operator overloading observed identically from both execution modes.

mod common;

use std::sync::Arc;

use common::{MODE_MATRIX, run_backend, run_in_env};
use perlite::ast::build::{binary, block, call, interp, int, lit, my_scalar, part, scalar, text};
use perlite::ast::{BinaryOp, ListNode, Node};
use perlite::{
    ArrayRef, Backend, Config, Context, Environment, Flow, Interp, PerlResult, Scalar, Sub,
};
use pretty_assertions::assert_eq;

fn hash_lit() -> Node {
    Node::HashLit(ListNode { elems: vec![], pos: 0 })
}

fn host(name: &str, f: perlite::HostFn) -> perlite::CodeRef {
    Arc::new(Sub::host(name, "main", f))
}

fn stringify_hello(_interp: &mut Interp, _args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    Ok(Flow::scalar(Scalar::from_str_slice("hello")))
}

fn numify_first_arg_len(_interp: &mut Interp, args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
    // `0+` handler: numify to the number of keys in the referenced hash.
    let count = match args.get(0) {
        Scalar::Ref(perlite::Ref::Hash(hash)) => hash.len() as i64,
        _ => 0,
    };
    Ok(Flow::scalar(Scalar::Int(count)))
}

/// Scenario: a class overloading `("")` stringifies through interpolation.
#[test]
fn test_overloaded_stringification_through_interpolation() {
    let program = block(vec![
        my_scalar("ref", binary(BinaryOp::Bless, hash_lit(), text("Greeting"))),
        call("print", vec![interp(vec![lit("value: "), part(scalar("ref"))])]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let env = Environment::new();
        let class = env.class_id("Greeting");
        env.classes().register_overload(class, "\"\"", host("stringify", stringify_hello));
        let run = run_in_env(&env, &program, backend, sub_backend, Config::default());
        run.result
            .as_ref()
            .unwrap_or_else(|e| panic!("{backend:?}/{sub_backend:?}: {e}"));
        assert_eq!(run.out, "value: hello", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_direct_binary_overload_beats_conversion() {
    fn add_always_100(_interp: &mut Interp, _args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
        Ok(Flow::scalar(Scalar::Int(100)))
    }
    let program = block(vec![
        my_scalar("obj", binary(BinaryOp::Bless, hash_lit(), text("Adder"))),
        call("say", vec![binary(BinaryOp::Add, scalar("obj"), int(5))]),
        call("say", vec![binary(BinaryOp::Add, int(5), scalar("obj"))]),
    ]);
    for backend in [Backend::Interpreter, Backend::Native] {
        let env = Environment::new();
        let class = env.class_id("Adder");
        env.classes().register_overload(class, "+", host("add", add_always_100));
        env.classes().register_overload(class, "0+", host("numify", numify_first_arg_len));
        let run = run_in_env(&env, &program, backend, None, Config::default());
        assert!(run.result.is_ok(), "{backend:?}");
        // Both operand orders dispatch to the direct `+` handler.
        assert_eq!(run.out, "100\n100\n", "backend {backend:?}");
    }
}

#[test]
fn test_conversion_fallback_when_no_direct_overload() {
    let program = block(vec![
        my_scalar("obj", binary(BinaryOp::Bless, hash_lit(), text("Sized"))),
        call("say", vec![binary(BinaryOp::Add, scalar("obj"), int(5))]),
    ]);
    for backend in [Backend::Interpreter, Backend::Native] {
        let env = Environment::new();
        let class = env.class_id("Sized");
        env.classes().register_overload(class, "0+", host("numify", numify_first_arg_len));
        let run = run_in_env(&env, &program, backend, None, Config::default());
        assert!(run.result.is_ok(), "{backend:?}");
        // Empty hash numifies to 0 through the `0+` fallback.
        assert_eq!(run.out, "5\n", "backend {backend:?}");
    }
}

#[test]
fn test_overload_found_through_isa_chain() {
    let program = block(vec![
        my_scalar("obj", binary(BinaryOp::Bless, hash_lit(), text("Child"))),
        call("print", vec![interp(vec![part(scalar("obj"))])]),
    ]);
    for backend in [Backend::Interpreter, Backend::Native] {
        let env = Environment::new();
        let base = env.class_id("Base");
        let child = env.class_id("Child");
        env.classes().register_overload(base, "\"\"", host("stringify", stringify_hello));
        env.classes().set_isa(child, vec![base]);
        let run = run_in_env(&env, &program, backend, None, Config::default());
        assert!(run.result.is_ok(), "{backend:?}");
        assert_eq!(run.out, "hello", "backend {backend:?}");
    }
}

#[test]
fn test_method_resolution_walks_the_mro() {
    fn speak(_interp: &mut Interp, _args: &ArrayRef, _cx: Context) -> PerlResult<Flow> {
        Ok(Flow::scalar(Scalar::from_str_slice("woof")))
    }
    let program = block(vec![
        my_scalar("obj", binary(BinaryOp::Bless, hash_lit(), text("Dog"))),
        call("say", vec![perlite::ast::build::method(scalar("obj"), "speak", vec![])]),
    ]);
    for (backend, sub_backend) in MODE_MATRIX {
        let env = Environment::new();
        let animal = env.class_id("Animal");
        let dog = env.class_id("Dog");
        env.classes().set_isa(dog, vec![animal]);
        env.set_code("Animal::speak", host("speak", speak));
        let run = run_in_env(&env, &program, backend, sub_backend, Config::default());
        assert!(run.result.is_ok(), "pairing {backend:?}/{sub_backend:?}");
        assert_eq!(run.out, "woof\n", "pairing {backend:?}/{sub_backend:?}");
    }
}

#[test]
fn test_missing_method_is_a_catchable_error() {
    let program = block(vec![
        my_scalar("obj", binary(BinaryOp::Bless, hash_lit(), text("Silent"))),
        perlite::ast::build::method(scalar("obj"), "speak", vec![]),
    ]);
    let run = run_backend(&program, Backend::Interpreter, None);
    let err = run.result.unwrap_err();
    assert!(
        err.message().contains("Can't locate object method \"speak\""),
        "{}",
        err.message()
    );
}
