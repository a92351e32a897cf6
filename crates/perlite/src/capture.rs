//! Capture analysis.
//!
//! Before a subroutine body is compiled, the analyzer scans it for variable
//! references that are not declared locally: the ordered capture list the
//! artifact must bind at construction. Names declared with `our`, names with
//! an explicit package qualifier, and the conventional punctuation/special
//! globals are never captures.

use ahash::AHashSet;
use std::sync::Arc;

use crate::ast::{BlockNode, Node, Sigil, StrPart, UnaryOp};
use crate::env::forces_main;

/// One free variable found by the analyzer.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Capture {
    /// The variable's sigil.
    pub sigil: Sigil,
    /// Unqualified name.
    pub name: Arc<str>,
}

struct Analyzer {
    scopes: Vec<AHashSet<(Sigil, Arc<str>)>>,
    seen: AHashSet<(Sigil, Arc<str>)>,
    free: Vec<Capture>,
}

/// Scans a subroutine body for references to names not declared within it.
///
/// The result is ordered by first occurrence and deduplicated. The caller
/// decides which entries are true captures (declared in an enclosing lexical
/// scope) and which are package globals.
#[must_use]
pub fn free_variables(body: &BlockNode) -> Vec<Capture> {
    let mut analyzer = Analyzer {
        scopes: vec![AHashSet::new()],
        seen: AHashSet::new(),
        free: Vec::new(),
    };
    analyzer.walk_block(body);
    analyzer.free
}

impl Analyzer {
    fn declare(&mut self, sigil: Sigil, name: &Arc<str>) {
        if let Some(scope) = self.scopes.last_mut() {
            scope.insert((sigil, name.clone()));
        }
    }

    fn declared(&self, sigil: Sigil, name: &str) -> bool {
        self.scopes.iter().any(|scope| scope.contains(&(sigil, Arc::from(name))))
    }

    fn reference(&mut self, sigil: Sigil, name: &Arc<str>) {
        if sigil == Sigil::Bare || name.contains("::") || forces_main(name) {
            return;
        }
        if self.declared(sigil, name) {
            return;
        }
        let key = (sigil, name.clone());
        if self.seen.insert(key) {
            self.free.push(Capture {
                sigil,
                name: name.clone(),
            });
        }
    }

    fn walk_block(&mut self, block: &BlockNode) {
        self.scopes.push(AHashSet::new());
        for stmt in &block.stmts {
            self.walk(stmt);
        }
        self.scopes.pop();
    }

    fn walk_declaration(&mut self, node: &Node) {
        match node {
            Node::Ident(ident) => self.declare(ident.sigil, &ident.name),
            Node::List(list) => {
                for elem in &list.elems {
                    self.walk_declaration(elem);
                }
            }
            // A nested `my` inside a declaration list.
            Node::Unary(unary) if unary.op == UnaryOp::My => {
                if let Some(operand) = &unary.operand {
                    self.walk_declaration(operand);
                }
            }
            other => self.walk(other),
        }
    }

    fn walk(&mut self, node: &Node) {
        match node {
            Node::Number(_) | Node::Flag(_) => {}
            Node::Str(s) => {
                for segment in &s.parts {
                    if let StrPart::Expr(expr) = segment {
                        self.walk(expr);
                    }
                }
            }
            Node::Ident(ident) => self.reference(ident.sigil, &ident.name),
            Node::Unary(unary) => match unary.op {
                UnaryOp::My => {
                    if let Some(operand) = &unary.operand {
                        self.walk_declaration(operand);
                    }
                }
                // `our` aliases a package global; never a capture.
                UnaryOp::Our => {
                    if let Some(Node::Ident(ident)) = &unary.operand {
                        self.declare(ident.sigil, &ident.name);
                    }
                }
                _ => {
                    if let Some(operand) = &unary.operand {
                        self.walk(operand);
                    }
                }
            },
            Node::Binary(binary) => {
                self.walk(&binary.lhs);
                self.walk(&binary.rhs);
            }
            Node::Ternary(ternary) => {
                self.walk(&ternary.cond);
                self.walk(&ternary.then_expr);
                self.walk(&ternary.else_expr);
            }
            Node::Block(block) => self.walk_block(block),
            Node::List(list) | Node::ArrayLit(list) | Node::HashLit(list) => {
                for elem in &list.elems {
                    self.walk(elem);
                }
            }
            // A nested sub's free names are transitively free here unless
            // this body declares them.
            Node::Sub(sub) => self.walk_block(&sub.body),
            Node::If(if_node) => {
                self.walk(&if_node.cond);
                self.walk_block(&if_node.then_block);
                if let Some(else_branch) = &if_node.else_branch {
                    self.walk(else_branch);
                }
            }
            Node::Foreach(foreach) => {
                self.walk(&foreach.list);
                self.scopes.push(AHashSet::new());
                if let Some(var) = &foreach.var {
                    if foreach.declares_var {
                        self.declare(var.sigil, &var.name);
                    } else {
                        self.reference(var.sigil, &var.name);
                    }
                }
                self.walk_block(&foreach.body);
                self.scopes.pop();
            }
            Node::For(for_node) => {
                self.scopes.push(AHashSet::new());
                if let Some(init) = &for_node.init {
                    self.walk(init);
                }
                if let Some(cond) = &for_node.cond {
                    self.walk(cond);
                }
                self.walk_block(&for_node.body);
                if let Some(step) = &for_node.step {
                    self.walk(step);
                }
                self.scopes.pop();
            }
            Node::Try(try_node) => {
                self.walk_block(&try_node.body);
                if let Some(catch) = &try_node.catch {
                    self.scopes.push(AHashSet::new());
                    if let Some(var) = &try_node.catch_var {
                        self.declare(var.sigil, &var.name);
                    }
                    self.walk_block(catch);
                    self.scopes.pop();
                }
                if let Some(finally) = &try_node.finally {
                    self.walk_block(finally);
                }
            }
            Node::Label(label) => self.walk(&label.stmt),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ast::BinaryOp;
    use crate::ast::build::{
        array, binary, block, call, foreach, int, my_scalar, scalar, sub_anon, unary,
    };

    #[test]
    fn test_declared_names_are_not_free() {
        let body = block(vec![
            my_scalar("x", int(1)),
            binary(BinaryOp::Add, scalar("x"), scalar("y")),
        ]);
        let free = free_variables(&body);
        assert_eq!(free.len(), 1);
        assert_eq!(&*free[0].name, "y");
    }

    #[test]
    fn test_order_is_first_occurrence() {
        let body = block(vec![
            binary(BinaryOp::Add, scalar("b"), scalar("a")),
            binary(BinaryOp::Add, scalar("a"), scalar("c")),
        ]);
        let names: Vec<_> = free_variables(&body).into_iter().map(|c| c.name).collect();
        assert_eq!(names.iter().map(|n| &**n).collect::<Vec<_>>(), vec!["b", "a", "c"]);
    }

    #[test]
    fn test_nested_sub_references_are_transitively_free() {
        let body = block(vec![sub_anon(block(vec![binary(
            BinaryOp::Multiply,
            scalar("w"),
            int(2),
        )]))]);
        let free = free_variables(&body);
        assert_eq!(free.len(), 1);
        assert_eq!(&*free[0].name, "w");
    }

    #[test]
    fn test_specials_and_qualified_names_excluded() {
        let body = block(vec![
            call("print", vec![scalar("_")]),
            scalar("main::g"),
            array("ARGV"),
            scalar("q"),
        ]);
        let free = free_variables(&body);
        assert_eq!(free.len(), 1);
        assert_eq!(&*free[0].name, "q");
    }

    #[test]
    fn test_foreach_var_scoped_to_body() {
        let body = block(vec![foreach(
            "i",
            binary(BinaryOp::Range, int(1), int(3)),
            block(vec![unary(crate::ast::UnaryOp::Return, scalar("i"))]),
        )]);
        assert!(free_variables(&body).is_empty());
    }
}
