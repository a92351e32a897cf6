//! The abstract syntax tree consumed by both compilers.
//!
//! The lexer and parser live in the front end; this module defines the tree
//! they hand over. Every node carries a source-position index (`Pos`) that
//! the compilation context resolves to a line number for diagnostics.
//!
//! The `build` submodule offers terse constructors for front ends and tests
//! that assemble trees programmatically.

use std::sync::Arc;

/// A source-position index: an opaque token index assigned by the front
/// end, resolved to a line through [`CompileCtx`].
pub type Pos = u32;

/// Compilation context: origin metadata for one compilation unit.
#[derive(Debug, Clone)]
pub struct CompileCtx {
    /// Source file name for diagnostics.
    pub file: Arc<str>,
    /// Line number for each position index. Positions beyond the table fall
    /// back to the 1-based position itself, which keeps programmatically
    /// built trees deterministic without a real token stream.
    pub lines: Arc<[u32]>,
    /// Default package for unqualified global names.
    pub package: Arc<str>,
}

impl CompileCtx {
    /// Creates a context with no line table and the `main` package.
    #[must_use]
    pub fn new(file: &str) -> Self {
        Self {
            file: Arc::from(file),
            lines: Arc::from([]),
            package: Arc::from("main"),
        }
    }

    /// Resolves a position index to a line number.
    #[must_use]
    pub fn line(&self, pos: Pos) -> u32 {
        self.lines.get(pos as usize).copied().unwrap_or(pos + 1)
    }
}

/// Variable sigils.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Sigil {
    /// `$name`
    Scalar,
    /// `@name`
    Array,
    /// `%name`
    Hash,
    /// `&name`
    Code,
    /// A bareword (function name, package name, label).
    Bare,
}

/// An AST node.
#[derive(Debug, Clone)]
pub enum Node {
    /// Numeric literal.
    Number(NumberNode),
    /// String literal, possibly with interpolated expressions.
    Str(StrNode),
    /// A variable or bareword.
    Ident(IdentNode),
    /// Unary operator application.
    Unary(Box<UnaryNode>),
    /// Binary operator application.
    Binary(Box<BinaryNode>),
    /// Ternary conditional.
    Ternary(Box<TernaryNode>),
    /// A brace block: ordered statements introducing a scope.
    Block(BlockNode),
    /// A parenthesized list.
    List(ListNode),
    /// Anonymous array constructor `[ ... ]`; evaluates to a reference.
    ArrayLit(ListNode),
    /// Anonymous hash constructor `{ ... }`; evaluates to a reference.
    HashLit(ListNode),
    /// Subroutine literal (named definition or anonymous).
    Sub(Box<SubNode>),
    /// `if`/`elsif`/`else` chain.
    If(Box<IfNode>),
    /// `foreach` over a list.
    Foreach(Box<ForeachNode>),
    /// C-style `for (init; cond; step)`.
    For(Box<ForNode>),
    /// `eval BLOCK` / try-catch-finally.
    Try(Box<TryNode>),
    /// A labeled statement.
    Label(Box<LabelNode>),
    /// A compiler flag (`use strict` and friends). No runtime effect here.
    Flag(FlagNode),
}

impl Node {
    /// The node's source position.
    #[must_use]
    pub fn pos(&self) -> Pos {
        match self {
            Self::Number(n) => n.pos,
            Self::Str(n) => n.pos,
            Self::Ident(n) => n.pos,
            Self::Unary(n) => n.pos,
            Self::Binary(n) => n.pos,
            Self::Ternary(n) => n.pos,
            Self::Block(n) => n.pos,
            Self::List(n) | Self::ArrayLit(n) | Self::HashLit(n) => n.pos,
            Self::Sub(n) => n.pos,
            Self::If(n) => n.pos,
            Self::Foreach(n) => n.pos,
            Self::For(n) => n.pos,
            Self::Try(n) => n.pos,
            Self::Label(n) => n.pos,
            Self::Flag(n) => n.pos,
        }
    }
}

/// A numeric literal value.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum NumLit {
    /// Integer literal.
    Int(i64),
    /// Floating-point literal.
    Num(f64),
}

/// Numeric literal node.
#[derive(Debug, Clone)]
pub struct NumberNode {
    /// Literal value.
    pub value: NumLit,
    /// Source position.
    pub pos: Pos,
}

/// One segment of a (possibly interpolated) string literal.
#[derive(Debug, Clone)]
pub enum StrPart {
    /// Literal text.
    Lit(Arc<str>),
    /// An interpolated expression, stringified at runtime.
    Expr(Node),
}

/// String literal node. A plain string is a single `Lit` part.
#[derive(Debug, Clone)]
pub struct StrNode {
    /// Ordered parts.
    pub parts: Vec<StrPart>,
    /// Source position.
    pub pos: Pos,
}

/// Variable or bareword node.
#[derive(Debug, Clone)]
pub struct IdentNode {
    /// Leading sigil, or `Bare`.
    pub sigil: Sigil,
    /// Name, possibly package-qualified with `::`.
    pub name: Arc<str>,
    /// Source position.
    pub pos: Pos,
}

/// Unary operators.
///
/// Named unary operators (`defined`, `length`, the math functions, the
/// declaration and control keywords) are operator nodes, mirroring how the
/// front end tokenizes them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UnaryOp {
    /// Numeric negation `-`.
    Neg,
    /// Boolean negation `!`.
    Not,
    /// `defined EXPR`
    Defined,
    /// `length EXPR`
    Length,
    /// `abs`
    Abs,
    /// `int`
    Int,
    /// `sqrt`
    Sqrt,
    /// `log`
    Log,
    /// `exp`
    Exp,
    /// `chr`
    Chr,
    /// `ord`
    Ord,
    /// `uc`
    Uc,
    /// `lc`
    Lc,
    /// `\EXPR` — take a reference.
    MakeRef,
    /// `$$expr` — dereference to a scalar slot.
    DerefScalar,
    /// `@$expr` — dereference to an array.
    DerefArray,
    /// `%$expr` — dereference to a hash.
    DerefHash,
    /// `&$expr` — dereference to code.
    DerefCode,
    /// `ref EXPR`
    RefType,
    /// `my` declaration.
    My,
    /// `our` declaration.
    Our,
    /// `local` dynamic save of a package global.
    Local,
    /// `return EXPR` (operand absent for bare `return`).
    Return,
    /// `wantarray`
    Wantarray,
    /// `last [LABEL]` — operand is a bareword label when present.
    Last,
    /// `next [LABEL]`
    Next,
    /// `redo [LABEL]`
    Redo,
    /// `goto &NAME, args` — operand is a list: callee, then optional args.
    Goto,
    /// `eval EXPR` — dynamic string evaluation.
    EvalStr,
    /// `die EXPR`
    Die,
    /// `warn EXPR`
    Warn,
    /// `pop [@array]` (operand absent means `@_`).
    Pop,
    /// `shift [@array]` (operand absent means `@_`).
    Shift,
    /// `keys %hash`
    Keys,
    /// `values %hash`
    Values,
    /// `scalar EXPR` — force scalar context.
    ScalarCtx,
    /// `delete $hash{key}` — operand is a hash-element expression.
    Delete,
    /// `exists $hash{key}` — operand is a hash-element expression.
    Exists,
    /// `splice @array, offset [, length [, list]]` — operand is the
    /// argument list.
    Splice,
    /// `weaken EXPR` — demote a reference to a weak handle in place.
    Weaken,
    /// `++$x`
    PreInc,
    /// `--$x`
    PreDec,
    /// `$x++`
    PostInc,
    /// `$x--`
    PostDec,
}

/// Unary operator node.
#[derive(Debug, Clone)]
pub struct UnaryNode {
    /// Operator.
    pub op: UnaryOp,
    /// Operand; absent for operators with a default (`return`, `shift`).
    pub operand: Option<Node>,
    /// Source position.
    pub pos: Pos,
}

/// Binary operators.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BinaryOp {
    /// `+`
    Add,
    /// `-`
    Subtract,
    /// `*`
    Multiply,
    /// `/`
    Divide,
    /// `%`
    Modulus,
    /// `**`
    Power,
    /// `.`
    Concat,
    /// `x`
    Repeat,
    /// `..` — list of consecutive integers.
    Range,
    /// `==`
    NumEq,
    /// `!=`
    NumNe,
    /// `<`
    NumLt,
    /// `<=`
    NumLe,
    /// `>`
    NumGt,
    /// `>=`
    NumGe,
    /// `eq`
    StrEq,
    /// `ne`
    StrNe,
    /// `lt`
    StrLt,
    /// `le`
    StrLe,
    /// `gt`
    StrGt,
    /// `ge`
    StrGe,
    /// `<=>`
    NumCmp,
    /// `cmp`
    StrCmp,
    /// `&&`
    And,
    /// `||`
    Or,
    /// `//`
    DefinedOr,
    /// `=`
    Assign,
    /// `+=`
    AddAssign,
    /// `-=`
    SubtractAssign,
    /// `*=`
    MultiplyAssign,
    /// `/=`
    DivideAssign,
    /// `.=`
    ConcatAssign,
    /// Function call: lhs is the callee, rhs is the argument list.
    Call,
    /// Method call `lhs->name(rhs)`.
    MethodCall(Arc<str>),
    /// Array element `lhs[rhs]`.
    ElemArray,
    /// Hash element `lhs{rhs}`.
    ElemHash,
    /// `push lhs, rhs-list`
    Push,
    /// `unshift lhs, rhs-list`
    Unshift,
    /// `join lhs, rhs-list`
    Join,
    /// `index lhs, rhs`
    StrIndex,
    /// `bless lhs-ref, rhs-classname`
    Bless,
    /// `substr lhs, rhs-list(offset [, length])`
    Substr,
    /// Array slice `@lhs[rhs-list]`.
    ArraySlice,
    /// Hash slice `@lhs{rhs-list}`.
    HashSlice,
}

/// Binary operator node.
#[derive(Debug, Clone)]
pub struct BinaryNode {
    /// Operator.
    pub op: BinaryOp,
    /// Left operand.
    pub lhs: Node,
    /// Right operand.
    pub rhs: Node,
    /// Source position.
    pub pos: Pos,
}

/// Ternary conditional node.
#[derive(Debug, Clone)]
pub struct TernaryNode {
    /// Condition, evaluated in scalar context.
    pub cond: Node,
    /// Value when true.
    pub then_expr: Node,
    /// Value when false.
    pub else_expr: Node,
    /// Source position.
    pub pos: Pos,
}

/// Block node: ordered statements with a lexical scope.
#[derive(Debug, Clone)]
pub struct BlockNode {
    /// Statements in order.
    pub stmts: Vec<Node>,
    /// Source position.
    pub pos: Pos,
}

/// List node: ordered expressions.
#[derive(Debug, Clone)]
pub struct ListNode {
    /// Element expressions.
    pub elems: Vec<Node>,
    /// Source position.
    pub pos: Pos,
}

/// Subroutine literal.
#[derive(Debug, Clone)]
pub struct SubNode {
    /// Name for named definitions (`sub foo {...}`); `None` for `sub {...}`.
    pub name: Option<Arc<str>>,
    /// Body block.
    pub body: BlockNode,
    /// Source position.
    pub pos: Pos,
}

/// `if` node.
#[derive(Debug, Clone)]
pub struct IfNode {
    /// Condition, evaluated in scalar context.
    pub cond: Node,
    /// Then branch.
    pub then_block: BlockNode,
    /// `elsif`/`else` continuation: a nested `If` or a `Block`.
    pub else_branch: Option<Node>,
    /// Source position.
    pub pos: Pos,
}

/// `foreach` node.
#[derive(Debug, Clone)]
pub struct ForeachNode {
    /// Loop variable; absent means `$_`. The variable aliases each element.
    pub var: Option<IdentNode>,
    /// Whether the loop variable is a fresh `my` lexical.
    pub declares_var: bool,
    /// The list expression iterated over.
    pub list: Node,
    /// Loop body.
    pub body: BlockNode,
    /// Source position.
    pub pos: Pos,
}

/// C-style `for` node. With no init/step this is a `while` loop.
#[derive(Debug, Clone)]
pub struct ForNode {
    /// Initialization statement.
    pub init: Option<Node>,
    /// Condition, evaluated in scalar context; absent means forever.
    pub cond: Option<Node>,
    /// Step statement.
    pub step: Option<Node>,
    /// Loop body.
    pub body: BlockNode,
    /// Source position.
    pub pos: Pos,
}

/// `eval BLOCK` / try node.
///
/// With no catch block this is a plain `eval {}`: errors are caught, `$@`
/// is set, and the result is the empty list.
#[derive(Debug, Clone)]
pub struct TryNode {
    /// Protected body.
    pub body: BlockNode,
    /// Catch variable (bound to the error value), if any.
    pub catch_var: Option<IdentNode>,
    /// Catch block, if any.
    pub catch: Option<BlockNode>,
    /// Finally block, if any.
    pub finally: Option<BlockNode>,
    /// Source position.
    pub pos: Pos,
}

/// A labeled statement (loop labels).
#[derive(Debug, Clone)]
pub struct LabelNode {
    /// Label name.
    pub name: Arc<str>,
    /// The labeled statement.
    pub stmt: Node,
    /// Source position.
    pub pos: Pos,
}

/// Compiler flags carried through from the front end.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompilerFlag {
    /// `use strict`
    Strict,
    /// `use warnings`
    Warnings,
    /// `no warnings`
    NoWarnings,
}

/// Compiler-flag node.
#[derive(Debug, Clone)]
pub struct FlagNode {
    /// The flag.
    pub flag: CompilerFlag,
    /// Source position.
    pub pos: Pos,
}

/// Terse constructors for building trees programmatically.
pub mod build {
    use super::{
        BinaryNode, BinaryOp, BlockNode, ForNode, ForeachNode, IdentNode, IfNode, ListNode, Node, NumLit, NumberNode,
        Sigil, StrNode, StrPart, SubNode, TernaryNode, TryNode, UnaryNode, UnaryOp,
    };
    use std::sync::Arc;

    /// Integer literal.
    #[must_use]
    pub fn int(value: i64) -> Node {
        Node::Number(NumberNode {
            value: NumLit::Int(value),
            pos: 0,
        })
    }

    /// Float literal.
    #[must_use]
    pub fn num(value: f64) -> Node {
        Node::Number(NumberNode {
            value: NumLit::Num(value),
            pos: 0,
        })
    }

    /// Plain string literal.
    #[must_use]
    pub fn text(value: &str) -> Node {
        Node::Str(StrNode {
            parts: vec![StrPart::Lit(Arc::from(value))],
            pos: 0,
        })
    }

    /// Interpolated string from parts.
    #[must_use]
    pub fn interp(parts: Vec<StrPart>) -> Node {
        Node::Str(StrNode { parts, pos: 0 })
    }

    /// Literal string part.
    #[must_use]
    pub fn lit(value: &str) -> StrPart {
        StrPart::Lit(Arc::from(value))
    }

    /// Expression string part.
    #[must_use]
    pub fn part(node: Node) -> StrPart {
        StrPart::Expr(node)
    }

    /// `$name`
    #[must_use]
    pub fn scalar(name: &str) -> Node {
        Node::Ident(ident(Sigil::Scalar, name))
    }

    /// `@name`
    #[must_use]
    pub fn array(name: &str) -> Node {
        Node::Ident(ident(Sigil::Array, name))
    }

    /// `%name`
    #[must_use]
    pub fn hash(name: &str) -> Node {
        Node::Ident(ident(Sigil::Hash, name))
    }

    /// `&name`
    #[must_use]
    pub fn code(name: &str) -> Node {
        Node::Ident(ident(Sigil::Code, name))
    }

    /// Bareword.
    #[must_use]
    pub fn bare(name: &str) -> Node {
        Node::Ident(ident(Sigil::Bare, name))
    }

    /// Raw ident node.
    #[must_use]
    pub fn ident(sigil: Sigil, name: &str) -> IdentNode {
        IdentNode {
            sigil,
            name: Arc::from(name),
            pos: 0,
        }
    }

    /// Unary application.
    #[must_use]
    pub fn unary(op: UnaryOp, operand: Node) -> Node {
        Node::Unary(Box::new(UnaryNode {
            op,
            operand: Some(operand),
            pos: 0,
        }))
    }

    /// Unary operator with no operand.
    #[must_use]
    pub fn unary0(op: UnaryOp) -> Node {
        Node::Unary(Box::new(UnaryNode { op, operand: None, pos: 0 }))
    }

    /// Binary application.
    #[must_use]
    pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
        Node::Binary(Box::new(BinaryNode { op, lhs, rhs, pos: 0 }))
    }

    /// Ternary conditional.
    #[must_use]
    pub fn ternary(cond: Node, then_expr: Node, else_expr: Node) -> Node {
        Node::Ternary(Box::new(TernaryNode {
            cond,
            then_expr,
            else_expr,
            pos: 0,
        }))
    }

    /// Statement block.
    #[must_use]
    pub fn block(stmts: Vec<Node>) -> BlockNode {
        BlockNode { stmts, pos: 0 }
    }

    /// Parenthesized list.
    #[must_use]
    pub fn list(elems: Vec<Node>) -> Node {
        Node::List(ListNode { elems, pos: 0 })
    }

    /// `my $name = value`
    #[must_use]
    pub fn my_scalar(name: &str, value: Node) -> Node {
        binary(BinaryOp::Assign, unary(UnaryOp::My, scalar(name)), value)
    }

    /// `my @name = value`
    #[must_use]
    pub fn my_array(name: &str, value: Node) -> Node {
        binary(BinaryOp::Assign, unary(UnaryOp::My, array(name)), value)
    }

    /// Call a named function: `name(args...)`.
    #[must_use]
    pub fn call(name: &str, args: Vec<Node>) -> Node {
        binary(BinaryOp::Call, bare(name), list(args))
    }

    /// Call through an expression: `callee->(args...)`.
    #[must_use]
    pub fn call_expr(callee: Node, args: Vec<Node>) -> Node {
        binary(BinaryOp::Call, callee, list(args))
    }

    /// Method call: `invocant->name(args...)`.
    #[must_use]
    pub fn method(invocant: Node, name: &str, args: Vec<Node>) -> Node {
        binary(BinaryOp::MethodCall(Arc::from(name)), invocant, list(args))
    }

    /// Named subroutine definition.
    #[must_use]
    pub fn sub_named(name: &str, body: BlockNode) -> Node {
        Node::Sub(Box::new(SubNode {
            name: Some(Arc::from(name)),
            body,
            pos: 0,
        }))
    }

    /// Anonymous subroutine.
    #[must_use]
    pub fn sub_anon(body: BlockNode) -> Node {
        Node::Sub(Box::new(SubNode {
            name: None,
            body,
            pos: 0,
        }))
    }

    /// `if` statement.
    #[must_use]
    pub fn if_stmt(cond: Node, then_block: BlockNode, else_branch: Option<Node>) -> Node {
        Node::If(Box::new(IfNode {
            cond,
            then_block,
            else_branch,
            pos: 0,
        }))
    }

    /// `foreach my $var (list) { body }`
    #[must_use]
    pub fn foreach(var: &str, list: Node, body: BlockNode) -> Node {
        Node::Foreach(Box::new(ForeachNode {
            var: Some(ident(Sigil::Scalar, var)),
            declares_var: true,
            list,
            body,
            pos: 0,
        }))
    }

    /// C-style `for` loop.
    #[must_use]
    pub fn for_loop(init: Option<Node>, cond: Option<Node>, step: Option<Node>, body: BlockNode) -> Node {
        Node::For(Box::new(ForNode {
            init,
            cond,
            step,
            body,
            pos: 0,
        }))
    }

    /// `eval { body }`
    #[must_use]
    pub fn eval_block(body: BlockNode) -> Node {
        Node::Try(Box::new(TryNode {
            body,
            catch_var: None,
            catch: None,
            finally: None,
            pos: 0,
        }))
    }

    /// Labeled statement.
    #[must_use]
    pub fn labeled(name: &str, stmt: Node) -> Node {
        Node::Label(Box::new(super::LabelNode {
            name: Arc::from(name),
            stmt,
            pos: 0,
        }))
    }

    /// `return EXPR`
    #[must_use]
    pub fn ret(value: Node) -> Node {
        unary(UnaryOp::Return, value)
    }

    /// Keep `TryNode` importable through the builder for custom shapes.
    #[must_use]
    pub fn try_catch(body: BlockNode, catch_var: Option<IdentNode>, catch: BlockNode) -> Node {
        Node::Try(Box::new(TryNode {
            body,
            catch_var,
            catch: Some(catch),
            finally: None,
            pos: 0,
        }))
    }
}
