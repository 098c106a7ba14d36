//! The operation tree: the typed input AST describing one function body.
//!
//! Trees are immutable and caller-owned. The compiler never mutates input
//! nodes; the closure resolver rewrites fresh copies. Parameters, locals,
//! and labels are identity-based: two references are the same variable when
//! they hold the same `Arc` definition, not when their names collide.

use std::sync::Arc;

use crate::kind::{Kind, RecordKind};
use crate::value::Value;

// ============================================================================
// Identity-based definitions
// ============================================================================

/// A parameter declaration. Referenced by identity.
#[derive(Debug)]
pub struct ParamDef {
    pub name: String,
    pub kind: Kind,
}

/// A block-local declaration. Referenced by identity.
#[derive(Debug)]
pub struct LocalDef {
    pub name: String,
    pub kind: Kind,
}

/// A jump-target declaration. A goto carries a value of the label's kind
/// (or nothing when the kind is `Unit`).
#[derive(Debug)]
pub struct LabelDef {
    pub name: String,
    pub kind: Kind,
}

pub type ParamRef = Arc<ParamDef>;
pub type LocalRef = Arc<LocalDef>;
pub type LabelRef = Arc<LabelDef>;

impl ParamDef {
    pub fn new(name: impl Into<String>, kind: Kind) -> ParamRef {
        Arc::new(ParamDef {
            name: name.into(),
            kind,
        })
    }
}

impl LocalDef {
    pub fn new(name: impl Into<String>, kind: Kind) -> LocalRef {
        Arc::new(LocalDef {
            name: name.into(),
            kind,
        })
    }
}

impl LabelDef {
    pub fn new(name: impl Into<String>, kind: Kind) -> LabelRef {
        Arc::new(LabelDef {
            name: name.into(),
            kind,
        })
    }
}

// ============================================================================
// Operators
// ============================================================================

/// Binary operators. `And`/`Or` short-circuit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
    And,
    Or,
}

impl BinaryOp {
    pub fn is_comparison(&self) -> bool {
        matches!(
            self,
            BinaryOp::Eq | BinaryOp::Ne | BinaryOp::Lt | BinaryOp::Le | BinaryOp::Gt | BinaryOp::Ge
        )
    }

    pub fn is_logical(&self) -> bool {
        matches!(self, BinaryOp::And | BinaryOp::Or)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnaryOp {
    /// Numeric negation.
    Neg,
    /// Boolean not.
    Not,
}

// ============================================================================
// Nodes
// ============================================================================

/// Member selector for [`Node::Member`].
#[derive(Debug, Clone)]
pub enum MemberSel {
    /// A named record field.
    Field(String),
    /// The length of an array, as `i64`.
    Length,
}

/// Construction forms for [`Node::New`].
#[derive(Debug, Clone)]
pub enum NewNode {
    /// A fresh record, zero-filled, then the listed fields assigned in order.
    Record {
        kind: Arc<RecordKind>,
        inits: Vec<(String, Node)>,
    },
    /// A fresh zero-filled array of the given element kind and length.
    Array { elem: Kind, len: Box<Node> },
}

/// A lambda: parameters, declared return kind, and a body expression.
#[derive(Debug, Clone)]
pub struct LambdaNode {
    pub name: Option<String>,
    pub params: Vec<ParamRef>,
    pub ret: Kind,
    pub body: Node,
}

impl LambdaNode {
    pub fn new(params: Vec<ParamRef>, ret: Kind, body: Node) -> Arc<Self> {
        Arc::new(LambdaNode {
            name: None,
            params,
            ret,
            body,
        })
    }

    pub fn named(
        name: impl Into<String>,
        params: Vec<ParamRef>,
        ret: Kind,
        body: Node,
    ) -> Arc<Self> {
        Arc::new(LambdaNode {
            name: Some(name.into()),
            params,
            ret,
            body,
        })
    }
}

/// An operation-tree node.
///
/// This is a closed set: the compiler dispatches with an exhaustive match,
/// and constructs outside it cannot be represented.
#[derive(Debug, Clone)]
pub enum Node {
    /// Reference to a parameter of the enclosing (or an outer) lambda.
    Param(ParamRef),
    /// Reference to a block-local variable.
    Local(LocalRef),
    /// An embedded constant.
    Const { value: Value, kind: Kind },
    /// Member access: record field or array length.
    Member {
        object: Box<Node>,
        member: MemberSel,
    },
    /// Array element access.
    Index { array: Box<Node>, index: Box<Node> },
    /// Invocation of a callable-valued sub-expression.
    Call { callee: Box<Node>, args: Vec<Node> },
    Binary {
        op: BinaryOp,
        lhs: Box<Node>,
        rhs: Box<Node>,
    },
    Unary { op: UnaryOp, operand: Box<Node> },
    /// `cond ? then_arm : else_arm`; both arms must be storage-compatible.
    Conditional {
        cond: Box<Node>,
        then_arm: Box<Node>,
        else_arm: Box<Node>,
    },
    /// A sequence with block-scoped locals; the value is the last node's.
    Block {
        locals: Vec<LocalRef>,
        body: Vec<Node>,
    },
    /// Store into a parameter, local, field, or array element; yields the
    /// stored value.
    Assign { target: Box<Node>, value: Box<Node> },
    New(NewNode),
    /// A nested lambda, compiled as an independent unit of the same group.
    Lambda(Arc<LambdaNode>),
    /// Marks a jump target at the *end* of `body`: a goto to the label
    /// skips the rest of `body` and supplies the labeled value.
    Labeled { label: LabelRef, body: Box<Node> },
    /// Jump to the end of an enclosing labeled region, carrying a value of
    /// the label's kind (or none for `Unit` labels).
    Goto {
        label: LabelRef,
        value: Option<Box<Node>>,
    },
    /// Structured exception region. The catch arm, when present, yields the
    /// same kind as the body; the finally arm runs on every exit path.
    Try {
        body: Box<Node>,
        catch: Option<Box<Node>>,
        finally: Option<Box<Node>>,
    },
    /// Runtime kind test on a reference value; null tests false.
    TypeTest { operand: Box<Node>, expect: Kind },
    /// Explicit conversion: numeric matrix entry, box/unbox, or optional
    /// wrap. `checked` selects overflow-checked numeric narrowing.
    Convert {
        operand: Box<Node>,
        to: Kind,
        checked: bool,
    },
}

impl Node {
    // ------------------------------------------------------------------
    // Construction helpers
    // ------------------------------------------------------------------

    pub fn param(def: &ParamRef) -> Node {
        Node::Param(def.clone())
    }

    pub fn local(def: &LocalRef) -> Node {
        Node::Local(def.clone())
    }

    pub fn constant(value: Value, kind: Kind) -> Node {
        Node::Const { value, kind }
    }

    pub fn i32(value: i32) -> Node {
        Node::Const {
            value: Value::I32(value),
            kind: Kind::I32,
        }
    }

    pub fn i64(value: i64) -> Node {
        Node::Const {
            value: Value::I64(value),
            kind: Kind::I64,
        }
    }

    pub fn f64(value: f64) -> Node {
        Node::Const {
            value: Value::F64(value),
            kind: Kind::F64,
        }
    }

    pub fn bool(value: bool) -> Node {
        Node::Const {
            value: Value::Bool(value),
            kind: Kind::Bool,
        }
    }

    pub fn str(text: &str) -> Node {
        Node::Const {
            value: Value::str(text),
            kind: Kind::Str,
        }
    }

    pub fn field(object: Node, name: impl Into<String>) -> Node {
        Node::Member {
            object: Box::new(object),
            member: MemberSel::Field(name.into()),
        }
    }

    pub fn length(object: Node) -> Node {
        Node::Member {
            object: Box::new(object),
            member: MemberSel::Length,
        }
    }

    pub fn index(array: Node, index: Node) -> Node {
        Node::Index {
            array: Box::new(array),
            index: Box::new(index),
        }
    }

    pub fn call(callee: Node, args: Vec<Node>) -> Node {
        Node::Call {
            callee: Box::new(callee),
            args,
        }
    }

    pub fn binary(op: BinaryOp, lhs: Node, rhs: Node) -> Node {
        Node::Binary {
            op,
            lhs: Box::new(lhs),
            rhs: Box::new(rhs),
        }
    }

    pub fn unary(op: UnaryOp, operand: Node) -> Node {
        Node::Unary {
            op,
            operand: Box::new(operand),
        }
    }

    pub fn conditional(cond: Node, then_arm: Node, else_arm: Node) -> Node {
        Node::Conditional {
            cond: Box::new(cond),
            then_arm: Box::new(then_arm),
            else_arm: Box::new(else_arm),
        }
    }

    pub fn block(locals: Vec<LocalRef>, body: Vec<Node>) -> Node {
        Node::Block { locals, body }
    }

    pub fn assign(target: Node, value: Node) -> Node {
        Node::Assign {
            target: Box::new(target),
            value: Box::new(value),
        }
    }

    pub fn new_record(kind: &Arc<RecordKind>) -> Node {
        Node::New(NewNode::Record {
            kind: kind.clone(),
            inits: Vec::new(),
        })
    }

    pub fn new_record_with(kind: &Arc<RecordKind>, inits: Vec<(String, Node)>) -> Node {
        Node::New(NewNode::Record {
            kind: kind.clone(),
            inits,
        })
    }

    pub fn new_array(elem: Kind, len: Node) -> Node {
        Node::New(NewNode::Array {
            elem,
            len: Box::new(len),
        })
    }

    pub fn lambda(lambda: &Arc<LambdaNode>) -> Node {
        Node::Lambda(lambda.clone())
    }

    pub fn labeled(label: &LabelRef, body: Node) -> Node {
        Node::Labeled {
            label: label.clone(),
            body: Box::new(body),
        }
    }

    pub fn goto(label: &LabelRef, value: Option<Node>) -> Node {
        Node::Goto {
            label: label.clone(),
            value: value.map(Box::new),
        }
    }

    pub fn type_test(operand: Node, expect: Kind) -> Node {
        Node::TypeTest {
            operand: Box::new(operand),
            expect,
        }
    }

    pub fn convert(operand: Node, to: Kind) -> Node {
        Node::Convert {
            operand: Box::new(operand),
            to,
            checked: false,
        }
    }

    pub fn convert_checked(operand: Node, to: Kind) -> Node {
        Node::Convert {
            operand: Box::new(operand),
            to,
            checked: true,
        }
    }

    /// The node-kind name used in diagnostics.
    pub fn kind_name(&self) -> &'static str {
        match self {
            Node::Param(_) => "param",
            Node::Local(_) => "local",
            Node::Const { .. } => "const",
            Node::Member { .. } => "member",
            Node::Index { .. } => "index",
            Node::Call { .. } => "call",
            Node::Binary { .. } => "binary",
            Node::Unary { .. } => "unary",
            Node::Conditional { .. } => "conditional",
            Node::Block { .. } => "block",
            Node::Assign { .. } => "assign",
            Node::New(_) => "new",
            Node::Lambda(_) => "lambda",
            Node::Labeled { .. } => "labeled",
            Node::Goto { .. } => "goto",
            Node::Try { .. } => "try",
            Node::TypeTest { .. } => "type-test",
            Node::Convert { .. } => "convert",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn param_identity_not_name() {
        let a = ParamDef::new("x", Kind::I32);
        let b = ParamDef::new("x", Kind::I32);
        assert!(Arc::ptr_eq(&a, &a.clone()));
        assert!(!Arc::ptr_eq(&a, &b));
    }

    #[test]
    fn builders_produce_expected_shapes() {
        let p = ParamDef::new("n", Kind::I64);
        let tree = Node::binary(BinaryOp::Add, Node::param(&p), Node::i64(1));
        let Node::Binary { op, lhs, .. } = &tree else {
            panic!()
        };
        assert_eq!(*op, BinaryOp::Add);
        assert!(matches!(**lhs, Node::Param(_)));
    }

    #[test]
    fn kind_names_are_stable() {
        assert_eq!(Node::i32(1).kind_name(), "const");
        assert_eq!(
            Node::field(Node::i32(1), "x").kind_name(),
            "member"
        );
    }
}
