//! Lowering engine for operation trees.
//!
//! Turns a typed, tree-shaped description of a pure function body into
//! flat, verified stack-machine bytecode units and returns an invocable
//! callable, bypassing any interpretation of the tree itself.
//!
//! The pipeline of one [`compile`] call:
//!
//! 1. [`closure`] hoists captured constants and parameters into a
//!    generated shared state record and rewrites fresh copies of the tree.
//! 2. [`node`] emitters lower every node kind through the verifying
//!    [`emit::Emitter`], which simulates the operand stack, rejects
//!    malformed sequences, and records a stack-annotated trace.
//! 3. [`link`] compiles each lambda as an independent unit, then wires the
//!    group together: the unit table is published and the sibling
//!    callable-handle array is written into the state record.
//!
//! # Example
//!
//! ```
//! use optree_core::{Kind, Node, ParamDef, Value, LambdaNode, BinaryOp};
//! use optree_compiler::{compile, CheckFlags};
//!
//! let n = ParamDef::new("n", Kind::I64);
//! let tree = LambdaNode::new(
//!     vec![n.clone()],
//!     Kind::I64,
//!     Node::binary(BinaryOp::Add, Node::param(&n), Node::i64(1)),
//! );
//! let callable = compile(&tree, CheckFlags::all()).unwrap();
//! assert_eq!(callable.invoke(&[Value::I64(41)]).unwrap(), Value::I64(42));
//! ```

pub mod bytecode;
pub mod closure;
pub mod context;
pub mod convert;
pub mod emit;
pub mod exec;
pub mod link;
pub mod node;
pub mod options;

pub use link::{Compiled, CompiledUnit, UnitGroup, compile, shim_kind};
pub use options::CheckFlags;
