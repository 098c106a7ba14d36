//! Compiles typed operation trees into verified stack-machine bytecode
//! and invocable callables.
//!
//! This facade re-exports the public surface of the two member crates:
//! [`optree_core`] (kinds, values, tree nodes, errors) and
//! [`optree_compiler`] (the lowering engine).

pub use optree_compiler::{CheckFlags, Compiled, CompiledUnit, compile};
pub use optree_core as core;
pub use optree_compiler as compiler;

// Re-export main types
pub mod prelude {
    pub use optree_compiler::emit::{CmpOperand, Emitter, StackTag};
    pub use optree_compiler::options::CheckFlags;
    pub use optree_compiler::{Compiled, CompiledUnit, compile, shim_kind};
    pub use optree_core::error::{CompileError, RuntimeError, VerifyError};
    pub use optree_core::kind::{Field, FuncKind, Kind, NumKind, OpaqueKind, RecordKind};
    pub use optree_core::node::{
        BinaryOp, LabelDef, LambdaNode, LocalDef, MemberSel, NewNode, Node, ParamDef, UnaryOp,
    };
    pub use optree_core::value::{Callable, Value};
}
