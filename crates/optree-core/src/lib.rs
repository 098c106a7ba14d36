//! Core data model for the operation-tree compiler: kinds, runtime values,
//! tree nodes, and the error taxonomy.

pub mod error;
pub mod kind;
pub mod kind_hash;
pub mod node;
pub mod value;

pub use error::{CompileError, RuntimeError, VerifyError};
pub use kind::{Field, FuncKind, Kind, NumKind, OpaqueKind, RecordKind};
pub use kind_hash::KindHash;
pub use node::{
    BinaryOp, LabelDef, LabelRef, LambdaNode, LocalDef, LocalRef, MemberSel, NewNode, Node,
    ParamDef, ParamRef, UnaryOp,
};
pub use value::{ArrayData, ArrayRef, Callable, OpaqueValue, RecordData, RecordRef, Value};
