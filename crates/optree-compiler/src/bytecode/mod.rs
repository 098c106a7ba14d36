//! Bytecode model: instruction set, code chunks, and the constant pool.

mod chunk;
mod constant;
mod opcode;

pub use chunk::{CodeChunk, Region, RegionKind};
pub use constant::{Constant, ConstantPool};
pub use opcode::{OpCode, cmp_kind};
