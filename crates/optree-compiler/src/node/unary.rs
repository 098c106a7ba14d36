//! Unary operators.

use optree_core::{CompileError, Kind, Node, UnaryOp};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_unary(c: &mut UnitCompiler, op: UnaryOp, operand: &Node) -> Result<Emitted> {
    let out = c.emit_value(operand)?;
    match op {
        UnaryOp::Neg => {
            let nk = out.kind.numeric().ok_or_else(|| CompileError::ShapeMismatch {
                context: "negation operand",
                left: out.kind.to_string(),
                right: "a numeric kind".to_string(),
            })?;
            c.em.neg(nk)?;
            Ok(Emitted::value(out.kind))
        }
        UnaryOp::Not => {
            if out.kind != Kind::Bool {
                return Err(CompileError::ShapeMismatch {
                    context: "not operand",
                    left: out.kind.to_string(),
                    right: Kind::Bool.to_string(),
                });
            }
            c.em.not()?;
            Ok(Emitted::value(Kind::Bool))
        }
    }
}
