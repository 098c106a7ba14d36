//! Runtime kind tests on reference values.

use optree_core::{CompileError, Kind, Node};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_type_test(c: &mut UnitCompiler, operand: &Node, expect: &Kind) -> Result<Emitted> {
    let out = c.emit_value(operand)?;
    if !out.kind.is_reference() {
        return Err(CompileError::Unsupported {
            what: format!("type test on non-reference kind '{}'", out.kind),
        });
    }
    c.em.type_test(expect)?;
    Ok(Emitted::value(Kind::Bool))
}
