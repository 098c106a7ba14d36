//! Explicit conversion nodes: the numeric matrix, boxing, and optional
//! wrapping, in checked and unchecked forms.

use optree_core::{Kind, Node};

use crate::convert::emit_conversion;

use super::{Emitted, Result, UnitCompiler};

pub fn emit_convert_node(
    c: &mut UnitCompiler,
    operand: &Node,
    to: &Kind,
    checked: bool,
) -> Result<Emitted> {
    let out = c.emit_value(operand)?;
    let kind = emit_conversion(&mut c.em, &out.kind, to, checked)?;
    Ok(Emitted::value(kind))
}
