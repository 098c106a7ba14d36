//! Invocation of callable-valued sub-expressions.
//!
//! The callee is part of the enclosing chain: a null callee escapes like a
//! null member target. Arguments are widened to the declared parameter
//! kinds where lossless.

use optree_core::{CompileError, Kind, Node};

use crate::emit::Label;

use super::{Emitted, Result, ResultShape, UnitCompiler};

pub fn emit_call(
    c: &mut UnitCompiler,
    callee: &Node,
    args: &[Node],
    escape: Option<Label>,
) -> Result<Emitted> {
    let callee_out = c.emit(callee, escape, ResultShape::Value, false)?;
    let mut used = callee_out.used_escape;

    let Kind::Func(func) = &callee_out.kind else {
        return Err(CompileError::Unsupported {
            what: format!("call on non-callable kind '{}'", callee_out.kind),
        });
    };
    let func = func.clone();

    if func.params.len() != args.len() {
        return Err(CompileError::ArityMismatch {
            expected: func.params.len(),
            got: args.len(),
        });
    }

    if let Some(esc) = escape
        && c.ctx.options.null_checks()
    {
        c.em.escape_null(esc)?;
        used = true;
    }

    for (arg, param) in args.iter().zip(&func.params) {
        let out = c.emit_value(arg)?;
        if !c.reconcile(&out.kind, param)? {
            return Err(CompileError::ShapeMismatch {
                context: "call argument",
                left: out.kind.to_string(),
                right: param.to_string(),
            });
        }
    }

    let ret = c.em.call_func(&func)?;
    Ok(Emitted {
        kind: ret,
        used_escape: used,
        place: None,
    })
}
