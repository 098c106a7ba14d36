//! Conditional expressions.
//!
//! Both arms must produce storage-compatible kinds; a mismatch is raised
//! here, at the offending node, not deferred to a later pass.

use optree_core::{CompileError, Kind, Node};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_conditional(
    c: &mut UnitCompiler,
    cond: &Node,
    then_arm: &Node,
    else_arm: &Node,
) -> Result<Emitted> {
    let test = c.emit_value(cond)?;
    if test.kind != Kind::Bool {
        return Err(CompileError::ShapeMismatch {
            context: "conditional test",
            left: test.kind.to_string(),
            right: Kind::Bool.to_string(),
        });
    }

    let otherwise = c.em.new_label("else");
    let join = c.em.new_label("join");
    c.em.branch_if_false(otherwise)?;

    let then_out = c.emit_value(then_arm)?;
    let then_flows = !c.em.is_unreachable();
    if then_flows {
        c.em.branch(join)?;
    }

    c.em.mark(otherwise)?;
    let else_out = c.emit_value(else_arm)?;
    let else_flows = !c.em.is_unreachable();

    if then_flows && else_flows && !then_out.kind.storage_compatible(&else_out.kind) {
        return Err(CompileError::ShapeMismatch {
            context: "conditional arms",
            left: then_out.kind.to_string(),
            right: else_out.kind.to_string(),
        });
    }

    // Join only exists when at least one arm flows out.
    if then_flows || else_flows {
        c.em.mark(join)?;
    }

    let kind = if then_flows { then_out.kind } else { else_out.kind };
    Ok(Emitted::value(kind))
}
