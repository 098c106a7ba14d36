//! Labeled regions and gotos.
//!
//! A labeled node marks a jump target at the end of its body; a goto
//! branches there carrying a value of the label's kind. The verifier's
//! label-shape rule does the rest: a goto from a position whose stack
//! disagrees with the label's fixed shape fails verification.

use optree_core::{CompileError, Kind, LabelRef, Node};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_labeled(c: &mut UnitCompiler, label: &LabelRef, body: &Node) -> Result<Emitted> {
    let target = c.em.new_label("label");
    c.bindings.bind_label(label, target);
    let out = c.emit_value(body)?;
    c.bindings.unbind_label(label);

    if !c.em.is_unreachable() && !c.reconcile(&out.kind, &label.kind)? {
        return Err(CompileError::ShapeMismatch {
            context: "labeled body",
            left: out.kind.to_string(),
            right: label.kind.to_string(),
        });
    }
    c.em.mark(target)?;
    Ok(Emitted::value(label.kind.clone()))
}

pub fn emit_goto(c: &mut UnitCompiler, label: &LabelRef, value: Option<&Node>) -> Result<Emitted> {
    let target = c
        .bindings
        .label_target(label)
        .ok_or_else(|| CompileError::UnboundLabel {
            name: label.name.clone(),
        })?;

    match value {
        Some(node) => {
            let out = c.emit_value(node)?;
            if !c.reconcile(&out.kind, &label.kind)? {
                return Err(CompileError::ShapeMismatch {
                    context: "goto value",
                    left: out.kind.to_string(),
                    right: label.kind.to_string(),
                });
            }
        }
        None => {
            if label.kind != Kind::Unit {
                return Err(CompileError::ShapeMismatch {
                    context: "goto value",
                    left: Kind::Unit.to_string(),
                    right: label.kind.to_string(),
                });
            }
            c.em.push_unit()?;
        }
    }
    c.em.branch(target)?;
    Ok(Emitted::value(label.kind.clone()))
}
