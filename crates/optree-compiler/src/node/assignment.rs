//! Assignment emission.
//!
//! Slot targets store directly. Member and element targets emit their
//! owner chain in address shape with the extend flag set, so missing
//! intermediates are created on the way ("create the path if missing").
//! The assignment's own value is the stored value; when the target chain
//! escapes on a null intermediate that could not be created, the store is
//! skipped and the target kind's zero value is substituted.

use optree_core::{CompileError, Node};

use super::{Emitted, Place, Result, ResultShape, UnitCompiler};

pub fn emit_assign(c: &mut UnitCompiler, target: &Node, value: &Node) -> Result<Emitted> {
    match target {
        Node::Param(param) => {
            let slot =
                c.bindings
                    .param_slot(param)
                    .ok_or_else(|| CompileError::UnboundParam {
                        name: param.name.clone(),
                    })?;
            let out = c.emit_value(value)?;
            if !c.reconcile(&out.kind, &param.kind)? {
                return Err(CompileError::ShapeMismatch {
                    context: "assignment",
                    left: out.kind.to_string(),
                    right: param.kind.to_string(),
                });
            }
            c.em.dup()?;
            c.em.store_slot(slot, &param.kind)?;
            Ok(Emitted::value(param.kind.clone()))
        }
        Node::Local(local) => {
            let slot =
                c.bindings
                    .local_slot(local)
                    .ok_or_else(|| CompileError::UnboundLocal {
                        name: local.name.clone(),
                    })?;
            let out = c.emit_value(value)?;
            if !c.reconcile(&out.kind, &local.kind)? {
                return Err(CompileError::ShapeMismatch {
                    context: "assignment",
                    left: out.kind.to_string(),
                    right: local.kind.to_string(),
                });
            }
            c.em.dup()?;
            c.em.store_slot(slot, &local.kind)?;
            Ok(Emitted::value(local.kind.clone()))
        }
        Node::Member { .. } | Node::Index { .. } => {
            let escape = if c.ctx.options.null_checks() {
                Some(c.em.new_label("escape"))
            } else {
                None
            };
            let out = c.emit(target, escape, ResultShape::Address, true)?;
            let place = out.place.ok_or(CompileError::NotAssignable {
                target: target.kind_name(),
            })?;
            let place_kind = out.kind;

            let v = c.emit_value(value)?;
            if !c.reconcile(&v.kind, &place_kind)? {
                return Err(CompileError::ShapeMismatch {
                    context: "assignment",
                    left: v.kind.to_string(),
                    right: place_kind.to_string(),
                });
            }

            // Keep a copy of the stored value as the assignment's result.
            let tmp = c.bindings.pool.acquire(&place_kind);
            c.em.store_slot(tmp.slot, &place_kind)?;
            c.em.load_slot(tmp.slot, &place_kind)?;
            match &place {
                Place::Field { record, index } => c.em.set_field(record, *index)?,
                Place::Element { elem } => c.em.array_set(elem)?,
            }
            c.em.load_slot(tmp.slot, &place_kind)?;
            c.bindings.pool.release(tmp);

            if let Some(esc) = escape
                && out.used_escape
            {
                let done = c.em.new_label("join");
                c.em.branch(done)?;
                c.em.mark(esc)?;
                c.em.pop()?;
                c.emit_zero(&place_kind)?;
                c.em.mark(done)?;
            }
            Ok(Emitted::value(place_kind))
        }
        other => Err(CompileError::NotAssignable {
            target: other.kind_name(),
        }),
    }
}
