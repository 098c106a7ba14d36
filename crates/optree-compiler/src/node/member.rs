//! Member and index access, including the escape protocol and
//! auto-vivification along write paths.
//!
//! Chains thread one escape label downward: when a null or absent
//! intermediate is met, the escape branch leaves a null placeholder on the
//! stack and jumps; the chain root's epilogue discards it and substitutes
//! the target kind's zero value. Under the extend flag, a null record or
//! array read along an assignment chain is replaced by a fresh instance
//! stored back into its owner before the chain continues.

use optree_core::{CompileError, Kind, MemberSel, Node};

use crate::bytecode::Constant;
use crate::emit::Label;

use super::{Emitted, Place, Result, ResultShape, UnitCompiler};

/// Unwrap optional intermediates, escaping on absent when guarded.
fn unwrap_intermediate(
    c: &mut UnitCompiler,
    mut kind: Kind,
    escape: Option<Label>,
    used: &mut bool,
) -> Result<Kind> {
    while matches!(kind, Kind::Opt(_)) {
        if let Some(esc) = escape
            && c.ctx.options.null_checks()
        {
            kind = c.em.escape_nothing(esc)?;
            *used = true;
        } else {
            kind = c.em.unwrap_opt()?;
        }
    }
    Ok(kind)
}

/// Guard the reference on top of the stack, escaping on null when enabled.
fn guard_null(c: &mut UnitCompiler, escape: Option<Label>, used: &mut bool) -> Result<()> {
    if let Some(esc) = escape
        && c.ctx.options.null_checks()
    {
        c.em.escape_null(esc)?;
        *used = true;
    }
    Ok(())
}

pub fn emit_member(
    c: &mut UnitCompiler,
    object: &Node,
    member: &MemberSel,
    escape: Option<Label>,
    shape: ResultShape,
    extend: bool,
) -> Result<Emitted> {
    let obj = c.emit(object, escape, ResultShape::Value, extend)?;
    let mut used = obj.used_escape;
    let obj_kind = unwrap_intermediate(c, obj.kind, escape, &mut used)?;

    match member {
        MemberSel::Length => {
            let Kind::Array(elem) = &obj_kind else {
                return Err(CompileError::Unsupported {
                    what: format!("length of non-array kind '{}'", obj_kind),
                });
            };
            guard_null(c, escape, &mut used)?;
            c.em.array_len(elem.as_ref())?;
            Ok(Emitted {
                kind: Kind::I64,
                used_escape: used,
                place: None,
            })
        }
        MemberSel::Field(name) => {
            let Kind::Record(rec) = &obj_kind else {
                return Err(CompileError::Unsupported {
                    what: format!("member access on non-record kind '{}'", obj_kind),
                });
            };
            let rec = rec.clone();
            let index = rec
                .field_index(name)
                .ok_or_else(|| CompileError::UnknownMember {
                    member: name.clone(),
                    on: rec.name.clone(),
                })?;
            let field_kind = rec.field(index).expect("index resolved").kind.clone();

            guard_null(c, escape, &mut used)?;

            if shape == ResultShape::Address {
                return Ok(Emitted {
                    kind: field_kind,
                    used_escape: used,
                    place: Some(Place::Field { record: rec, index }),
                });
            }

            if extend && matches!(field_kind, Kind::Record(_) | Kind::Array(_)) {
                // Read-through with vivification: a null field is replaced
                // by a fresh instance stored back into the owner.
                c.em.dup()?;
                c.em.get_field(&rec, index)?;
                c.em.dup()?;
                let present = c.em.new_label("present");
                c.em.branch_if_not_null(present)?;
                c.em.pop()?;
                c.em.dup()?;
                emit_fresh(c, &field_kind)?;
                let tmp = c.bindings.pool.acquire(&field_kind);
                c.em.store_slot(tmp.slot, &field_kind)?;
                c.em.load_slot(tmp.slot, &field_kind)?;
                c.em.set_field(&rec, index)?;
                c.em.load_slot(tmp.slot, &field_kind)?;
                c.bindings.pool.release(tmp);
                c.em.mark(present)?;
                c.em.swap()?;
                c.em.pop()?;
            } else {
                c.em.get_field(&rec, index)?;
            }
            Ok(Emitted {
                kind: field_kind,
                used_escape: used,
                place: None,
            })
        }
    }
}

pub fn emit_index(
    c: &mut UnitCompiler,
    array: &Node,
    index: &Node,
    escape: Option<Label>,
    shape: ResultShape,
    extend: bool,
) -> Result<Emitted> {
    let arr = c.emit(array, escape, ResultShape::Value, extend)?;
    let mut used = arr.used_escape;
    let arr_kind = unwrap_intermediate(c, arr.kind, escape, &mut used)?;

    let Kind::Array(elem) = &arr_kind else {
        return Err(CompileError::Unsupported {
            what: format!("indexing non-array kind '{}'", arr_kind),
        });
    };
    let elem = (**elem).clone();

    guard_null(c, escape, &mut used)?;

    let idx = c.emit_value(index)?;
    if !c.reconcile(&idx.kind, &Kind::I64)? {
        return Err(CompileError::ShapeMismatch {
            context: "array index",
            left: idx.kind.to_string(),
            right: Kind::I64.to_string(),
        });
    }

    if shape == ResultShape::Address {
        if extend {
            c.em.array_grow(&elem)?;
        }
        return Ok(Emitted {
            kind: elem.clone(),
            used_escape: used,
            place: Some(Place::Element { elem }),
        });
    }

    if extend {
        c.em.array_grow(&elem)?;
        if matches!(elem, Kind::Record(_) | Kind::Array(_)) {
            // Element vivification: a null element read along a write path
            // is replaced by a fresh instance stored back at its index.
            let idx_tmp = c.bindings.pool.acquire(&Kind::I64);
            c.em.store_slot(idx_tmp.slot, &Kind::I64)?;
            c.em.dup()?;
            c.em.load_slot(idx_tmp.slot, &Kind::I64)?;
            c.em.array_get(&elem)?;
            c.em.dup()?;
            let present = c.em.new_label("present");
            c.em.branch_if_not_null(present)?;
            c.em.pop()?;
            c.em.dup()?;
            c.em.load_slot(idx_tmp.slot, &Kind::I64)?;
            emit_fresh(c, &elem)?;
            let val_tmp = c.bindings.pool.acquire(&elem);
            c.em.store_slot(val_tmp.slot, &elem)?;
            c.em.load_slot(val_tmp.slot, &elem)?;
            c.em.array_set(&elem)?;
            c.em.load_slot(val_tmp.slot, &elem)?;
            c.bindings.pool.release(val_tmp);
            c.em.mark(present)?;
            c.em.swap()?;
            c.em.pop()?;
            c.bindings.pool.release(idx_tmp);
        } else {
            c.em.array_get(&elem)?;
        }
    } else {
        if let Some(esc) = escape
            && c.ctx.options.bounds_checks()
        {
            c.em.escape_bounds(esc, &elem)?;
            used = true;
        }
        c.em.array_get(&elem)?;
    }

    Ok(Emitted {
        kind: elem,
        used_escape: used,
        place: None,
    })
}

/// Construct a fresh default instance of a vivifiable kind.
fn emit_fresh(c: &mut UnitCompiler, kind: &Kind) -> Result<()> {
    match kind {
        Kind::Record(rk) => c.em.new_record(rk)?,
        Kind::Array(ek) => {
            c.em.push_const(Constant::I64(0))?;
            c.em.new_array(ek.as_ref())?;
        }
        other => {
            return Err(CompileError::Unsupported {
                what: format!("cannot synthesize a default instance of kind '{}'", other),
            });
        }
    }
    Ok(())
}
