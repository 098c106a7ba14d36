//! Construction: fresh records with optional field initializers, and fresh
//! zero-filled arrays.

use optree_core::{CompileError, Kind, NewNode};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_new(c: &mut UnitCompiler, node: &NewNode) -> Result<Emitted> {
    match node {
        NewNode::Record { kind, inits } => {
            c.em.new_record(kind)?;
            for (name, value) in inits {
                let index = kind
                    .field_index(name)
                    .ok_or_else(|| CompileError::UnknownMember {
                        member: name.clone(),
                        on: kind.name.clone(),
                    })?;
                let field_kind = kind.field(index).expect("index resolved").kind.clone();
                c.em.dup()?;
                let out = c.emit_value(value)?;
                if !c.reconcile(&out.kind, &field_kind)? {
                    return Err(CompileError::ShapeMismatch {
                        context: "field initializer",
                        left: out.kind.to_string(),
                        right: field_kind.to_string(),
                    });
                }
                c.em.set_field(kind, index)?;
            }
            Ok(Emitted::value(Kind::Record(kind.clone())))
        }
        NewNode::Array { elem, len } => {
            let out = c.emit_value(len)?;
            if !c.reconcile(&out.kind, &Kind::I64)? {
                return Err(CompileError::ShapeMismatch {
                    context: "array length",
                    left: out.kind.to_string(),
                    right: Kind::I64.to_string(),
                });
            }
            c.em.new_array(elem)?;
            Ok(Emitted::value(Kind::array(elem.clone())))
        }
    }
}
