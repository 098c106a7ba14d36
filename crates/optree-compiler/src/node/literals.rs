//! Constant emission.
//!
//! Primitive and text constants load from the pool. Reference-kind
//! constants never reach this point: the closure resolver hoists them into
//! the shared state record, so any survivor is a resolver defect.

use optree_core::{CompileError, Kind, Value};

use crate::bytecode::Constant;

use super::{Emitted, Result, UnitCompiler};

pub fn emit_const(c: &mut UnitCompiler, value: &Value, kind: &Kind) -> Result<Emitted> {
    match (value, kind) {
        (Value::Unit, Kind::Unit) => c.em.push_unit()?,
        (Value::Bool(v), Kind::Bool) => c.em.push_bool(*v)?,
        (Value::I8(v), Kind::I8) => {
            c.em.push_const(Constant::I8(*v))?;
        }
        (Value::I16(v), Kind::I16) => {
            c.em.push_const(Constant::I16(*v))?;
        }
        (Value::I32(v), Kind::I32) => {
            c.em.push_const(Constant::I32(*v))?;
        }
        (Value::I64(v), Kind::I64) => {
            c.em.push_const(Constant::I64(*v))?;
        }
        (Value::U8(v), Kind::U8) => {
            c.em.push_const(Constant::U8(*v))?;
        }
        (Value::U16(v), Kind::U16) => {
            c.em.push_const(Constant::U16(*v))?;
        }
        (Value::U32(v), Kind::U32) => {
            c.em.push_const(Constant::U32(*v))?;
        }
        (Value::U64(v), Kind::U64) => {
            c.em.push_const(Constant::U64(*v))?;
        }
        (Value::F32(v), Kind::F32) => {
            c.em.push_const(Constant::F32(*v))?;
        }
        (Value::F64(v), Kind::F64) => {
            c.em.push_const(Constant::F64(*v))?;
        }
        (Value::Str(s), Kind::Str) => {
            c.em.push_const(Constant::Str(s.clone()))?;
        }
        (Value::Opaque(op), Kind::Opaque(ok)) if op.kind.id() == ok.id() => {
            c.em.push_const(Constant::Opaque {
                kind: op.kind.clone(),
                bits: op.bits,
            })?;
        }
        (Value::Opt(None), Kind::Opt(_)) => c.em.push_nothing(kind)?,
        (Value::Opt(Some(inner)), Kind::Opt(elem)) => {
            emit_const(c, inner.as_ref(), elem.as_ref())?;
            c.em.wrap_opt()?;
        }
        (Value::Null, k) if k.is_reference() => c.em.push_null()?,
        (_, k) if k.is_reference() => {
            return Err(CompileError::Unsupported {
                what: format!("unhoisted reference constant of kind '{}'", k),
            });
        }
        _ => {
            return Err(CompileError::Unsupported {
                what: format!("constant {} does not fit kind '{}'", value, kind),
            });
        }
    }
    Ok(Emitted::value(kind.clone()))
}
