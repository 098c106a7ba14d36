//! Parameter and local variable loads.

use optree_core::{CompileError, LocalRef, ParamRef};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_param(c: &mut UnitCompiler, param: &ParamRef) -> Result<Emitted> {
    let slot = c
        .bindings
        .param_slot(param)
        .ok_or_else(|| CompileError::UnboundParam {
            name: param.name.clone(),
        })?;
    c.em.load_slot(slot, &param.kind)?;
    Ok(Emitted::value(param.kind.clone()))
}

pub fn emit_local(c: &mut UnitCompiler, local: &LocalRef) -> Result<Emitted> {
    let slot = c
        .bindings
        .local_slot(local)
        .ok_or_else(|| CompileError::UnboundLocal {
            name: local.name.clone(),
        })?;
    c.em.load_slot(slot, &local.kind)?;
    Ok(Emitted::value(local.kind.clone()))
}
