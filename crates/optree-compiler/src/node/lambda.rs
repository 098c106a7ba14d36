//! Nested lambda values.
//!
//! A lambda sub-expression does not compile inline: it reserves a unit
//! index in the group and emits a shim binding the shared state record to
//! that index. The unit itself compiles later against the same resolved
//! tree, so self- and mutual references work before every unit exists.

use std::sync::Arc;

use optree_core::{CompileError, Kind, LambdaNode};

use crate::link::shim_kind;

use super::{Emitted, Result, UnitCompiler};

pub fn emit_lambda(c: &mut UnitCompiler, lambda: &Arc<LambdaNode>) -> Result<Emitted> {
    let state_kind = c
        .ctx
        .state_kind
        .clone()
        .ok_or_else(|| CompileError::Unsupported {
            what: "nested lambda outside a resolved closure group".to_string(),
        })?;

    let params: Vec<Kind> = lambda.params.iter().map(|p| p.kind.clone()).collect();
    let func = shim_kind(params, lambda.ret.clone());
    let unit = c.ctx.add_unit(lambda.clone());

    c.em.load_slot(0, &Kind::Record(state_kind))?;
    c.em.shim(unit, &func)?;
    Ok(Emitted::value(Kind::Func(func)))
}
