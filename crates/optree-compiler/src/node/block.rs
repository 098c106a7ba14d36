//! Blocks with scoped locals.
//!
//! Locals take pooled slots for the block's extent: zero-initialized on
//! entry, returned to the pool on exit so sibling blocks reuse them. The
//! block's value is its last node's; every earlier result is discarded.

use optree_core::{Kind, LocalRef, Node};

use super::{Emitted, Result, UnitCompiler};

pub fn emit_block(c: &mut UnitCompiler, locals: &[LocalRef], body: &[Node]) -> Result<Emitted> {
    let mut tokens = Vec::with_capacity(locals.len());
    for local in locals {
        let token = c.bindings.pool.acquire(&local.kind);
        c.emit_zero(&local.kind)?;
        c.em.store_slot(token.slot, &local.kind)?;
        c.bindings.bind_local(local, token.slot);
        tokens.push(token);
    }

    let mut kind = Kind::Unit;
    if body.is_empty() {
        c.em.push_unit()?;
    } else {
        let last = body.len() - 1;
        for (i, stmt) in body.iter().enumerate() {
            let out = c.emit_value(stmt)?;
            if c.em.is_unreachable() {
                // A goto ended the stream; the rest of the block is dead.
                kind = out.kind;
                break;
            }
            if i == last {
                kind = out.kind;
            } else {
                c.em.pop()?;
            }
        }
    }

    for (local, token) in locals.iter().zip(tokens) {
        c.bindings.unbind_local(local);
        c.bindings.pool.release(token);
    }
    Ok(Emitted::value(kind))
}
