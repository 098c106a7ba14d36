//! Structured exception regions.
//!
//! The catch handler receives the error text and replaces the body's
//! value. The finally arm is emitted twice, as stack-machine compilers do:
//! inline on every normal exit, and as an error-path handler copy ending
//! in a rethrow. Protected regions are recorded in the chunk's region
//! table; the machine truncates the operand stack to the region's base
//! depth before entering a handler.

use optree_core::{CompileError, Kind, Node};

use crate::bytecode::{Region, RegionKind};
use crate::emit::StackTag;

use super::{Emitted, Result, UnitCompiler};

pub fn emit_try(
    c: &mut UnitCompiler,
    body: &Node,
    catch: Option<&Node>,
    finally: Option<&Node>,
) -> Result<Emitted> {
    if catch.is_none() && finally.is_none() {
        return c.emit_value(body);
    }

    let entry_shape = c.em.stack_shape();
    let base_depth = entry_shape.len();
    let start = c.em.current_offset();

    let body_out = c.emit_value(body)?;
    let body_flows = !c.em.is_unreachable();
    let body_end = c.em.current_offset();

    let done = c.em.new_label("done");
    let mut done_used = false;

    if body_flows {
        if let Some(fin) = finally {
            c.emit_value(fin)?;
            c.em.pop()?;
        }
        c.em.branch(done)?;
        done_used = true;
    }

    let mut protected_end = body_end;
    if let Some(catch_arm) = catch {
        let mut handler_shape = entry_shape.clone();
        handler_shape.push(StackTag::Val(Kind::Str));
        let handler = c.em.begin_handler(handler_shape)?;
        c.em.pop()?; // error text
        let catch_out = c.emit_value(catch_arm)?;
        let catch_flows = !c.em.is_unreachable();
        if body_flows && catch_flows && !catch_out.kind.storage_compatible(&body_out.kind) {
            return Err(CompileError::ShapeMismatch {
                context: "catch arm",
                left: catch_out.kind.to_string(),
                right: body_out.kind.to_string(),
            });
        }
        if catch_flows {
            if let Some(fin) = finally {
                c.emit_value(fin)?;
                c.em.pop()?;
            }
            c.em.branch(done)?;
            done_used = true;
        }
        protected_end = c.em.current_offset();
        c.em.add_region(Region {
            start,
            end: body_end,
            handler,
            base_depth,
            kind: RegionKind::Catch,
        });
    }

    if let Some(fin) = finally {
        let handler = c.em.begin_handler(entry_shape)?;
        c.emit_value(fin)?;
        c.em.pop()?;
        c.em.rethrow()?;
        c.em.add_region(Region {
            start,
            end: protected_end,
            handler,
            base_depth,
            kind: RegionKind::Finally,
        });
    }

    if done_used {
        c.em.mark(done)?;
    }
    Ok(Emitted::value(body_out.kind))
}
