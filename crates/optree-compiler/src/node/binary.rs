//! Binary operators: arithmetic (with optional lifting), comparison, and
//! short-circuit logic.

use optree_core::{BinaryOp, CompileError, Kind, Node, NumKind};

use crate::bytecode::OpCode;
use crate::convert::{opt_depth, widen_common};
use crate::emit::CmpOperand;

use super::{Emitted, Result, UnitCompiler};

pub fn emit_binary(c: &mut UnitCompiler, op: BinaryOp, lhs: &Node, rhs: &Node) -> Result<Emitted> {
    if op.is_logical() {
        return emit_logical(c, op, lhs, rhs);
    }
    if op.is_comparison() {
        return emit_comparison(c, op, lhs, rhs);
    }
    emit_arith(c, op, lhs, rhs)
}

fn arith_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Add => OpCode::Add,
        BinaryOp::Sub => OpCode::Sub,
        BinaryOp::Mul => OpCode::Mul,
        BinaryOp::Div => OpCode::Div,
        BinaryOp::Rem => OpCode::Rem,
        _ => unreachable!("arithmetic operator"),
    }
}

fn cmp_opcode(op: BinaryOp) -> OpCode {
    match op {
        BinaryOp::Eq => OpCode::CmpEq,
        BinaryOp::Ne => OpCode::CmpNe,
        BinaryOp::Lt => OpCode::CmpLt,
        BinaryOp::Le => OpCode::CmpLe,
        BinaryOp::Gt => OpCode::CmpGt,
        BinaryOp::Ge => OpCode::CmpGe,
        _ => unreachable!("comparison operator"),
    }
}

// ----------------------------------------------------------------------
// Short-circuit logic
// ----------------------------------------------------------------------

fn emit_logical(c: &mut UnitCompiler, op: BinaryOp, lhs: &Node, rhs: &Node) -> Result<Emitted> {
    let l = c.emit_value(lhs)?;
    if l.kind != Kind::Bool {
        return Err(CompileError::ShapeMismatch {
            context: "logical operand",
            left: l.kind.to_string(),
            right: Kind::Bool.to_string(),
        });
    }
    let short = c.em.new_label("short");
    c.em.dup()?;
    match op {
        BinaryOp::And => c.em.branch_if_false(short)?,
        BinaryOp::Or => c.em.branch_if_true(short)?,
        _ => unreachable!("logical operator"),
    }
    c.em.pop()?;
    let r = c.emit_value(rhs)?;
    if r.kind != Kind::Bool {
        return Err(CompileError::ShapeMismatch {
            context: "logical operand",
            left: r.kind.to_string(),
            right: Kind::Bool.to_string(),
        });
    }
    c.em.mark(short)?;
    Ok(Emitted::value(Kind::Bool))
}

// ----------------------------------------------------------------------
// Comparison
// ----------------------------------------------------------------------

fn emit_comparison(c: &mut UnitCompiler, op: BinaryOp, lhs: &Node, rhs: &Node) -> Result<Emitted> {
    let l = c.emit_value(lhs)?;
    let r = c.emit_value(rhs)?;

    let operand = match (l.kind.numeric(), r.kind.numeric()) {
        (Some(a), Some(b)) => {
            let common = widen_common(a, b).ok_or_else(|| CompileError::ShapeMismatch {
                context: "comparison operands",
                left: l.kind.to_string(),
                right: r.kind.to_string(),
            })?;
            reconcile_pair(c, a, b, common)?;
            CmpOperand::Num(common)
        }
        _ => match (&l.kind, &r.kind) {
            (Kind::Bool, Kind::Bool) => CmpOperand::Bool,
            (Kind::Str, Kind::Str) => CmpOperand::Str,
            (a, b) if a.is_reference() && b.is_reference() => CmpOperand::Ref,
            _ => {
                return Err(CompileError::ShapeMismatch {
                    context: "comparison operands",
                    left: l.kind.to_string(),
                    right: r.kind.to_string(),
                });
            }
        },
    };

    if !matches!(operand, CmpOperand::Num(_))
        && !matches!(op, BinaryOp::Eq | BinaryOp::Ne)
    {
        return Err(CompileError::Unsupported {
            what: format!("ordering comparison on kind '{}'", l.kind),
        });
    }

    c.em.compare(cmp_opcode(op), operand)?;
    Ok(Emitted::value(Kind::Bool))
}

/// Convert the operand pair (lhs below rhs) to the common numeric kind.
fn reconcile_pair(c: &mut UnitCompiler, a: NumKind, b: NumKind, common: NumKind) -> Result<()> {
    if b != common {
        c.em.conv(b, common, false)?;
    }
    if a != common {
        c.em.swap()?;
        c.em.conv(a, common, false)?;
        c.em.swap()?;
    }
    Ok(())
}

// ----------------------------------------------------------------------
// Arithmetic
// ----------------------------------------------------------------------

fn emit_arith(c: &mut UnitCompiler, op: BinaryOp, lhs: &Node, rhs: &Node) -> Result<Emitted> {
    let l = c.emit_value(lhs)?;
    let (l_depth, l_inner) = opt_depth(&l.kind);

    if l_depth == 0 && l.kind.numeric().is_some() {
        // Plain path unless the right side turns out optional; peek at the
        // right kind by emitting it and deciding afterwards.
        let r = c.emit_value(rhs)?;
        let (r_depth, r_inner) = opt_depth(&r.kind);
        let (a, b) = match (l_inner.numeric(), r_inner.numeric()) {
            (Some(a), Some(b)) => (a, b),
            _ => {
                return Err(CompileError::ShapeMismatch {
                    context: "arithmetic operands",
                    left: l.kind.to_string(),
                    right: r.kind.to_string(),
                });
            }
        };
        let common = widen_common(a, b).ok_or_else(|| CompileError::ShapeMismatch {
            context: "arithmetic operands",
            left: l.kind.to_string(),
            right: r.kind.to_string(),
        })?;

        if r_depth == 0 {
            reconcile_pair(c, a, b, common)?;
            c.em.arith(arith_opcode(op), common)?;
            return Ok(Emitted::value(Kind::from_numeric(common)));
        }

        // Lifted with only the right side optional: unwrap it in place;
        // absent short-circuits to an absent result.
        let result = Kind::opt(Kind::from_numeric(common));
        let absent = c.em.new_label("absent");
        let done = c.em.new_label("join");
        for _ in 0..r_depth {
            c.em.escape_nothing(absent)?;
        }
        reconcile_pair(c, a, b, common)?;
        c.em.arith(arith_opcode(op), common)?;
        c.em.wrap_opt()?;
        c.em.branch(done)?;
        c.em.mark(absent)?; // [lhs, null]
        c.em.pop()?;
        c.em.pop()?;
        c.emit_zero(&result)?;
        c.em.mark(done)?;
        return Ok(Emitted::value(result));
    }

    // Left side optional: park the unwrapped left value in a slot so both
    // operands escape with an identical stack shape.
    let a = l_inner.numeric().ok_or_else(|| CompileError::ShapeMismatch {
        context: "arithmetic operands",
        left: l.kind.to_string(),
        right: "a numeric kind".to_string(),
    })?;

    let absent = c.em.new_label("absent");
    let done = c.em.new_label("join");
    for _ in 0..l_depth {
        c.em.escape_nothing(absent)?;
    }

    // The common kind depends on the right side; emit it after parking the
    // left at its own width and widen both at the end.
    let l_kind = Kind::from_numeric(a);
    let tmp = c.bindings.pool.acquire(&l_kind);
    c.em.store_slot(tmp.slot, &l_kind)?;

    let r = c.emit_value(rhs)?;
    let (r_depth, r_inner) = opt_depth(&r.kind);
    let b = r_inner.numeric().ok_or_else(|| CompileError::ShapeMismatch {
        context: "arithmetic operands",
        left: l.kind.to_string(),
        right: r.kind.to_string(),
    })?;
    let common = widen_common(a, b).ok_or_else(|| CompileError::ShapeMismatch {
        context: "arithmetic operands",
        left: l.kind.to_string(),
        right: r.kind.to_string(),
    })?;
    let result = Kind::opt(Kind::from_numeric(common));

    for _ in 0..r_depth {
        c.em.escape_nothing(absent)?;
    }
    if b != common {
        c.em.conv(b, common, false)?;
    }
    c.em.load_slot(tmp.slot, &l_kind)?;
    if a != common {
        c.em.conv(a, common, false)?;
    }
    c.em.swap()?;
    c.em.arith(arith_opcode(op), common)?;
    c.em.wrap_opt()?;
    c.em.branch(done)?;

    c.em.mark(absent)?; // [null]
    c.em.pop()?;
    c.emit_zero(&result)?;
    c.em.mark(done)?;
    c.bindings.pool.release(tmp);

    Ok(Emitted::value(result))
}
