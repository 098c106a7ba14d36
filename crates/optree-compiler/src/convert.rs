//! Kind conversion emission.
//!
//! Covers the full primitive numeric matrix in checked and unchecked forms,
//! boxing/unboxing between value kinds and their reference shells, and
//! optional wrapping/unwrapping including lifted conversion over absent
//! values. Implicit operand reconciliation for binary arithmetic only uses
//! value-preserving widening; everything lossy requires an explicit
//! conversion node.

use optree_core::{CompileError, Kind, NumKind};

use crate::emit::Emitter;

type Result<T> = std::result::Result<T, CompileError>;

/// Count optional nesting and return the innermost kind.
pub(crate) fn opt_depth(kind: &Kind) -> (usize, Kind) {
    let mut depth = 0;
    let mut current = kind.clone();
    while let Kind::Opt(inner) = current {
        depth += 1;
        current = (*inner).clone();
    }
    (depth, current)
}

/// The common kind two numeric operands widen to without loss, if any.
///
/// Signed widens to larger signed, unsigned to larger unsigned or to a
/// strictly larger signed kind, floats absorb integers and each other by
/// size. Anything lossy returns `None` and must be spelled as an explicit
/// conversion.
pub(crate) fn widen_common(a: NumKind, b: NumKind) -> Option<NumKind> {
    if a == b {
        return Some(a);
    }
    if widens_to(a, b) {
        return Some(b);
    }
    if widens_to(b, a) {
        return Some(a);
    }
    None
}

/// Whether `from` widens to `to` without loss of magnitude.
fn widens_to(from: NumKind, to: NumKind) -> bool {
    use NumKind::*;
    match (from.is_float(), to.is_float()) {
        (true, true) => matches!((from, to), (F32, F64)),
        (true, false) => false,
        // Integers absorb into floats; F32 only takes kinds whose whole
        // range it represents exactly.
        (false, true) => match to {
            F64 => !matches!(from, I64 | U64),
            F32 => matches!(from, I8 | I16 | U8 | U16),
            _ => unreachable!("float target"),
        },
        (false, false) => {
            if from.is_signed() == to.is_signed() {
                from.size() < to.size()
            } else {
                // Unsigned fits into a strictly larger signed kind.
                !from.is_signed() && to.is_signed() && from.size() < to.size()
            }
        }
    }
}

/// Emit a conversion from `from` to `to` on the top of stack.
///
/// Returns the resulting kind (always `to` on success).
pub fn emit_conversion(em: &mut Emitter, from: &Kind, to: &Kind, checked: bool) -> Result<Kind> {
    if from == to {
        return Ok(to.clone());
    }

    // Numeric matrix.
    if let (Some(src), Some(dst)) = (from.numeric(), to.numeric()) {
        em.conv(src, dst, checked)?;
        return Ok(to.clone());
    }

    match (from, to) {
        // Wrap into an optional, converting the payload first when needed.
        (_, Kind::Opt(inner)) if !matches!(from, Kind::Opt(_)) => {
            emit_conversion(em, from, inner.as_ref(), checked)?;
            em.wrap_opt()?;
            return Ok(to.clone());
        }
        // Unwrap an optional; absent raises at run time.
        (Kind::Opt(inner), _) if !matches!(to, Kind::Opt(_)) => {
            em.unwrap_opt()?;
            return emit_conversion(em, inner.as_ref(), to, checked);
        }
        // Lifted optional-to-optional conversion: absent stays absent.
        (Kind::Opt(src_inner), Kind::Opt(dst_inner)) => {
            let absent = em.new_label("absent");
            let done = em.new_label("done");
            em.escape_nothing(absent)?;
            emit_conversion(em, src_inner.as_ref(), dst_inner.as_ref(), checked)?;
            em.wrap_opt()?;
            em.branch(done)?;
            em.mark(absent)?;
            em.pop()?;
            em.push_nothing(to)?;
            em.branch(done)?;
            em.mark(done)?;
            return Ok(to.clone());
        }
        // Box a value kind into its reference shell.
        (_, Kind::Boxed(inner)) if **inner == *from && !from.is_reference() => {
            em.box_value()?;
            return Ok(to.clone());
        }
        // Unbox back to the payload kind; mismatch raises at run time.
        (Kind::Boxed(inner), _) if **inner == *to => {
            em.unbox(to)?;
            return Ok(to.clone());
        }
        _ => {}
    }

    Err(CompileError::UnsupportedConversion {
        from: from.to_string(),
        to: to.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::{Constant, ConstantPool};

    #[test]
    fn widening_table() {
        assert_eq!(widen_common(NumKind::I32, NumKind::I64), Some(NumKind::I64));
        assert_eq!(widen_common(NumKind::U16, NumKind::I32), Some(NumKind::I32));
        assert_eq!(widen_common(NumKind::U8, NumKind::U64), Some(NumKind::U64));
        assert_eq!(widen_common(NumKind::I32, NumKind::F64), Some(NumKind::F64));
        assert_eq!(widen_common(NumKind::F32, NumKind::F64), Some(NumKind::F64));
        assert_eq!(widen_common(NumKind::I16, NumKind::F32), Some(NumKind::F32));
        // Lossy pairs have no implicit common kind.
        assert_eq!(widen_common(NumKind::I64, NumKind::U64), None);
        assert_eq!(widen_common(NumKind::I64, NumKind::F64), None);
        assert_eq!(widen_common(NumKind::I32, NumKind::F32), None);
    }

    #[test]
    fn identity_conversion_is_a_no_op() {
        let mut constants = ConstantPool::new();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I32(1)).unwrap();
        let before = em.current_offset();
        emit_conversion(&mut em, &Kind::I32, &Kind::I32, true).unwrap();
        assert_eq!(em.current_offset(), before);
    }

    #[test]
    fn numeric_matrix_is_total() {
        for from in NumKind::ALL {
            for to in NumKind::ALL {
                let mut constants = ConstantPool::new();
                let mut em = Emitter::new(&mut constants);
                em.push_const(Constant::F64(0.0)).unwrap();
                // Put a value of the source kind on the stack first.
                emit_conversion(&mut em, &Kind::F64, &Kind::from_numeric(from), false).unwrap();
                let result = emit_conversion(
                    &mut em,
                    &Kind::from_numeric(from),
                    &Kind::from_numeric(to),
                    true,
                );
                assert_eq!(result.unwrap(), Kind::from_numeric(to));
            }
        }
    }

    #[test]
    fn wrap_and_unwrap_paths() {
        let mut constants = ConstantPool::new();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I32(5)).unwrap();
        let wrapped = emit_conversion(&mut em, &Kind::I32, &Kind::opt(Kind::I32), false).unwrap();
        assert_eq!(wrapped, Kind::opt(Kind::I32));
        let back = emit_conversion(&mut em, &Kind::opt(Kind::I32), &Kind::I32, false).unwrap();
        assert_eq!(back, Kind::I32);
    }

    #[test]
    fn lifted_optional_conversion_verifies() {
        let mut constants = ConstantPool::new();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I32(5)).unwrap();
        emit_conversion(&mut em, &Kind::I32, &Kind::opt(Kind::I32), false).unwrap();
        let out =
            emit_conversion(&mut em, &Kind::opt(Kind::I32), &Kind::opt(Kind::I64), false).unwrap();
        assert_eq!(out, Kind::opt(Kind::I64));
        em.ret(&Kind::opt(Kind::I64)).unwrap();
        em.finish().unwrap();
    }

    #[test]
    fn unsupported_pairs_are_named() {
        let mut constants = ConstantPool::new();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::Str(std::sync::Arc::from("x"))).unwrap();
        let err = emit_conversion(&mut em, &Kind::Str, &Kind::I32, false).unwrap_err();
        match err {
            CompileError::UnsupportedConversion { from, to } => {
                assert_eq!(from, "str");
                assert_eq!(to, "i32");
            }
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn opt_depth_counts_nesting() {
        let kind = Kind::opt(Kind::opt(Kind::I32));
        let (depth, inner) = opt_depth(&kind);
        assert_eq!(depth, 2);
        assert_eq!(inner, Kind::I32);
    }
}
