//! Execution engine for compiled units.
//!
//! A compact decode loop over the byte-packed chunk: an operand stack, a
//! frame of slots (state record at 0, arguments next, pooled temporaries
//! after), and the protected-region table for unwinding. Integer values
//! are reinterpreted by bit pattern at the width encoded in each
//! instruction, matching the verifier's storage-size merge rule.

use std::rc::Rc;
use std::sync::Arc;

use optree_core::{NumKind, RuntimeError, Value};

use crate::bytecode::{cmp_kind, CodeChunk, Constant, OpCode, RegionKind};
use crate::link::{ShimHandle, UnitGroup};

type Result<T> = std::result::Result<T, RuntimeError>;

enum Flow {
    Next,
    Return(Value),
}

/// Run one unit of a group with a pre-built frame.
pub fn run(group: &Arc<UnitGroup>, unit_index: usize, mut frame: Vec<Value>) -> Result<Value> {
    let unit = &group.units[unit_index];
    let chunk = &unit.chunk;
    frame.resize(unit.frame_size as usize, Value::Unit);

    let mut stack: Vec<Value> = Vec::new();
    let mut pc = 0usize;
    let mut pending: Option<RuntimeError> = None;

    loop {
        let at = pc;
        match exec_one(group, chunk, &mut stack, &mut frame, &mut pc, &mut pending) {
            Ok(Flow::Next) => {}
            Ok(Flow::Return(value)) => return Ok(value),
            Err(error) => {
                let region = chunk
                    .regions()
                    .iter()
                    .find(|r| r.start <= at && at < r.end);
                match region {
                    Some(region) => {
                        stack.truncate(region.base_depth);
                        match region.kind {
                            RegionKind::Catch => {
                                stack.push(Value::str(error.to_string()));
                                pending = None;
                            }
                            RegionKind::Finally => {
                                pending = Some(error);
                            }
                        }
                        pc = region.handler;
                    }
                    None => return Err(error),
                }
            }
        }
    }
}

// ============================================================================
// Decode helpers
// ============================================================================

fn read_u8(chunk: &CodeChunk, pc: &mut usize) -> Result<u8> {
    let byte = chunk
        .read_byte(*pc)
        .ok_or(RuntimeError::CorruptUnit { at: *pc })?;
    *pc += 1;
    Ok(byte)
}

fn read_u16(chunk: &CodeChunk, pc: &mut usize) -> Result<u16> {
    let value = chunk
        .read_u16(*pc)
        .ok_or(RuntimeError::CorruptUnit { at: *pc })?;
    *pc += 2;
    Ok(value)
}

fn read_num_kind(chunk: &CodeChunk, pc: &mut usize) -> Result<NumKind> {
    let at = *pc;
    let byte = read_u8(chunk, pc)?;
    NumKind::from_u8(byte).ok_or(RuntimeError::CorruptUnit { at })
}

fn pop(stack: &mut Vec<Value>, at: usize) -> Result<Value> {
    stack.pop().ok_or(RuntimeError::CorruptUnit { at })
}

fn constant_at(group: &UnitGroup, index: usize, at: usize) -> Result<Value> {
    match group.constants.get(index) {
        Some(Constant::I8(v)) => Ok(Value::I8(*v)),
        Some(Constant::I16(v)) => Ok(Value::I16(*v)),
        Some(Constant::I32(v)) => Ok(Value::I32(*v)),
        Some(Constant::I64(v)) => Ok(Value::I64(*v)),
        Some(Constant::U8(v)) => Ok(Value::U8(*v)),
        Some(Constant::U16(v)) => Ok(Value::U16(*v)),
        Some(Constant::U32(v)) => Ok(Value::U32(*v)),
        Some(Constant::U64(v)) => Ok(Value::U64(*v)),
        Some(Constant::F32(v)) => Ok(Value::F32(*v)),
        Some(Constant::F64(v)) => Ok(Value::F64(*v)),
        Some(Constant::Str(s)) => Ok(Value::Str(s.clone())),
        Some(Constant::Opaque { kind, bits }) => Ok(Value::Opaque(optree_core::OpaqueValue {
            kind: kind.clone(),
            bits: *bits,
        })),
        Some(Constant::Kind(_)) | None => Err(RuntimeError::CorruptUnit { at }),
    }
}

fn kind_at(group: &UnitGroup, index: usize, at: usize) -> Result<optree_core::Kind> {
    match group.constants.get(index) {
        Some(Constant::Kind(kind)) => Ok(kind.clone()),
        _ => Err(RuntimeError::CorruptUnit { at }),
    }
}

// ============================================================================
// Integer reinterpretation
// ============================================================================

/// The value's integer payload, zero-extended from its own width.
fn int_bits(value: &Value) -> Option<u64> {
    match value {
        Value::I8(v) => Some(*v as u8 as u64),
        Value::I16(v) => Some(*v as u16 as u64),
        Value::I32(v) => Some(*v as u32 as u64),
        Value::I64(v) => Some(*v as u64),
        Value::U8(v) => Some(*v as u64),
        Value::U16(v) => Some(*v as u64),
        Value::U32(v) => Some(*v as u64),
        Value::U64(v) => Some(*v),
        Value::Bool(v) => Some(*v as u64),
        _ => None,
    }
}

/// Interpret the value's bits at the instruction's width and signedness.
fn int_of(nk: NumKind, value: &Value, at: usize) -> Result<i128> {
    let bits = int_bits(value).ok_or(RuntimeError::CorruptUnit { at })?;
    let width = nk.size() as u32 * 8;
    let masked = if width == 64 {
        bits
    } else {
        bits & ((1u64 << width) - 1)
    };
    if nk.is_signed() {
        let shift = 64 - width;
        Ok((((masked << shift) as i64) >> shift) as i128)
    } else {
        Ok(masked as i128)
    }
}

/// Construct the canonical value of a numeric kind from a wide integer,
/// truncating two's-complement style.
fn make_int(nk: NumKind, raw: i128) -> Value {
    match nk {
        NumKind::I8 => Value::I8(raw as i8),
        NumKind::I16 => Value::I16(raw as i16),
        NumKind::I32 => Value::I32(raw as i32),
        NumKind::I64 => Value::I64(raw as i64),
        NumKind::U8 => Value::U8(raw as u8),
        NumKind::U16 => Value::U16(raw as u16),
        NumKind::U32 => Value::U32(raw as u32),
        NumKind::U64 => Value::U64(raw as u64),
        NumKind::F32 | NumKind::F64 => unreachable!("integer kind"),
    }
}

fn float_of(value: &Value, at: usize) -> Result<f64> {
    match value {
        Value::F32(v) => Ok(*v as f64),
        Value::F64(v) => Ok(*v),
        _ => Err(RuntimeError::CorruptUnit { at }),
    }
}

fn int_range(nk: NumKind) -> (i128, i128) {
    match nk {
        NumKind::I8 => (i8::MIN as i128, i8::MAX as i128),
        NumKind::I16 => (i16::MIN as i128, i16::MAX as i128),
        NumKind::I32 => (i32::MIN as i128, i32::MAX as i128),
        NumKind::I64 => (i64::MIN as i128, i64::MAX as i128),
        NumKind::U8 => (0, u8::MAX as i128),
        NumKind::U16 => (0, u16::MAX as i128),
        NumKind::U32 => (0, u32::MAX as i128),
        NumKind::U64 => (0, u64::MAX as i128),
        NumKind::F32 | NumKind::F64 => unreachable!("integer kind"),
    }
}

// ============================================================================
// Operations
// ============================================================================

fn arith(op: OpCode, nk: NumKind, a: Value, b: Value, at: usize) -> Result<Value> {
    if nk.is_float() {
        let x = float_of(&a, at)?;
        let y = float_of(&b, at)?;
        let r = match op {
            OpCode::Add => x + y,
            OpCode::Sub => x - y,
            OpCode::Mul => x * y,
            OpCode::Div => x / y,
            OpCode::Rem => x % y,
            _ => return Err(RuntimeError::CorruptUnit { at }),
        };
        return Ok(match nk {
            NumKind::F32 => Value::F32(r as f32),
            _ => Value::F64(r),
        });
    }
    let x = int_of(nk, &a, at)?;
    let y = int_of(nk, &b, at)?;
    let r = match op {
        OpCode::Add => x.wrapping_add(y),
        OpCode::Sub => x.wrapping_sub(y),
        OpCode::Mul => x.wrapping_mul(y),
        OpCode::Div => {
            if y == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            x.wrapping_div(y)
        }
        OpCode::Rem => {
            if y == 0 {
                return Err(RuntimeError::DivideByZero);
            }
            x.wrapping_rem(y)
        }
        _ => return Err(RuntimeError::CorruptUnit { at }),
    };
    Ok(make_int(nk, r))
}

fn compare(op: OpCode, operand: u8, a: Value, b: Value, at: usize) -> Result<Value> {
    use std::cmp::Ordering;
    let ordering: Option<Ordering> = if let Some(nk) = NumKind::from_u8(operand) {
        if nk.is_float() {
            float_of(&a, at)?.partial_cmp(&float_of(&b, at)?)
        } else {
            Some(int_of(nk, &a, at)?.cmp(&int_of(nk, &b, at)?))
        }
    } else {
        match operand {
            cmp_kind::BOOL => match (&a, &b) {
                (Value::Bool(x), Value::Bool(y)) => Some(x.cmp(y)),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            },
            cmp_kind::STR => match (&a, &b) {
                (Value::Str(x), Value::Str(y)) => Some(x.cmp(y)),
                (Value::Null, Value::Null) => Some(Ordering::Equal),
                (Value::Null, _) | (_, Value::Null) => None,
                _ => return Err(RuntimeError::CorruptUnit { at }),
            },
            cmp_kind::REF => {
                let same = match (&a, &b) {
                    (Value::Null, Value::Null) => true,
                    _ => match (a.ref_address(), b.ref_address()) {
                        (Some(x), Some(y)) => x == y,
                        _ => false,
                    },
                };
                return Ok(Value::Bool(match op {
                    OpCode::CmpEq => same,
                    OpCode::CmpNe => !same,
                    _ => return Err(RuntimeError::CorruptUnit { at }),
                }));
            }
            _ => return Err(RuntimeError::CorruptUnit { at }),
        }
    };

    let result = match (op, ordering) {
        (OpCode::CmpEq, ord) => ord == Some(Ordering::Equal),
        (OpCode::CmpNe, ord) => ord != Some(Ordering::Equal),
        (OpCode::CmpLt, ord) => ord == Some(Ordering::Less),
        (OpCode::CmpLe, ord) => matches!(ord, Some(Ordering::Less | Ordering::Equal)),
        (OpCode::CmpGt, ord) => ord == Some(Ordering::Greater),
        (OpCode::CmpGe, ord) => matches!(ord, Some(Ordering::Greater | Ordering::Equal)),
        _ => return Err(RuntimeError::CorruptUnit { at }),
    };
    Ok(Value::Bool(result))
}

fn convert(from: NumKind, to: NumKind, checked: bool, value: Value, at: usize) -> Result<Value> {
    if from.is_float() {
        let x = float_of(&value, at)?;
        if to.is_float() {
            return Ok(match to {
                NumKind::F32 => Value::F32(x as f32),
                _ => Value::F64(x),
            });
        }
        if checked {
            let truncated = x.trunc();
            let (min, max) = int_range(to);
            if !truncated.is_finite()
                || truncated < min as f64
                || truncated > max as f64
            {
                return Err(RuntimeError::Overflow {
                    from: from.mnemonic(),
                    to: to.mnemonic(),
                    value: x.to_string(),
                });
            }
            return Ok(make_int(to, truncated as i128));
        }
        // Unchecked float-to-integer saturates like a Rust `as` cast.
        return Ok(match to {
            NumKind::I8 => Value::I8(x as i8),
            NumKind::I16 => Value::I16(x as i16),
            NumKind::I32 => Value::I32(x as i32),
            NumKind::I64 => Value::I64(x as i64),
            NumKind::U8 => Value::U8(x as u8),
            NumKind::U16 => Value::U16(x as u16),
            NumKind::U32 => Value::U32(x as u32),
            NumKind::U64 => Value::U64(x as u64),
            _ => unreachable!("integer target"),
        });
    }

    let x = int_of(from, &value, at)?;
    if to.is_float() {
        return Ok(match to {
            NumKind::F32 => Value::F32(x as f32),
            _ => Value::F64(x as f64),
        });
    }
    if checked {
        let (min, max) = int_range(to);
        if x < min || x > max {
            return Err(RuntimeError::Overflow {
                from: from.mnemonic(),
                to: to.mnemonic(),
                value: x.to_string(),
            });
        }
    }
    Ok(make_int(to, x))
}

// ============================================================================
// The dispatch loop body
// ============================================================================

fn exec_one(
    group: &Arc<UnitGroup>,
    chunk: &CodeChunk,
    stack: &mut Vec<Value>,
    frame: &mut [Value],
    pc: &mut usize,
    pending: &mut Option<RuntimeError>,
) -> Result<Flow> {
    let at = *pc;
    let op = chunk
        .read_op(at)
        .ok_or(RuntimeError::CorruptUnit { at })?;
    *pc += 1;

    match op {
        OpCode::Const => {
            let index = read_u8(chunk, pc)? as usize;
            stack.push(constant_at(group, index, at)?);
        }
        OpCode::ConstW => {
            let index = read_u16(chunk, pc)? as usize;
            stack.push(constant_at(group, index, at)?);
        }
        OpCode::PushNull => stack.push(Value::Null),
        OpCode::PushUnit => stack.push(Value::Unit),
        OpCode::PushTrue => stack.push(Value::Bool(true)),
        OpCode::PushFalse => stack.push(Value::Bool(false)),
        OpCode::PushNothing => stack.push(Value::Opt(None)),

        OpCode::Pop => {
            pop(stack, at)?;
        }
        OpCode::Dup => {
            let top = stack.last().ok_or(RuntimeError::CorruptUnit { at })?.clone();
            stack.push(top);
        }
        OpCode::Swap => {
            let len = stack.len();
            if len < 2 {
                return Err(RuntimeError::CorruptUnit { at });
            }
            stack.swap(len - 1, len - 2);
        }

        OpCode::GetLocal | OpCode::GetLocalW => {
            let slot = if op == OpCode::GetLocal {
                read_u8(chunk, pc)? as usize
            } else {
                read_u16(chunk, pc)? as usize
            };
            let value = frame
                .get(slot)
                .ok_or(RuntimeError::CorruptUnit { at })?
                .clone();
            stack.push(value);
        }
        OpCode::SetLocal | OpCode::SetLocalW => {
            let slot = if op == OpCode::SetLocal {
                read_u8(chunk, pc)? as usize
            } else {
                read_u16(chunk, pc)? as usize
            };
            let value = pop(stack, at)?;
            *frame
                .get_mut(slot)
                .ok_or(RuntimeError::CorruptUnit { at })? = value;
        }

        OpCode::GetField => {
            let index = read_u16(chunk, pc)? as usize;
            let object = pop(stack, at)?;
            match object {
                Value::Record(rec) => {
                    let value = rec
                        .borrow()
                        .fields
                        .get(index)
                        .ok_or(RuntimeError::CorruptUnit { at })?
                        .clone();
                    stack.push(value);
                }
                Value::Null => return Err(RuntimeError::NullAccess { what: "member access" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::SetField => {
            let index = read_u16(chunk, pc)? as usize;
            let value = pop(stack, at)?;
            let object = pop(stack, at)?;
            match object {
                Value::Record(rec) => {
                    *rec.borrow_mut()
                        .fields
                        .get_mut(index)
                        .ok_or(RuntimeError::CorruptUnit { at })? = value;
                }
                Value::Null => return Err(RuntimeError::NullAccess { what: "member store" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::NewRecord => {
            let index = read_u16(chunk, pc)? as usize;
            match kind_at(group, index, at)? {
                optree_core::Kind::Record(rec) => stack.push(Value::new_record(&rec)),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }

        OpCode::NewArray => {
            let index = read_u16(chunk, pc)? as usize;
            let elem = kind_at(group, index, at)?;
            let len = int_of(NumKind::I64, &pop(stack, at)?, at)?;
            if len < 0 {
                return Err(RuntimeError::IndexOutOfRange {
                    index: len as i64,
                    len: 0,
                });
            }
            stack.push(Value::new_array(&elem, len as usize));
        }
        OpCode::ArrayLen => {
            let array = pop(stack, at)?;
            match array {
                Value::Array(arr) => stack.push(Value::I64(arr.borrow().items.len() as i64)),
                Value::Null => return Err(RuntimeError::NullAccess { what: "array access" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::ArrayGet => {
            let index = int_of(NumKind::I64, &pop(stack, at)?, at)?;
            let array = pop(stack, at)?;
            match array {
                Value::Array(arr) => {
                    let data = arr.borrow();
                    let value = usize::try_from(index)
                        .ok()
                        .and_then(|i| data.items.get(i))
                        .ok_or(RuntimeError::IndexOutOfRange {
                            index: index as i64,
                            len: data.items.len(),
                        })?
                        .clone();
                    drop(data);
                    stack.push(value);
                }
                Value::Null => return Err(RuntimeError::NullAccess { what: "array access" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::ArraySet => {
            let value = pop(stack, at)?;
            let index = int_of(NumKind::I64, &pop(stack, at)?, at)?;
            let array = pop(stack, at)?;
            match array {
                Value::Array(arr) => {
                    let mut data = arr.borrow_mut();
                    let len = data.items.len();
                    let slot = usize::try_from(index)
                        .ok()
                        .and_then(|i| data.items.get_mut(i))
                        .ok_or(RuntimeError::IndexOutOfRange {
                            index: index as i64,
                            len,
                        })?;
                    *slot = value;
                }
                Value::Null => return Err(RuntimeError::NullAccess { what: "array store" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::ArrayGrow => {
            let len = stack.len();
            if len < 2 {
                return Err(RuntimeError::CorruptUnit { at });
            }
            let index = int_of(NumKind::I64, &stack[len - 1], at)?;
            match &stack[len - 2] {
                Value::Array(arr) => {
                    if index < 0 {
                        let cur = arr.borrow().items.len();
                        return Err(RuntimeError::IndexOutOfRange {
                            index: index as i64,
                            len: cur,
                        });
                    }
                    let needed = index as usize + 1;
                    let mut data = arr.borrow_mut();
                    if data.items.len() < needed {
                        let zero = Value::zero(&data.elem);
                        data.items.resize(needed, zero);
                    }
                }
                Value::Null => return Err(RuntimeError::NullAccess { what: "array access" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }

        OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Rem => {
            let nk = read_num_kind(chunk, pc)?;
            let b = pop(stack, at)?;
            let a = pop(stack, at)?;
            stack.push(arith(op, nk, a, b, at)?);
        }
        OpCode::Neg => {
            let nk = read_num_kind(chunk, pc)?;
            let value = pop(stack, at)?;
            if nk.is_float() {
                let x = float_of(&value, at)?;
                stack.push(match nk {
                    NumKind::F32 => Value::F32(-x as f32),
                    _ => Value::F64(-x),
                });
            } else {
                let x = int_of(nk, &value, at)?;
                stack.push(make_int(nk, x.wrapping_neg()));
            }
        }

        OpCode::CmpEq
        | OpCode::CmpNe
        | OpCode::CmpLt
        | OpCode::CmpLe
        | OpCode::CmpGt
        | OpCode::CmpGe => {
            let operand = read_u8(chunk, pc)?;
            let b = pop(stack, at)?;
            let a = pop(stack, at)?;
            stack.push(compare(op, operand, a, b, at)?);
        }
        OpCode::Not => {
            let value = pop(stack, at)?;
            match value {
                Value::Bool(v) => stack.push(Value::Bool(!v)),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }

        OpCode::Jump => {
            let distance = read_u16(chunk, pc)? as usize;
            *pc += distance;
        }
        OpCode::JumpBack => {
            let distance = read_u16(chunk, pc)? as usize;
            *pc = pc
                .checked_sub(distance)
                .ok_or(RuntimeError::CorruptUnit { at })?;
        }
        OpCode::JumpIfTrue | OpCode::JumpIfFalse => {
            let distance = read_u16(chunk, pc)? as usize;
            let value = pop(stack, at)?;
            let truth = match value {
                Value::Bool(v) => v,
                _ => return Err(RuntimeError::CorruptUnit { at }),
            };
            if truth == (op == OpCode::JumpIfTrue) {
                *pc += distance;
            }
        }
        OpCode::JumpIfNull | OpCode::JumpIfNotNull => {
            let distance = read_u16(chunk, pc)? as usize;
            let value = pop(stack, at)?;
            if value.is_null() == (op == OpCode::JumpIfNull) {
                *pc += distance;
            }
        }

        OpCode::EscapeNull => {
            let distance = read_u16(chunk, pc)? as usize;
            let top = stack.last().ok_or(RuntimeError::CorruptUnit { at })?;
            if top.is_null() {
                *pc += distance;
            }
        }
        OpCode::EscapeNothing => {
            let distance = read_u16(chunk, pc)? as usize;
            let top = stack.last_mut().ok_or(RuntimeError::CorruptUnit { at })?;
            match top {
                Value::Opt(None) => {
                    *top = Value::Null;
                    *pc += distance;
                }
                Value::Opt(Some(inner)) => {
                    let inner = (**inner).clone();
                    *top = inner;
                }
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::EscapeBounds => {
            let distance = read_u16(chunk, pc)? as usize;
            let len = stack.len();
            if len < 2 {
                return Err(RuntimeError::CorruptUnit { at });
            }
            let index = int_of(NumKind::I64, &stack[len - 1], at)?;
            if let Value::Array(arr) = &stack[len - 2] {
                let in_range = index >= 0 && (index as usize) < arr.borrow().items.len();
                if !in_range {
                    stack.truncate(len - 2);
                    stack.push(Value::Null);
                    *pc += distance;
                }
            }
            // A null array falls through to the unguarded access.
        }

        OpCode::CallFunc => {
            let argc = read_u8(chunk, pc)? as usize;
            if stack.len() < argc + 1 {
                return Err(RuntimeError::CorruptUnit { at });
            }
            let args = stack.split_off(stack.len() - argc);
            let callee = pop(stack, at)?;
            match callee {
                Value::Func(func) => stack.push(func.invoke(&args)?),
                Value::Null => return Err(RuntimeError::NullAccess { what: "call" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::Shim => {
            let unit = read_u16(chunk, pc)? as usize;
            let state = pop(stack, at)?;
            let signature = group
                .units
                .get(unit)
                .ok_or(RuntimeError::CorruptUnit { at })?
                .signature
                .clone();
            stack.push(Value::Func(Rc::new(ShimHandle {
                group: group.clone(),
                unit,
                state,
                signature,
            })));
        }
        OpCode::Return => {
            return Ok(Flow::Return(pop(stack, at)?));
        }
        OpCode::ReturnUnit => {
            return Ok(Flow::Return(Value::Unit));
        }

        OpCode::Conv | OpCode::ConvChecked => {
            let from = read_num_kind(chunk, pc)?;
            let to = read_num_kind(chunk, pc)?;
            let value = pop(stack, at)?;
            stack.push(convert(from, to, op == OpCode::ConvChecked, value, at)?);
        }

        OpCode::BoxValue => {
            let value = pop(stack, at)?;
            stack.push(Value::Boxed(Rc::new(value)));
        }
        OpCode::Unbox => {
            let index = read_u16(chunk, pc)? as usize;
            let expected = kind_at(group, index, at)?;
            let value = pop(stack, at)?;
            match value {
                Value::Boxed(inner) => {
                    if !inner.fits(&expected) {
                        return Err(RuntimeError::UnboxMismatch {
                            expected: expected.to_string(),
                            found: inner.to_string(),
                        });
                    }
                    stack.push((*inner).clone());
                }
                Value::Null => return Err(RuntimeError::NullAccess { what: "unbox" }),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::WrapOpt => {
            let value = pop(stack, at)?;
            stack.push(Value::Opt(Some(Box::new(value))));
        }
        OpCode::UnwrapOpt => {
            let value = pop(stack, at)?;
            match value {
                Value::Opt(Some(inner)) => stack.push(*inner),
                Value::Opt(None) => return Err(RuntimeError::AbsentValue),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }
        OpCode::HasValue => {
            let value = pop(stack, at)?;
            match value {
                Value::Opt(opt) => stack.push(Value::Bool(opt.is_some())),
                _ => return Err(RuntimeError::CorruptUnit { at }),
            }
        }

        OpCode::TypeTest => {
            let index = read_u16(chunk, pc)? as usize;
            let expect = kind_at(group, index, at)?;
            let value = pop(stack, at)?;
            stack.push(Value::Bool(!value.is_null() && value.fits(&expect)));
        }
        OpCode::Rethrow => {
            let error = pending
                .take()
                .ok_or(RuntimeError::CorruptUnit { at })?;
            return Err(error);
        }
    }
    Ok(Flow::Next)
}
