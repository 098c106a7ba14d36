//! Stack-machine operation codes.
//!
//! Each opcode is a single byte with operands following inline. The machine
//! is stack-based: operations pop operands and push results. Numeric
//! arithmetic and comparison carry a kind byte so that the verifier can
//! check operands against the encoded kind and the execution loop needs no
//! dynamic dispatch table.

use num_enum::{IntoPrimitive, TryFromPrimitive};

/// Bytecode operation codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, TryFromPrimitive)]
#[repr(u8)]
pub enum OpCode {
    // =========================================================================
    // Constants
    // =========================================================================
    /// Push constant from pool. Operand: u8 index.
    Const = 0,
    /// Push constant from pool. Operand: u16 index (big-endian).
    ConstW,
    /// Push the null reference.
    PushNull,
    /// Push the unit value.
    PushUnit,
    PushTrue,
    PushFalse,
    /// Push the absent optional.
    PushNothing,

    // =========================================================================
    // Stack
    // =========================================================================
    Pop,
    Dup,
    Swap,

    // =========================================================================
    // Frame slots
    // =========================================================================
    /// Load frame slot. Operand: u8 slot.
    GetLocal,
    /// Store frame slot. Operand: u8 slot.
    SetLocal,
    /// Load frame slot. Operand: u16 slot (big-endian).
    GetLocalW,
    /// Store frame slot. Operand: u16 slot (big-endian).
    SetLocalW,

    // =========================================================================
    // Records
    // =========================================================================
    /// Load field by index from a record ref. Operand: u16 field index.
    GetField,
    /// Store to field: pops (record, value). Operand: u16 field index.
    SetField,
    /// Fresh zero-filled record. Operand: u16 kind constant.
    NewRecord,

    // =========================================================================
    // Arrays
    // =========================================================================
    /// Fresh zero-filled array: pops i64 length. Operand: u16 kind constant.
    NewArray,
    /// Pops array, pushes i64 length.
    ArrayLen,
    /// Pops (array, i64 index), pushes element.
    ArrayGet,
    /// Pops (array, i64 index, value).
    ArraySet,
    /// Peeks (array, i64 index); grows the array to cover the index,
    /// zero-filling the gap. Stack unchanged.
    ArrayGrow,

    // =========================================================================
    // Arithmetic. Operand: u8 numeric kind.
    // =========================================================================
    Add,
    Sub,
    Mul,
    Div,
    Rem,
    Neg,

    // =========================================================================
    // Comparison. Operand: u8 comparand kind. Pushes bool.
    // =========================================================================
    CmpEq,
    CmpNe,
    CmpLt,
    CmpLe,
    CmpGt,
    CmpGe,
    /// Boolean not.
    Not,

    // =========================================================================
    // Branches. Operand: u16 offset (forward unless noted).
    // =========================================================================
    Jump,
    /// Backward jump: operand is a distance subtracted from the decode pc.
    JumpBack,
    /// Pops bool; jumps when true.
    JumpIfTrue,
    /// Pops bool; jumps when false.
    JumpIfFalse,
    /// Pops reference; jumps when null.
    JumpIfNull,
    /// Pops reference; jumps when non-null.
    JumpIfNotNull,

    // =========================================================================
    // Escape branches (null-propagation protocol). Operand: u16 offset.
    // =========================================================================
    /// Peeks a reference: when null, jumps leaving the null on the stack
    /// as the escape placeholder; otherwise falls through unchanged.
    EscapeNull,
    /// Peeks an optional: when absent, replaces it with a null placeholder
    /// and jumps; otherwise unwraps it in place and falls through.
    EscapeNothing,
    /// Peeks (array, i64 index): when out of range, pops both, pushes a
    /// null placeholder, and jumps; otherwise falls through unchanged.
    EscapeBounds,

    // =========================================================================
    // Calls
    // =========================================================================
    /// Invoke a callable handle: stack is [callee, arg0..argN-1].
    /// Operand: u8 argument count.
    CallFunc,
    /// Pops the state record (or null) and pushes a callable handle bound
    /// to a sibling unit. Operand: u16 unit index.
    Shim,
    Return,
    ReturnUnit,

    // =========================================================================
    // Conversions. Operands: u8 source kind, u8 target kind.
    // =========================================================================
    /// Unchecked numeric conversion (narrowing truncates).
    Conv,
    /// Checked numeric conversion (out-of-range raises at run time).
    ConvChecked,

    // =========================================================================
    // Boxing and optionals
    // =========================================================================
    /// Pops a value, pushes it boxed.
    BoxValue,
    /// Pops a boxed value, pushes the payload. Operand: u16 kind constant
    /// naming the expected payload kind; mismatch raises at run time.
    Unbox,
    /// Pops a value, pushes it wrapped as a present optional.
    WrapOpt,
    /// Pops an optional, pushes the payload; absent raises at run time.
    UnwrapOpt,
    /// Pops an optional, pushes whether it is present.
    HasValue,

    // =========================================================================
    // Type tests and exception regions
    // =========================================================================
    /// Pops a reference, pushes whether it is an instance of the kind.
    /// Operand: u16 kind constant. Null tests false.
    TypeTest,
    /// Resume unwinding the pending error out of a finally handler.
    Rethrow,
}

/// Comparand kind byte for the comparison opcodes: values `0..10` are the
/// numeric kinds in [`optree_core::NumKind`] order, then the extras below.
pub mod cmp_kind {
    /// Boolean equality.
    pub const BOOL: u8 = 10;
    /// Text equality (by contents).
    pub const STR: u8 = 11;
    /// Reference identity.
    pub const REF: u8 = 12;
}

impl OpCode {
    /// Mnemonic used in instruction traces.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            OpCode::Const => "const",
            OpCode::ConstW => "const.w",
            OpCode::PushNull => "push.null",
            OpCode::PushUnit => "push.unit",
            OpCode::PushTrue => "push.true",
            OpCode::PushFalse => "push.false",
            OpCode::PushNothing => "push.nothing",
            OpCode::Pop => "pop",
            OpCode::Dup => "dup",
            OpCode::Swap => "swap",
            OpCode::GetLocal => "ld.slot",
            OpCode::SetLocal => "st.slot",
            OpCode::GetLocalW => "ld.slot.w",
            OpCode::SetLocalW => "st.slot.w",
            OpCode::GetField => "ld.field",
            OpCode::SetField => "st.field",
            OpCode::NewRecord => "new.record",
            OpCode::NewArray => "new.array",
            OpCode::ArrayLen => "arr.len",
            OpCode::ArrayGet => "arr.get",
            OpCode::ArraySet => "arr.set",
            OpCode::ArrayGrow => "arr.grow",
            OpCode::Add => "add",
            OpCode::Sub => "sub",
            OpCode::Mul => "mul",
            OpCode::Div => "div",
            OpCode::Rem => "rem",
            OpCode::Neg => "neg",
            OpCode::CmpEq => "cmp.eq",
            OpCode::CmpNe => "cmp.ne",
            OpCode::CmpLt => "cmp.lt",
            OpCode::CmpLe => "cmp.le",
            OpCode::CmpGt => "cmp.gt",
            OpCode::CmpGe => "cmp.ge",
            OpCode::Not => "not",
            OpCode::Jump => "jmp",
            OpCode::JumpBack => "jmp.back",
            OpCode::JumpIfTrue => "jmp.true",
            OpCode::JumpIfFalse => "jmp.false",
            OpCode::JumpIfNull => "jmp.null",
            OpCode::JumpIfNotNull => "jmp.nonnull",
            OpCode::EscapeNull => "esc.null",
            OpCode::EscapeNothing => "esc.nothing",
            OpCode::EscapeBounds => "esc.bounds",
            OpCode::CallFunc => "call",
            OpCode::Shim => "shim",
            OpCode::Return => "ret",
            OpCode::ReturnUnit => "ret.unit",
            OpCode::Conv => "conv",
            OpCode::ConvChecked => "conv.ck",
            OpCode::BoxValue => "box",
            OpCode::Unbox => "unbox",
            OpCode::WrapOpt => "opt.wrap",
            OpCode::UnwrapOpt => "opt.unwrap",
            OpCode::HasValue => "opt.has",
            OpCode::TypeTest => "type.test",
            OpCode::Rethrow => "rethrow",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_round_trip() {
        let op = OpCode::ArrayGrow;
        let byte: u8 = op.into();
        assert_eq!(OpCode::try_from(byte), Ok(op));
    }

    #[test]
    fn unknown_byte_is_rejected() {
        assert!(OpCode::try_from(0xF0u8).is_err());
    }
}
