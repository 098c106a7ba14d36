//! Error taxonomy for compilation and execution.
//!
//! Three families:
//!
//! - [`VerifyError`]: the simulated stack caught a malformed emission
//!   sequence. Always a defect in the emitting code, never caused by
//!   runtime input data.
//! - [`CompileError`]: the input tree uses an unsupported construct or has
//!   incompatible shapes. Raised at the offending node.
//! - [`RuntimeError`]: a compiled unit failed at execution time (null
//!   access with checking disabled, checked-conversion overflow, and so on).

use thiserror::Error;

/// Errors raised by the verifying emitter's simulated stack.
///
/// Every variant is fatal and unrecoverable: these indicate a defect in an
/// emitter above the verification layer, so the only policy is immediate
/// abort with a descriptive message.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum VerifyError {
    /// An instruction needed more operands than the simulated stack holds.
    #[error("'{instr}' needs {needed} operand(s), simulated stack has {depth}")]
    StackUnderflow {
        instr: &'static str,
        needed: usize,
        depth: usize,
    },

    /// An operand on the simulated stack has the wrong kind.
    #[error("'{instr}' expected {expected}, found {found} on the simulated stack")]
    OperandMismatch {
        instr: &'static str,
        expected: String,
        found: String,
    },

    /// Two references to the same label observed different stack shapes.
    #[error("label '{label}': stack shape [{found}] does not match the shape [{expected}] fixed at first reference")]
    LabelShapeMismatch {
        label: String,
        expected: String,
        found: String,
    },

    /// A label was referenced but never marked before the unit finished.
    #[error("label '{label}' referenced but never marked")]
    UnmarkedLabel { label: String },

    /// A label was marked twice.
    #[error("label '{label}' marked twice")]
    DuplicateMark { label: String },

    /// A conditional branch targeted an already-marked label. Only
    /// unconditional branches may jump backward.
    #[error("conditional branch to already-marked label '{label}'")]
    BackwardConditionalBranch { label: String },

    /// Emission continued after an unconditional branch or return without an
    /// intervening label to re-establish a stack shape.
    #[error("'{instr}' emitted into unreachable code (no label after unconditional branch)")]
    UnreachableCode { instr: &'static str },

    /// A unit finished with values left on the simulated stack.
    #[error("unit finished with {depth} value(s) left on the simulated stack")]
    UnbalancedStack { depth: usize },
}

/// Errors raised while lowering an operation tree.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum CompileError {
    /// A construct outside the supported set, named explicitly.
    #[error("unsupported construct: {what}")]
    Unsupported { what: String },

    /// A member access named a field the record kind does not have.
    #[error("unknown member '{member}' on kind '{on}'")]
    UnknownMember { member: String, on: String },

    /// Two sub-results that must agree have incompatible kinds.
    #[error("{context}: '{left}' is not storage-compatible with '{right}'")]
    ShapeMismatch {
        context: &'static str,
        left: String,
        right: String,
    },

    /// The target of an assignment is not an assignable place.
    #[error("node kind '{target}' is not assignable")]
    NotAssignable { target: &'static str },

    /// A parameter reference is not bound in the unit being compiled.
    #[error("parameter '{name}' is not declared by the lambda under compilation")]
    UnboundParam { name: String },

    /// A local reference outside any declaring block.
    #[error("local '{name}' referenced outside its declaring block")]
    UnboundLocal { name: String },

    /// A goto targeting a label with no enclosing definition.
    #[error("goto targets label '{name}' with no enclosing definition")]
    UnboundLabel { name: String },

    /// A call whose argument list does not fit the callee's kind.
    #[error("call expects {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// No entry in the conversion matrix for this kind pair.
    #[error("no conversion from '{from}' to '{to}'")]
    UnsupportedConversion { from: String, to: String },

    /// The verifying emitter rejected an emission sequence.
    #[error(transparent)]
    Verify(#[from] VerifyError),
}

/// Errors raised while executing a compiled unit.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum RuntimeError {
    /// Null reference dereferenced with null checking disabled.
    #[error("null reference in {what}")]
    NullAccess { what: &'static str },

    /// Array index outside the current length, with bounds checking disabled.
    #[error("index {index} out of range for array of length {len}")]
    IndexOutOfRange { index: i64, len: usize },

    /// A checked numeric conversion observed an out-of-range value.
    #[error("checked conversion from {from} to {to} overflowed on value {value}")]
    Overflow {
        from: &'static str,
        to: &'static str,
        value: String,
    },

    /// An optional value was unwrapped while absent.
    #[error("absent optional value unwrapped")]
    AbsentValue,

    /// An unbox observed a different kind than expected.
    #[error("unbox expected '{expected}', found '{found}'")]
    UnboxMismatch { expected: String, found: String },

    /// Integer division or remainder by zero.
    #[error("integer division by zero")]
    DivideByZero,

    /// Invocation with the wrong number of arguments.
    #[error("callable expects {expected} argument(s), got {got}")]
    ArityMismatch { expected: usize, got: usize },

    /// Invocation with an argument of the wrong kind.
    #[error("argument {index} does not fit kind '{expected}'")]
    ArgumentKind { index: usize, expected: String },

    /// The decoder hit a malformed instruction stream. Always a defect.
    #[error("corrupt instruction stream at offset {at}")]
    CorruptUnit { at: usize },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_error_messages_name_the_label() {
        let err = VerifyError::LabelShapeMismatch {
            label: "escape#3".into(),
            expected: "i32, str".into(),
            found: "i32".into(),
        };
        let text = err.to_string();
        assert!(text.contains("escape#3"));
        assert!(text.contains("[i32]"));
    }

    #[test]
    fn compile_error_wraps_verify() {
        let err: CompileError = VerifyError::UnbalancedStack { depth: 2 }.into();
        assert!(matches!(err, CompileError::Verify(_)));
    }

    #[test]
    fn unsupported_names_the_construct() {
        let err = CompileError::Unsupported {
            what: "member kind 'length' on record".into(),
        };
        assert!(err.to_string().contains("length"));
    }
}
