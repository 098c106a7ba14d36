//! The verifying emitter.
//!
//! A thin layer over raw instruction emission that simulates the operand
//! stack as a list of kind tags. Every emission call first validates that
//! the required operands are present and assignable, then records the
//! instruction and updates the simulated stack. Assignability follows the
//! merge rule of [`Kind::storage_compatible`]: reference kinds are mutually
//! assignable, primitive value kinds must match storage size, and opaque
//! user kinds require exact identity.
//!
//! Verification failures are defects in the emitting code above this layer.
//! They can never be caused by runtime input data, so every failure aborts
//! the compile with a descriptive [`VerifyError`].
//!
//! As a side effect, the emitter appends a human-readable instruction trace
//! annotated with the simulated stack after each instruction. The trace is
//! the unit's only inspectable artifact and carries no format stability
//! guarantee.

mod labels;

use std::fmt;
use std::sync::Arc;

use optree_core::{FuncKind, Kind, NumKind, RecordKind, VerifyError};

use crate::bytecode::{CodeChunk, Constant, ConstantPool, OpCode, Region, cmp_kind};

pub use labels::Label;
use labels::LabelTable;

// ============================================================================
// Simulated stack entries
// ============================================================================

/// One entry of the simulated stack.
#[derive(Debug, Clone, PartialEq)]
pub enum StackTag {
    /// A value of a known kind.
    Val(Kind),
    /// The null reference, assignable to every reference kind. Pushed by
    /// `push.null` and left on the stack as the escape-path placeholder.
    NullRef,
}

impl StackTag {
    fn fits(&self, kind: &Kind) -> bool {
        match self {
            StackTag::Val(k) => k.storage_compatible(kind),
            StackTag::NullRef => kind.is_reference(),
        }
    }

    fn merges_with(&self, other: &StackTag) -> bool {
        match (self, other) {
            (StackTag::NullRef, StackTag::NullRef) => true,
            (StackTag::NullRef, StackTag::Val(k)) | (StackTag::Val(k), StackTag::NullRef) => {
                k.is_reference()
            }
            (StackTag::Val(a), StackTag::Val(b)) => a.storage_compatible(b),
        }
    }
}

impl fmt::Display for StackTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StackTag::Val(kind) => write!(f, "{}", kind),
            StackTag::NullRef => f.write_str("null"),
        }
    }
}

/// Comparand kinds accepted by the comparison instructions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CmpOperand {
    Num(NumKind),
    Bool,
    Str,
    /// Reference identity.
    Ref,
}

impl CmpOperand {
    fn encode(&self) -> u8 {
        match self {
            CmpOperand::Num(nk) => *nk as u8,
            CmpOperand::Bool => cmp_kind::BOOL,
            CmpOperand::Str => cmp_kind::STR,
            CmpOperand::Ref => cmp_kind::REF,
        }
    }

    fn mnemonic(&self) -> String {
        match self {
            CmpOperand::Num(nk) => nk.mnemonic().to_string(),
            CmpOperand::Bool => "bool".to_string(),
            CmpOperand::Str => "str".to_string(),
            CmpOperand::Ref => "ref".to_string(),
        }
    }
}

type Result<T> = std::result::Result<T, VerifyError>;

// ============================================================================
// Emitter
// ============================================================================

/// Emits verified instructions for one unit.
///
/// Constants go to the compile-call-wide pool (deduplicated across units).
pub struct Emitter<'pool> {
    chunk: CodeChunk,
    constants: &'pool mut ConstantPool,
    labels: LabelTable,
    stack: Vec<StackTag>,
    /// Set after an unconditional branch or return; cleared by a mark.
    unreachable: bool,
    trace: Vec<String>,
}

impl<'pool> Emitter<'pool> {
    pub fn new(constants: &'pool mut ConstantPool) -> Self {
        Self {
            chunk: CodeChunk::new(),
            constants,
            labels: LabelTable::new(),
            stack: Vec::new(),
            unreachable: false,
            trace: Vec::new(),
        }
    }

    /// Current simulated stack depth.
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Current simulated stack contents (for handler shapes).
    pub fn stack_shape(&self) -> Vec<StackTag> {
        self.stack.clone()
    }

    /// Current code offset.
    pub fn current_offset(&self) -> usize {
        self.chunk.current_offset()
    }

    /// Whether the stream is currently unreachable (after an unconditional
    /// branch or return, before the next mark).
    pub fn is_unreachable(&self) -> bool {
        self.unreachable
    }

    // ------------------------------------------------------------------
    // Internal verification helpers
    // ------------------------------------------------------------------

    fn guard(&self, instr: &'static str) -> Result<()> {
        if self.unreachable {
            return Err(VerifyError::UnreachableCode { instr });
        }
        Ok(())
    }

    fn require(&self, needed: usize, instr: &'static str) -> Result<()> {
        if self.stack.len() < needed {
            return Err(VerifyError::StackUnderflow {
                instr,
                needed,
                depth: self.stack.len(),
            });
        }
        Ok(())
    }

    fn pop_fitting(&mut self, kind: &Kind, instr: &'static str) -> Result<StackTag> {
        self.require(1, instr)?;
        let tag = self.stack.pop().expect("depth checked");
        if !tag.fits(kind) {
            return Err(VerifyError::OperandMismatch {
                instr,
                expected: kind.to_string(),
                found: tag.to_string(),
            });
        }
        Ok(tag)
    }

    fn pop_any(&mut self, instr: &'static str) -> Result<StackTag> {
        self.require(1, instr)?;
        Ok(self.stack.pop().expect("depth checked"))
    }

    fn peek_fitting(&self, depth: usize, kind: &Kind, instr: &'static str) -> Result<&StackTag> {
        self.require(depth + 1, instr)?;
        let tag = &self.stack[self.stack.len() - 1 - depth];
        if !tag.fits(kind) {
            return Err(VerifyError::OperandMismatch {
                instr,
                expected: kind.to_string(),
                found: tag.to_string(),
            });
        }
        Ok(tag)
    }

    fn stack_text(stack: &[StackTag]) -> String {
        let parts: Vec<String> = stack.iter().map(|tag| tag.to_string()).collect();
        parts.join(", ")
    }

    fn note(&mut self, offset: usize, text: String) {
        self.trace.push(format!(
            "{:04}: {:<22} ;; [{}]",
            offset,
            text,
            Self::stack_text(&self.stack)
        ));
    }

    // ------------------------------------------------------------------
    // Constants and simple pushes
    // ------------------------------------------------------------------

    /// Emit a pooled-constant load. Returns the kind pushed.
    pub fn push_const(&mut self, constant: Constant) -> Result<Kind> {
        self.guard("const")?;
        let kind = match &constant {
            Constant::I8(_) => Kind::I8,
            Constant::I16(_) => Kind::I16,
            Constant::I32(_) => Kind::I32,
            Constant::I64(_) => Kind::I64,
            Constant::U8(_) => Kind::U8,
            Constant::U16(_) => Kind::U16,
            Constant::U32(_) => Kind::U32,
            Constant::U64(_) => Kind::U64,
            Constant::F32(_) => Kind::F32,
            Constant::F64(_) => Kind::F64,
            Constant::Str(_) => Kind::Str,
            Constant::Opaque { kind, .. } => Kind::Opaque(kind.clone()),
            Constant::Kind(_) => {
                return Err(VerifyError::OperandMismatch {
                    instr: "const",
                    expected: "a value constant".into(),
                    found: "a kind constant".into(),
                });
            }
        };
        let offset = self.chunk.current_offset();
        let index = self.constants.add(constant);
        if index < 256 {
            self.chunk.write_op(OpCode::Const);
            self.chunk.write_byte(index as u8);
        } else {
            self.chunk.write_op(OpCode::ConstW);
            self.chunk.write_u16(index as u16);
        }
        self.stack.push(StackTag::Val(kind.clone()));
        self.note(offset, format!("const {}", index));
        Ok(kind)
    }

    fn push_simple(&mut self, op: OpCode, tag: StackTag) -> Result<()> {
        self.guard(op.mnemonic())?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(op);
        self.stack.push(tag);
        self.note(offset, op.mnemonic().to_string());
        Ok(())
    }

    pub fn push_null(&mut self) -> Result<()> {
        self.push_simple(OpCode::PushNull, StackTag::NullRef)
    }

    pub fn push_unit(&mut self) -> Result<()> {
        self.push_simple(OpCode::PushUnit, StackTag::Val(Kind::Unit))
    }

    pub fn push_bool(&mut self, value: bool) -> Result<()> {
        let op = if value { OpCode::PushTrue } else { OpCode::PushFalse };
        self.push_simple(op, StackTag::Val(Kind::Bool))
    }

    /// Push the absent optional of the given optional kind.
    pub fn push_nothing(&mut self, kind: &Kind) -> Result<()> {
        if !matches!(kind, Kind::Opt(_)) {
            return Err(VerifyError::OperandMismatch {
                instr: "push.nothing",
                expected: "an optional kind".into(),
                found: kind.to_string(),
            });
        }
        self.push_simple(OpCode::PushNothing, StackTag::Val(kind.clone()))
    }

    // ------------------------------------------------------------------
    // Stack shuffles
    // ------------------------------------------------------------------

    pub fn pop(&mut self) -> Result<()> {
        self.guard("pop")?;
        self.pop_any("pop")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Pop);
        self.note(offset, "pop".to_string());
        Ok(())
    }

    pub fn dup(&mut self) -> Result<()> {
        self.guard("dup")?;
        self.require(1, "dup")?;
        let top = self.stack.last().expect("depth checked").clone();
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Dup);
        self.stack.push(top);
        self.note(offset, "dup".to_string());
        Ok(())
    }

    pub fn swap(&mut self) -> Result<()> {
        self.guard("swap")?;
        self.require(2, "swap")?;
        let len = self.stack.len();
        self.stack.swap(len - 1, len - 2);
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Swap);
        self.note(offset, "swap".to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Frame slots
    // ------------------------------------------------------------------

    /// Load a frame slot of a kind tracked by the emission context.
    pub fn load_slot(&mut self, slot: u32, kind: &Kind) -> Result<()> {
        self.guard("ld.slot")?;
        let offset = self.chunk.current_offset();
        if slot < 256 {
            self.chunk.write_op(OpCode::GetLocal);
            self.chunk.write_byte(slot as u8);
        } else {
            self.chunk.write_op(OpCode::GetLocalW);
            self.chunk.write_u16(slot as u16);
        }
        self.stack.push(StackTag::Val(kind.clone()));
        self.note(offset, format!("ld.slot {}", slot));
        Ok(())
    }

    /// Store the top of stack into a frame slot of the given kind.
    pub fn store_slot(&mut self, slot: u32, kind: &Kind) -> Result<()> {
        self.guard("st.slot")?;
        self.pop_fitting(kind, "st.slot")?;
        let offset = self.chunk.current_offset();
        if slot < 256 {
            self.chunk.write_op(OpCode::SetLocal);
            self.chunk.write_byte(slot as u8);
        } else {
            self.chunk.write_op(OpCode::SetLocalW);
            self.chunk.write_u16(slot as u16);
        }
        self.note(offset, format!("st.slot {}", slot));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Records
    // ------------------------------------------------------------------

    /// Load a field: pops a record reference, pushes the field's kind.
    pub fn get_field(&mut self, record: &Arc<RecordKind>, index: usize) -> Result<Kind> {
        self.guard("ld.field")?;
        let field_kind = match record.field(index) {
            Some(field) => field.kind.clone(),
            None => {
                return Err(VerifyError::OperandMismatch {
                    instr: "ld.field",
                    expected: format!("a field index below {}", record.fields.len()),
                    found: index.to_string(),
                });
            }
        };
        self.pop_fitting(&Kind::Record(record.clone()), "ld.field")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::GetField);
        self.chunk.write_u16(index as u16);
        self.stack.push(StackTag::Val(field_kind.clone()));
        self.note(offset, format!("ld.field {}", index));
        Ok(field_kind)
    }

    /// Store a field: pops (record, value).
    pub fn set_field(&mut self, record: &Arc<RecordKind>, index: usize) -> Result<()> {
        self.guard("st.field")?;
        let field_kind = match record.field(index) {
            Some(field) => field.kind.clone(),
            None => {
                return Err(VerifyError::OperandMismatch {
                    instr: "st.field",
                    expected: format!("a field index below {}", record.fields.len()),
                    found: index.to_string(),
                });
            }
        };
        self.pop_fitting(&field_kind, "st.field")?;
        self.pop_fitting(&Kind::Record(record.clone()), "st.field")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::SetField);
        self.chunk.write_u16(index as u16);
        self.note(offset, format!("st.field {}", index));
        Ok(())
    }

    /// Construct a fresh zero-filled record.
    pub fn new_record(&mut self, record: &Arc<RecordKind>) -> Result<()> {
        self.guard("new.record")?;
        let index = self.constants.add(Constant::Kind(Kind::Record(record.clone())));
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::NewRecord);
        self.chunk.write_u16(index as u16);
        self.stack.push(StackTag::Val(Kind::Record(record.clone())));
        self.note(offset, format!("new.record {}", record.name));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arrays
    // ------------------------------------------------------------------

    /// Construct a fresh zero-filled array: pops an i64 length.
    pub fn new_array(&mut self, elem: &Kind) -> Result<()> {
        self.guard("new.array")?;
        self.pop_fitting(&Kind::I64, "new.array")?;
        let index = self.constants.add(Constant::Kind(elem.clone()));
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::NewArray);
        self.chunk.write_u16(index as u16);
        self.stack.push(StackTag::Val(Kind::array(elem.clone())));
        self.note(offset, format!("new.array {}", elem));
        Ok(())
    }

    /// Pops an array reference, pushes its i64 length.
    pub fn array_len(&mut self, elem: &Kind) -> Result<()> {
        self.guard("arr.len")?;
        self.pop_fitting(&Kind::array(elem.clone()), "arr.len")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::ArrayLen);
        self.stack.push(StackTag::Val(Kind::I64));
        self.note(offset, "arr.len".to_string());
        Ok(())
    }

    /// Pops (array, i64 index), pushes the element.
    pub fn array_get(&mut self, elem: &Kind) -> Result<()> {
        self.guard("arr.get")?;
        self.pop_fitting(&Kind::I64, "arr.get")?;
        self.pop_fitting(&Kind::array(elem.clone()), "arr.get")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::ArrayGet);
        self.stack.push(StackTag::Val(elem.clone()));
        self.note(offset, "arr.get".to_string());
        Ok(())
    }

    /// Pops (array, i64 index, value).
    pub fn array_set(&mut self, elem: &Kind) -> Result<()> {
        self.guard("arr.set")?;
        self.pop_fitting(elem, "arr.set")?;
        self.pop_fitting(&Kind::I64, "arr.set")?;
        self.pop_fitting(&Kind::array(elem.clone()), "arr.set")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::ArraySet);
        self.note(offset, "arr.set".to_string());
        Ok(())
    }

    /// Peeks (array, i64 index); grows the array through the index.
    pub fn array_grow(&mut self, elem: &Kind) -> Result<()> {
        self.guard("arr.grow")?;
        self.peek_fitting(0, &Kind::I64, "arr.grow")?;
        self.peek_fitting(1, &Kind::array(elem.clone()), "arr.grow")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::ArrayGrow);
        self.note(offset, "arr.grow".to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Arithmetic and comparison
    // ------------------------------------------------------------------

    /// Binary arithmetic: pops two operands of the numeric kind, pushes one.
    pub fn arith(&mut self, op: OpCode, nk: NumKind) -> Result<()> {
        debug_assert!(matches!(
            op,
            OpCode::Add | OpCode::Sub | OpCode::Mul | OpCode::Div | OpCode::Rem
        ));
        self.guard("arith")?;
        let kind = Kind::from_numeric(nk);
        self.pop_fitting(&kind, "arith")?;
        self.pop_fitting(&kind, "arith")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(op);
        self.chunk.write_byte(nk as u8);
        self.stack.push(StackTag::Val(kind));
        self.note(offset, format!("{}.{}", op.mnemonic(), nk.mnemonic()));
        Ok(())
    }

    /// Numeric negation in place.
    pub fn neg(&mut self, nk: NumKind) -> Result<()> {
        self.guard("neg")?;
        let kind = Kind::from_numeric(nk);
        self.pop_fitting(&kind, "neg")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Neg);
        self.chunk.write_byte(nk as u8);
        self.stack.push(StackTag::Val(kind));
        self.note(offset, format!("neg.{}", nk.mnemonic()));
        Ok(())
    }

    /// Comparison: pops two comparands, pushes bool.
    pub fn compare(&mut self, op: OpCode, operand: CmpOperand) -> Result<()> {
        debug_assert!(matches!(
            op,
            OpCode::CmpEq
                | OpCode::CmpNe
                | OpCode::CmpLt
                | OpCode::CmpLe
                | OpCode::CmpGt
                | OpCode::CmpGe
        ));
        self.guard("cmp")?;
        match operand {
            CmpOperand::Num(nk) => {
                let kind = Kind::from_numeric(nk);
                self.pop_fitting(&kind, "cmp")?;
                self.pop_fitting(&kind, "cmp")?;
            }
            CmpOperand::Bool => {
                self.pop_fitting(&Kind::Bool, "cmp")?;
                self.pop_fitting(&Kind::Bool, "cmp")?;
            }
            CmpOperand::Str => {
                self.pop_fitting(&Kind::Str, "cmp")?;
                self.pop_fitting(&Kind::Str, "cmp")?;
            }
            CmpOperand::Ref => {
                for _ in 0..2 {
                    let tag = self.pop_any("cmp")?;
                    let is_ref = match &tag {
                        StackTag::NullRef => true,
                        StackTag::Val(k) => k.is_reference(),
                    };
                    if !is_ref {
                        return Err(VerifyError::OperandMismatch {
                            instr: "cmp",
                            expected: "a reference kind".into(),
                            found: tag.to_string(),
                        });
                    }
                }
            }
        }
        let offset = self.chunk.current_offset();
        self.chunk.write_op(op);
        self.chunk.write_byte(operand.encode());
        self.stack.push(StackTag::Val(Kind::Bool));
        self.note(offset, format!("{}.{}", op.mnemonic(), operand.mnemonic()));
        Ok(())
    }

    /// Boolean not in place.
    pub fn not(&mut self) -> Result<()> {
        self.guard("not")?;
        self.pop_fitting(&Kind::Bool, "not")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Not);
        self.stack.push(StackTag::Val(Kind::Bool));
        self.note(offset, "not".to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Labels and branches
    // ------------------------------------------------------------------

    pub fn new_label(&mut self, prefix: &str) -> Label {
        self.labels.create(prefix)
    }

    /// Fix the label's shape at first reference, or check against it.
    fn fix_or_check_shape(&mut self, label: Label, observed: &[StackTag]) -> Result<()> {
        let info = self.labels.get_mut(label);
        match &info.shape {
            None => {
                info.shape = Some(observed.to_vec());
                Ok(())
            }
            Some(expected) => {
                let matches = expected.len() == observed.len()
                    && expected
                        .iter()
                        .zip(observed.iter())
                        .all(|(a, b)| a.merges_with(b));
                if matches {
                    Ok(())
                } else {
                    Err(VerifyError::LabelShapeMismatch {
                        label: info.name.clone(),
                        expected: Self::stack_text(expected),
                        found: Self::stack_text(observed),
                    })
                }
            }
        }
    }

    fn emit_branch_site(&mut self, op: OpCode, label: Label, text: String) -> Result<()> {
        let offset = self.chunk.current_offset();
        if let Some(target) = self.labels.get(label).target {
            if op != OpCode::Jump {
                return Err(VerifyError::BackwardConditionalBranch {
                    label: self.labels.get(label).name.clone(),
                });
            }
            self.chunk.emit_jump_back(target);
        } else {
            let operand_at = self.chunk.emit_jump(op);
            self.labels.get_mut(label).patches.push(operand_at);
        }
        self.note(offset, text);
        Ok(())
    }

    /// Unconditional branch. The following code is unreachable.
    pub fn branch(&mut self, label: Label) -> Result<()> {
        self.guard("jmp")?;
        let shape = self.stack.clone();
        self.fix_or_check_shape(label, &shape)?;
        let name = self.labels.get(label).name.clone();
        self.emit_branch_site(OpCode::Jump, label, format!("jmp {}", name))?;
        self.unreachable = true;
        self.stack.clear();
        Ok(())
    }

    fn conditional_branch(&mut self, op: OpCode, label: Label) -> Result<()> {
        let shape = self.stack.clone();
        self.fix_or_check_shape(label, &shape)?;
        let name = self.labels.get(label).name.clone();
        self.emit_branch_site(op, label, format!("{} {}", op.mnemonic(), name))
    }

    /// Pops a bool; branches when true.
    pub fn branch_if_true(&mut self, label: Label) -> Result<()> {
        self.guard("jmp.true")?;
        self.pop_fitting(&Kind::Bool, "jmp.true")?;
        self.conditional_branch(OpCode::JumpIfTrue, label)
    }

    /// Pops a bool; branches when false.
    pub fn branch_if_false(&mut self, label: Label) -> Result<()> {
        self.guard("jmp.false")?;
        self.pop_fitting(&Kind::Bool, "jmp.false")?;
        self.conditional_branch(OpCode::JumpIfFalse, label)
    }

    fn pop_reference(&mut self, instr: &'static str) -> Result<StackTag> {
        let tag = self.pop_any(instr)?;
        let is_ref = match &tag {
            StackTag::NullRef => true,
            StackTag::Val(k) => k.is_reference(),
        };
        if !is_ref {
            return Err(VerifyError::OperandMismatch {
                instr,
                expected: "a reference kind".into(),
                found: tag.to_string(),
            });
        }
        Ok(tag)
    }

    /// Pops a reference; branches when null.
    pub fn branch_if_null(&mut self, label: Label) -> Result<()> {
        self.guard("jmp.null")?;
        self.pop_reference("jmp.null")?;
        self.conditional_branch(OpCode::JumpIfNull, label)
    }

    /// Pops a reference; branches when non-null.
    pub fn branch_if_not_null(&mut self, label: Label) -> Result<()> {
        self.guard("jmp.nonnull")?;
        self.pop_reference("jmp.nonnull")?;
        self.conditional_branch(OpCode::JumpIfNotNull, label)
    }

    /// Escape branch: peeks a reference; when null at run time, jumps with
    /// the null left on the stack as the placeholder.
    pub fn escape_null(&mut self, label: Label) -> Result<()> {
        self.guard("esc.null")?;
        self.require(1, "esc.null")?;
        let top = self.stack.last().expect("depth checked");
        let is_ref = match top {
            StackTag::NullRef => true,
            StackTag::Val(k) => k.is_reference(),
        };
        if !is_ref {
            return Err(VerifyError::OperandMismatch {
                instr: "esc.null",
                expected: "a reference kind".into(),
                found: top.to_string(),
            });
        }
        let mut branch_shape = self.stack.clone();
        *branch_shape.last_mut().expect("depth checked") = StackTag::NullRef;
        self.fix_or_check_shape(label, &branch_shape)?;
        let name = self.labels.get(label).name.clone();
        self.emit_branch_site(OpCode::EscapeNull, label, format!("esc.null {}", name))
    }

    /// Escape branch for optionals: when absent at run time, replaces the
    /// optional with a null placeholder and jumps; otherwise unwraps it in
    /// place. Returns the unwrapped kind on the fall-through path.
    pub fn escape_nothing(&mut self, label: Label) -> Result<Kind> {
        self.guard("esc.nothing")?;
        self.require(1, "esc.nothing")?;
        let inner = match self.stack.last().expect("depth checked") {
            StackTag::Val(Kind::Opt(inner)) => (**inner).clone(),
            other => {
                return Err(VerifyError::OperandMismatch {
                    instr: "esc.nothing",
                    expected: "an optional kind".into(),
                    found: other.to_string(),
                });
            }
        };
        let mut branch_shape = self.stack.clone();
        *branch_shape.last_mut().expect("depth checked") = StackTag::NullRef;
        self.fix_or_check_shape(label, &branch_shape)?;
        let name = self.labels.get(label).name.clone();
        self.emit_branch_site(OpCode::EscapeNothing, label, format!("esc.nothing {}", name))?;
        *self.stack.last_mut().expect("depth checked") = StackTag::Val(inner.clone());
        Ok(inner)
    }

    /// Escape branch for bounds: peeks (array, i64 index); when out of range
    /// at run time, pops both, pushes a null placeholder, and jumps.
    pub fn escape_bounds(&mut self, label: Label, elem: &Kind) -> Result<()> {
        self.guard("esc.bounds")?;
        self.peek_fitting(0, &Kind::I64, "esc.bounds")?;
        self.peek_fitting(1, &Kind::array(elem.clone()), "esc.bounds")?;
        let mut branch_shape = self.stack.clone();
        branch_shape.truncate(branch_shape.len() - 2);
        branch_shape.push(StackTag::NullRef);
        self.fix_or_check_shape(label, &branch_shape)?;
        let name = self.labels.get(label).name.clone();
        self.emit_branch_site(OpCode::EscapeBounds, label, format!("esc.bounds {}", name))
    }

    /// Mark the label at the current offset, patching forward references.
    ///
    /// When the preceding instruction ended the reachable stream, the
    /// simulated stack is re-established from the label's fixed shape.
    pub fn mark(&mut self, label: Label) -> Result<()> {
        if self.labels.get(label).target.is_some() {
            return Err(VerifyError::DuplicateMark {
                label: self.labels.get(label).name.clone(),
            });
        }
        let offset = self.chunk.current_offset();
        if self.unreachable {
            let shape = match &self.labels.get(label).shape {
                Some(shape) => shape.clone(),
                None => return Err(VerifyError::UnreachableCode { instr: "mark" }),
            };
            self.stack = shape;
            self.unreachable = false;
        } else {
            let shape = self.stack.clone();
            self.fix_or_check_shape(label, &shape)?;
        }
        let info = self.labels.get_mut(label);
        info.target = Some(offset);
        let patches = std::mem::take(&mut info.patches);
        let name = info.name.clone();
        for operand_at in patches {
            self.chunk.patch_jump(operand_at);
        }
        self.note(offset, format!("{}:", name));
        Ok(())
    }

    // ------------------------------------------------------------------
    // Calls, shims, returns
    // ------------------------------------------------------------------

    /// Invoke a callable handle: stack is [callee, args...].
    pub fn call_func(&mut self, func: &Arc<FuncKind>) -> Result<Kind> {
        self.guard("call")?;
        let argc = func.params.len();
        self.require(argc + 1, "call")?;
        // Arguments were pushed in order: arg i sits argc-1-i below the top.
        for (i, param) in func.params.iter().enumerate() {
            self.peek_fitting(argc - 1 - i, param, "call")?;
        }
        self.peek_fitting(argc, &Kind::Func(func.clone()), "call")?;
        self.stack.truncate(self.stack.len() - argc - 1);
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::CallFunc);
        self.chunk.write_byte(argc as u8);
        self.stack.push(StackTag::Val(func.ret.clone()));
        self.note(offset, format!("call {}", argc));
        Ok(func.ret.clone())
    }

    /// Bind a sibling unit into a callable handle: pops the state record.
    pub fn shim(&mut self, unit: usize, func: &Arc<FuncKind>) -> Result<()> {
        self.guard("shim")?;
        self.pop_reference("shim")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Shim);
        self.chunk.write_u16(unit as u16);
        self.stack.push(StackTag::Val(Kind::Func(func.clone())));
        self.note(offset, format!("shim {}", unit));
        Ok(())
    }

    /// Return the top of stack. The stack must be empty afterwards.
    pub fn ret(&mut self, kind: &Kind) -> Result<()> {
        self.guard("ret")?;
        self.pop_fitting(kind, "ret")?;
        if !self.stack.is_empty() {
            return Err(VerifyError::UnbalancedStack {
                depth: self.stack.len(),
            });
        }
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Return);
        self.note(offset, "ret".to_string());
        self.unreachable = true;
        Ok(())
    }

    /// Return unit with nothing on the stack.
    pub fn ret_unit(&mut self) -> Result<()> {
        self.guard("ret.unit")?;
        if !self.stack.is_empty() {
            return Err(VerifyError::UnbalancedStack {
                depth: self.stack.len(),
            });
        }
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::ReturnUnit);
        self.note(offset, "ret.unit".to_string());
        self.unreachable = true;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Conversions, boxing, optionals
    // ------------------------------------------------------------------

    /// Numeric conversion. Checked narrowing raises at run time on
    /// out-of-range values; unchecked truncates.
    pub fn conv(&mut self, from: NumKind, to: NumKind, checked: bool) -> Result<()> {
        self.guard("conv")?;
        self.pop_fitting(&Kind::from_numeric(from), "conv")?;
        let offset = self.chunk.current_offset();
        self.chunk
            .write_op(if checked { OpCode::ConvChecked } else { OpCode::Conv });
        self.chunk.write_byte(from as u8);
        self.chunk.write_byte(to as u8);
        self.stack.push(StackTag::Val(Kind::from_numeric(to)));
        self.note(
            offset,
            format!(
                "{} {}->{}",
                if checked { "conv.ck" } else { "conv" },
                from.mnemonic(),
                to.mnemonic()
            ),
        );
        Ok(())
    }

    /// Box the top value kind into a reference shell.
    pub fn box_value(&mut self) -> Result<Kind> {
        self.guard("box")?;
        let tag = self.pop_any("box")?;
        let inner = match tag {
            StackTag::Val(kind) if !kind.is_reference() && kind != Kind::Unit => kind,
            other => {
                return Err(VerifyError::OperandMismatch {
                    instr: "box",
                    expected: "a value kind".into(),
                    found: other.to_string(),
                });
            }
        };
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::BoxValue);
        let boxed = Kind::boxed(inner);
        self.stack.push(StackTag::Val(boxed.clone()));
        self.note(offset, "box".to_string());
        Ok(boxed)
    }

    /// Unbox into the expected payload kind; mismatch raises at run time.
    pub fn unbox(&mut self, expected: &Kind) -> Result<()> {
        self.guard("unbox")?;
        self.pop_fitting(&Kind::boxed(expected.clone()), "unbox")?;
        let index = self.constants.add(Constant::Kind(expected.clone()));
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Unbox);
        self.chunk.write_u16(index as u16);
        self.stack.push(StackTag::Val(expected.clone()));
        self.note(offset, format!("unbox {}", expected));
        Ok(())
    }

    /// Wrap the top of stack as a present optional.
    pub fn wrap_opt(&mut self) -> Result<Kind> {
        self.guard("opt.wrap")?;
        let tag = self.pop_any("opt.wrap")?;
        let inner = match tag {
            StackTag::Val(kind) => kind,
            StackTag::NullRef => {
                return Err(VerifyError::OperandMismatch {
                    instr: "opt.wrap",
                    expected: "a value of known kind".into(),
                    found: "null".into(),
                });
            }
        };
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::WrapOpt);
        let wrapped = Kind::opt(inner);
        self.stack.push(StackTag::Val(wrapped.clone()));
        self.note(offset, "opt.wrap".to_string());
        Ok(wrapped)
    }

    /// Unwrap an optional; absent raises at run time.
    pub fn unwrap_opt(&mut self) -> Result<Kind> {
        self.guard("opt.unwrap")?;
        let tag = self.pop_any("opt.unwrap")?;
        let inner = match tag {
            StackTag::Val(Kind::Opt(inner)) => inner.as_ref().clone(),
            other => {
                return Err(VerifyError::OperandMismatch {
                    instr: "opt.unwrap",
                    expected: "an optional kind".into(),
                    found: other.to_string(),
                });
            }
        };
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::UnwrapOpt);
        self.stack.push(StackTag::Val(inner.clone()));
        self.note(offset, "opt.unwrap".to_string());
        Ok(inner)
    }

    /// Pops an optional, pushes whether it is present.
    pub fn has_value(&mut self) -> Result<()> {
        self.guard("opt.has")?;
        let tag = self.pop_any("opt.has")?;
        if !matches!(tag, StackTag::Val(Kind::Opt(_))) {
            return Err(VerifyError::OperandMismatch {
                instr: "opt.has",
                expected: "an optional kind".into(),
                found: tag.to_string(),
            });
        }
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::HasValue);
        self.stack.push(StackTag::Val(Kind::Bool));
        self.note(offset, "opt.has".to_string());
        Ok(())
    }

    // ------------------------------------------------------------------
    // Type tests and regions
    // ------------------------------------------------------------------

    /// Runtime kind test on a reference; pops it, pushes bool.
    pub fn type_test(&mut self, expect: &Kind) -> Result<()> {
        self.guard("type.test")?;
        self.pop_reference("type.test")?;
        let index = self.constants.add(Constant::Kind(expect.clone()));
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::TypeTest);
        self.chunk.write_u16(index as u16);
        self.stack.push(StackTag::Val(Kind::Bool));
        self.note(offset, format!("type.test {}", expect));
        Ok(())
    }

    /// Resume unwinding out of a finally handler. Values below the handler
    /// are discarded by the unwinder, so the stack may be non-empty.
    pub fn rethrow(&mut self) -> Result<()> {
        self.guard("rethrow")?;
        let offset = self.chunk.current_offset();
        self.chunk.write_op(OpCode::Rethrow);
        self.note(offset, "rethrow".to_string());
        self.unreachable = true;
        self.stack.clear();
        Ok(())
    }

    /// Begin an error-handler block: re-establishes the given simulated
    /// stack at the current (unreachable) offset. Returns the handler pc.
    pub fn begin_handler(&mut self, shape: Vec<StackTag>) -> Result<usize> {
        if !self.unreachable {
            return Err(VerifyError::UnreachableCode {
                instr: "handler",
            });
        }
        let offset = self.chunk.current_offset();
        self.stack = shape;
        self.unreachable = false;
        self.note(offset, "handler:".to_string());
        Ok(offset)
    }

    /// Record a protected region for the machine's unwinder.
    pub fn add_region(&mut self, region: Region) {
        self.chunk.add_region(region);
    }

    // ------------------------------------------------------------------
    // Finalization
    // ------------------------------------------------------------------

    /// Finish the unit: every referenced label must be marked and the
    /// stream must have ended with a return.
    pub fn finish(self) -> Result<(CodeChunk, Vec<String>)> {
        if let Some(info) = self.labels.first_unmarked() {
            return Err(VerifyError::UnmarkedLabel {
                label: info.name.clone(),
            });
        }
        if !self.unreachable {
            return Err(VerifyError::UnbalancedStack {
                depth: self.stack.len(),
            });
        }
        Ok((self.chunk, self.trace))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optree_core::Field;

    fn pool() -> ConstantPool {
        ConstantPool::new()
    }

    #[test]
    fn arithmetic_updates_the_simulated_stack() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I64(2)).unwrap();
        em.push_const(Constant::I64(3)).unwrap();
        em.arith(OpCode::Add, NumKind::I64).unwrap();
        assert_eq!(em.stack_depth(), 1);
        em.ret(&Kind::I64).unwrap();
        let (chunk, trace) = em.finish().unwrap();
        assert!(chunk.len() > 0);
        assert!(trace.iter().any(|line| line.contains("add.i64")));
        assert!(trace.iter().any(|line| line.contains("[i64, i64]")));
    }

    #[test]
    fn arith_with_one_operand_underflows() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I64(2)).unwrap();
        let err = em.arith(OpCode::Add, NumKind::I64).unwrap_err();
        assert!(matches!(err, VerifyError::StackUnderflow { .. }));
    }

    #[test]
    fn arith_kind_mismatch_is_rejected() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I64(2)).unwrap();
        em.push_const(Constant::F64(1.0)).unwrap();
        let err = em.arith(OpCode::Add, NumKind::I64).unwrap_err();
        assert!(matches!(err, VerifyError::OperandMismatch { .. }));
    }

    #[test]
    fn same_storage_size_operands_are_accepted() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::U32(2)).unwrap();
        em.push_const(Constant::I32(3)).unwrap();
        em.arith(OpCode::Add, NumKind::I32).unwrap();
    }

    #[test]
    fn label_shape_fixed_at_first_reference() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let join = em.new_label("join");

        em.push_const(Constant::I32(1)).unwrap();
        em.branch(join).unwrap(); // Fixes shape [i32].

        em.mark(join).unwrap();
        em.ret(&Kind::I32).unwrap();
        em.finish().unwrap();
    }

    #[test]
    fn mismatched_label_shapes_are_fatal() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let join = em.new_label("join");

        // First branch sees [i32].
        em.push_const(Constant::I32(1)).unwrap();
        em.push_bool(true).unwrap();
        em.branch_if_true(join).unwrap();

        // Second reference sees [i32, i64]: must fail naming the label.
        em.push_const(Constant::I64(2)).unwrap();
        let err = em.branch(join).unwrap_err();
        match err {
            VerifyError::LabelShapeMismatch { label, .. } => {
                assert!(label.starts_with("join#"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn unmarked_label_fails_finish() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let dangling = em.new_label("join");
        em.push_bool(true).unwrap();
        em.branch_if_true(dangling).unwrap();
        em.ret_unit().unwrap();
        assert!(matches!(
            em.finish(),
            Err(VerifyError::UnmarkedLabel { .. })
        ));
    }

    #[test]
    fn emission_after_return_is_unreachable() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I32(1)).unwrap();
        em.ret(&Kind::I32).unwrap();
        let err = em.push_bool(true).unwrap_err();
        assert!(matches!(err, VerifyError::UnreachableCode { .. }));
    }

    #[test]
    fn escape_null_fixes_placeholder_shape() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let rec = RecordKind::new(
            "Holder",
            vec![Field {
                name: "n".into(),
                kind: Kind::I64,
            }],
        );
        let escape = em.new_label("escape");
        let done = em.new_label("done");

        em.load_slot(1, &Kind::Record(rec.clone())).unwrap();
        em.escape_null(escape).unwrap();
        em.get_field(&rec, 0).unwrap();
        em.branch(done).unwrap();

        em.mark(escape).unwrap(); // Shape: [null]
        em.pop().unwrap();
        em.push_const(Constant::I64(0)).unwrap();
        em.branch(done).unwrap();

        em.mark(done).unwrap();
        em.ret(&Kind::I64).unwrap();
        em.finish().unwrap();
    }

    #[test]
    fn ret_with_residue_is_unbalanced() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I32(1)).unwrap();
        em.push_const(Constant::I32(2)).unwrap();
        let err = em.ret(&Kind::I32).unwrap_err();
        assert!(matches!(err, VerifyError::UnbalancedStack { depth: 1 }));
    }

    #[test]
    fn trace_is_stack_annotated() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        em.push_const(Constant::I32(7)).unwrap();
        em.push_const(Constant::Str(Arc::from("x"))).unwrap();
        em.pop().unwrap();
        em.ret(&Kind::I32).unwrap();
        let (_, trace) = em.finish().unwrap();
        assert!(trace[1].contains("[i32, str]"));
        assert!(trace[2].contains("[i32]"));
    }

    #[test]
    fn call_checks_callee_and_arguments() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let func = FuncKind::new(vec![Kind::I64], Kind::I64);

        em.load_slot(0, &Kind::Func(func.clone())).unwrap();
        em.push_const(Constant::I64(1)).unwrap();
        em.call_func(&func).unwrap();
        assert_eq!(em.stack_depth(), 1);
        em.ret(&Kind::I64).unwrap();
        em.finish().unwrap();
    }

    #[test]
    fn call_rejects_bad_argument_kind() {
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let func = FuncKind::new(vec![Kind::I64], Kind::I64);

        em.load_slot(0, &Kind::Func(func.clone())).unwrap();
        em.push_bool(true).unwrap();
        let err = em.call_func(&func).unwrap_err();
        assert!(matches!(err, VerifyError::OperandMismatch { .. }));
    }

    #[test]
    fn opaque_kinds_merge_by_identity_only() {
        use optree_core::OpaqueKind;
        let mut constants = pool();
        let mut em = Emitter::new(&mut constants);
        let join = em.new_label("join");
        let money = OpaqueKind::new("money");
        let weight = OpaqueKind::new("weight");

        // First reference fixes the shape as [money].
        em.push_const(Constant::Opaque {
            kind: money,
            bits: 5,
        })
        .unwrap();
        em.push_bool(true).unwrap();
        em.branch_if_true(join).unwrap();
        em.pop().unwrap();

        // Same storage width, different identity: must not merge.
        em.push_const(Constant::Opaque {
            kind: weight,
            bits: 5,
        })
        .unwrap();
        let err = em.branch(join).unwrap_err();
        assert!(matches!(err, VerifyError::LabelShapeMismatch { .. }));
    }
}
