//! Per-node-kind emitters.
//!
//! Every emitter shares one recursive contract: it receives the optional
//! escape label threaded through the enclosing chain, the requested result
//! shape, and the extend flag, and reports the kind it produced plus
//! whether it referenced the escape label. Dispatch is a closed exhaustive
//! match; the supported node set is fixed.

pub mod assignment;
pub mod binary;
pub mod block;
pub mod calls;
pub mod cast;
pub mod conditional;
pub mod construct;
pub mod identifiers;
pub mod labels;
pub mod lambda;
pub mod literals;
pub mod member;
pub mod try_region;
pub mod type_test;
pub mod unary;

use std::sync::Arc;

use optree_core::{CompileError, Kind, LambdaNode, Node, RecordKind};

use crate::bytecode::{Constant, ConstantPool};
use crate::context::{EmitContext, UnitBindings};
use crate::emit::{Emitter, Label};

pub(crate) type Result<T> = std::result::Result<T, CompileError>;

// ============================================================================
// Emission contract
// ============================================================================

/// How a node's result is requested.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResultShape {
    /// Push the value.
    Value,
    /// Leave a store target on the stack (record ref, or array ref plus
    /// index) and report it as a [`Place`].
    Address,
    /// Address when the kind is a value kind; reference kinds degrade to
    /// by-value.
    AddressIfValueKind,
}

/// A store target left on the stack by an `Address`-shaped emission.
#[derive(Debug, Clone)]
pub enum Place {
    /// `[record]` on the stack; store with `st.field`.
    Field {
        record: Arc<RecordKind>,
        index: usize,
    },
    /// `[array, index]` on the stack; store with `arr.set`.
    Element { elem: Kind },
}

/// What an emission produced.
#[derive(Debug, Clone)]
pub struct Emitted {
    /// Static kind of the result.
    pub kind: Kind,
    /// Whether the escape label was referenced (the chain epilogue is
    /// needed).
    pub used_escape: bool,
    /// Store target, for `Address`-shaped emissions.
    pub place: Option<Place>,
}

impl Emitted {
    pub fn value(kind: Kind) -> Self {
        Self {
            kind,
            used_escape: false,
            place: None,
        }
    }
}

// ============================================================================
// Unit compiler
// ============================================================================

/// Compiles one lambda body into one unit's instruction stream.
pub struct UnitCompiler<'ctx, 'pool> {
    pub ctx: &'ctx mut EmitContext,
    pub em: Emitter<'pool>,
    pub bindings: UnitBindings,
    lambda: Arc<LambdaNode>,
}

impl<'ctx, 'pool> UnitCompiler<'ctx, 'pool> {
    pub fn new(
        ctx: &'ctx mut EmitContext,
        constants: &'pool mut ConstantPool,
        lambda: Arc<LambdaNode>,
    ) -> Self {
        let bindings = UnitBindings::for_unit(ctx.state_param.as_ref(), &lambda.params);
        Self {
            ctx,
            em: Emitter::new(constants),
            bindings,
            lambda,
        }
    }

    pub fn lambda(&self) -> &Arc<LambdaNode> {
        &self.lambda
    }

    /// Emit the whole body and the return, and finish verification.
    ///
    /// Returns the chunk, the frame size, and the instruction trace.
    pub fn compile(mut self) -> Result<(crate::bytecode::CodeChunk, u32, Vec<String>)> {
        let lambda = self.lambda.clone();
        let out = self.emit_value(&lambda.body)?;
        if !self.em.is_unreachable() {
            if lambda.ret == Kind::Unit {
                if out.kind != Kind::Unit {
                    self.em.pop()?;
                    self.em.push_unit()?;
                }
                self.em.ret(&Kind::Unit)?;
            } else {
                let converted = self.reconcile(&out.kind, &lambda.ret)?;
                if !converted {
                    return Err(CompileError::ShapeMismatch {
                        context: "return value",
                        left: out.kind.to_string(),
                        right: lambda.ret.to_string(),
                    });
                }
                self.em.ret(&lambda.ret)?;
            }
        }
        let frame_size = self.bindings.pool.frame_size();
        let (chunk, trace) = self.em.finish()?;
        Ok((chunk, frame_size, trace))
    }

    // ------------------------------------------------------------------
    // Dispatch
    // ------------------------------------------------------------------

    /// The uniform recursive emitter entry point.
    pub fn emit(
        &mut self,
        node: &Node,
        escape: Option<Label>,
        shape: ResultShape,
        extend: bool,
    ) -> Result<Emitted> {
        match node {
            Node::Param(param) => identifiers::emit_param(self, param),
            Node::Local(local) => identifiers::emit_local(self, local),
            Node::Const { value, kind } => literals::emit_const(self, value, kind),
            Node::Member { object, member } => {
                member::emit_member(self, object, member, escape, shape, extend)
            }
            Node::Index { array, index } => {
                member::emit_index(self, array, index, escape, shape, extend)
            }
            Node::Call { callee, args } => calls::emit_call(self, callee, args, escape),
            Node::Binary { op, lhs, rhs } => binary::emit_binary(self, *op, lhs, rhs),
            Node::Unary { op, operand } => unary::emit_unary(self, *op, operand),
            Node::Conditional {
                cond,
                then_arm,
                else_arm,
            } => conditional::emit_conditional(self, cond, then_arm, else_arm),
            Node::Block { locals, body } => block::emit_block(self, locals, body),
            Node::Assign { target, value } => assignment::emit_assign(self, target, value),
            Node::New(new_node) => construct::emit_new(self, new_node),
            Node::Lambda(lambda) => lambda::emit_lambda(self, lambda),
            Node::Labeled { label, body } => labels::emit_labeled(self, label, body),
            Node::Goto { label, value } => labels::emit_goto(self, label, value.as_deref()),
            Node::Try {
                body,
                catch,
                finally,
            } => try_region::emit_try(self, body, catch.as_deref(), finally.as_deref()),
            Node::TypeTest { operand, expect } => type_test::emit_type_test(self, operand, expect),
            Node::Convert {
                operand,
                to,
                checked,
            } => cast::emit_convert_node(self, operand, to, *checked),
        }
    }

    /// Emit a node in value position, owning the chain-escape epilogue.
    ///
    /// Chain heads (member, index, call) get a fresh escape label when the
    /// relevant checks are enabled; when the chain actually referenced it,
    /// the epilogue discards the placeholder and substitutes the result
    /// kind's zero value.
    pub fn emit_value(&mut self, node: &Node) -> Result<Emitted> {
        self.emit_guarded(node, false)
    }

    /// Like [`emit_value`](Self::emit_value), with the extend flag set for
    /// reads along a write path.
    pub fn emit_guarded(&mut self, node: &Node, extend: bool) -> Result<Emitted> {
        let is_chain = matches!(
            node,
            Node::Member { .. } | Node::Index { .. } | Node::Call { .. }
        );
        let checks =
            self.ctx.options.null_checks() || self.ctx.options.bounds_checks();
        if !(is_chain && checks) {
            return self.emit(node, None, ResultShape::Value, extend);
        }

        let escape = self.em.new_label("escape");
        let out = self.emit(node, Some(escape), ResultShape::Value, extend)?;
        if out.used_escape {
            let done = self.em.new_label("join");
            self.em.branch(done)?;
            self.em.mark(escape)?;
            self.em.pop()?;
            self.emit_zero(&out.kind)?;
            self.em.mark(done)?;
        }
        Ok(Emitted::value(out.kind))
    }

    // ------------------------------------------------------------------
    // Shared helpers
    // ------------------------------------------------------------------

    /// Push the zero value of a kind.
    pub fn emit_zero(&mut self, kind: &Kind) -> Result<()> {
        match kind {
            Kind::Unit => self.em.push_unit()?,
            Kind::Bool => self.em.push_bool(false)?,
            Kind::I8 => {
                self.em.push_const(Constant::I8(0))?;
            }
            Kind::I16 => {
                self.em.push_const(Constant::I16(0))?;
            }
            Kind::I32 => {
                self.em.push_const(Constant::I32(0))?;
            }
            Kind::I64 => {
                self.em.push_const(Constant::I64(0))?;
            }
            Kind::U8 => {
                self.em.push_const(Constant::U8(0))?;
            }
            Kind::U16 => {
                self.em.push_const(Constant::U16(0))?;
            }
            Kind::U32 => {
                self.em.push_const(Constant::U32(0))?;
            }
            Kind::U64 => {
                self.em.push_const(Constant::U64(0))?;
            }
            Kind::F32 => {
                self.em.push_const(Constant::F32(0.0))?;
            }
            Kind::F64 => {
                self.em.push_const(Constant::F64(0.0))?;
            }
            Kind::Opt(_) => self.em.push_nothing(kind)?,
            Kind::Opaque(op) => {
                self.em.push_const(Constant::Opaque {
                    kind: op.clone(),
                    bits: 0,
                })?;
            }
            Kind::Str | Kind::Boxed(_) | Kind::Record(_) | Kind::Array(_) | Kind::Func(_) => {
                self.em.push_null()?
            }
        }
        Ok(())
    }

    /// Reconcile the top of stack from `from` to `to` by value-preserving
    /// widening. Returns whether the kinds now agree.
    pub fn reconcile(&mut self, from: &Kind, to: &Kind) -> Result<bool> {
        if from.storage_compatible(to) {
            return Ok(true);
        }
        if let (Some(src), Some(dst)) = (from.numeric(), to.numeric())
            && crate::convert::widen_common(src, dst) == Some(dst)
        {
            self.em.conv(src, dst, false)?;
            return Ok(true);
        }
        Ok(false)
    }
}
