//! Closure building and tree resolution.
//!
//! A single leaves-first pass collects everything the unit group must
//! share: captured reference-kind constants (de-duplicated by kind and
//! value identity), parameters referenced inside a nested lambda but
//! declared outside it, and whether a sibling-handle table is needed. The
//! resolver then rewrites fresh copies of the tree: matched references
//! become field accesses on one shared state record, and each lambda's
//! body is prefixed with assignments copying its captured parameters into
//! their fields, so inner lambdas observe captures by copy rather than by
//! live reference.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use optree_core::{
    CompileError, Field, Kind, LambdaNode, MemberSel, NewNode, Node, ParamDef, ParamRef,
    RecordKind, Value,
};

use crate::link::shim_kind;

type Result<T> = std::result::Result<T, CompileError>;

/// Name of the sibling callable-handle field.
const HANDLE_FIELD: &str = "handles";

/// Output of closure resolution for one compile call.
pub struct ResolvedGroup {
    /// The rewritten outer lambda.
    pub root: Arc<LambdaNode>,
    /// Synthetic parameter standing for the state record (slot 0).
    pub state_param: Option<ParamRef>,
    pub state_kind: Option<Arc<RecordKind>>,
    /// The single state record instance, hoisted constants already stored.
    pub state: Option<Value>,
    /// Field index of the sibling-handle array, when lambdas exist.
    pub handle_field: Option<usize>,
}

/// Whether a constant of this kind is hoisted into the state record.
fn hoistable(kind: &Kind) -> bool {
    kind.is_reference() && *kind != Kind::Str
}

fn key<T>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as usize
}

// ============================================================================
// Analysis
// ============================================================================

#[derive(Default)]
struct Analysis {
    /// Hoisted constants in discovery order.
    hoisted: Vec<(Kind, Value)>,
    /// Captured parameters in discovery order.
    captured: Vec<ParamRef>,
    captured_index: FxHashMap<usize, usize>,
    /// Captured parameters grouped by the lambda that declares them.
    captured_by_lambda: FxHashMap<usize, Vec<ParamRef>>,
    any_lambda: bool,
}

impl Analysis {
    fn hoist_const(&mut self, kind: &Kind, value: &Value) -> usize {
        for (i, (k, v)) in self.hoisted.iter().enumerate() {
            if k == kind && v.identity_eq(value) {
                return i;
            }
        }
        self.hoisted.push((kind.clone(), value.clone()));
        self.hoisted.len() - 1
    }

    fn capture(&mut self, declaring_lambda: usize, param: &ParamRef) -> usize {
        if let Some(&index) = self.captured_index.get(&key(param)) {
            return index;
        }
        let index = self.captured.len();
        self.captured.push(param.clone());
        self.captured_index.insert(key(param), index);
        self.captured_by_lambda
            .entry(declaring_lambda)
            .or_default()
            .push(param.clone());
        index
    }
}

/// One frame of the lexical scope stack during analysis.
struct Scope {
    lambda: usize,
    params: FxHashSet<usize>,
}

fn analyze(node: &Node, scopes: &mut Vec<Scope>, out: &mut Analysis) {
    match node {
        Node::Param(param) => {
            let here = scopes.last().expect("scope stack is never empty");
            if here.params.contains(&key(param)) {
                return;
            }
            // Declared by an enclosing lambda: capture it there. Unbound
            // references are left for emission to reject.
            for scope in scopes.iter().rev().skip(1) {
                if scope.params.contains(&key(param)) {
                    out.capture(scope.lambda, param);
                    return;
                }
            }
        }
        Node::Const { value, kind } => {
            if hoistable(kind) && !value.is_null() {
                out.hoist_const(kind, value);
            }
        }
        Node::Lambda(lambda) => {
            out.any_lambda = true;
            scopes.push(Scope {
                lambda: key(lambda),
                params: lambda.params.iter().map(key).collect(),
            });
            analyze(&lambda.body, scopes, out);
            scopes.pop();
        }
        Node::Local(_) => {}
        Node::Member { object, .. } => analyze(object, scopes, out),
        Node::Index { array, index } => {
            analyze(array, scopes, out);
            analyze(index, scopes, out);
        }
        Node::Call { callee, args } => {
            analyze(callee, scopes, out);
            for arg in args {
                analyze(arg, scopes, out);
            }
        }
        Node::Binary { lhs, rhs, .. } => {
            analyze(lhs, scopes, out);
            analyze(rhs, scopes, out);
        }
        Node::Unary { operand, .. } => analyze(operand, scopes, out),
        Node::Conditional {
            cond,
            then_arm,
            else_arm,
        } => {
            analyze(cond, scopes, out);
            analyze(then_arm, scopes, out);
            analyze(else_arm, scopes, out);
        }
        Node::Block { body, .. } => {
            for stmt in body {
                analyze(stmt, scopes, out);
            }
        }
        Node::Assign { target, value } => {
            analyze(target, scopes, out);
            analyze(value, scopes, out);
        }
        Node::New(NewNode::Record { inits, .. }) => {
            for (_, value) in inits {
                analyze(value, scopes, out);
            }
        }
        Node::New(NewNode::Array { len, .. }) => analyze(len, scopes, out),
        Node::Labeled { body, .. } => analyze(body, scopes, out),
        Node::Goto { value, .. } => {
            if let Some(value) = value {
                analyze(value, scopes, out);
            }
        }
        Node::Try {
            body,
            catch,
            finally,
        } => {
            analyze(body, scopes, out);
            if let Some(catch) = catch {
                analyze(catch, scopes, out);
            }
            if let Some(finally) = finally {
                analyze(finally, scopes, out);
            }
        }
        Node::TypeTest { operand, .. } => analyze(operand, scopes, out),
        Node::Convert { operand, .. } => analyze(operand, scopes, out),
    }
}

// ============================================================================
// Rewrite
// ============================================================================

struct Rewriter {
    state_param: ParamRef,
    /// (kind, value) identity list, parallel to the record's leading fields.
    hoisted: Vec<(Kind, Value)>,
    /// Captured param key -> record field index.
    captured_fields: FxHashMap<usize, usize>,
    /// Declaring lambda key -> its captured params.
    captured_by_lambda: FxHashMap<usize, Vec<ParamRef>>,
    state_kind: Arc<RecordKind>,
}

impl Rewriter {
    fn state_access(&self, field: usize) -> Node {
        let name = self.state_kind.field(field).expect("generated field").name.clone();
        Node::Member {
            object: Box::new(Node::Param(self.state_param.clone())),
            member: MemberSel::Field(name),
        }
    }

    fn rewrite_lambda(&self, lambda: &Arc<LambdaNode>) -> Arc<LambdaNode> {
        let own: FxHashSet<usize> = lambda.params.iter().map(key).collect();
        let body = self.rewrite(&lambda.body, &own);

        // Copy this lambda's captured parameters into their fields on
        // entry: inner lambdas observe the values by copy.
        let captured = self.captured_by_lambda.get(&key(lambda));
        let body = match captured {
            Some(params) if !params.is_empty() => {
                let mut stmts: Vec<Node> = params
                    .iter()
                    .map(|param| {
                        let field = self.captured_fields[&key(param)];
                        Node::Assign {
                            target: Box::new(self.state_access(field)),
                            value: Box::new(Node::Param(param.clone())),
                        }
                    })
                    .collect();
                stmts.push(body);
                Node::Block {
                    locals: Vec::new(),
                    body: stmts,
                }
            }
            _ => body,
        };

        Arc::new(LambdaNode {
            name: lambda.name.clone(),
            params: lambda.params.clone(),
            ret: lambda.ret.clone(),
            body,
        })
    }

    fn rewrite(&self, node: &Node, own: &FxHashSet<usize>) -> Node {
        match node {
            Node::Param(param) => {
                if !own.contains(&key(param))
                    && let Some(&field) = self.captured_fields.get(&key(param))
                {
                    return self.state_access(field);
                }
                node.clone()
            }
            Node::Const { value, kind } => {
                if hoistable(kind) && !value.is_null() {
                    for (i, (k, v)) in self.hoisted.iter().enumerate() {
                        if k == kind && v.identity_eq(value) {
                            return self.state_access(i);
                        }
                    }
                }
                node.clone()
            }
            Node::Lambda(lambda) => Node::Lambda(self.rewrite_lambda(lambda)),
            Node::Local(_) => node.clone(),
            Node::Member { object, member } => Node::Member {
                object: Box::new(self.rewrite(object, own)),
                member: member.clone(),
            },
            Node::Index { array, index } => Node::Index {
                array: Box::new(self.rewrite(array, own)),
                index: Box::new(self.rewrite(index, own)),
            },
            Node::Call { callee, args } => Node::Call {
                callee: Box::new(self.rewrite(callee, own)),
                args: args.iter().map(|a| self.rewrite(a, own)).collect(),
            },
            Node::Binary { op, lhs, rhs } => Node::Binary {
                op: *op,
                lhs: Box::new(self.rewrite(lhs, own)),
                rhs: Box::new(self.rewrite(rhs, own)),
            },
            Node::Unary { op, operand } => Node::Unary {
                op: *op,
                operand: Box::new(self.rewrite(operand, own)),
            },
            Node::Conditional {
                cond,
                then_arm,
                else_arm,
            } => Node::Conditional {
                cond: Box::new(self.rewrite(cond, own)),
                then_arm: Box::new(self.rewrite(then_arm, own)),
                else_arm: Box::new(self.rewrite(else_arm, own)),
            },
            Node::Block { locals, body } => Node::Block {
                locals: locals.clone(),
                body: body.iter().map(|s| self.rewrite(s, own)).collect(),
            },
            Node::Assign { target, value } => Node::Assign {
                target: Box::new(self.rewrite(target, own)),
                value: Box::new(self.rewrite(value, own)),
            },
            Node::New(NewNode::Record { kind, inits }) => Node::New(NewNode::Record {
                kind: kind.clone(),
                inits: inits
                    .iter()
                    .map(|(name, value)| (name.clone(), self.rewrite(value, own)))
                    .collect(),
            }),
            Node::New(NewNode::Array { elem, len }) => Node::New(NewNode::Array {
                elem: elem.clone(),
                len: Box::new(self.rewrite(len, own)),
            }),
            Node::Labeled { label, body } => Node::Labeled {
                label: label.clone(),
                body: Box::new(self.rewrite(body, own)),
            },
            Node::Goto { label, value } => Node::Goto {
                label: label.clone(),
                value: value.as_ref().map(|v| Box::new(self.rewrite(v, own))),
            },
            Node::Try {
                body,
                catch,
                finally,
            } => Node::Try {
                body: Box::new(self.rewrite(body, own)),
                catch: catch.as_ref().map(|n| Box::new(self.rewrite(n, own))),
                finally: finally.as_ref().map(|n| Box::new(self.rewrite(n, own))),
            },
            Node::TypeTest { operand, expect } => Node::TypeTest {
                operand: Box::new(self.rewrite(operand, own)),
                expect: expect.clone(),
            },
            Node::Convert {
                operand,
                to,
                checked,
            } => Node::Convert {
                operand: Box::new(self.rewrite(operand, own)),
                to: to.clone(),
                checked: *checked,
            },
        }
    }
}

// ============================================================================
// Entry point
// ============================================================================

/// Analyze and rewrite a lambda group. Trees without captures or nested
/// lambdas pass through untouched with no state record.
pub fn resolve(root: &Arc<LambdaNode>) -> Result<ResolvedGroup> {
    let mut analysis = Analysis::default();
    let mut scopes = vec![Scope {
        lambda: key(root),
        params: root.params.iter().map(key).collect(),
    }];
    analyze(&root.body, &mut scopes, &mut analysis);

    if analysis.hoisted.is_empty() && analysis.captured.is_empty() && !analysis.any_lambda {
        return Ok(ResolvedGroup {
            root: root.clone(),
            state_param: None,
            state_kind: None,
            state: None,
            handle_field: None,
        });
    }

    // Generate the state record kind: hoisted constants first, captured
    // parameter fields next, then the sibling-handle table when needed.
    let mut fields: Vec<Field> = analysis
        .hoisted
        .iter()
        .enumerate()
        .map(|(i, (kind, _))| Field {
            name: format!("c{}", i),
            kind: kind.clone(),
        })
        .collect();
    let mut captured_fields = FxHashMap::default();
    for (i, param) in analysis.captured.iter().enumerate() {
        captured_fields.insert(key(param), fields.len());
        fields.push(Field {
            name: format!("p{}_{}", i, param.name),
            kind: param.kind.clone(),
        });
    }
    let handle_field = if analysis.any_lambda {
        let index = fields.len();
        fields.push(Field {
            name: HANDLE_FIELD.to_string(),
            kind: Kind::array(Kind::Func(shim_kind(Vec::new(), Kind::Unit))),
        });
        Some(index)
    } else {
        None
    };

    let state_kind = RecordKind::new("ClosureState", fields);
    let state_param = ParamDef::new("state", Kind::Record(state_kind.clone()));

    // The single shared instance: hoisted constants stored once, here.
    let state = Value::new_record(&state_kind);
    if let Value::Record(rec) = &state {
        let mut data = rec.borrow_mut();
        for (i, (_, value)) in analysis.hoisted.iter().enumerate() {
            data.fields[i] = value.clone();
        }
    }

    let rewriter = Rewriter {
        state_param: state_param.clone(),
        hoisted: analysis.hoisted,
        captured_fields,
        captured_by_lambda: analysis.captured_by_lambda,
        state_kind: state_kind.clone(),
    };
    let root = rewriter.rewrite_lambda(root);

    Ok(ResolvedGroup {
        root,
        state_param: Some(state_param),
        state_kind: Some(state_kind),
        state: Some(state),
        handle_field,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use optree_core::BinaryOp;

    #[test]
    fn plain_tree_passes_through() {
        let x = ParamDef::new("x", Kind::I64);
        let root = LambdaNode::new(
            vec![x.clone()],
            Kind::I64,
            Node::binary(BinaryOp::Add, Node::param(&x), Node::i64(1)),
        );
        let resolved = resolve(&root).unwrap();
        assert!(resolved.state.is_none());
        assert!(Arc::ptr_eq(&resolved.root, &root));
    }

    #[test]
    fn captured_param_becomes_state_field() {
        let x = ParamDef::new("x", Kind::I64);
        let inner = LambdaNode::new(vec![], Kind::I64, Node::param(&x));
        let root = LambdaNode::new(vec![x.clone()], Kind::func(vec![], Kind::I64), Node::lambda(&inner));
        let resolved = resolve(&root).unwrap();

        let state_kind = resolved.state_kind.expect("state record generated");
        assert!(state_kind.fields.iter().any(|f| f.name.contains("x")));
        assert!(resolved.handle_field.is_some());

        // The outer body now starts with the capture copy.
        let Node::Block { body, .. } = &resolved.root.body else {
            panic!("capture copy block expected");
        };
        assert!(matches!(body[0], Node::Assign { .. }));

        // The inner body reads the field through the state param.
        let Node::Lambda(rewritten_inner) = &body[1] else {
            panic!("lambda expected");
        };
        assert!(matches!(rewritten_inner.body, Node::Member { .. }));
    }

    #[test]
    fn reference_constants_are_hoisted_and_deduplicated() {
        let rec_kind = RecordKind::new(
            "Cfg",
            vec![Field {
                name: "n".into(),
                kind: Kind::I64,
            }],
        );
        let cfg = Value::new_record(&rec_kind);
        let kind = Kind::Record(rec_kind);
        let root = LambdaNode::new(
            vec![],
            Kind::I64,
            Node::binary(
                BinaryOp::Add,
                Node::field(Node::constant(cfg.clone(), kind.clone()), "n"),
                Node::field(Node::constant(cfg.clone(), kind.clone()), "n"),
            ),
        );
        let resolved = resolve(&root).unwrap();
        let state_kind = resolved.state_kind.expect("state record generated");
        // One field for the shared constant, no handle table.
        assert_eq!(state_kind.fields.len(), 1);
        assert!(resolved.handle_field.is_none());

        let Some(Value::Record(rec)) = &resolved.state else {
            panic!("state instance expected");
        };
        assert!(rec.borrow().fields[0].identity_eq(&cfg));
    }

    #[test]
    fn text_constants_stay_inline() {
        let root = LambdaNode::new(vec![], Kind::Str, Node::str("hello"));
        let resolved = resolve(&root).unwrap();
        assert!(resolved.state.is_none());
    }
}
