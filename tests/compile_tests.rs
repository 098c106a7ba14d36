//! End-to-end behavior of compiled callables: direct-evaluation
//! equivalence, the null-propagation protocol, auto-vivification along
//! write paths, conversions, and exception regions.

use std::sync::Arc;

use optree::prelude::*;

fn point_kind() -> Arc<RecordKind> {
    RecordKind::new(
        "Point",
        vec![
            Field {
                name: "x".into(),
                kind: Kind::I64,
            },
            Field {
                name: "y".into(),
                kind: Kind::I64,
            },
        ],
    )
}

/// `Outer { mid: Mid }`, `Mid { value: i64, items: i64[] }`.
fn nested_kinds() -> (Arc<RecordKind>, Arc<RecordKind>) {
    let mid = RecordKind::new(
        "Mid",
        vec![
            Field {
                name: "value".into(),
                kind: Kind::I64,
            },
            Field {
                name: "items".into(),
                kind: Kind::array(Kind::I64),
            },
        ],
    );
    let outer = RecordKind::new(
        "Outer",
        vec![Field {
            name: "mid".into(),
            kind: Kind::Record(mid.clone()),
        }],
    );
    (outer, mid)
}

// ==========================================================================
// Direct evaluation equivalence
// ==========================================================================

#[test]
fn arithmetic_matches_direct_evaluation() {
    let n = ParamDef::new("n", Kind::I64);
    let tree = LambdaNode::new(
        vec![n.clone()],
        Kind::I64,
        Node::binary(
            BinaryOp::Add,
            Node::binary(BinaryOp::Mul, Node::param(&n), Node::i64(3)),
            Node::i64(4),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    for n_value in [-5i64, 0, 7, 1_000_000] {
        assert_eq!(
            callable.invoke(&[Value::I64(n_value)]).unwrap(),
            Value::I64(n_value * 3 + 4)
        );
    }
}

#[test]
fn conditional_and_comparison() {
    let n = ParamDef::new("n", Kind::I64);
    let tree = LambdaNode::new(
        vec![n.clone()],
        Kind::Str,
        Node::conditional(
            Node::binary(BinaryOp::Lt, Node::param(&n), Node::i64(0)),
            Node::str("negative"),
            Node::str("non-negative"),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();
    assert_eq!(
        callable.invoke(&[Value::I64(-3)]).unwrap(),
        Value::str("negative")
    );
    assert_eq!(
        callable.invoke(&[Value::I64(3)]).unwrap(),
        Value::str("non-negative")
    );
}

#[test]
fn block_locals_and_assignment() {
    // { let acc: i64; acc = n + 1; acc * 2 }
    let n = ParamDef::new("n", Kind::I64);
    let acc = LocalDef::new("acc", Kind::I64);
    let tree = LambdaNode::new(
        vec![n.clone()],
        Kind::I64,
        Node::block(
            vec![acc.clone()],
            vec![
                Node::assign(
                    Node::local(&acc),
                    Node::binary(BinaryOp::Add, Node::param(&n), Node::i64(1)),
                ),
                Node::binary(BinaryOp::Mul, Node::local(&acc), Node::i64(2)),
            ],
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert_eq!(callable.invoke(&[Value::I64(20)]).unwrap(), Value::I64(42));
}

#[test]
fn logical_operators_short_circuit() {
    // flag && (1 / 0 == 0) must not divide when flag is false.
    let flag = ParamDef::new("flag", Kind::Bool);
    let tree = LambdaNode::new(
        vec![flag.clone()],
        Kind::Bool,
        Node::binary(
            BinaryOp::And,
            Node::param(&flag),
            Node::binary(
                BinaryOp::Eq,
                Node::binary(BinaryOp::Div, Node::i64(1), Node::i64(0)),
                Node::i64(0),
            ),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert_eq!(
        callable.invoke(&[Value::Bool(false)]).unwrap(),
        Value::Bool(false)
    );
    assert!(matches!(
        callable.invoke(&[Value::Bool(true)]),
        Err(RuntimeError::DivideByZero)
    ));
}

// ==========================================================================
// Null propagation
// ==========================================================================

/// Builds `a.mid.value` as a lambda over one `Outer` parameter.
fn chain_tree(outer: &Arc<RecordKind>) -> Arc<LambdaNode> {
    let a = ParamDef::new("a", Kind::Record(outer.clone()));
    LambdaNode::new(
        vec![a.clone()],
        Kind::I64,
        Node::field(Node::field(Node::param(&a), "mid"), "value"),
    )
}

#[test]
fn null_chain_collapses_to_zero_with_checks() {
    let (outer, _) = nested_kinds();
    let callable = optree::compile(&chain_tree(&outer), CheckFlags::all()).unwrap();

    // a itself null.
    assert_eq!(callable.invoke(&[Value::Null]).unwrap(), Value::I64(0));

    // a.mid null.
    let a = Value::new_record(&outer);
    assert_eq!(callable.invoke(&[a]).unwrap(), Value::I64(0));
}

#[test]
fn null_chain_fails_without_checks() {
    let (outer, _) = nested_kinds();
    let callable = optree::compile(&chain_tree(&outer), CheckFlags::empty()).unwrap();
    assert!(matches!(
        callable.invoke(&[Value::Null]),
        Err(RuntimeError::NullAccess { .. })
    ));
}

#[test]
fn populated_chain_reads_through() {
    let (outer, mid) = nested_kinds();
    let callable = optree::compile(&chain_tree(&outer), CheckFlags::all()).unwrap();

    let a = Value::new_record(&outer);
    let m = Value::new_record(&mid);
    if let (Value::Record(a_rec), Value::Record(m_rec)) = (&a, &m) {
        m_rec.borrow_mut().fields[0] = Value::I64(17);
        a_rec.borrow_mut().fields[0] = m.clone();
    }
    assert_eq!(callable.invoke(&[a]).unwrap(), Value::I64(17));
}

#[test]
fn out_of_range_read_collapses_to_zero_with_bounds_checks() {
    let arr = ParamDef::new("arr", Kind::array(Kind::I64));
    let tree = LambdaNode::new(
        vec![arr.clone()],
        Kind::I64,
        Node::index(Node::param(&arr), Node::i64(9)),
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();
    assert_eq!(
        callable.invoke(&[Value::new_array(&Kind::I64, 2)]).unwrap(),
        Value::I64(0)
    );

    let unchecked = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert!(matches!(
        unchecked.invoke(&[Value::new_array(&Kind::I64, 2)]),
        Err(RuntimeError::IndexOutOfRange { .. })
    ));
}

// ==========================================================================
// Auto-vivification
// ==========================================================================

#[test]
fn assignment_vivifies_missing_intermediates() {
    let (outer, _) = nested_kinds();
    let a = ParamDef::new("a", Kind::Record(outer.clone()));
    let x = ParamDef::new("x", Kind::I64);
    // a.mid.value = x, where a.mid starts null.
    let tree = LambdaNode::new(
        vec![a.clone(), x.clone()],
        Kind::I64,
        Node::assign(
            Node::field(Node::field(Node::param(&a), "mid"), "value"),
            Node::param(&x),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();

    let holder = Value::new_record(&outer);
    let result = callable
        .invoke(&[holder.clone(), Value::I64(41)])
        .unwrap();
    assert_eq!(result, Value::I64(41));

    let Value::Record(rec) = &holder else { panic!() };
    let mid_value = rec.borrow().fields[0].clone();
    let Value::Record(mid_rec) = &mid_value else {
        panic!("a.mid was not created");
    };
    assert_eq!(mid_rec.borrow().fields[0], Value::I64(41));
}

#[test]
fn assignment_to_null_root_substitutes_zero_with_checks() {
    let (outer, _) = nested_kinds();
    let a = ParamDef::new("a", Kind::Record(outer.clone()));
    let tree = LambdaNode::new(
        vec![a.clone()],
        Kind::I64,
        Node::assign(
            Node::field(Node::field(Node::param(&a), "mid"), "value"),
            Node::i64(7),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();
    // The root itself cannot be created; the store is skipped and the
    // target kind's zero value substitutes.
    assert_eq!(callable.invoke(&[Value::Null]).unwrap(), Value::I64(0));
}

#[test]
fn indexed_store_grows_array_preserving_prefix() {
    let (outer, mid) = nested_kinds();
    let a = ParamDef::new("a", Kind::Record(outer.clone()));
    let x = ParamDef::new("x", Kind::I64);
    // a.mid.items[5] = x, with a.mid.items of length 2.
    let tree = LambdaNode::new(
        vec![a.clone(), x.clone()],
        Kind::I64,
        Node::assign(
            Node::index(
                Node::field(Node::field(Node::param(&a), "mid"), "items"),
                Node::i64(5),
            ),
            Node::param(&x),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();

    let holder = Value::new_record(&outer);
    let m = Value::new_record(&mid);
    let items = Value::new_array(&Kind::I64, 2);
    if let Value::Array(arr) = &items {
        arr.borrow_mut().items[0] = Value::I64(10);
        arr.borrow_mut().items[1] = Value::I64(11);
    }
    if let (Value::Record(a_rec), Value::Record(m_rec)) = (&holder, &m) {
        m_rec.borrow_mut().fields[1] = items.clone();
        a_rec.borrow_mut().fields[0] = m.clone();
    }

    callable.invoke(&[holder, Value::I64(55)]).unwrap();

    let Value::Array(arr) = &items else { panic!() };
    let data = arr.borrow();
    assert_eq!(data.items.len(), 6);
    assert_eq!(data.items[0], Value::I64(10));
    assert_eq!(data.items[1], Value::I64(11));
    assert_eq!(data.items[2], Value::I64(0));
    assert_eq!(data.items[4], Value::I64(0));
    assert_eq!(data.items[5], Value::I64(55));
}

// ==========================================================================
// Conversions
// ==========================================================================

#[test]
fn checked_narrowing_overflows_and_unchecked_truncates() {
    let n = ParamDef::new("n", Kind::I64);
    let checked = LambdaNode::new(
        vec![n.clone()],
        Kind::I32,
        Node::convert_checked(Node::param(&n), Kind::I32),
    );
    let unchecked = LambdaNode::new(
        vec![n.clone()],
        Kind::I32,
        Node::convert(Node::param(&n), Kind::I32),
    );
    let big = (1i64 << 32) + 5;

    let compiled = optree::compile(&checked, CheckFlags::empty()).unwrap();
    assert!(matches!(
        compiled.invoke(&[Value::I64(big)]),
        Err(RuntimeError::Overflow { .. })
    ));
    assert_eq!(
        compiled.invoke(&[Value::I64(1234)]).unwrap(),
        Value::I32(1234)
    );

    let compiled = optree::compile(&unchecked, CheckFlags::empty()).unwrap();
    assert_eq!(compiled.invoke(&[Value::I64(big)]).unwrap(), Value::I32(5));
}

#[test]
fn lifted_arithmetic_short_circuits_on_absent() {
    let a = ParamDef::new("a", Kind::opt(Kind::I32));
    let b = ParamDef::new("b", Kind::opt(Kind::I32));
    let tree = LambdaNode::new(
        vec![a.clone(), b.clone()],
        Kind::opt(Kind::I32),
        Node::binary(BinaryOp::Add, Node::param(&a), Node::param(&b)),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();

    assert_eq!(
        callable
            .invoke(&[Value::some(Value::I32(2)), Value::some(Value::I32(3))])
            .unwrap(),
        Value::some(Value::I32(5))
    );
    assert_eq!(
        callable
            .invoke(&[Value::nothing(), Value::some(Value::I32(3))])
            .unwrap(),
        Value::nothing()
    );
    assert_eq!(
        callable
            .invoke(&[Value::some(Value::I32(2)), Value::nothing()])
            .unwrap(),
        Value::nothing()
    );
}

#[test]
fn nested_optional_operand_unwraps_every_level() {
    let a = ParamDef::new("a", Kind::opt(Kind::opt(Kind::I32)));
    let tree = LambdaNode::new(
        vec![a.clone()],
        Kind::opt(Kind::I32),
        Node::binary(BinaryOp::Add, Node::param(&a), Node::i32(1)),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();

    assert_eq!(
        callable
            .invoke(&[Value::some(Value::some(Value::I32(41)))])
            .unwrap(),
        Value::some(Value::I32(42))
    );
    // Absent at the outer level.
    assert_eq!(callable.invoke(&[Value::nothing()]).unwrap(), Value::nothing());
    // Absent at the inner level.
    assert_eq!(
        callable.invoke(&[Value::some(Value::nothing())]).unwrap(),
        Value::nothing()
    );
}

#[test]
fn box_round_trip_and_type_test() {
    let n = ParamDef::new("n", Kind::I32);
    let tree = LambdaNode::new(
        vec![n.clone()],
        Kind::Bool,
        Node::type_test(
            Node::convert(Node::param(&n), Kind::boxed(Kind::I32)),
            Kind::boxed(Kind::I32),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert_eq!(callable.invoke(&[Value::I32(1)]).unwrap(), Value::Bool(true));
}

#[test]
fn type_test_is_false_for_null_and_other_kinds() {
    let point = point_kind();
    let (outer, _) = nested_kinds();
    let o = ParamDef::new("o", Kind::Record(outer.clone()));
    let tree = LambdaNode::new(
        vec![o.clone()],
        Kind::Bool,
        Node::type_test(Node::param(&o), Kind::Record(point)),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert_eq!(callable.invoke(&[Value::Null]).unwrap(), Value::Bool(false));
    assert_eq!(
        callable.invoke(&[Value::new_record(&outer)]).unwrap(),
        Value::Bool(false)
    );
}

// ==========================================================================
// Labels, gotos, exception regions
// ==========================================================================

#[test]
fn goto_supplies_the_labeled_value() {
    let flag = ParamDef::new("flag", Kind::Bool);
    let exit = LabelDef::new("exit", Kind::I64);
    let tree = LambdaNode::new(
        vec![flag.clone()],
        Kind::I64,
        Node::labeled(
            &exit,
            Node::conditional(
                Node::param(&flag),
                Node::goto(&exit, Some(Node::i64(99))),
                Node::i64(0),
            ),
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert_eq!(callable.invoke(&[Value::Bool(true)]).unwrap(), Value::I64(99));
    assert_eq!(callable.invoke(&[Value::Bool(false)]).unwrap(), Value::I64(0));
}

#[test]
fn catch_replaces_the_failed_body_value() {
    let n = ParamDef::new("n", Kind::I64);
    let tree = LambdaNode::new(
        vec![n.clone()],
        Kind::I32,
        Node::Try {
            body: Box::new(Node::convert_checked(Node::param(&n), Kind::I32)),
            catch: Some(Box::new(Node::i32(-1))),
            finally: None,
        },
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    assert_eq!(callable.invoke(&[Value::I64(7)]).unwrap(), Value::I32(7));
    assert_eq!(
        callable.invoke(&[Value::I64(i64::MAX)]).unwrap(),
        Value::I32(-1)
    );
}

#[test]
fn finally_runs_on_both_paths() {
    let point = point_kind();
    let p = ParamDef::new("p", Kind::Record(point.clone()));
    let n = ParamDef::new("n", Kind::I64);
    // try { checked i32(n) } finally { p.x = 1 }; errors propagate but the
    // finally store still runs.
    let tree = LambdaNode::new(
        vec![p.clone(), n.clone()],
        Kind::I32,
        Node::Try {
            body: Box::new(Node::convert_checked(Node::param(&n), Kind::I32)),
            catch: None,
            finally: Some(Box::new(Node::assign(
                Node::field(Node::param(&p), "x"),
                Node::i64(1),
            ))),
        },
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();

    let ok_rec = Value::new_record(&point);
    assert_eq!(
        callable.invoke(&[ok_rec.clone(), Value::I64(3)]).unwrap(),
        Value::I32(3)
    );
    let Value::Record(rec) = &ok_rec else { panic!() };
    assert_eq!(rec.borrow().fields[0], Value::I64(1));

    let err_rec = Value::new_record(&point);
    assert!(callable.invoke(&[err_rec.clone(), Value::I64(i64::MAX)]).is_err());
    let Value::Record(rec) = &err_rec else { panic!() };
    assert_eq!(rec.borrow().fields[0], Value::I64(1));
}

// ==========================================================================
// Diagnostics and invocation surface
// ==========================================================================

#[test]
fn trace_is_exposed_and_stack_annotated() {
    let n = ParamDef::new("n", Kind::I64);
    let tree = LambdaNode::new(
        vec![n.clone()],
        Kind::I64,
        Node::binary(BinaryOp::Add, Node::param(&n), Node::i64(1)),
    );
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();
    let trace = callable.trace();
    assert!(trace.contains("ld.slot 1"));
    assert!(trace.contains("add.i64"));
    assert!(trace.contains(";; [i64, i64]"));
    assert_eq!(callable.unit_traces().len(), 1);
}

#[test]
fn invocation_checks_arity_and_kinds() {
    let n = ParamDef::new("n", Kind::I64);
    let tree = LambdaNode::new(vec![n.clone()], Kind::I64, Node::param(&n));
    let callable = optree::compile(&tree, CheckFlags::empty()).unwrap();

    assert!(matches!(
        callable.invoke(&[]),
        Err(RuntimeError::ArityMismatch { expected: 1, got: 0 })
    ));
    assert!(matches!(
        callable.invoke(&[Value::Bool(true)]),
        Err(RuntimeError::ArgumentKind { index: 0, .. })
    ));
}

#[test]
fn rejected_constructs_name_the_offender() {
    let (outer, _) = nested_kinds();
    let a = ParamDef::new("a", Kind::Record(outer.clone()));
    let tree = LambdaNode::new(
        vec![a.clone()],
        Kind::I64,
        Node::field(Node::param(&a), "missing"),
    );
    match optree::compile(&tree, CheckFlags::all()) {
        Err(CompileError::UnknownMember { member, on }) => {
            assert_eq!(member, "missing");
            assert_eq!(on, "Outer");
        }
        other => panic!("unexpected: {other:?}"),
    }
}

#[test]
fn conditional_arm_mismatch_is_raised_at_the_node() {
    let tree = LambdaNode::new(
        vec![],
        Kind::I64,
        Node::conditional(Node::bool(true), Node::i64(1), Node::str("oops")),
    );
    assert!(matches!(
        optree::compile(&tree, CheckFlags::empty()),
        Err(CompileError::ShapeMismatch { context: "conditional arms", .. })
    ));
}
