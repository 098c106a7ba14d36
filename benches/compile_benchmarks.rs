use criterion::{Criterion, criterion_group, criterion_main};
use std::hint::black_box;

use std::sync::Arc;

use optree::prelude::*;

fn chain_tree() -> (Arc<LambdaNode>, Value) {
    let mid = RecordKind::new(
        "Mid",
        vec![Field {
            name: "value".into(),
            kind: Kind::I64,
        }],
    );
    let outer = RecordKind::new(
        "Outer",
        vec![Field {
            name: "mid".into(),
            kind: Kind::Record(mid.clone()),
        }],
    );
    let a = ParamDef::new("a", Kind::Record(outer.clone()));
    let tree = LambdaNode::new(
        vec![a.clone()],
        Kind::I64,
        Node::binary(
            BinaryOp::Add,
            Node::field(Node::field(Node::param(&a), "mid"), "value"),
            Node::i64(1),
        ),
    );

    let holder = Value::new_record(&outer);
    let m = Value::new_record(&mid);
    if let (Value::Record(a_rec), Value::Record(m_rec)) = (&holder, &m) {
        m_rec.borrow_mut().fields[0] = Value::I64(41);
        a_rec.borrow_mut().fields[0] = m.clone();
    }
    (tree, holder)
}

fn bench_compile(c: &mut Criterion) {
    let (tree, _) = chain_tree();
    c.bench_function("compile_member_chain", |b| {
        b.iter(|| optree::compile(black_box(&tree), CheckFlags::all()).unwrap())
    });
}

fn bench_invoke(c: &mut Criterion) {
    let (tree, holder) = chain_tree();
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();
    c.bench_function("invoke_member_chain", |b| {
        b.iter(|| callable.invoke(black_box(&[holder.clone()])).unwrap())
    });
}

criterion_group!(benches, bench_compile, bench_invoke);
criterion_main!(benches);
