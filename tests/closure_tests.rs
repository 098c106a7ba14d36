//! Closure hoisting, capture-by-copy semantics, and split-unit linking
//! observed through compiled callables.

use std::sync::Arc;

use optree::prelude::*;

fn invoke_handle(value: &Value, args: &[Value]) -> Value {
    let Value::Func(func) = value else {
        panic!("expected a callable handle, got {value}");
    };
    func.invoke(args).unwrap()
}

#[test]
fn nested_lambda_reads_captured_parameter() {
    // outer(x) = () -> x + 1
    let x = ParamDef::new("x", Kind::I64);
    let inner = LambdaNode::new(
        vec![],
        Kind::I64,
        Node::binary(BinaryOp::Add, Node::param(&x), Node::i64(1)),
    );
    let outer = LambdaNode::new(
        vec![x.clone()],
        Kind::func(vec![], Kind::I64),
        Node::lambda(&inner),
    );

    let callable = optree::compile(&outer, CheckFlags::empty()).unwrap();
    let handle = callable.invoke(&[Value::I64(41)]).unwrap();
    assert_eq!(invoke_handle(&handle, &[]), Value::I64(42));
}

#[test]
fn capture_is_by_copy_at_construction_time() {
    // outer(x) = { let f = () -> x; x = 100; f }
    let x = ParamDef::new("x", Kind::I64);
    let f = LocalDef::new("f", Kind::func(vec![], Kind::I64));
    let inner = LambdaNode::new(vec![], Kind::I64, Node::param(&x));
    let outer = LambdaNode::new(
        vec![x.clone()],
        Kind::func(vec![], Kind::I64),
        Node::block(
            vec![f.clone()],
            vec![
                Node::assign(Node::local(&f), Node::lambda(&inner)),
                Node::assign(Node::param(&x), Node::i64(100)),
                Node::local(&f),
            ],
        ),
    );

    let callable = optree::compile(&outer, CheckFlags::empty()).unwrap();
    let handle = callable.invoke(&[Value::I64(42)]).unwrap();
    // The reassignment of the outer parameter's storage happened after the
    // capture copy; the inner lambda observes the captured value.
    assert_eq!(invoke_handle(&handle, &[]), Value::I64(42));
}

#[test]
fn inner_lambda_takes_its_own_parameters() {
    // outer(base) = (n) -> base + n
    let base = ParamDef::new("base", Kind::I64);
    let n = ParamDef::new("n", Kind::I64);
    let inner = LambdaNode::new(
        vec![n.clone()],
        Kind::I64,
        Node::binary(BinaryOp::Add, Node::param(&base), Node::param(&n)),
    );
    let outer = LambdaNode::new(
        vec![base.clone()],
        Kind::func(vec![Kind::I64], Kind::I64),
        Node::lambda(&inner),
    );

    let callable = optree::compile(&outer, CheckFlags::empty()).unwrap();
    let handle = callable.invoke(&[Value::I64(40)]).unwrap();
    assert_eq!(invoke_handle(&handle, &[Value::I64(2)]), Value::I64(42));
    assert_eq!(invoke_handle(&handle, &[Value::I64(5)]), Value::I64(45));
}

#[test]
fn lambda_value_is_invocable_from_the_tree() {
    // outer(x) = ((n) -> n * 2)(x + 1)
    let x = ParamDef::new("x", Kind::I64);
    let n = ParamDef::new("n", Kind::I64);
    let double = LambdaNode::new(
        vec![n.clone()],
        Kind::I64,
        Node::binary(BinaryOp::Mul, Node::param(&n), Node::i64(2)),
    );
    let outer = LambdaNode::new(
        vec![x.clone()],
        Kind::I64,
        Node::call(
            Node::lambda(&double),
            vec![Node::binary(BinaryOp::Add, Node::param(&x), Node::i64(1))],
        ),
    );

    let callable = optree::compile(&outer, CheckFlags::all()).unwrap();
    assert_eq!(callable.invoke(&[Value::I64(20)]).unwrap(), Value::I64(42));
}

#[test]
fn hoisted_constant_callable_is_invocable() {
    // A host-provided callable embedded as a constant gets hoisted into the
    // shared state record and invoked through it.
    #[derive(Debug)]
    struct Doubler {
        signature: Arc<FuncKind>,
    }
    impl Callable for Doubler {
        fn signature(&self) -> &Arc<FuncKind> {
            &self.signature
        }
        fn invoke(&self, args: &[Value]) -> Result<Value, RuntimeError> {
            let Value::I64(n) = args[0] else {
                return Err(RuntimeError::ArgumentKind {
                    index: 0,
                    expected: "i64".into(),
                });
            };
            Ok(Value::I64(n * 2))
        }
    }

    let signature = FuncKind::new(vec![Kind::I64], Kind::I64);
    let host = Value::Func(std::rc::Rc::new(Doubler {
        signature: signature.clone(),
    }));

    let x = ParamDef::new("x", Kind::I64);
    let tree = LambdaNode::new(
        vec![x.clone()],
        Kind::I64,
        Node::call(
            Node::constant(host, Kind::Func(signature)),
            vec![Node::param(&x)],
        ),
    );
    let callable = optree::compile(&tree, CheckFlags::all()).unwrap();
    assert_eq!(callable.invoke(&[Value::I64(21)]).unwrap(), Value::I64(42));
}

#[test]
fn each_compile_call_builds_an_independent_group() {
    let x = ParamDef::new("x", Kind::I64);
    let inner = LambdaNode::new(vec![], Kind::I64, Node::param(&x));
    let outer = LambdaNode::new(
        vec![x.clone()],
        Kind::func(vec![], Kind::I64),
        Node::lambda(&inner),
    );

    let first = optree::compile(&outer, CheckFlags::empty()).unwrap();
    let second = optree::compile(&outer, CheckFlags::empty()).unwrap();

    let from_first = first.invoke(&[Value::I64(1)]).unwrap();
    let from_second = second.invoke(&[Value::I64(2)]).unwrap();
    assert_eq!(invoke_handle(&from_first, &[]), Value::I64(1));
    assert_eq!(invoke_handle(&from_second, &[]), Value::I64(2));
}

#[test]
fn two_units_compile_and_both_traces_surface() {
    let x = ParamDef::new("x", Kind::I64);
    let inner = LambdaNode::new(vec![], Kind::I64, Node::param(&x));
    let outer = LambdaNode::new(
        vec![x.clone()],
        Kind::func(vec![], Kind::I64),
        Node::lambda(&inner),
    );
    let callable = optree::compile(&outer, CheckFlags::empty()).unwrap();
    assert_eq!(callable.unit_traces().len(), 2);
    assert!(callable.trace().contains("shim"));
}
