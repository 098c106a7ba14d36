//! Split-unit compilation and linking.
//!
//! Every lambda of a group compiles to an independent unit against the
//! same resolved tree and state record kind. Lambda-valued sub-expressions
//! were emitted as shims binding (state record, unit index, shape); after
//! all units exist, the link step builds the unit table and writes the
//! ordered array of sibling callable handles into the state record, so
//! sibling lambdas can invoke one another, including themselves.

use std::rc::Rc;
use std::sync::{Arc, OnceLock, PoisonError, RwLock};

use rustc_hash::FxHashMap;

use optree_core::{
    Callable, CompileError, FuncKind, Kind, KindHash, LambdaNode, RuntimeError, Value,
};

use crate::bytecode::{CodeChunk, ConstantPool};
use crate::closure::{self, ResolvedGroup};
use crate::context::EmitContext;
use crate::exec;
use crate::node::UnitCompiler;
use crate::options::CheckFlags;

// ============================================================================
// Shim-kind cache
// ============================================================================

static SHIM_KINDS: OnceLock<RwLock<FxHashMap<KindHash, Arc<FuncKind>>>> = OnceLock::new();

/// The canonical callable-adapter kind for a parameter/return shape.
///
/// Process-wide and append-only: the first caller needing a shape builds
/// and publishes the entry under the write lock (with a re-check, since a
/// racing caller may have published it first); later lookups take only the
/// read path. Entries live for the life of the process.
pub fn shim_kind(params: Vec<Kind>, ret: Kind) -> Arc<FuncKind> {
    let probe = FuncKind { params, ret };
    let key = probe.hash_id();
    let cache = SHIM_KINDS.get_or_init(|| RwLock::new(FxHashMap::default()));
    {
        let read = cache.read().unwrap_or_else(PoisonError::into_inner);
        if let Some(found) = read.get(&key) {
            return found.clone();
        }
    }
    let mut write = cache.write().unwrap_or_else(PoisonError::into_inner);
    if let Some(found) = write.get(&key) {
        return found.clone();
    }
    let entry = Arc::new(probe);
    write.insert(key, entry.clone());
    entry
}

// ============================================================================
// Compiled units and groups
// ============================================================================

/// One independently executable unit: the code for one lambda.
#[derive(Debug)]
pub struct CompiledUnit {
    pub name: String,
    pub chunk: CodeChunk,
    pub frame_size: u32,
    /// Declared shape, without the leading state argument.
    pub signature: Arc<FuncKind>,
    trace: Vec<String>,
}

impl CompiledUnit {
    /// The stack-annotated instruction trace recorded during emission.
    /// Human-readable; not a stability-guaranteed format.
    pub fn trace(&self) -> &[String] {
        &self.trace
    }
}

/// All units of one compile call plus their shared constant pool.
#[derive(Debug)]
pub struct UnitGroup {
    pub units: Vec<Arc<CompiledUnit>>,
    pub constants: ConstantPool,
}

/// The generated adapter turning (unit index, state record) into a
/// standard callable handle.
#[derive(Debug)]
pub(crate) struct ShimHandle {
    pub group: Arc<UnitGroup>,
    pub unit: usize,
    pub state: Value,
    pub signature: Arc<FuncKind>,
}

impl Callable for ShimHandle {
    fn signature(&self) -> &Arc<FuncKind> {
        &self.signature
    }

    fn invoke(&self, args: &[Value]) -> std::result::Result<Value, RuntimeError> {
        check_args(&self.signature, args)?;
        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(self.state.clone());
        frame.extend_from_slice(args);
        exec::run(&self.group, self.unit, frame)
    }
}

fn check_args(signature: &FuncKind, args: &[Value]) -> std::result::Result<(), RuntimeError> {
    if args.len() != signature.params.len() {
        return Err(RuntimeError::ArityMismatch {
            expected: signature.params.len(),
            got: args.len(),
        });
    }
    for (index, (arg, param)) in args.iter().zip(&signature.params).enumerate() {
        if !arg.fits(param) {
            return Err(RuntimeError::ArgumentKind {
                index,
                expected: param.to_string(),
            });
        }
    }
    Ok(())
}

// ============================================================================
// The compiled callable
// ============================================================================

/// A compiled operation tree: an invocable whose parameter and return
/// shapes match the tree's declared signature.
#[derive(Debug)]
pub struct Compiled {
    group: Arc<UnitGroup>,
    state: Value,
    signature: Arc<FuncKind>,
}

impl Compiled {
    pub fn signature(&self) -> &Arc<FuncKind> {
        &self.signature
    }

    /// Invoke with kind-checked arguments.
    pub fn invoke(&self, args: &[Value]) -> std::result::Result<Value, RuntimeError> {
        check_args(&self.signature, args)?;
        let mut frame = Vec::with_capacity(args.len() + 1);
        frame.push(self.state.clone());
        frame.extend_from_slice(args);
        exec::run(&self.group, 0, frame)
    }

    /// Per-unit instruction traces, in unit order.
    pub fn unit_traces(&self) -> Vec<&[String]> {
        self.group.units.iter().map(|u| u.trace()).collect()
    }

    /// All unit traces joined into one diagnostic dump.
    pub fn trace(&self) -> String {
        let mut out = String::new();
        for unit in &self.group.units {
            out.push_str(&format!("=== {} ===\n", unit.name));
            for line in unit.trace() {
                out.push_str(line);
                out.push('\n');
            }
        }
        out
    }
}

impl Callable for Compiled {
    fn signature(&self) -> &Arc<FuncKind> {
        &self.signature
    }

    fn invoke(&self, args: &[Value]) -> std::result::Result<Value, RuntimeError> {
        Compiled::invoke(self, args)
    }
}

// ============================================================================
// Group compilation
// ============================================================================

fn unit_signature(lambda: &LambdaNode) -> Arc<FuncKind> {
    let params: Vec<Kind> = lambda.params.iter().map(|p| p.kind.clone()).collect();
    shim_kind(params, lambda.ret.clone())
}

/// Compile a resolved group: every reserved unit in order (nested lambdas
/// reserve further units during emission), then link.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn compile_group(
    resolved: ResolvedGroup,
    options: CheckFlags,
) -> std::result::Result<Compiled, CompileError> {
    let mut ctx = EmitContext::new(options);
    ctx.state_param = resolved.state_param.clone();
    ctx.state_kind = resolved.state_kind.clone();
    ctx.handle_field = resolved.handle_field;

    let mut constants = ConstantPool::new();
    ctx.add_unit(resolved.root.clone());

    let mut units: Vec<Arc<CompiledUnit>> = Vec::new();
    let mut next = 0;
    while let Some(lambda) = ctx.unit(next).cloned() {
        let compiler = UnitCompiler::new(&mut ctx, &mut constants, lambda.clone());
        let (chunk, frame_size, trace) = compiler.compile()?;
        let name = lambda
            .name
            .clone()
            .unwrap_or_else(|| format!("lambda#{}", next));
        units.push(Arc::new(CompiledUnit {
            name,
            chunk,
            frame_size,
            signature: unit_signature(&lambda),
            trace,
        }));
        next += 1;
    }

    let group = Arc::new(UnitGroup { units, constants });

    // Link: publish the ordered sibling-handle array into the state record.
    let state = resolved.state.clone().unwrap_or(Value::Null);
    if let (Value::Record(rec), Some(handle_field)) = (&state, resolved.handle_field) {
        let handles: Vec<Value> = group
            .units
            .iter()
            .enumerate()
            .map(|(unit, compiled)| {
                Value::Func(Rc::new(ShimHandle {
                    group: group.clone(),
                    unit,
                    state: state.clone(),
                    signature: compiled.signature.clone(),
                }) as Rc<dyn Callable>)
            })
            .collect();
        let elem = Kind::Func(shim_kind(Vec::new(), Kind::Unit));
        let table = Value::new_array(&elem, 0);
        if let Value::Array(arr) = &table {
            arr.borrow_mut().items = handles;
        }
        rec.borrow_mut().fields[handle_field] = table;
    }

    let signature = group.units[0].signature.clone();
    Ok(Compiled {
        group,
        state,
        signature,
    })
}

/// Compile an operation tree into an invocable callable.
///
/// `options` selects which safety checks are woven into emitted chains;
/// [`CheckFlags::all`] and [`CheckFlags::empty`] are the presets.
#[cfg_attr(feature = "profiling", profiling::function)]
pub fn compile(
    root: &Arc<LambdaNode>,
    options: CheckFlags,
) -> std::result::Result<Compiled, CompileError> {
    let resolved = closure::resolve(root)?;
    compile_group(resolved, options)
}

#[cfg(test)]
mod tests {
    use super::*;
    use optree_core::{Node, ParamDef};

    #[test]
    fn link_publishes_the_sibling_handle_array() {
        let x = ParamDef::new("x", Kind::I64);
        let inner = LambdaNode::new(vec![], Kind::I64, Node::param(&x));
        let outer = LambdaNode::new(
            vec![x.clone()],
            Kind::func(vec![], Kind::I64),
            Node::lambda(&inner),
        );

        let resolved = crate::closure::resolve(&outer).unwrap();
        let state = resolved.state.clone().expect("lambdas need closure state");
        let handle_field = resolved.handle_field.expect("handle slot reserved");

        compile_group(resolved, CheckFlags::empty()).unwrap();

        // The link step wrote one handle per unit, in unit order.
        let Value::Record(rec) = &state else { panic!() };
        let table = rec.borrow().fields[handle_field].clone();
        let Value::Array(arr) = &table else {
            panic!("handle table missing after link");
        };
        assert_eq!(arr.borrow().items.len(), 2);
        assert!(arr.borrow().items.iter().all(|h| matches!(h, Value::Func(_))));
    }

    #[test]
    fn shim_kinds_are_shared_by_shape() {
        let a = shim_kind(vec![Kind::I64], Kind::Bool);
        let b = shim_kind(vec![Kind::I64], Kind::Bool);
        assert!(Arc::ptr_eq(&a, &b));
        let c = shim_kind(vec![Kind::I64], Kind::I64);
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn shim_kind_cache_is_usable_across_threads() {
        let handles: Vec<_> = (0..4)
            .map(|_| {
                std::thread::spawn(|| shim_kind(vec![Kind::Str, Kind::I32], Kind::Str))
            })
            .collect();
        let kinds: Vec<Arc<FuncKind>> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        for pair in kinds.windows(2) {
            assert!(Arc::ptr_eq(&pair[0], &pair[1]));
        }
    }
}
