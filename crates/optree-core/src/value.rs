//! Runtime values for compiled units.
//!
//! Primitives are stored inline; records and arrays are shared mutable
//! references so that stores through a chain are visible to every holder.
//! Callable handles are trait objects: compiled units produce them via
//! generated adapters, and embedders may supply their own.

use std::cell::RefCell;
use std::fmt;
use std::rc::Rc;
use std::sync::Arc;

use crate::error::RuntimeError;
use crate::kind::{FuncKind, Kind, OpaqueKind, RecordKind};

// ============================================================================
// Shared aggregates
// ============================================================================

/// Mutable payload of a record value.
#[derive(Debug, Clone)]
pub struct RecordData {
    pub kind: Arc<RecordKind>,
    pub fields: Vec<Value>,
}

/// Mutable payload of an array value.
#[derive(Debug, Clone)]
pub struct ArrayData {
    pub elem: Kind,
    pub items: Vec<Value>,
}

pub type RecordRef = Rc<RefCell<RecordData>>;
pub type ArrayRef = Rc<RefCell<ArrayData>>;

// ============================================================================
// Callable handles
// ============================================================================

/// A standard callable handle: anything invocable with runtime values.
///
/// Compiled lambdas are exposed through this trait; embedders can hand in
/// their own implementations as tree constants.
pub trait Callable: fmt::Debug {
    /// The declared parameter/return shape.
    fn signature(&self) -> &Arc<FuncKind>;

    /// Invoke with already-kind-checked arguments.
    fn invoke(&self, args: &[Value]) -> Result<Value, RuntimeError>;
}

/// A user-defined opaque value: fixed-width payload tagged with its kind.
#[derive(Debug, Clone)]
pub struct OpaqueValue {
    pub kind: Arc<OpaqueKind>,
    pub bits: u64,
}

// ============================================================================
// Value
// ============================================================================

/// A runtime value.
#[derive(Debug, Clone)]
pub enum Value {
    Unit,
    /// The null reference. Fits every reference kind.
    Null,
    Bool(bool),
    I8(i8),
    I16(i16),
    I32(i32),
    I64(i64),
    U8(u8),
    U16(u16),
    U32(u32),
    U64(u64),
    F32(f32),
    F64(f64),
    Str(Arc<str>),
    /// An optional: absent, or a present inner value. Nestable.
    Opt(Option<Box<Value>>),
    Boxed(Rc<Value>),
    Record(RecordRef),
    Array(ArrayRef),
    Func(Rc<dyn Callable>),
    Opaque(OpaqueValue),
}

impl Value {
    /// The zero value of a kind: what a missing chain intermediate
    /// substitutes, and what fresh record fields and array gaps hold.
    pub fn zero(kind: &Kind) -> Value {
        match kind {
            Kind::Unit => Value::Unit,
            Kind::Bool => Value::Bool(false),
            Kind::I8 => Value::I8(0),
            Kind::I16 => Value::I16(0),
            Kind::I32 => Value::I32(0),
            Kind::I64 => Value::I64(0),
            Kind::U8 => Value::U8(0),
            Kind::U16 => Value::U16(0),
            Kind::U32 => Value::U32(0),
            Kind::U64 => Value::U64(0),
            Kind::F32 => Value::F32(0.0),
            Kind::F64 => Value::F64(0.0),
            Kind::Opt(_) => Value::Opt(None),
            Kind::Opaque(op) => Value::Opaque(OpaqueValue {
                kind: op.clone(),
                bits: 0,
            }),
            Kind::Str | Kind::Boxed(_) | Kind::Record(_) | Kind::Array(_) | Kind::Func(_) => {
                Value::Null
            }
        }
    }

    /// A fresh record instance with every field at its zero value.
    pub fn new_record(kind: &Arc<RecordKind>) -> Value {
        let fields = kind.fields.iter().map(|f| Value::zero(&f.kind)).collect();
        Value::Record(Rc::new(RefCell::new(RecordData {
            kind: kind.clone(),
            fields,
        })))
    }

    /// A fresh array of the given length, zero-filled.
    pub fn new_array(elem: &Kind, len: usize) -> Value {
        let items = (0..len).map(|_| Value::zero(elem)).collect();
        Value::Array(Rc::new(RefCell::new(ArrayData {
            elem: elem.clone(),
            items,
        })))
    }

    pub fn str(text: impl AsRef<str>) -> Value {
        Value::Str(Arc::from(text.as_ref()))
    }

    pub fn some(inner: Value) -> Value {
        Value::Opt(Some(Box::new(inner)))
    }

    pub fn nothing() -> Value {
        Value::Opt(None)
    }

    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// Whether this value fits the given kind (invoke-time argument check).
    pub fn fits(&self, kind: &Kind) -> bool {
        match (self, kind) {
            (Value::Null, k) => k.is_reference(),
            (Value::Unit, Kind::Unit) => true,
            (Value::Bool(_), Kind::Bool) => true,
            (Value::I8(_), Kind::I8)
            | (Value::I16(_), Kind::I16)
            | (Value::I32(_), Kind::I32)
            | (Value::I64(_), Kind::I64)
            | (Value::U8(_), Kind::U8)
            | (Value::U16(_), Kind::U16)
            | (Value::U32(_), Kind::U32)
            | (Value::U64(_), Kind::U64)
            | (Value::F32(_), Kind::F32)
            | (Value::F64(_), Kind::F64) => true,
            (Value::Str(_), Kind::Str) => true,
            (Value::Opt(None), Kind::Opt(_)) => true,
            (Value::Opt(Some(inner)), Kind::Opt(elem)) => inner.fits(elem.as_ref()),
            (Value::Boxed(inner), Kind::Boxed(elem)) => inner.fits(elem.as_ref()),
            (Value::Record(rec), Kind::Record(kind)) => rec.borrow().kind == *kind,
            (Value::Array(arr), Kind::Array(elem)) => arr.borrow().elem == **elem,
            (Value::Func(func), Kind::Func(kind)) => *func.signature() == *kind,
            (Value::Opaque(op), Kind::Opaque(kind)) => op.kind.id() == kind.id(),
            _ => false,
        }
    }

    /// Identity equality: pointer identity for shared values, bit equality
    /// for primitives. This is the de-duplication rule for hoisted captured
    /// constants.
    pub fn identity_eq(&self, other: &Value) -> bool {
        match (self, other) {
            (Value::Record(a), Value::Record(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Boxed(a), Value::Boxed(b)) => Rc::ptr_eq(a, b),
            (Value::Func(_), Value::Func(_)) | (Value::Str(_), Value::Str(_)) => {
                self.ref_address() == other.ref_address()
            }
            _ => self == other,
        }
    }

    /// Address of the shared allocation, if this value is a shared reference.
    pub fn ref_address(&self) -> Option<usize> {
        match self {
            Value::Record(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Array(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Boxed(rc) => Some(Rc::as_ptr(rc) as usize),
            Value::Func(rc) => Some(Rc::as_ptr(rc) as *const () as usize),
            Value::Str(arc) => Some(Arc::as_ptr(arc) as *const () as usize),
            _ => None,
        }
    }
}

impl PartialEq for Value {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Value::Unit, Value::Unit) | (Value::Null, Value::Null) => true,
            (Value::Bool(a), Value::Bool(b)) => a == b,
            (Value::I8(a), Value::I8(b)) => a == b,
            (Value::I16(a), Value::I16(b)) => a == b,
            (Value::I32(a), Value::I32(b)) => a == b,
            (Value::I64(a), Value::I64(b)) => a == b,
            (Value::U8(a), Value::U8(b)) => a == b,
            (Value::U16(a), Value::U16(b)) => a == b,
            (Value::U32(a), Value::U32(b)) => a == b,
            (Value::U64(a), Value::U64(b)) => a == b,
            (Value::F32(a), Value::F32(b)) => a == b,
            (Value::F64(a), Value::F64(b)) => a == b,
            (Value::Str(a), Value::Str(b)) => a == b,
            (Value::Opt(a), Value::Opt(b)) => a == b,
            (Value::Boxed(a), Value::Boxed(b)) => a == b,
            (Value::Record(a), Value::Record(b)) => Rc::ptr_eq(a, b),
            (Value::Array(a), Value::Array(b)) => Rc::ptr_eq(a, b),
            (Value::Func(_), Value::Func(_)) => self.ref_address() == other.ref_address(),
            (Value::Opaque(a), Value::Opaque(b)) => {
                a.kind.id() == b.kind.id() && a.bits == b.bits
            }
            _ => false,
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Value::Unit => f.write_str("unit"),
            Value::Null => f.write_str("null"),
            Value::Bool(v) => write!(f, "{}", v),
            Value::I8(v) => write!(f, "{}", v),
            Value::I16(v) => write!(f, "{}", v),
            Value::I32(v) => write!(f, "{}", v),
            Value::I64(v) => write!(f, "{}", v),
            Value::U8(v) => write!(f, "{}", v),
            Value::U16(v) => write!(f, "{}", v),
            Value::U32(v) => write!(f, "{}", v),
            Value::U64(v) => write!(f, "{}", v),
            Value::F32(v) => write!(f, "{}", v),
            Value::F64(v) => write!(f, "{}", v),
            Value::Str(s) => write!(f, "{:?}", s),
            Value::Opt(None) => f.write_str("nothing"),
            Value::Opt(Some(inner)) => write!(f, "some({})", inner),
            Value::Boxed(inner) => write!(f, "boxed({})", inner),
            Value::Record(rec) => write!(f, "{}@{:p}", rec.borrow().kind.name, Rc::as_ptr(rec)),
            Value::Array(arr) => write!(f, "array[{}]", arr.borrow().items.len()),
            Value::Func(_) => f.write_str("callable"),
            Value::Opaque(op) => write!(f, "{}({:#x})", op.kind.name, op.bits),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kind::Field;

    fn point_kind() -> Arc<RecordKind> {
        RecordKind::new(
            "Point",
            vec![
                Field {
                    name: "x".into(),
                    kind: Kind::F64,
                },
                Field {
                    name: "y".into(),
                    kind: Kind::F64,
                },
            ],
        )
    }

    #[test]
    fn new_record_is_zeroed() {
        let v = Value::new_record(&point_kind());
        let Value::Record(rec) = &v else { panic!() };
        assert_eq!(rec.borrow().fields, vec![Value::F64(0.0), Value::F64(0.0)]);
    }

    #[test]
    fn new_array_zero_fills() {
        let v = Value::new_array(&Kind::I32, 3);
        let Value::Array(arr) = &v else { panic!() };
        assert_eq!(
            arr.borrow().items,
            vec![Value::I32(0), Value::I32(0), Value::I32(0)]
        );
    }

    #[test]
    fn null_fits_reference_kinds_only() {
        assert!(Value::Null.fits(&Kind::Record(point_kind())));
        assert!(Value::Null.fits(&Kind::Str));
        assert!(!Value::Null.fits(&Kind::I32));
        assert!(!Value::Null.fits(&Kind::opt(Kind::I32)));
    }

    #[test]
    fn record_equality_is_identity() {
        let a = Value::new_record(&point_kind());
        let b = Value::new_record(&point_kind());
        assert_ne!(a, b);
        assert_eq!(a, a.clone());
        assert!(a.identity_eq(&a.clone()));
        assert!(!a.identity_eq(&b));
    }

    #[test]
    fn zero_of_optional_is_nothing() {
        assert_eq!(Value::zero(&Kind::opt(Kind::I64)), Value::Opt(None));
    }

    #[test]
    fn nested_optional_fits() {
        let inner_absent = Value::some(Value::nothing());
        assert!(inner_absent.fits(&Kind::opt(Kind::opt(Kind::I32))));
        assert!(!inner_absent.fits(&Kind::opt(Kind::I32)));
    }
}
