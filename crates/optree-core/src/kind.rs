//! The kind system for operation trees and the simulated stack.
//!
//! Kinds split into two families with different verification rules:
//!
//! - **Value kinds**: primitives, optionals, and user-defined opaque kinds.
//!   Primitives merge on the simulated stack by storage size; opaque kinds
//!   require exact identity.
//! - **Reference kinds**: records, arrays, callable handles, boxed values,
//!   and text. Reference kinds are nullable and mutually assignable on the
//!   simulated stack.

use std::fmt;
use std::sync::Arc;

use crate::kind_hash::{KindHash, hash_constants};

// ============================================================================
// Numeric kinds
// ============================================================================

/// The primitive numeric kinds, in conversion-matrix order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum NumKind {
    I8 = 0,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl NumKind {
    /// All numeric kinds, for matrix-style iteration.
    pub const ALL: [NumKind; 10] = [
        NumKind::I8,
        NumKind::I16,
        NumKind::I32,
        NumKind::I64,
        NumKind::U8,
        NumKind::U16,
        NumKind::U32,
        NumKind::U64,
        NumKind::F32,
        NumKind::F64,
    ];

    /// Decode from the byte emitted as an instruction operand.
    pub fn from_u8(value: u8) -> Option<NumKind> {
        NumKind::ALL.get(value as usize).copied()
    }

    /// Storage size in bytes.
    pub fn size(&self) -> u8 {
        match self {
            NumKind::I8 | NumKind::U8 => 1,
            NumKind::I16 | NumKind::U16 => 2,
            NumKind::I32 | NumKind::U32 | NumKind::F32 => 4,
            NumKind::I64 | NumKind::U64 | NumKind::F64 => 8,
        }
    }

    pub fn is_float(&self) -> bool {
        matches!(self, NumKind::F32 | NumKind::F64)
    }

    pub fn is_signed(&self) -> bool {
        matches!(
            self,
            NumKind::I8 | NumKind::I16 | NumKind::I32 | NumKind::I64 | NumKind::F32 | NumKind::F64
        )
    }

    /// Lowercase mnemonic used in instruction traces.
    pub fn mnemonic(&self) -> &'static str {
        match self {
            NumKind::I8 => "i8",
            NumKind::I16 => "i16",
            NumKind::I32 => "i32",
            NumKind::I64 => "i64",
            NumKind::U8 => "u8",
            NumKind::U16 => "u16",
            NumKind::U32 => "u32",
            NumKind::U64 => "u64",
            NumKind::F32 => "f32",
            NumKind::F64 => "f64",
        }
    }
}

impl fmt::Display for NumKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.mnemonic())
    }
}

// ============================================================================
// Composite kind definitions
// ============================================================================

/// A named field of a record kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Field {
    pub name: String,
    pub kind: Kind,
}

/// A record kind: a named aggregate with ordered, named fields.
///
/// Records are reference kinds: values are shared, nullable, and
/// parameterless-constructible (a fresh instance has every field at its
/// kind's zero value).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RecordKind {
    pub name: String,
    pub fields: Vec<Field>,
}

impl RecordKind {
    pub fn new(name: impl Into<String>, fields: Vec<Field>) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            fields,
        })
    }

    /// Look up a field index by name.
    pub fn field_index(&self, name: &str) -> Option<usize> {
        self.fields.iter().position(|f| f.name == name)
    }

    pub fn field(&self, index: usize) -> Option<&Field> {
        self.fields.get(index)
    }

    /// Structural identity hash of this record kind.
    pub fn hash_id(&self) -> KindHash {
        let components: Vec<KindHash> = self.fields.iter().map(|f| f.kind.hash_id()).collect();
        KindHash::from_named(hash_constants::RECORD, &self.name, &components)
    }
}

/// A callable-handle kind: parameter kinds plus a return kind.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FuncKind {
    pub params: Vec<Kind>,
    pub ret: Kind,
}

impl FuncKind {
    pub fn new(params: Vec<Kind>, ret: Kind) -> Arc<Self> {
        Arc::new(Self { params, ret })
    }

    /// Shape hash over parameter kinds and return kind.
    pub fn hash_id(&self) -> KindHash {
        let mut components: Vec<KindHash> = self.params.iter().map(Kind::hash_id).collect();
        components.push(self.ret.hash_id());
        KindHash::combine(hash_constants::FUNC, &components)
    }
}

/// A user-defined opaque value kind.
///
/// Opaque kinds carry a fixed-width payload and participate in verification
/// by exact identity only: two opaque kinds are the same kind if and only if
/// their identity hashes match.
#[derive(Debug, Clone)]
pub struct OpaqueKind {
    pub name: String,
    id: KindHash,
}

impl OpaqueKind {
    pub fn new(name: impl Into<String>) -> Arc<Self> {
        let name = name.into();
        let id = KindHash::from_name(hash_constants::OPAQUE, &name);
        Arc::new(Self { name, id })
    }

    pub fn id(&self) -> KindHash {
        self.id
    }
}

impl PartialEq for OpaqueKind {
    fn eq(&self, other: &Self) -> bool {
        self.id == other.id
    }
}

impl Eq for OpaqueKind {}

impl std::hash::Hash for OpaqueKind {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.id.hash(state);
    }
}

// ============================================================================
// Kind
// ============================================================================

/// A kind: the static type of a tree node, stack entry, slot, or field.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Kind {
    /// The empty result of statement-like nodes.
    Unit,
    Bool,
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
    /// Text. Reference-like (nullable), but never hoisted into closure state.
    Str,
    /// Optional wrapper: present value or absent. A value kind; nestable.
    Opt(Arc<Kind>),
    /// A value kind lifted into a reference shell.
    Boxed(Arc<Kind>),
    Record(Arc<RecordKind>),
    Array(Arc<Kind>),
    Func(Arc<FuncKind>),
    Opaque(Arc<OpaqueKind>),
}

impl Kind {
    pub fn opt(inner: Kind) -> Kind {
        Kind::Opt(Arc::new(inner))
    }

    pub fn boxed(inner: Kind) -> Kind {
        Kind::Boxed(Arc::new(inner))
    }

    pub fn array(elem: Kind) -> Kind {
        Kind::Array(Arc::new(elem))
    }

    pub fn func(params: Vec<Kind>, ret: Kind) -> Kind {
        Kind::Func(FuncKind::new(params, ret))
    }

    /// Whether values of this kind are nullable shared references.
    pub fn is_reference(&self) -> bool {
        matches!(
            self,
            Kind::Str | Kind::Boxed(_) | Kind::Record(_) | Kind::Array(_) | Kind::Func(_)
        )
    }

    /// The numeric kind, if this is a primitive numeric.
    pub fn numeric(&self) -> Option<NumKind> {
        match self {
            Kind::I8 => Some(NumKind::I8),
            Kind::I16 => Some(NumKind::I16),
            Kind::I32 => Some(NumKind::I32),
            Kind::I64 => Some(NumKind::I64),
            Kind::U8 => Some(NumKind::U8),
            Kind::U16 => Some(NumKind::U16),
            Kind::U32 => Some(NumKind::U32),
            Kind::U64 => Some(NumKind::U64),
            Kind::F32 => Some(NumKind::F32),
            Kind::F64 => Some(NumKind::F64),
            _ => None,
        }
    }

    pub fn from_numeric(nk: NumKind) -> Kind {
        match nk {
            NumKind::I8 => Kind::I8,
            NumKind::I16 => Kind::I16,
            NumKind::I32 => Kind::I32,
            NumKind::I64 => Kind::I64,
            NumKind::U8 => Kind::U8,
            NumKind::U16 => Kind::U16,
            NumKind::U32 => Kind::U32,
            NumKind::U64 => Kind::U64,
            NumKind::F32 => Kind::F32,
            NumKind::F64 => Kind::F64,
        }
    }

    /// Storage size in bytes for primitive value kinds.
    pub fn storage_size(&self) -> Option<u8> {
        match self {
            Kind::Bool => Some(1),
            _ => self.numeric().map(|nk| nk.size()),
        }
    }

    /// Storage compatibility: the merge rule for simulated-stack entries.
    ///
    /// Reference kinds are mutually assignable. Primitive numeric kinds
    /// merge by storage size. Opaque kinds require exact identity. Anything
    /// else requires structural equality.
    pub fn storage_compatible(&self, other: &Kind) -> bool {
        if self == other {
            return true;
        }
        if self.is_reference() && other.is_reference() {
            return true;
        }
        if let (Some(a), Some(b)) = (self.numeric(), other.numeric()) {
            return a.size() == b.size();
        }
        false
    }

    /// Structural identity hash.
    pub fn hash_id(&self) -> KindHash {
        match self {
            Kind::Unit => KindHash::from_name(hash_constants::PRIMITIVE, "unit"),
            Kind::Bool => KindHash::from_name(hash_constants::PRIMITIVE, "bool"),
            Kind::Str => KindHash::from_name(hash_constants::PRIMITIVE, "str"),
            Kind::Opt(inner) => KindHash::combine(hash_constants::OPTIONAL, &[inner.hash_id()]),
            Kind::Boxed(inner) => KindHash::combine(hash_constants::BOXED, &[inner.hash_id()]),
            Kind::Record(rec) => rec.hash_id(),
            Kind::Array(elem) => KindHash::combine(hash_constants::ARRAY, &[elem.hash_id()]),
            Kind::Func(func) => func.hash_id(),
            Kind::Opaque(op) => op.id(),
            _ => KindHash::from_name(
                hash_constants::PRIMITIVE,
                self.numeric().expect("primitive").mnemonic(),
            ),
        }
    }
}

impl fmt::Display for Kind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Kind::Unit => f.write_str("unit"),
            Kind::Bool => f.write_str("bool"),
            Kind::Str => f.write_str("str"),
            Kind::Opt(inner) => write!(f, "{}?", inner),
            Kind::Boxed(inner) => write!(f, "boxed<{}>", inner),
            Kind::Record(rec) => f.write_str(&rec.name),
            Kind::Array(elem) => write!(f, "{}[]", elem),
            Kind::Func(func) => {
                f.write_str("fn(")?;
                for (i, p) in func.params.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{}", p)?;
                }
                write!(f, ") -> {}", func.ret)
            }
            Kind::Opaque(op) => f.write_str(&op.name),
            _ => f.write_str(self.numeric().expect("primitive").mnemonic()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn numeric_round_trip() {
        for nk in NumKind::ALL {
            assert_eq!(NumKind::from_u8(nk as u8), Some(nk));
        }
        assert_eq!(NumKind::from_u8(200), None);
    }

    #[test]
    fn storage_sizes() {
        assert_eq!(Kind::I32.storage_size(), Some(4));
        assert_eq!(Kind::U32.storage_size(), Some(4));
        assert_eq!(Kind::F64.storage_size(), Some(8));
        assert_eq!(Kind::Bool.storage_size(), Some(1));
        assert_eq!(Kind::Str.storage_size(), None);
    }

    #[test]
    fn same_size_primitives_are_compatible() {
        assert!(Kind::I32.storage_compatible(&Kind::U32));
        assert!(!Kind::I32.storage_compatible(&Kind::I64));
        assert!(!Kind::I32.storage_compatible(&Kind::F64));
    }

    #[test]
    fn reference_kinds_are_mutually_compatible() {
        let rec = Kind::Record(RecordKind::new("A", vec![]));
        let arr = Kind::array(Kind::I32);
        assert!(rec.storage_compatible(&arr));
        assert!(rec.storage_compatible(&Kind::Str));
        assert!(!rec.storage_compatible(&Kind::I32));
    }

    #[test]
    fn opaque_identity() {
        let a = Kind::Opaque(OpaqueKind::new("money"));
        let b = Kind::Opaque(OpaqueKind::new("money"));
        let c = Kind::Opaque(OpaqueKind::new("weight"));
        assert!(a.storage_compatible(&b));
        assert!(!a.storage_compatible(&c));
    }

    #[test]
    fn record_field_lookup() {
        let rec = RecordKind::new(
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
        );
        assert_eq!(rec.field_index("y"), Some(1));
        assert_eq!(rec.field_index("z"), None);
    }

    #[test]
    fn hash_id_distinguishes_shapes() {
        let f1 = Kind::func(vec![Kind::I32], Kind::I64);
        let f2 = Kind::func(vec![Kind::I64], Kind::I32);
        assert_ne!(f1.hash_id(), f2.hash_id());
        assert_eq!(f1.hash_id(), Kind::func(vec![Kind::I32], Kind::I64).hash_id());
    }

    #[test]
    fn display_forms() {
        assert_eq!(Kind::array(Kind::I32).to_string(), "i32[]");
        assert_eq!(Kind::opt(Kind::I64).to_string(), "i64?");
        assert_eq!(
            Kind::func(vec![Kind::I32, Kind::Str], Kind::Bool).to_string(),
            "fn(i32, str) -> bool"
        );
    }
}
