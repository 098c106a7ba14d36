//! Deterministic hash-based kind identity.
//!
//! This module provides [`KindHash`], a 64-bit hash that identifies kinds
//! structurally. Hashes are computed deterministically from names and
//! component kinds, enabling:
//!
//! - Identity comparison for user-defined value kinds
//! - Stable cache keys for generated callable-adapter kinds
//! - Single map lookups without secondary name maps
//!
//! # Hash Computation
//!
//! Uses XXHash64 with domain-specific mixing constants so that different
//! entity families (opaque kinds, records, function shapes) produce distinct
//! hashes even when they share a name.

use std::fmt;

use xxhash_rust::xxh64::xxh64;

/// Domain-specific mixing constants for hash computation.
///
/// These constants ensure that different kind families produce distinct
/// hashes even if they share the same name or component list.
pub mod hash_constants {
    /// Separator constant for component lists.
    pub const SEP: u64 = 0x4bc94d6bd06053ad;

    /// Domain marker for primitive kinds.
    pub const PRIMITIVE: u64 = 0x2fac10b63a6cc57c;

    /// Domain marker for record kinds.
    pub const RECORD: u64 = 0x5ea77ffbcdf5f302;

    /// Domain marker for array kinds.
    pub const ARRAY: u64 = 0x7d3c8b4a92e15f6d;

    /// Domain marker for function (callable-handle) kinds.
    pub const FUNC: u64 = 0x3e9f5d2a8c7b1403;

    /// Domain marker for optional wrappers.
    pub const OPTIONAL: u64 = 0x9a7f3d5e2b8c4601;

    /// Domain marker for boxed value kinds.
    pub const BOXED: u64 = 0x1a095090689d4647;

    /// Domain marker for user-defined opaque value kinds.
    pub const OPAQUE: u64 = 0xd6e8feb86659fd93;

    /// Domain marker for generated callable-adapter shapes.
    pub const SHIM: u64 = 0xe7037ed1a0b428db;
}

/// A deterministic 64-bit kind identity hash.
///
/// Two kinds with the same structure always produce the same hash, across
/// processes and compile calls. Used for opaque-kind identity and as the
/// key of the process-wide adapter-kind cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct KindHash(u64);

impl KindHash {
    /// Construct from a raw hash value.
    pub const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    /// Get the raw 64-bit value.
    pub const fn raw(&self) -> u64 {
        self.0
    }

    /// Hash a name within a domain.
    pub fn from_name(domain: u64, name: &str) -> Self {
        Self(xxh64(name.as_bytes(), domain))
    }

    /// Hash a domain marker plus a list of component hashes.
    ///
    /// Component order matters: `[a, b]` and `[b, a]` produce different
    /// hashes.
    pub fn combine(domain: u64, components: &[KindHash]) -> Self {
        let mut acc = domain;
        for component in components {
            acc = mix(acc, hash_constants::SEP);
            acc = mix(acc, component.0);
        }
        Self(acc)
    }

    /// Hash a named entity plus a list of component hashes.
    pub fn from_named(domain: u64, name: &str, components: &[KindHash]) -> Self {
        let mut acc = xxh64(name.as_bytes(), domain);
        for component in components {
            acc = mix(acc, hash_constants::SEP);
            acc = mix(acc, component.0);
        }
        Self(acc)
    }
}

/// Mix two hash values (xxh64 of one keyed by the other).
fn mix(seed: u64, value: u64) -> u64 {
    xxh64(&value.to_le_bytes(), seed)
}

impl fmt::Display for KindHash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn name_hash_is_deterministic() {
        let a = KindHash::from_name(hash_constants::OPAQUE, "money");
        let b = KindHash::from_name(hash_constants::OPAQUE, "money");
        assert_eq!(a, b);
    }

    #[test]
    fn domains_separate_same_name() {
        let opaque = KindHash::from_name(hash_constants::OPAQUE, "point");
        let record = KindHash::from_name(hash_constants::RECORD, "point");
        assert_ne!(opaque, record);
    }

    #[test]
    fn component_order_matters() {
        let x = KindHash::from_name(hash_constants::PRIMITIVE, "i32");
        let y = KindHash::from_name(hash_constants::PRIMITIVE, "i64");
        let xy = KindHash::combine(hash_constants::FUNC, &[x, y]);
        let yx = KindHash::combine(hash_constants::FUNC, &[y, x]);
        assert_ne!(xy, yx);
    }

    #[test]
    fn display_is_hex() {
        let h = KindHash::from_raw(0xdead_beef);
        assert_eq!(h.to_string(), "00000000deadbeef");
    }
}
