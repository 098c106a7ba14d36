//! Compile-time safety options.

use bitflags::bitflags;

bitflags! {
    /// Safety checks woven into emitted chains.
    ///
    /// Each flag is independent: disabling one omits that concern's escape
    /// machinery entirely and emits unguarded accesses instead, trading
    /// safety for speed. This trade-off is explicit and belongs to the
    /// caller of [`crate::compile`].
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct CheckFlags: u8 {
        /// Null and absent intermediates along member/index/call chains
        /// collapse to the target kind's zero value instead of failing.
        const NULL_CHECKS = 1 << 0;
        /// Out-of-range array reads along chains collapse to the target
        /// kind's zero value instead of failing.
        const BOUNDS_CHECKS = 1 << 1;
    }
}

impl CheckFlags {
    /// Whether null-propagation escape machinery is emitted.
    pub fn null_checks(&self) -> bool {
        self.contains(CheckFlags::NULL_CHECKS)
    }

    /// Whether bounds-escape machinery is emitted.
    pub fn bounds_checks(&self) -> bool {
        self.contains(CheckFlags::BOUNDS_CHECKS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn presets() {
        assert!(CheckFlags::all().null_checks());
        assert!(CheckFlags::all().bounds_checks());
        assert!(!CheckFlags::empty().null_checks());
        assert!(!CheckFlags::empty().bounds_checks());
    }
}
