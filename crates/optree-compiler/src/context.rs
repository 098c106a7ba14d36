//! Per-compilation emission state.
//!
//! [`EmitContext`] lives for exactly one top-level compile call: it owns
//! the option flags, the closure-state description, and the ordered list of
//! units discovered so far. [`UnitBindings`] is the
//! per-unit frame state: the typed slot pool plus parameter/local/label
//! bindings, keyed by definition identity.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use optree_core::{Kind, LabelRef, LambdaNode, LocalRef, ParamRef, RecordKind};

use crate::emit::Label;
use crate::options::CheckFlags;

// ============================================================================
// Slot pool
// ============================================================================

/// A scoped borrow of one frame slot. The slot's kind is fixed at
/// acquisition; handing the token back returns the slot to its kind's
/// free list.
#[derive(Debug)]
pub struct PooledSlot {
    pub slot: u32,
    pub kind: Kind,
}

/// Typed frame-slot pool: an arena with one free list per kind.
///
/// Acquisition reuses a released slot of the same kind when one exists and
/// grows the frame otherwise. The frame only grows; reuse reduces the slot
/// count but never reclaims frame space mid-compile.
#[derive(Debug)]
pub struct SlotPool {
    next: u32,
    free: FxHashMap<Kind, Vec<u32>>,
}

impl SlotPool {
    /// Create a pool whose first allocatable slot is `base` (slots below it
    /// hold the state record and the declared parameters).
    pub fn new(base: u32) -> Self {
        Self {
            next: base,
            free: FxHashMap::default(),
        }
    }

    pub fn acquire(&mut self, kind: &Kind) -> PooledSlot {
        if let Some(free) = self.free.get_mut(kind)
            && let Some(slot) = free.pop()
        {
            return PooledSlot {
                slot,
                kind: kind.clone(),
            };
        }
        let slot = self.next;
        self.next += 1;
        PooledSlot {
            slot,
            kind: kind.clone(),
        }
    }

    pub fn release(&mut self, token: PooledSlot) {
        self.free.entry(token.kind).or_default().push(token.slot);
    }

    /// Total frame size including the reserved prefix.
    pub fn frame_size(&self) -> u32 {
        self.next
    }
}

// ============================================================================
// Per-unit bindings
// ============================================================================

fn key<T>(arc: &Arc<T>) -> usize {
    Arc::as_ptr(arc) as usize
}

/// Frame bindings for the unit currently under emission.
#[derive(Debug)]
pub struct UnitBindings {
    pub pool: SlotPool,
    params: FxHashMap<usize, u32>,
    locals: FxHashMap<usize, u32>,
    labels: FxHashMap<usize, Label>,
}

impl UnitBindings {
    /// Lay out a unit frame: slot 0 is the state record, declared
    /// parameters follow, pooled temporaries after that.
    pub fn for_unit(state_param: Option<&ParamRef>, params: &[ParamRef]) -> Self {
        let mut map = FxHashMap::default();
        if let Some(state) = state_param {
            map.insert(key(state), 0);
        }
        for (i, param) in params.iter().enumerate() {
            map.insert(key(param), (i + 1) as u32);
        }
        Self {
            pool: SlotPool::new((params.len() + 1) as u32),
            params: map,
            locals: FxHashMap::default(),
            labels: FxHashMap::default(),
        }
    }

    pub fn param_slot(&self, param: &ParamRef) -> Option<u32> {
        self.params.get(&key(param)).copied()
    }

    pub fn bind_local(&mut self, local: &LocalRef, slot: u32) {
        self.locals.insert(key(local), slot);
    }

    pub fn unbind_local(&mut self, local: &LocalRef) {
        self.locals.remove(&key(local));
    }

    pub fn local_slot(&self, local: &LocalRef) -> Option<u32> {
        self.locals.get(&key(local)).copied()
    }

    pub fn bind_label(&mut self, label: &LabelRef, target: Label) {
        self.labels.insert(key(label), target);
    }

    pub fn unbind_label(&mut self, label: &LabelRef) {
        self.labels.remove(&key(label));
    }

    pub fn label_target(&self, label: &LabelRef) -> Option<Label> {
        self.labels.get(&key(label)).copied()
    }
}

// ============================================================================
// Compile-call context
// ============================================================================

/// Mutable state shared by every unit of one compile call.
pub struct EmitContext {
    pub options: CheckFlags,
    /// Synthetic parameter bound to slot 0 of every unit.
    pub state_param: Option<ParamRef>,
    /// Kind of the generated shared state record, when one exists.
    pub state_kind: Option<Arc<RecordKind>>,
    /// Field index of the sibling-handle array inside the state record.
    pub handle_field: Option<usize>,
    /// Units discovered so far, in reservation order. Index 0 is the outer
    /// lambda; nested lambdas append during emission.
    units: Vec<Arc<LambdaNode>>,
}

impl EmitContext {
    pub fn new(options: CheckFlags) -> Self {
        Self {
            options,
            state_param: None,
            state_kind: None,
            handle_field: None,
            units: Vec::new(),
        }
    }

    /// Reserve a unit index for a lambda. The index is stable before the
    /// unit is compiled, so mutually-referencing lambdas can be bound by
    /// index ahead of compilation. The same lambda node always maps to the
    /// same unit.
    pub fn add_unit(&mut self, lambda: Arc<LambdaNode>) -> usize {
        if let Some(index) = self.units.iter().position(|u| Arc::ptr_eq(u, &lambda)) {
            return index;
        }
        let index = self.units.len();
        self.units.push(lambda);
        index
    }

    pub fn unit(&self, index: usize) -> Option<&Arc<LambdaNode>> {
        self.units.get(index)
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use optree_core::ParamDef;

    #[test]
    fn pool_reuses_released_slots_of_same_kind() {
        let mut pool = SlotPool::new(3);
        let a = pool.acquire(&Kind::I64);
        assert_eq!(a.slot, 3);
        let a_slot = a.slot;
        pool.release(a);
        let b = pool.acquire(&Kind::I64);
        assert_eq!(b.slot, a_slot);
        assert_eq!(pool.frame_size(), 4);
    }

    #[test]
    fn pool_never_crosses_kinds() {
        let mut pool = SlotPool::new(0);
        let a = pool.acquire(&Kind::I64);
        pool.release(a);
        let b = pool.acquire(&Kind::F64);
        assert_eq!(b.slot, 1);
    }

    #[test]
    fn frame_only_grows() {
        let mut pool = SlotPool::new(0);
        let a = pool.acquire(&Kind::I32);
        let b = pool.acquire(&Kind::I32);
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.frame_size(), 2);
        let _ = pool.acquire(&Kind::I32);
        assert_eq!(pool.frame_size(), 2);
    }

    #[test]
    fn unit_layout_reserves_state_and_params() {
        let state = ParamDef::new("state", Kind::Str);
        let x = ParamDef::new("x", Kind::I64);
        let y = ParamDef::new("y", Kind::I64);
        let bindings = UnitBindings::for_unit(Some(&state), &[x.clone(), y.clone()]);
        assert_eq!(bindings.param_slot(&state), Some(0));
        assert_eq!(bindings.param_slot(&x), Some(1));
        assert_eq!(bindings.param_slot(&y), Some(2));
        assert_eq!(bindings.pool.frame_size(), 3);
    }

    #[test]
    fn unbound_param_is_none() {
        let x = ParamDef::new("x", Kind::I64);
        let other = ParamDef::new("x", Kind::I64);
        let bindings = UnitBindings::for_unit(None, &[x]);
        assert_eq!(bindings.param_slot(&other), None);
    }
}
