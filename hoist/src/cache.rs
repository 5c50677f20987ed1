//! Fast lookup cache.
//!
//! The *layout* is process-wide: every name that needs a cached binding is
//! given a [`SlotId`] once, and the id never changes. The *contents* are
//! per activation: each [`Activation`](crate::Activation) owns a
//! [`CacheContents`] indexed by those ids, so reading a binding is a bounds
//! check and a load.

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};

use crate::class::Class;
use crate::func::Func;
use crate::value::Value;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SlotId(pub u32);

/// One bit in the per-activation "already included" bitmap.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct IncludeBit(pub u32);

/// Process-wide slot allocator.
#[derive(Debug)]
pub struct SlotLayout {
    next_slot: AtomicU32,
    next_include_bit: AtomicU32,
}

impl SlotLayout {
    pub fn new() -> Self {
        Self {
            next_slot: AtomicU32::new(0),
            next_include_bit: AtomicU32::new(0),
        }
    }

    pub fn alloc(&self) -> SlotId {
        SlotId(self.next_slot.fetch_add(1, Ordering::Relaxed))
    }

    pub fn alloc_include_bit(&self) -> IncludeBit {
        IncludeBit(self.next_include_bit.fetch_add(1, Ordering::Relaxed))
    }

    /// Number of slots handed out so far.
    pub fn len(&self) -> usize {
        self.next_slot.load(Ordering::Relaxed) as usize
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for SlotLayout {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Default)]
pub enum Slot {
    #[default]
    Empty,
    Func(Arc<Func>),
    Class(Arc<Class>),
    Value(Value),
}

static EMPTY: Slot = Slot::Empty;

/// Per-activation slot contents.
#[derive(Debug, Default)]
pub struct CacheContents {
    slots: Vec<Slot>,
    included: Vec<u64>,
}

impl CacheContents {
    pub fn with_capacity(slots: usize) -> Self {
        Self {
            slots: Vec::with_capacity(slots),
            included: Vec::new(),
        }
    }

    #[inline(always)]
    pub fn get(&self, slot: SlotId) -> &Slot {
        self.slots.get(slot.0 as usize).unwrap_or(&EMPTY)
    }

    pub fn set(&mut self, slot: SlotId, value: Slot) {
        let idx = slot.0 as usize;
        if idx >= self.slots.len() {
            self.slots.resize(idx + 1, Slot::Empty);
        }
        self.slots[idx] = value;
    }

    pub fn func(&self, slot: SlotId) -> Option<&Arc<Func>> {
        match self.get(slot) {
            Slot::Func(func) => Some(func),
            _ => None,
        }
    }

    pub fn class(&self, slot: SlotId) -> Option<&Arc<Class>> {
        match self.get(slot) {
            Slot::Class(cls) => Some(cls),
            _ => None,
        }
    }

    pub fn value(&self, slot: SlotId) -> Option<&Value> {
        match self.get(slot) {
            Slot::Value(v) => Some(v),
            _ => None,
        }
    }

    pub fn is_included(&self, bit: IncludeBit) -> bool {
        let (word, mask) = Self::bit_pos(bit);
        self.included.get(word).is_some_and(|w| w & mask != 0)
    }

    /// Set the include bit, returning whether it was already set.
    pub fn mark_included(&mut self, bit: IncludeBit) -> bool {
        let (word, mask) = Self::bit_pos(bit);
        if word >= self.included.len() {
            self.included.resize(word + 1, 0);
        }
        let was = self.included[word] & mask != 0;
        self.included[word] |= mask;
        was
    }

    /// Iterate the occupied slots.
    pub fn iter(&self) -> impl Iterator<Item = (SlotId, &Slot)> {
        self.slots
            .iter()
            .enumerate()
            .filter(|(_, s)| !matches!(s, Slot::Empty))
            .map(|(i, s)| (SlotId(i as u32), s))
    }

    fn bit_pos(bit: IncludeBit) -> (usize, u64) {
        ((bit.0 / 64) as usize, 1u64 << (bit.0 % 64))
    }
}
