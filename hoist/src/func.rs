use std::sync::{Arc, OnceLock};

use bitflags::bitflags;

use crate::cache::SlotId;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct FuncAttrs: u8 {
        /// The unit's synthetic top-level function.
        const MAIN = 1 << 0;
        /// Declared unconditionally at top level; bound on every merge.
        const TOP = 1 << 1;
        /// No other unit in the program declares this name.
        const UNIQUE = 1 << 2;
    }
}

/// Compiler-side description of a function, before it belongs to a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuncTemplate {
    pub name: Arc<str>,
    pub attrs: FuncAttrs,
    /// Bytecode range `[base, past)` within the owning unit.
    pub base: u32,
    pub past: u32,
    pub line: u32,
}

/// A function bound to its unit.
#[derive(Debug)]
pub struct Func {
    id: u32,
    name: Arc<str>,
    attrs: FuncAttrs,
    base: u32,
    past: u32,
    line: u32,
    unit_path: Arc<str>,
    slot: OnceLock<SlotId>,
}

impl Func {
    pub(crate) fn new(id: u32, template: &FuncTemplate, unit_path: Arc<str>) -> Self {
        Self {
            id,
            name: template.name.clone(),
            attrs: template.attrs,
            base: template.base,
            past: template.past,
            line: template.line,
            unit_path,
            slot: OnceLock::new(),
        }
    }

    /// Index of this function in its unit.
    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn attrs(&self) -> FuncAttrs {
        self.attrs
    }

    pub fn is_main(&self) -> bool {
        self.attrs.contains(FuncAttrs::MAIN)
    }

    pub fn is_top(&self) -> bool {
        self.attrs.contains(FuncAttrs::TOP)
    }

    pub fn base(&self) -> u32 {
        self.base
    }

    pub fn past(&self) -> u32 {
        self.past
    }

    pub fn line(&self) -> u32 {
        self.line
    }

    pub fn unit_path(&self) -> &Arc<str> {
        &self.unit_path
    }

    pub fn contains(&self, offset: u32) -> bool {
        self.base <= offset && offset < self.past
    }

    /// The cache slot this function publishes into, once assigned.
    pub fn cached_slot(&self) -> Option<SlotId> {
        self.slot.get().copied()
    }

    pub(crate) fn set_cached_slot(&self, slot: SlotId) -> SlotId {
        *self.slot.get_or_init(|| slot)
    }

    pub(crate) fn rename(&mut self, name: Arc<str>) {
        self.name = name;
    }

    pub(crate) fn template(&self) -> FuncTemplate {
        FuncTemplate {
            name: self.name.clone(),
            attrs: self.attrs,
            base: self.base,
            past: self.past,
            line: self.line,
        }
    }
}
