//! Named entity directory.
//!
//! One [`NamedEntity`] per distinct symbol name, created on first lookup
//! and never removed. Entities are handed out as `Arc`s, so a reference
//! stays valid however much the table grows.

use std::sync::{Arc, OnceLock};

use dashmap::DashMap;
use log::debug;
use parking_lot::RwLock;

use crate::cache::{CacheContents, Slot, SlotId, SlotLayout};
use crate::class::{Class, ClassChain, ClassTemplate};
use crate::func::Func;
use crate::value::Value;

pub struct NamedEntity {
    name: Arc<str>,
    func_slot: OnceLock<SlotId>,
    class_slot: OnceLock<SlotId>,
    constant_slot: OnceLock<SlotId>,
    global_slot: OnceLock<SlotId>,
    /// Guarded per name; never held across a call back into the engine.
    classes: RwLock<ClassChain>,
}

impl NamedEntity {
    fn new(name: Arc<str>) -> Self {
        Self {
            name,
            func_slot: OnceLock::new(),
            class_slot: OnceLock::new(),
            constant_slot: OnceLock::new(),
            global_slot: OnceLock::new(),
            classes: RwLock::new(ClassChain::default()),
        }
    }

    pub fn name(&self) -> &Arc<str> {
        &self.name
    }

    pub fn func_slot(&self, layout: &SlotLayout) -> SlotId {
        *self.func_slot.get_or_init(|| layout.alloc())
    }

    pub fn class_slot(&self, layout: &SlotLayout) -> SlotId {
        *self.class_slot.get_or_init(|| layout.alloc())
    }

    pub fn constant_slot(&self, layout: &SlotLayout) -> SlotId {
        *self.constant_slot.get_or_init(|| layout.alloc())
    }

    pub fn global_slot(&self, layout: &SlotLayout) -> SlotId {
        *self.global_slot.get_or_init(|| layout.alloc())
    }

    /// The function this activation has bound to the name, if any.
    pub fn get_cached_func<'a>(&self, cache: &'a CacheContents) -> Option<&'a Arc<Func>> {
        cache.func(*self.func_slot.get()?)
    }

    pub fn set_cached_func(&self, layout: &SlotLayout, cache: &mut CacheContents, func: Arc<Func>) {
        let slot = func.set_cached_slot(self.func_slot(layout));
        cache.set(slot, Slot::Func(func));
    }

    /// The class this activation has bound to the name, if any.
    pub fn get_cached_class<'a>(&self, cache: &'a CacheContents) -> Option<&'a Arc<Class>> {
        cache.class(*self.class_slot.get()?)
    }

    pub fn get_cached_constant<'a>(&self, cache: &'a CacheContents) -> Option<&'a Value> {
        cache.value(*self.constant_slot.get()?)
    }

    pub fn get_cached_global<'a>(&self, cache: &'a CacheContents) -> Option<&'a Value> {
        cache.value(*self.global_slot.get()?)
    }

    /// Versions built from `template`, newest first.
    pub(crate) fn versions_of(&self, template: &Arc<ClassTemplate>) -> (Vec<Arc<Class>>, u64) {
        let chain = self.classes.read();
        let versions = chain
            .iter()
            .filter(|c| ClassTemplate::same(c.template(), template))
            .cloned()
            .collect();
        (versions, chain.generation())
    }

    /// Publish `cls` unless the chain moved past `seen`.
    ///
    /// Returns `false` if another definer got there first; the caller
    /// must rescan.
    pub(crate) fn try_publish(&self, cls: &Arc<Class>, seen: u64) -> bool {
        let mut chain = self.classes.write();
        if chain.generation() != seen {
            return false;
        }
        chain.push(cls.clone());
        true
    }

    /// Number of class versions currently kept for this name.
    pub fn class_versions(&self) -> usize {
        self.classes.read().len()
    }

    pub fn class_head(&self) -> Option<Arc<Class>> {
        self.classes.read().head().cloned()
    }

    /// The only version ever kept for this name, if it was built from
    /// `template`.
    pub(crate) fn sole_class(&self, template: &Arc<ClassTemplate>) -> Option<Arc<Class>> {
        let chain = self.classes.read();
        match chain.head() {
            Some(cls) if chain.len() == 1 && ClassTemplate::same(cls.template(), template) => {
                Some(cls.clone())
            }
            _ => None,
        }
    }

    /// Drop versions that are neither the newest nor referenced from
    /// anywhere but the chain.
    fn reclaim(&self) -> usize {
        let mut chain = self.classes.write();
        let Some(head) = chain.head().cloned() else {
            return 0;
        };
        let before = chain.versions.len();
        chain
            .versions
            .retain(|c| Arc::ptr_eq(c, &head) || Arc::strong_count(c) > 1);
        let dropped = before - chain.versions.len();
        if dropped > 0 {
            chain.generation += 1;
        }
        dropped
    }
}

impl std::fmt::Debug for NamedEntity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NamedEntity")
            .field("name", &self.name)
            .field("func_slot", &self.func_slot.get())
            .field("class_slot", &self.class_slot.get())
            .finish()
    }
}

/// Process-wide name table plus the cache slot layout.
#[derive(Debug)]
pub struct Directory {
    entities: DashMap<Arc<str>, Arc<NamedEntity>, ahash::RandomState>,
    layout: SlotLayout,
}

impl Default for Directory {
    fn default() -> Self {
        Self::new()
    }
}

impl Directory {
    pub fn new() -> Self {
        Self {
            entities: DashMap::with_hasher(ahash::RandomState::new()),
            layout: SlotLayout::new(),
        }
    }

    pub fn layout(&self) -> &SlotLayout {
        &self.layout
    }

    pub fn lookup_or_create(&self, name: &str) -> Arc<NamedEntity> {
        // Fast path: already interned
        if let Some(entity) = self.entities.get(name) {
            return entity.clone();
        }
        let name: Arc<str> = Arc::from(name);
        self.entities
            .entry(name.clone())
            .or_insert_with(|| Arc::new(NamedEntity::new(name)))
            .clone()
    }

    pub fn get(&self, name: &str) -> Option<Arc<NamedEntity>> {
        self.entities.get(name).map(|e| e.clone())
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Names of all functions bound in `cache`, sorted.
    pub fn defined_functions(&self, cache: &CacheContents) -> Vec<Arc<str>> {
        let mut names: Vec<Arc<str>> = self
            .entities
            .iter()
            .filter(|e| e.get_cached_func(cache).is_some())
            .map(|e| e.name.clone())
            .collect();
        names.sort();
        names
    }

    /// Classes bound in `cache` that satisfy `filter`, sorted by name.
    pub fn declared_classes(
        &self,
        cache: &CacheContents,
        filter: impl Fn(&Class) -> bool,
    ) -> Vec<Arc<Class>> {
        let mut classes: Vec<Arc<Class>> = self
            .entities
            .iter()
            .filter_map(|e| e.get_cached_class(cache).cloned())
            .filter(|c| filter(c))
            .collect();
        classes.sort_by(|a, b| a.name().cmp(b.name()));
        classes
    }

    /// Drop class versions that are no longer current and no longer
    /// referenced. Returns how many were dropped.
    pub fn reclaim(&self) -> usize {
        let dropped: usize = self.entities.iter().map(|e| e.reclaim()).sum();
        if dropped > 0 {
            debug!("reclaimed {dropped} class versions");
        }
        dropped
    }
}
