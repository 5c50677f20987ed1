//! Class templates and the runtime classes built from them.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use bitflags::bitflags;

use crate::cache::SlotId;

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct ClassAttrs: u8 {
        const INTERFACE = 1 << 0;
        const TRAIT = 1 << 1;
        const ABSTRACT = 1 << 2;
        const FINAL = 1 << 3;
        /// No other unit in the program declares this name.
        const UNIQUE = 1 << 4;
    }
}

/// How early a class declaration may take effect.
///
/// Ordered from least to most hoistable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(u8)]
pub enum Hoistable {
    /// Conditional, or after a top-level `return`: only ordinary control
    /// flow may define it.
    NotHoistable = 0,
    /// Top level, but a later declaration of a name that already has a
    /// hoistable one.
    Mergeable = 1,
    /// Top level with a parent or interfaces that may not exist yet.
    MaybeHoistable = 2,
    /// Top level with nothing to resolve.
    AlwaysHoistable = 3,
}

impl Hoistable {
    pub fn is_hoistable(self) -> bool {
        self >= Hoistable::MaybeHoistable
    }
}

impl TryFrom<u8> for Hoistable {
    type Error = u8;

    fn try_from(byte: u8) -> Result<Self, u8> {
        match byte {
            0 => Ok(Hoistable::NotHoistable),
            1 => Ok(Hoistable::Mergeable),
            2 => Ok(Hoistable::MaybeHoistable),
            3 => Ok(Hoistable::AlwaysHoistable),
            other => Err(other),
        }
    }
}

/// An immutable class declaration as emitted by the compiler.
///
/// Two templates are "the same declaration" only if they are the same
/// allocation; see [`ClassTemplate::same`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClassTemplate {
    pub id: u32,
    pub name: Arc<str>,
    pub parent: Option<Arc<str>>,
    pub interfaces: Vec<Arc<str>>,
    pub attrs: ClassAttrs,
    pub methods: Vec<Arc<str>>,
    pub hoistable: Hoistable,
    pub line: u32,
    /// Bytecode offset of the declaration in the owning unit.
    pub offset: u32,
    pub unit_path: Arc<str>,
}

impl ClassTemplate {
    #[inline(always)]
    pub fn same(a: &Arc<ClassTemplate>, b: &Arc<ClassTemplate>) -> bool {
        Arc::ptr_eq(a, b)
    }

    pub fn is_interface(&self) -> bool {
        self.attrs.contains(ClassAttrs::INTERFACE)
    }

    pub fn is_trait(&self) -> bool {
        self.attrs.contains(ClassAttrs::TRAIT)
    }

    pub fn is_unique(&self) -> bool {
        self.attrs.contains(ClassAttrs::UNIQUE)
    }

    /// Names this template needs bound before it can be built, parent
    /// first.
    pub fn dependencies(&self) -> impl Iterator<Item = &Arc<str>> {
        self.parent.iter().chain(self.interfaces.iter())
    }
}

/// Outcome of checking a built class against the bindings visible to an
/// activation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Avail {
    /// Every dependency is bound to the class this one was built against.
    Available,
    /// A dependency is bound, but to a different version; this class cannot
    /// be reused here, another version might.
    TemporarilyUnavailable,
    /// A dependency is not bound at all.
    Fatal,
}

static NEXT_SERIAL: AtomicU64 = AtomicU64::new(1);

/// A runtime class: one template plus the resolved classes it was built
/// against.
pub struct Class {
    serial: u64,
    template: Arc<ClassTemplate>,
    parent: Option<Arc<Class>>,
    interfaces: Vec<Arc<Class>>,
    methods: Vec<Arc<str>>,
    slot: SlotId,
}

impl Class {
    pub(crate) fn new(
        template: Arc<ClassTemplate>,
        parent: Option<Arc<Class>>,
        interfaces: Vec<Arc<Class>>,
        slot: SlotId,
    ) -> Self {
        let mut methods: Vec<Arc<str>> = parent
            .as_ref()
            .map(|p| p.methods.clone())
            .unwrap_or_default();
        for m in &template.methods {
            if !methods.contains(m) {
                methods.push(m.clone());
            }
        }
        Self {
            serial: NEXT_SERIAL.fetch_add(1, Ordering::Relaxed),
            template,
            parent,
            interfaces,
            methods,
            slot,
        }
    }

    /// Process-unique creation number, useful in logs.
    pub fn serial(&self) -> u64 {
        self.serial
    }

    pub fn name(&self) -> &Arc<str> {
        &self.template.name
    }

    pub fn template(&self) -> &Arc<ClassTemplate> {
        &self.template
    }

    pub fn parent(&self) -> Option<&Arc<Class>> {
        self.parent.as_ref()
    }

    pub fn interfaces(&self) -> &[Arc<Class>] {
        &self.interfaces
    }

    pub fn attrs(&self) -> ClassAttrs {
        self.template.attrs
    }

    /// Own and inherited method names, parent's first.
    pub fn methods(&self) -> &[Arc<str>] {
        &self.methods
    }

    pub fn slot(&self) -> SlotId {
        self.slot
    }

    /// The classes this one was built against, in the template's
    /// dependency order.
    pub(crate) fn bound_dependencies(&self) -> impl Iterator<Item = &Arc<Class>> {
        self.parent.iter().chain(self.interfaces.iter())
    }

    /// Whether `other` extends or implements `self`.
    pub fn is_ancestor_of(self: &Arc<Self>, other: &Arc<Class>) -> bool {
        if Arc::ptr_eq(self, other) {
            return true;
        }
        other
            .bound_dependencies()
            .any(|dep| self.is_ancestor_of(dep))
    }
}

impl fmt::Debug for Class {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Class")
            .field("name", &self.template.name)
            .field("serial", &self.serial)
            .field("parent", &self.parent.as_ref().map(|p| p.serial))
            .finish()
    }
}

/// Every version ever published under one name, oldest first.
///
/// `generation` changes on every mutation so that a definer can detect
/// that another thread published between its scan and its publish.
#[derive(Debug, Default)]
pub struct ClassChain {
    pub(crate) versions: Vec<Arc<Class>>,
    pub(crate) generation: u64,
}

impl ClassChain {
    pub fn head(&self) -> Option<&Arc<Class>> {
        self.versions.last()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn len(&self) -> usize {
        self.versions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.versions.is_empty()
    }

    /// Newest first, the order definers scan in.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Class>> {
        self.versions.iter().rev()
    }

    pub(crate) fn push(&mut self, cls: Arc<Class>) {
        self.versions.push(cls);
        self.generation += 1;
    }
}
