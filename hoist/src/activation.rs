//! One independent execution context.
//!
//! An activation owns its fast-cache contents, its include bitmap, its
//! diagnostic frames and the warnings raised so far. It shares everything
//! else with the other activations of the same [`Runtime`](crate::Runtime).

use std::fmt;
use std::sync::Arc;

use log::{trace, warn};

use crate::cache::{CacheContents, Slot};
use crate::class::{Class, ClassAttrs};
use crate::error::{MergeError, MergeErrorKind, Warning};
use crate::func::Func;
use crate::names::Directory;
use crate::runtime::RuntimeShared;
use crate::unit::{IncludeKind, Unit};
use crate::value::Value;

/// A diagnostic call frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub function: Arc<str>,
    pub path: Arc<str>,
    pub line: u32,
}

impl fmt::Display for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {}:{}", self.function, self.path, self.line)
    }
}

pub struct Activation {
    pub(crate) shared: Arc<RuntimeShared>,
    pub(crate) cache: CacheContents,
    frames: Vec<Frame>,
    warnings: Vec<Warning>,
}

impl Activation {
    pub(crate) fn new(shared: Arc<RuntimeShared>, cache: CacheContents) -> Self {
        Self {
            shared,
            cache,
            frames: Vec::new(),
            warnings: Vec::new(),
        }
    }

    pub fn directory(&self) -> &Directory {
        &self.shared.directory
    }

    pub fn cache(&self) -> &CacheContents {
        &self.cache
    }

    // ── lookups ────────────────────────────────────────────────────

    pub fn lookup_func(&self, name: &str) -> Option<Arc<Func>> {
        let entity = self.shared.directory.get(name)?;
        entity.get_cached_func(&self.cache).cloned()
    }

    pub fn lookup_class(&self, name: &str) -> Option<Arc<Class>> {
        let entity = self.shared.directory.get(name)?;
        entity.get_cached_class(&self.cache).cloned()
    }

    /// Look a class up, autoloading it if it is not bound yet.
    pub fn load_class(&mut self, name: &str) -> Result<Option<Arc<Class>>, MergeError> {
        if let Some(cls) = self.lookup_class(name) {
            return Ok(Some(cls));
        }
        self.autoload_class(name)
    }

    pub(crate) fn autoload_class(&mut self, name: &str) -> Result<Option<Arc<Class>>, MergeError> {
        let Some(autoloader) = self.shared.autoloader.clone() else {
            return Ok(None);
        };
        trace!("autoloading {name}");
        autoloader.autoload(self, name)?;
        Ok(self.lookup_class(name))
    }

    /// Bind a function to its name, failing if a different function is
    /// already bound.
    pub fn define_function(&mut self, func: &Arc<Func>) -> Result<(), MergeError> {
        let entity = self.shared.directory.lookup_or_create(func.name());
        match entity.get_cached_func(&self.cache) {
            Some(existing) if Arc::ptr_eq(existing, func) => Ok(()),
            Some(_) => Err(self.error(MergeError::function_conflict(func.name()))),
            None => {
                entity.set_cached_func(self.shared.directory.layout(), &mut self.cache, func.clone());
                Ok(())
            }
        }
    }

    // ── constants and globals ──────────────────────────────────────

    /// Define a constant. The first definition wins; later ones record a
    /// warning and return `false`.
    pub fn define_constant(&mut self, name: &str, value: Value) -> bool {
        let entity = self.shared.directory.lookup_or_create(name);
        let slot = entity.constant_slot(self.shared.directory.layout());
        if self.cache.value(slot).is_some() {
            self.warn(Warning::ConstantRedefined {
                name: entity.name().clone(),
            });
            return false;
        }
        self.cache.set(slot, Slot::Value(value));
        true
    }

    pub fn constant(&self, name: &str) -> Option<Value> {
        let entity = self.shared.directory.get(name)?;
        entity.get_cached_constant(&self.cache).cloned()
    }

    /// Assign a global. As with constants, the first assignment wins.
    pub fn set_global(&mut self, name: &str, value: Value) -> bool {
        let entity = self.shared.directory.lookup_or_create(name);
        let slot = entity.global_slot(self.shared.directory.layout());
        if self.cache.value(slot).is_some() {
            self.warn(Warning::GlobalRedefined {
                name: entity.name().clone(),
            });
            return false;
        }
        self.cache.set(slot, Slot::Value(value));
        true
    }

    pub fn global(&self, name: &str) -> Option<Value> {
        let entity = self.shared.directory.get(name)?;
        entity.get_cached_global(&self.cache).cloned()
    }

    // ── includes ───────────────────────────────────────────────────

    /// Merge `unit` and run its top level, once per activation.
    ///
    /// Returns the top level's value, or `true` if the unit was already
    /// included.
    pub fn include(&mut self, unit: &Arc<Unit>) -> Result<Value, MergeError> {
        let bit = unit.include_bit(self.shared.directory.layout());
        if self.cache.mark_included(bit) {
            trace!("{} already included", unit.path());
            return Ok(Value::Bool(true));
        }
        self.merge(unit)?;
        if unit.is_merge_only() {
            return Ok(unit.main_return().cloned().unwrap_or(Value::Null));
        }
        let engine = self.shared.engine.clone();
        engine.invoke_top(self, unit)
    }

    /// Resolve an include directive of `from` and include the result.
    pub fn include_by_name(
        &mut self,
        from: &Unit,
        kind: IncludeKind,
        name: &str,
    ) -> Result<Value, MergeError> {
        let unit = self.resolve_include(from, kind, name)?;
        self.include(&unit)
    }

    pub(crate) fn resolve_include(
        &self,
        from: &Unit,
        kind: IncludeKind,
        name: &str,
    ) -> Result<Arc<Unit>, MergeError> {
        self.shared
            .loader
            .load_unit(name, kind, from)
            .ok_or_else(|| {
                self.error(MergeError::new(MergeErrorKind::UnresolvedInclude {
                    name: Arc::from(name),
                }))
            })
    }

    // ── diagnostics ────────────────────────────────────────────────

    pub fn warnings(&self) -> &[Warning] {
        &self.warnings
    }

    pub fn take_warnings(&mut self) -> Vec<Warning> {
        std::mem::take(&mut self.warnings)
    }

    fn warn(&mut self, warning: Warning) {
        warn!("{warning}");
        self.warnings.push(warning);
    }

    pub fn frames(&self) -> &[Frame] {
        &self.frames
    }

    pub(crate) fn push_frame(&mut self, frame: Frame) {
        self.frames.push(frame);
    }

    pub(crate) fn pop_frame(&mut self) {
        self.frames.pop();
    }

    pub(crate) fn set_line(&mut self, line: u32) {
        if let Some(frame) = self.frames.last_mut() {
            frame.line = line;
        }
    }

    /// Attach the current frames to `err`.
    pub(crate) fn error(&self, err: MergeError) -> MergeError {
        err.with_backtrace(&self.frames)
    }

    // ── reflection ─────────────────────────────────────────────────

    pub fn defined_functions(&self) -> Vec<Arc<str>> {
        self.shared.directory.defined_functions(&self.cache)
    }

    /// Bound classes that are neither interfaces nor traits.
    pub fn declared_classes(&self) -> Vec<Arc<Class>> {
        self.shared.directory.declared_classes(&self.cache, |c| {
            !c.attrs().intersects(ClassAttrs::INTERFACE | ClassAttrs::TRAIT)
        })
    }

    pub fn declared_interfaces(&self) -> Vec<Arc<Class>> {
        self.shared
            .directory
            .declared_classes(&self.cache, |c| c.attrs().contains(ClassAttrs::INTERFACE))
    }

    pub fn declared_traits(&self) -> Vec<Arc<Class>> {
        self.shared
            .directory
            .declared_classes(&self.cache, |c| c.attrs().contains(ClassAttrs::TRAIT))
    }
}

impl fmt::Debug for Activation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Activation")
            .field("frames", &self.frames)
            .field("warnings", &self.warnings.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use crate::runtime::Runtime;
    use crate::value::Value;
    use crate::error::Warning;

    #[test]
    fn first_constant_definition_wins() {
        let rt = Runtime::default();
        let mut act = rt.activate();
        assert!(act.define_constant("X", Value::Int(1)));
        assert!(!act.define_constant("X", Value::Int(2)));
        assert_eq!(act.constant("X"), Some(Value::Int(1)));
        assert_eq!(act.warnings(), [Warning::ConstantRedefined { name: "X".into() }]);
    }

    #[test]
    fn bindings_are_per_activation() {
        let rt = Runtime::default();
        let mut a = rt.activate();
        let b = rt.activate();
        a.set_global("g", Value::str("a"));
        assert_eq!(a.global("g"), Some(Value::str("a")));
        assert_eq!(b.global("g"), None);
        assert_eq!(b.constant("g"), None, "globals and constants are separate");
    }

    #[test]
    fn reads_do_not_grow_the_layout() {
        let rt = Runtime::default();
        let mut act = rt.activate();
        act.set_global("g", Value::Int(1));
        act.define_constant("K", Value::Int(2));
        let slots = rt.directory().layout().len();

        assert_eq!(act.constant("g"), None);
        assert_eq!(act.global("K"), None);
        assert_eq!(act.global("g"), Some(Value::Int(1)));
        assert_eq!(rt.directory().layout().len(), slots);
    }
}
