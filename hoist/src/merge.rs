//! Replaying a unit's merge sequence into an activation.
//!
//! The first merge of a unit, process-wide, runs under the unit's merge
//! lock and fills in everything that can be decided once: function slots,
//! uniqueness bits and include targets. Every later merge, in any
//! activation, is a lock-free walk over the sequence.

use std::sync::Arc;

use log::{debug, trace};

use crate::activation::Activation;
use crate::cache::Slot;
use crate::class::{Class, Hoistable};
use crate::error::MergeError;
use crate::func::FuncAttrs;
use crate::runtime::RuntimeShared;
use crate::unit::{MergeState, Mergeable, Resolved, Unit};

/// Outcome of [`Activation::merge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeStatus {
    /// Every declaration in the sequence is now bound.
    Complete,
    /// Some hoistable classes could not be defined yet. Their declarations
    /// run again when the unit's top-level code reaches them.
    Deferred,
}

impl Unit {
    pub(crate) fn initial_merge(&self, shared: &RuntimeShared) {
        let _guard = self.merge_lock.lock();
        if self.merge_state().contains(MergeState::MERGED) {
            return;
        }
        self.set_merge_state(MergeState::MERGING);

        let directory = &shared.directory;
        let layout = directory.layout();
        for func in self.functions().iter().filter(|f| !f.is_main()) {
            let entity = directory.lookup_or_create(func.name());
            func.set_cached_slot(entity.func_slot(layout));
        }

        let mut state = MergeState::MERGED;
        if shared.authoritative {
            if self
                .top_functions()
                .all(|f| f.attrs().contains(FuncAttrs::UNIQUE))
            {
                state |= MergeState::UNIQUE_FUNCS;
            }
            let all_classes_unique = self.mergeables[self.first_hoistable_class..]
                .iter()
                .filter_map(|e| match e.op {
                    Mergeable::Class(id) => Some(self.class_template(id)),
                    _ => None,
                })
                .all(|t| t.is_some_and(|t| t.is_unique()));
            if all_classes_unique {
                state |= MergeState::UNIQUE_CLASSES;
            }
        }

        if self.is_merge_only() {
            for entry in &self.mergeables[self.first_mergeable..] {
                match &entry.op {
                    Mergeable::Include { kind, target } => {
                        match shared.loader.load_unit(target, *kind, self) {
                            Some(unit) => {
                                let _ = entry.resolved.set(Resolved::Unit(Arc::downgrade(&unit)));
                            }
                            None => debug!("{}: include {target} unresolved at first merge", self.path()),
                        }
                    }
                    Mergeable::Define { name, .. } => {
                        directory.lookup_or_create(name).constant_slot(layout);
                    }
                    Mergeable::Global { name, .. } => {
                        directory.lookup_or_create(name).global_slot(layout);
                    }
                    _ => {}
                }
            }
        }

        self.set_merge_state(state);
        debug!("initial merge of {} done: {state:?}", self.path());
    }
}

impl Activation {
    /// Bind `unit`'s top functions and hoistable classes, and for a
    /// merge-only unit replay the rest of its top level.
    ///
    /// Does not run the unit's top-level code and does not touch the
    /// include bitmap; see [`Activation::include`] for that.
    pub fn merge(&mut self, unit: &Arc<Unit>) -> Result<MergeStatus, MergeError> {
        if !unit.merge_state().contains(MergeState::MERGED) {
            let shared = self.shared.clone();
            unit.initial_merge(&shared);
        }
        let state = unit.merge_state();
        trace!("merging {} ({state:?})", unit.path());

        for func in unit.top_functions() {
            match func.cached_slot() {
                Some(slot) if state.contains(MergeState::UNIQUE_FUNCS) => {
                    self.cache.set(slot, Slot::Func(func.clone()))
                }
                _ => self.define_function(func)?,
            }
        }

        let mut failed = Vec::new();
        for ix in unit.hoistable_range() {
            if !self.merge_class_entry(unit, ix, false)? {
                failed.push(ix);
            }
        }
        if !failed.is_empty() {
            if !unit.is_merge_only() {
                debug!("{}: {} hoistable classes deferred", unit.path(), failed.len());
                return Ok(MergeStatus::Deferred);
            }
            if unit.first_mergeable + 1 == unit.mergeables.len() {
                for ix in unit.hoistable_range() {
                    self.merge_class_entry(unit, ix, true)?;
                }
                return Ok(MergeStatus::Complete);
            }
            // Maybe-hoistable classes are repeated in the rest of the
            // sequence; the others only fail on a conflicting binding.
            for ix in failed {
                if !self.is_repeated_later(unit, ix) {
                    self.merge_class_entry(unit, ix, true)?;
                }
            }
        }

        for ix in unit.first_mergeable..unit.mergeables.len() {
            match &unit.mergeables[ix].op {
                Mergeable::Class(_) => {
                    self.merge_class_entry(unit, ix, true)?;
                }
                Mergeable::Define { name, value } => {
                    self.define_constant(name, value.clone());
                }
                Mergeable::Global { name, value } => {
                    self.set_global(name, value.clone());
                }
                Mergeable::Include { kind, target } => {
                    let included = match unit.mergeables[ix].include_target() {
                        Some(included) => included,
                        None => self.resolve_include(unit, *kind, target)?,
                    };
                    self.include(&included)?;
                }
                Mergeable::TopFunc(_) => {}
                Mergeable::Done => break,
            }
        }

        let state = unit.merge_state();
        if state.contains(MergeState::UNIQUE_CLASSES)
            && !state.contains(MergeState::UNIQUE_DEFINED_CLASSES)
        {
            unit.add_merge_state(MergeState::UNIQUE_DEFINED_CLASSES);
            self.rewrite_defined_classes(unit);
        }
        Ok(MergeStatus::Complete)
    }

    /// Define the class at `ix` of `unit`'s sequence. `Ok(false)` means a
    /// non-fatal attempt found it not definable yet.
    fn merge_class_entry(
        &mut self,
        unit: &Unit,
        ix: usize,
        fail_is_fatal: bool,
    ) -> Result<bool, MergeError> {
        let entry = &unit.mergeables[ix];
        if let Some(cls) = entry.defined_class() {
            let cls = cls.clone();
            return self.publish_defined_class(&cls, fail_is_fatal);
        }
        let Mergeable::Class(id) = entry.op else {
            return Ok(true);
        };
        match unit.class_template(id) {
            Some(template) => Ok(self.def_class(template, fail_is_fatal)?.is_some()),
            None => Err(self.error(MergeError::engine(format!(
                "{}: no class template #{id}",
                unit.path()
            )))),
        }
    }

    /// Bind a class a unit's sequence was rewritten to. Falls back to a
    /// full definition if the name is taken or the class's dependencies
    /// are not what this activation binds.
    fn publish_defined_class(
        &mut self,
        cls: &Arc<Class>,
        fail_is_fatal: bool,
    ) -> Result<bool, MergeError> {
        let slot_free = self
            .cache
            .class(cls.slot())
            .is_none_or(|bound| Arc::ptr_eq(bound, cls));
        if slot_free && self.dependencies_bound(cls) {
            self.cache.set(cls.slot(), Slot::Class(cls.clone()));
            return Ok(true);
        }
        Ok(self.def_class(cls.template(), fail_is_fatal)?.is_some())
    }

    fn is_repeated_later(&self, unit: &Unit, ix: usize) -> bool {
        match unit.mergeables[ix].op {
            Mergeable::Class(id) => unit
                .class_template(id)
                .is_some_and(|t| t.hoistable == Hoistable::MaybeHoistable),
            _ => false,
        }
    }

    /// Point every class entry at the single class its template defines.
    ///
    /// Concurrent rewriters compute the same classes, and each entry is
    /// written at most once, so readers see either form.
    fn rewrite_defined_classes(&self, unit: &Unit) {
        let directory = &self.shared.directory;
        let mut rewritten = 0;
        for entry in &unit.mergeables[unit.first_hoistable_class..] {
            let Mergeable::Class(id) = entry.op else {
                continue;
            };
            let Some(template) = unit.class_template(id) else {
                continue;
            };
            let Some(cls) = directory
                .get(&template.name)
                .and_then(|e| e.sole_class(template))
            else {
                continue;
            };
            if entry.resolved.set(Resolved::Class(cls)).is_ok() {
                rewritten += 1;
            }
        }
        debug!("{}: rewrote {rewritten} class entries", unit.path());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::MergeStatus;
    use crate::activation::Activation;
    use crate::class::ClassAttrs;
    use crate::emitter::{ClassDecl, DeclContext, UnitEmitter};
    use crate::error::{MergeError, MergeErrorKind, Warning};
    use crate::func::FuncAttrs;
    use crate::resolve::UnitRegistry;
    use crate::runtime::{Engine, Runtime, RuntimeCreateInfo};
    use crate::unit::{IncludeKind, MergeInstr, MergeState, Unit};
    use crate::value::Value;

    #[derive(Default)]
    struct CountingEngine {
        calls: AtomicUsize,
    }

    impl Engine for CountingEngine {
        fn invoke_top(&self, _act: &mut Activation, _unit: &Arc<Unit>) -> Result<Value, MergeError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(Value::Null)
        }
    }

    fn counting_runtime(authoritative: bool) -> (Runtime, Arc<CountingEngine>) {
        let engine = Arc::new(CountingEngine::default());
        let mut info = RuntimeCreateInfo::default().with_engine(engine.clone());
        info.authoritative = authoritative;
        (Runtime::new(info), engine)
    }

    fn add_function(e: &mut UnitEmitter, name: &str, attrs: FuncAttrs) {
        e.new_function(name, attrs, 1);
        let null = e.add_constant(Value::Null) as u16;
        e.bytecode().ret_c(null);
    }

    fn emit_return(e: &mut UnitEmitter, value: Value) {
        let id = e.add_constant(value.clone()) as u16;
        e.bytecode().ret_c(id);
        e.set_main_return(value);
    }

    #[test]
    fn merge_only_unit_is_never_interpreted() {
        let (rt, engine) = counting_runtime(false);
        let mut e = rt.new_emitter("/lib.php");
        e.new_class_template(ClassDecl::new("A"), DeclContext::TopLevel);
        emit_return(&mut e, Value::Int(1));
        add_function(&mut e, "f", FuncAttrs::TOP);
        let unit = Arc::new(e.finish());
        assert!(unit.is_merge_only());

        let mut act = rt.activate();
        assert_eq!(act.include(&unit).unwrap(), Value::Int(1));
        assert_eq!(act.include(&unit).unwrap(), Value::Bool(true));
        assert!(act.lookup_func("f").is_some());
        assert!(act.lookup_class("A").is_some());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn missing_parent_defers_until_defined() {
        let (rt, _) = counting_runtime(false);
        let mut e = rt.new_emitter("/c.php");
        e.new_class_template(ClassDecl::new("C").extends("B"), DeclContext::TopLevel);
        add_function(&mut e, "f", FuncAttrs::TOP | FuncAttrs::UNIQUE);
        let c_unit = Arc::new(e.finish());

        let mut e = rt.new_emitter("/b.php");
        e.new_class_template(ClassDecl::new("B"), DeclContext::TopLevel);
        let b_unit = Arc::new(e.finish());

        let mut act = rt.activate();
        assert_eq!(act.merge(&c_unit).unwrap(), MergeStatus::Deferred);
        assert!(act.lookup_func("f").is_some());
        assert!(act.lookup_class("C").is_none());

        assert_eq!(act.merge(&b_unit).unwrap(), MergeStatus::Complete);
        assert_eq!(act.merge(&c_unit).unwrap(), MergeStatus::Complete);
        let c = act.lookup_class("C").unwrap();
        assert_eq!(&**c.parent().unwrap().name(), "B");
        assert!(act.lookup_func("f").is_some());
    }

    #[test]
    fn merge_only_unit_retries_hoistable_classes_fatally() {
        let (rt, _) = counting_runtime(false);
        let mut e = rt.new_emitter("/c.php");
        e.new_class_template(ClassDecl::new("A"), DeclContext::TopLevel);
        e.new_class_template(ClassDecl::new("C").extends("B"), DeclContext::TopLevel);
        emit_return(&mut e, Value::Int(1));
        let unit = Arc::new(e.finish());
        assert!(unit.is_merge_only());

        let mut act = rt.activate();
        let err = act.merge(&unit).unwrap_err();
        assert_eq!(
            err.kind,
            MergeErrorKind::UnresolvedParent { class: "C".into(), parent: "B".into() }
        );
        assert!(act.lookup_class("A").is_some(), "earlier bindings stay visible");
    }

    #[test]
    fn merge_only_unit_defines_parent_declared_later() {
        let (rt, engine) = counting_runtime(false);
        let mut e = rt.new_emitter("/d.php");
        e.new_class_template(ClassDecl::new("D").extends("C"), DeclContext::TopLevel);
        e.new_class_template(ClassDecl::new("C"), DeclContext::TopLevel);
        emit_return(&mut e, Value::Null);
        let unit = Arc::new(e.finish());
        assert!(unit.is_merge_only());

        let mut act = rt.activate();
        assert_eq!(act.merge(&unit).unwrap(), MergeStatus::Complete);
        let d = act.lookup_class("D").unwrap();
        assert!(Arc::ptr_eq(d.parent().unwrap(), &act.lookup_class("C").unwrap()));
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);

        let mut other = rt.activate();
        assert_eq!(other.include(&unit).unwrap(), Value::Null);
        assert!(other.lookup_class("D").is_some());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn conflicting_top_function_is_fatal() {
        let (rt, _) = counting_runtime(false);
        let units: Vec<Arc<Unit>> = ["/one.php", "/two.php"]
            .iter()
            .map(|path| {
                let mut e = rt.new_emitter(path);
                add_function(&mut e, "dup", FuncAttrs::TOP);
                Arc::new(e.finish())
            })
            .collect();
        let mut act = rt.activate();
        act.merge(&units[0]).unwrap();
        act.merge(&units[0]).unwrap();
        let err = act.merge(&units[1]).unwrap_err();
        assert_eq!(err.to_string(), "Cannot redeclare function dup");
    }

    fn unique_program(rt: &Runtime) -> Arc<Unit> {
        let mut e = rt.new_emitter("/app.php");
        e.new_class_template(
            ClassDecl::new("Base").attrs(ClassAttrs::UNIQUE),
            DeclContext::TopLevel,
        );
        e.new_class_template(
            ClassDecl::new("Child").extends("Base").attrs(ClassAttrs::UNIQUE),
            DeclContext::TopLevel,
        );
        e.push_mergeable_define("VERSION", Value::Int(3));
        emit_return(&mut e, Value::Null);
        add_function(&mut e, "main", FuncAttrs::TOP | FuncAttrs::UNIQUE);
        Arc::new(e.finish())
    }

    #[test]
    fn unique_classes_are_rewritten_after_first_merge() {
        let (rt, _) = counting_runtime(true);
        let unit = unique_program(&rt);

        let mut first = rt.activate();
        first.include(&unit).unwrap();
        let state = unit.merge_state();
        assert!(state.contains(
            MergeState::MERGED
                | MergeState::UNIQUE_FUNCS
                | MergeState::UNIQUE_CLASSES
                | MergeState::UNIQUE_DEFINED_CLASSES
        ));
        for ix in unit.first_hoistable_class..unit.mergeables_len() - 2 {
            assert!(
                matches!(unit.mergeable(ix), Some(MergeInstr::UniqueDefinedClass(_))),
                "entry {ix} rewritten"
            );
        }

        let mut second = rt.activate();
        second.include(&unit).unwrap();
        let child = second.lookup_class("Child").unwrap();
        assert!(Arc::ptr_eq(&child, &first.lookup_class("Child").unwrap()));
        assert_eq!(second.constant("VERSION"), Some(Value::Int(3)));
        assert!(second.lookup_func("main").is_some());
        assert_eq!(rt.directory().get("Child").unwrap().class_versions(), 1);
    }

    #[test]
    fn concurrent_merges_converge() {
        let (rt, engine) = counting_runtime(true);
        let unit = unique_program(&rt);
        let handles: Vec<_> = (0..64)
            .map(|_| {
                let rt = rt.clone();
                let unit = unit.clone();
                std::thread::spawn(move || {
                    let mut act = rt.activate();
                    act.include(&unit).unwrap();
                    // Readers may race the rewrite; either form names the
                    // same class.
                    for ix in unit.hoistable_range() {
                        let name = match unit.mergeable(ix).unwrap() {
                            MergeInstr::Class(t) => t.name.clone(),
                            MergeInstr::UniqueDefinedClass(c) => c.name().clone(),
                            other => panic!("unexpected {other:?}"),
                        };
                        assert!(act.lookup_class(&name).is_some());
                    }
                    let child = act.lookup_class("Child").unwrap();
                    Arc::as_ptr(&child) as usize
                })
            })
            .collect();
        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(rt.directory().get("Base").unwrap().class_versions(), 1);
        assert_eq!(engine.calls.load(Ordering::SeqCst), 0);
        assert!(unit.merge_state().contains(MergeState::UNIQUE_DEFINED_CLASSES));
    }

    #[test]
    fn first_global_assignment_wins() {
        let (rt, _) = counting_runtime(true);
        let units: Vec<Arc<Unit>> = [("/a.php", 1), ("/b.php", 2)]
            .into_iter()
            .map(|(path, n)| {
                let mut e = rt.new_emitter(path);
                e.push_mergeable_global("config", Value::Int(n));
                emit_return(&mut e, Value::Null);
                Arc::new(e.finish())
            })
            .collect();
        let mut act = rt.activate();
        for unit in &units {
            act.include(unit).unwrap();
        }
        assert_eq!(act.global("config"), Some(Value::Int(1)));
        assert_eq!(act.warnings(), [Warning::GlobalRedefined { name: "config".into() }]);
    }

    #[test]
    fn includes_resolve_once_and_tolerate_cycles() {
        let engine = Arc::new(CountingEngine::default());
        let registry = Arc::new(UnitRegistry::new("/srv"));
        let mut info = RuntimeCreateInfo::default()
            .with_engine(engine.clone())
            .with_loader(registry.clone());
        info.authoritative = true;
        let rt = Runtime::new(info);

        let mut e = rt.new_emitter("/srv/app/main.php");
        e.push_mergeable_include(IncludeKind::Relative, "lib.php");
        e.push_mergeable_include(IncludeKind::DocRoot, "script.php");
        emit_return(&mut e, Value::Int(7));
        let main = registry.register(e.finish());

        let mut e = rt.new_emitter("/srv/app/lib.php");
        e.new_class_template(ClassDecl::new("Lib"), DeclContext::TopLevel);
        e.push_mergeable_include(IncludeKind::Relative, "main.php");
        emit_return(&mut e, Value::Null);
        registry.register(e.finish());

        // Not merge-only: its top level is interpreted once.
        let mut e = rt.new_emitter("/srv/script.php");
        add_function(&mut e, "helper", FuncAttrs::TOP);
        registry.register(e.finish());

        let mut act = rt.activate();
        assert_eq!(act.include(&main).unwrap(), Value::Int(7));
        assert!(act.lookup_class("Lib").is_some());
        assert!(act.lookup_func("helper").is_some());
        assert_eq!(engine.calls.load(Ordering::SeqCst), 1);

        let mut other = rt.activate();
        other.include(&main).unwrap();
        assert_eq!(engine.calls.load(Ordering::SeqCst), 2, "once per activation");
    }

    #[test]
    fn failed_include_aborts_the_rest_of_the_walk() {
        let (rt, _) = counting_runtime(true);
        let mut e = rt.new_emitter("/main.php");
        e.push_mergeable_define("BEFORE", Value::Int(1));
        e.push_mergeable_include(IncludeKind::Module, "missing.php");
        e.push_mergeable_define("AFTER", Value::Int(2));
        emit_return(&mut e, Value::Null);
        let unit = Arc::new(e.finish());

        let mut act = rt.activate();
        let err = act.include(&unit).unwrap_err();
        assert_eq!(
            err.kind,
            MergeErrorKind::UnresolvedInclude { name: "missing.php".into() }
        );
        assert_eq!(act.constant("BEFORE"), Some(Value::Int(1)));
        assert_eq!(act.constant("AFTER"), None);
    }

    #[test]
    fn reclaim_drops_unreferenced_versions() {
        let (rt, _) = counting_runtime(false);
        let make = |path: &str| {
            let mut e = rt.new_emitter(path);
            e.new_class_template(ClassDecl::new("Dup"), DeclContext::TopLevel);
            Arc::new(e.finish())
        };
        let (old, new) = (make("/old.php"), make("/new.php"));

        let mut a = rt.activate();
        a.merge(&old).unwrap();
        let mut b = rt.activate();
        b.merge(&new).unwrap();
        assert_eq!(rt.directory().get("Dup").unwrap().class_versions(), 2);
        assert_eq!(rt.reclaim(), 0, "both versions are still bound");

        drop(a);
        assert_eq!(rt.reclaim(), 1);
        assert_eq!(rt.directory().get("Dup").unwrap().class_versions(), 1);
        assert!(b.lookup_class("Dup").is_some());
    }
}
