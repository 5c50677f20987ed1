//! Class definition.
//!
//! Lookups go through the activation's cache and never lock. Definers scan
//! the name's version chain for a reusable class, build a new one if none
//! fits, and publish it with an optimistic generation check under the
//! name's own lock, rescanning if another definer won.

use std::sync::Arc;

use log::trace;

use crate::activation::{Activation, Frame};
use crate::cache::{Slot, SlotId};
use crate::class::{Avail, Class, ClassAttrs, ClassTemplate};
use crate::error::{MergeError, MergeErrorKind};

impl Activation {
    /// Define the class declared by `template` in this activation.
    ///
    /// With `fail_is_fatal` unset nothing is autoloaded, and any
    /// failure returns `Ok(None)` meaning "not defined yet".
    pub fn def_class(
        &mut self,
        template: &Arc<ClassTemplate>,
        fail_is_fatal: bool,
    ) -> Result<Option<Arc<Class>>, MergeError> {
        let entity = self.shared.directory.lookup_or_create(&template.name);
        let slot = entity.class_slot(self.shared.directory.layout());

        if let Some(bound) = self.existing_binding(slot, template, fail_is_fatal) {
            return bound;
        }

        let mut resolved: Option<(Option<Arc<Class>>, Vec<Arc<Class>>)> = None;
        loop {
            let (versions, seen) = entity.versions_of(template);
            for cls in versions {
                match self.class_avail(&cls, fail_is_fatal)? {
                    (Avail::Available, _) => {
                        trace!("reusing {} #{}", cls.name(), cls.serial());
                        return self.bind_class(slot, cls, fail_is_fatal);
                    }
                    (Avail::Fatal, missing) => {
                        return self.unresolved(template, missing, fail_is_fatal);
                    }
                    (Avail::TemporarilyUnavailable, _) => {}
                }
            }

            let (parent, interfaces) = match resolved.take() {
                Some(deps) => deps,
                None => {
                    // Errors raised while resolving name the declaring unit.
                    let needs_frame = self
                        .frames()
                        .last()
                        .is_none_or(|f| f.path != template.unit_path);
                    if needs_frame {
                        self.push_frame(Frame {
                            function: Arc::from("<merge>"),
                            path: template.unit_path.clone(),
                            line: template.line,
                        });
                    }
                    let deps = self.resolve_dependencies(template, fail_is_fatal);
                    if needs_frame {
                        self.pop_frame();
                    }
                    match deps? {
                        Some(deps) => deps,
                        None => return Ok(None),
                    }
                }
            };

            let cls = Arc::new(Class::new(
                template.clone(),
                parent.clone(),
                interfaces.clone(),
                slot,
            ));

            if !entity.try_publish(&cls, seen) {
                trace!("lost publish race for {}, rescanning", template.name);
                resolved = Some((parent, interfaces));
                continue;
            }
            trace!(
                "defined {} #{} (parent {:?})",
                cls.name(),
                cls.serial(),
                cls.parent().map(|p| p.serial())
            );
            return self.bind_class(slot, cls, fail_is_fatal);
        }
    }

    /// Bind `cls` in this activation. Autoloading may have bound the name
    /// since the first check, so look again.
    fn bind_class(
        &mut self,
        slot: SlotId,
        cls: Arc<Class>,
        fail_is_fatal: bool,
    ) -> Result<Option<Arc<Class>>, MergeError> {
        if let Some(bound) = self.existing_binding(slot, cls.template(), fail_is_fatal) {
            return bound;
        }
        self.cache.set(slot, Slot::Class(cls.clone()));
        Ok(Some(cls))
    }

    /// What an existing binding of the name means for a definition from
    /// `template`. `None` if the name is unbound here.
    fn existing_binding(
        &self,
        slot: SlotId,
        template: &Arc<ClassTemplate>,
        fail_is_fatal: bool,
    ) -> Option<Result<Option<Arc<Class>>, MergeError>> {
        let bound = self.cache.class(slot)?;
        if ClassTemplate::same(bound.template(), template) {
            return Some(Ok(Some(bound.clone())));
        }
        if fail_is_fatal {
            return Some(Err(self.error(MergeError::class_conflict(&template.name))));
        }
        Some(Ok(None))
    }

    /// Check `cls` against what this activation currently binds its
    /// parent and interfaces to. Also returns the first missing name.
    pub(crate) fn class_avail(
        &mut self,
        cls: &Arc<Class>,
        try_autoload: bool,
    ) -> Result<(Avail, Option<Arc<str>>), MergeError> {
        for (name, bound) in cls.template().dependencies().zip(cls.bound_dependencies()) {
            let current = match self.lookup_class(name) {
                Some(current) => Some(current),
                None if try_autoload => self.autoload_class(name)?,
                None => None,
            };
            match current {
                None => return Ok((Avail::Fatal, Some(name.clone()))),
                Some(current) if !Arc::ptr_eq(&current, bound) => {
                    return Ok((Avail::TemporarilyUnavailable, None));
                }
                Some(_) => {}
            }
        }
        Ok((Avail::Available, None))
    }

    /// Whether every class `cls` was built against is what this
    /// activation binds right now.
    pub(crate) fn dependencies_bound(&self, cls: &Class) -> bool {
        cls.template()
            .dependencies()
            .zip(cls.bound_dependencies())
            .all(|(name, bound)| {
                self.lookup_class(name)
                    .is_some_and(|current| Arc::ptr_eq(&current, bound))
            })
    }

    /// Resolve the parent and interfaces named by `template`.
    #[allow(clippy::type_complexity)]
    fn resolve_dependencies(
        &mut self,
        template: &Arc<ClassTemplate>,
        fail_is_fatal: bool,
    ) -> Result<Option<(Option<Arc<Class>>, Vec<Arc<Class>>)>, MergeError> {
        let parent = match &template.parent {
            Some(name) => match self.get_class(name, fail_is_fatal)? {
                Some(parent) => Some(parent),
                None => {
                    return self
                        .unresolved(template, Some(name.clone()), fail_is_fatal)
                        .map(|_| None);
                }
            },
            None => None,
        };
        if let Some(p) = &parent {
            if p.attrs().intersects(ClassAttrs::INTERFACE | ClassAttrs::TRAIT) {
                let message = format!("Class {} cannot extend from {}", template.name, p.name());
                return self.invalid(message, template, fail_is_fatal);
            }
        }

        let mut interfaces = Vec::with_capacity(template.interfaces.len());
        for name in &template.interfaces {
            let Some(iface) = self.get_class(name, fail_is_fatal)? else {
                return self
                    .unresolved(template, Some(name.clone()), fail_is_fatal)
                    .map(|_| None);
            };
            if !iface.attrs().contains(ClassAttrs::INTERFACE) {
                let message = format!("{} cannot implement {} - it is not an interface", template.name, name);
                return self.invalid(message, template, fail_is_fatal);
            }
            interfaces.push(iface);
        }
        Ok(Some((parent, interfaces)))
    }

    fn get_class(&mut self, name: &str, try_autoload: bool) -> Result<Option<Arc<Class>>, MergeError> {
        match self.lookup_class(name) {
            Some(cls) => Ok(Some(cls)),
            None if try_autoload => self.autoload_class(name),
            None => Ok(None),
        }
    }

    fn unresolved(
        &self,
        template: &ClassTemplate,
        missing: Option<Arc<str>>,
        fail_is_fatal: bool,
    ) -> Result<Option<Arc<Class>>, MergeError> {
        if !fail_is_fatal {
            return Ok(None);
        }
        let parent = missing.unwrap_or_else(|| template.name.clone());
        Err(self.error(MergeError::unresolved_parent(&template.name, &parent)))
    }

    fn invalid<T>(
        &self,
        message: String,
        template: &ClassTemplate,
        fail_is_fatal: bool,
    ) -> Result<Option<T>, MergeError> {
        if !fail_is_fatal {
            return Ok(None);
        }
        Err(self.error(MergeError::new(MergeErrorKind::Fatal {
            message: message.into(),
            line: Some(template.line),
        })))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::activation::Activation;
    use crate::class::{ClassAttrs, ClassTemplate};
    use crate::emitter::{ClassDecl, DeclContext, UnitEmitter};
    use crate::error::{MergeError, MergeErrorKind};
    use crate::runtime::{Autoloader, Runtime, RuntimeCreateInfo};
    use crate::unit::Unit;

    fn unit_with(decls: Vec<ClassDecl>) -> Unit {
        let mut e = UnitEmitter::new("/t.php");
        for decl in decls {
            e.new_class_template(decl, DeclContext::TopLevel);
        }
        e.finish()
    }

    fn template(unit: &Unit, id: u32) -> Arc<ClassTemplate> {
        unit.class_template(id).unwrap().clone()
    }

    #[test]
    fn def_class_is_idempotent() {
        let rt = Runtime::default();
        let unit = unit_with(vec![ClassDecl::new("A")]);
        let mut act = rt.activate();
        let a1 = act.def_class(&template(&unit, 0), true).unwrap().unwrap();
        let a2 = act.def_class(&template(&unit, 0), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a1, &a2));

        let mut other = rt.activate();
        let a3 = other.def_class(&template(&unit, 0), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&a1, &a3), "compatible version is reused across activations");
        assert_eq!(rt.directory().get("A").unwrap().class_versions(), 1);
    }

    #[test]
    fn different_declaration_of_bound_name_conflicts() {
        let rt = Runtime::default();
        let first = unit_with(vec![ClassDecl::new("A")]);
        let second = unit_with(vec![ClassDecl::new("A")]);
        let mut act = rt.activate();
        act.def_class(&template(&first, 0), true).unwrap();

        assert_eq!(act.def_class(&template(&second, 0), false).unwrap().map(|_| ()), None);
        let err = act.def_class(&template(&second, 0), true).unwrap_err();
        assert!(err.is_declaration_conflict(), "{err}");
        assert_eq!(err.to_string(), "Class already declared: A");

        // A separate activation may bind the other declaration.
        let mut other = rt.activate();
        let a = other.def_class(&template(&second, 0), true).unwrap().unwrap();
        assert!(ClassTemplate::same(a.template(), &template(&second, 0)));
        assert_eq!(rt.directory().get("A").unwrap().class_versions(), 2);
    }

    #[test]
    fn missing_parent_is_absent_or_fatal() {
        let rt = Runtime::default();
        let unit = unit_with(vec![ClassDecl::new("C").extends("B")]);
        let mut act = rt.activate();
        assert!(act.def_class(&template(&unit, 0), false).unwrap().is_none());
        let err = act.def_class(&template(&unit, 0), true).unwrap_err();
        assert_eq!(
            err.kind,
            MergeErrorKind::UnresolvedParent { class: "C".into(), parent: "B".into() }
        );
        assert!(
            err.backtrace.iter().any(|f| &*f.path == "/t.php"),
            "a synthetic frame names the declaring unit"
        );
    }

    #[test]
    fn version_is_chosen_by_parent_binding() {
        let rt = Runtime::default();
        let b1 = unit_with(vec![ClassDecl::new("B")]);
        let b2 = unit_with(vec![ClassDecl::new("B")]);
        let c = unit_with(vec![ClassDecl::new("C").extends("B")]);

        let mut x = rt.activate();
        x.def_class(&template(&b1, 0), true).unwrap();
        let c_x = x.def_class(&template(&c, 0), true).unwrap().unwrap();

        let mut y = rt.activate();
        y.def_class(&template(&b2, 0), true).unwrap();
        let c_y = y.def_class(&template(&c, 0), true).unwrap().unwrap();
        assert!(!Arc::ptr_eq(&c_x, &c_y), "C over a different B is a new version");

        let mut z = rt.activate();
        z.def_class(&template(&b1, 0), true).unwrap();
        let c_z = z.def_class(&template(&c, 0), true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&c_x, &c_z), "C over the first B is reused");
        assert_eq!(rt.directory().get("C").unwrap().class_versions(), 2);
    }

    #[test]
    fn extending_an_interface_is_fatal() {
        let rt = Runtime::default();
        let unit = unit_with(vec![
            ClassDecl::new("I").attrs(ClassAttrs::INTERFACE),
            ClassDecl::new("C").extends("I"),
            ClassDecl::new("D").implements("C"),
        ]);
        let mut act = rt.activate();
        act.def_class(&template(&unit, 0), true).unwrap();
        assert!(act.def_class(&template(&unit, 1), true).is_err());
        assert!(act.def_class(&template(&unit, 1), false).unwrap().is_none());
        let c_ok = unit_with(vec![ClassDecl::new("C")]);
        act.def_class(&template(&c_ok, 0), true).unwrap();
        let err = act.def_class(&template(&unit, 2), true).unwrap_err();
        assert!(err.to_string().contains("not an interface"), "{err}");
    }

    struct DefineOnDemand {
        unit: Unit,
        calls: AtomicUsize,
    }

    impl Autoloader for DefineOnDemand {
        fn autoload(&self, act: &mut Activation, name: &str) -> Result<(), MergeError> {
            self.calls.fetch_add(1, Ordering::Relaxed);
            for t in self.unit.class_templates() {
                if &*t.name == name {
                    act.def_class(t, true)?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn fatal_definition_autoloads_the_parent() {
        let loader = Arc::new(DefineOnDemand {
            unit: unit_with(vec![ClassDecl::new("B").method("base")]),
            calls: AtomicUsize::new(0),
        });
        let rt = Runtime::new(RuntimeCreateInfo::default().with_autoloader(loader.clone()));
        let unit = unit_with(vec![ClassDecl::new("C").extends("B").method("own")]);
        let mut act = rt.activate();

        assert!(act.def_class(&template(&unit, 0), false).unwrap().is_none());
        assert_eq!(loader.calls.load(Ordering::Relaxed), 0, "non-fatal attempts never autoload");

        let c = act.def_class(&template(&unit, 0), true).unwrap().unwrap();
        assert_eq!(loader.calls.load(Ordering::Relaxed), 1);
        let methods: Vec<&str> = c.methods().iter().map(|m| &**m).collect();
        assert_eq!(methods, ["base", "own"]);
        assert!(act.lookup_class("B").is_some());
    }

    /// Autoloads `B` by defining every class of its unit, which also
    /// declares its own `C`.
    struct DefineWholeUnit {
        unit: Unit,
    }

    impl Autoloader for DefineWholeUnit {
        fn autoload(&self, act: &mut Activation, name: &str) -> Result<(), MergeError> {
            if name == "B" {
                for t in self.unit.class_templates() {
                    act.def_class(t, true)?;
                }
            }
            Ok(())
        }
    }

    #[test]
    fn autoloaded_binding_is_not_overwritten() {
        let loader = Arc::new(DefineWholeUnit {
            unit: unit_with(vec![ClassDecl::new("B"), ClassDecl::new("C")]),
        });
        let rt = Runtime::new(RuntimeCreateInfo::default().with_autoloader(loader.clone()));
        let unit = unit_with(vec![ClassDecl::new("C").extends("B")]);
        let theirs = template(&loader.unit, 1);

        // Building a new version.
        let mut act = rt.activate();
        let err = act.def_class(&template(&unit, 0), true).unwrap_err();
        assert!(err.is_declaration_conflict(), "{err}");
        let bound = act.lookup_class("C").unwrap();
        assert!(ClassTemplate::same(bound.template(), &theirs));

        // Reusing a version built over the same B in another activation.
        let mut first = rt.activate();
        first.def_class(&template(&loader.unit, 0), true).unwrap();
        first.def_class(&template(&unit, 0), true).unwrap().unwrap();
        let mut act = rt.activate();
        let err = act.def_class(&template(&unit, 0), true).unwrap_err();
        assert!(err.is_declaration_conflict(), "{err}");
        let bound = act.lookup_class("C").unwrap();
        assert!(ClassTemplate::same(bound.template(), &theirs));

        // Once bound, the same declaration comes back as is.
        let again = act.def_class(&theirs, true).unwrap().unwrap();
        assert!(Arc::ptr_eq(&again, &bound));
    }

    #[test]
    fn racing_definers_publish_one_version() {
        let rt = Runtime::default();
        let unit = Arc::new(unit_with(vec![ClassDecl::new("Shared")]));
        let handles: Vec<_> = (0..32)
            .map(|_| {
                let rt = rt.clone();
                let unit = unit.clone();
                std::thread::spawn(move || {
                    let mut act = rt.activate();
                    let cls = act
                        .def_class(unit.class_template(0).unwrap(), true)
                        .unwrap()
                        .unwrap();
                    Arc::as_ptr(&cls) as usize
                })
            })
            .collect();
        let ptrs: Vec<usize> = handles.into_iter().map(|h| h.join().unwrap()).collect();
        assert!(ptrs.windows(2).all(|w| w[0] == w[1]));
        assert_eq!(rt.directory().get("Shared").unwrap().class_versions(), 1);
    }
}
