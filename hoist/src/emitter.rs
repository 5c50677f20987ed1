//! Build-time accumulator for a [`Unit`].

use std::collections::{HashMap, HashSet};
use std::hash::Hash;
use std::sync::Arc;

use bytecode::{BytecodeBuilder, SourceLoc, SourceLocTableBuilder};
use log::trace;

use crate::class::{ClassAttrs, ClassTemplate, Hoistable};
use crate::func::{FuncAttrs, FuncTemplate};
use crate::repo;
use crate::unit::{Digest, IncludeKind, Mergeable, Unit, UnitParts};
use crate::value::Value;

/// Where a class declaration appears in the top-level code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeclContext {
    /// Unconditionally at top level.
    TopLevel,
    /// Inside a branch, loop or function body.
    Conditional,
}

/// A class declaration handed to [`UnitEmitter::new_class_template`].
#[derive(Debug, Clone, Default)]
pub struct ClassDecl {
    name: Arc<str>,
    parent: Option<Arc<str>>,
    interfaces: Vec<Arc<str>>,
    attrs: ClassAttrs,
    methods: Vec<Arc<str>>,
    line: u32,
}

impl ClassDecl {
    pub fn new(name: &str) -> Self {
        Self {
            name: Arc::from(name),
            line: 1,
            ..Default::default()
        }
    }

    pub fn extends(mut self, parent: &str) -> Self {
        self.parent = Some(Arc::from(parent));
        self
    }

    pub fn implements(mut self, interface: &str) -> Self {
        self.interfaces.push(Arc::from(interface));
        self
    }

    pub fn method(mut self, name: &str) -> Self {
        self.methods.push(Arc::from(name));
        self
    }

    pub fn attrs(mut self, attrs: ClassAttrs) -> Self {
        self.attrs |= attrs;
        self
    }

    pub fn line(mut self, line: u32) -> Self {
        self.line = line;
        self
    }
}

/// Deduplicating pool: equal content gets the id it was first given.
struct Pool<T> {
    items: Vec<T>,
    ids: HashMap<T, u32, ahash::RandomState>,
}

impl<T: Clone + Eq + Hash> Pool<T> {
    fn new() -> Self {
        Self {
            items: Vec::new(),
            ids: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    fn add(&mut self, item: T) -> u32 {
        if let Some(&id) = self.ids.get(&item) {
            return id;
        }
        let id = self.items.len() as u32;
        self.ids.insert(item.clone(), id);
        self.items.push(item);
        id
    }
}

pub struct UnitEmitter {
    path: Arc<str>,
    authoritative: bool,
    bc: BytecodeBuilder,
    srcloc: SourceLocTableBuilder,
    litstrs: Pool<Arc<str>>,
    arrays: Pool<Value>,
    constants: Pool<Value>,
    funcs: Vec<FuncTemplate>,
    classes: Vec<ClassTemplate>,
    hoistable_names: HashSet<Arc<str>, ahash::RandomState>,
    hoistable_ids: Vec<u32>,
    stmts: Vec<Mergeable>,
    all_classes_hoistable: bool,
    has_conditional: bool,
    return_seen: bool,
    main_return: Option<Value>,
}

impl UnitEmitter {
    pub fn new(path: &str) -> Self {
        let main = FuncTemplate {
            name: Arc::from(""),
            attrs: FuncAttrs::MAIN,
            base: 0,
            past: 0,
            line: 1,
        };
        Self {
            path: Arc::from(path),
            authoritative: false,
            bc: BytecodeBuilder::new(),
            srcloc: SourceLocTableBuilder::new(),
            litstrs: Pool::new(),
            arrays: Pool::new(),
            constants: Pool::new(),
            funcs: vec![main],
            classes: Vec::new(),
            hoistable_names: HashSet::with_hasher(ahash::RandomState::new()),
            hoistable_ids: Vec::new(),
            stmts: Vec::new(),
            all_classes_hoistable: true,
            has_conditional: false,
            return_seen: false,
            main_return: None,
        }
    }

    /// Whole-program mode: names may be proven unique, and defines,
    /// globals and includes may stay in a merge-only unit.
    pub fn set_authoritative(&mut self, authoritative: bool) -> &mut Self {
        self.authoritative = authoritative;
        self
    }

    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    pub fn add_literal(&mut self, s: &str) -> u32 {
        self.litstrs.add(Arc::from(s))
    }

    pub fn add_array(&mut self, value: Value) -> u32 {
        self.arrays.add(value)
    }

    /// Add a value operand for `DefCns`, `SetGlobal` or `RetC`.
    pub fn add_constant(&mut self, value: Value) -> u32 {
        self.constants.add(value)
    }

    /// The builder for the function currently being emitted.
    pub fn bytecode(&mut self) -> &mut BytecodeBuilder {
        &mut self.bc
    }

    /// Attribute bytecode emitted from here on to `loc`.
    pub fn record_source_loc(&mut self, loc: SourceLoc) {
        self.srcloc.add(self.bc.current_offset() as u32, loc);
    }

    /// Start a new function. Bytecode emitted until the next call belongs
    /// to it; the top-level code must be emitted first.
    pub fn new_function(&mut self, name: &str, attrs: FuncAttrs, line: u32) -> u32 {
        let offset = self.bc.current_offset() as u32;
        if let Some(prev) = self.funcs.last_mut() {
            prev.past = offset;
        }
        let id = self.funcs.len() as u32;
        self.funcs.push(FuncTemplate {
            name: Arc::from(name),
            attrs: attrs - FuncAttrs::MAIN,
            base: offset,
            past: offset,
            line,
        });
        id
    }

    /// Record that the top-level code returned; later declarations are no
    /// longer hoistable.
    pub fn mark_return_seen(&mut self) {
        self.return_seen = true;
    }

    /// The top-level code is only mergeable declarations followed by
    /// `return value`.
    pub fn set_main_return(&mut self, value: Value) {
        self.return_seen = true;
        self.main_return = Some(value);
    }

    pub fn new_class_template(&mut self, decl: ClassDecl, ctx: DeclContext) -> u32 {
        let id = self.classes.len() as u32;
        let mut hoistable = match ctx {
            DeclContext::Conditional => Hoistable::NotHoistable,
            DeclContext::TopLevel if self.return_seen => Hoistable::NotHoistable,
            DeclContext::TopLevel if decl.parent.is_none() && decl.interfaces.is_empty() => {
                Hoistable::AlwaysHoistable
            }
            DeclContext::TopLevel => Hoistable::MaybeHoistable,
        };
        if hoistable.is_hoistable() && self.hoistable_names.contains(&decl.name) {
            hoistable = Hoistable::Mergeable;
        }

        if hoistable.is_hoistable() {
            self.hoistable_names.insert(decl.name.clone());
            self.hoistable_ids.push(id);
        } else {
            self.all_classes_hoistable = false;
        }
        match (hoistable, ctx) {
            (Hoistable::Mergeable | Hoistable::MaybeHoistable, _) => {
                self.stmts.push(Mergeable::Class(id))
            }
            (Hoistable::NotHoistable, DeclContext::TopLevel) => {
                self.stmts.push(Mergeable::Class(id))
            }
            (Hoistable::NotHoistable, DeclContext::Conditional) => self.has_conditional = true,
            (Hoistable::AlwaysHoistable, _) => {}
        }
        trace!("class template {} #{id}: {hoistable:?}", decl.name);

        self.classes.push(ClassTemplate {
            id,
            name: decl.name,
            parent: decl.parent,
            interfaces: decl.interfaces,
            attrs: decl.attrs,
            methods: decl.methods,
            hoistable,
            line: decl.line,
            offset: self.bc.current_offset() as u32,
            unit_path: self.path.clone(),
        });
        id
    }

    pub fn class_template(&self, id: u32) -> Option<&ClassTemplate> {
        self.classes.get(id as usize)
    }

    pub fn push_mergeable_define(&mut self, name: &str, value: Value) {
        self.add_literal(name);
        self.stmts.push(Mergeable::Define {
            name: Arc::from(name),
            value,
        });
        self.all_classes_hoistable = false;
    }

    pub fn push_mergeable_global(&mut self, name: &str, value: Value) {
        self.add_literal(name);
        self.stmts.push(Mergeable::Global {
            name: Arc::from(name),
            value,
        });
        self.all_classes_hoistable = false;
    }

    pub fn push_mergeable_include(&mut self, kind: IncludeKind, target: &str) {
        self.add_literal(target);
        self.stmts.push(Mergeable::Include {
            kind,
            target: Arc::from(target),
        });
        self.all_classes_hoistable = false;
    }

    /// Lay out the merge sequence, freeze the pools and hash the result.
    pub fn finish(mut self) -> Unit {
        let end = self.bc.current_offset() as u32;
        if let Some(last) = self.funcs.last_mut() {
            last.past = end;
        }

        let mut mergeables: Vec<Mergeable> = self
            .funcs
            .iter()
            .enumerate()
            .filter(|(_, f)| f.attrs.contains(FuncAttrs::TOP))
            .map(|(i, _)| Mergeable::TopFunc(i as u32))
            .collect();
        let first_hoistable_class = mergeables.len();
        mergeables.extend(self.hoistable_ids.iter().map(|&id| Mergeable::Class(id)));
        let first_mergeable = mergeables.len();

        let mut main_return = if self.has_conditional {
            None
        } else {
            self.main_return.take()
        };
        if main_return.is_some() && !self.all_classes_hoistable {
            let only_classes = self.stmts.iter().all(|s| matches!(s, Mergeable::Class(_)));
            if self.authoritative || only_classes {
                mergeables.append(&mut self.stmts);
            } else {
                main_return = None;
            }
        }
        mergeables.push(Mergeable::Done);

        let parts = UnitParts {
            path: self.path,
            bytecode: self.bc.into_bytes(),
            litstrs: self.litstrs.items,
            arrays: self.arrays.items,
            constants: self.constants.items,
            srcloc: self.srcloc.finish(),
            classes: self.classes,
            funcs: self.funcs,
            mergeables,
            first_hoistable_class,
            first_mergeable,
            main_return,
        };
        let mut unit = Unit::from_parts(parts, Digest::default());
        unit.set_digest(repo::unit_digest(&unit));
        unit
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::unit::MergeInstr;

    #[test]
    fn literals_and_arrays_are_deduplicated() {
        let mut e = UnitEmitter::new("/a.php");
        let a = e.add_literal("foo");
        let b = e.add_literal("bar");
        assert_ne!(a, b);
        assert_eq!(e.add_literal("foo"), a);

        let arr = || Value::array([Value::Int(1), Value::str("x")]);
        let x = e.add_array(arr());
        assert_eq!(e.add_array(arr()), x);
        assert_ne!(e.add_array(Value::array([Value::Int(2)])), x);

        let unit = e.finish();
        assert_eq!(unit.literals().len(), 2);
        assert_eq!(unit.arrays().len(), 2);
    }

    #[test]
    fn second_declaration_is_mergeable() {
        let mut e = UnitEmitter::new("/a.php");
        let first = e.new_class_template(ClassDecl::new("C"), DeclContext::TopLevel);
        let second = e.new_class_template(ClassDecl::new("C"), DeclContext::TopLevel);
        assert_eq!(
            e.class_template(first).map(|t| t.hoistable),
            Some(Hoistable::AlwaysHoistable)
        );
        assert_eq!(
            e.class_template(second).map(|t| t.hoistable),
            Some(Hoistable::Mergeable)
        );
    }

    #[test]
    fn declarations_after_return_or_in_branches_are_not_hoistable() {
        let mut e = UnitEmitter::new("/a.php");
        let cond = e.new_class_template(ClassDecl::new("A"), DeclContext::Conditional);
        e.mark_return_seen();
        let late = e.new_class_template(ClassDecl::new("B"), DeclContext::TopLevel);
        for id in [cond, late] {
            assert_eq!(
                e.class_template(id).map(|t| t.hoistable),
                Some(Hoistable::NotHoistable)
            );
        }
        let unit = e.finish();
        assert!(unit.hoistable_range().is_empty(), "neither is a prefix entry");
    }

    #[test]
    fn layout_is_funcs_then_prefix_then_rest() {
        let mut e = UnitEmitter::new("/a.php");
        e.set_authoritative(true);
        e.new_function("f", FuncAttrs::TOP, 2);
        e.new_function("g", FuncAttrs::empty(), 3);
        e.new_class_template(ClassDecl::new("A"), DeclContext::TopLevel);
        e.new_class_template(ClassDecl::new("B").extends("A"), DeclContext::TopLevel);
        e.push_mergeable_define("X", Value::Int(1));
        e.set_main_return(Value::Int(1));
        let unit = e.finish();

        assert!(unit.is_merge_only());
        assert_eq!(unit.hoistable_range(), 1..3);
        let ops: Vec<Mergeable> = unit.mergeable_ops().cloned().collect();
        assert_eq!(ops, vec![
            Mergeable::TopFunc(1),
            Mergeable::Class(0),
            Mergeable::Class(1),
            // B may fail to hoist, so it is retried in order.
            Mergeable::Class(1),
            Mergeable::Define { name: "X".into(), value: Value::Int(1) },
            Mergeable::Done,
        ]);
        assert!(matches!(unit.mergeable(0), Some(MergeInstr::TopFunc(f)) if &**f.name() == "f"));
    }

    #[test]
    fn all_hoistable_unit_lists_no_rest() {
        let mut e = UnitEmitter::new("/a.php");
        e.new_class_template(ClassDecl::new("A"), DeclContext::TopLevel);
        e.new_class_template(ClassDecl::new("B").extends("A"), DeclContext::TopLevel);
        e.set_main_return(Value::Int(1));
        let unit = e.finish();
        assert!(unit.is_merge_only());
        assert_eq!(unit.hoistable_range().end + 1, unit.mergeables_len());
    }

    #[test]
    fn defines_demote_merge_only_outside_authoritative_mode() {
        let mut e = UnitEmitter::new("/a.php");
        e.push_mergeable_define("X", Value::Int(1));
        e.set_main_return(Value::Int(1));
        let unit = e.finish();
        assert!(!unit.is_merge_only());
        assert_eq!(unit.mergeable_ops().collect::<Vec<_>>(), [&Mergeable::Done]);
    }

    #[test]
    fn digest_follows_content() {
        let build = |v: i64| {
            let mut e = UnitEmitter::new("/a.php");
            let c = e.add_constant(Value::Int(v)) as u16;
            e.bytecode().ret_c(c);
            e.finish().digest()
        };
        assert_eq!(build(1), build(1));
        assert_ne!(build(1), build(2));
    }

    #[test]
    fn function_ranges_and_lines() {
        let mut e = UnitEmitter::new("/a.php");
        e.record_source_loc(SourceLoc::line(1));
        e.bytecode().nop();
        e.bytecode().nop();
        e.new_function("f", FuncAttrs::TOP, 5);
        e.record_source_loc(SourceLoc::line(5));
        e.bytecode().ret_c(0);
        let unit = e.finish();

        assert!(unit.function_at(1).is_some_and(|f| f.is_main()));
        assert_eq!(unit.function_at(2).map(|f| &**f.name()), Some("f"));
        assert!(unit.function_at(5).is_none());
        assert_eq!(unit.line_number(0), Some(1));
        assert_eq!(unit.line_number(3), Some(5));
    }
}
