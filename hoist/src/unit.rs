//! The immutable compiled-module artifact.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use bitflags::bitflags;
use bytecode::{BytecodeDecoder, Instruction, SourceLoc, source_loc_entries, source_loc_lookup};
use parking_lot::Mutex;

use crate::cache::{IncludeBit, SlotLayout};
use crate::class::{Class, ClassTemplate};
use crate::func::Func;
use crate::value::Value;

pub use bytecode::IncludeKind;

/// 256-bit content hash of a unit.
#[derive(Clone, Copy, PartialEq, Eq, Hash, Default)]
pub struct Digest(pub [u8; 32]);

impl Digest {
    pub fn compute(tables: &[&[u8]]) -> Self {
        let mut hasher = blake3::Hasher::new();
        for table in tables {
            hasher.update(&(table.len() as u64).to_le_bytes());
            hasher.update(table);
        }
        Self(*hasher.finalize().as_bytes())
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse the 64-character lowercase hex form.
    pub fn from_hex(hex: &str) -> Option<Self> {
        if hex.len() != 64 {
            return None;
        }
        let mut out = [0u8; 32];
        for (i, byte) in out.iter_mut().enumerate() {
            *byte = u8::from_str_radix(hex.get(i * 2..i * 2 + 2)?, 16).ok()?;
        }
        Some(Self(out))
    }

    /// First 12 hex characters, for logs.
    pub fn short(&self) -> String {
        self.to_string()[..12].to_owned()
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for b in &self.0 {
            write!(f, "{b:02x}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", self.short())
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Default)]
    pub struct MergeState: u8 {
        const MERGING = 1 << 0;
        const MERGED = 1 << 1;
        /// Every top function is globally unique; replay stores them
        /// without checking for a conflicting binding.
        const UNIQUE_FUNCS = 1 << 2;
        /// Every mergeable class is globally unique.
        const UNIQUE_CLASSES = 1 << 3;
        /// The class entries have been rewritten to their defined classes.
        const UNIQUE_DEFINED_CLASSES = 1 << 4;
    }
}

impl MergeState {
    pub fn is_unmerged(self) -> bool {
        !self.intersects(MergeState::MERGING | MergeState::MERGED)
    }
}

/// One persisted entry of a unit's merge instruction sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Mergeable {
    /// Bind the unit's function with this id.
    TopFunc(u32),
    /// Define the unit's class template with this id.
    Class(u32),
    Define { name: Arc<str>, value: Value },
    Global { name: Arc<str>, value: Value },
    Include { kind: IncludeKind, target: Arc<str> },
    Done,
}

/// What a reader sees at one position of the merge sequence.
///
/// `UniqueDefinedClass` appears once a `Class` entry has been rewritten to
/// the class it always defines.
#[derive(Debug, Clone, Copy)]
pub enum MergeInstr<'a> {
    TopFunc(&'a Arc<Func>),
    Class(&'a Arc<ClassTemplate>),
    UniqueDefinedClass(&'a Arc<Class>),
    Define { name: &'a Arc<str>, value: &'a Value },
    Global { name: &'a Arc<str>, value: &'a Value },
    Include { kind: IncludeKind, target: &'a Arc<str> },
    Done,
}

pub(crate) enum Resolved {
    Class(Arc<Class>),
    Unit(Weak<Unit>),
}

pub(crate) struct MergeEntry {
    pub(crate) op: Mergeable,
    pub(crate) resolved: OnceLock<Resolved>,
}

impl MergeEntry {
    pub(crate) fn new(op: Mergeable) -> Self {
        Self {
            op,
            resolved: OnceLock::new(),
        }
    }

    pub(crate) fn defined_class(&self) -> Option<&Arc<Class>> {
        match self.resolved.get() {
            Some(Resolved::Class(cls)) => Some(cls),
            _ => None,
        }
    }

    pub(crate) fn include_target(&self) -> Option<Arc<Unit>> {
        match self.resolved.get() {
            Some(Resolved::Unit(unit)) => unit.upgrade(),
            _ => None,
        }
    }
}

/// Everything a unit is made of, as produced by the emitter or read back
/// from the blob store.
pub(crate) struct UnitParts {
    pub path: Arc<str>,
    pub bytecode: Vec<u8>,
    pub litstrs: Vec<Arc<str>>,
    pub arrays: Vec<Value>,
    pub constants: Vec<Value>,
    pub srcloc: Vec<u8>,
    pub classes: Vec<ClassTemplate>,
    pub funcs: Vec<crate::func::FuncTemplate>,
    pub mergeables: Vec<Mergeable>,
    pub first_hoistable_class: usize,
    pub first_mergeable: usize,
    pub main_return: Option<Value>,
}

pub struct Unit {
    path: Arc<str>,
    dir: Arc<str>,
    digest: Digest,
    bytecode: Vec<u8>,
    litstrs: Vec<Arc<str>>,
    arrays: Vec<Value>,
    constants: Vec<Value>,
    srcloc: Vec<u8>,
    classes: Vec<Arc<ClassTemplate>>,
    funcs: Vec<Arc<Func>>,
    pub(crate) mergeables: Vec<MergeEntry>,
    pub(crate) first_hoistable_class: usize,
    pub(crate) first_mergeable: usize,
    main_return: Option<Value>,
    state: AtomicU8,
    pub(crate) merge_lock: Mutex<()>,
    include_bit: OnceLock<IncludeBit>,
}

impl Unit {
    pub(crate) fn from_parts(parts: UnitParts, digest: Digest) -> Self {
        let dir = match parts.path.rfind('/') {
            Some(0) => Arc::from("/"),
            Some(i) => Arc::from(&parts.path[..i]),
            None => Arc::from(""),
        };
        let classes = parts
            .classes
            .into_iter()
            .map(|mut t| {
                t.unit_path = parts.path.clone();
                Arc::new(t)
            })
            .collect();
        let funcs = parts
            .funcs
            .iter()
            .enumerate()
            .map(|(i, t)| Arc::new(Func::new(i as u32, t, parts.path.clone())))
            .collect();
        Self {
            path: parts.path,
            dir,
            digest,
            bytecode: parts.bytecode,
            litstrs: parts.litstrs,
            arrays: parts.arrays,
            constants: parts.constants,
            srcloc: parts.srcloc,
            classes,
            funcs,
            mergeables: parts.mergeables.into_iter().map(MergeEntry::new).collect(),
            first_hoistable_class: parts.first_hoistable_class,
            first_mergeable: parts.first_mergeable,
            main_return: parts.main_return,
            state: AtomicU8::new(0),
            merge_lock: Mutex::new(()),
            include_bit: OnceLock::new(),
        }
    }

    pub(crate) fn set_digest(&mut self, digest: Digest) {
        self.digest = digest;
    }

    pub fn path(&self) -> &Arc<str> {
        &self.path
    }

    /// Directory part of the path, used to resolve relative includes.
    pub fn dir(&self) -> &Arc<str> {
        &self.dir
    }

    pub fn digest(&self) -> Digest {
        self.digest
    }

    pub fn bytecode(&self) -> &[u8] {
        &self.bytecode
    }

    pub fn literal(&self, id: u32) -> Option<&Arc<str>> {
        self.litstrs.get(id as usize)
    }

    pub fn literals(&self) -> &[Arc<str>] {
        &self.litstrs
    }

    pub fn array(&self, id: u32) -> Option<&Value> {
        self.arrays.get(id as usize)
    }

    pub fn arrays(&self) -> &[Value] {
        &self.arrays
    }

    pub fn constant(&self, id: u32) -> Option<&Value> {
        self.constants.get(id as usize)
    }

    pub fn constants(&self) -> &[Value] {
        &self.constants
    }

    pub fn source_locations(&self) -> &[u8] {
        &self.srcloc
    }

    pub fn class_templates(&self) -> &[Arc<ClassTemplate>] {
        &self.classes
    }

    pub fn class_template(&self, id: u32) -> Option<&Arc<ClassTemplate>> {
        self.classes.get(id as usize)
    }

    pub fn functions(&self) -> &[Arc<Func>] {
        &self.funcs
    }

    pub fn function(&self, id: u32) -> Option<&Arc<Func>> {
        self.funcs.get(id as usize)
    }

    /// The synthetic function holding the module's top-level code.
    pub fn top_function(&self) -> &Arc<Func> {
        &self.funcs[0]
    }

    /// Functions bound on every merge.
    pub fn top_functions(&self) -> impl Iterator<Item = &Arc<Func>> {
        self.mergeables[..self.first_hoistable_class]
            .iter()
            .filter_map(|e| match e.op {
                Mergeable::TopFunc(id) => self.funcs.get(id as usize),
                _ => None,
            })
    }

    pub fn main_return(&self) -> Option<&Value> {
        self.main_return.as_ref()
    }

    /// The merge sequence alone reproduces the top-level code; its body is
    /// never interpreted.
    pub fn is_merge_only(&self) -> bool {
        self.main_return.is_some()
    }

    pub fn merge_state(&self) -> MergeState {
        MergeState::from_bits_truncate(self.state.load(Ordering::Acquire))
    }

    pub(crate) fn set_merge_state(&self, state: MergeState) {
        self.state.store(state.bits(), Ordering::Release);
    }

    pub(crate) fn add_merge_state(&self, bits: MergeState) {
        self.state.fetch_or(bits.bits(), Ordering::AcqRel);
    }

    pub fn include_bit(&self, layout: &SlotLayout) -> IncludeBit {
        *self.include_bit.get_or_init(|| layout.alloc_include_bit())
    }

    pub fn mergeables_len(&self) -> usize {
        self.mergeables.len()
    }

    /// Persisted form of the merge sequence.
    pub fn mergeable_ops(&self) -> impl Iterator<Item = &Mergeable> {
        self.mergeables.iter().map(|e| &e.op)
    }

    /// Range of the hoistable class prefix within the merge sequence.
    pub fn hoistable_range(&self) -> std::ops::Range<usize> {
        self.first_hoistable_class..self.first_mergeable
    }

    /// Current view of the merge sequence at `ix`.
    pub fn mergeable(&self, ix: usize) -> Option<MergeInstr<'_>> {
        let entry = self.mergeables.get(ix)?;
        Some(match &entry.op {
            Mergeable::TopFunc(id) => MergeInstr::TopFunc(self.funcs.get(*id as usize)?),
            Mergeable::Class(id) => match entry.defined_class() {
                Some(cls) => MergeInstr::UniqueDefinedClass(cls),
                None => MergeInstr::Class(self.classes.get(*id as usize)?),
            },
            Mergeable::Define { name, value } => MergeInstr::Define { name, value },
            Mergeable::Global { name, value } => MergeInstr::Global { name, value },
            Mergeable::Include { kind, target } => MergeInstr::Include {
                kind: *kind,
                target,
            },
            Mergeable::Done => MergeInstr::Done,
        })
    }

    /// The function whose bytecode contains `offset`.
    pub fn function_at(&self, offset: u32) -> Option<&Arc<Func>> {
        let mut by_past: Vec<&Arc<Func>> = self.funcs.iter().collect();
        by_past.sort_by_key(|f| f.past());
        let ix = by_past.partition_point(|f| f.past() <= offset);
        by_past.get(ix).copied().filter(|f| f.contains(offset))
    }

    pub fn source_loc(&self, offset: u32) -> Option<SourceLoc> {
        source_loc_lookup(&self.srcloc, offset)
    }

    pub fn line_number(&self, offset: u32) -> Option<u32> {
        self.source_loc(offset).map(|loc| loc.line0)
    }

    /// If the top-level code does nothing but raise a fatal error, the
    /// message and line of that error.
    pub fn compile_time_fatal(&self) -> Option<(Arc<str>, u32)> {
        let main = self.top_function();
        let mut decoder = BytecodeDecoder::at(&self.bytecode, main.base() as usize);
        match decoder.decode_next() {
            Ok(Some(Instruction::Fatal { msg })) => {
                let line = self.line_number(main.base()).unwrap_or(main.line());
                Some((self.literal(msg as u32)?.clone(), line))
            }
            _ => None,
        }
    }

    /// Rename a top function. Only valid before the unit's first merge.
    pub fn rename_function(&mut self, old: &str, new: &str) -> bool {
        if !self.merge_state().is_unmerged() {
            return false;
        }
        for func in self.funcs.iter_mut().filter(|f| f.is_top()) {
            if &**func.name() == old {
                return match Arc::get_mut(func) {
                    Some(func) => {
                        func.rename(Arc::from(new));
                        true
                    }
                    None => false,
                };
            }
        }
        false
    }
}

impl fmt::Debug for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Unit")
            .field("path", &self.path)
            .field("digest", &self.digest)
            .field("state", &self.merge_state())
            .finish()
    }
}

/// Disassembly dump: functions with interleaved line markers, then class
/// templates and the merge sequence.
impl fmt::Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "Unit {} {}", self.path, self.digest)?;
        let lines = source_loc_entries(&self.srcloc).unwrap_or_default();
        for func in &self.funcs {
            let name = if func.is_main() { "<main>" } else { &**func.name() };
            writeln!(f, "Function {name} [{}, {}) line {}", func.base(), func.past(), func.line())?;
            let mut decoder = BytecodeDecoder::at(&self.bytecode, func.base() as usize);
            let mut last_line = None;
            while decoder.offset() < func.past() as usize {
                let offset = decoder.offset() as u32;
                let line = lines
                    .iter()
                    .take_while(|(pc, _)| *pc <= offset)
                    .last()
                    .map(|(_, loc)| loc.line0);
                if line.is_some() && line != last_line {
                    writeln!(f, "  // line {}", line.unwrap_or_default())?;
                    last_line = line;
                }
                match decoder.decode_next() {
                    Ok(Some(insn)) => writeln!(f, "  {offset:>5}: {insn}")?,
                    Ok(None) => break,
                    Err(err) => {
                        writeln!(f, "  {offset:>5}: <{err}>")?;
                        break;
                    }
                }
            }
        }
        for class in &self.classes {
            write!(f, "Class {}", class.name)?;
            if let Some(parent) = &class.parent {
                write!(f, " extends {parent}")?;
            }
            if !class.interfaces.is_empty() {
                let names: Vec<&str> = class.interfaces.iter().map(|i| &**i).collect();
                write!(f, " implements {}", names.join(", "))?;
            }
            writeln!(f, " ({:?}) line {}", class.hoistable, class.line)?;
        }
        writeln!(f, "Mergeables:")?;
        for ix in 0..self.mergeables.len() {
            let Some(instr) = self.mergeable(ix) else {
                continue;
            };
            match instr {
                MergeInstr::TopFunc(func) => writeln!(f, "  {ix:>3}: func {}", func.name())?,
                MergeInstr::Class(t) => writeln!(f, "  {ix:>3}: class {}", t.name)?,
                MergeInstr::UniqueDefinedClass(c) => {
                    writeln!(f, "  {ix:>3}: defined-class {}", c.name())?
                }
                MergeInstr::Define { name, value } => {
                    writeln!(f, "  {ix:>3}: define {name} = {value}")?
                }
                MergeInstr::Global { name, value } => {
                    writeln!(f, "  {ix:>3}: global {name} = {value}")?
                }
                MergeInstr::Include { kind, target } => {
                    writeln!(f, "  {ix:>3}: include {} {target}", kind.mnemonic())?
                }
                MergeInstr::Done => writeln!(f, "  {ix:>3}: done")?,
            }
        }
        Ok(())
    }
}
