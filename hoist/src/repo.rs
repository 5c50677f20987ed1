//! Persistent unit cache.
//!
//! A unit is stored as six tables keyed by its digest: `bc`, `meta`,
//! `litstr`, `array`, `srcloc` and `mergeables`. Every table starts with
//! [`TABLE_MAGIC`], the format version and a table tag, and is validated on
//! the way back in. Anything unreadable is a miss, never an error for the
//! caller.

use std::collections::HashMap;
use std::fs;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use log::{debug, warn};
use parking_lot::RwLock;

use crate::class::{ClassAttrs, ClassTemplate, Hoistable};
use crate::error::RepoError;
use crate::func::{FuncAttrs, FuncTemplate};
use crate::unit::{Digest, IncludeKind, Mergeable, Unit, UnitParts};
use crate::value::Value;

const TABLE_MAGIC: &[u8; 8] = b"HOISTREP";
const TABLE_VERSION: u32 = 1;
const MAX_VALUE_DEPTH: usize = 64;

pub const TABLES: [&str; 6] = ["bc", "meta", "litstr", "array", "srcloc", "mergeables"];

/// Content-addressed byte storage.
pub trait BlobStore: Send + Sync {
    fn put(&self, digest: &Digest, table: &str, bytes: &[u8]) -> Result<(), RepoError>;

    /// `Ok(None)` if nothing is stored under `(digest, table)`.
    fn get(&self, digest: &Digest, table: &str) -> Result<Option<Vec<u8>>, RepoError>;
}

/// In-process store, mostly for tests.
#[derive(Default)]
pub struct MemoryBlobStore {
    blobs: RwLock<HashMap<(Digest, String), Vec<u8>, ahash::RandomState>>,
}

impl MemoryBlobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }

    /// Overwrite a stored table; lets tests simulate corruption.
    pub fn tamper(&self, digest: &Digest, table: &str, f: impl FnOnce(&mut Vec<u8>)) {
        if let Some(bytes) = self.blobs.write().get_mut(&(*digest, table.to_owned())) {
            f(bytes);
        }
    }
}

impl BlobStore for MemoryBlobStore {
    fn put(&self, digest: &Digest, table: &str, bytes: &[u8]) -> Result<(), RepoError> {
        self.blobs
            .write()
            .insert((*digest, table.to_owned()), bytes.to_vec());
        Ok(())
    }

    fn get(&self, digest: &Digest, table: &str) -> Result<Option<Vec<u8>>, RepoError> {
        Ok(self.blobs.read().get(&(*digest, table.to_owned())).cloned())
    }
}

/// One directory per digest, one file per table.
pub struct DirBlobStore {
    root: PathBuf,
}

impl DirBlobStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn table_path(&self, digest: &Digest, table: &str) -> PathBuf {
        self.root.join(digest.to_string()).join(table)
    }
}

impl BlobStore for DirBlobStore {
    fn put(&self, digest: &Digest, table: &str, bytes: &[u8]) -> Result<(), RepoError> {
        let path = self.table_path(digest, table);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir)?;
        }
        // Write then rename so readers never see a partial table.
        let tmp = path.with_extension(format!("tmp{}", std::process::id()));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &path)?;
        Ok(())
    }

    fn get(&self, digest: &Digest, table: &str) -> Result<Option<Vec<u8>>, RepoError> {
        match fs::read(self.table_path(digest, table)) {
            Ok(bytes) => Ok(Some(bytes)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(err.into()),
        }
    }
}

/// Write every table of `unit` under its digest.
pub fn commit(store: &dyn BlobStore, unit: &Unit) -> Result<(), RepoError> {
    let digest = unit.digest();
    for (table, bytes) in TABLES.iter().zip(encode_tables(unit)) {
        store.put(&digest, table, &bytes)?;
    }
    debug!("committed {} as {}", unit.path(), digest.short());
    Ok(())
}

/// Read back the unit stored under `digest`.
///
/// Returns `None` on a miss. Corrupt or mismatching data is logged and
/// also reported as a miss so the caller falls back to compiling.
pub fn load(store: &dyn BlobStore, name: &str, digest: &Digest) -> Option<Unit> {
    match try_load(store, name, digest) {
        Ok(Some(unit)) => Some(unit),
        Ok(None) => {
            debug!("repo miss for {name} ({})", digest.short());
            None
        }
        Err(err) => {
            warn!("ignoring cached unit {name} ({}): {err}", digest.short());
            None
        }
    }
}

fn try_load(store: &dyn BlobStore, name: &str, digest: &Digest) -> Result<Option<Unit>, RepoError> {
    let mut tables = Vec::with_capacity(TABLES.len());
    for table in TABLES {
        match store.get(digest, table)? {
            Some(bytes) => tables.push(bytes),
            None => return Ok(None),
        }
    }
    let found = Digest::compute(&tables.iter().map(Vec::as_slice).collect::<Vec<_>>());
    if found != *digest {
        return Err(RepoError::DigestMismatch {
            expected: *digest,
            found,
        });
    }

    let bytecode = decode_table(&tables[0], "bc", |r| read_bytes(r))?;
    let meta = decode_table(&tables[1], "meta", read_meta)?;
    let litstrs = decode_table(&tables[2], "litstr", |r| read_list(r, read_arc_str))?;
    let (arrays, constants) = decode_table(&tables[3], "array", |r| {
        Ok((read_list(r, read_value)?, read_list(r, read_value)?))
    })?;
    let srcloc = decode_table(&tables[4], "srcloc", |r| read_bytes(r))?;
    let mergeables = decode_table(&tables[5], "mergeables", |r| read_list(r, read_mergeable))?;

    if &*meta.path != name {
        return Err(RepoError::corrupt(
            "meta",
            format!("stored for {}, requested as {name}", meta.path),
        ));
    }
    validate(&meta, &mergeables, bytecode.len())?;

    let parts = UnitParts {
        path: meta.path,
        bytecode,
        litstrs,
        arrays,
        constants,
        srcloc,
        classes: meta.classes,
        funcs: meta.funcs,
        mergeables,
        first_hoistable_class: meta.first_hoistable_class,
        first_mergeable: meta.first_mergeable,
        main_return: meta.main_return,
    };
    Ok(Some(Unit::from_parts(parts, *digest)))
}

/// Structural checks that keep a loaded unit from indexing out of bounds.
fn validate(meta: &Meta, mergeables: &[Mergeable], bc_len: usize) -> Result<(), RepoError> {
    let bad = |reason: &str| Err(RepoError::corrupt("meta", reason));
    match meta.funcs.first() {
        Some(main) if main.attrs.contains(FuncAttrs::MAIN) => {}
        _ => return bad("first function is not the top-level function"),
    }
    if meta.funcs.iter().any(|f| f.base > f.past || f.past as usize > bc_len) {
        return bad("function range outside bytecode");
    }
    if meta.first_hoistable_class > meta.first_mergeable || meta.first_mergeable >= mergeables.len() {
        return bad("merge sequence boundaries");
    }
    if mergeables.last() != Some(&Mergeable::Done) {
        return Err(RepoError::corrupt("mergeables", "missing Done"));
    }
    let nfuncs = meta.funcs.len() as u32;
    let nclasses = meta.classes.len() as u32;
    for (ix, m) in mergeables.iter().enumerate() {
        let ok = match m {
            Mergeable::TopFunc(id) => ix < meta.first_hoistable_class && *id < nfuncs,
            Mergeable::Class(id) => ix >= meta.first_hoistable_class && *id < nclasses,
            Mergeable::Done => ix + 1 == mergeables.len(),
            _ => ix >= meta.first_mergeable,
        };
        if !ok {
            return Err(RepoError::corrupt("mergeables", format!("bad entry {ix}")));
        }
    }
    Ok(())
}

/// Digest of a unit's encoded tables.
pub(crate) fn unit_digest(unit: &Unit) -> Digest {
    let tables = encode_tables(unit);
    Digest::compute(&tables.iter().map(Vec::as_slice).collect::<Vec<_>>())
}

fn encode_tables(unit: &Unit) -> [Vec<u8>; 6] {
    let bc = encode_table(0, |w| write_bytes(w, unit.bytecode()));
    let meta = encode_table(1, |w| write_meta(w, unit));
    let litstr = encode_table(2, |w| write_list(w, unit.literals(), |w, s| write_string(w, s)));
    let array = encode_table(3, |w| {
        write_list(w, unit.arrays(), write_value);
        write_list(w, unit.constants(), write_value);
    });
    let srcloc = encode_table(4, |w| write_bytes(w, unit.source_locations()));
    let mergeables = encode_table(5, |w| {
        let ops: Vec<&Mergeable> = unit.mergeable_ops().collect();
        write_list(w, &ops, |w, m| write_mergeable(w, m));
    });
    [bc, meta, litstr, array, srcloc, mergeables]
}

fn encode_table(tag: u8, body: impl FnOnce(&mut Vec<u8>)) -> Vec<u8> {
    let mut w = Vec::new();
    w.extend_from_slice(TABLE_MAGIC);
    write_u32(&mut w, TABLE_VERSION);
    write_u8(&mut w, tag);
    body(&mut w);
    w
}

fn decode_table<T>(
    bytes: &[u8],
    table: &'static str,
    body: impl FnOnce(&mut dyn Read) -> io::Result<T>,
) -> Result<T, RepoError> {
    let corrupt = |err: io::Error| RepoError::corrupt(table, err.to_string());
    let tag = TABLES.iter().position(|t| *t == table).unwrap_or(0) as u8;
    let mut r: &[u8] = bytes;
    let mut magic = [0u8; 8];
    r.read_exact(&mut magic).map_err(corrupt)?;
    if &magic != TABLE_MAGIC {
        return Err(RepoError::corrupt(table, "bad magic"));
    }
    let version = read_u32(&mut r).map_err(corrupt)?;
    if version != TABLE_VERSION {
        return Err(RepoError::corrupt(table, format!("unsupported version {version}")));
    }
    if read_u8(&mut r).map_err(corrupt)? != tag {
        return Err(RepoError::corrupt(table, "wrong table tag"));
    }
    let value = body(&mut r).map_err(corrupt)?;
    if !r.is_empty() {
        return Err(RepoError::corrupt(table, format!("{} trailing bytes", r.len())));
    }
    Ok(value)
}

// ── meta ───────────────────────────────────────────────────────────

struct Meta {
    path: Arc<str>,
    funcs: Vec<FuncTemplate>,
    classes: Vec<ClassTemplate>,
    first_hoistable_class: usize,
    first_mergeable: usize,
    main_return: Option<Value>,
}

fn write_meta(w: &mut Vec<u8>, unit: &Unit) {
    write_string(w, unit.path());
    let funcs: Vec<FuncTemplate> = unit.functions().iter().map(|f| f.template()).collect();
    write_list(w, &funcs, |w, f| {
        write_string(w, &f.name);
        write_u8(w, f.attrs.bits());
        write_u32(w, f.base);
        write_u32(w, f.past);
        write_u32(w, f.line);
    });
    write_list(w, unit.class_templates(), |w, c| {
        write_string(w, &c.name);
        write_opt_string(w, c.parent.as_deref());
        write_list(w, &c.interfaces, |w, s| write_string(w, s));
        write_u8(w, c.attrs.bits());
        write_list(w, &c.methods, |w, s| write_string(w, s));
        write_u8(w, c.hoistable as u8);
        write_u32(w, c.line);
        write_u32(w, c.offset);
    });
    let range = unit.hoistable_range();
    write_u32(w, range.start as u32);
    write_u32(w, range.end as u32);
    match unit.main_return() {
        Some(v) => {
            write_u8(w, 1);
            write_value(w, v);
        }
        None => write_u8(w, 0),
    }
}

fn read_meta(r: &mut dyn Read) -> io::Result<Meta> {
    let path = read_arc_str(r)?;
    let funcs = read_list(r, |r| {
        Ok(FuncTemplate {
            name: read_arc_str(r)?,
            attrs: FuncAttrs::from_bits(read_u8(r)?)
                .ok_or_else(|| invalid_data("unknown function attributes"))?,
            base: read_u32(r)?,
            past: read_u32(r)?,
            line: read_u32(r)?,
        })
    })?;
    let mut next_id = 0u32;
    let classes = read_list(r, |r| {
        let id = next_id;
        next_id += 1;
        Ok(ClassTemplate {
            id,
            name: read_arc_str(r)?,
            parent: read_opt_string(r)?.map(Arc::from),
            interfaces: read_list(r, read_arc_str)?,
            attrs: ClassAttrs::from_bits(read_u8(r)?)
                .ok_or_else(|| invalid_data("unknown class attributes"))?,
            methods: read_list(r, read_arc_str)?,
            hoistable: Hoistable::try_from(read_u8(r)?)
                .map_err(|_| invalid_data("unknown hoistability"))?,
            line: read_u32(r)?,
            offset: read_u32(r)?,
            unit_path: path.clone(),
        })
    })?;
    let first_hoistable_class = read_u32(r)? as usize;
    let first_mergeable = read_u32(r)? as usize;
    let main_return = match read_u8(r)? {
        0 => None,
        1 => Some(read_value(r)?),
        _ => return Err(invalid_data("invalid option tag")),
    };
    Ok(Meta {
        path,
        funcs,
        classes,
        first_hoistable_class,
        first_mergeable,
        main_return,
    })
}

// ── mergeables ─────────────────────────────────────────────────────

fn write_mergeable(w: &mut Vec<u8>, m: &Mergeable) {
    match m {
        Mergeable::TopFunc(id) => {
            write_u8(w, 0);
            write_u32(w, *id);
        }
        Mergeable::Class(id) => {
            write_u8(w, 1);
            write_u32(w, *id);
        }
        Mergeable::Define { name, value } => {
            write_u8(w, 2);
            write_string(w, name);
            write_value(w, value);
        }
        Mergeable::Global { name, value } => {
            write_u8(w, 3);
            write_string(w, name);
            write_value(w, value);
        }
        Mergeable::Include { kind, target } => {
            write_u8(w, 4);
            write_u8(w, *kind as u8);
            write_string(w, target);
        }
        Mergeable::Done => write_u8(w, 5),
    }
}

fn read_mergeable(r: &mut dyn Read) -> io::Result<Mergeable> {
    Ok(match read_u8(r)? {
        0 => Mergeable::TopFunc(read_u32(r)?),
        1 => Mergeable::Class(read_u32(r)?),
        2 => Mergeable::Define {
            name: read_arc_str(r)?,
            value: read_value(r)?,
        },
        3 => Mergeable::Global {
            name: read_arc_str(r)?,
            value: read_value(r)?,
        },
        4 => Mergeable::Include {
            kind: IncludeKind::try_from(read_u8(r)?)
                .map_err(|_| invalid_data("unknown include kind"))?,
            target: read_arc_str(r)?,
        },
        5 => Mergeable::Done,
        _ => return Err(invalid_data("unknown mergeable tag")),
    })
}

// ── values ─────────────────────────────────────────────────────────

fn write_value(w: &mut Vec<u8>, v: &Value) {
    write_u8(w, v.tag());
    match v {
        Value::Null => {}
        Value::Bool(b) => write_u8(w, *b as u8),
        Value::Int(i) => write_u64(w, *i as u64),
        Value::Double(d) => write_u64(w, d.to_bits()),
        Value::Str(s) => write_string(w, s),
        Value::Array(items) => write_list(w, items, write_value),
    }
}

fn read_value(r: &mut dyn Read) -> io::Result<Value> {
    read_value_at(r, 0)
}

fn read_value_at(r: &mut dyn Read, depth: usize) -> io::Result<Value> {
    if depth > MAX_VALUE_DEPTH {
        return Err(invalid_data("value nesting too deep"));
    }
    Ok(match read_u8(r)? {
        0 => Value::Null,
        1 => Value::Bool(read_u8(r)? != 0),
        2 => Value::Int(read_u64(r)? as i64),
        3 => Value::Double(f64::from_bits(read_u64(r)?)),
        4 => Value::Str(read_arc_str(r)?),
        5 => Value::Array(read_list(r, |r| read_value_at(r, depth + 1))?.into()),
        _ => return Err(invalid_data("unknown value tag")),
    })
}

// ── primitives ─────────────────────────────────────────────────────

fn write_u8(w: &mut Vec<u8>, v: u8) {
    w.push(v);
}

fn read_u8(r: &mut dyn Read) -> io::Result<u8> {
    let mut b = [0u8; 1];
    r.read_exact(&mut b)?;
    Ok(b[0])
}

fn write_u32(w: &mut Vec<u8>, v: u32) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn read_u32(r: &mut dyn Read) -> io::Result<u32> {
    let mut b = [0u8; 4];
    r.read_exact(&mut b)?;
    Ok(u32::from_le_bytes(b))
}

fn write_u64(w: &mut Vec<u8>, v: u64) {
    w.extend_from_slice(&v.to_le_bytes());
}

fn read_u64(r: &mut dyn Read) -> io::Result<u64> {
    let mut b = [0u8; 8];
    r.read_exact(&mut b)?;
    Ok(u64::from_le_bytes(b))
}

fn write_bytes(w: &mut Vec<u8>, bytes: &[u8]) {
    write_u32(w, bytes.len() as u32);
    w.extend_from_slice(bytes);
}

fn read_bytes(r: &mut dyn Read) -> io::Result<Vec<u8>> {
    let len = read_u32(r)? as usize;
    let mut buf = Vec::new();
    r.take(len as u64).read_to_end(&mut buf)?;
    if buf.len() != len {
        return Err(io::Error::new(io::ErrorKind::UnexpectedEof, "short read"));
    }
    Ok(buf)
}

fn write_string(w: &mut Vec<u8>, s: &str) {
    write_bytes(w, s.as_bytes());
}

fn read_arc_str(r: &mut dyn Read) -> io::Result<Arc<str>> {
    let bytes = read_bytes(r)?;
    String::from_utf8(bytes)
        .map(Arc::from)
        .map_err(|_| invalid_data("invalid utf-8 in repo"))
}

fn write_opt_string(w: &mut Vec<u8>, s: Option<&str>) {
    match s {
        Some(value) => {
            write_u8(w, 1);
            write_string(w, value);
        }
        None => write_u8(w, 0),
    }
}

fn read_opt_string(r: &mut dyn Read) -> io::Result<Option<Arc<str>>> {
    match read_u8(r)? {
        0 => Ok(None),
        1 => Ok(Some(read_arc_str(r)?)),
        _ => Err(invalid_data("invalid option tag")),
    }
}

fn write_list<T>(w: &mut Vec<u8>, items: &[T], mut each: impl FnMut(&mut Vec<u8>, &T)) {
    write_u32(w, items.len() as u32);
    for item in items {
        each(w, item);
    }
}

fn read_list<T>(
    r: &mut dyn Read,
    mut each: impl FnMut(&mut dyn Read) -> io::Result<T>,
) -> io::Result<Vec<T>> {
    let len = read_u32(r)? as usize;
    // Cap the preallocation; a corrupt length must not allocate gigabytes.
    let mut out = Vec::with_capacity(len.min(1024));
    for _ in 0..len {
        out.push(each(r)?);
    }
    Ok(out)
}

fn invalid_data(msg: &str) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::emitter::{ClassDecl, DeclContext, UnitEmitter};
    use bytecode::SourceLoc;

    fn sample_unit() -> Unit {
        let mut e = UnitEmitter::new("/app/a.php");
        e.set_authoritative(true);
        e.record_source_loc(SourceLoc::new(1, 1, 3, 9));
        let msg = e.add_literal("hello") as u16;
        let one = e.add_constant(Value::Int(1)) as u16;
        e.add_array(Value::array([Value::Double(2.5), Value::str("x"), Value::Null]));
        let c = e.new_class_template(
            ClassDecl::new("C").extends("B").implements("I").method("run").line(2),
            DeclContext::TopLevel,
        );
        e.bytecode().def_cls(c as u16);
        e.bytecode().def_cns(msg, one);
        e.push_mergeable_define("X", Value::Int(1));
        e.push_mergeable_global("G", Value::str("g"));
        e.push_mergeable_include(IncludeKind::Relative, "b.php");
        e.set_main_return(Value::Bool(true));
        e.bytecode().ret_c(one);
        e.new_function("f", FuncAttrs::TOP | FuncAttrs::UNIQUE, 7);
        e.record_source_loc(SourceLoc::line(7));
        e.bytecode().ret_c(one);
        e.finish()
    }

    fn assert_same_unit(a: &Unit, b: &Unit) {
        assert_eq!(a.digest(), b.digest());
        assert_eq!(a.bytecode(), b.bytecode());
        assert_eq!(a.literals(), b.literals());
        assert_eq!(a.arrays(), b.arrays());
        assert_eq!(a.constants(), b.constants());
        assert_eq!(a.source_locations(), b.source_locations());
        assert!(a.mergeable_ops().eq(b.mergeable_ops()));
        assert_eq!(a.hoistable_range(), b.hoistable_range());
        assert_eq!(a.main_return(), b.main_return());
        let templates = |u: &Unit| -> Vec<ClassTemplate> {
            u.class_templates().iter().map(|t| (**t).clone()).collect()
        };
        assert_eq!(templates(a), templates(b));
        let funcs = |u: &Unit| -> Vec<FuncTemplate> {
            u.functions().iter().map(|f| f.template()).collect()
        };
        assert_eq!(funcs(a), funcs(b));
    }

    #[test]
    fn commit_then_load_reproduces_the_unit() {
        let store = MemoryBlobStore::new();
        let unit = sample_unit();
        commit(&store, &unit).unwrap();
        assert_eq!(store.len(), TABLES.len());

        let loaded = load(&store, "/app/a.php", &unit.digest()).expect("hit");
        assert_same_unit(&unit, &loaded);
        assert_eq!(loaded.line_number(0), Some(1));
    }

    #[test]
    fn unknown_digest_is_a_miss() {
        let store = MemoryBlobStore::new();
        assert!(load(&store, "/app/a.php", &Digest::compute(&[b"nope"])).is_none());
    }

    #[test]
    fn corruption_is_a_miss() {
        let store = MemoryBlobStore::new();
        let unit = sample_unit();
        commit(&store, &unit).unwrap();
        store.tamper(&unit.digest(), "mergeables", |b| {
            b.truncate(b.len() - 1);
        });
        assert!(load(&store, "/app/a.php", &unit.digest()).is_none());
    }

    #[test]
    fn bad_header_is_reported() {
        let mut bytes = encode_table(0, |w| write_bytes(w, b"abc"));
        bytes[0] = b'X';
        let err = decode_table(&bytes, "bc", |r| read_bytes(r)).unwrap_err();
        assert!(matches!(err, RepoError::Corrupt { table: "bc", .. }), "{err}");

        let bytes = encode_table(1, |w| write_bytes(w, b"abc"));
        assert!(decode_table(&bytes, "bc", |r| read_bytes(r)).is_err(), "tag mismatch");
    }

    #[test]
    fn wrong_name_is_a_miss() {
        let store = MemoryBlobStore::new();
        let unit = sample_unit();
        commit(&store, &unit).unwrap();
        assert!(load(&store, "/other.php", &unit.digest()).is_none());
    }

    #[test]
    fn dir_store_round_trip() {
        let mut root = std::env::temp_dir();
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .expect("clock before unix epoch")
            .as_nanos();
        root.push(format!("hoist-repo-test-{}-{nanos}", std::process::id()));

        let store = DirBlobStore::new(&root);
        let unit = sample_unit();
        commit(&store, &unit).unwrap();
        assert!(root.join(unit.digest().to_string()).join("mergeables").exists());
        let loaded = load(&store, "/app/a.php", &unit.digest()).expect("hit");
        assert_same_unit(&unit, &loaded);

        let _ = fs::remove_dir_all(&root);
    }
}
