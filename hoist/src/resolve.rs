//! Include-path resolution and the in-memory unit registry.

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, trace};

use crate::runtime::UnitLoader;
use crate::unit::{IncludeKind, Unit};

/// Maps an include directive to the paths it may refer to.
#[derive(Debug, Clone)]
pub struct PathResolver {
    doc_root: Arc<str>,
}

impl PathResolver {
    pub fn new(doc_root: &str) -> Self {
        Self {
            doc_root: Arc::from(normalize(doc_root)),
        }
    }

    pub fn doc_root(&self) -> &str {
        &self.doc_root
    }

    /// Candidate paths for `name` included from a unit in `from_dir`, in
    /// lookup order. Absolute names resolve to themselves.
    pub fn candidates(&self, name: &str, kind: IncludeKind, from_dir: &str) -> Vec<String> {
        if name.starts_with('/') {
            return vec![normalize(name)];
        }
        let local = || normalize(&format!("{from_dir}/{name}"));
        let rooted = || normalize(&format!("{}/{name}", self.doc_root));
        let mut out = match kind {
            IncludeKind::Relative => vec![local()],
            IncludeKind::DocRoot => vec![rooted()],
            IncludeKind::Module => vec![local(), rooted()],
        };
        out.dedup();
        out
    }
}

/// Collapse `.`, `..` and repeated separators. The result is absolute.
pub fn normalize(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for part in path.split('/') {
        match part {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            part => parts.push(part),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Units known to the process, keyed by path.
pub struct UnitRegistry {
    resolver: PathResolver,
    units: DashMap<Arc<str>, Arc<Unit>, ahash::RandomState>,
}

impl UnitRegistry {
    pub fn new(doc_root: &str) -> Self {
        Self {
            resolver: PathResolver::new(doc_root),
            units: DashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    pub fn resolver(&self) -> &PathResolver {
        &self.resolver
    }

    /// Make `unit` the one loaded for its path, replacing any earlier unit
    /// at that path. Units already merged keep working.
    pub fn register(&self, unit: Unit) -> Arc<Unit> {
        let unit = Arc::new(unit);
        let path: Arc<str> = Arc::from(normalize(unit.path()));
        if let Some(old) = self.units.insert(path, unit.clone()) {
            debug!("{} replaced ({} -> {})", unit.path(), old.digest().short(), unit.digest().short());
        }
        unit
    }

    pub fn get(&self, path: &str) -> Option<Arc<Unit>> {
        self.units.get(path).map(|u| u.clone())
    }

    pub fn len(&self) -> usize {
        self.units.len()
    }

    pub fn is_empty(&self) -> bool {
        self.units.is_empty()
    }
}

impl UnitLoader for UnitRegistry {
    fn load_unit(&self, name: &str, kind: IncludeKind, from: &Unit) -> Option<Arc<Unit>> {
        self.resolver
            .candidates(name, kind, from.dir())
            .into_iter()
            .find_map(|path| {
                let unit = self.get(&path);
                trace!(
                    "include {} {name} from {}: {path} {}",
                    kind.mnemonic(),
                    from.path(),
                    if unit.is_some() { "hit" } else { "miss" }
                );
                unit
            })
    }
}
