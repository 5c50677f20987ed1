use std::sync::Arc;

use log::debug;

use crate::activation::Activation;
use crate::cache::CacheContents;
use crate::emitter::UnitEmitter;
use crate::error::{MergeError, RepoError};
use crate::interp::TopLevelInterpreter;
use crate::names::Directory;
use crate::repo::{self, BlobStore};
use crate::resolve::UnitRegistry;
use crate::unit::{Digest, IncludeKind, Unit};
use crate::value::Value;

/// Finds the unit an include refers to.
///
/// Called while the including unit's merge lock may be held, so an
/// implementation may load or compile units but must not merge them.
pub trait UnitLoader: Send + Sync {
    fn load_unit(&self, name: &str, kind: IncludeKind, from: &Unit) -> Option<Arc<Unit>>;
}

/// Invoked with a class name that failed to resolve. May include or
/// define further units through `act`.
pub trait Autoloader: Send + Sync {
    fn autoload(&self, act: &mut Activation, name: &str) -> Result<(), MergeError>;
}

/// Runs a unit's top-level function.
pub trait Engine: Send + Sync {
    fn invoke_top(&self, act: &mut Activation, unit: &Arc<Unit>) -> Result<Value, MergeError>;
}

pub struct RuntimeCreateInfo {
    /// Whole-program mode: enables the unique-name fast paths and lets
    /// merge-only units keep defines, globals and includes.
    pub authoritative: bool,
    /// Initial per-activation cache capacity.
    pub initial_slots: usize,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub loader: Option<Arc<dyn UnitLoader>>,
    pub autoloader: Option<Arc<dyn Autoloader>>,
    pub engine: Option<Arc<dyn Engine>>,
}

impl Default for RuntimeCreateInfo {
    fn default() -> Self {
        Self {
            authoritative: false,
            initial_slots: 256,
            blob_store: None,
            loader: None,
            autoloader: None,
            engine: None,
        }
    }
}

impl RuntimeCreateInfo {
    pub fn with_loader(mut self, loader: Arc<dyn UnitLoader>) -> Self {
        self.loader = Some(loader);
        self
    }

    pub fn with_autoloader(mut self, autoloader: Arc<dyn Autoloader>) -> Self {
        self.autoloader = Some(autoloader);
        self
    }

    pub fn with_engine(mut self, engine: Arc<dyn Engine>) -> Self {
        self.engine = Some(engine);
        self
    }

    pub fn with_blob_store(mut self, store: Arc<dyn BlobStore>) -> Self {
        self.blob_store = Some(store);
        self
    }
}

pub(crate) struct RuntimeShared {
    pub directory: Directory,
    pub authoritative: bool,
    pub initial_slots: usize,
    pub blob_store: Option<Arc<dyn BlobStore>>,
    pub loader: Arc<dyn UnitLoader>,
    pub autoloader: Option<Arc<dyn Autoloader>>,
    pub engine: Arc<dyn Engine>,
}

/// Process-wide state shared by every activation: the directory, the slot
/// layout and the injected collaborators.
#[derive(Clone)]
pub struct Runtime {
    pub(crate) inner: Arc<RuntimeShared>,
}

impl Runtime {
    pub fn new(info: RuntimeCreateInfo) -> Self {
        let inner = RuntimeShared {
            directory: Directory::new(),
            authoritative: info.authoritative,
            initial_slots: info.initial_slots,
            blob_store: info.blob_store,
            loader: info
                .loader
                .unwrap_or_else(|| Arc::new(UnitRegistry::new("/"))),
            autoloader: info.autoloader,
            engine: info
                .engine
                .unwrap_or_else(|| Arc::new(TopLevelInterpreter::default())),
        };
        debug!(
            "runtime created (authoritative: {}, store: {})",
            inner.authoritative,
            inner.blob_store.is_some()
        );
        Self {
            inner: Arc::new(inner),
        }
    }

    /// A fresh activation with empty cache contents.
    pub fn activate(&self) -> Activation {
        Activation::new(
            self.inner.clone(),
            CacheContents::with_capacity(self.inner.initial_slots),
        )
    }

    pub fn directory(&self) -> &Directory {
        &self.inner.directory
    }

    pub fn is_authoritative(&self) -> bool {
        self.inner.authoritative
    }

    /// An emitter configured for this runtime.
    pub fn new_emitter(&self, path: &str) -> UnitEmitter {
        let mut emitter = UnitEmitter::new(path);
        emitter.set_authoritative(self.inner.authoritative);
        emitter
    }

    /// Persist `unit` to the configured blob store, if any.
    pub fn commit(&self, unit: &Unit) -> Result<(), RepoError> {
        match &self.inner.blob_store {
            Some(store) => repo::commit(store.as_ref(), unit),
            None => Ok(()),
        }
    }

    /// Look `digest` up in the configured blob store. `None` means the
    /// caller should compile.
    pub fn load(&self, name: &str, digest: &Digest) -> Option<Arc<Unit>> {
        let store = self.inner.blob_store.as_ref()?;
        repo::load(store.as_ref(), name, digest).map(Arc::new)
    }

    /// Drop unreferenced, superseded class versions.
    pub fn reclaim(&self) -> usize {
        self.inner.directory.reclaim()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new(RuntimeCreateInfo::default())
    }
}
