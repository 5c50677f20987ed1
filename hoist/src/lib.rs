mod activation;
mod cache;
mod class;
mod defclass;
mod emitter;
mod error;
mod func;
mod interp;
mod merge;
mod names;
mod repo;
mod resolve;
mod runtime;
mod unit;
mod value;

pub use activation::{Activation, Frame};
pub use cache::{CacheContents, IncludeBit, Slot, SlotId, SlotLayout};
pub use class::{Avail, Class, ClassAttrs, ClassChain, ClassTemplate, Hoistable};
pub use emitter::{ClassDecl, DeclContext, UnitEmitter};
pub use error::{MergeError, MergeErrorKind, RepoError, Warning};
pub use func::{Func, FuncAttrs, FuncTemplate};
pub use interp::TopLevelInterpreter;
pub use merge::MergeStatus;
pub use names::{Directory, NamedEntity};
pub use repo::{BlobStore, DirBlobStore, MemoryBlobStore};
pub use resolve::{PathResolver, UnitRegistry, normalize};
pub use runtime::{Autoloader, Engine, Runtime, RuntimeCreateInfo, UnitLoader};
pub use unit::{Digest, IncludeKind, MergeInstr, MergeState, Mergeable, Unit};
pub use value::Value;
