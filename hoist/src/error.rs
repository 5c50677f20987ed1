use std::fmt;
use std::io;
use std::sync::Arc;

use crate::activation::Frame;
use crate::unit::Digest;

/// What went wrong while defining, merging or running a unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeErrorKind {
    /// A different class or function is already bound to `name`.
    DeclarationConflict { what: &'static str, name: Arc<str> },
    /// `class` names a parent or interface that could not be found, even
    /// after autoloading.
    UnresolvedParent { class: Arc<str>, parent: Arc<str> },
    /// No unit could be loaded for an include target.
    UnresolvedInclude { name: Arc<str> },
    /// The top-level code raised a fatal error.
    Fatal { message: Arc<str>, line: Option<u32> },
    /// Failure reported by an injected collaborator.
    Engine(String),
}

/// A fatal merge failure, with the diagnostic frames active when it was
/// raised (innermost last).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeError {
    pub kind: MergeErrorKind,
    pub backtrace: Vec<Frame>,
}

impl MergeError {
    pub fn new(kind: MergeErrorKind) -> Self {
        Self {
            kind,
            backtrace: Vec::new(),
        }
    }

    pub fn class_conflict(name: &Arc<str>) -> Self {
        Self::new(MergeErrorKind::DeclarationConflict {
            what: "class",
            name: name.clone(),
        })
    }

    pub fn function_conflict(name: &Arc<str>) -> Self {
        Self::new(MergeErrorKind::DeclarationConflict {
            what: "function",
            name: name.clone(),
        })
    }

    pub fn unresolved_parent(class: &Arc<str>, parent: &Arc<str>) -> Self {
        Self::new(MergeErrorKind::UnresolvedParent {
            class: class.clone(),
            parent: parent.clone(),
        })
    }

    pub fn engine(msg: impl Into<String>) -> Self {
        Self::new(MergeErrorKind::Engine(msg.into()))
    }

    pub(crate) fn with_backtrace(mut self, frames: &[Frame]) -> Self {
        if self.backtrace.is_empty() {
            self.backtrace = frames.to_vec();
        }
        self
    }

    pub fn is_declaration_conflict(&self) -> bool {
        matches!(self.kind, MergeErrorKind::DeclarationConflict { .. })
    }
}

impl fmt::Display for MergeError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.kind {
            MergeErrorKind::DeclarationConflict { what: "class", name } => {
                write!(f, "Class already declared: {name}")?
            }
            MergeErrorKind::DeclarationConflict { what, name } => {
                write!(f, "Cannot redeclare {what} {name}")?
            }
            MergeErrorKind::UnresolvedParent { parent, .. } => {
                write!(f, "unknown class {parent}")?
            }
            MergeErrorKind::UnresolvedInclude { name } => {
                write!(f, "failed to open required unit '{name}'")?
            }
            MergeErrorKind::Fatal {
                message,
                line: Some(line),
            } => write!(f, "{message} on line {line}")?,
            MergeErrorKind::Fatal { message, line: None } => write!(f, "{message}")?,
            MergeErrorKind::Engine(msg) => write!(f, "{msg}")?,
        }
        if let Some(frame) = self.backtrace.last() {
            write!(f, " (in {frame})")?;
        }
        Ok(())
    }
}

impl std::error::Error for MergeError {}

/// Failures reading or writing the persistent unit cache.
#[derive(Debug)]
pub enum RepoError {
    Io(io::Error),
    Corrupt { table: &'static str, reason: String },
    DigestMismatch { expected: Digest, found: Digest },
}

impl RepoError {
    pub(crate) fn corrupt(table: &'static str, reason: impl Into<String>) -> Self {
        RepoError::Corrupt {
            table,
            reason: reason.into(),
        }
    }
}

impl fmt::Display for RepoError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RepoError::Io(err) => write!(f, "repo i/o error: {err}"),
            RepoError::Corrupt { table, reason } => {
                write!(f, "corrupt {table} table: {reason}")
            }
            RepoError::DigestMismatch { expected, found } => {
                write!(f, "digest mismatch: expected {expected}, found {found}")
            }
        }
    }
}

impl std::error::Error for RepoError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            RepoError::Io(err) => Some(err),
            _ => None,
        }
    }
}

impl From<io::Error> for RepoError {
    fn from(err: io::Error) -> Self {
        RepoError::Io(err)
    }
}

/// Non-fatal diagnostics recorded on an activation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Warning {
    ConstantRedefined { name: Arc<str> },
    GlobalRedefined { name: Arc<str> },
}

impl fmt::Display for Warning {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Warning::ConstantRedefined { name } => {
                write!(f, "Constant {name} already defined")
            }
            Warning::GlobalRedefined { name } => {
                write!(f, "Global {name} already assigned")
            }
        }
    }
}
