use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Failure from the file backend collaborator (open/read/write/rename/...).
#[derive(Debug, Clone, Error)]
pub enum BackendError {
    #[error("I/O error: {0}")]
    Io(Arc<std::io::Error>),
    #[error("operation not supported by this backend: {0}")]
    NotSupported(String),
}

impl BackendError {
    /// True when the failure means "the path does not exist", as opposed to
    /// a permission, disk, or other I/O failure. The reader branches on
    /// exactly this distinction.
    pub fn is_not_found(&self) -> bool {
        matches!(self, BackendError::Io(e) if e.kind() == std::io::ErrorKind::NotFound)
    }
}

impl From<std::io::Error> for BackendError {
    fn from(e: std::io::Error) -> Self {
        BackendError::Io(Arc::new(e))
    }
}

/// Signalled by a [`crate::Serializer`] when the bytes it was asked to
/// decode cannot be interpreted as a valid value. Distinct from an I/O
/// failure: corruption is recoverable via a [`crate::CorruptionHandler`],
/// I/O failures are not.
#[derive(Debug, Clone, Error)]
#[error("content is corrupt: {0}")]
pub struct CodecError(pub String);

impl CodecError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The full error taxonomy this crate surfaces. `Clone` so the single error
/// that closes a broadcast slot can be handed to every observer attached at
/// the moment of failure without further indirection.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error(transparent)]
    Io(#[from] BackendError),

    #[error("rename {scratch:?} -> {target:?} failed, possibly due to another engine instance writing the same file")]
    RenameConflict {
        scratch: PathBuf,
        target: PathBuf,
        #[source]
        source: BackendError,
    },

    #[error("value is corrupt and could not be recovered: {decode}")]
    Corruption {
        decode: CodecError,
        /// Set when the corruption handler's replacement value itself
        /// failed to persist; the original corruption is still primary.
        recovery_write: Option<Box<StoreError>>,
    },

    #[error("cached value's fingerprint no longer matches its content; it was mutated after being handed out")]
    MutationDetected,

    #[error("initialization capability used after its task list already completed")]
    InitAfterComplete,

    #[error("the store was closed")]
    Closed,
}

/// Error surfaced through the `ack` of an [`crate::Store::update`] call.
#[derive(Debug, Error)]
pub enum UpdateError {
    #[error(transparent)]
    Store(#[from] StoreError),
    #[error("transform failed: {0}")]
    Transform(#[source] anyhow::Error),
}
