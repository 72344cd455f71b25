//! Error taxonomy of the filesystem layer.

use std::sync::Arc;
use xsp_core::{CryptoError, StorageError, StorageType};

/// Crate-wide result alias.
pub type FsResult<T> = Result<T, FsError>;

/// Errors surfaced by nodes and the [`XspFs`](crate::XspFs) facade.
///
/// `Clone` so a failed single-flight instantiation can hand the same error to
/// every waiter. Node-level errors carry the node name or object id in
/// `path`; the facade swaps in the caller's path with [`FsError::at_path`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum FsError {
    #[error("not found: {path}")]
    NotFound { path: String },
    #[error("not a file: {path}")]
    NotFile { path: String },
    #[error("not a directory: {path}")]
    NotDirectory { path: String },
    #[error("not a link: {path}")]
    NotLink { path: String },
    #[error("already exists: {path}")]
    AlreadyExists { path: String },
    #[error("directory not empty: {path}")]
    NotEmpty { path: String },
    #[error("concurrent update in progress: {path}")]
    ConcurrentUpdate { path: String },
    #[error("cannot parse {path}: {message}")]
    Parsing { path: String, message: String },
    #[error("inconsistent state of fs at {path}: {message}")]
    InconsistentStateOfFS { path: String, message: String },
    #[error("not writable: {path}")]
    NotWritable { path: String },
    #[error("invalid path {path}: {message}")]
    InvalidPath { path: String, message: String },
    #[error("link from {from} storage to {to} storage is not allowed")]
    LinkNotAllowed { from: StorageType, to: StorageType },
    #[error(transparent)]
    Crypto(#[from] CryptoError),
    #[error("storage error: {0}")]
    Storage(Arc<StorageError>),
}

impl FsError {
    pub fn not_found(path: impl Into<String>) -> Self {
        FsError::NotFound { path: path.into() }
    }

    pub fn not_file(path: impl Into<String>) -> Self {
        FsError::NotFile { path: path.into() }
    }

    pub fn not_directory(path: impl Into<String>) -> Self {
        FsError::NotDirectory { path: path.into() }
    }

    pub fn not_link(path: impl Into<String>) -> Self {
        FsError::NotLink { path: path.into() }
    }

    pub fn already_exists(path: impl Into<String>) -> Self {
        FsError::AlreadyExists { path: path.into() }
    }

    pub fn not_writable(path: impl Into<String>) -> Self {
        FsError::NotWritable { path: path.into() }
    }

    pub fn parsing(path: impl Into<String>, message: impl ToString) -> Self {
        FsError::Parsing {
            path: path.into(),
            message: message.to_string(),
        }
    }

    pub fn inconsistent(path: impl Into<String>, message: impl Into<String>) -> Self {
        FsError::InconsistentStateOfFS {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn invalid_path(path: impl Into<String>, message: impl Into<String>) -> Self {
        FsError::InvalidPath {
            path: path.into(),
            message: message.into(),
        }
    }

    /// Replaces node-level context with the path the caller asked for.
    pub fn at_path(self, path: &str) -> Self {
        let path = path.to_string();
        match self {
            FsError::NotFound { .. } => FsError::NotFound { path },
            FsError::NotFile { .. } => FsError::NotFile { path },
            FsError::NotDirectory { .. } => FsError::NotDirectory { path },
            FsError::NotLink { .. } => FsError::NotLink { path },
            FsError::AlreadyExists { .. } => FsError::AlreadyExists { path },
            FsError::NotEmpty { .. } => FsError::NotEmpty { path },
            FsError::ConcurrentUpdate { .. } => FsError::ConcurrentUpdate { path },
            FsError::NotWritable { .. } => FsError::NotWritable { path },
            FsError::Parsing { message, .. } => FsError::Parsing { path, message },
            FsError::InconsistentStateOfFS { message, .. } => {
                FsError::InconsistentStateOfFS { path, message }
            }
            FsError::InvalidPath { message, .. } => FsError::InvalidPath { path, message },
            other => other,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, FsError::NotFound { .. })
    }

    pub fn is_already_exists(&self) -> bool {
        matches!(self, FsError::AlreadyExists { .. })
    }
}

/// Backend errors are translated at the node boundary.
impl From<StorageError> for FsError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::ObjNotFound(id) => FsError::NotFound {
                path: id.to_string(),
            },
            StorageError::ObjExists(id) => FsError::AlreadyExists {
                path: id.to_string(),
            },
            StorageError::ConcurrentTransaction(id) => FsError::ConcurrentUpdate {
                path: id.to_string(),
            },
            other => FsError::Storage(Arc::new(other)),
        }
    }
}
