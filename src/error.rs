use std::io;

use thiserror::Error;

use crate::types::LockId;

/// Result type for pool and registry operations.
pub type Result<T> = std::result::Result<T, PoolError>;

/// Failures reported by the scheduler. None of them leave the pool unusable.
#[derive(Debug, Error)]
pub enum PoolError {
    /// A pool with this name is already tracked.
    #[error("{name} is already open")]
    AlreadyOpen {
        /// Database name.
        name: String,
    },
    /// No pool with this name is tracked.
    #[error("{name} is not open")]
    NotOpen {
        /// Database name.
        name: String,
    },
    /// The lock id owns no slot (never activated, or already released).
    #[error("context {lock} is no longer available")]
    ContextUnavailable {
        /// The offending lock id.
        lock: LockId,
    },
    /// Attach/detach was attempted while a slot was owned.
    #[error("{name} was unable to change attached databases: Some DB connections were locked")]
    SomeConnectionsLocked {
        /// Database name.
        name: String,
    },
    /// An ATTACH statement failed on one of the handles.
    #[error("{name} was unable to attach another database: {reason}")]
    AttachFailed {
        /// Database name.
        name: String,
        /// Message reported by SQLite.
        reason: String,
    },
    /// A DETACH statement failed on one of the handles.
    #[error("{name} was unable to detach another database: {reason}")]
    DetachFailed {
        /// Database name.
        name: String,
        /// Message reported by SQLite.
        reason: String,
    },
    /// Attach/detach was called from inside one of the pool's own workers,
    /// where waiting on the handles would never finish.
    #[error("{name} cannot change attached databases from one of its own connection workers")]
    CalledFromWorker {
        /// Database name.
        name: String,
    },
    /// An update listener is already installed on the write handle.
    #[error("{name} already has an update listener")]
    UpdateListenerAlreadySet {
        /// Database name.
        name: String,
    },
    /// The pool has been torn down.
    #[error("{name} has been closed")]
    Closed {
        /// Database name.
        name: String,
    },
    /// Opening a connection failed.
    #[error("failed to open {name}: {source}")]
    Open {
        /// Database name.
        name: String,
        /// Underlying SQLite error.
        source: rusqlite::Error,
    },
    /// File-system error.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl PoolError {
    pub(crate) fn not_open(name: impl Into<String>) -> Self {
        PoolError::NotOpen { name: name.into() }
    }

    pub(crate) fn closed(name: impl Into<String>) -> Self {
        PoolError::Closed { name: name.into() }
    }
}
