//! Crate-wide error taxonomy.

use thiserror::Error;

use crate::client::ClientError;
use crate::store::StoreError;

#[derive(Debug, Clone, Error)]
pub enum MatchingError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Client(#[from] ClientError),

    /// Returned to a child partition whose forwarded task could not be
    /// sync-matched here. The child is expected to persist the task.
    #[error("remote sync match failed")]
    RemoteSyncMatchFailed,

    /// User data mutations are only accepted on the root workflow
    /// partition of a normal queue.
    #[error("user data can only be modified on the root workflow partition")]
    UserDataNoMutateNonRoot,

    #[error("namespace not found: {0}")]
    NamespaceNotFound(String),

    /// The manager has been stopped (shutdown, or the lease was lost).
    #[error("queue manager is closed")]
    QueueClosed,

    #[error("operation cancelled")]
    Cancelled,

    #[error("internal: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, MatchingError>;
