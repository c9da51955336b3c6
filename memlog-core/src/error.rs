//! Typed, classifiable errors returned by every fallible operation.
//!
//! Callers branch on [`Error::kind`] rather than matching display strings.
//! [`Error::Validation`] and [`Error::Internal`] wrap a cause that is reachable
//! through [`std::error::Error::source`].

use thiserror::Error;

use crate::event::TxId;

/// Boxed error used for wrapped causes and subscriber handler failures.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// Convenience alias used throughout the crate.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the event log, transactions and repositories.
#[derive(Debug, Error)]
pub enum Error {
    /// The entity is not live in the namespace.
    #[error("entity {id} not found in namespace `{namespace}`")]
    NotFound { namespace: String, id: String },
    /// An entity with the same ID is already live in the namespace.
    #[error("entity {id} already exists in namespace `{namespace}`")]
    AlreadyExists { namespace: String, id: String },
    /// The operation needs an entity ID but none was present.
    #[error("entity ID is required for this operation in namespace `{namespace}`")]
    IdRequired { namespace: String },
    /// The transaction was already committed or rolled back.
    #[error("transaction {tx} is already done")]
    TxDone { tx: TxId },
    /// Staged events no longer apply to the state they are committed onto.
    #[error("transaction {tx} conflicts with a concurrent change: {reason}")]
    TxConflict { tx: TxId, reason: String },
    /// The context was cancelled or its deadline passed.
    #[error("context cancelled")]
    Cancelled,
    /// A value could not be encoded, decoded or otherwise failed validation.
    #[error("validation failed: {0}")]
    Validation(#[source] BoxError),
    /// An internal consistency check failed.
    #[error("internal error: {0}")]
    Internal(#[source] BoxError),
}

/// Classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    IdRequired,
    TxDone,
    TxConflict,
    Cancelled,
    Validation,
    Internal,
}

impl Error {
    /// Returns the classification of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        match self {
            Self::NotFound { .. } => ErrorKind::NotFound,
            Self::AlreadyExists { .. } => ErrorKind::AlreadyExists,
            Self::IdRequired { .. } => ErrorKind::IdRequired,
            Self::TxDone { .. } => ErrorKind::TxDone,
            Self::TxConflict { .. } => ErrorKind::TxConflict,
            Self::Cancelled => ErrorKind::Cancelled,
            Self::Validation(_) => ErrorKind::Validation,
            Self::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Returns `true` when the error has the given kind.
    #[must_use]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind() == kind
    }

    pub(crate) fn validation(source: impl Into<BoxError>) -> Self {
        Self::Validation(source.into())
    }

    pub(crate) fn internal(source: impl Into<BoxError>) -> Self {
        Self::Internal(source.into())
    }
}

impl From<serde_json::Error> for Error {
    fn from(error: serde_json::Error) -> Self {
        Self::Validation(Box::new(error))
    }
}

/// Failure reported by a subscription handler.
///
/// Handler failures never reach the producer. They are logged and, when the
/// subscriber registered one, sent to its error channel.
#[derive(Debug, Error)]
#[error("handler for event {seq} ({kind}) failed: {source}")]
pub struct HandlerFailure {
    /// Sequence number of the event being delivered, as numbered at
    /// delivery time. Numbers are reused after a compaction.
    pub seq: u64,
    /// Kind of the event being delivered.
    pub kind: crate::event::EventKind,
    #[source]
    pub source: BoxError,
}
