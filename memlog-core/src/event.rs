//! Events recorded by the [`EventLog`](crate::log::EventLog).
//!
//! A [`StoredEvent`] wraps a [`Change`] with the bookkeeping every event
//! carries: its sequence number, the transaction that produced it, the
//! metadata snapshot and the call site that emitted it.

use std::{fmt, panic::Location};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{error::Result, meta::Metadata};

/// Identifier of a transaction, unique within one event log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TxId(u64);

impl TxId {
    #[must_use]
    pub const fn new(value: u64) -> Self {
        Self(value)
    }

    #[must_use]
    pub const fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "tx-{}", self.0)
    }
}

/// Discriminant of a [`Change`], used for subscription filtering.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum EventKind {
    Created,
    Updated,
    DeletedById,
    DeletedAll,
    TxBegin,
    TxCommit,
    TxRollback,
}

impl EventKind {
    pub const ALL: [Self; 7] = [
        Self::Created,
        Self::Updated,
        Self::DeletedById,
        Self::DeletedAll,
        Self::TxBegin,
        Self::TxCommit,
        Self::TxRollback,
    ];

    /// Entity-level kinds, excluding transaction markers.
    pub const ENTITY: [Self; 4] = [
        Self::Created,
        Self::Updated,
        Self::DeletedById,
        Self::DeletedAll,
    ];

    #[must_use]
    pub const fn is_tx_marker(self) -> bool {
        matches!(self, Self::TxBegin | Self::TxCommit | Self::TxRollback)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Created => "created",
            Self::Updated => "updated",
            Self::DeletedById => "deleted-by-id",
            Self::DeletedAll => "deleted-all",
            Self::TxBegin => "tx-begin",
            Self::TxCommit => "tx-commit",
            Self::TxRollback => "tx-rollback",
        };
        f.write_str(name)
    }
}

/// The payload of an event.
///
/// Entity IDs and entities are stored as JSON values so one log can hold any
/// number of entity types.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum Change {
    Created {
        namespace: String,
        id: serde_json::Value,
        entity: serde_json::Value,
    },
    Updated {
        namespace: String,
        id: serde_json::Value,
        entity: serde_json::Value,
    },
    DeletedById {
        namespace: String,
        id: serde_json::Value,
    },
    DeletedAll {
        namespace: String,
    },
    TxBegin {
        tx: TxId,
    },
    TxCommit {
        tx: TxId,
    },
    TxRollback {
        tx: TxId,
    },
}

impl Change {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        match self {
            Self::Created { .. } => EventKind::Created,
            Self::Updated { .. } => EventKind::Updated,
            Self::DeletedById { .. } => EventKind::DeletedById,
            Self::DeletedAll { .. } => EventKind::DeletedAll,
            Self::TxBegin { .. } => EventKind::TxBegin,
            Self::TxCommit { .. } => EventKind::TxCommit,
            Self::TxRollback { .. } => EventKind::TxRollback,
        }
    }

    /// Namespace of an entity-level change; `None` for transaction markers.
    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        match self {
            Self::Created { namespace, .. }
            | Self::Updated { namespace, .. }
            | Self::DeletedById { namespace, .. }
            | Self::DeletedAll { namespace } => Some(namespace),
            Self::TxBegin { .. } | Self::TxCommit { .. } | Self::TxRollback { .. } => None,
        }
    }

    /// Entity ID of a change that targets one entity.
    #[must_use]
    pub const fn id(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Created { id, .. } | Self::Updated { id, .. } | Self::DeletedById { id, .. } => {
                Some(id)
            }
            _ => None,
        }
    }

    /// Entity payload of a `Created` or `Updated` change.
    #[must_use]
    pub const fn entity(&self) -> Option<&serde_json::Value> {
        match self {
            Self::Created { entity, .. } | Self::Updated { entity, .. } => Some(entity),
            _ => None,
        }
    }
}

/// Call site of the public operation that emitted an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Trace {
    pub file: &'static str,
    pub line: u32,
    pub column: u32,
}

impl Trace {
    #[track_caller]
    #[must_use]
    pub fn capture() -> Self {
        Location::caller().into()
    }
}

impl From<&'static Location<'static>> for Trace {
    fn from(location: &'static Location<'static>) -> Self {
        Self {
            file: location.file(),
            line: location.line(),
            column: location.column(),
        }
    }
}

impl fmt::Display for Trace {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}:{}", self.file, self.line, self.column)
    }
}

/// An event as recorded in the log.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StoredEvent {
    /// Position in the root log. Staged events are renumbered on publication.
    ///
    /// Compaction renumbers the whole log densely, so a sequence number only
    /// identifies an event between two compactions. A subscriber can see the
    /// same number again once the log it was taken from has been compacted.
    pub seq: u64,
    /// Transaction that produced the event, `None` when applied at the root.
    pub tx: Option<TxId>,
    pub metadata: Metadata,
    pub trace: Trace,
    pub change: Change,
}

impl StoredEvent {
    #[must_use]
    pub const fn kind(&self) -> EventKind {
        self.change.kind()
    }

    #[must_use]
    pub fn namespace(&self) -> Option<&str> {
        self.change.namespace()
    }

    /// Decodes the entity carried by a `Created` or `Updated` event.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`](crate::Error::Validation) when the payload does
    /// not decode as `E`.
    pub fn entity<E: DeserializeOwned>(&self) -> Result<Option<E>> {
        self.change
            .entity()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }

    /// Decodes the entity ID carried by the event.
    ///
    /// # Errors
    ///
    /// [`Error::Validation`](crate::Error::Validation) when the ID does not
    /// decode as `Id`.
    pub fn id<Id: DeserializeOwned>(&self) -> Result<Option<Id>> {
        self.change
            .id()
            .map(|value| serde_json::from_value(value.clone()))
            .transpose()
            .map_err(Into::into)
    }
}
