#![doc = include_str!("../README.md")]

#[cfg(feature = "test-util")]
pub use memlog_core::test;
pub use memlog_core::{
    context,
    context::{CancelHandle, Context},
    crud,
    crud::Crud,
    cursor,
    cursor::Cursor,
    entity,
    entity::{Entity, EntityId, IdAccessor, IdField, MakeId},
    error,
    error::{BoxError, Error, ErrorKind, HandlerFailure, Result},
    event,
    event::{Change, EventKind, StoredEvent, Trace, TxId},
    log,
    log::{Appended, EventLog, EventLogBuilder, Options, compaction::CompactionStats},
    meta,
    meta::{MetaKey, Metadata, lookup_meta, set_meta},
    repository,
    repository::Repository,
    subscription,
    subscription::{EventStream, Subscriber, Subscription},
    tx,
    tx::{TxGuard, TxInfo, TxManager},
};
// Re-export the derive so consumers only depend on `memlog`.
pub use memlog_macros::Entity;
