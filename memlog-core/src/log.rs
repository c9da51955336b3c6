//! The in-memory event log.
//!
//! [`EventLog`] is an append-only journal of [`StoredEvent`]s with a cached
//! projection per namespace. It is the single source of truth for the
//! repositories, transactions and subscriptions built on top of it.
//!
//! ```
//! use memlog_core::{context::Context, event::Change, log::EventLog};
//!
//! # block_on(async {
//! let log = EventLog::new();
//! let ctx = Context::background();
//! log.append(&ctx, Change::DeletedAll { namespace: "note".into() }).await.unwrap();
//! assert_eq!(log.events().len(), 1);
//! # });
//! # fn block_on<F: std::future::Future>(f: F) -> F::Output {
//! #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f)
//! # }
//! ```

pub mod compaction;
pub(crate) mod projection;

use std::{
    collections::HashSet,
    sync::{
        Arc, RwLock, RwLockReadGuard, RwLockWriteGuard,
        atomic::{AtomicU64, Ordering},
    },
};

use nonempty::NonEmpty;

use self::{
    compaction::CompactionStats,
    projection::{NamespaceView, Projection, key_of},
};
use crate::{
    context::Context,
    entity::MakeId,
    error::{Error, Result},
    event::{Change, StoredEvent, Trace, TxId},
    meta::Metadata,
    subscription::{Hub, Registration},
    tx::{TxFrame, TxInfo},
};

static NEXT_LOG_ID: AtomicU64 = AtomicU64::new(1);

/// Default capacity of each subscriber's delivery queue.
pub const DEFAULT_SUBSCRIBER_BUFFER_SIZE: usize = 64;

/// Event log configuration.
#[derive(Debug, Clone)]
pub struct Options {
    /// Deliver events to subscribers on the producer's task and wait for the
    /// handlers before returning.
    pub disable_async_subscription_handling: bool,
    /// Capacity of each subscriber's queue in asynchronous mode.
    pub subscriber_buffer_size: usize,
    /// Generator for entities created without an ID.
    pub make_id: MakeId,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            disable_async_subscription_handling: false,
            subscriber_buffer_size: DEFAULT_SUBSCRIBER_BUFFER_SIZE,
            make_id: MakeId::default(),
        }
    }
}

/// Builder for [`EventLog`].
#[derive(Debug, Default)]
pub struct EventLogBuilder {
    options: Options,
    compress: Vec<String>,
}

impl EventLogBuilder {
    #[must_use]
    pub const fn disable_async_subscription_handling(mut self, disable: bool) -> Self {
        self.options.disable_async_subscription_handling = disable;
        self
    }

    /// Sets the per-subscriber queue capacity. Values below one are raised
    /// to one.
    #[must_use]
    pub fn subscriber_buffer_size(mut self, size: usize) -> Self {
        self.options.subscriber_buffer_size = size.max(1);
        self
    }

    #[must_use]
    pub fn make_id(mut self, make_id: MakeId) -> Self {
        self.options.make_id = make_id;
        self
    }

    /// Compacts `namespace` after every root publication that touches it.
    #[must_use]
    pub fn compress_event_log(mut self, namespace: impl Into<String>) -> Self {
        self.compress.push(namespace.into());
        self
    }

    #[must_use]
    pub fn build(self) -> EventLog {
        let log = EventLog::with_options(self.options);
        for namespace in self.compress {
            log.compress_event_log(namespace);
        }
        log
    }
}

/// Where an appended event ended up.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Appended {
    /// Recorded in the root log under `seq` and offered to subscribers.
    Published { seq: u64 },
    /// Staged in transaction `tx`; published when the root transaction
    /// commits.
    Staged { tx: TxId },
}

/// An event waiting for a sequence number.
#[derive(Debug, Clone)]
pub(crate) struct Pending {
    pub(crate) tx: Option<TxId>,
    pub(crate) metadata: Metadata,
    pub(crate) trace: Trace,
    pub(crate) change: Change,
}

impl Pending {
    pub(crate) fn new(ctx: &Context, change: Change, trace: Trace) -> Self {
        Self {
            tx: None,
            metadata: ctx.metadata().clone(),
            trace,
            change,
        }
    }
}

pub(crate) struct Inner {
    pub(crate) events: Vec<StoredEvent>,
    pub(crate) next_seq: u64,
    pub(crate) projection: Projection,
    pub(crate) compress: HashSet<String>,
    /// Root transactions neither committed nor rolled back.
    pub(crate) active_roots: usize,
    pub(crate) subscribers: Vec<Arc<Registration>>,
}

impl Inner {
    pub(crate) const fn last_seq(&self) -> u64 {
        self.next_seq - 1
    }

    /// Events of `namespace` replayed up to and including `watermark`.
    fn view_at(&self, namespace: &str, watermark: u64) -> NamespaceView {
        if watermark >= self.last_seq() {
            return self.projection.snapshot(namespace);
        }
        let mut view = NamespaceView::default();
        for event in self.events.iter().take_while(|event| event.seq <= watermark) {
            if event.namespace() == Some(namespace) {
                view.apply(&event.change);
            }
        }
        view
    }
}

pub(crate) struct Shared {
    pub(crate) id: u64,
    pub(crate) options: Options,
    inner: RwLock<Inner>,
    pub(crate) hub: Hub,
    next_tx: AtomicU64,
}

impl Shared {
    pub(crate) fn read(&self) -> RwLockReadGuard<'_, Inner> {
        self.inner.read().expect("event log lock poisoned")
    }

    pub(crate) fn write(&self) -> RwLockWriteGuard<'_, Inner> {
        self.inner.write().expect("event log lock poisoned")
    }

    pub(crate) fn next_tx_id(&self) -> TxId {
        TxId::new(self.next_tx.fetch_add(1, Ordering::Relaxed))
    }

    pub(crate) fn view_at(&self, namespace: &str, watermark: u64) -> NamespaceView {
        self.read().view_at(namespace, watermark)
    }

    /// Assigns sequence numbers to `batch`, applies it to the projection and
    /// hands the offered events to the hub. Compresses touched namespaces
    /// while no root transaction is active.
    pub(crate) fn publish(&self, inner: &mut Inner, batch: NonEmpty<Pending>, offer: bool) -> u64 {
        let mut published = Vec::with_capacity(batch.len());
        let mut touched = HashSet::new();
        let mut last = 0;

        for pending in batch {
            let seq = inner.next_seq;
            inner.next_seq = seq.checked_add(1).expect("event log sequence overflow");
            last = seq;

            if let Some(namespace) = pending.change.namespace() {
                touched.insert(namespace.to_owned());
            }
            inner.projection.apply(&pending.change);
            let event = StoredEvent {
                seq,
                tx: pending.tx,
                metadata: pending.metadata,
                trace: pending.trace,
                change: pending.change,
            };
            if offer {
                published.push(Arc::new(event.clone()));
            }
            inner.events.push(event);
        }
        tracing::debug!(last_seq = last, event_count = published.len(), offer, "events published");

        if let Some(events) = NonEmpty::from_vec(published) {
            self.hub.offer(&inner.subscribers, events);
        }

        if inner.active_roots == 0 {
            for namespace in touched {
                if inner.compress.contains(&namespace) {
                    compaction::compact(inner, &namespace);
                }
            }
        }
        last
    }
}

/// In-memory, append-only event log.
///
/// Cloning an `EventLog` yields another handle to the same log.
#[derive(Clone)]
pub struct EventLog {
    pub(crate) shared: Arc<Shared>,
}

impl EventLog {
    #[must_use]
    pub fn new() -> Self {
        Self::with_options(Options::default())
    }

    #[must_use]
    pub fn builder() -> EventLogBuilder {
        EventLogBuilder::default()
    }

    #[must_use]
    pub fn with_options(options: Options) -> Self {
        let hub = Hub::new(
            options.disable_async_subscription_handling,
            options.subscriber_buffer_size.max(1),
        );
        Self {
            shared: Arc::new(Shared {
                id: NEXT_LOG_ID.fetch_add(1, Ordering::Relaxed),
                options,
                inner: RwLock::new(Inner {
                    events: Vec::new(),
                    next_seq: 1,
                    projection: Projection::default(),
                    compress: HashSet::new(),
                    active_roots: 0,
                    subscribers: Vec::new(),
                }),
                hub,
                next_tx: AtomicU64::new(1),
            }),
        }
    }

    #[must_use]
    pub fn options(&self) -> &Options {
        &self.shared.options
    }

    /// Appends `change`.
    ///
    /// At the root the event is numbered, recorded and offered to
    /// subscribers. Inside a transaction it is staged on the innermost frame.
    /// `Created` requires an absent ID, `Updated` and `DeletedById` a live
    /// one.
    ///
    /// # Errors
    ///
    /// - [`Error::Cancelled`] if the context is cancelled.
    /// - [`Error::TxDone`] if the context's transaction is finished.
    /// - [`Error::AlreadyExists`] / [`Error::NotFound`] when the change does
    ///   not apply to the current view.
    /// - [`Error::Validation`] for transaction markers, which only the
    ///   transaction manager may emit.
    #[track_caller]
    pub fn append<'a>(
        &'a self,
        ctx: &'a Context,
        change: Change,
    ) -> impl Future<Output = Result<Appended>> + Send + 'a {
        let trace = Trace::capture();
        self.append_traced(ctx, change, trace)
    }

    #[tracing::instrument(
        skip(self, ctx, change, trace),
        fields(kind = %change.kind(), namespace = change.namespace())
    )]
    pub(crate) async fn append_traced(
        &self,
        ctx: &Context,
        change: Change,
        trace: Trace,
    ) -> Result<Appended> {
        ctx.check()?;
        if change.kind().is_tx_marker() {
            return Err(Error::validation(
                "transaction markers are emitted by the transaction manager",
            ));
        }
        let pending = Pending::new(ctx, change, trace);

        if let Some(frame) = ctx.tx_frame(self.shared.id) {
            let tx = frame.stage(ctx, pending)?;
            tracing::trace!(%tx, "event staged");
            return Ok(Appended::Staged { tx });
        }

        let seq = {
            let mut inner = self.shared.write();
            if let Some(namespace) = pending.change.namespace() {
                match inner.projection.namespace(namespace) {
                    Some(view) => view.check(&pending.change)?,
                    None => NamespaceView::default().check(&pending.change)?,
                }
            }
            ctx.check()?;
            self.shared
                .publish(&mut inner, NonEmpty::singleton(pending), true)
        };
        self.shared.hub.settle().await;
        Ok(Appended::Published { seq })
    }

    /// Live entities of `namespace` as `(id, entity)` pairs in creation
    /// order, as seen from the context's transaction.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] or [`Error::TxDone`].
    pub fn view(
        &self,
        ctx: &Context,
        namespace: &str,
    ) -> Result<Vec<(serde_json::Value, serde_json::Value)>> {
        Ok(self.namespace_view(ctx, namespace)?.into_ordered())
    }

    pub(crate) fn namespace_view(&self, ctx: &Context, namespace: &str) -> Result<NamespaceView> {
        ctx.check()?;
        match ctx.tx_frame(self.shared.id) {
            Some(frame) => frame.view(namespace),
            None => Ok(self.shared.read().projection.snapshot(namespace)),
        }
    }

    /// Looks up one entity by its JSON-encoded ID.
    pub(crate) fn lookup(
        &self,
        ctx: &Context,
        namespace: &str,
        id: &serde_json::Value,
    ) -> Result<Option<serde_json::Value>> {
        ctx.check()?;
        let key = key_of(id);
        match ctx.tx_frame(self.shared.id) {
            Some(frame) => Ok(frame.view(namespace)?.get(&key).cloned()),
            None => Ok(self
                .shared
                .read()
                .projection
                .namespace(namespace)
                .and_then(|view| view.get(&key))
                .cloned()),
        }
    }

    /// The innermost transaction of this log carried by `ctx`, while it is
    /// still active.
    #[must_use]
    pub fn lookup_tx(&self, ctx: &Context) -> Option<TxInfo> {
        ctx.tx_frame(self.shared.id).and_then(|frame| frame.info())
    }

    /// Copy of every recorded event in sequence order.
    #[must_use]
    pub fn events(&self) -> Vec<StoredEvent> {
        self.shared.read().events.clone()
    }

    /// Enables compaction of `namespace` after every root publication that
    /// touches it, compacting right away when possible.
    pub fn compress_event_log(&self, namespace: impl Into<String>) {
        let namespace = namespace.into();
        let mut inner = self.shared.write();
        if inner.active_roots == 0 {
            compaction::compact(&mut inner, &namespace);
        }
        inner.compress.insert(namespace);
    }

    /// Compacts `namespace` now.
    ///
    /// Compaction never changes what any view returns. While a root
    /// transaction is active the log is left untouched and the returned
    /// statistics are all zero.
    pub fn compact(&self, namespace: &str) -> CompactionStats {
        let mut inner = self.shared.write();
        if inner.active_roots > 0 {
            tracing::debug!(namespace, "compaction skipped: transactions active");
            return CompactionStats {
                namespace: namespace.to_owned(),
                removed: 0,
                retained: 0,
            };
        }
        compaction::compact(&mut inner, namespace)
    }

    pub(crate) fn frame(&self, ctx: &Context) -> Option<Arc<TxFrame>> {
        ctx.tx_frame(self.shared.id).cloned()
    }
}

impl Default for EventLog {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EventLog {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.shared.read();
        f.debug_struct("EventLog")
            .field("id", &self.shared.id)
            .field("events", &inner.events.len())
            .field("subscribers", &inner.subscribers.len())
            .finish_non_exhaustive()
    }
}
