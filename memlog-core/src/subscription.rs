//! Push-based event subscriptions.
//!
//! Subscribers register callbacks per event kind with a [`Subscriber`]
//! builder and receive every matching event published after registration.
//! Staged transaction events are only delivered once the root transaction
//! commits; rolled-back work is never delivered.
//!
//! # Delivery modes
//!
//! - **Asynchronous** (default): publications are handed to a dispatcher
//!   task that pushes each event into the bounded queue of every interested
//!   subscription. A worker task per subscription invokes its handlers one at
//!   a time. A full queue blocks the dispatcher, so slow subscribers apply
//!   backpressure instead of losing events; producers never wait for
//!   handlers.
//! - **Synchronous** ([`EventLogBuilder::disable_async_subscription_handling`]):
//!   the producer delivers pending publications itself, in publication
//!   order, and returns once every interested handler has returned.
//!
//! # Example
//!
//! ```ignore
//! let subscription = log
//!     .subscribe(
//!         &ctx,
//!         Subscriber::new()
//!             .namespace("note")
//!             .on_create(|_ctx, event| async move {
//!                 println!("created {:?}", event.change.id());
//!                 Ok(())
//!             }),
//!     )
//!     .await?;
//!
//! // Later
//! subscription.close().await;
//! ```
//!
//! [`EventLogBuilder::disable_async_subscription_handling`]:
//!     crate::log::EventLogBuilder::disable_async_subscription_handling

use std::{
    collections::{HashMap, VecDeque},
    fmt,
    pin::Pin,
    sync::{
        Arc, Mutex, OnceLock, Weak,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
    task::{Context as TaskContext, Poll},
};

use futures_core::Stream;
use nonempty::NonEmpty;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;

use crate::{
    context::Context,
    error::{BoxError, HandlerFailure, Result},
    event::{EventKind, StoredEvent},
    log::{EventLog, Shared},
};

type HandlerFuture = Pin<Box<dyn Future<Output = Result<(), BoxError>> + Send>>;
type Handler = Arc<dyn Fn(Context, StoredEvent) -> HandlerFuture + Send + Sync>;

static NEXT_SUBSCRIPTION_ID: AtomicU64 = AtomicU64::new(1);
static NEXT_HUB_ID: AtomicU64 = AtomicU64::new(1);

tokio::task_local! {
    /// Hubs whose synchronous drain encloses the current task.
    static DELIVERING: Vec<u64>;
}

/// Builder describing what a subscription receives and how it reacts.
///
/// Only kinds with a registered callback are delivered.
#[derive(Default)]
pub struct Subscriber {
    namespace: Option<String>,
    handlers: HashMap<EventKind, Handler>,
    errors: Option<mpsc::UnboundedSender<HandlerFailure>>,
}

impl Subscriber {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts delivery of entity events to one namespace.
    ///
    /// Transaction markers carry no namespace and are unaffected.
    #[must_use]
    pub fn namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    #[must_use]
    pub fn on_create<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Context, StoredEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_event([EventKind::Created], handler)
    }

    #[must_use]
    pub fn on_update<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Context, StoredEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_event([EventKind::Updated], handler)
    }

    #[must_use]
    pub fn on_delete_by_id<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Context, StoredEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_event([EventKind::DeletedById], handler)
    }

    #[must_use]
    pub fn on_delete_all<F, Fut>(self, handler: F) -> Self
    where
        F: Fn(Context, StoredEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        self.on_event([EventKind::DeletedAll], handler)
    }

    /// Registers `handler` for every kind in `kinds`, replacing earlier
    /// registrations for those kinds.
    #[must_use]
    pub fn on_event<F, Fut>(mut self, kinds: impl IntoIterator<Item = EventKind>, handler: F) -> Self
    where
        F: Fn(Context, StoredEvent) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
    {
        let handler: Handler =
            Arc::new(move |ctx, event| -> HandlerFuture { Box::pin(handler(ctx, event)) });
        for kind in kinds {
            self.handlers.insert(kind, Arc::clone(&handler));
        }
        self
    }

    /// Sends handler failures to `errors` in addition to logging them.
    #[must_use]
    pub fn errors_to(mut self, errors: mpsc::UnboundedSender<HandlerFailure>) -> Self {
        self.errors = Some(errors);
        self
    }
}

impl fmt::Debug for Subscriber {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscriber")
            .field("namespace", &self.namespace)
            .field("kinds", &self.handlers.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

/// Handler state shared by a subscription, its worker and the hub.
struct Delivery {
    id: u64,
    namespace: Option<String>,
    handlers: HashMap<EventKind, Handler>,
    errors: Option<mpsc::UnboundedSender<HandlerFailure>>,
    closed: AtomicBool,
    in_flight: tokio::sync::Mutex<()>,
}

impl Delivery {
    fn accepts(&self, event: &StoredEvent) -> bool {
        if !self.handlers.contains_key(&event.kind()) {
            return false;
        }
        match (&self.namespace, event.namespace()) {
            (Some(wanted), Some(namespace)) => wanted == namespace,
            _ => true,
        }
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    async fn deliver(&self, event: &StoredEvent) {
        if self.is_closed() {
            return;
        }
        let _in_flight = self.in_flight.lock().await;
        if self.is_closed() {
            return;
        }
        let Some(handler) = self.handlers.get(&event.kind()) else {
            return;
        };

        let ctx = Context::from_metadata(event.metadata.clone());
        if let Err(source) = handler(ctx, event.clone()).await {
            tracing::warn!(
                subscription = self.id,
                seq = event.seq,
                kind = %event.kind(),
                error = %source,
                "subscription handler failed"
            );
            if let Some(errors) = &self.errors {
                let _ = errors.send(HandlerFailure {
                    seq: event.seq,
                    kind: event.kind(),
                    source,
                });
            }
        }
    }
}

/// A registered subscription as seen by the event log.
pub(crate) struct Registration {
    delivery: Arc<Delivery>,
    queue: Option<mpsc::Sender<Arc<StoredEvent>>>,
}

/// Events of one publication and the subscriptions registered when it
/// happened.
struct Dispatch {
    events: NonEmpty<Arc<StoredEvent>>,
    targets: Vec<Arc<Registration>>,
    /// `(event, target)` pairs already handled, counted event by event.
    delivered: usize,
}

impl Dispatch {
    fn next_pair(&self) -> Option<(Arc<StoredEvent>, Arc<Registration>)> {
        let event = self
            .events
            .get(self.delivered.checked_div(self.targets.len())?)?;
        let target = self
            .targets
            .get(self.delivered.checked_rem(self.targets.len())?)?;
        Some((Arc::clone(event), Arc::clone(target)))
    }
}

/// A dispatch taken off the pending queue by a synchronous drain.
///
/// Dropped before completion (the producer's future was cancelled), it puts
/// itself back at the front of the queue; the next drain resumes with the
/// pair that was interrupted.
struct Draining<'a> {
    pending: &'a Mutex<VecDeque<Dispatch>>,
    dispatch: Option<Dispatch>,
}

impl Draining<'_> {
    fn next_pair(&self) -> Option<(Arc<StoredEvent>, Arc<Registration>)> {
        self.dispatch.as_ref()?.next_pair()
    }

    fn advance(&mut self) {
        if let Some(dispatch) = &mut self.dispatch {
            dispatch.delivered += 1;
        }
    }
}

impl Drop for Draining<'_> {
    fn drop(&mut self) {
        let Some(dispatch) = self.dispatch.take() else {
            return;
        };
        if dispatch.next_pair().is_some() {
            tracing::debug!(
                delivered = dispatch.delivered,
                "synchronous delivery interrupted; requeueing publication"
            );
            self.pending
                .lock()
                .expect("subscription hub lock poisoned")
                .push_front(dispatch);
        }
    }
}

/// Fan-out machinery owned by each event log.
pub(crate) struct Hub {
    id: u64,
    sync: bool,
    buffer: usize,
    dispatcher: OnceLock<mpsc::UnboundedSender<Dispatch>>,
    pending: Mutex<VecDeque<Dispatch>>,
    draining: tokio::sync::Mutex<()>,
}

impl Hub {
    pub(crate) fn new(sync: bool, buffer: usize) -> Self {
        Self {
            id: NEXT_HUB_ID.fetch_add(1, Ordering::Relaxed),
            sync,
            buffer,
            dispatcher: OnceLock::new(),
            pending: Mutex::new(VecDeque::new()),
            draining: tokio::sync::Mutex::new(()),
        }
    }

    /// Queues `events` for the subscriptions registered right now.
    ///
    /// Called with the log write lock held, so dispatches are queued in
    /// publication order.
    pub(crate) fn offer(&self, subscribers: &[Arc<Registration>], events: NonEmpty<Arc<StoredEvent>>) {
        let targets: Vec<Arc<Registration>> = subscribers
            .iter()
            .filter(|registration| events.iter().any(|event| registration.delivery.accepts(event)))
            .cloned()
            .collect();
        if targets.is_empty() {
            return;
        }
        let dispatch = Dispatch {
            events,
            targets,
            delivered: 0,
        };

        if self.sync {
            self.pending
                .lock()
                .expect("subscription hub lock poisoned")
                .push_back(dispatch);
        } else if let Some(dispatcher) = self.dispatcher.get()
            && dispatcher.send(dispatch).is_err()
        {
            tracing::error!("subscription dispatcher stopped; dropping publication");
        }
    }

    /// Delivers pending publications in synchronous mode.
    ///
    /// Returns once every publication queued before the call was delivered.
    /// A handler that publishes to a log whose drain is already running on
    /// this task returns immediately; its publication is delivered by that
    /// surrounding drain. Publications to other logs are drained in place.
    ///
    /// Cancelling the returned future loses nothing: an interrupted
    /// publication stays queued and the interrupted handler sees the event
    /// again on the next drain.
    pub(crate) async fn settle(&self) {
        if !self.sync {
            return;
        }
        let mut enclosing = DELIVERING.try_with(Clone::clone).unwrap_or_default();
        if enclosing.contains(&self.id) {
            return;
        }
        enclosing.push(self.id);

        let _turn = self.draining.lock().await;
        DELIVERING
            .scope(enclosing, async {
                loop {
                    let next = self
                        .pending
                        .lock()
                        .expect("subscription hub lock poisoned")
                        .pop_front();
                    let Some(dispatch) = next else {
                        break;
                    };
                    let mut draining = Draining {
                        pending: &self.pending,
                        dispatch: Some(dispatch),
                    };
                    while let Some((event, target)) = draining.next_pair() {
                        if target.delivery.accepts(&event) {
                            target.delivery.deliver(&event).await;
                        }
                        draining.advance();
                    }
                }
            })
            .await;
    }

    fn dispatcher(&self) -> &mpsc::UnboundedSender<Dispatch> {
        self.dispatcher.get_or_init(|| {
            let (sender, receiver) = mpsc::unbounded_channel();
            tokio::spawn(run_dispatcher(receiver));
            sender
        })
    }
}

async fn run_dispatcher(mut receiver: mpsc::UnboundedReceiver<Dispatch>) {
    while let Some(dispatch) = receiver.recv().await {
        for event in &dispatch.events {
            for target in &dispatch.targets {
                let delivery = &target.delivery;
                if !delivery.accepts(event) || delivery.is_closed() {
                    continue;
                }
                if let Some(queue) = &target.queue
                    && queue.send(Arc::clone(event)).await.is_err()
                {
                    tracing::trace!(subscription = delivery.id, "subscription worker gone");
                }
            }
        }
    }
    tracing::debug!("subscription dispatcher stopped");
}

async fn run_worker(delivery: Arc<Delivery>, mut queue: mpsc::Receiver<Arc<StoredEvent>>) {
    while let Some(event) = queue.recv().await {
        delivery.deliver(&event).await;
    }
    tracing::trace!(subscription = delivery.id, "subscription worker stopped");
}

/// Handle to a registered subscription.
///
/// Dropping the handle closes the subscription without waiting for an
/// in-flight delivery; call [`close()`](Subscription::close) to wait.
pub struct Subscription {
    delivery: Arc<Delivery>,
    log: Weak<Shared>,
}

impl Subscription {
    #[must_use]
    pub fn id(&self) -> u64 {
        self.delivery.id
    }

    #[must_use]
    pub fn is_closed(&self) -> bool {
        self.delivery.is_closed()
    }

    /// Stops deliveries and waits for an in-flight handler to return.
    ///
    /// No handler starts after `close` returns. Closing twice is a no-op.
    /// Must not be awaited from inside this subscription's own handler.
    pub async fn close(&self) {
        if !self.detach() {
            return;
        }
        let _in_flight = self.delivery.in_flight.lock().await;
        tracing::debug!(subscription = self.delivery.id, "subscription closed");
    }

    /// Marks the subscription closed and unregisters it. Returns `false` if
    /// it was already closed.
    fn detach(&self) -> bool {
        if self.delivery.closed.swap(true, Ordering::AcqRel) {
            return false;
        }
        if let Some(shared) = self.log.upgrade() {
            shared
                .write()
                .subscribers
                .retain(|registration| registration.delivery.id != self.delivery.id);
        }
        true
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.detach() {
            tracing::trace!(subscription = self.delivery.id, "subscription dropped without close");
        }
    }
}

impl fmt::Debug for Subscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.delivery.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

/// Pull-based view of a subscription returned by
/// [`EventLog::subscribe_stream`].
pub struct EventStream {
    subscription: Subscription,
    events: ReceiverStream<StoredEvent>,
}

impl EventStream {
    #[must_use]
    pub const fn subscription(&self) -> &Subscription {
        &self.subscription
    }

    /// Closes the underlying subscription.
    pub async fn close(&self) {
        self.subscription.close().await;
    }
}

impl Stream for EventStream {
    type Item = StoredEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<Option<Self::Item>> {
        Pin::new(&mut self.events).poll_next(cx)
    }
}

impl fmt::Debug for EventStream {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EventStream")
            .field("subscription", &self.subscription)
            .finish_non_exhaustive()
    }
}

impl EventLog {
    /// Registers `subscriber` for events published from now on.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`](crate::Error::Cancelled) if the context is
    /// cancelled.
    #[tracing::instrument(skip(self, ctx, subscriber), fields(kinds = subscriber.handlers.len()))]
    pub async fn subscribe(&self, ctx: &Context, subscriber: Subscriber) -> Result<Subscription> {
        ctx.check()?;
        let Subscriber {
            namespace,
            handlers,
            errors,
        } = subscriber;
        let delivery = Arc::new(Delivery {
            id: NEXT_SUBSCRIPTION_ID.fetch_add(1, Ordering::Relaxed),
            namespace,
            handlers,
            errors,
            closed: AtomicBool::new(false),
            in_flight: tokio::sync::Mutex::new(()),
        });

        let hub = &self.shared.hub;
        let queue = if hub.sync {
            None
        } else {
            hub.dispatcher();
            let (sender, receiver) = mpsc::channel(hub.buffer);
            tokio::spawn(run_worker(Arc::clone(&delivery), receiver));
            Some(sender)
        };

        self.shared.write().subscribers.push(Arc::new(Registration {
            delivery: Arc::clone(&delivery),
            queue,
        }));
        tracing::debug!(subscription = delivery.id, "subscription registered");

        Ok(Subscription {
            delivery,
            log: Arc::downgrade(&self.shared),
        })
    }

    /// Subscribes to `kinds` (optionally within one namespace) and returns
    /// the events as a stream.
    ///
    /// The stream buffers up to the log's subscriber buffer size. In
    /// synchronous mode a producer blocks until the stream is polled once the
    /// buffer is full.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`](crate::Error::Cancelled) if the context is
    /// cancelled.
    pub async fn subscribe_stream(
        &self,
        ctx: &Context,
        namespace: Option<&str>,
        kinds: impl IntoIterator<Item = EventKind>,
    ) -> Result<EventStream> {
        let (sender, receiver) = mpsc::channel(self.shared.hub.buffer);
        let mut subscriber = Subscriber::new().on_event(kinds, move |_ctx, event| {
            let sender = sender.clone();
            async move {
                sender
                    .send(event)
                    .await
                    .map_err(|_| BoxError::from("event stream dropped"))
            }
        });
        if let Some(namespace) = namespace {
            subscriber = subscriber.namespace(namespace);
        }
        let subscription = self.subscribe(ctx, subscriber).await?;
        Ok(EventStream {
            subscription,
            events: ReceiverStream::new(receiver),
        })
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use serde_json::json;
    use tokio_stream::StreamExt as _;

    use super::*;
    use crate::{event::Change, meta::set_meta, tx::TxManager};

    fn created(id: &str) -> Change {
        Change::Created {
            namespace: "note".into(),
            id: json!(id),
            entity: json!({ "id": id }),
        }
    }

    fn recorder() -> (Arc<Mutex<Vec<StoredEvent>>>, Subscriber) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let subscriber = Subscriber::new().on_event(EventKind::ENTITY, move |_ctx, event| {
            let sink = Arc::clone(&sink);
            async move {
                sink.lock().unwrap().push(event);
                Ok(())
            }
        });
        (seen, subscriber)
    }

    #[tokio::test]
    async fn sync_delivery_completes_before_append_returns() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let ctx = Context::background();
        let (seen, subscriber) = recorder();
        let _subscription = log.subscribe(&ctx, subscriber).await.unwrap();

        log.append(&ctx, created("a")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn events_before_subscribe_are_not_delivered() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let ctx = Context::background();
        log.append(&ctx, created("a")).await.unwrap();

        let (seen, subscriber) = recorder();
        let _subscription = log.subscribe(&ctx, subscriber).await.unwrap();
        log.append(&ctx, created("b")).await.unwrap();

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].change.id(), Some(&json!("b")));
    }

    #[tokio::test]
    async fn namespace_filter_limits_delivery() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let ctx = Context::background();
        let (seen, subscriber) = recorder();
        let _subscription = log
            .subscribe(&ctx, subscriber.namespace("todo"))
            .await
            .unwrap();

        log.append(&ctx, created("a")).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn handler_context_carries_emission_metadata() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let users = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&users);
        let _subscription = log
            .subscribe(
                &Context::background(),
                Subscriber::new().on_create(move |ctx, _event| {
                    let sink = Arc::clone(&sink);
                    async move {
                        let user: Option<String> = crate::meta::lookup_meta(&ctx, "user")?;
                        sink.lock().unwrap().push(user);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        let ctx = set_meta(&Context::background(), "user", "alice").unwrap();
        log.append(&ctx, created("a")).await.unwrap();
        assert_eq!(*users.lock().unwrap(), vec![Some("alice".to_string())]);
    }

    #[tokio::test]
    async fn handler_errors_reach_the_error_channel() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let (errors, mut failures) = mpsc::unbounded_channel();
        let _subscription = log
            .subscribe(
                &Context::background(),
                Subscriber::new()
                    .on_create(|_ctx, _event| async { Err(BoxError::from("boom")) })
                    .errors_to(errors),
            )
            .await
            .unwrap();

        let appended = log.append(&Context::background(), created("a")).await;
        assert!(appended.is_ok());
        let failure = failures.recv().await.unwrap();
        assert_eq!(failure.seq, 1);
        assert_eq!(failure.kind, EventKind::Created);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_stops_delivery() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let ctx = Context::background();
        let (seen, subscriber) = recorder();
        let subscription = log.subscribe(&ctx, subscriber).await.unwrap();

        subscription.close().await;
        subscription.close().await;
        assert!(subscription.is_closed());

        log.append(&ctx, created("a")).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn reentrant_publication_does_not_deadlock() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let inner_log = log.clone();
        let (seen, recorder) = recorder();
        let _recorder = log.subscribe(&Context::background(), recorder).await.unwrap();
        let _echo = log
            .subscribe(
                &Context::background(),
                Subscriber::new().namespace("note").on_create(move |ctx, event| {
                    let log = inner_log.clone();
                    async move {
                        let id = event.change.id().cloned().unwrap_or_default();
                        log.append(
                            &ctx,
                            Change::Created {
                                namespace: "echo".into(),
                                id,
                                entity: json!({}),
                            },
                        )
                        .await?;
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        log.append(&Context::background(), created("a")).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn handler_publishing_to_another_sync_log_delivers_there() {
        let first = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let second = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let (seen, recorder) = recorder();
        let _recorder = second.subscribe(&Context::background(), recorder).await.unwrap();

        let target = second.clone();
        let forwarded = Arc::clone(&seen);
        let _forward = first
            .subscribe(
                &Context::background(),
                Subscriber::new().on_create(move |ctx, event| {
                    let target = target.clone();
                    let forwarded = Arc::clone(&forwarded);
                    async move {
                        target.append(&ctx, event.change.clone()).await?;
                        assert_eq!(forwarded.lock().unwrap().len(), 1);
                        Ok(())
                    }
                }),
            )
            .await
            .unwrap();

        first.append(&Context::background(), created("a")).await.unwrap();
        assert_eq!(second.events().len(), 1);
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn cancelled_producer_leaves_publication_queued() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let ctx = Context::background();
        let _slow = log
            .subscribe(
                &ctx,
                Subscriber::new().on_create(|_ctx, _event| async {
                    tokio::time::sleep(Duration::from_millis(200)).await;
                    Ok(())
                }),
            )
            .await
            .unwrap();
        let (seen, subscriber) = recorder();
        let _recorder = log.subscribe(&ctx, subscriber).await.unwrap();

        let interrupted =
            tokio::time::timeout(Duration::from_millis(50), log.append(&ctx, created("a"))).await;
        assert!(interrupted.is_err());
        assert_eq!(log.events().len(), 1);
        assert!(seen.lock().unwrap().is_empty());

        log.append(&ctx, created("b")).await.unwrap();
        let ids: Vec<_> = seen
            .lock()
            .unwrap()
            .iter()
            .map(|event| event.change.id().cloned())
            .collect();
        assert_eq!(ids, vec![Some(json!("a")), Some(json!("b"))]);
    }

    #[tokio::test]
    async fn async_delivery_preserves_order() {
        let log = EventLog::builder().subscriber_buffer_size(2).build();
        let ctx = Context::background();
        let mut stream = log
            .subscribe_stream(&ctx, Some("note"), [EventKind::Created])
            .await
            .unwrap();

        for n in 0..10 {
            log.append(&ctx, created(&n.to_string())).await.unwrap();
        }

        for n in 0..10 {
            let event = tokio::time::timeout(Duration::from_secs(5), stream.next())
                .await
                .unwrap()
                .unwrap();
            assert_eq!(event.change.id(), Some(&json!(n.to_string())));
        }
        stream.close().await;
    }

    #[tokio::test]
    async fn rolled_back_events_are_never_delivered() {
        let log = EventLog::builder()
            .disable_async_subscription_handling(true)
            .build();
        let root = Context::background();
        let (seen, subscriber) = recorder();
        let _subscription = log.subscribe(&root, subscriber).await.unwrap();

        let tx = log.begin_tx(&root).await.unwrap();
        log.append(&tx, created("a")).await.unwrap();
        log.rollback_tx(&tx).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());

        let tx = log.begin_tx(&root).await.unwrap();
        log.append(&tx, created("b")).await.unwrap();
        assert!(seen.lock().unwrap().is_empty());
        log.commit_tx(&tx).await.unwrap();
        assert_eq!(seen.lock().unwrap().len(), 1);
    }
}
