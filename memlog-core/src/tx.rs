//! Nested one-phase-commit transactions.
//!
//! [`TxManager::begin_tx`] returns a derived [`Context`] carrying a new
//! transaction frame. Every append made through that context is staged on
//! the frame; reads through it observe the state at `begin_tx` plus the
//! frame's own staged effects.
//!
//! Committing a nested frame moves its staged events into the parent.
//! Committing a root frame publishes them, bracketed by `TxBegin` and
//! `TxCommit` markers, and offers them to subscribers. Rolling back discards
//! them. Both are terminal: later operations through the context fail with
//! [`Error::TxDone`].
//!
//! ```ignore
//! let tx = log.begin(&ctx)?;
//! repo.create(tx.context(), &mut note).await?;
//! tx.commit().await?;
//! ```

use std::{
    collections::HashMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError, Weak},
};

use nonempty::NonEmpty;

use crate::{
    context::Context,
    error::{Error, Result},
    event::{Change, Trace, TxId},
    log::{
        EventLog, Inner, Pending, Shared,
        projection::{NamespaceView, replay_checked},
    },
};

/// Lifecycle state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum TxStatus {
    Active,
    Committed,
    RolledBack,
}

/// Description of the innermost active transaction returned by
/// [`EventLog::lookup_tx`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxInfo {
    pub id: TxId,
    /// Zero for a root transaction.
    pub depth: usize,
}

/// Begin / commit / rollback over a context.
pub trait TxManager {
    /// Opens a transaction nested in the context's current one, if any.
    fn begin_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<Context>> + Send + 'a;

    /// Commits the context's innermost transaction.
    fn commit_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Rolls back the context's innermost transaction.
    fn rollback_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a;
}

#[derive(Debug)]
struct FrameState {
    status: TxStatus,
    staged: Vec<Pending>,
}

/// One level of the transaction stack.
#[derive(Debug)]
pub(crate) struct TxFrame {
    id: TxId,
    log_id: u64,
    parent: Option<Arc<TxFrame>>,
    depth: usize,
    /// Last root sequence number visible to the transaction tree.
    watermark: u64,
    /// Number of the parent's staged events visible at begin.
    parent_prefix: usize,
    begun_at: Trace,
    state: Mutex<FrameState>,
    shared: Weak<Shared>,
}

impl TxFrame {
    pub(crate) const fn log_id(&self) -> u64 {
        self.log_id
    }

    fn lock(&self) -> MutexGuard<'_, FrameState> {
        self.state.lock().expect("transaction lock poisoned")
    }

    fn shared(&self) -> Result<Arc<Shared>> {
        self.shared
            .upgrade()
            .ok_or_else(|| Error::internal("event log dropped while transaction in use"))
    }

    const fn is_root(&self) -> bool {
        self.parent.is_none()
    }

    fn ensure_active(&self, state: &FrameState) -> Result<()> {
        match state.status {
            TxStatus::Active => Ok(()),
            TxStatus::Committed | TxStatus::RolledBack => Err(Error::TxDone { tx: self.id }),
        }
    }

    fn is_active(&self) -> bool {
        self.lock().status == TxStatus::Active
    }

    /// `None` once the transaction has been committed or rolled back.
    pub(crate) fn info(&self) -> Option<TxInfo> {
        self.is_active().then_some(TxInfo {
            id: self.id,
            depth: self.depth,
        })
    }

    /// Validates `pending` against the frame's view and stages it.
    pub(crate) fn stage(&self, ctx: &Context, mut pending: Pending) -> Result<TxId> {
        let mut state = self.lock();
        self.ensure_active(&state)?;
        if let Some(namespace) = pending.change.namespace() {
            self.view_locked(&state, namespace)?.check(&pending.change)?;
        }
        ctx.check()?;
        pending.tx = Some(self.id);
        state.staged.push(pending);
        Ok(self.id)
    }

    pub(crate) fn view(&self, namespace: &str) -> Result<NamespaceView> {
        let state = self.lock();
        self.ensure_active(&state)?;
        self.view_locked(&state, namespace)
    }

    /// Root log up to the watermark, then each ancestor's visible prefix
    /// (root-most first), then this frame's staged events.
    fn view_locked(&self, state: &FrameState, namespace: &str) -> Result<NamespaceView> {
        let mut segments: Vec<Vec<Change>> = Vec::new();
        let mut limit = self.parent_prefix;
        let mut node = self.parent.as_deref();
        while let Some(frame) = node {
            let frame_state = frame.lock();
            frame.ensure_active(&frame_state)?;
            let visible = &frame_state.staged[..limit.min(frame_state.staged.len())];
            segments.push(
                visible
                    .iter()
                    .filter(|pending| pending.change.namespace() == Some(namespace))
                    .map(|pending| pending.change.clone())
                    .collect(),
            );
            limit = frame.parent_prefix;
            node = frame.parent.as_deref();
        }

        let mut view = self.shared()?.view_at(namespace, self.watermark);
        for change in segments.iter().rev().flatten() {
            view.apply(change);
        }
        for pending in &state.staged {
            if pending.change.namespace() == Some(namespace) {
                view.apply(&pending.change);
            }
        }
        Ok(view)
    }

    fn conflict(&self, error: &Error) -> Error {
        Error::TxConflict {
            tx: self.id,
            reason: error.to_string(),
        }
    }

    fn markers(&self, ctx: &Context, end: Change, trace: Trace) -> NonEmpty<Pending> {
        let marker = |change, trace| Pending {
            tx: Some(self.id),
            ..Pending::new(ctx, change, trace)
        };
        NonEmpty::from((
            marker(Change::TxBegin { tx: self.id }, self.begun_at),
            vec![marker(end, trace)],
        ))
    }

    /// Marks a root frame rolled back and records its markers.
    fn finish_root_rollback(&self, shared: &Shared, inner: &mut Inner, ctx: &Context, trace: Trace) {
        inner.active_roots -= 1;
        let markers = self.markers(ctx, Change::TxRollback { tx: self.id }, trace);
        shared.publish(inner, markers, false);
    }

    async fn commit(&self, ctx: &Context, trace: Trace) -> Result<()> {
        if ctx.is_cancelled() {
            self.rollback(ctx, trace)?;
            return Err(Error::Cancelled);
        }
        match &self.parent {
            Some(parent) => self.commit_into(parent),
            None => self.commit_root(ctx, trace).await,
        }
    }

    fn commit_into(&self, parent: &Self) -> Result<()> {
        let mut state = self.lock();
        self.ensure_active(&state)?;
        let mut parent_state = parent.lock();
        parent.ensure_active(&parent_state)?;

        let mut bases = HashMap::new();
        for pending in &state.staged {
            if let Some(namespace) = pending.change.namespace()
                && !bases.contains_key(namespace)
            {
                let view = parent.view_locked(&parent_state, namespace)?;
                bases.insert(namespace.to_owned(), view);
            }
        }
        replay_checked(
            state.staged.iter().map(|pending| &pending.change),
            |namespace| bases.remove(namespace).unwrap_or_default(),
        )
        .map_err(|error| self.conflict(&error))?;

        let staged = std::mem::take(&mut state.staged);
        tracing::debug!(tx = %self.id, parent = %parent.id, event_count = staged.len(), "nested transaction committed");
        parent_state.staged.extend(staged);
        state.status = TxStatus::Committed;
        Ok(())
    }

    async fn commit_root(&self, ctx: &Context, trace: Trace) -> Result<()> {
        let shared = self.shared()?;
        {
            let mut state = self.lock();
            self.ensure_active(&state)?;
            let mut inner = shared.write();

            replay_checked(
                state.staged.iter().map(|pending| &pending.change),
                |namespace| inner.projection.snapshot(namespace),
            )
            .map_err(|error| self.conflict(&error))?;

            if ctx.is_cancelled() {
                state.status = TxStatus::RolledBack;
                state.staged.clear();
                self.finish_root_rollback(&shared, &mut inner, ctx, trace);
                return Err(Error::Cancelled);
            }

            let staged = std::mem::take(&mut state.staged);
            let event_count = staged.len();
            let markers = self.markers(ctx, Change::TxCommit { tx: self.id }, trace);
            let batch = NonEmpty::from((markers.head, staged.into_iter().chain(markers.tail).collect()));

            state.status = TxStatus::Committed;
            inner.active_roots -= 1;
            let last_seq = shared.publish(&mut inner, batch, true);
            tracing::debug!(tx = %self.id, event_count, last_seq, "transaction committed");
        }
        shared.hub.settle().await;
        Ok(())
    }

    fn rollback(&self, ctx: &Context, trace: Trace) -> Result<()> {
        let mut state = self.lock();
        self.ensure_active(&state)?;
        state.status = TxStatus::RolledBack;
        let discarded = std::mem::take(&mut state.staged).len();
        if self.is_root()
            && let Some(shared) = self.shared.upgrade()
        {
            let mut inner = shared.write();
            self.finish_root_rollback(&shared, &mut inner, ctx, trace);
        }
        tracing::debug!(tx = %self.id, discarded, "transaction rolled back");
        Ok(())
    }
}

impl Drop for TxFrame {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.status != TxStatus::Active {
            return;
        }
        state.status = TxStatus::RolledBack;
        let discarded = std::mem::take(&mut state.staged).len();
        tracing::trace!(tx = %self.id, discarded, "transaction dropped while active; rolling back");
        if self.is_root()
            && let Some(shared) = self.shared.upgrade()
        {
            let mut inner = shared.write();
            self.finish_root_rollback(&shared, &mut inner, &Context::background(), self.begun_at);
        }
    }
}

fn begin(log: &EventLog, ctx: &Context, trace: Trace) -> Result<Context> {
    ctx.check()?;
    let shared = &log.shared;
    let id = shared.next_tx_id();

    let frame = match log.frame(ctx) {
        Some(parent) => {
            let parent_state = parent.lock();
            parent.ensure_active(&parent_state)?;
            let parent_prefix = parent_state.staged.len();
            drop(parent_state);
            TxFrame {
                id,
                log_id: shared.id,
                depth: parent.depth + 1,
                watermark: parent.watermark,
                parent_prefix,
                begun_at: trace,
                state: Mutex::new(FrameState {
                    status: TxStatus::Active,
                    staged: Vec::new(),
                }),
                shared: Arc::downgrade(shared),
                parent: Some(parent),
            }
        }
        None => {
            let mut inner = shared.write();
            inner.active_roots += 1;
            TxFrame {
                id,
                log_id: shared.id,
                parent: None,
                depth: 0,
                watermark: inner.last_seq(),
                parent_prefix: 0,
                begun_at: trace,
                state: Mutex::new(FrameState {
                    status: TxStatus::Active,
                    staged: Vec::new(),
                }),
                shared: Arc::downgrade(shared),
            }
        }
    };
    tracing::debug!(tx = %id, depth = frame.depth, "transaction begun");
    Ok(ctx.with_tx(Arc::new(frame)))
}

fn no_transaction() -> Error {
    Error::validation("context carries no transaction for this event log")
}

pub(crate) async fn commit(log: &EventLog, ctx: &Context, trace: Trace) -> Result<()> {
    let frame = log.frame(ctx).ok_or_else(no_transaction)?;
    frame.commit(ctx, trace).await
}

pub(crate) fn rollback(log: &EventLog, ctx: &Context, trace: Trace) -> Result<()> {
    let frame = log.frame(ctx).ok_or_else(no_transaction)?;
    frame.rollback(ctx, trace)
}

impl TxManager for EventLog {
    #[track_caller]
    fn begin_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<Context>> + Send + 'a {
        std::future::ready(begin(self, ctx, Trace::capture()))
    }

    #[track_caller]
    fn commit_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        commit(self, ctx, Trace::capture())
    }

    #[track_caller]
    fn rollback_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        std::future::ready(rollback(self, ctx, Trace::capture()))
    }
}

impl EventLog {
    /// Opens a transaction and returns a guard that rolls it back on drop
    /// unless it was committed or rolled back explicitly.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`], or [`Error::TxDone`] when the context's current
    /// transaction is finished.
    #[track_caller]
    pub fn begin(&self, ctx: &Context) -> Result<TxGuard> {
        let ctx = begin(self, ctx, Trace::capture())?;
        Ok(TxGuard {
            log: self.clone(),
            ctx,
            finished: false,
        })
    }
}

/// Scoped transaction returned by [`EventLog::begin`].
#[derive(Debug)]
#[must_use = "dropping a TxGuard rolls the transaction back"]
pub struct TxGuard {
    log: EventLog,
    ctx: Context,
    finished: bool,
}

impl TxGuard {
    /// Context carrying the transaction.
    pub const fn context(&self) -> &Context {
        &self.ctx
    }

    /// Commits the transaction.
    ///
    /// A [`Error::TxConflict`] leaves the frame active until the guard's
    /// context is dropped, at which point it is rolled back.
    #[track_caller]
    pub fn commit(mut self) -> impl Future<Output = Result<()>> + Send {
        let trace = Trace::capture();
        self.finished = true;
        async move { commit(&self.log, &self.ctx, trace).await }
    }

    /// Rolls the transaction back.
    ///
    /// # Errors
    ///
    /// [`Error::TxDone`] when the transaction already finished.
    #[track_caller]
    pub fn rollback(mut self) -> Result<()> {
        self.finished = true;
        rollback(&self.log, &self.ctx, Trace::capture())
    }
}

impl Drop for TxGuard {
    fn drop(&mut self) {
        if self.finished {
            return;
        }
        if let Some(frame) = self.log.frame(&self.ctx)
            && frame.is_active()
        {
            tracing::trace!(tx = %frame.id, "transaction guard dropped without commit; rolling back");
            let _ = frame.rollback(&self.ctx, frame.begun_at);
        }
    }
}
