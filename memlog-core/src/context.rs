//! Request-scoped context threaded through every operation.
//!
//! A [`Context`] carries three things: a cancellation signal (with an optional
//! deadline), the stack of transactions opened through it, and the metadata
//! attached with [`crate::meta`]. Contexts are cheap to clone and immutable;
//! every "with" method returns a derived context and leaves the original
//! untouched.

use std::{
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::{Duration, Instant},
};

use crate::{
    error::{Error, Result},
    meta::Metadata,
    tx::TxFrame,
};

#[derive(Debug, Default)]
struct CancelNode {
    cancelled: AtomicBool,
    parent: Option<Arc<CancelNode>>,
}

impl CancelNode {
    fn is_cancelled(&self) -> bool {
        let mut node = Some(self);
        while let Some(current) = node {
            if current.cancelled.load(Ordering::Acquire) {
                return true;
            }
            node = current.parent.as_deref();
        }
        false
    }
}

/// Cancels the context returned alongside it by [`Context::with_cancel`].
///
/// Cancelling is idempotent and propagates to every context derived from the
/// cancelled one.
#[derive(Debug, Clone)]
pub struct CancelHandle {
    node: Arc<CancelNode>,
}

impl CancelHandle {
    pub fn cancel(&self) {
        self.node.cancelled.store(true, Ordering::Release);
    }
}

/// Carrier for cancellation, the transaction stack and metadata.
#[derive(Clone, Default)]
pub struct Context {
    cancel: Option<Arc<CancelNode>>,
    deadline: Option<Instant>,
    pub(crate) meta: Arc<Metadata>,
    pub(crate) txs: Arc<[Arc<TxFrame>]>,
}

impl Context {
    /// An empty, never-cancelled context.
    #[must_use]
    pub fn background() -> Self {
        Self::default()
    }

    /// Derives a context that can be cancelled through the returned handle.
    #[must_use]
    pub fn with_cancel(&self) -> (Self, CancelHandle) {
        let node = Arc::new(CancelNode {
            cancelled: AtomicBool::new(false),
            parent: self.cancel.clone(),
        });
        let ctx = Self {
            cancel: Some(Arc::clone(&node)),
            ..self.clone()
        };
        (ctx, CancelHandle { node })
    }

    /// Derives a context that is cancelled once `deadline` has passed.
    ///
    /// An earlier deadline inherited from `self` still applies.
    #[must_use]
    pub fn with_deadline(&self, deadline: Instant) -> Self {
        let deadline = self
            .deadline
            .map_or(deadline, |current| current.min(deadline));
        Self {
            deadline: Some(deadline),
            ..self.clone()
        }
    }

    /// Derives a context that is cancelled after `timeout`.
    #[must_use]
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    /// Rebuilds a context from an event's metadata snapshot.
    #[must_use]
    pub fn from_metadata(meta: Metadata) -> Self {
        Self {
            meta: Arc::new(meta),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        self.cancel.as_deref().is_some_and(CancelNode::is_cancelled)
            || self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    /// Returns [`Error::Cancelled`] once the context is cancelled.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] when the context was cancelled or its deadline
    /// passed.
    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(Error::Cancelled)
        } else {
            Ok(())
        }
    }

    /// The metadata attached to this context.
    #[must_use]
    pub fn metadata(&self) -> &Metadata {
        &self.meta
    }

    pub(crate) fn with_metadata(&self, meta: Metadata) -> Self {
        Self {
            meta: Arc::new(meta),
            ..self.clone()
        }
    }

    /// Innermost transaction frame that belongs to the log `log_id`.
    pub(crate) fn tx_frame(&self, log_id: u64) -> Option<&Arc<TxFrame>> {
        self.txs.iter().rev().find(|frame| frame.log_id() == log_id)
    }

    pub(crate) fn with_tx(&self, frame: Arc<TxFrame>) -> Self {
        let txs: Arc<[Arc<TxFrame>]> = self
            .txs
            .iter()
            .cloned()
            .chain(std::iter::once(frame))
            .collect();
        Self {
            txs,
            ..self.clone()
        }
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("cancelled", &self.is_cancelled())
            .field("deadline", &self.deadline)
            .field("metadata", &self.meta)
            .field("tx_depth", &self.txs.len())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn background_is_never_cancelled() {
        let ctx = Context::background();
        assert!(!ctx.is_cancelled());
        assert!(ctx.check().is_ok());
    }

    #[test]
    fn cancellation_propagates_to_children_only() {
        let (parent, cancel_parent) = Context::background().with_cancel();
        let (child, cancel_child) = parent.with_cancel();

        cancel_child.cancel();
        assert!(child.is_cancelled());
        assert!(!parent.is_cancelled());

        let (other_child, _) = parent.with_cancel();
        cancel_parent.cancel();
        assert!(other_child.is_cancelled());
        assert!(matches!(other_child.check(), Err(Error::Cancelled)));
    }

    #[test]
    fn cancel_is_idempotent() {
        let (ctx, cancel) = Context::background().with_cancel();
        cancel.cancel();
        cancel.cancel();
        assert!(ctx.is_cancelled());
    }

    #[test]
    fn elapsed_deadline_cancels() {
        let ctx = Context::background().with_deadline(Instant::now());
        assert!(ctx.is_cancelled());

        let ctx = Context::background().with_timeout(Duration::from_secs(3600));
        assert!(!ctx.is_cancelled());
    }

    #[test]
    fn earlier_deadline_wins() {
        let now = Instant::now();
        let ctx = Context::background()
            .with_deadline(now)
            .with_deadline(now + Duration::from_secs(3600));
        assert!(ctx.is_cancelled());
    }
}
