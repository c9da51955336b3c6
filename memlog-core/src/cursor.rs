//! Finite, forward-only cursor returned by `find_all`.

use std::{fmt, marker::PhantomData};

use serde::de::DeserializeOwned;

use crate::{context::Context, error::Error};

/// Iterates the entities visible when the cursor was opened, in creation
/// order.
///
/// Drive it with [`advance`](Cursor::advance) / [`value`](Cursor::value) /
/// [`err`](Cursor::err), or as an [`Iterator`] of `Result<E, Error>`. The
/// context is checked on every step; once it is cancelled the cursor stops
/// and reports [`Error::Cancelled`].
pub struct Cursor<E> {
    ctx: Context,
    items: std::vec::IntoIter<serde_json::Value>,
    current: Option<E>,
    error: Option<Error>,
    closed: bool,
    _entity: PhantomData<fn() -> E>,
}

impl<E: DeserializeOwned> Cursor<E> {
    pub(crate) fn new(ctx: Context, items: Vec<serde_json::Value>) -> Self {
        Self {
            ctx,
            items: items.into_iter(),
            current: None,
            error: None,
            closed: false,
            _entity: PhantomData,
        }
    }

    /// Moves to the next entity. Returns `false` when exhausted, closed or
    /// failed.
    pub fn advance(&mut self) -> bool {
        self.current = None;
        if self.closed || self.error.is_some() {
            return false;
        }
        if let Err(error) = self.ctx.check() {
            self.error = Some(error);
            return false;
        }
        let Some(value) = self.items.next() else {
            return false;
        };
        match serde_json::from_value(value) {
            Ok(entity) => {
                self.current = Some(entity);
                true
            }
            Err(error) => {
                self.error = Some(error.into());
                false
            }
        }
    }

    /// The entity the last successful [`advance`](Cursor::advance) moved to.
    #[must_use]
    pub const fn value(&self) -> Option<&E> {
        self.current.as_ref()
    }

    /// The error that stopped the cursor, if any.
    #[must_use]
    pub const fn err(&self) -> Option<&Error> {
        self.error.as_ref()
    }

    /// Releases the remaining entities. Idempotent.
    pub fn close(&mut self) {
        self.closed = true;
        self.current = None;
        self.items = Vec::new().into_iter();
    }

    /// Number of entities not yet visited.
    #[must_use]
    pub fn remaining(&self) -> usize {
        self.items.len()
    }
}

impl<E: DeserializeOwned> Iterator for Cursor<E> {
    type Item = Result<E, Error>;

    /// Yields each entity, then the stopping error once, if there was one.
    fn next(&mut self) -> Option<Self::Item> {
        if self.advance() {
            return self.current.take().map(Ok);
        }
        self.error.take().map(Err)
    }
}

impl<E> fmt::Debug for Cursor<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cursor")
            .field("remaining", &self.items.len())
            .field("error", &self.error)
            .field("closed", &self.closed)
            .finish_non_exhaustive()
    }
}
