//! The resource contract shared by storage implementations.
//!
//! [`Crud`] is the seam the behavioural contracts in
//! [`test`](crate::test) are written against: any implementation that passes
//! them is interchangeable with the in-memory
//! [`Repository`](crate::repository::Repository).

use crate::{context::Context, cursor::Cursor, entity::EntityId, error::Result};

/// Create / read / update / delete over one collection of `E`.
pub trait Crud<E>: Send + Sync {
    type Id: EntityId;

    /// Stores `entity`, assigning an ID first when it has none.
    fn create<'a>(
        &'a self,
        ctx: &'a Context,
        entity: &'a mut E,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn find_by_id<'a>(
        &'a self,
        ctx: &'a Context,
        id: &'a Self::Id,
    ) -> impl Future<Output = Result<Option<E>>> + Send + 'a;

    fn find_all<'a>(&'a self, ctx: &'a Context)
    -> impl Future<Output = Result<Cursor<E>>> + Send + 'a;

    fn update<'a>(&'a self, ctx: &'a Context, entity: &'a E)
    -> impl Future<Output = Result<()>> + Send + 'a;

    fn delete_by_id<'a>(
        &'a self,
        ctx: &'a Context,
        id: &'a Self::Id,
    ) -> impl Future<Output = Result<()>> + Send + 'a;

    fn delete_all<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a;

    /// Removes every entity and guarantees the collection is empty
    /// afterwards.
    fn purge<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a;
}
