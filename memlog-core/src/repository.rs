//! Namespaced, typed CRUD over the event log.
//!
//! A [`Repository`] turns create/update/delete calls into events in one
//! namespace of an [`EventLog`] and answers reads from the log's projection,
//! as seen from the caller's transaction.
//!
//! ```ignore
//! let notes: Repository<Note, _> = Repository::new(&log);
//! let mut note = Note { id: String::new(), body: "hello".into() };
//! notes.create(&ctx, &mut note).await?;
//! assert!(notes.find_by_id(&ctx, &note.id).await?.is_some());
//! ```

use std::fmt;

use serde::{Serialize, de::DeserializeOwned};

use crate::{
    context::Context,
    crud::Crud,
    cursor::Cursor,
    entity::{Entity, EntityId, IdAccessor, MakeId},
    error::{Error, Result},
    event::{Change, Trace},
    log::EventLog,
    subscription::{Subscriber, Subscription},
    tx::{TxGuard, TxManager},
};

/// Typed view of one namespace of an [`EventLog`].
///
/// Cloning is cheap; clones share the underlying log.
pub struct Repository<E, Id> {
    log: EventLog,
    namespace: String,
    ids: IdAccessor<E, Id>,
    make_id: Option<MakeId>,
}

impl<E: Entity> Repository<E, E::Id> {
    /// Repository over `E::NAMESPACE`, reading IDs through the [`Entity`]
    /// implementation.
    #[must_use]
    pub fn new(log: &EventLog) -> Self {
        Self::with_accessor(log, E::NAMESPACE, IdAccessor::from_entity())
    }
}

impl<E, Id> Repository<E, Id>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
    Id: EntityId,
{
    /// Repository for types that do not implement [`Entity`].
    #[must_use]
    pub fn with_accessor(log: &EventLog, namespace: impl Into<String>, ids: IdAccessor<E, Id>) -> Self {
        Self {
            log: log.clone(),
            namespace: namespace.into(),
            ids,
            make_id: None,
        }
    }

    #[must_use]
    pub fn with_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = namespace.into();
        self
    }

    /// Overrides the log's ID generator for this repository.
    #[must_use]
    pub fn with_make_id(mut self, make_id: MakeId) -> Self {
        self.make_id = Some(make_id);
        self
    }

    /// Turns on compaction of this repository's namespace.
    ///
    /// Applies to the namespace configured at the time of the call.
    #[must_use]
    pub fn compress_event_log(self) -> Self {
        self.log.compress_event_log(self.namespace.clone());
        self
    }

    #[must_use]
    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    #[must_use]
    pub const fn log(&self) -> &EventLog {
        &self.log
    }

    fn make_id(&self) -> &MakeId {
        self.make_id
            .as_ref()
            .unwrap_or(&self.log.options().make_id)
    }

    fn encode_id(id: &Id) -> Result<serde_json::Value> {
        Ok(serde_json::to_value(id)?)
    }

    /// Stores `entity`, generating and assigning an ID first when it has
    /// none.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyExists`] if the ID is live, [`Error::Cancelled`],
    /// [`Error::TxDone`], or [`Error::Validation`] when the entity or the
    /// generated ID cannot be encoded.
    #[track_caller]
    pub fn create<'a>(
        &'a self,
        ctx: &'a Context,
        entity: &'a mut E,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.create_traced(ctx, entity, Trace::capture())
    }

    #[tracing::instrument(skip_all, fields(namespace = %self.namespace))]
    async fn create_traced(&self, ctx: &Context, entity: &mut E, trace: Trace) -> Result<()> {
        ctx.check()?;
        let id = match self.ids.lookup(entity) {
            Some(id) => id,
            None => {
                let id: Id = self.make_id().generate(ctx)?;
                self.ids.set(entity, id.clone())?;
                id
            }
        };
        let change = Change::Created {
            namespace: self.namespace.clone(),
            id: Self::encode_id(&id)?,
            entity: serde_json::to_value(&*entity)?,
        };
        self.log.append_traced(ctx, change, trace).await?;
        Ok(())
    }

    /// The live entity with `id`, if any.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`], [`Error::TxDone`], or [`Error::Validation`] when
    /// the stored value does not decode as `E`.
    pub async fn find_by_id(&self, ctx: &Context, id: &Id) -> Result<Option<E>> {
        let stored = self.log.lookup(ctx, &self.namespace, &Self::encode_id(id)?)?;
        Ok(stored.map(serde_json::from_value).transpose()?)
    }

    /// Cursor over every live entity in creation order.
    ///
    /// The cursor reads a snapshot taken now; later writes are not seen.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] or [`Error::TxDone`].
    pub async fn find_all(&self, ctx: &Context) -> Result<Cursor<E>> {
        let view = self.log.namespace_view(ctx, &self.namespace)?;
        let entities = view.into_ordered().into_iter().map(|(_, entity)| entity).collect();
        Ok(Cursor::new(ctx.clone(), entities))
    }

    /// Replaces the stored value of a live entity.
    ///
    /// # Errors
    ///
    /// [`Error::IdRequired`] when `entity` has no ID, [`Error::NotFound`]
    /// when it is not live, plus the errors of [`create`](Self::create).
    #[track_caller]
    pub fn update<'a>(
        &'a self,
        ctx: &'a Context,
        entity: &'a E,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.update_traced(ctx, entity, Trace::capture())
    }

    #[tracing::instrument(skip_all, fields(namespace = %self.namespace))]
    async fn update_traced(&self, ctx: &Context, entity: &E, trace: Trace) -> Result<()> {
        ctx.check()?;
        let id = self.ids.lookup(entity).ok_or_else(|| Error::IdRequired {
            namespace: self.namespace.clone(),
        })?;
        let change = Change::Updated {
            namespace: self.namespace.clone(),
            id: Self::encode_id(&id)?,
            entity: serde_json::to_value(entity)?,
        };
        self.log.append_traced(ctx, change, trace).await?;
        Ok(())
    }

    /// Deletes the live entity with `id`.
    ///
    /// # Errors
    ///
    /// [`Error::NotFound`] when it is not live, [`Error::Cancelled`] or
    /// [`Error::TxDone`].
    #[track_caller]
    pub fn delete_by_id<'a>(
        &'a self,
        ctx: &'a Context,
        id: &'a Id,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.delete_by_id_traced(ctx, id, Trace::capture())
    }

    #[tracing::instrument(skip_all, fields(namespace = %self.namespace))]
    async fn delete_by_id_traced(&self, ctx: &Context, id: &Id, trace: Trace) -> Result<()> {
        let change = Change::DeletedById {
            namespace: self.namespace.clone(),
            id: Self::encode_id(id)?,
        };
        self.log.append_traced(ctx, change, trace).await?;
        Ok(())
    }

    /// Deletes every entity in the namespace. Always succeeds on an empty
    /// namespace.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`] or [`Error::TxDone`].
    #[track_caller]
    pub fn delete_all<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        self.delete_all_traced(ctx, Trace::capture())
    }

    #[tracing::instrument(skip_all, fields(namespace = %self.namespace))]
    async fn delete_all_traced(&self, ctx: &Context, trace: Trace) -> Result<()> {
        let change = Change::DeletedAll {
            namespace: self.namespace.clone(),
        };
        self.log.append_traced(ctx, change, trace).await?;
        Ok(())
    }

    /// Deletes every entity and verifies that the namespace is empty
    /// afterwards.
    ///
    /// # Errors
    ///
    /// The errors of [`delete_all`](Self::delete_all), or [`Error::Internal`]
    /// if entities remain visible.
    #[track_caller]
    pub fn purge<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        self.purge_traced(ctx, Trace::capture())
    }

    async fn purge_traced(&self, ctx: &Context, trace: Trace) -> Result<()> {
        self.delete_all_traced(ctx, trace).await?;
        let view = self.log.namespace_view(ctx, &self.namespace)?;
        if !view.is_empty() {
            return Err(Error::internal(format!(
                "{} entities remain in namespace `{}` after purge",
                view.len(),
                self.namespace
            )));
        }
        Ok(())
    }

    /// Subscribes to events of this repository's namespace.
    ///
    /// # Errors
    ///
    /// [`Error::Cancelled`].
    pub async fn subscribe(&self, ctx: &Context, subscriber: Subscriber) -> Result<Subscription> {
        self.log
            .subscribe(ctx, subscriber.namespace(self.namespace.clone()))
            .await
    }

    /// Opens a scoped transaction on the underlying log.
    ///
    /// # Errors
    ///
    /// See [`EventLog::begin`].
    #[track_caller]
    pub fn begin(&self, ctx: &Context) -> Result<TxGuard> {
        self.log.begin(ctx)
    }
}

impl<E, Id> Crud<E> for Repository<E, Id>
where
    E: Serialize + DeserializeOwned + Send + Sync + 'static,
    Id: EntityId,
{
    type Id = Id;

    #[track_caller]
    fn create<'a>(
        &'a self,
        ctx: &'a Context,
        entity: &'a mut E,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.create_traced(ctx, entity, Trace::capture())
    }

    fn find_by_id<'a>(
        &'a self,
        ctx: &'a Context,
        id: &'a Id,
    ) -> impl Future<Output = Result<Option<E>>> + Send + 'a {
        Self::find_by_id(self, ctx, id)
    }

    fn find_all<'a>(
        &'a self,
        ctx: &'a Context,
    ) -> impl Future<Output = Result<Cursor<E>>> + Send + 'a {
        Self::find_all(self, ctx)
    }

    #[track_caller]
    fn update<'a>(&'a self, ctx: &'a Context, entity: &'a E) -> impl Future<Output = Result<()>> + Send + 'a {
        self.update_traced(ctx, entity, Trace::capture())
    }

    #[track_caller]
    fn delete_by_id<'a>(
        &'a self,
        ctx: &'a Context,
        id: &'a Id,
    ) -> impl Future<Output = Result<()>> + Send + 'a {
        self.delete_by_id_traced(ctx, id, Trace::capture())
    }

    #[track_caller]
    fn delete_all<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        self.delete_all_traced(ctx, Trace::capture())
    }

    #[track_caller]
    fn purge<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        self.purge_traced(ctx, Trace::capture())
    }
}

impl<E, Id> TxManager for Repository<E, Id> {
    #[track_caller]
    fn begin_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<Context>> + Send + 'a {
        self.log.begin_tx(ctx)
    }

    #[track_caller]
    fn commit_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        self.log.commit_tx(ctx)
    }

    #[track_caller]
    fn rollback_tx<'a>(&'a self, ctx: &'a Context) -> impl Future<Output = Result<()>> + Send + 'a {
        self.log.rollback_tx(ctx)
    }
}

impl<E, Id> Clone for Repository<E, Id> {
    fn clone(&self) -> Self {
        Self {
            log: self.log.clone(),
            namespace: self.namespace.clone(),
            ids: self.ids.clone(),
            make_id: self.make_id.clone(),
        }
    }
}

impl<E, Id> fmt::Debug for Repository<E, Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Repository")
            .field("namespace", &self.namespace)
            .field("log", &self.log)
            .finish_non_exhaustive()
    }
}
