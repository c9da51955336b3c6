//! Entity identity: extracting, assigning and generating IDs.
//!
//! There are two ways to tell a repository where an entity keeps its ID:
//!
//! - implement [`Entity`], usually with `#[derive(Entity)]`;
//! - hand an [`IdAccessor`] built from a lookup/set closure pair to
//!   [`Repository::with_accessor`](crate::repository::Repository::with_accessor).
//!
//! Whether an ID is *present* is decided by [`IdField`]: an empty `String`,
//! `None`, a zero integer and the nil UUID all count as absent.

use std::{fmt, sync::Arc};

use serde::{Serialize, de::DeserializeOwned};

use crate::{context::Context, error::Result};

/// Bounds every entity ID type satisfies.
pub trait EntityId: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

impl<T> EntityId for T where T: Serialize + DeserializeOwned + Clone + fmt::Debug + Send + Sync + 'static {}

/// A type stored in a [`Repository`](crate::repository::Repository).
///
/// Derivable with `#[derive(Entity)]`:
///
/// ```ignore
/// #[derive(Clone, Serialize, Deserialize, Entity)]
/// #[entity(namespace = "notes")]
/// struct Note {
///     #[entity(id)]
///     key: String,
///     body: String,
/// }
/// ```
pub trait Entity: Serialize + DeserializeOwned + Send + Sync + 'static {
    /// Namespace used by [`Repository::new`](crate::repository::Repository::new).
    const NAMESPACE: &'static str;

    type Id: EntityId;

    /// The entity's ID, or `None` when it has not been assigned yet.
    fn id(&self) -> Option<Self::Id>;

    fn set_id(&mut self, id: Self::Id);
}

/// A field type that can hold an entity ID.
pub trait IdField {
    type Id: EntityId;

    fn get(&self) -> Option<Self::Id>;

    fn set(&mut self, id: Self::Id);
}

impl IdField for String {
    type Id = Self;

    fn get(&self) -> Option<Self::Id> {
        (!self.is_empty()).then(|| self.clone())
    }

    fn set(&mut self, id: Self::Id) {
        *self = id;
    }
}

impl<T: EntityId> IdField for Option<T> {
    type Id = T;

    fn get(&self) -> Option<Self::Id> {
        self.clone()
    }

    fn set(&mut self, id: Self::Id) {
        *self = Some(id);
    }
}

impl IdField for uuid::Uuid {
    type Id = Self;

    fn get(&self) -> Option<Self::Id> {
        (!self.is_nil()).then_some(*self)
    }

    fn set(&mut self, id: Self::Id) {
        *self = id;
    }
}

macro_rules! integer_id_field {
    ($($ty:ty),*) => {
        $(
            impl IdField for $ty {
                type Id = Self;

                fn get(&self) -> Option<Self::Id> {
                    (*self != 0).then_some(*self)
                }

                fn set(&mut self, id: Self::Id) {
                    *self = id;
                }
            }
        )*
    };
}

integer_id_field!(u32, u64, u128, usize, i32, i64, i128);

type LookupFn<E, Id> = dyn Fn(&E) -> Option<Id> + Send + Sync;
type SetFn<E, Id> = dyn Fn(&mut E, Id) -> Result<()> + Send + Sync;

/// A lookup/set pair that reads and writes an entity's ID.
pub struct IdAccessor<E, Id> {
    lookup: Arc<LookupFn<E, Id>>,
    set: Arc<SetFn<E, Id>>,
}

impl<E, Id> IdAccessor<E, Id> {
    pub fn new<L, S>(lookup: L, set: S) -> Self
    where
        L: Fn(&E) -> Option<Id> + Send + Sync + 'static,
        S: Fn(&mut E, Id) -> Result<()> + Send + Sync + 'static,
    {
        Self {
            lookup: Arc::new(lookup),
            set: Arc::new(set),
        }
    }

    #[must_use]
    pub fn lookup(&self, entity: &E) -> Option<Id> {
        (self.lookup)(entity)
    }

    /// Writes `id` into `entity`.
    ///
    /// # Errors
    ///
    /// Whatever the set closure reports.
    pub fn set(&self, entity: &mut E, id: Id) -> Result<()> {
        (self.set)(entity, id)
    }
}

impl<E: Entity> IdAccessor<E, E::Id> {
    /// Accessor backed by the [`Entity`] implementation.
    #[must_use]
    pub fn from_entity() -> Self {
        Self::new(E::id, |entity: &mut E, id| {
            entity.set_id(id);
            Ok(())
        })
    }
}

impl<E, Id> Clone for IdAccessor<E, Id> {
    fn clone(&self) -> Self {
        Self {
            lookup: Arc::clone(&self.lookup),
            set: Arc::clone(&self.set),
        }
    }
}

impl<E, Id> fmt::Debug for IdAccessor<E, Id> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdAccessor").finish_non_exhaustive()
    }
}

type MakeIdFn = dyn Fn(&Context) -> Result<serde_json::Value> + Send + Sync;

/// Produces fresh identifiers for entities created without one.
///
/// The default generator yields a random UUID v4 string. IDs are produced as
/// JSON values and decoded into the repository's ID type, so the default
/// suits `String` and `Uuid` IDs; other ID types need their own generator
/// (see [`MakeId::typed`]).
#[derive(Clone)]
pub struct MakeId(Arc<MakeIdFn>);

impl MakeId {
    pub fn new<F>(make: F) -> Self
    where
        F: Fn(&Context) -> Result<serde_json::Value> + Send + Sync + 'static,
    {
        Self(Arc::new(make))
    }

    /// Generator producing IDs of a concrete type.
    pub fn typed<Id, F>(make: F) -> Self
    where
        Id: Serialize,
        F: Fn(&Context) -> Result<Id> + Send + Sync + 'static,
    {
        Self::new(move |ctx| Ok(serde_json::to_value(make(ctx)?)?))
    }

    /// Generates an ID and decodes it as `Id`.
    ///
    /// # Errors
    ///
    /// Errors from the generator, or
    /// [`Error::Validation`](crate::Error::Validation) when the generated
    /// value is not a valid `Id`.
    pub fn generate<Id: DeserializeOwned>(&self, ctx: &Context) -> Result<Id> {
        let value = (self.0)(ctx)?;
        Ok(serde_json::from_value(value)?)
    }
}

impl Default for MakeId {
    fn default() -> Self {
        Self::new(|_| Ok(serde_json::Value::String(uuid::Uuid::new_v4().to_string())))
    }
}

impl fmt::Debug for MakeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MakeId").finish_non_exhaustive()
    }
}
