//! Metadata attached to a [`Context`] and snapshotted into events.
//!
//! Values are stored as `serde_json::Value`, so every event receives its own
//! copy of the metadata at emission time and subscribers read back what the
//! producer saw, regardless of later changes.
//!
//! ```
//! use memlog_core::{context::Context, meta::MetaKey};
//!
//! const TENANT: MetaKey<String> = MetaKey::new("tenant");
//!
//! let ctx = TENANT.set(&Context::background(), "acme".to_string()).unwrap();
//! assert_eq!(TENANT.lookup(&ctx).unwrap().as_deref(), Some("acme"));
//! ```

use std::{collections::BTreeMap, fmt, marker::PhantomData};

use serde::{Deserialize, Serialize, de::DeserializeOwned};

use crate::{context::Context, error::Result};

/// Snapshot of context metadata.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Metadata(BTreeMap<String, serde_json::Value>);

impl Metadata {
    #[must_use]
    pub fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.0.get(key)
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &serde_json::Value)> {
        self.0.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub(crate) fn insert(&mut self, key: String, value: serde_json::Value) {
        self.0.insert(key, value);
    }
}

/// Attaches `value` under `key`, returning the derived context.
///
/// # Errors
///
/// [`Error::Validation`](crate::Error::Validation) if `value` cannot be
/// serialised.
#[tracing::instrument(skip(ctx, value))]
pub fn set_meta<V: Serialize>(ctx: &Context, key: impl Into<String> + fmt::Debug, value: V) -> Result<Context> {
    let value = serde_json::to_value(value)?;
    let mut meta = ctx.metadata().clone();
    meta.insert(key.into(), value);
    Ok(ctx.with_metadata(meta))
}

/// Reads the value stored under `key`.
///
/// Returns `Ok(None)` when nothing was set for the key.
///
/// # Errors
///
/// [`Error::Validation`](crate::Error::Validation) if the stored value does
/// not decode as `V`.
pub fn lookup_meta<V: DeserializeOwned>(ctx: &Context, key: &str) -> Result<Option<V>> {
    ctx.metadata()
        .get(key)
        .map(|value| serde_json::from_value(value.clone()))
        .transpose()
        .map_err(Into::into)
}

/// A typed metadata key.
pub struct MetaKey<V> {
    name: &'static str,
    _value: PhantomData<fn() -> V>,
}

impl<V> MetaKey<V> {
    #[must_use]
    pub const fn new(name: &'static str) -> Self {
        Self {
            name,
            _value: PhantomData,
        }
    }

    #[must_use]
    pub const fn name(&self) -> &'static str {
        self.name
    }
}

impl<V: Serialize + DeserializeOwned> MetaKey<V> {
    /// See [`set_meta`].
    ///
    /// # Errors
    ///
    /// Propagates [`set_meta`] errors.
    pub fn set(&self, ctx: &Context, value: V) -> Result<Context> {
        set_meta(ctx, self.name, value)
    }

    /// See [`lookup_meta`].
    ///
    /// # Errors
    ///
    /// Propagates [`lookup_meta`] errors.
    pub fn lookup(&self, ctx: &Context) -> Result<Option<V>> {
        lookup_meta(ctx, self.name)
    }
}

impl<V> Clone for MetaKey<V> {
    fn clone(&self) -> Self {
        *self
    }
}

impl<V> Copy for MetaKey<V> {}

impl<V> fmt::Debug for MetaKey<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("MetaKey").field(&self.name).finish()
    }
}
