//! Replaying events into per-namespace entity views.

use std::collections::HashMap;

use crate::{
    error::{Error, Result},
    event::Change,
};

/// Key an entity ID is indexed under: its canonical JSON text.
pub(crate) fn key_of(id: &serde_json::Value) -> String {
    id.to_string()
}

#[derive(Debug, Clone)]
struct Entry {
    id: serde_json::Value,
    entity: serde_json::Value,
    order: u64,
}

/// Live entities of one namespace.
///
/// `order` is taken from a counter bumped on every `Created`, so sorting by it
/// yields the position of each ID's last creation.
#[derive(Debug, Clone, Default)]
pub(crate) struct NamespaceView {
    entries: HashMap<String, Entry>,
    next_order: u64,
}

impl NamespaceView {
    pub(crate) fn apply(&mut self, change: &Change) {
        match change {
            Change::Created { id, entity, .. } => {
                let order = self.next_order;
                self.next_order += 1;
                self.entries.insert(
                    key_of(id),
                    Entry {
                        id: id.clone(),
                        entity: entity.clone(),
                        order,
                    },
                );
            }
            Change::Updated { id, entity, .. } => {
                if let Some(entry) = self.entries.get_mut(&key_of(id)) {
                    entry.entity = entity.clone();
                }
            }
            Change::DeletedById { id, .. } => {
                self.entries.remove(&key_of(id));
            }
            Change::DeletedAll { .. } => self.entries.clear(),
            Change::TxBegin { .. } | Change::TxCommit { .. } | Change::TxRollback { .. } => {}
        }
    }

    /// Checks that `change` is applicable: `Created` needs an absent ID,
    /// `Updated` and `DeletedById` a live one.
    pub(crate) fn check(&self, change: &Change) -> Result<()> {
        let (Some(namespace), Some(id)) = (change.namespace(), change.id()) else {
            return Ok(());
        };
        let live = self.contains(&key_of(id));
        match change {
            Change::Created { .. } if live => Err(Error::AlreadyExists {
                namespace: namespace.to_owned(),
                id: key_of(id),
            }),
            Change::Updated { .. } | Change::DeletedById { .. } if !live => Err(Error::NotFound {
                namespace: namespace.to_owned(),
                id: key_of(id),
            }),
            _ => Ok(()),
        }
    }

    pub(crate) fn get(&self, key: &str) -> Option<&serde_json::Value> {
        self.entries.get(key).map(|entry| &entry.entity)
    }

    pub(crate) fn contains(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// `(id, entity)` pairs in creation order.
    pub(crate) fn into_ordered(self) -> Vec<(serde_json::Value, serde_json::Value)> {
        let mut entries: Vec<Entry> = self.entries.into_values().collect();
        entries.sort_by_key(|entry| entry.order);
        entries
            .into_iter()
            .map(|entry| (entry.id, entry.entity))
            .collect()
    }
}

/// Views of every namespace, maintained as events are published.
#[derive(Debug, Default)]
pub(crate) struct Projection {
    namespaces: HashMap<String, NamespaceView>,
}

impl Projection {
    pub(crate) fn apply(&mut self, change: &Change) {
        if let Some(namespace) = change.namespace() {
            self.namespaces
                .entry(namespace.to_owned())
                .or_default()
                .apply(change);
        }
    }

    pub(crate) fn namespace(&self, namespace: &str) -> Option<&NamespaceView> {
        self.namespaces.get(namespace)
    }

    /// Owned copy of a namespace view, empty when the namespace is unknown.
    pub(crate) fn snapshot(&self, namespace: &str) -> NamespaceView {
        self.namespace(namespace).cloned().unwrap_or_default()
    }
}

/// Validates and applies `changes` in order on top of views produced by
/// `base`, one per namespace touched.
pub(crate) fn replay_checked<'a, F>(
    changes: impl IntoIterator<Item = &'a Change>,
    mut base: F,
) -> Result<HashMap<String, NamespaceView>>
where
    F: FnMut(&str) -> NamespaceView,
{
    let mut views: HashMap<String, NamespaceView> = HashMap::new();
    for change in changes {
        let Some(namespace) = change.namespace() else {
            continue;
        };
        let view = views
            .entry(namespace.to_owned())
            .or_insert_with(|| base(namespace));
        view.check(change)?;
        view.apply(change);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;
    use crate::error::ErrorKind;

    fn created(id: &str, title: &str) -> Change {
        Change::Created {
            namespace: "note".into(),
            id: json!(id),
            entity: json!({ "id": id, "title": title }),
        }
    }

    fn updated(id: &str, title: &str) -> Change {
        Change::Updated {
            namespace: "note".into(),
            id: json!(id),
            entity: json!({ "id": id, "title": title }),
        }
    }

    fn deleted(id: &str) -> Change {
        Change::DeletedById {
            namespace: "note".into(),
            id: json!(id),
        }
    }

    fn ids(view: NamespaceView) -> Vec<serde_json::Value> {
        view.into_ordered().into_iter().map(|(id, _)| id).collect()
    }

    #[test]
    fn replay_keeps_latest_value_in_creation_order() {
        let mut view = NamespaceView::default();
        for change in [
            created("a", "1"),
            created("b", "1"),
            updated("a", "2"),
        ] {
            view.apply(&change);
        }

        assert_eq!(view.get(&key_of(&json!("a"))).unwrap()["title"], "2");
        assert_eq!(ids(view), vec![json!("a"), json!("b")]);
    }

    #[test]
    fn recreating_moves_entity_to_the_end() {
        let mut view = NamespaceView::default();
        for change in [created("a", "1"), created("b", "1"), deleted("a"), created("a", "3")] {
            view.apply(&change);
        }
        assert_eq!(ids(view), vec![json!("b"), json!("a")]);
    }

    #[test]
    fn delete_all_clears_namespace_only() {
        let mut projection = Projection::default();
        projection.apply(&created("a", "1"));
        projection.apply(&Change::Created {
            namespace: "todo".into(),
            id: json!("a"),
            entity: json!({}),
        });
        projection.apply(&Change::DeletedAll {
            namespace: "note".into(),
        });

        assert!(projection.snapshot("note").is_empty());
        assert_eq!(projection.snapshot("todo").len(), 1);
    }

    #[test]
    fn check_enforces_liveness() {
        let mut view = NamespaceView::default();
        assert_eq!(
            view.check(&updated("a", "1")).unwrap_err().kind(),
            ErrorKind::NotFound
        );
        assert_eq!(
            view.check(&deleted("a")).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        view.apply(&created("a", "1"));
        assert_eq!(
            view.check(&created("a", "2")).unwrap_err().kind(),
            ErrorKind::AlreadyExists
        );
        assert!(view.check(&updated("a", "2")).is_ok());
    }

    #[test]
    fn replay_checked_stops_at_first_invalid_change() {
        let changes = [created("a", "1"), deleted("a"), deleted("a")];
        let err = replay_checked(&changes, |_| NamespaceView::default()).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);

        let changes = [created("a", "1"), deleted("a"), created("a", "2")];
        let views = replay_checked(&changes, |_| NamespaceView::default()).unwrap();
        assert!(views["note"].contains(&key_of(&json!("a"))));
    }
}
