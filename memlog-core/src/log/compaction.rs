//! Per-namespace log compaction.
//!
//! Compaction replaces the events of one namespace with a single `Created`
//! per live entity. The replacement carries the entity's latest value and
//! takes the place of the entity's last `Created`, so replaying the
//! compacted log yields the same view in the same order. Transaction markers
//! left without any event of their transaction are dropped and the log is
//! renumbered densely.

use std::collections::{HashMap, HashSet};

use super::{Inner, projection::key_of};
use crate::event::{Change, StoredEvent};

/// Outcome of compacting one namespace.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CompactionStats {
    pub namespace: String,
    /// Events removed from the log, markers included.
    pub removed: usize,
    /// Events of the namespace left after compaction.
    pub retained: usize,
}

pub(super) fn compact(inner: &mut Inner, namespace: &str) -> CompactionStats {
    let before = inner.events.len();
    let live = inner.projection.snapshot(namespace);

    let mut last_created: HashMap<String, usize> = HashMap::new();
    for (index, event) in inner.events.iter().enumerate() {
        if let Change::Created { namespace: ns, id, .. } = &event.change
            && ns == namespace
        {
            last_created.insert(key_of(id), index);
        }
    }
    let mut keep_at: HashMap<usize, serde_json::Value> = last_created
        .into_iter()
        .filter_map(|(key, index)| live.get(&key).map(|entity| (index, entity.clone())))
        .collect();

    let mut retained = 0;
    let mut compacted = Vec::with_capacity(inner.events.len());
    for (index, event) in std::mem::take(&mut inner.events).into_iter().enumerate() {
        if event.namespace() != Some(namespace) {
            compacted.push(event);
            continue;
        }
        let Some(entity) = keep_at.remove(&index) else {
            continue;
        };
        let Change::Created { namespace, id, .. } = event.change else {
            continue;
        };
        retained += 1;
        compacted.push(StoredEvent {
            change: Change::Created {
                namespace,
                id,
                entity,
            },
            ..event
        });
    }

    let referenced: HashSet<_> = compacted
        .iter()
        .filter(|event| !event.kind().is_tx_marker())
        .filter_map(|event| event.tx)
        .collect();
    compacted.retain(|event| match &event.change {
        Change::TxBegin { tx } | Change::TxCommit { tx } | Change::TxRollback { tx } => {
            referenced.contains(tx)
        }
        _ => true,
    });

    for (seq, event) in (1..).zip(compacted.iter_mut()) {
        event.seq = seq;
    }
    inner.next_seq = compacted.len() as u64 + 1;
    inner.events = compacted;

    let stats = CompactionStats {
        namespace: namespace.to_owned(),
        removed: before - inner.events.len(),
        retained,
    };
    tracing::debug!(
        namespace,
        removed = stats.removed,
        retained = stats.retained,
        "namespace compacted"
    );
    stats
}
