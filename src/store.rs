//! In-memory mirror of every observed `IngressGroup`, keyed by namespace and name.
//!
//! The list-watch task owns the single [`Writer`]. Any number of [`Store`]
//! readers can be cloned off it and queried from other tasks; they only ever
//! see immutable [`Snapshot`]s, never the live entry.

use std::{
    collections::{hash_map, HashMap, HashSet},
    sync::Arc,
};

use parking_lot::RwLock;

use crate::resource::{IngressGroup, QualifiedName};

/// A read-only copy of one cached instance.
pub type Snapshot = Arc<IngressGroup>;

/// A state change of one identity, as observed by the cache.
#[derive(Debug, Clone, PartialEq)]
pub enum Transition {
    Added(Snapshot),
    Updated { prior: Snapshot, current: Snapshot },
    Deleted(Snapshot),
}

impl Transition {
    /// The snapshot describing the identity after the transition,
    /// or its last known state for deletions.
    pub fn object(&self) -> &IngressGroup {
        match self {
            Transition::Added(obj) | Transition::Deleted(obj) => obj,
            Transition::Updated { current, .. } => current,
        }
    }
}

/// A single mutation requested by the watch stream.
#[derive(Debug, Clone)]
pub enum Change {
    Upsert(IngressGroup),
    Remove(QualifiedName),
}

/// Cloneable read handle to the cache.
#[derive(Debug, Clone, Default)]
pub struct Store {
    entries: Arc<RwLock<HashMap<QualifiedName, Snapshot>>>,
}

impl Store {
    pub fn get(&self, key: &QualifiedName) -> Option<Snapshot> {
        self.entries.read().get(key).cloned()
    }

    /// All cached instances, ordered by key.
    pub fn list(&self) -> Vec<Snapshot> {
        let entries = self.entries.read();
        let mut keys: Vec<_> = entries.keys().collect();
        keys.sort();
        keys.into_iter().map(|key| Arc::clone(&entries[key])).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// Exclusive write handle to the cache.
#[derive(Debug, Default)]
pub struct Writer {
    store: Store,
}

impl Writer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn as_reader(&self) -> Store {
        self.store.clone()
    }

    /// Applies one change and reports the resulting transition.
    ///
    /// Returns `None` when the change is already reflected in the cache,
    /// e.g. a redelivered event for a resource version already applied,
    /// or a removal of an identity that was never seen.
    pub fn apply(&mut self, change: Change) -> Option<Transition> {
        let mut entries = self.store.entries.write();
        match change {
            Change::Upsert(obj) => {
                let key = QualifiedName::from_resource(&obj)?;
                match entries.entry(key) {
                    hash_map::Entry::Vacant(entry) => {
                        let current = Arc::new(obj);
                        entry.insert(Arc::clone(&current));
                        Some(Transition::Added(current))
                    }
                    hash_map::Entry::Occupied(mut entry) => {
                        if is_current(entry.get(), &obj) {
                            return None;
                        }
                        let current = Arc::new(obj);
                        let prior = entry.insert(Arc::clone(&current));
                        Some(Transition::Updated { prior, current })
                    }
                }
            }
            Change::Remove(key) => entries.remove(&key).map(Transition::Deleted),
        }
    }

    /// Replaces the cache content with a fresh listing.
    ///
    /// Identities missing from `items` become deletions, changed ones updates
    /// and unseen ones additions. Keys in `retain` were listed but could not be
    /// decoded; their cached entries are kept as they are.
    pub fn reconcile(
        &mut self,
        items: Vec<IngressGroup>,
        retain: &HashSet<QualifiedName>,
    ) -> Vec<Transition> {
        let mut entries = self.store.entries.write();
        let mut previous = std::mem::take(&mut *entries);
        let mut transitions = Vec::new();

        for obj in items {
            let Some(key) = QualifiedName::from_resource(&obj) else {
                continue;
            };
            let prior = previous.remove(&key).or_else(|| entries.get(&key).cloned());
            match prior {
                Some(prior) if is_current(&prior, &obj) => {
                    entries.insert(key, prior);
                }
                Some(prior) => {
                    let current = Arc::new(obj);
                    entries.insert(key, Arc::clone(&current));
                    transitions.push(Transition::Updated { prior, current });
                }
                None => {
                    let current = Arc::new(obj);
                    entries.insert(key, Arc::clone(&current));
                    transitions.push(Transition::Added(current));
                }
            }
        }

        for key in retain {
            if let Some(prior) = previous.remove(key) {
                entries.insert(key.clone(), prior);
            }
        }

        let mut removed: Vec<_> = previous.into_iter().collect();
        removed.sort_by(|(a, _), (b, _)| a.cmp(b));
        transitions.extend(removed.into_iter().map(|(_, prior)| Transition::Deleted(prior)));

        transitions
    }
}

fn is_current(cached: &IngressGroup, incoming: &IngressGroup) -> bool {
    match (cached.resource_version(), incoming.resource_version()) {
        (Some(cached), Some(incoming)) => cached == incoming,
        _ => cached == incoming,
    }
}
