//! Identity map: at most one live instance per identity key.
//!
//! The map is the session's registry of persistent objects. Looking up a
//! key always yields the same [`Instance`], so changes made through one
//! handle are visible through every other.
//!
//! Entries are either strong (the map keeps the object alive) or weak (the
//! object lives as long as user code holds it, and dead entries are pruned
//! lazily). Which one is used is fixed when the map is created.

use std::collections::HashMap;

use relmap_core::{Error, IdentityConflict, IdentityKey, Result};
use serde::Serialize;

use crate::state::{Instance, WeakInstance};

/// A change in identity-map membership.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum IdentityEvent {
    Attached(IdentityKey),
    Detached(IdentityKey),
}

#[derive(Debug, Clone)]
enum Entry {
    Strong(Instance),
    Weak(WeakInstance),
}

impl Entry {
    fn get(&self) -> Option<Instance> {
        match self {
            Entry::Strong(inst) => Some(inst.clone()),
            Entry::Weak(weak) => weak.upgrade(),
        }
    }
}

/// Identity map keyed by [`IdentityKey`].
#[derive(Debug, Default)]
pub struct IdentityMap {
    entries: HashMap<IdentityKey, Entry>,
    weak: bool,
    events: Vec<IdentityEvent>,
}

impl IdentityMap {
    /// Map holding strong references.
    pub fn new() -> Self {
        Self::default()
    }

    /// Map holding weak references.
    pub fn weak() -> Self {
        Self {
            weak: true,
            ..Self::default()
        }
    }

    pub fn is_weak(&self) -> bool {
        self.weak
    }

    /// Live instance for `key`.
    pub fn get(&self, key: &IdentityKey) -> Option<Instance> {
        self.entries.get(key).and_then(Entry::get)
    }

    pub fn contains_key(&self, key: &IdentityKey) -> bool {
        self.get(key).is_some()
    }

    /// Register `instance` under `key`.
    ///
    /// Re-inserting the same instance is a no-op. A different live instance
    /// already holding the key is a [`Error::DuplicateIdentity`].
    pub fn insert(&mut self, key: IdentityKey, instance: &Instance) -> Result<()> {
        if self.weak {
            self.prune();
        }
        if let Some(existing) = self.get(&key) {
            if existing == *instance {
                return Ok(());
            }
            return Err(Error::DuplicateIdentity(IdentityConflict { key }));
        }
        let entry = if self.weak {
            Entry::Weak(instance.downgrade())
        } else {
            Entry::Strong(instance.clone())
        };
        tracing::trace!(key = %key, "identity attached");
        self.events.push(IdentityEvent::Attached(key.clone()));
        self.entries.insert(key, entry);
        Ok(())
    }

    /// Remove `key` if it is held by `instance` (or by a dropped instance).
    ///
    /// Returns whether an entry was removed.
    pub fn remove(&mut self, key: &IdentityKey, instance: &Instance) -> bool {
        let held_by_other = self
            .entries
            .get(key)
            .and_then(Entry::get)
            .is_some_and(|existing| existing != *instance);
        if held_by_other || self.entries.remove(key).is_none() {
            return false;
        }
        tracing::trace!(key = %key, "identity detached");
        self.events.push(IdentityEvent::Detached(key.clone()));
        true
    }

    /// All live instances, in creation order. Dead weak entries are pruned.
    pub fn all(&mut self) -> Vec<Instance> {
        self.prune();
        let mut all: Vec<Instance> = self.entries.values().filter_map(Entry::get).collect();
        all.sort_by_key(Instance::id);
        all
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.entries.values().filter(|e| e.get().is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop entries whose instance has been dropped, recording a detach
    /// for each. Returns how many.
    pub fn prune(&mut self) -> usize {
        let mut dead: Vec<IdentityKey> = self
            .entries
            .iter()
            .filter(|(_, e)| e.get().is_none())
            .map(|(k, _)| k.clone())
            .collect();
        if dead.is_empty() {
            return 0;
        }
        dead.sort_by_key(ToString::to_string);
        for key in &dead {
            self.entries.remove(key);
            tracing::trace!(key = %key, "identity pruned");
        }
        let count = dead.len();
        self.events.extend(dead.into_iter().map(IdentityEvent::Detached));
        count
    }

    /// Take the membership events recorded since the last call.
    pub fn drain_events(&mut self) -> Vec<IdentityEvent> {
        std::mem::take(&mut self.events)
    }

    /// Remove every entry, recording a detach for each live one.
    pub fn clear(&mut self) {
        let mut keys: Vec<(u64, IdentityKey)> = self
            .entries
            .iter()
            .filter_map(|(k, e)| e.get().map(|i| (i.id(), k.clone())))
            .collect();
        keys.sort_by_key(|(id, _)| *id);
        self.events
            .extend(keys.into_iter().map(|(_, k)| IdentityEvent::Detached(k)));
        self.entries.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{ColumnInfo, EntityMapper, Value};
    use std::sync::Arc;

    fn mapper() -> Arc<EntityMapper> {
        Arc::new(EntityMapper::new("Hero", "heroes").column(ColumnInfo::new("id").primary_key()))
    }

    fn key(id: i64) -> IdentityKey {
        IdentityKey::new("Hero", vec![Value::BigInt(id)])
    }

    #[test]
    fn test_insert_and_get_same_instance() {
        let mut map = IdentityMap::new();
        let hero = Instance::new(mapper());
        map.insert(key(1), &hero).unwrap();
        assert_eq!(map.get(&key(1)), Some(hero.clone()));
        map.insert(key(1), &hero).unwrap();
        assert_eq!(map.len(), 1);
        assert_eq!(
            map.drain_events(),
            vec![IdentityEvent::Attached(key(1))]
        );
    }

    #[test]
    fn test_duplicate_identity_rejected() {
        let mut map = IdentityMap::new();
        let m = mapper();
        let a = Instance::new(Arc::clone(&m));
        let b = Instance::new(m);
        map.insert(key(1), &a).unwrap();
        let err = map.insert(key(1), &b).unwrap_err();
        assert!(matches!(err, Error::DuplicateIdentity(ref c) if c.key == key(1)));
        assert_eq!(map.get(&key(1)), Some(a));
    }

    #[test]
    fn test_remove_only_by_holder() {
        let mut map = IdentityMap::new();
        let m = mapper();
        let a = Instance::new(Arc::clone(&m));
        let b = Instance::new(m);
        map.insert(key(1), &a).unwrap();
        assert!(!map.remove(&key(1), &b));
        assert!(map.remove(&key(1), &a));
        assert!(map.is_empty());
    }

    #[test]
    fn test_weak_entries_die_with_instance() {
        let mut map = IdentityMap::weak();
        let hero = Instance::new(mapper());
        map.insert(key(7), &hero).unwrap();
        assert!(map.contains_key(&key(7)));
        drop(hero);
        assert!(map.get(&key(7)).is_none());
        map.drain_events();
        assert_eq!(map.prune(), 1);
        assert_eq!(map.drain_events(), vec![IdentityEvent::Detached(key(7))]);
        assert_eq!(map.prune(), 0);

        // A dead entry does not block a new holder.
        let other = Instance::new(mapper());
        map.insert(key(7), &other).unwrap();
        assert_eq!(map.get(&key(7)), Some(other));
    }

    #[test]
    fn test_all_in_creation_order() {
        let mut map = IdentityMap::new();
        let m = mapper();
        let a = Instance::new(Arc::clone(&m));
        let b = Instance::new(m);
        map.insert(key(2), &b).unwrap();
        map.insert(key(1), &a).unwrap();
        assert_eq!(map.all(), vec![a, b]);
        map.drain_events();
        map.clear();
        assert_eq!(
            map.drain_events(),
            vec![IdentityEvent::Detached(key(1)), IdentityEvent::Detached(key(2))]
        );
    }

    #[test]
    fn test_insert_and_all_prune_dead_weak_entries() {
        let mut map = IdentityMap::weak();
        let keep = Instance::new(mapper());
        map.insert(key(1), &keep).unwrap();
        for id in 2..5 {
            let gone = Instance::new(mapper());
            map.insert(key(id), &gone).unwrap();
        }
        // Each insert pruned the entry dropped on the previous iteration.
        assert_eq!(map.entries.len(), 2);
        map.drain_events();
        assert_eq!(map.all(), vec![keep.clone()]);
        assert_eq!(map.entries.len(), 1);
        assert_eq!(map.drain_events(), vec![IdentityEvent::Detached(key(4))]);

        let gone = Instance::new(mapper());
        map.insert(key(9), &gone).unwrap();
        drop(gone);
        let next = Instance::new(mapper());
        map.insert(key(10), &next).unwrap();
        assert_eq!(
            map.drain_events(),
            vec![
                IdentityEvent::Attached(key(9)),
                IdentityEvent::Detached(key(9)),
                IdentityEvent::Attached(key(10)),
            ]
        );
    }
}
