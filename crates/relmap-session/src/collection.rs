//! Collection adapters for collection-valued relationships.
//!
//! A relationship's container is chosen when the mapper is configured
//! ([`CollectionKind`]) and accessed only through the [`CollectionAdapter`]
//! capability set, so attribute instrumentation does not care whether the
//! members live in a list, a set or a keyed dictionary.

use std::collections::BTreeMap;
use std::fmt;

use relmap_core::{CollectionKind, KeyFunction, Result, Value};

use crate::state::Instance;

/// Result of adding a member to a collection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AddOutcome {
    /// The member was not present and has been added.
    Added,
    /// The member was already present; nothing changed.
    Present,
    /// The member was added under a key previously held by another member,
    /// which has been evicted.
    Replaced(Instance),
}

/// Capabilities every collection container provides.
pub trait CollectionAdapter {
    fn add(&mut self, item: Instance) -> Result<AddOutcome>;

    /// Remove a member; `false` if it was not present.
    fn remove(&mut self, item: &Instance) -> bool;

    fn contains(&self, item: &Instance) -> bool;

    /// Members in iteration order.
    fn items(&self) -> Vec<Instance>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Look up a member by key (keyed collections only).
    fn get(&self, _key: &Value) -> Option<Instance> {
        None
    }
}

impl fmt::Debug for dyn CollectionAdapter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.items()).finish()
    }
}

/// Build an empty container for the given collection kind.
pub fn adapter_for(kind: &CollectionKind) -> Box<dyn CollectionAdapter> {
    match kind {
        CollectionKind::List => Box::new(ListCollection::default()),
        CollectionKind::Set => Box::new(SetCollection::default()),
        CollectionKind::Keyed(key_fn) => Box::new(KeyedCollection::new(key_fn.clone())),
    }
}

/// Ordered collection; adding a member twice is a no-op.
#[derive(Debug, Default)]
pub struct ListCollection {
    items: Vec<Instance>,
}

impl CollectionAdapter for ListCollection {
    fn add(&mut self, item: Instance) -> Result<AddOutcome> {
        if self.items.contains(&item) {
            return Ok(AddOutcome::Present);
        }
        self.items.push(item);
        Ok(AddOutcome::Added)
    }

    fn remove(&mut self, item: &Instance) -> bool {
        match self.items.iter().position(|i| i == item) {
            Some(pos) => {
                self.items.remove(pos);
                true
            }
            None => false,
        }
    }

    fn contains(&self, item: &Instance) -> bool {
        self.items.contains(item)
    }

    fn items(&self) -> Vec<Instance> {
        self.items.clone()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Unordered collection of unique members, iterated by instance id.
#[derive(Debug, Default)]
pub struct SetCollection {
    items: BTreeMap<u64, Instance>,
}

impl CollectionAdapter for SetCollection {
    fn add(&mut self, item: Instance) -> Result<AddOutcome> {
        if self.items.contains_key(&item.id()) {
            return Ok(AddOutcome::Present);
        }
        self.items.insert(item.id(), item);
        Ok(AddOutcome::Added)
    }

    fn remove(&mut self, item: &Instance) -> bool {
        self.items.remove(&item.id()).is_some()
    }

    fn contains(&self, item: &Instance) -> bool {
        self.items.contains_key(&item.id())
    }

    fn items(&self) -> Vec<Instance> {
        self.items.values().cloned().collect()
    }

    fn len(&self) -> usize {
        self.items.len()
    }
}

/// Dictionary collection keyed by a function of the member.
///
/// The key is computed once, when the member is added. Changing the keyed
/// attribute of a member afterwards does not move it: it stays reachable
/// under its original key until it is removed and added again.
#[derive(Debug)]
pub struct KeyedCollection {
    key_fn: KeyFunction,
    entries: Vec<(Value, Instance)>,
}

impl KeyedCollection {
    pub fn new(key_fn: KeyFunction) -> Self {
        Self {
            key_fn,
            entries: Vec::new(),
        }
    }

    /// Key a member would be stored under if added now.
    pub fn key_of(&self, item: &Instance) -> Result<Value> {
        let st = item.state()?;
        let lookup = |col: &str| st.values.get(col).cloned().unwrap_or(Value::Null);
        Ok(match &self.key_fn {
            KeyFunction::Column(col) => lookup(col),
            KeyFunction::Columns(cols) => Value::Array(cols.iter().map(|c| lookup(c)).collect()),
        })
    }

    /// Key a present member was stored under.
    pub fn stored_key(&self, item: &Instance) -> Option<&Value> {
        self.entries.iter().find(|(_, i)| i == item).map(|(k, _)| k)
    }
}

impl CollectionAdapter for KeyedCollection {
    fn add(&mut self, item: Instance) -> Result<AddOutcome> {
        if self.entries.iter().any(|(_, i)| *i == item) {
            return Ok(AddOutcome::Present);
        }
        let key = self.key_of(&item)?;
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => {
                let evicted = std::mem::replace(&mut entry.1, item);
                Ok(AddOutcome::Replaced(evicted))
            }
            None => {
                self.entries.push((key, item));
                Ok(AddOutcome::Added)
            }
        }
    }

    fn remove(&mut self, item: &Instance) -> bool {
        match self.entries.iter().position(|(_, i)| i == item) {
            Some(pos) => {
                self.entries.remove(pos);
                true
            }
            None => false,
        }
    }

    fn contains(&self, item: &Instance) -> bool {
        self.entries.iter().any(|(_, i)| i == item)
    }

    fn items(&self) -> Vec<Instance> {
        self.entries.iter().map(|(_, i)| i.clone()).collect()
    }

    fn len(&self) -> usize {
        self.entries.len()
    }

    fn get(&self, key: &Value) -> Option<Instance> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, i)| i.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{ColumnInfo, EntityMapper};
    use std::sync::Arc;

    fn keyword_mapper() -> Arc<EntityMapper> {
        Arc::new(
            EntityMapper::new("Keyword", "keywords")
                .column(ColumnInfo::new("id").primary_key())
                .column(ColumnInfo::new("word"))
                .column(ColumnInfo::new("lang")),
        )
    }

    fn keyword(mapper: &Arc<EntityMapper>, word: &str) -> Instance {
        let inst = Instance::new(Arc::clone(mapper));
        inst.set("word", word).unwrap();
        inst
    }

    #[test]
    fn test_list_ignores_duplicates_and_keeps_order() {
        let mapper = keyword_mapper();
        let (a, b) = (keyword(&mapper, "a"), keyword(&mapper, "b"));
        let mut list = ListCollection::default();
        assert_eq!(list.add(b.clone()).unwrap(), AddOutcome::Added);
        assert_eq!(list.add(a.clone()).unwrap(), AddOutcome::Added);
        assert_eq!(list.add(b.clone()).unwrap(), AddOutcome::Present);
        assert_eq!(list.items(), vec![b.clone(), a.clone()]);
        assert!(list.remove(&b));
        assert!(!list.remove(&b));
        assert_eq!(list.len(), 1);
    }

    #[test]
    fn test_set_iterates_by_creation() {
        let mapper = keyword_mapper();
        let (a, b) = (keyword(&mapper, "a"), keyword(&mapper, "b"));
        let mut set = SetCollection::default();
        set.add(b.clone()).unwrap();
        set.add(a.clone()).unwrap();
        assert_eq!(set.items(), vec![a.clone(), b.clone()]);
        assert!(set.contains(&a));
    }

    #[test]
    fn test_keyed_key_computed_at_insertion_only() {
        let mapper = keyword_mapper();
        let a = keyword(&mapper, "rust");
        let mut keyed = KeyedCollection::new(KeyFunction::Column("word".into()));
        keyed.add(a.clone()).unwrap();

        a.set("word", "ferris").unwrap();

        assert_eq!(keyed.get(&Value::from("rust")), Some(a.clone()));
        assert_eq!(keyed.get(&Value::from("ferris")), None);
        assert_eq!(keyed.stored_key(&a), Some(&Value::from("rust")));
        assert!(keyed.remove(&a));
        assert!(keyed.is_empty());
    }

    #[test]
    fn test_keyed_replaces_member_with_same_key() {
        let mapper = keyword_mapper();
        let (a, b) = (keyword(&mapper, "x"), keyword(&mapper, "x"));
        let mut keyed = KeyedCollection::new(KeyFunction::Column("word".into()));
        keyed.add(a.clone()).unwrap();
        assert_eq!(keyed.add(b.clone()).unwrap(), AddOutcome::Replaced(a.clone()));
        assert_eq!(keyed.items(), vec![b]);
    }

    #[test]
    fn test_keyed_composite_key() {
        let mapper = keyword_mapper();
        let a = keyword(&mapper, "hola");
        a.set("lang", "es").unwrap();
        let mut keyed =
            KeyedCollection::new(KeyFunction::Columns(vec!["lang".into(), "word".into()]));
        keyed.add(a.clone()).unwrap();
        let key = Value::Array(vec![Value::from("es"), Value::from("hola")]);
        assert_eq!(keyed.get(&key), Some(a));
    }

    #[test]
    fn test_adapter_for_kind() {
        let keyed = adapter_for(&CollectionKind::Keyed(KeyFunction::Column("word".into())));
        assert!(keyed.is_empty());
        let list = adapter_for(&CollectionKind::List);
        assert_eq!(list.len(), 0);
    }
}
