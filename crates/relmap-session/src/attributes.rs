//! Instrumented attribute access.
//!
//! Every mutation of a mapped attribute goes through [`Instance`] methods
//! defined here. Before a mutation returns it has recorded its history,
//! updated the paired back-reference on the other object, maintained
//! delete-orphan parent counts and run the save-update cascade.

use relmap_core::{Error, RelationshipInfo, Result, SchemaErrorKind, Value};

use crate::collection::AddOutcome;
use crate::history::{self, AttributeHistory};
use crate::loading::relation_label;
use crate::state::{AttrGuard, Instance, InstanceStatus, RelationHistory, RelationValue};

/// Who started a relationship mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Initiator {
    /// Application code.
    Direct,
    /// The paired back-reference of another mutation.
    Backref,
}

impl Instance {
    // ========================================================================
    // Scalars
    // ========================================================================

    /// Current value of a column attribute, reloading it first if expired.
    ///
    /// Unset attributes read as NULL.
    pub fn get(&self, column: &str) -> Result<Value> {
        self.check_column(column)?;
        self.ensure_attribute(column)?;
        Ok(self
            .state()?
            .values
            .get(column)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Set a column attribute.
    ///
    /// Changing the primary key of an instance that already has an identity
    /// is rejected.
    pub fn set(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        self.check_column(column)?;
        let core = self.session_core();
        if let Some(core) = &core {
            core.check_not_flushing()?;
        }
        let value = value.into();
        {
            let mut st = self.state_mut()?;
            if let Some(key) = &st.key {
                let current = self
                    .mapper()
                    .primary_key()
                    .position(|c| c == column)
                    .and_then(|pos| key.primary_key.get(pos));
                if current.is_some_and(|v| *v != value) {
                    return Err(Error::invalid_request(format!(
                        "cannot change primary key column '{column}' of persistent instance {key}"
                    )));
                }
            }
            st.expired.remove(column);
            st.values.insert(column.to_string(), value);
        }
        if let Some(core) = core {
            core.mark_modified(self)?;
        }
        Ok(())
    }

    /// Set a column attribute as if it had been loaded: the value becomes
    /// both current and committed, so it records no history and is not
    /// written at the next flush.
    pub fn set_committed_value(&self, column: &str, value: impl Into<Value>) -> Result<()> {
        self.check_column(column)?;
        if let Some(core) = self.session_core() {
            core.check_not_flushing()?;
        }
        let value = value.into();
        let mut st = self.state_mut()?;
        st.expired.remove(column);
        st.committed.insert(column.to_string(), value.clone());
        st.values.insert(column.to_string(), value);
        Ok(())
    }

    // ========================================================================
    // References
    // ========================================================================

    /// Target of a scalar relationship, lazy loading it if needed.
    pub fn related(&self, name: &str) -> Result<Option<Instance>> {
        let rel = self.relationship(name, false)?;
        self.load_relation(rel, false)?;
        match self.state()?.relations.get(name) {
            Some(RelationValue::Reference(r)) => Ok(r.clone()),
            _ => Ok(None),
        }
    }

    /// Point a scalar relationship at `target` (or clear it).
    pub fn set_related(&self, name: &str, target: Option<&Instance>) -> Result<()> {
        let rel = self.relationship(name, false)?;
        self.check_mutable()?;
        self.set_reference(rel, target.cloned(), Initiator::Direct)
    }

    // ========================================================================
    // Collections
    // ========================================================================

    /// Members of a collection relationship, lazy loading it if needed.
    pub fn collection(&self, name: &str) -> Result<Vec<Instance>> {
        let rel = self.relationship(name, true)?;
        self.load_relation(rel, false)?;
        self.loaded_related(name)
    }

    /// Member of a keyed collection stored under `key`.
    pub fn collection_get(&self, name: &str, key: &Value) -> Result<Option<Instance>> {
        let rel = self.relationship(name, true)?;
        self.load_relation(rel, false)?;
        match self.state()?.relations.get(name) {
            Some(RelationValue::Collection(c)) => Ok(c.get(key)),
            _ => Ok(None),
        }
    }

    pub fn append(&self, name: &str, item: &Instance) -> Result<()> {
        let rel = self.relationship(name, true)?;
        self.check_mutable()?;
        self.check_target(rel, item)?;
        self.append_item(rel, item, Initiator::Direct)
    }

    pub fn remove(&self, name: &str, item: &Instance) -> Result<()> {
        let rel = self.relationship(name, true)?;
        self.check_mutable()?;
        self.remove_item(rel, item, Initiator::Direct)
    }

    /// Replace the members of a collection.
    ///
    /// Applied as a diff: members missing from `items` are removed, new ones
    /// appended, and members present in both are not touched.
    pub fn replace(&self, name: &str, items: &[Instance]) -> Result<()> {
        let rel = self.relationship(name, true)?;
        self.check_mutable()?;
        for item in items {
            self.check_target(rel, item)?;
        }
        self.load_relation(rel, false)?;
        let current = self.loaded_related(name)?;
        for old in current.iter().filter(|c| !items.contains(c)) {
            self.remove_item(rel, old, Initiator::Direct)?;
        }
        for new in items.iter().filter(|i| !current.contains(i)) {
            self.append_item(rel, new, Initiator::Direct)?;
        }
        Ok(())
    }

    // ========================================================================
    // History
    // ========================================================================

    /// Changes to an attribute since it was last loaded or flushed.
    pub fn history(&self, attr: &str) -> Result<AttributeHistory> {
        let st = self.state()?;
        if self.mapper().has_column(attr) {
            return Ok(AttributeHistory::Scalar(history::scalar_history(&st, attr)));
        }
        match self.mapper().relationship_info(attr) {
            Some(rel) if rel.uselist() => Ok(AttributeHistory::Collection(
                history::collection_history(&st, attr),
            )),
            Some(_) => Ok(AttributeHistory::Reference(history::reference_history(
                &st, attr,
            ))),
            None => Err(unknown_attribute(self, attr)),
        }
    }

    // ========================================================================
    // Internals
    // ========================================================================

    fn check_column(&self, column: &str) -> Result<()> {
        if self.mapper().has_column(column) {
            return Ok(());
        }
        Err(Error::schema(
            SchemaErrorKind::UnknownColumn,
            format!("{} has no column '{column}'", self.entity()),
        ))
    }

    fn relationship(&self, name: &str, collection: bool) -> Result<&RelationshipInfo> {
        let rel = self
            .mapper()
            .relationship_info(name)
            .ok_or_else(|| unknown_attribute(self, name))?;
        if rel.uselist() != collection {
            let expected = if collection { "collection" } else { "scalar" };
            return Err(Error::invalid_request(format!(
                "{}.{name} is not a {expected} relationship",
                self.entity()
            )));
        }
        Ok(rel)
    }

    fn check_mutable(&self) -> Result<()> {
        match self.session_core() {
            Some(core) => core.check_not_flushing(),
            None => Ok(()),
        }
    }

    fn check_target(&self, rel: &RelationshipInfo, item: &Instance) -> Result<()> {
        if item.entity() == rel.target {
            return Ok(());
        }
        Err(Error::invalid_request(format!(
            "{}.{} expects {} instances, got {}",
            self.entity(),
            rel.name,
            rel.target,
            item.entity()
        )))
    }

    /// Original value of a reference, for history. `None` when the
    /// relationship is unloaded and cannot be loaded passively.
    fn reference_original(&self, rel: &RelationshipInfo) -> Result<Option<Option<Instance>>> {
        if !self.load_relation(rel, true)? {
            return Ok(None);
        }
        match self.state()?.relations.get(&rel.name) {
            Some(RelationValue::Reference(r)) => Ok(Some(r.clone())),
            _ => Ok(Some(None)),
        }
    }

    fn set_reference(
        &self,
        rel: &RelationshipInfo,
        target: Option<Instance>,
        initiator: Initiator,
    ) -> Result<()> {
        let Some(_guard) = AttrGuard::enter(self, &rel.name)? else {
            return Ok(());
        };
        let old = self.reference_original(rel)?;
        if let Some(old) = &old {
            if *old == target {
                return Ok(());
            }
        }

        {
            let mut st = self.state_mut()?;
            st.history
                .entry(rel.name.clone())
                .or_insert_with(|| RelationHistory::Reference {
                    original: old.clone().flatten(),
                    known: old.is_some(),
                });
            st.relations
                .insert(rel.name.clone(), RelationValue::Reference(target.clone()));
        }

        let old = old.flatten();
        if let Some(old) = &old {
            self.child_detached(rel, old)?;
        }
        if let Some(new) = &target {
            self.child_attached(rel, new)?;
        }

        if let Some(back) = self.back_relationship(rel, target.as_ref().or(old.as_ref())) {
            if let Some(old) = &old {
                old.unlink_backref(back, self)?;
            }
            if let Some(new) = &target {
                new.link_backref(back, self)?;
            }
        }
        if let Some(new) = &target {
            self.cascade_save_update(rel, new, initiator)?;
        }
        self.touched()
    }

    fn append_item(&self, rel: &RelationshipInfo, item: &Instance, initiator: Initiator) -> Result<()> {
        let Some(_guard) = AttrGuard::enter(self, &rel.name)? else {
            return Ok(());
        };
        let loaded = self.load_relation(rel, true)?;

        let mut evicted = None;
        if loaded {
            // The adapter may need to read `item` (keyed collections), which
            // can be `self`, so it is taken out of the state while adding.
            let taken = self.state_mut()?.relations.remove(&rel.name);
            let Some(RelationValue::Collection(mut adapter)) = taken else {
                return Err(Error::invalid_request(format!(
                    "{}.{} is not a loaded collection",
                    self.entity(),
                    rel.name
                )));
            };
            let outcome = adapter.add(item.clone());
            self.state_mut()?
                .relations
                .insert(rel.name.clone(), RelationValue::Collection(adapter));
            match outcome? {
                AddOutcome::Present => return Ok(()),
                AddOutcome::Added => {}
                AddOutcome::Replaced(old) => evicted = Some(old),
            }
        }

        {
            let mut st = self.state_mut()?;
            let hist = st
                .history
                .entry(rel.name.clone())
                .or_insert_with(|| RelationHistory::Collection {
                    added: Vec::new(),
                    removed: Vec::new(),
                });
            if let Some(old) = &evicted {
                hist.record_removed(old);
            }
            hist.record_added(item);
        }

        if let Some(old) = &evicted {
            self.child_detached(rel, old)?;
        }
        self.child_attached(rel, item)?;

        if let Some(back) = self.back_relationship(rel, Some(item)) {
            if let Some(old) = &evicted {
                old.unlink_backref(back, self)?;
            }
            item.link_backref(back, self)?;
        }
        self.cascade_save_update(rel, item, initiator)?;
        self.touched()
    }

    fn remove_item(&self, rel: &RelationshipInfo, item: &Instance, initiator: Initiator) -> Result<()> {
        let Some(_guard) = AttrGuard::enter(self, &rel.name)? else {
            return Ok(());
        };
        let loaded = self.load_relation(rel, initiator == Initiator::Backref)?;
        if loaded {
            let mut st = self.state_mut()?;
            let removed = match st.relations.get_mut(&rel.name) {
                Some(RelationValue::Collection(c)) => c.remove(item),
                _ => false,
            };
            if !removed {
                return Ok(());
            }
        }

        self.state_mut()?
            .history
            .entry(rel.name.clone())
            .or_insert_with(|| RelationHistory::Collection {
                added: Vec::new(),
                removed: Vec::new(),
            })
            .record_removed(item);

        self.child_detached(rel, item)?;
        if let Some(back) = self.back_relationship(rel, Some(item)) {
            item.unlink_backref(back, self)?;
        }
        self.touched()
    }

    /// Paired relationship on the other side, looked up through the
    /// related instance's own mapper.
    fn back_relationship<'a>(
        &self,
        rel: &RelationshipInfo,
        other: Option<&'a Instance>,
    ) -> Option<&'a RelationshipInfo> {
        let name = rel.back_populates.as_deref()?;
        other?.mapper().relationship_info(name)
    }

    /// Back-reference half of linking `owner` to `self`.
    fn link_backref(&self, back: &RelationshipInfo, owner: &Instance) -> Result<()> {
        if back.uselist() {
            self.append_item(back, owner, Initiator::Backref)
        } else {
            self.set_reference(back, Some(owner.clone()), Initiator::Backref)
        }
    }

    /// Back-reference half of unlinking `owner` from `self`.
    fn unlink_backref(&self, back: &RelationshipInfo, owner: &Instance) -> Result<()> {
        if back.uselist() {
            return self.remove_item(back, owner, Initiator::Backref);
        }
        let points_at_owner = match self.state()?.relations.get(&back.name) {
            Some(RelationValue::Reference(r)) => r.as_ref() == Some(owner),
            Some(RelationValue::Collection(_)) => false,
            None => true,
        };
        if points_at_owner {
            self.set_reference(back, None, Initiator::Backref)?;
        }
        Ok(())
    }

    /// `child` gained `self` as a delete-orphan parent.
    fn child_attached(&self, rel: &RelationshipInfo, child: &Instance) -> Result<()> {
        if !rel.cascade.delete_orphan {
            return Ok(());
        }
        let label = relation_label(self.mapper(), rel);
        *child.state_mut()?.parents.entry(label).or_insert(0) += 1;
        if let Some(core) = child.session_core().or_else(|| self.session_core()) {
            core.cancel_orphan(child)?;
        }
        Ok(())
    }

    /// `child` lost `self` as a delete-orphan parent; with no parents left
    /// it becomes an orphan candidate for the next flush.
    fn child_detached(&self, rel: &RelationshipInfo, child: &Instance) -> Result<()> {
        if !rel.cascade.delete_orphan {
            return Ok(());
        }
        let label = relation_label(self.mapper(), rel);
        let orphaned = {
            let mut st = child.state_mut()?;
            let count = st.parents.entry(label).or_insert(0);
            *count = count.saturating_sub(1);
            st.parents.values().all(|c| *c == 0)
        };
        if orphaned {
            if let Some(core) = child.session_core().or_else(|| self.session_core()) {
                core.schedule_orphan(child)?;
            }
        }
        Ok(())
    }

    fn cascade_save_update(
        &self,
        rel: &RelationshipInfo,
        related: &Instance,
        initiator: Initiator,
    ) -> Result<()> {
        if !rel.cascade.save_update {
            return Ok(());
        }
        let Some(core) = self.session_core() else {
            return Ok(());
        };
        if initiator == Initiator::Backref && !core.config.cascade_backrefs {
            return Ok(());
        }
        if !matches!(
            self.status(),
            InstanceStatus::Pending | InstanceStatus::Persistent
        ) || related.belongs_to(&core)
        {
            return Ok(());
        }
        tracing::trace!(
            owner = self.entity(),
            relationship = %rel.name,
            target = related.entity(),
            "save-update cascade on mutation"
        );
        core.attach(related)
    }

    fn touched(&self) -> Result<()> {
        match self.session_core() {
            Some(core) => core.mark_modified(self),
            None => Ok(()),
        }
    }
}

fn unknown_attribute(inst: &Instance, attr: &str) -> Error {
    Error::schema(
        SchemaErrorKind::UnknownRelationship,
        format!("{} has no attribute '{attr}'", inst.entity()),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{
        CollectionKind, ColumnInfo, EntityMapper, KeyFunction, Registry, RelationshipInfo,
    };
    use std::sync::Arc;

    fn registry() -> Registry {
        Registry::builder()
            .entity(
                EntityMapper::new("Order", "orders")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(ColumnInfo::new("note"))
                    .relationship(
                        RelationshipInfo::one_to_many("items", "Item")
                            .foreign_key("order_id", "id")
                            .back_populates("order")
                            .cascade("all, delete-orphan"),
                    )
                    .relationship(
                        RelationshipInfo::one_to_many("by_sku", "Item")
                            .foreign_key("order_id", "id")
                            .collection(CollectionKind::Keyed(KeyFunction::Column("sku".into()))),
                    ),
            )
            .entity(
                EntityMapper::new("Item", "items")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(ColumnInfo::new("order_id"))
                    .column(ColumnInfo::new("sku"))
                    .relationship(
                        RelationshipInfo::many_to_one("order", "Order")
                            .foreign_key("order_id", "id")
                            .back_populates("items"),
                    ),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_append_sets_backref() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        order.append("items", &item).unwrap();
        assert_eq!(item.related("order").unwrap(), Some(order.clone()));
        assert_eq!(order.collection("items").unwrap(), vec![item.clone()]);
    }

    #[test]
    fn test_set_related_moves_between_collections() {
        let reg = registry();
        let a = Instance::of(&reg, "Order").unwrap();
        let b = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        item.set_related("order", Some(&a)).unwrap();
        assert_eq!(a.collection("items").unwrap(), vec![item.clone()]);

        item.set_related("order", Some(&b)).unwrap();
        assert!(a.collection("items").unwrap().is_empty());
        assert_eq!(b.collection("items").unwrap(), vec![item.clone()]);
    }

    #[test]
    fn test_replace_is_a_diff() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let (a, b, c) = (
            Instance::of(&reg, "Item").unwrap(),
            Instance::of(&reg, "Item").unwrap(),
            Instance::of(&reg, "Item").unwrap(),
        );
        order.replace("items", &[a.clone(), b.clone()]).unwrap();
        order.state_mut().unwrap().commit_all();

        order.replace("items", &[b.clone(), c.clone()]).unwrap();
        let hist = order.history("items").unwrap();
        let hist = hist.as_related().unwrap();
        assert_eq!(hist.added, vec![c.clone()]);
        assert_eq!(hist.deleted, vec![a.clone()]);
        assert_eq!(hist.unchanged, vec![b.clone()]);
        assert_eq!(a.related("order").unwrap(), None);
        assert_eq!(c.related("order").unwrap(), Some(order));
    }

    #[test]
    fn test_add_then_remove_cancels_history() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        order.append("items", &item).unwrap();
        order.remove("items", &item).unwrap();
        assert!(!order.history("items").unwrap().has_changes());
    }

    #[test]
    fn test_wrong_target_type_rejected() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let other = Instance::of(&reg, "Order").unwrap();
        let err = order.append("items", &other).unwrap_err();
        assert!(matches!(err, Error::InvalidRequest(_)));
        assert!(order.related("items").is_err());
    }

    #[test]
    fn test_scalar_set_and_unknown_column() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        order.set("note", "rush").unwrap();
        assert_eq!(order.get("note").unwrap(), Value::from("rush"));
        assert_eq!(order.get("id").unwrap(), Value::Null);
        assert!(matches!(
            order.set("missing", 1i64).unwrap_err(),
            Error::Schema(ref e) if e.kind == SchemaErrorKind::UnknownColumn
        ));
    }

    #[test]
    fn test_keyed_collection_lookup() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        item.set("sku", "A-1").unwrap();
        order.append("by_sku", &item).unwrap();
        assert_eq!(
            order.collection_get("by_sku", &Value::from("A-1")).unwrap(),
            Some(item.clone())
        );
        item.set("sku", "B-2").unwrap();
        assert_eq!(
            order.collection_get("by_sku", &Value::from("B-2")).unwrap(),
            None
        );
    }

    #[test]
    fn test_orphan_parent_count() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        order.append("items", &item).unwrap();
        assert_eq!(item.state().unwrap().parents.get("Order.items"), Some(&1));
        order.remove("items", &item).unwrap();
        assert_eq!(item.state().unwrap().parents.get("Order.items"), Some(&0));
    }

    #[test]
    fn test_mapper_shared_between_instances() {
        let reg = registry();
        let a = Instance::of(&reg, "Order").unwrap();
        let b = Instance::of(&reg, "Order").unwrap();
        assert!(Arc::ptr_eq(a.mapper(), b.mapper()));
        assert_ne!(a, b);
    }
}
