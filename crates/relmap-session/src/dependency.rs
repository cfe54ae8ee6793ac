//! Relationship synchronization for a flush.
//!
//! Turns object references into foreign-key column values. Each
//! relationship change yields a [`Binding`] (child columns set from a parent,
//! or nulled) or, for many-to-many, a [`LinkRow`] insert or delete. Nothing
//! is written to the instances here; the planner folds the results into
//! the write plan and the values are applied only after the flush succeeds.

use std::collections::HashSet;

use relmap_core::{
    ColumnPair, Registry, RelationshipInfo, RelationshipKind, Result, Value,
};

use crate::flush::PlannedValue;
use crate::loading::relation_label;
use crate::state::{Instance, RelationHistory, RelationValue};

/// Instances taking part in a flush.
#[derive(Debug, Default)]
pub(crate) struct FlushSet {
    pub(crate) new: Vec<Instance>,
    pub(crate) dirty: Vec<Instance>,
    pub(crate) deleted: Vec<Instance>,
    new_ids: HashSet<u64>,
    deleted_ids: HashSet<u64>,
}

impl FlushSet {
    pub(crate) fn new(new: Vec<Instance>, dirty: Vec<Instance>, deleted: Vec<Instance>) -> Self {
        let new_ids = new.iter().map(Instance::id).collect();
        let deleted_ids = deleted.iter().map(Instance::id).collect();
        Self {
            new,
            dirty,
            deleted,
            new_ids,
            deleted_ids,
        }
    }

    pub(crate) fn is_new(&self, inst: &Instance) -> bool {
        self.new_ids.contains(&inst.id())
    }

    pub(crate) fn is_deleted(&self, inst: &Instance) -> bool {
        self.deleted_ids.contains(&inst.id())
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.new.is_empty() && self.dirty.is_empty() && self.deleted.is_empty()
    }

    fn all(&self) -> impl Iterator<Item = &Instance> {
        self.new.iter().chain(&self.dirty).chain(&self.deleted)
    }
}

/// Foreign-key columns of `child` to write because of one relationship.
#[derive(Debug, Clone)]
pub(crate) struct Binding {
    pub(crate) child: Instance,
    pub(crate) columns: Vec<(String, PlannedValue)>,
    /// Parent whose row must be inserted first; `None` when the values are
    /// already known.
    pub(crate) parent: Option<Instance>,
    pub(crate) post_update: bool,
    pub(crate) nullable: bool,
    /// `Entity.relationship` that produced the binding.
    pub(crate) relationship: String,
}

/// A many-to-many link row to insert or delete.
#[derive(Debug, Clone)]
pub(crate) struct LinkRow {
    pub(crate) insert: bool,
    pub(crate) table: String,
    pub(crate) columns: Vec<(String, PlannedValue)>,
    pub(crate) endpoints: [Instance; 2],
}

#[derive(Debug, Default)]
pub(crate) struct Synchronized {
    /// Nulling bindings first, then setting ones, so a set wins over a null
    /// of the same column.
    pub(crate) bindings: Vec<Binding>,
    pub(crate) links: Vec<LinkRow>,
}

/// Current value of a column, falling back to the identity key for
/// primary-key columns.
pub(crate) fn column_value(inst: &Instance, column: &str) -> Result<Value> {
    inst.ensure_attribute(column)?;
    let st = inst.state()?;
    if let Some(v) = st.values.get(column) {
        return Ok(v.clone());
    }
    if let Some(key) = &st.key {
        if let Some(pos) = inst.mapper().primary_key().position(|c| c == column) {
            return Ok(key.primary_key[pos].clone());
        }
    }
    Ok(Value::Null)
}

pub(crate) fn synchronize(registry: &Registry, set: &FlushSet) -> Result<Synchronized> {
    let mut sync = Synchronizer {
        registry,
        set,
        nulls: Vec::new(),
        sets: Vec::new(),
        links: Vec::new(),
        link_keys: HashSet::new(),
    };
    for inst in set.all() {
        for rel in &inst.mapper().relationships {
            match rel.kind {
                RelationshipKind::ManyToOne => sync.many_to_one(inst, rel)?,
                RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                    sync.parent_side(inst, rel)?;
                }
                RelationshipKind::ManyToMany => sync.many_to_many(inst, rel)?,
            }
        }
    }
    let mut bindings = sync.nulls;
    bindings.extend(sync.sets);
    Ok(Synchronized {
        bindings,
        links: sync.links,
    })
}

struct Synchronizer<'a> {
    registry: &'a Registry,
    set: &'a FlushSet,
    nulls: Vec<Binding>,
    sets: Vec<Binding>,
    links: Vec<LinkRow>,
    link_keys: HashSet<(bool, String, Vec<(String, u64)>)>,
}

impl Synchronizer<'_> {
    fn post_update(&self, rel: &RelationshipInfo) -> bool {
        rel.post_update || self.registry.backref(rel).is_some_and(|b| b.post_update)
    }

    fn bind(
        &mut self,
        child: &Instance,
        pairs: &[ColumnPair],
        parent: &Instance,
        rel: &RelationshipInfo,
        owner: &Instance,
    ) -> Result<()> {
        if self.set.is_deleted(child) {
            return Ok(());
        }
        let parent_is_new = self.set.is_new(parent);
        let mut columns = Vec::with_capacity(pairs.len());
        for pair in pairs {
            let value = if parent_is_new {
                PlannedValue::Bound {
                    parent: parent.clone(),
                    column: pair.parent.clone(),
                }
            } else {
                PlannedValue::Literal(column_value(parent, &pair.parent)?)
            };
            columns.push((pair.child.clone(), value));
        }
        self.sets.push(Binding {
            child: child.clone(),
            columns,
            parent: parent_is_new.then(|| parent.clone()),
            post_update: self.post_update(rel),
            nullable: child
                .mapper()
                .all_nullable(pairs.iter().map(|p| p.child.as_str())),
            relationship: relation_label(owner.mapper(), rel),
        });
        Ok(())
    }

    fn null(
        &mut self,
        child: &Instance,
        pairs: &[ColumnPair],
        rel: &RelationshipInfo,
        owner: &Instance,
    ) {
        if self.set.is_deleted(child) {
            return;
        }
        self.nulls.push(Binding {
            child: child.clone(),
            columns: pairs
                .iter()
                .map(|p| (p.child.clone(), PlannedValue::Literal(Value::Null)))
                .collect(),
            parent: None,
            post_update: false,
            nullable: child
                .mapper()
                .all_nullable(pairs.iter().map(|p| p.child.as_str())),
            relationship: relation_label(owner.mapper(), rel),
        });
    }

    /// `inst` is the child; its own foreign key follows the reference.
    fn many_to_one(&mut self, inst: &Instance, rel: &RelationshipInfo) -> Result<()> {
        if self.set.is_deleted(inst) {
            return Ok(());
        }
        let (current, changed) = {
            let st = inst.state()?;
            let current = match st.relations.get(&rel.name) {
                Some(RelationValue::Reference(r)) => r.clone(),
                _ => None,
            };
            let changed = st
                .history
                .get(&rel.name)
                .is_some_and(|h| st.relation_changed(&rel.name, h));
            (current, changed)
        };
        match current {
            Some(parent) if changed || self.set.is_new(inst) => {
                self.bind(inst, &rel.foreign_keys, &parent, rel, inst)
            }
            None if changed => {
                self.null(inst, &rel.foreign_keys, rel, inst);
                Ok(())
            }
            _ => Ok(()),
        }
    }

    /// `inst` is the parent; the foreign key lives on the target rows.
    fn parent_side(&mut self, inst: &Instance, rel: &RelationshipInfo) -> Result<()> {
        let pairs = &rel.foreign_keys;
        if self.set.is_deleted(inst) {
            if rel.passive_deletes == relmap_core::PassiveDeletes::All {
                return Ok(());
            }
            let mut children = inst.loaded_related(&rel.name)?;
            children.extend(removed_members(inst, &rel.name)?);
            for child in children {
                self.null(&child, pairs, rel, inst);
            }
            return Ok(());
        }

        if self.set.is_new(inst) {
            for child in inst.loaded_related(&rel.name)? {
                self.bind(&child, pairs, inst, rel, inst)?;
            }
            return Ok(());
        }

        let hist = inst.state()?.history.get(&rel.name).cloned();
        match hist {
            Some(RelationHistory::Collection { added, removed }) => {
                for child in &removed {
                    self.null(child, pairs, rel, inst);
                }
                for child in &added {
                    self.bind(child, pairs, inst, rel, inst)?;
                }
            }
            Some(RelationHistory::Reference { original, known }) => {
                let current = inst.loaded_related(&rel.name)?.into_iter().next();
                if known {
                    if let Some(old) = original.filter(|o| Some(o) != current.as_ref()) {
                        self.null(&old, pairs, rel, inst);
                    }
                }
                if let Some(child) = current {
                    self.bind(&child, pairs, inst, rel, inst)?;
                }
            }
            None => {}
        }
        Ok(())
    }

    fn many_to_many(&mut self, inst: &Instance, rel: &RelationshipInfo) -> Result<()> {
        let Some(link) = rel.secondary.as_ref() else {
            return Ok(());
        };
        let (inserts, deletes) = if self.set.is_deleted(inst) {
            let mut gone = inst.loaded_related(&rel.name)?;
            gone.extend(removed_members(inst, &rel.name)?);
            (Vec::new(), gone)
        } else if self.set.is_new(inst) {
            (inst.loaded_related(&rel.name)?, Vec::new())
        } else {
            match inst.state()?.history.get(&rel.name) {
                Some(RelationHistory::Collection { added, removed }) => {
                    (added.clone(), removed.clone())
                }
                _ => (Vec::new(), Vec::new()),
            }
        };

        for (insert, members) in [(true, inserts), (false, deletes)] {
            for member in members {
                if insert && self.set.is_deleted(&member) {
                    continue;
                }
                let mut columns = Vec::new();
                let mut dedup = Vec::new();
                for (pairs, endpoint) in [(&link.local, inst), (&link.remote, &member)] {
                    for pair in pairs {
                        let value = if insert && self.set.is_new(endpoint) {
                            PlannedValue::Bound {
                                parent: endpoint.clone(),
                                column: pair.parent.clone(),
                            }
                        } else {
                            PlannedValue::Literal(column_value(endpoint, &pair.parent)?)
                        };
                        columns.push((pair.child.clone(), value));
                        dedup.push((pair.child.clone(), endpoint.id()));
                    }
                }
                dedup.sort();
                if !self.link_keys.insert((insert, link.table.clone(), dedup)) {
                    continue;
                }
                self.links.push(LinkRow {
                    insert,
                    table: link.table.clone(),
                    columns,
                    endpoints: [inst.clone(), member],
                });
            }
        }
        Ok(())
    }
}

fn removed_members(inst: &Instance, name: &str) -> Result<Vec<Instance>> {
    Ok(match inst.state()?.history.get(name) {
        Some(RelationHistory::Collection { removed, .. }) => removed.clone(),
        Some(RelationHistory::Reference {
            original: Some(o),
            known: true,
        }) => vec![o.clone()],
        _ => Vec::new(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{ColumnInfo, EntityMapper, IdentityKey};

    fn registry() -> Registry {
        Registry::builder()
            .entity(
                EntityMapper::new("Order", "orders")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .relationship(
                        RelationshipInfo::one_to_many("items", "Item")
                            .foreign_key("order_id", "id")
                            .back_populates("order"),
                    ),
            )
            .entity(
                EntityMapper::new("Item", "items")
                    .column(ColumnInfo::new("id").primary_key().autoincrement())
                    .column(ColumnInfo::new("order_id"))
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
    fn test_new_parent_binds_children_to_placeholder() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        order.append("items", &item).unwrap();

        let set = FlushSet::new(vec![order.clone(), item.clone()], Vec::new(), Vec::new());
        let sync = synchronize(&reg, &set).unwrap();
        assert!(!sync.bindings.is_empty());
        for binding in &sync.bindings {
            assert_eq!(binding.child, item);
            assert_eq!(binding.parent.as_ref(), Some(&order));
            assert!(binding.nullable);
            assert!(["Order.items", "Item.order"].contains(&binding.relationship.as_str()));
            assert!(matches!(
                &binding.columns[0].1,
                PlannedValue::Bound { parent, column } if *parent == order && column == "id"
            ));
        }
    }

    #[test]
    fn test_column_value_falls_back_to_key() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        order.state_mut().unwrap().key = Some(IdentityKey::new("Order", vec![Value::BigInt(9)]));
        assert_eq!(column_value(&order, "id").unwrap(), Value::BigInt(9));
    }

    #[test]
    fn test_deleted_child_gets_no_binding() {
        let reg = registry();
        let order = Instance::of(&reg, "Order").unwrap();
        let item = Instance::of(&reg, "Item").unwrap();
        order.append("items", &item).unwrap();
        let set = FlushSet::new(vec![order], Vec::new(), vec![item]);
        let sync = synchronize(&reg, &set).unwrap();
        assert!(sync.bindings.is_empty());
    }
}
