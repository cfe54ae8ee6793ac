//! Materializing loaded rows and lazy loading through the [`Loader`].

use std::rc::Rc;
use std::sync::Arc;

use relmap_core::{
    EntityMapper, Error, IdentityKey, LoadError, Loader, RelationshipInfo, RelationshipKind,
    Result, Row, Value,
};

use crate::SessionCore;
use crate::collection::adapter_for;
use crate::state::{Instance, InstanceStatus, RelationHistory, RelationValue};

/// `Entity.relationship`, the label delete-orphan parent counts are kept under.
pub(crate) fn relation_label(owner: &EntityMapper, rel: &RelationshipInfo) -> String {
    format!("{}.{}", owner.name, rel.name)
}

impl SessionCore {
    /// Run `f` against the configured loader.
    pub(crate) fn with_loader<T>(
        &self,
        what: &str,
        f: impl FnOnce(&mut dyn Loader) -> Result<T>,
    ) -> Result<T> {
        let mut guard = self
            .loader
            .try_borrow_mut()
            .map_err(|_| Error::invalid_request("loader is busy and cannot be re-entered"))?;
        let loader = guard.as_mut().ok_or_else(|| {
            Error::invalid_request(format!("no loader is configured; cannot load {what}"))
        })?;
        f(loader.as_mut())
    }

    pub(crate) fn has_loader(&self) -> bool {
        self.loader.try_borrow().is_ok_and(|l| l.is_some())
    }

    /// Instance for a loaded row.
    ///
    /// If the identity is already mapped the existing instance is returned;
    /// its expired attributes are filled from the row, and everything else
    /// is left alone unless `populate_existing` is set.
    pub(crate) fn materialize(
        self: &Rc<Self>,
        mapper: &Arc<EntityMapper>,
        row: &Row,
        populate_existing: bool,
    ) -> Result<Instance> {
        let key = mapper.identity_key(|c| row.get(c)).ok_or_else(|| {
            Error::Load(LoadError {
                entity: mapper.name.clone(),
                message: "row does not carry a complete primary key".to_string(),
            })
        })?;

        let existing = self.inner_mut()?.identity_map.get(&key);
        if let Some(inst) = existing {
            let mut st = inst.state_mut()?;
            for (col, value) in row.iter().filter(|(c, _)| mapper.has_column(c)) {
                if populate_existing || st.expired.remove(col) {
                    st.values.insert(col.to_string(), value.clone());
                    st.committed.insert(col.to_string(), value.clone());
                }
            }
            if populate_existing {
                st.expired.clear();
            }
            drop(st);
            return Ok(inst);
        }

        let inst = Instance::new(Arc::clone(mapper));
        {
            let mut st = inst.state_mut()?;
            st.status = InstanceStatus::Persistent;
            st.session = Some(Rc::downgrade(self));
            st.key = Some(key.clone());
            for (col, value) in row.iter().filter(|(c, _)| mapper.has_column(c)) {
                st.values.insert(col.to_string(), value.clone());
                st.committed.insert(col.to_string(), value.clone());
            }
        }
        tracing::trace!(key = %key, "materialized row");
        self.inner_mut()?.identity_map.insert(key, &inst)?;
        Ok(inst)
    }

    /// Load an identity through the loader.
    pub(crate) fn load_identity(
        self: &Rc<Self>,
        mapper: &Arc<EntityMapper>,
        key: &IdentityKey,
    ) -> Result<Option<Instance>> {
        let row = self.with_loader(&key.to_string(), |l| l.load_row(mapper, key))?;
        row.map(|row| self.materialize(mapper, &row, false))
            .transpose()
    }

    /// Reload the expired attributes of a persistent instance.
    pub(crate) fn load_expired(self: &Rc<Self>, inst: &Instance) -> Result<()> {
        let key = inst.identity_key().ok_or_else(|| {
            Error::invalid_request(format!("{} instance has no identity to reload", inst.entity()))
        })?;
        tracing::debug!(key = %key, "Object is expired, reloading");
        let row = self
            .with_loader(&key.to_string(), |l| l.load_row(inst.mapper(), &key))?
            .ok_or_else(|| {
                Error::invalid_request(format!(
                    "instance {key} has been deleted, or its row is otherwise not present"
                ))
            })?;
        let mut st = inst.state_mut()?;
        let expired: Vec<String> = st.expired.drain().collect();
        for col in expired {
            let value = row.get(&col).cloned().unwrap_or(Value::Null);
            st.committed.insert(col.clone(), value.clone());
            st.values.insert(col, value);
        }
        Ok(())
    }
}

impl Instance {
    /// Reload expired attributes if `attr` is one of them.
    pub(crate) fn ensure_attribute(&self, attr: &str) -> Result<()> {
        if !self.state()?.expired.contains(attr) {
            return Ok(());
        }
        let core = self.session_core().ok_or_else(|| {
            Error::DetachedInstance(format!(
                "{} instance is not bound to a session; attribute refresh of '{attr}' cannot proceed",
                self.entity()
            ))
        })?;
        core.load_expired(self)
    }

    /// Currently loaded members of a relationship, plus members appended
    /// while it was unloaded. Never loads.
    pub(crate) fn loaded_related(&self, name: &str) -> Result<Vec<Instance>> {
        let st = self.state()?;
        Ok(match st.relations.get(name) {
            Some(RelationValue::Reference(r)) => r.iter().cloned().collect(),
            Some(RelationValue::Collection(c)) => c.items(),
            None => match st.history.get(name) {
                Some(RelationHistory::Collection { added, .. }) => added.clone(),
                _ => Vec::new(),
            },
        })
    }

    /// Make sure a relationship is loaded.
    ///
    /// Transient and pending instances start with an empty relationship.
    /// When `passive` is set, a missing session or loader leaves the
    /// relationship unloaded instead of failing; the return value says
    /// whether it is loaded.
    pub(crate) fn load_relation(&self, rel: &RelationshipInfo, passive: bool) -> Result<bool> {
        let has_key = {
            let st = self.state()?;
            if st.relations.contains_key(&rel.name) {
                return Ok(true);
            }
            st.key.is_some()
        };
        if !has_key {
            let value = if rel.uselist() {
                RelationValue::Collection(adapter_for(&rel.collection))
            } else {
                RelationValue::Reference(None)
            };
            self.state_mut()?.relations.insert(rel.name.clone(), value);
            return Ok(true);
        }

        let Some(core) = self.session_core() else {
            if passive {
                return Ok(false);
            }
            return Err(Error::DetachedInstance(format!(
                "{} instance is not bound to a session; lazy load of '{}' cannot proceed",
                self.entity(),
                rel.name
            )));
        };
        if !self.state()?.expired.is_empty() {
            if passive && !core.has_loader() {
                return Ok(false);
            }
            core.load_expired(self)?;
        }
        let target = Arc::clone(core.registry.mapper(&rel.target)?);

        if rel.kind == RelationshipKind::ManyToOne {
            if let Some(parent) = self.reference_from_foreign_key(&core, rel, &target)? {
                self.install_reference(rel, parent)?;
                return Ok(true);
            }
        }
        if passive && !core.has_loader() {
            return Ok(false);
        }

        let source = self.state()?.committed_row();
        let what = format!("{}.{}", self.entity(), rel.name);
        let rows = core.with_loader(&what, |l| l.load_related(self.mapper(), rel, &source))?;
        let mut loaded = Vec::with_capacity(rows.len());
        for row in &rows {
            loaded.push(core.materialize(&target, row, false)?);
        }
        tracing::debug!(relationship = %what, rows = loaded.len(), "lazy loaded");

        if rel.uselist() {
            self.install_collection(rel, loaded)?;
        } else {
            self.install_reference(rel, loaded.into_iter().next())?;
        }
        Ok(true)
    }

    /// Many-to-one target resolved without the loader: `Some(None)` for a
    /// NULL foreign key, `Some(Some(_))` for an identity-map hit.
    fn reference_from_foreign_key(
        &self,
        core: &Rc<SessionCore>,
        rel: &RelationshipInfo,
        target: &EntityMapper,
    ) -> Result<Option<Option<Instance>>> {
        let st = self.state()?;
        let mut fk = Vec::with_capacity(rel.foreign_keys.len());
        for pair in &rel.foreign_keys {
            match st.values.get(&pair.child) {
                Some(v) if !v.is_null() => fk.push((pair.parent.as_str(), v.clone())),
                _ => return Ok(Some(None)),
            }
        }
        drop(st);
        let Some(key) = target.identity_key(|col| {
            fk.iter().find(|(parent, _)| *parent == col).map(|(_, v)| v)
        }) else {
            return Ok(None);
        };
        Ok(core.inner_mut()?.identity_map.get(&key).map(Some))
    }

    fn install_reference(&self, rel: &RelationshipInfo, value: Option<Instance>) -> Result<()> {
        if rel.cascade.delete_orphan {
            if let Some(child) = &value {
                let label = relation_label(self.mapper(), rel);
                *child.state_mut()?.parents.entry(label).or_insert(0) += 1;
            }
        }
        self.state_mut()?
            .relations
            .insert(rel.name.clone(), RelationValue::Reference(value));
        Ok(())
    }

    /// Install a loaded collection, replaying changes recorded while it was
    /// unloaded: loaded members minus removed, plus added.
    fn install_collection(&self, rel: &RelationshipInfo, loaded: Vec<Instance>) -> Result<()> {
        let (added, removed) = match self.state()?.history.get(&rel.name) {
            Some(RelationHistory::Collection { added, removed }) => (added.clone(), removed.clone()),
            _ => (Vec::new(), Vec::new()),
        };
        let label = relation_label(self.mapper(), rel);
        let mut adapter = adapter_for(&rel.collection);
        for item in loaded.into_iter().filter(|i| !removed.contains(i)) {
            if rel.cascade.delete_orphan && !added.contains(&item) {
                *item.state_mut()?.parents.entry(label.clone()).or_insert(0) += 1;
            }
            adapter.add(item)?;
        }
        for item in added {
            adapter.add(item)?;
        }
        self.state_mut()?
            .relations
            .insert(rel.name.clone(), RelationValue::Collection(adapter));
        Ok(())
    }
}
