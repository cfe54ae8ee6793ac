//! Cascade engine.
//!
//! Session operations on one instance propagate along relationships whose
//! cascade policy includes the operation. Every walk keeps a visited set so
//! cyclic object graphs terminate.

use std::collections::{HashMap, HashSet};
use std::rc::Rc;
use std::sync::Arc;

use relmap_core::{
    CascadeOptions, Error, IdentityConflict, PassiveDeletes, RelationshipInfo, Result,
};

use crate::SessionCore;
use crate::collection::adapter_for;
use crate::state::{Instance, InstanceStatus, RelationValue};

/// Instances reachable from `root` along relationships selected by
/// `follow`, root first. Only loaded relationships are walked.
fn reachable(
    root: &Instance,
    follow: impl Fn(&CascadeOptions) -> bool,
) -> Result<Vec<Instance>> {
    let mut visited = HashSet::new();
    let mut order = Vec::new();
    let mut stack = vec![root.clone()];
    while let Some(inst) = stack.pop() {
        if !visited.insert(inst.id()) {
            continue;
        }
        let mut next = Vec::new();
        for rel in inst.mapper().relationships.iter().filter(|r| follow(&r.cascade)) {
            next.extend(inst.loaded_related(&rel.name)?);
        }
        stack.extend(next.into_iter().rev());
        order.push(inst);
    }
    Ok(order)
}

impl SessionCore {
    fn not_in_session(inst: &Instance) -> Error {
        Error::invalid_request(format!(
            "{inst:?} is not attached to this session"
        ))
    }

    // ========================================================================
    // save-update
    // ========================================================================

    /// Attach `root` and everything reachable through save-update edges.
    #[tracing::instrument(level = "debug", skip(self, root), fields(entity = root.entity()))]
    pub(crate) fn attach(self: &Rc<Self>, root: &Instance) -> Result<()> {
        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];
        let mut count = 0usize;
        while let Some(inst) = stack.pop() {
            if !visited.insert(inst.id()) {
                continue;
            }
            self.attach_one(&inst)?;
            count += 1;
            let mut next = Vec::new();
            for rel in inst
                .mapper()
                .relationships
                .iter()
                .filter(|r| r.cascade.save_update)
            {
                next.extend(inst.loaded_related(&rel.name)?);
            }
            stack.extend(next.into_iter().rev());
        }
        tracing::debug!(count, "save-update cascade");
        Ok(())
    }

    fn attach_one(self: &Rc<Self>, inst: &Instance) -> Result<()> {
        let owned_elsewhere = inst.session_core().is_some_and(|s| !Rc::ptr_eq(&s, self));
        if owned_elsewhere {
            return Err(Error::invalid_request(format!(
                "{inst:?} is already attached to another session"
            )));
        }
        match inst.status() {
            InstanceStatus::Transient => {
                {
                    let mut st = inst.state_mut()?;
                    st.status = InstanceStatus::Pending;
                    st.session = Some(Rc::downgrade(self));
                }
                self.inner_mut()?.new.insert(inst);
            }
            InstanceStatus::Pending | InstanceStatus::Persistent => {
                if !inst.belongs_to(self) {
                    // Owning session was dropped; treat as detached.
                    self.reattach(inst)?;
                }
            }
            InstanceStatus::Deleted => {
                if inst.belongs_to(self) {
                    inst.state_mut()?.status = InstanceStatus::Persistent;
                    let mut inner = self.inner_mut()?;
                    inner.deleted.remove(inst);
                    inner.orphans.remove(inst);
                } else {
                    self.reattach(inst)?;
                }
            }
            InstanceStatus::Detached => self.reattach(inst)?,
        }
        Ok(())
    }

    /// Bring an instance with an identity back into this session.
    fn reattach(self: &Rc<Self>, inst: &Instance) -> Result<()> {
        let Some(key) = inst.identity_key() else {
            let mut st = inst.state_mut()?;
            st.status = InstanceStatus::Pending;
            st.session = Some(Rc::downgrade(self));
            drop(st);
            self.inner_mut()?.new.insert(inst);
            return Ok(());
        };
        {
            let mut inner = self.inner_mut()?;
            if inner.identity_map.get(&key).is_some_and(|i| i != *inst) {
                return Err(Error::DuplicateIdentity(IdentityConflict { key }));
            }
            inner.identity_map.insert(key, inst)?;
        }
        let modified = {
            let mut st = inst.state_mut()?;
            st.status = InstanceStatus::Persistent;
            st.session = Some(Rc::downgrade(self));
            st.has_changes()
        };
        if modified {
            self.inner_mut()?.modified.insert(inst);
        }
        Ok(())
    }

    // ========================================================================
    // delete
    // ========================================================================

    /// Mark `root` and its delete cascade for deletion.
    ///
    /// Pending instances are expunged instead.
    #[tracing::instrument(level = "debug", skip(self, root), fields(entity = root.entity()))]
    pub(crate) fn delete(self: &Rc<Self>, root: &Instance) -> Result<()> {
        match root.status() {
            InstanceStatus::Transient => {
                return Err(Error::invalid_request(format!(
                    "{root:?} is not persisted"
                )));
            }
            InstanceStatus::Detached => self.attach(root)?,
            _ if !root.belongs_to(self) => return Err(Self::not_in_session(root)),
            _ => {}
        }

        let mut visited = HashSet::new();
        let mut stack = vec![root.clone()];
        let mut count = 0usize;
        while let Some(inst) = stack.pop() {
            if !visited.insert(inst.id()) || !inst.belongs_to(self) {
                continue;
            }
            let mapper = Arc::clone(inst.mapper());
            let mut next = Vec::new();
            for rel in &mapper.relationships {
                if rel.passive_deletes == PassiveDeletes::Active
                    && inst.status() == InstanceStatus::Persistent
                    && needs_load_on_delete(rel)
                {
                    inst.load_relation(rel, false)?;
                }
                if rel.cascade.delete {
                    next.extend(inst.loaded_related(&rel.name)?);
                }
            }
            self.delete_one(&inst)?;
            count += 1;
            stack.extend(next.into_iter().rev());
        }
        tracing::debug!(count, "delete cascade");
        Ok(())
    }

    fn delete_one(self: &Rc<Self>, inst: &Instance) -> Result<()> {
        match inst.status() {
            InstanceStatus::Pending => self.expunge_one(inst),
            InstanceStatus::Persistent => {
                inst.state_mut()?.status = InstanceStatus::Deleted;
                let mut inner = self.inner_mut()?;
                inner.deleted.insert(inst);
                inner.orphans.remove(inst);
                Ok(())
            }
            InstanceStatus::Deleted => Ok(()),
            InstanceStatus::Transient | InstanceStatus::Detached => {
                tracing::trace!(entity = inst.entity(), "skipping delete of unattached instance");
                Ok(())
            }
        }
    }

    /// Resolve delete-orphan candidates: persistent orphans are deleted,
    /// pending ones expunged, re-parented ones dropped from the list.
    pub(crate) fn process_orphans(self: &Rc<Self>) -> Result<()> {
        let candidates = self.inner_mut()?.orphans.take();
        for inst in candidates {
            let still_orphan = inst.state()?.parents.values().all(|c| *c == 0);
            if !still_orphan || !inst.belongs_to(self) {
                continue;
            }
            match inst.status() {
                InstanceStatus::Persistent => {
                    tracing::debug!(entity = inst.entity(), "deleting orphan");
                    self.delete(&inst)?;
                }
                InstanceStatus::Pending => {
                    tracing::debug!(entity = inst.entity(), "expunging pending orphan");
                    self.expunge(&inst)?;
                }
                _ => {}
            }
        }
        Ok(())
    }

    // ========================================================================
    // merge
    // ========================================================================

    /// Merge `source` into this session; `load` selects whether the loader
    /// may be consulted for the counterpart.
    #[tracing::instrument(level = "debug", skip(self, source), fields(entity = source.entity()))]
    pub(crate) fn merge(self: &Rc<Self>, source: &Instance, load: bool) -> Result<Instance> {
        let mut memo = HashMap::new();
        let merged = self.merge_one(source, load, &mut memo)?;
        if !load {
            for inst in memo.values() {
                inst.state_mut()?.commit_all();
            }
            let mut inner = self.inner_mut()?;
            for inst in memo.values() {
                inner.modified.remove(inst);
            }
        }
        Ok(merged)
    }

    fn merge_one(
        self: &Rc<Self>,
        source: &Instance,
        load: bool,
        memo: &mut HashMap<u64, Instance>,
    ) -> Result<Instance> {
        if let Some(done) = memo.get(&source.id()) {
            return Ok(done.clone());
        }
        if source.belongs_to(self) {
            memo.insert(source.id(), source.clone());
            return Ok(source.clone());
        }
        if !load {
            let st = source.state()?;
            if st.status == InstanceStatus::Pending || st.has_changes() || st.key.is_none() {
                return Err(Error::invalid_request(format!(
                    "merge_without_load requires an unmodified instance with an identity; \
                     {} has pending changes",
                    source.entity()
                )));
            }
        }

        let mapper = Arc::clone(source.mapper());
        let key = source.identity_key().or_else(|| source.current_key());
        let mut target = match &key {
            Some(key) => self.inner_mut()?.identity_map.get(key),
            None => None,
        };
        if target.is_none() && load && self.has_loader() {
            if let Some(key) = &key {
                target = self.load_identity(&mapper, key)?;
            }
        }
        let fresh = target.is_none();
        let target = match target {
            Some(t) => t,
            None if !load => {
                let inst = Instance::new(Arc::clone(&mapper));
                {
                    let mut st = inst.state_mut()?;
                    st.status = InstanceStatus::Persistent;
                    st.session = Some(Rc::downgrade(self));
                    st.key.clone_from(&key);
                }
                if let Some(key) = key {
                    self.inner_mut()?.identity_map.insert(key, &inst)?;
                }
                inst
            }
            None => {
                let inst = Instance::new(Arc::clone(&mapper));
                self.attach(&inst)?;
                inst
            }
        };
        memo.insert(source.id(), target.clone());

        let values: Vec<_> = {
            let st = source.state()?;
            let mut cols: Vec<_> = st
                .values
                .iter()
                .filter(|(c, _)| !st.expired.contains(*c))
                .map(|(c, v)| (c.clone(), v.clone()))
                .collect();
            cols.sort_by(|a, b| a.0.cmp(&b.0));
            cols
        };
        for (col, value) in values {
            target.set(&col, value)?;
        }

        for rel in mapper.relationships.iter().filter(|r| r.cascade.merge) {
            let loaded = match source.state()?.relations.get(&rel.name) {
                Some(RelationValue::Reference(r)) => Some(r.iter().cloned().collect::<Vec<_>>()),
                Some(RelationValue::Collection(c)) => Some(c.items()),
                None => None,
            };
            let Some(members) = loaded else {
                continue;
            };
            if fresh && !load {
                let empty = if rel.uselist() {
                    RelationValue::Collection(adapter_for(&rel.collection))
                } else {
                    RelationValue::Reference(None)
                };
                target
                    .state_mut()?
                    .relations
                    .entry(rel.name.clone())
                    .or_insert(empty);
            }
            let mut merged = Vec::with_capacity(members.len());
            for member in &members {
                merged.push(self.merge_one(member, load, memo)?);
            }
            if rel.uselist() {
                target.replace(&rel.name, &merged)?;
            } else {
                target.set_related(&rel.name, merged.first())?;
            }
        }
        Ok(target)
    }

    // ========================================================================
    // expire / refresh
    // ========================================================================

    /// Expire attributes of a persistent instance; with no names, expire all
    /// and cascade along refresh-expire edges.
    pub(crate) fn expire(self: &Rc<Self>, inst: &Instance, attrs: &[&str]) -> Result<()> {
        if inst.status() != InstanceStatus::Persistent || !inst.belongs_to(self) {
            return Err(Error::invalid_request(format!(
                "{inst:?} is not persistent within this session; only persistent instances can be expired"
            )));
        }
        if !attrs.is_empty() {
            return expire_attributes(inst, attrs);
        }
        for member in reachable(inst, |c| c.refresh_expire)? {
            if member.status() == InstanceStatus::Persistent && member.belongs_to(self) {
                let mut st = member.state_mut()?;
                st.expire_all(member.mapper());
            }
        }
        Ok(())
    }

    /// Expire and immediately reload through the loader.
    #[tracing::instrument(level = "debug", skip(self, inst, attrs), fields(entity = inst.entity()))]
    pub(crate) fn refresh(self: &Rc<Self>, inst: &Instance, attrs: &[&str]) -> Result<()> {
        let members = if attrs.is_empty() {
            reachable(inst, |c| c.refresh_expire)?
        } else {
            vec![inst.clone()]
        };
        self.expire(inst, attrs)?;
        for member in members {
            if member.status() == InstanceStatus::Persistent && member.belongs_to(self) {
                self.load_expired(&member)?;
            }
        }
        Ok(())
    }

    // ========================================================================
    // expunge
    // ========================================================================

    /// Remove `root` and its expunge cascade from the session.
    pub(crate) fn expunge(self: &Rc<Self>, root: &Instance) -> Result<()> {
        if !root.belongs_to(self) {
            return Err(Self::not_in_session(root));
        }
        for inst in reachable(root, |c| c.expunge)? {
            if inst.belongs_to(self) {
                self.expunge_one(&inst)?;
            }
        }
        Ok(())
    }

    pub(crate) fn expunge_all(self: &Rc<Self>) -> Result<()> {
        let all = {
            let mut inner = self.inner_mut()?;
            let mut all = inner.identity_map.all();
            all.extend(inner.new.to_vec());
            all.extend(inner.deleted.to_vec());
            all.sort_by_key(Instance::id);
            all.dedup();
            inner.identity_map.clear();
            all
        };
        for inst in &all {
            self.expunge_one(inst)?;
        }
        tracing::debug!(count = all.len(), "expunged all");
        Ok(())
    }

    pub(crate) fn expunge_one(&self, inst: &Instance) -> Result<()> {
        let key = {
            let mut st = inst.state_mut()?;
            st.status = match st.status {
                InstanceStatus::Pending | InstanceStatus::Transient => InstanceStatus::Transient,
                _ => InstanceStatus::Detached,
            };
            st.session = None;
            st.key.clone()
        };
        let mut inner = self.inner_mut()?;
        if let Some(key) = key {
            inner.identity_map.remove(&key, inst);
        }
        inner.new.remove(inst);
        inner.deleted.remove(inst);
        inner.modified.remove(inst);
        inner.orphans.remove(inst);
        Ok(())
    }
}

/// Whether deleting the owner of `rel` needs its members loaded: to
/// cascade the delete, to null their foreign keys, or to remove link rows.
fn needs_load_on_delete(rel: &RelationshipInfo) -> bool {
    rel.cascade.delete || rel.kind.fk_on_target() || rel.secondary.is_some()
}

fn expire_attributes(inst: &Instance, attrs: &[&str]) -> Result<()> {
    let mapper = Arc::clone(inst.mapper());
    let mut st = inst.state_mut()?;
    for attr in attrs {
        if mapper.has_column(attr) {
            st.values.remove(*attr);
            st.committed.remove(*attr);
            st.expired.insert((*attr).to_string());
        } else if mapper.relationship_info(attr).is_some() {
            st.relations.remove(*attr);
            st.history.remove(*attr);
        } else {
            return Err(Error::invalid_request(format!(
                "{} has no attribute '{attr}' to expire",
                mapper.name
            )));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{ColumnInfo, EntityMapper, Registry};

    fn registry() -> Registry {
        Registry::builder()
            .entity(
                EntityMapper::new("Node", "nodes")
                    .column(ColumnInfo::new("id").primary_key())
                    .column(ColumnInfo::new("parent_id"))
                    .relationship(
                        RelationshipInfo::one_to_many("children", "Node")
                            .foreign_key("parent_id", "id")
                            .back_populates("parent")
                            .cascade("all"),
                    )
                    .relationship(
                        RelationshipInfo::many_to_one("parent", "Node")
                            .foreign_key("parent_id", "id")
                            .back_populates("children"),
                    ),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn test_reachable_handles_cycles() {
        let reg = registry();
        let a = Instance::of(&reg, "Node").unwrap();
        let b = Instance::of(&reg, "Node").unwrap();
        a.append("children", &b).unwrap();
        // parent has the default cascade (save-update, merge), so b -> a is
        // followed for save-update and the walk must still terminate.
        let walked = reachable(&a, |c| c.save_update).unwrap();
        assert_eq!(walked, vec![a.clone(), b.clone()]);
        let walked = reachable(&a, |c| c.delete).unwrap();
        assert_eq!(walked, vec![a, b]);
    }

    #[test]
    fn test_needs_load_on_delete() {
        let rel = RelationshipInfo::one_to_many("children", "Node").cascade("none");
        assert!(needs_load_on_delete(&rel));
        let rel = RelationshipInfo::many_to_one("parent", "Node");
        assert!(!needs_load_on_delete(&rel));
    }
}
