//! Unit of Work: orders the pending changes of a session into a flush plan.
//!
//! # Overview
//!
//! The planner:
//! - Collects new, dirty and deleted instances
//! - Synchronizes foreign keys from object references
//! - Builds one write per row plus link-table writes, with depends-on edges
//! - Breaks dependency cycles by deferring nullable foreign keys
//! - Orders the writes topologically, ties broken by creation order
//!
//! Each node of the dependency graph is a [`PlannedWrite`]; an edge `a -> b`
//! means `a` must be executed before `b`. Node indices follow creation
//! order: inserts, updates, link inserts, link deletes, deletes, then the
//! post-update and pre-delete writes added while breaking cycles.

use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap, HashSet};
use std::rc::Rc;

use petgraph::Direction;
use petgraph::algo::tarjan_scc;
use petgraph::graph::{DiGraph, NodeIndex};
use relmap_core::{
    ColumnPair, CycleError, Error, IdentityConflict, Registry, Result, Value, WriteKind,
    WritePhase,
};

use crate::SessionCore;
use crate::dependency::{Binding, FlushSet, LinkRow, synchronize};
use crate::flush::{FlushPlan, PlannedValue, PlannedWrite};
use crate::state::Instance;

// ============================================================================
// Dependency graph
// ============================================================================

/// How an edge can be dropped to break a cycle.
#[derive(Debug, Clone)]
enum Deferral {
    /// Write the child's foreign key NULL in its primary write and fill it
    /// in with a post-update once the parent row exists.
    PostUpdate {
        child: Instance,
        values: Vec<(String, PlannedValue)>,
    },
    /// Null the child's foreign key before the parent row is deleted.
    PreNull {
        child: Instance,
        columns: Vec<String>,
    },
}

#[derive(Debug, Clone)]
struct Edge {
    from: usize,
    to: usize,
    deferral: Option<Deferral>,
    /// `Entity.column` of the foreign keys behind the edge.
    columns: Vec<String>,
}

impl Edge {
    /// Child node first, then parent node.
    fn rank(&self) -> (usize, usize) {
        match self.deferral {
            Some(Deferral::PreNull { .. }) => (self.from, self.to),
            _ => (self.to, self.from),
        }
    }
}

#[derive(Debug, Default)]
struct Graph {
    nodes: Vec<PlannedWrite>,
    edges: Vec<Edge>,
    inserts: HashMap<u64, usize>,
    updates: HashMap<u64, usize>,
    deletes: HashMap<u64, usize>,
    post_updates: HashMap<u64, usize>,
    pre_nulls: HashMap<u64, usize>,
}

/// Primary-key predicate of an instance: its identity key, or placeholders
/// for a row inserted earlier in the same flush.
fn pk_predicate(inst: &Instance) -> Vec<(String, PlannedValue)> {
    let key = inst.identity_key();
    inst.mapper()
        .primary_key()
        .enumerate()
        .map(|(i, col)| {
            let value = match &key {
                Some(k) => PlannedValue::Literal(k.primary_key.get(i).cloned().unwrap_or(Value::Null)),
                None => PlannedValue::Bound {
                    parent: inst.clone(),
                    column: col.to_string(),
                },
            };
            (col.to_string(), value)
        })
        .collect()
}

impl Graph {
    fn add_node(&mut self, write: PlannedWrite) -> usize {
        self.nodes.push(write);
        self.nodes.len() - 1
    }

    fn add_edge(&mut self, from: usize, to: usize, deferral: Option<Deferral>, columns: Vec<String>) {
        self.edges.push(Edge {
            from,
            to,
            deferral,
            columns,
        });
    }

    /// Primary UPDATE node of a persistent instance, created on demand.
    fn update_node(&mut self, inst: &Instance) -> usize {
        if let Some(&n) = self.updates.get(&inst.id()) {
            return n;
        }
        let mut write = PlannedWrite::for_instance(WriteKind::Update, WritePhase::Primary, inst);
        write.predicate = pk_predicate(inst);
        let n = self.add_node(write);
        self.updates.insert(inst.id(), n);
        n
    }

    fn primary_node(&mut self, inst: &Instance, set: &FlushSet) -> usize {
        match self.inserts.get(&inst.id()) {
            Some(&n) if set.is_new(inst) => n,
            _ => self.update_node(inst),
        }
    }

    fn post_update_node(&mut self, child: &Instance) -> usize {
        if let Some(&n) = self.post_updates.get(&child.id()) {
            return n;
        }
        let mut write = PlannedWrite::for_instance(WriteKind::Update, WritePhase::PostUpdate, child);
        write.predicate = pk_predicate(child);
        let n = self.add_node(write);
        self.post_updates.insert(child.id(), n);
        let primary = self
            .inserts
            .get(&child.id())
            .or_else(|| self.updates.get(&child.id()))
            .copied();
        if let Some(primary) = primary {
            self.add_edge(primary, n, None, Vec::new());
        }
        n
    }

    fn pre_null_node(&mut self, child: &Instance) -> usize {
        if let Some(&n) = self.pre_nulls.get(&child.id()) {
            return n;
        }
        let mut write = PlannedWrite::for_instance(WriteKind::Update, WritePhase::PreDelete, child);
        write.predicate = pk_predicate(child);
        let n = self.add_node(write);
        self.pre_nulls.insert(child.id(), n);
        if let Some(&own_delete) = self.deletes.get(&child.id()) {
            self.add_edge(n, own_delete, None, Vec::new());
        }
        n
    }

    /// Move `values` of the child's primary write (node `child_node`) into
    /// its post-update, ordered after the parent's insert (node `parent`).
    fn defer_insert(
        &mut self,
        parent: usize,
        child_node: usize,
        child: &Instance,
        values: Vec<(String, PlannedValue)>,
    ) {
        {
            let node = &mut self.nodes[child_node];
            for (col, _) in &values {
                if node.kind == WriteKind::Insert {
                    node.set_value(col, PlannedValue::Literal(Value::Null));
                } else {
                    node.values.retain(|(c, _)| c != col);
                }
            }
        }
        let post = self.post_update_node(child);
        for (col, value) in values {
            self.nodes[post].set_value(&col, value);
        }
        self.add_edge(parent, post, None, Vec::new());
        tracing::debug!(entity = child.entity(), "foreign key deferred to post-update");
    }

    fn defer_delete(&mut self, parent_delete: usize, child: &Instance, columns: &[String]) {
        let pre = self.pre_null_node(child);
        for col in columns {
            self.nodes[pre].set_value(col, PlannedValue::Literal(Value::Null));
        }
        self.add_edge(pre, parent_delete, None, Vec::new());
        tracing::debug!(entity = child.entity(), "foreign key nulled before delete");
    }

    /// The edges as a petgraph graph; node `i` is `NodeIndex::new(i)`.
    fn digraph(&self) -> DiGraph<(), ()> {
        let mut graph = DiGraph::with_capacity(self.nodes.len(), self.edges.len());
        for _ in &self.nodes {
            graph.add_node(());
        }
        for edge in &self.edges {
            graph.add_edge(NodeIndex::new(edge.from), NodeIndex::new(edge.to), ());
        }
        graph
    }

    /// Remove deferrable edges until the graph is acyclic. Returns the
    /// number of edges deferred.
    fn break_cycles(&mut self) -> Result<usize> {
        let mut deferred = 0;
        loop {
            let graph = self.digraph();
            let cycle = strongly_connected(&graph)
                .into_iter()
                .filter(|scc| {
                    let first = NodeIndex::new(scc[0]);
                    scc.len() > 1 || graph.contains_edge(first, first)
                })
                .min_by_key(|scc| scc[0]);
            let Some(cycle) = cycle else {
                return Ok(deferred);
            };
            let members: HashSet<usize> = cycle.iter().copied().collect();
            let candidate = self
                .edges
                .iter()
                .enumerate()
                .filter(|(_, e)| {
                    e.deferral.is_some() && members.contains(&e.from) && members.contains(&e.to)
                })
                .min_by_key(|(_, e)| e.rank())
                .map(|(i, _)| i);
            let Some(index) = candidate else {
                return Err(self.cycle_error(&members));
            };
            let edge = self.edges.remove(index);
            match edge.deferral {
                Some(Deferral::PostUpdate { child, values }) => {
                    self.defer_insert(edge.from, edge.to, &child, values);
                }
                Some(Deferral::PreNull { child, columns }) => {
                    self.defer_delete(edge.to, &child, &columns);
                }
                None => {}
            }
            deferred += 1;
        }
    }

    fn cycle_error(&self, members: &HashSet<usize>) -> Error {
        let mut entities: Vec<String> = members
            .iter()
            .filter_map(|&n| self.nodes[n].entity.clone())
            .collect();
        entities.sort();
        entities.dedup();
        let mut columns: Vec<String> = self
            .edges
            .iter()
            .filter(|e| members.contains(&e.from) && members.contains(&e.to))
            .flat_map(|e| e.columns.iter().cloned())
            .collect();
        columns.sort();
        columns.dedup();
        tracing::warn!(?entities, ?columns, "Unresolvable dependency cycle");
        Error::UnresolvableCycle(CycleError { entities, columns })
    }

    /// Kahn's algorithm; among ready nodes the lowest index goes first.
    fn order(&self) -> Result<Vec<usize>> {
        let graph = self.digraph();
        let mut indegree: Vec<usize> = graph
            .node_indices()
            .map(|n| graph.neighbors_directed(n, Direction::Incoming).count())
            .collect();
        let mut ready: BinaryHeap<Reverse<usize>> = indegree
            .iter()
            .enumerate()
            .filter(|(_, d)| **d == 0)
            .map(|(i, _)| Reverse(i))
            .collect();
        let mut order = Vec::with_capacity(self.nodes.len());
        while let Some(Reverse(n)) = ready.pop() {
            order.push(n);
            for t in graph.neighbors_directed(NodeIndex::new(n), Direction::Outgoing) {
                let t = t.index();
                indegree[t] -= 1;
                if indegree[t] == 0 {
                    ready.push(Reverse(t));
                }
            }
        }
        if order.len() != self.nodes.len() {
            return Err(Error::invalid_request(
                "flush dependency graph still has a cycle after deferral",
            ));
        }
        Ok(order)
    }
}

/// Strongly connected components as node indices, each sorted.
fn strongly_connected(graph: &DiGraph<(), ()>) -> Vec<Vec<usize>> {
    tarjan_scc(graph)
        .into_iter()
        .map(|scc| {
            let mut members: Vec<usize> = scc.into_iter().map(NodeIndex::index).collect();
            members.sort_unstable();
            members
        })
        .collect()
}

/// A foreign key between two entities, from the registry's relationships.
#[derive(Debug, Clone, PartialEq, Eq)]
struct ForeignKey {
    child: String,
    parent: String,
    pairs: Vec<ColumnPair>,
}

fn foreign_keys(registry: &Registry) -> Vec<ForeignKey> {
    let mut out: Vec<ForeignKey> = Vec::new();
    for mapper in registry.mappers() {
        for rel in mapper.relationships.iter().filter(|r| r.secondary.is_none()) {
            if rel.foreign_keys.is_empty() {
                continue;
            }
            let (child, parent) = if rel.kind.fk_on_target() {
                (rel.target.clone(), mapper.name.clone())
            } else {
                (mapper.name.clone(), rel.target.clone())
            };
            let fk = ForeignKey {
                child,
                parent,
                pairs: rel.foreign_keys.clone(),
            };
            if !out.contains(&fk) {
                out.push(fk);
            }
        }
    }
    out
}

// ============================================================================
// Planner
// ============================================================================

/// Computes the [`FlushPlan`] for a session's pending changes.
pub(crate) struct FlushPlanner<'a> {
    core: &'a Rc<SessionCore>,
}

impl<'a> FlushPlanner<'a> {
    pub(crate) fn new(core: &'a Rc<SessionCore>) -> Self {
        Self { core }
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub(crate) fn plan(&self) -> Result<FlushPlan> {
        let set = self.collect()?;
        if set.is_empty() {
            return Ok(FlushPlan::default());
        }
        let sync = synchronize(&self.core.registry, &set)?;

        let mut graph = Graph::default();
        self.add_inserts(&mut graph, &set)?;
        self.add_updates(&mut graph, &set)?;
        self.apply_bindings(&mut graph, &set, &sync.bindings)?;
        let link_deletes = self.add_links(&mut graph, sync.links);
        self.add_deletes(&mut graph, &set)?;
        for (node, endpoints) in link_deletes {
            for endpoint in &endpoints {
                if let Some(&del) = graph.deletes.get(&endpoint.id()) {
                    graph.add_edge(node, del, None, Vec::new());
                }
            }
        }
        self.add_delete_edges(&mut graph, &set)?;
        self.check_identities(&mut graph, &set)?;

        let deferred = graph.break_cycles()?;
        let skip = self.finish(&mut graph, &set)?;
        let order = graph.order()?;
        tracing::debug!(
            nodes = graph.nodes.len(),
            edges = graph.edges.len(),
            deferred,
            "Flush plan computed"
        );

        let mut slots: Vec<Option<PlannedWrite>> = graph.nodes.into_iter().map(Some).collect();
        let steps = order
            .into_iter()
            .filter(|n| !skip.contains(n))
            .filter_map(|n| slots[n].take())
            .collect();
        Ok(FlushPlan::new(steps, set.new, set.dirty, set.deleted))
    }

    fn collect(&self) -> Result<FlushSet> {
        let (new, deleted) = {
            let inner = self.core.inner_mut()?;
            (inner.new.to_vec(), inner.deleted.to_vec())
        };
        let dirty = self.core.dirty()?;
        Ok(FlushSet::new(new, dirty, deleted))
    }

    fn add_inserts(&self, graph: &mut Graph, set: &FlushSet) -> Result<()> {
        for inst in &set.new {
            let mut write = PlannedWrite::for_instance(WriteKind::Insert, WritePhase::Primary, inst);
            {
                let st = inst.state()?;
                for col in &inst.mapper().columns {
                    if let Some(v) = st.values.get(&col.name) {
                        write.values.push((col.name.clone(), v.clone().into()));
                    }
                }
            }
            let n = graph.add_node(write);
            graph.inserts.insert(inst.id(), n);
        }
        Ok(())
    }

    fn add_updates(&self, graph: &mut Graph, set: &FlushSet) -> Result<()> {
        for inst in &set.dirty {
            let changed: Vec<(String, PlannedValue)> = {
                let st = inst.state()?;
                inst.mapper()
                    .columns
                    .iter()
                    .filter(|c| !c.primary_key)
                    .filter_map(|c| {
                        let v = st.values.get(&c.name)?;
                        (st.committed.get(&c.name) != Some(v))
                            .then(|| (c.name.clone(), v.clone().into()))
                    })
                    .collect()
            };
            let n = graph.update_node(inst);
            graph.nodes[n].values = changed;
        }
        Ok(())
    }

    /// Fold foreign-key bindings into the primary writes and add the
    /// parent-insert-before-child edges.
    fn apply_bindings(&self, graph: &mut Graph, set: &FlushSet, bindings: &[Binding]) -> Result<()> {
        // Last binding per (child, column) wins.
        let mut last: HashMap<(u64, &str), usize> = HashMap::new();
        for (i, b) in bindings.iter().enumerate() {
            for (col, _) in &b.columns {
                last.insert((b.child.id(), col.as_str()), i);
            }
        }

        for (i, b) in bindings.iter().enumerate() {
            let mut effective: Vec<(String, PlannedValue)> = b
                .columns
                .iter()
                .filter(|(col, _)| last.get(&(b.child.id(), col.as_str())) == Some(&i))
                .cloned()
                .collect();
            if effective.is_empty() {
                continue;
            }
            tracing::trace!(
                relationship = %b.relationship,
                child = %b.child.entity(),
                columns = effective.len(),
                "foreign-key binding"
            );
            let node = graph.primary_node(&b.child, set);

            if !set.is_new(&b.child) {
                let st = b.child.state()?;
                let unchanged: Vec<String> = effective
                    .iter()
                    .filter(|(col, v)| match v {
                        PlannedValue::Literal(l) => st.committed.get(col) == Some(l),
                        PlannedValue::Bound { .. } => false,
                    })
                    .map(|(col, _)| col.clone())
                    .collect();
                graph.nodes[node].values.retain(|(c, _)| !unchanged.contains(c));
                effective.retain(|(c, _)| !unchanged.contains(c));
            }
            for (col, value) in &effective {
                graph.nodes[node].set_value(col, value.clone());
            }

            let Some(parent) = &b.parent else {
                continue;
            };
            let Some(&from) = graph.inserts.get(&parent.id()) else {
                continue;
            };
            let bound: Vec<(String, PlannedValue)> = effective
                .into_iter()
                .filter(|(_, v)| matches!(v, PlannedValue::Bound { parent: p, .. } if p == parent))
                .collect();
            if bound.is_empty() {
                continue;
            }
            if b.post_update {
                graph.defer_insert(from, node, &b.child, bound);
                continue;
            }
            let labels = bound
                .iter()
                .map(|(c, _)| format!("{}.{c}", b.child.entity()))
                .collect();
            let deferral = b.nullable.then(|| Deferral::PostUpdate {
                child: b.child.clone(),
                values: bound,
            });
            graph.add_edge(from, node, deferral, labels);
        }
        Ok(())
    }

    /// Link-row writes, inserts before deletes. Returns the delete nodes
    /// with their endpoints so they can be ordered before endpoint deletes.
    fn add_links(&self, graph: &mut Graph, links: Vec<LinkRow>) -> Vec<(usize, [Instance; 2])> {
        let (inserts, deletes): (Vec<LinkRow>, Vec<LinkRow>) =
            links.into_iter().partition(|l| l.insert);
        for link in inserts {
            let n = graph.add_node(PlannedWrite::link(WriteKind::Insert, &link.table, link.columns));
            for endpoint in &link.endpoints {
                if let Some(&ins) = graph.inserts.get(&endpoint.id()) {
                    graph.add_edge(ins, n, None, Vec::new());
                }
            }
        }
        deletes
            .into_iter()
            .map(|link| {
                let n = graph.add_node(PlannedWrite::link(WriteKind::Delete, &link.table, link.columns));
                (n, link.endpoints)
            })
            .collect()
    }

    fn add_deletes(&self, graph: &mut Graph, set: &FlushSet) -> Result<()> {
        for inst in &set.deleted {
            let mut write = PlannedWrite::for_instance(WriteKind::Delete, WritePhase::Primary, inst);
            write.predicate = pk_predicate(inst);
            if let Some(vc) = &inst.mapper().version_column {
                write.predicate.push((vc.clone(), self.committed_version(inst, vc)?.into()));
                write.versioned = true;
            }
            let n = graph.add_node(write);
            graph.deletes.insert(inst.id(), n);
        }
        Ok(())
    }

    fn committed_version(&self, inst: &Instance, column: &str) -> Result<Value> {
        inst.ensure_attribute(column)?;
        Ok(inst
            .state()?
            .committed
            .get(column)
            .cloned()
            .unwrap_or(Value::Null))
    }

    /// Committed values of `columns`; `None` if any is NULL or unknown.
    fn committed_values<'c>(
        &self,
        inst: &Instance,
        columns: impl Iterator<Item = &'c str>,
    ) -> Result<Option<Vec<Value>>> {
        let key = inst.identity_key();
        let mut out = Vec::new();
        for col in columns {
            let from_key = key.as_ref().and_then(|k| {
                let pos = inst.mapper().primary_key().position(|c| c == col)?;
                k.primary_key.get(pos).cloned()
            });
            if let Some(v) = from_key {
                out.push(v);
                continue;
            }
            if self.core.has_loader() {
                inst.ensure_attribute(col)?;
            }
            match inst.state()?.committed.get(col) {
                Some(v) if !v.is_null() => out.push(v.clone()),
                _ => return Ok(None),
            }
        }
        Ok(Some(out))
    }

    /// Rows referencing a deleted row are deleted or updated first.
    fn add_delete_edges(&self, graph: &mut Graph, set: &FlushSet) -> Result<()> {
        if set.deleted.is_empty() {
            return Ok(());
        }
        let fks = foreign_keys(&self.core.registry);

        let mut parents: HashMap<(usize, Vec<Value>), usize> = HashMap::new();
        for inst in &set.deleted {
            for (i, fk) in fks.iter().enumerate().filter(|(_, fk)| fk.parent == inst.entity()) {
                let cols = fk.pairs.iter().map(|p| p.parent.as_str());
                if let Some(values) = self.committed_values(inst, cols)? {
                    parents.insert((i, values), graph.deletes[&inst.id()]);
                }
            }
        }
        if parents.is_empty() {
            return Ok(());
        }

        let mut children: Vec<(usize, Instance, bool)> = graph
            .deletes
            .values()
            .chain(graph.updates.values())
            .filter_map(|&n| {
                let inst = graph.nodes[n].instance()?.clone();
                Some((n, inst, graph.nodes[n].kind == WriteKind::Delete))
            })
            .collect();
        children.sort_by_key(|(n, _, _)| *n);

        for (node, child, is_delete) in children {
            for (i, fk) in fks.iter().enumerate().filter(|(_, fk)| fk.child == child.entity()) {
                let cols = fk.pairs.iter().map(|p| p.child.as_str());
                let Some(values) = self.committed_values(&child, cols)? else {
                    continue;
                };
                let Some(&parent) = parents.get(&(i, values)) else {
                    continue;
                };
                if parent == node {
                    continue;
                }
                let columns: Vec<String> = fk.pairs.iter().map(|p| p.child.clone()).collect();
                let nullable = child.mapper().all_nullable(columns.iter().map(String::as_str));
                let labels = columns
                    .iter()
                    .map(|c| format!("{}.{c}", child.entity()))
                    .collect();
                let deferral = (is_delete && nullable).then(|| Deferral::PreNull {
                    child: child.clone(),
                    columns,
                });
                graph.add_edge(node, parent, deferral, labels);
            }
        }
        Ok(())
    }

    /// Client-assigned keys of new instances must not collide with a live
    /// instance, unless that instance's row is deleted in this flush.
    fn check_identities(&self, graph: &mut Graph, set: &FlushSet) -> Result<()> {
        let mut claimed = HashMap::new();
        for inst in &set.new {
            let Some(key) = inst.current_key() else {
                continue;
            };
            if claimed.insert(key.clone(), inst.id()).is_some() {
                return Err(Error::DuplicateIdentity(IdentityConflict { key }));
            }
            let existing = self.core.inner_mut()?.identity_map.get(&key);
            match existing {
                Some(other) if other != *inst => {
                    let (Some(&del), Some(&ins)) =
                        (graph.deletes.get(&other.id()), graph.inserts.get(&inst.id()))
                    else {
                        return Err(Error::DuplicateIdentity(IdentityConflict { key }));
                    };
                    graph.add_edge(del, ins, None, Vec::new());
                }
                _ => {}
            }
        }
        Ok(())
    }

    /// Generated keys, required keys and version counters. Returns the
    /// nodes to leave out of the plan (updates left with nothing to set).
    fn finish(&self, graph: &mut Graph, set: &FlushSet) -> Result<HashSet<usize>> {
        for inst in &set.new {
            let n = graph.inserts[&inst.id()];
            let mapper = inst.mapper();
            let node = &mut graph.nodes[n];
            for col in mapper.columns.iter().filter(|c| c.primary_key) {
                let has_value = node
                    .value(&col.name)
                    .is_some_and(|v| v.as_literal().is_none_or(|l| !l.is_null()));
                if has_value {
                    continue;
                }
                if !col.autoincrement {
                    return Err(Error::invalid_request(format!(
                        "{} instance has no value for primary key column '{}'",
                        mapper.name, col.name
                    )));
                }
                node.values.retain(|(c, _)| *c != col.name);
                node.returning.push(col.name.clone());
            }
            if let Some(vc) = &mapper.version_column {
                let unset = node
                    .value(vc)
                    .is_none_or(|v| v.as_literal().is_some_and(Value::is_null));
                if unset {
                    node.set_value(vc, PlannedValue::Literal(Value::BigInt(1)));
                }
            }
        }

        let mut skip = HashSet::new();
        let mut updates: Vec<(u64, usize)> = graph.updates.iter().map(|(k, v)| (*k, *v)).collect();
        updates.sort_by_key(|(_, n)| *n);
        for (_, n) in updates {
            if graph.nodes[n].values.is_empty() {
                skip.insert(n);
                continue;
            }
            let Some(inst) = graph.nodes[n].instance().cloned() else {
                continue;
            };
            if let Some(vc) = &inst.mapper().version_column {
                let current = self.committed_version(&inst, vc)?;
                let node = &mut graph.nodes[n];
                if node.value(vc).is_none() {
                    let next = current.next_version().ok_or_else(|| {
                        Error::invalid_request(format!(
                            "version column {}.{vc} does not hold an integer",
                            inst.entity()
                        ))
                    })?;
                    node.values.push((vc.clone(), next.into()));
                }
                node.predicate.push((vc.clone(), current.into()));
                node.versioned = true;
            }
        }
        for &n in graph.post_updates.values().chain(graph.pre_nulls.values()) {
            if graph.nodes[n].values.is_empty() {
                skip.insert(n);
            }
        }
        Ok(skip)
    }
}

// ============================================================================
// Unit Tests
// ============================================================================
