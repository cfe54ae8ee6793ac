//! Flush plans and their execution.
//!
//! A [`FlushPlan`] is the ordered list of row writes one flush issues. Values
//! that depend on keys generated earlier in the same flush are carried as
//! [`PlannedValue::Bound`] placeholders and resolved just before each write
//! is handed to the [`WriteExecutor`].

use std::collections::HashMap;
use std::fmt;
use std::rc::Rc;
use std::time::Instant;

use relmap_core::{
    Error, FlushError, Result, StaleDataError, Value, WriteAction, WriteExecutor, WriteKind,
    WriteOutcome, WritePhase,
};
use serde::Serialize;

use crate::dependency::column_value;
use crate::state::{Instance, InstanceStatus};
use crate::unit_of_work::FlushPlanner;
use crate::{SessionCore, SessionEvent};

// ============================================================================
// Plan
// ============================================================================

/// A column value in a planned write.
#[derive(Clone, PartialEq)]
pub enum PlannedValue {
    Literal(Value),
    /// `column` of `parent` as it will be after the parent's earlier write,
    /// typically a generated primary key.
    Bound { parent: Instance, column: String },
}

impl PlannedValue {
    pub fn as_literal(&self) -> Option<&Value> {
        match self {
            PlannedValue::Literal(v) => Some(v),
            PlannedValue::Bound { .. } => None,
        }
    }
}

impl From<Value> for PlannedValue {
    fn from(value: Value) -> Self {
        PlannedValue::Literal(value)
    }
}

impl fmt::Display for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PlannedValue::Literal(v) => write!(f, "{v}"),
            PlannedValue::Bound { parent, column } => {
                write!(f, ":{}#{}.{column}", parent.entity(), parent.id())
            }
        }
    }
}

impl fmt::Debug for PlannedValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// One write of a flush plan, before placeholder resolution.
#[derive(Debug, Clone)]
pub struct PlannedWrite {
    pub kind: WriteKind,
    pub phase: WritePhase,
    pub entity: Option<String>,
    pub table: String,
    pub values: Vec<(String, PlannedValue)>,
    pub predicate: Vec<(String, PlannedValue)>,
    pub returning: Vec<String>,
    pub(crate) instance: Option<Instance>,
    /// Predicated on a version counter.
    pub(crate) versioned: bool,
}

impl PlannedWrite {
    pub(crate) fn for_instance(kind: WriteKind, phase: WritePhase, inst: &Instance) -> Self {
        Self {
            kind,
            phase,
            entity: Some(inst.entity().to_string()),
            table: inst.mapper().table.clone(),
            values: Vec::new(),
            predicate: Vec::new(),
            returning: Vec::new(),
            instance: Some(inst.clone()),
            versioned: false,
        }
    }

    pub(crate) fn link(kind: WriteKind, table: &str, columns: Vec<(String, PlannedValue)>) -> Self {
        let (values, predicate) = match kind {
            WriteKind::Insert => (columns, Vec::new()),
            _ => (Vec::new(), columns),
        };
        Self {
            kind,
            phase: WritePhase::LinkTable,
            entity: None,
            table: table.to_string(),
            values,
            predicate,
            returning: Vec::new(),
            instance: None,
            versioned: false,
        }
    }

    /// Instance whose row this write touches; `None` for link rows.
    pub fn instance(&self) -> Option<&Instance> {
        self.instance.as_ref()
    }

    pub fn value(&self, column: &str) -> Option<&PlannedValue> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    pub(crate) fn set_value(&mut self, column: &str, value: PlannedValue) {
        match self.values.iter_mut().find(|(c, _)| c == column) {
            Some(slot) => slot.1 = value,
            None => self.values.push((column.to_string(), value)),
        }
    }

    fn step(&self, index: usize) -> PlanStep {
        let render = |pairs: &[(String, PlannedValue)]| -> Vec<(String, String)> {
            pairs
                .iter()
                .map(|(c, v)| (c.clone(), v.to_string()))
                .collect()
        };
        PlanStep {
            index,
            kind: self.kind,
            phase: self.phase,
            entity: self.entity.clone(),
            table: self.table.clone(),
            values: render(&self.values),
            predicate: render(&self.predicate),
            returning: self.returning.clone(),
        }
    }
}

/// Serializable view of one planned write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PlanStep {
    pub index: usize,
    pub kind: WriteKind,
    pub phase: WritePhase,
    pub entity: Option<String>,
    pub table: String,
    pub values: Vec<(String, String)>,
    pub predicate: Vec<(String, String)>,
    pub returning: Vec<String>,
}

/// The ordered writes of one flush.
#[derive(Debug, Default)]
pub struct FlushPlan {
    steps: Vec<PlannedWrite>,
    /// Pending instances that become persistent.
    pub(crate) new: Vec<Instance>,
    /// Persistent instances whose changes are committed.
    pub(crate) dirty: Vec<Instance>,
    pub(crate) deleted: Vec<Instance>,
}

impl FlushPlan {
    pub(crate) fn new(
        steps: Vec<PlannedWrite>,
        new: Vec<Instance>,
        dirty: Vec<Instance>,
        deleted: Vec<Instance>,
    ) -> Self {
        Self {
            steps,
            new,
            dirty,
            deleted,
        }
    }

    /// Whether the plan issues no writes.
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    pub fn len(&self) -> usize {
        self.steps.len()
    }

    pub fn steps(&self) -> &[PlannedWrite] {
        &self.steps
    }

    /// Whether the flush has no state to commit back either.
    pub(crate) fn is_noop(&self) -> bool {
        self.steps.is_empty()
            && self.new.is_empty()
            && self.dirty.is_empty()
            && self.deleted.is_empty()
    }

    pub fn describe(&self) -> Vec<PlanStep> {
        self.steps
            .iter()
            .enumerate()
            .map(|(i, s)| s.step(i))
            .collect()
    }

    /// The plan as pretty-printed JSON.
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.describe())?)
    }

    /// Run every write in order.
    ///
    /// Stops at the first failure. Nothing on the instances is changed
    /// here; the returned [`Executed`] carries what commit-back applies.
    #[tracing::instrument(level = "debug", skip(self, executor), fields(steps = self.steps.len()))]
    pub(crate) fn execute(&self, executor: &mut dyn WriteExecutor) -> Result<Executed> {
        let mut done = Executed::default();
        for (index, step) in self.steps.iter().enumerate() {
            let action = done.resolve_action(step)?;
            tracing::trace!(index, action = %action, "Executing write");
            let outcome = executor.execute(&action).map_err(|cause| {
                Error::FlushFailed(FlushError {
                    index,
                    action: Box::new(action.clone()),
                    cause: Box::new(cause),
                })
            })?;
            check_rows(step, &outcome)?;
            done.record(index, step, &action, &outcome)?;
        }
        Ok(done)
    }
}

/// Row counts of a flush.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct FlushResult {
    /// Number of rows inserted.
    pub inserted: usize,
    /// Number of rows updated.
    pub updated: usize,
    /// Number of rows deleted.
    pub deleted: usize,
    /// Deferred foreign-key updates, including nulling before deletes.
    pub post_updated: usize,
    /// Link-table rows inserted or deleted.
    pub links: usize,
}

impl FlushResult {
    /// Total number of writes performed.
    pub fn total(&self) -> usize {
        self.inserted + self.updated + self.deleted + self.post_updated + self.links
    }

    fn count(&mut self, step: &PlannedWrite) {
        match (step.phase, step.kind) {
            (WritePhase::LinkTable, _) => self.links += 1,
            (WritePhase::PostUpdate | WritePhase::PreDelete, _) => self.post_updated += 1,
            (WritePhase::Primary, WriteKind::Insert) => self.inserted += 1,
            (WritePhase::Primary, WriteKind::Update) => self.updated += 1,
            (WritePhase::Primary, WriteKind::Delete) => self.deleted += 1,
        }
    }
}

// ============================================================================
// Execution
// ============================================================================

/// What a successful execution produced.
#[derive(Debug, Default)]
pub(crate) struct Executed {
    pub(crate) result: FlushResult,
    /// Column values written per instance, in write order.
    pub(crate) applied: Vec<(Instance, Vec<(String, Value)>)>,
    /// Values known per instance id: written, then generated.
    known: HashMap<u64, HashMap<String, Value>>,
}

impl Executed {
    fn resolve(&self, value: &PlannedValue) -> Result<Value> {
        match value {
            PlannedValue::Literal(v) => Ok(v.clone()),
            PlannedValue::Bound { parent, column } => {
                match self.known.get(&parent.id()).and_then(|m| m.get(column)) {
                    Some(v) => Ok(v.clone()),
                    None => column_value(parent, column),
                }
            }
        }
    }

    fn resolve_action(&self, step: &PlannedWrite) -> Result<WriteAction> {
        let resolve_all = |pairs: &[(String, PlannedValue)]| -> Result<Vec<(String, Value)>> {
            pairs
                .iter()
                .map(|(c, v)| Ok((c.clone(), self.resolve(v)?)))
                .collect()
        };
        Ok(WriteAction {
            kind: step.kind,
            phase: step.phase,
            entity: step.entity.clone(),
            table: step.table.clone(),
            values: resolve_all(&step.values)?,
            predicate: resolve_all(&step.predicate)?,
            returning: step.returning.clone(),
        })
    }

    fn record(
        &mut self,
        index: usize,
        step: &PlannedWrite,
        action: &WriteAction,
        outcome: &WriteOutcome,
    ) -> Result<()> {
        self.result.count(step);
        let Some(inst) = &step.instance else {
            return Ok(());
        };
        if step.kind == WriteKind::Delete {
            return Ok(());
        }
        let mut written = action.values.clone();
        for col in &step.returning {
            let value = outcome.generated(col).cloned().ok_or_else(|| {
                Error::FlushFailed(FlushError {
                    index,
                    action: Box::new(action.clone()),
                    cause: Box::new(Error::invalid_request(format!(
                        "executor returned no generated value for {}.{col}",
                        step.table
                    ))),
                })
            })?;
            written.push((col.clone(), value));
        }
        let known = self.known.entry(inst.id()).or_default();
        for (col, value) in &written {
            known.insert(col.clone(), value.clone());
        }
        self.applied.push((inst.clone(), written));
        Ok(())
    }
}

fn check_rows(step: &PlannedWrite, outcome: &WriteOutcome) -> Result<()> {
    let Some(matched) = outcome.rows_affected else {
        return Ok(());
    };
    if matched == 1 || step.phase == WritePhase::LinkTable {
        return Ok(());
    }
    let stale = || {
        Error::StaleData(StaleDataError {
            kind: step.kind,
            table: step.table.clone(),
            expected: 1,
            matched,
        })
    };
    match step.kind {
        WriteKind::Insert => Ok(()),
        WriteKind::Update => Err(stale()),
        WriteKind::Delete if step.versioned => Err(stale()),
        WriteKind::Delete => {
            if step
                .instance
                .as_ref()
                .is_some_and(|i| i.mapper().confirm_deleted_rows)
            {
                tracing::warn!(
                    table = %step.table,
                    expected = 1,
                    matched,
                    "DELETE statement matched an unexpected number of rows"
                );
            }
            Ok(())
        }
    }
}

// ============================================================================
// Session side
// ============================================================================

impl SessionCore {
    /// Plan, execute and commit back all pending changes.
    #[tracing::instrument(level = "info", skip(self))]
    pub(crate) fn flush(self: &Rc<Self>) -> Result<FlushResult> {
        self.check_not_flushing()?;
        if !self.inner_mut()?.active {
            return Err(Error::invalid_request(
                "this session's transaction has been rolled back due to a previous \
                 exception during flush; call rollback() first",
            ));
        }
        self.fire(SessionEvent::BeforeFlush)?;
        self.process_orphans()?;
        let pruned = self.inner_mut()?.identity_map.prune();
        if pruned > 0 {
            tracing::debug!(pruned, "released identities pruned");
        }

        let plan = FlushPlanner::new(self).plan()?;
        if plan.is_noop() {
            tracing::debug!("Nothing to flush");
            return Ok(FlushResult::default());
        }

        tracing::info!(
            writes = plan.len(),
            new = plan.new.len(),
            dirty = plan.dirty.len(),
            deleted = plan.deleted.len(),
            "Executing flush plan"
        );
        let start = Instant::now();

        self.flushing.set(true);
        let executed = match self.executor.try_borrow_mut() {
            Ok(mut executor) => plan.execute(&mut **executor),
            Err(_) => Err(Error::invalid_request("executor is busy and cannot be re-entered")),
        };
        self.flushing.set(false);

        let executed = match executed {
            Ok(executed) => executed,
            Err(e) => {
                self.inner_mut()?.active = false;
                tracing::warn!(error = %e, "Flush failed; session is inactive until rollback");
                return Err(e);
            }
        };

        self.commit_back(&plan, &executed)?;
        self.fire(SessionEvent::AfterFlush)?;

        let result = executed.result;
        tracing::info!(
            elapsed_ms = start.elapsed().as_millis(),
            inserted = result.inserted,
            updated = result.updated,
            deleted = result.deleted,
            post_updated = result.post_updated,
            links = result.links,
            "Flush complete"
        );
        Ok(result)
    }

    /// Apply written and generated values, clear change tracking and move
    /// instances to their post-flush status.
    fn commit_back(self: &Rc<Self>, plan: &FlushPlan, executed: &Executed) -> Result<()> {
        for (inst, written) in &executed.applied {
            let mut st = inst.state_mut()?;
            for (col, value) in written {
                st.values.insert(col.clone(), value.clone());
            }
        }

        let mut touched: Vec<Instance> = plan
            .new
            .iter()
            .chain(&plan.dirty)
            .chain(executed.applied.iter().map(|(i, _)| i))
            .filter(|i| !plan.deleted.contains(i))
            .cloned()
            .collect();
        touched.sort_by_key(Instance::id);
        touched.dedup();
        for inst in &touched {
            inst.state_mut()?.commit_all();
        }

        let mut inner = self.inner_mut()?;
        for inst in &plan.deleted {
            let key = {
                let mut st = inst.state_mut()?;
                st.status = InstanceStatus::Detached;
                st.session = None;
                st.history.clear();
                st.key.clone()
            };
            if let Some(key) = key {
                inner.identity_map.remove(&key, inst);
            }
            inner.flushed_deleted.insert(inst);
        }
        for inst in &plan.new {
            let key = inst.current_key().ok_or_else(|| {
                Error::invalid_request(format!(
                    "{} instance has no complete primary key after insert",
                    inst.entity()
                ))
            })?;
            {
                let mut st = inst.state_mut()?;
                st.status = InstanceStatus::Persistent;
                st.key = Some(key.clone());
            }
            inner.identity_map.insert(key, inst)?;
            inner.flushed_new.insert(inst);
        }
        inner.new.take();
        inner.deleted.take();
        inner.modified.take();
        inner.orphans.take();
        Ok(())
    }

    pub(crate) fn commit_executor(&self) -> Result<()> {
        self.executor
            .try_borrow_mut()
            .map_err(|_| Error::invalid_request("executor is busy and cannot be re-entered"))?
            .commit()
    }

    /// Roll back the executor and restore instance state to the start of
    /// the transaction.
    pub(crate) fn rollback(self: &Rc<Self>) -> Result<()> {
        let outcome = self
            .executor
            .try_borrow_mut()
            .map_err(|_| Error::invalid_request("executor is busy and cannot be re-entered"))?
            .rollback();

        let (flushed_new, flushed_deleted, pending, deleted) = {
            let mut inner = self.inner_mut()?;
            inner.modified.take();
            inner.orphans.take();
            (
                inner.flushed_new.take(),
                inner.flushed_deleted.take(),
                inner.new.take(),
                inner.deleted.take(),
            )
        };

        for inst in &flushed_deleted {
            let key = {
                let mut st = inst.state_mut()?;
                st.status = InstanceStatus::Persistent;
                st.session = Some(Rc::downgrade(self));
                st.key.clone()
            };
            if let Some(key) = key {
                self.inner_mut()?.identity_map.insert(key, inst)?;
            }
        }
        for inst in &flushed_new {
            let key = {
                let mut st = inst.state_mut()?;
                st.status = InstanceStatus::Transient;
                st.session = None;
                st.committed.clear();
                st.expired.clear();
                st.key.take()
            };
            if let Some(key) = key {
                self.inner_mut()?.identity_map.remove(&key, inst);
            }
        }
        for inst in &pending {
            self.expunge_one(inst)?;
        }
        for inst in &deleted {
            if inst.status() == InstanceStatus::Deleted {
                inst.state_mut()?.status = InstanceStatus::Persistent;
            }
        }

        let expired = self.expire_everything()?;
        self.inner_mut()?.active = true;
        tracing::info!(
            reverted_inserts = flushed_new.len(),
            restored_deletes = flushed_deleted.len() + deleted.len(),
            expunged = pending.len(),
            expired,
            "Rollback complete"
        );
        outcome
    }
}

// ============================================================================
// Unit Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use relmap_core::{ColumnInfo, EntityMapper};
    use std::sync::Arc;

    fn order() -> Instance {
        Instance::new(Arc::new(
            EntityMapper::new("Order", "orders")
                .column(ColumnInfo::new("id").primary_key().autoincrement())
                .column(ColumnInfo::new("note")),
        ))
    }

    struct Scripted {
        rows: u64,
        next_id: i64,
        fail_at: Option<usize>,
        seen: Vec<WriteAction>,
    }

    impl Scripted {
        fn new(rows: u64) -> Self {
            Self {
                rows,
                next_id: 100,
                fail_at: None,
                seen: Vec::new(),
            }
        }
    }

    impl WriteExecutor for Scripted {
        fn execute(&mut self, action: &WriteAction) -> Result<WriteOutcome> {
            if self.fail_at == Some(self.seen.len()) {
                return Err(Error::Write(relmap_core::WriteError::constraint("boom")));
            }
            self.seen.push(action.clone());
            let mut outcome = WriteOutcome::rows(self.rows);
            for col in &action.returning {
                self.next_id += 1;
                outcome = outcome.with_generated(col.clone(), self.next_id);
            }
            Ok(outcome)
        }
    }

    fn insert_step(inst: &Instance) -> PlannedWrite {
        let mut step = PlannedWrite::for_instance(WriteKind::Insert, WritePhase::Primary, inst);
        step.values.push(("note".into(), Value::from("n").into()));
        step.returning.push("id".into());
        step
    }

    #[test]
    fn test_bound_value_display() {
        let parent = order();
        let bound = PlannedValue::Bound {
            parent: parent.clone(),
            column: "id".into(),
        };
        assert_eq!(bound.to_string(), format!(":Order#{}.id", parent.id()));
        assert_eq!(PlannedValue::from(Value::BigInt(3)).to_string(), "3");
        assert!(bound.as_literal().is_none());
    }

    #[test]
    fn test_bound_value_resolves_from_generated_key() {
        let parent = order();
        let mut update =
            PlannedWrite::for_instance(WriteKind::Update, WritePhase::PostUpdate, &parent);
        update.values.push((
            "note".into(),
            PlannedValue::Bound {
                parent: parent.clone(),
                column: "id".into(),
            },
        ));
        let plan = FlushPlan::new(
            vec![insert_step(&parent), update],
            vec![parent.clone()],
            Vec::new(),
            Vec::new(),
        );
        let mut exec = Scripted::new(1);
        let done = plan.execute(&mut exec).unwrap();
        assert_eq!(exec.seen[1].value("note"), Some(&Value::BigInt(101)));
        assert_eq!(done.result.inserted, 1);
        assert_eq!(done.result.post_updated, 1);
        assert_eq!(done.result.total(), 2);
        assert!(parent.state().unwrap().values.is_empty());
    }

    #[test]
    fn test_update_matching_no_rows_is_stale() {
        let inst = order();
        let mut step = PlannedWrite::for_instance(WriteKind::Update, WritePhase::Primary, &inst);
        step.values.push(("note".into(), Value::from("x").into()));
        step.predicate.push(("id".into(), Value::BigInt(1).into()));
        let plan = FlushPlan::new(vec![step], Vec::new(), vec![inst], Vec::new());
        let err = plan.execute(&mut Scripted::new(0)).unwrap_err();
        assert!(err.is_stale_data());
    }

    #[test]
    fn test_unversioned_delete_matching_no_rows_only_warns() {
        let inst = order();
        let mut step = PlannedWrite::for_instance(WriteKind::Delete, WritePhase::Primary, &inst);
        step.predicate.push(("id".into(), Value::BigInt(1).into()));
        let plan = FlushPlan::new(vec![step.clone()], Vec::new(), Vec::new(), vec![inst]);
        assert_eq!(plan.execute(&mut Scripted::new(0)).unwrap().result.deleted, 1);

        step.versioned = true;
        let plan = FlushPlan::new(vec![step], Vec::new(), Vec::new(), Vec::new());
        assert!(plan.execute(&mut Scripted::new(0)).unwrap_err().is_stale_data());
    }

    #[test]
    fn test_executor_error_reports_failed_action() {
        let a = order();
        let b = order();
        let plan = FlushPlan::new(
            vec![insert_step(&a), insert_step(&b)],
            vec![a, b],
            Vec::new(),
            Vec::new(),
        );
        let mut exec = Scripted::new(1);
        exec.fail_at = Some(1);
        match plan.execute(&mut exec) {
            Err(Error::FlushFailed(e)) => {
                assert_eq!(e.index, 1);
                assert_eq!(e.action.table, "orders");
                assert!(e.cause.is_constraint_violation());
            }
            other => panic!("expected FlushFailed, got {other:?}"),
        }
    }

    #[test]
    fn test_describe_serializes() {
        let inst = order();
        let plan = FlushPlan::new(vec![insert_step(&inst)], vec![inst], Vec::new(), Vec::new());
        let steps = plan.describe();
        assert_eq!(steps[0].index, 0);
        assert_eq!(steps[0].values, vec![("note".to_string(), "'n'".to_string())]);
        let json = plan.to_json().unwrap();
        assert!(json.contains("\"Insert\""));
        assert!(json.contains("\"orders\""));
    }

    #[test]
    fn test_link_rows_put_columns_in_predicate_for_delete() {
        let cols = vec![("post_id".to_string(), Value::BigInt(1).into())];
        let ins = PlannedWrite::link(WriteKind::Insert, "post_tags", cols.clone());
        let del = PlannedWrite::link(WriteKind::Delete, "post_tags", cols);
        assert_eq!(ins.values.len(), 1);
        assert!(ins.predicate.is_empty());
        assert_eq!(del.predicate.len(), 1);
        assert!(del.instance().is_none());
    }
}
