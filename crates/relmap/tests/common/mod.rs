//! Shared in-memory collaborators for the integration tests.
#![allow(dead_code)]

use relmap::{
    EntityMapper, Error, IdentityKey, Loader, RelationshipInfo, RelationshipKind, Result, Row,
    Value, WriteAction, WriteError, WriteExecutor, WriteKind, WriteOutcome,
};
use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

// ============================================================================
// Executor
// ============================================================================

/// Shared view of what a [`MockExecutor`] has done, plus knobs to script it.
#[derive(Clone, Default)]
pub struct ExecutorHandle {
    pub log: Rc<RefCell<Vec<WriteAction>>>,
    pub commits: Rc<Cell<usize>>,
    pub rollbacks: Rc<Cell<usize>>,
    /// Fail the first write touching this table with a constraint error.
    pub fail_table: Rc<RefCell<Option<String>>>,
    /// Rows reported for UPDATE and DELETE; `None` reports one row.
    pub rows: Rc<Cell<Option<u64>>>,
}

impl ExecutorHandle {
    pub fn actions(&self) -> Vec<WriteAction> {
        self.log.borrow().clone()
    }

    pub fn len(&self) -> usize {
        self.log.borrow().len()
    }

    pub fn rendered(&self) -> Vec<String> {
        self.log.borrow().iter().map(ToString::to_string).collect()
    }

    pub fn fail_on(&self, table: &str) {
        *self.fail_table.borrow_mut() = Some(table.to_string());
    }

    pub fn report_rows(&self, rows: u64) {
        self.rows.set(Some(rows));
    }
}

/// Records every action; generates keys 1, 2, ... per table for `returning`.
#[derive(Default)]
pub struct MockExecutor {
    handle: ExecutorHandle,
    next_ids: HashMap<String, i64>,
}

impl MockExecutor {
    pub fn new() -> (Self, ExecutorHandle) {
        let exec = Self::default();
        let handle = exec.handle.clone();
        (exec, handle)
    }
}

impl WriteExecutor for MockExecutor {
    fn execute(&mut self, action: &WriteAction) -> Result<WriteOutcome> {
        let failing = self.handle.fail_table.borrow().as_deref() == Some(action.table.as_str());
        if failing {
            self.handle.fail_table.borrow_mut().take();
            return Err(Error::Write(WriteError::constraint(format!(
                "constraint failed on {}",
                action.table
            ))));
        }
        self.handle.log.borrow_mut().push(action.clone());
        match action.kind {
            WriteKind::Insert => {
                let mut outcome = WriteOutcome::rows(1);
                for col in &action.returning {
                    let next = self.next_ids.entry(action.table.clone()).or_insert(0);
                    *next += 1;
                    outcome = outcome.with_generated(col.clone(), *next);
                }
                Ok(outcome)
            }
            WriteKind::Update | WriteKind::Delete => {
                Ok(WriteOutcome::rows(self.handle.rows.get().unwrap_or(1)))
            }
        }
    }

    fn commit(&mut self) -> Result<()> {
        self.handle.commits.set(self.handle.commits.get() + 1);
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        self.handle.rollbacks.set(self.handle.rollbacks.get() + 1);
        Ok(())
    }
}

// ============================================================================
// Loader
// ============================================================================

/// Rows keyed by entity name, plus link-table rows keyed by table name.
#[derive(Clone, Default)]
pub struct LoaderHandle {
    pub rows: Rc<RefCell<HashMap<String, Vec<Row>>>>,
    pub links: Rc<RefCell<HashMap<String, Vec<Row>>>>,
    pub row_loads: Rc<Cell<usize>>,
    pub related_loads: Rc<Cell<usize>>,
}

impl LoaderHandle {
    pub fn insert(&self, entity: &str, row: Row) {
        self.rows
            .borrow_mut()
            .entry(entity.to_string())
            .or_default()
            .push(row);
    }

    pub fn insert_link(&self, table: &str, row: Row) {
        self.links
            .borrow_mut()
            .entry(table.to_string())
            .or_default()
            .push(row);
    }

    /// Replace the stored value of one column of one row.
    pub fn update(&self, entity: &str, id: i64, column: &str, value: impl Into<Value>) {
        let mut rows = self.rows.borrow_mut();
        let row = rows
            .get_mut(entity)
            .and_then(|rs| rs.iter_mut().find(|r| r.get("id") == Some(&Value::BigInt(id))))
            .expect("row to update");
        row.set(column, value);
    }

    fn find(&self, entity: &str, matches: impl Fn(&Row) -> bool) -> Vec<Row> {
        self.rows
            .borrow()
            .get(entity)
            .map(|rs| rs.iter().filter(|r| matches(r)).cloned().collect())
            .unwrap_or_default()
    }
}

pub struct MockLoader {
    handle: LoaderHandle,
}

impl MockLoader {
    pub fn new() -> (Self, LoaderHandle) {
        let handle = LoaderHandle::default();
        (
            Self {
                handle: handle.clone(),
            },
            handle,
        )
    }
}

fn column_matches(row: &Row, column: &str, value: Option<&Value>) -> bool {
    match (row.get(column), value) {
        (Some(a), Some(b)) => !a.is_null() && a == b,
        _ => false,
    }
}

impl Loader for MockLoader {
    fn load_row(&mut self, mapper: &EntityMapper, key: &IdentityKey) -> Result<Option<Row>> {
        self.handle.row_loads.set(self.handle.row_loads.get() + 1);
        let pk: Vec<&str> = mapper.primary_key().collect();
        Ok(self
            .handle
            .find(&mapper.name, |r| {
                pk.iter()
                    .zip(&key.primary_key)
                    .all(|(col, v)| column_matches(r, col, Some(v)))
            })
            .into_iter()
            .next())
    }

    fn load_related(
        &mut self,
        _mapper: &EntityMapper,
        relationship: &RelationshipInfo,
        source: &Row,
    ) -> Result<Vec<Row>> {
        self.handle
            .related_loads
            .set(self.handle.related_loads.get() + 1);
        let fks = &relationship.foreign_keys;
        Ok(match relationship.kind {
            RelationshipKind::ManyToOne => self.handle.find(&relationship.target, |r| {
                fks.iter()
                    .all(|p| column_matches(r, &p.parent, source.get(&p.child)))
            }),
            RelationshipKind::OneToMany | RelationshipKind::OneToOne => {
                self.handle.find(&relationship.target, |r| {
                    fks.iter()
                        .all(|p| column_matches(r, &p.child, source.get(&p.parent)))
                })
            }
            RelationshipKind::ManyToMany => {
                let Some(link) = &relationship.secondary else {
                    return Ok(Vec::new());
                };
                let links: Vec<Row> = self
                    .handle
                    .links
                    .borrow()
                    .get(&link.table)
                    .map(|rs| {
                        rs.iter()
                            .filter(|r| {
                                link.local
                                    .iter()
                                    .all(|p| column_matches(r, &p.child, source.get(&p.parent)))
                            })
                            .cloned()
                            .collect()
                    })
                    .unwrap_or_default();
                links
                    .iter()
                    .flat_map(|l| {
                        self.handle.find(&relationship.target, |r| {
                            link.remote
                                .iter()
                                .all(|p| column_matches(r, &p.parent, l.get(&p.child)))
                        })
                    })
                    .collect()
            }
        })
    }
}

// ============================================================================
// Rows
// ============================================================================

pub fn row(pairs: &[(&str, Value)]) -> Row {
    Row::from_pairs(pairs.iter().map(|(c, v)| (*c, v.clone())))
}

pub fn int(v: i64) -> Value {
    Value::BigInt(v)
}

pub fn text(v: &str) -> Value {
    Value::Text(v.to_string())
}
