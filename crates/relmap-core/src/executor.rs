//! Collaborator contracts: write execution and loading.
//!
//! The persistence core never talks to a database. It hands an ordered list
//! of [`WriteAction`]s to a [`WriteExecutor`] and asks a [`Loader`] for rows
//! when it needs to materialize unloaded state.

use crate::Result;
use crate::key::IdentityKey;
use crate::mapper::EntityMapper;
use crate::relationship::RelationshipInfo;
use crate::row::Row;
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Kind of row write.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WriteKind {
    Insert,
    Update,
    Delete,
}

impl fmt::Display for WriteKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WriteKind::Insert => "INSERT",
            WriteKind::Update => "UPDATE",
            WriteKind::Delete => "DELETE",
        })
    }
}

/// Why a write is in the plan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum WritePhase {
    /// Insert, update or delete of an entity row.
    #[default]
    Primary,
    /// Deferred foreign-key update issued after both rows exist.
    PostUpdate,
    /// Foreign-key nulling issued before a delete to break a cycle.
    PreDelete,
    /// Insert or delete of a many-to-many link row.
    LinkTable,
}

/// One row-level write handed to the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteAction {
    pub kind: WriteKind,
    pub phase: WritePhase,
    /// Entity the row belongs to; `None` for link-table rows.
    pub entity: Option<String>,
    pub table: String,
    /// Column values to write (INSERT values or UPDATE SET list).
    pub values: Vec<(String, Value)>,
    /// Equality predicate identifying the row (UPDATE / DELETE).
    pub predicate: Vec<(String, Value)>,
    /// Columns whose database-generated values must be reported back.
    pub returning: Vec<String>,
}

impl WriteAction {
    fn new(kind: WriteKind, table: impl Into<String>) -> Self {
        Self {
            kind,
            phase: WritePhase::Primary,
            entity: None,
            table: table.into(),
            values: Vec::new(),
            predicate: Vec::new(),
            returning: Vec::new(),
        }
    }

    pub fn insert(table: impl Into<String>, values: Vec<(String, Value)>) -> Self {
        Self {
            values,
            ..Self::new(WriteKind::Insert, table)
        }
    }

    pub fn update(
        table: impl Into<String>,
        values: Vec<(String, Value)>,
        predicate: Vec<(String, Value)>,
    ) -> Self {
        Self {
            values,
            predicate,
            ..Self::new(WriteKind::Update, table)
        }
    }

    pub fn delete(table: impl Into<String>, predicate: Vec<(String, Value)>) -> Self {
        Self {
            predicate,
            ..Self::new(WriteKind::Delete, table)
        }
    }

    #[must_use]
    pub fn for_entity(mut self, entity: impl Into<String>) -> Self {
        self.entity = Some(entity.into());
        self
    }

    #[must_use]
    pub fn phase(mut self, phase: WritePhase) -> Self {
        self.phase = phase;
        self
    }

    #[must_use]
    pub fn returning(mut self, columns: Vec<String>) -> Self {
        self.returning = columns;
        self
    }

    /// Value written to `column`, if any.
    pub fn value(&self, column: &str) -> Option<&Value> {
        self.values.iter().find(|(c, _)| c == column).map(|(_, v)| v)
    }

    /// Predicate value for `column`, if any.
    pub fn predicate_value(&self, column: &str) -> Option<&Value> {
        self.predicate
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }
}

impl fmt::Display for WriteAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.kind, self.table)?;
        if !self.values.is_empty() {
            let cols: Vec<&str> = self.values.iter().map(|(c, _)| c.as_str()).collect();
            write!(f, " ({})", cols.join(", "))?;
        }
        if !self.predicate.is_empty() {
            let preds: Vec<String> = self
                .predicate
                .iter()
                .map(|(c, v)| format!("{c} = {v}"))
                .collect();
            write!(f, " WHERE {}", preds.join(" AND "))?;
        }
        Ok(())
    }
}

/// What the executor reports back for one action.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WriteOutcome {
    /// Rows matched; `None` when the executor cannot tell.
    pub rows_affected: Option<u64>,
    /// Database-generated column values (for INSERT `returning` columns).
    pub generated: Vec<(String, Value)>,
}

impl WriteOutcome {
    pub fn rows(n: u64) -> Self {
        Self {
            rows_affected: Some(n),
            generated: Vec::new(),
        }
    }

    #[must_use]
    pub fn with_generated(mut self, column: impl Into<String>, value: impl Into<Value>) -> Self {
        self.generated.push((column.into(), value.into()));
        self
    }

    pub fn generated(&self, column: &str) -> Option<&Value> {
        self.generated
            .iter()
            .find(|(c, _)| c == column)
            .map(|(_, v)| v)
    }
}

/// Executes row writes, in the order given, inside one transaction.
pub trait WriteExecutor {
    fn execute(&mut self, action: &WriteAction) -> Result<WriteOutcome>;

    fn commit(&mut self) -> Result<()> {
        Ok(())
    }

    fn rollback(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Produces rows for identities and relationships.
pub trait Loader {
    /// Current row of an identity, `None` if it no longer exists.
    fn load_row(&mut self, mapper: &EntityMapper, key: &IdentityKey) -> Result<Option<Row>>;

    /// Rows of `relationship.target` related to the `source` row of `mapper`.
    fn load_related(
        &mut self,
        mapper: &EntityMapper,
        relationship: &RelationshipInfo,
        source: &Row,
    ) -> Result<Vec<Row>>;
}

impl<T: WriteExecutor + ?Sized> WriteExecutor for Box<T> {
    fn execute(&mut self, action: &WriteAction) -> Result<WriteOutcome> {
        (**self).execute(action)
    }

    fn commit(&mut self) -> Result<()> {
        (**self).commit()
    }

    fn rollback(&mut self) -> Result<()> {
        (**self).rollback()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_display() {
        let action = WriteAction::update(
            "items",
            vec![("order_id".into(), Value::Null)],
            vec![("id".into(), Value::BigInt(3))],
        );
        assert_eq!(action.to_string(), "UPDATE items (order_id) WHERE id = 3");
    }

    #[test]
    fn test_action_lookup() {
        let action = WriteAction::insert("orders", vec![("note".into(), Value::from("x"))])
            .for_entity("Order")
            .returning(vec!["id".into()]);
        assert_eq!(action.value("note"), Some(&Value::Text("x".into())));
        assert!(action.value("id").is_none());
        assert_eq!(action.entity.as_deref(), Some("Order"));
        assert_eq!(action.phase, WritePhase::Primary);
    }

    #[test]
    fn test_outcome_generated() {
        let outcome = WriteOutcome::rows(1).with_generated("id", 10i64);
        assert_eq!(outcome.generated("id"), Some(&Value::BigInt(10)));
        assert_eq!(outcome.rows_affected, Some(1));
    }
}
