//! Entity mapper: how one entity maps onto one table.

use crate::field::ColumnInfo;
use crate::key::IdentityKey;
use crate::relationship::RelationshipInfo;
use crate::value::Value;
use serde::{Deserialize, Serialize};

/// Mapping metadata for one entity type.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EntityMapper {
    /// Entity name, unique within a registry.
    pub name: String,
    /// Table the entity's rows live in.
    pub table: String,
    /// Mapped columns in declaration order.
    pub columns: Vec<ColumnInfo>,
    pub relationships: Vec<RelationshipInfo>,
    /// Optimistic concurrency counter column.
    pub version_column: Option<String>,
    /// Verify that DELETE statements matched the expected number of rows.
    pub confirm_deleted_rows: bool,
}

impl EntityMapper {
    pub fn new(name: impl Into<String>, table: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            table: table.into(),
            columns: Vec::new(),
            relationships: Vec::new(),
            version_column: None,
            confirm_deleted_rows: true,
        }
    }

    #[must_use]
    pub fn column(mut self, column: ColumnInfo) -> Self {
        self.columns.push(column);
        self
    }

    #[must_use]
    pub fn relationship(mut self, relationship: RelationshipInfo) -> Self {
        self.relationships.push(relationship);
        self
    }

    /// Use `column` as a version counter; it is added as a NOT NULL column
    /// if not declared.
    #[must_use]
    pub fn version_column(mut self, column: impl Into<String>) -> Self {
        let column = column.into();
        if self.column_info(&column).is_none() {
            self.columns.push(ColumnInfo::new(column.clone()).not_null());
        }
        self.version_column = Some(column);
        self
    }

    #[must_use]
    pub fn confirm_deleted_rows(mut self, value: bool) -> Self {
        self.confirm_deleted_rows = value;
        self
    }

    pub fn column_info(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.name == name)
    }

    pub fn has_column(&self, name: &str) -> bool {
        self.column_info(name).is_some()
    }

    pub fn relationship_info(&self, name: &str) -> Option<&RelationshipInfo> {
        self.relationships.iter().find(|r| r.name == name)
    }

    /// Primary key column names in declaration order.
    pub fn primary_key(&self) -> impl Iterator<Item = &str> {
        self.columns
            .iter()
            .filter(|c| c.primary_key)
            .map(|c| c.name.as_str())
    }

    pub fn is_primary_key(&self, column: &str) -> bool {
        self.column_info(column).is_some_and(|c| c.primary_key)
    }

    /// Whether every column in `columns` accepts NULL.
    pub fn all_nullable<'a>(&self, mut columns: impl Iterator<Item = &'a str>) -> bool {
        columns.all(|c| self.column_info(c).is_some_and(|info| info.nullable))
    }

    /// Build an identity key from a value lookup; `None` if any component
    /// is missing or NULL.
    pub fn identity_key<'a, F>(&self, mut lookup: F) -> Option<IdentityKey>
    where
        F: FnMut(&str) -> Option<&'a Value>,
    {
        let mut pk = Vec::new();
        for col in self.primary_key() {
            match lookup(col) {
                Some(v) if !v.is_null() => pk.push(v.clone()),
                _ => return None,
            }
        }
        if pk.is_empty() {
            return None;
        }
        Some(IdentityKey::new(self.name.clone(), pk))
    }
}
