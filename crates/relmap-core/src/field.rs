//! Column metadata.

use serde::{Deserialize, Serialize};

/// Metadata about a single mapped column.
///
/// Every scalar attribute of an entity corresponds to exactly one column of
/// its table; the attribute name and the column name are the same.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnInfo {
    /// Column (and attribute) name
    pub name: String,
    /// Whether NULL may be written to this column
    pub nullable: bool,
    /// Whether this column is part of the primary key
    pub primary_key: bool,
    /// Whether the database generates the value on INSERT
    pub autoincrement: bool,
}

impl ColumnInfo {
    /// A nullable, non-key column.
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            nullable: true,
            primary_key: false,
            autoincrement: false,
        }
    }

    /// Mark as primary key (implies NOT NULL).
    #[must_use]
    pub fn primary_key(mut self) -> Self {
        self.primary_key = true;
        self.nullable = false;
        self
    }

    /// Value is generated by the database on INSERT.
    #[must_use]
    pub fn autoincrement(mut self) -> Self {
        self.autoincrement = true;
        self
    }

    #[must_use]
    pub fn nullable(mut self, value: bool) -> Self {
        self.nullable = value;
        self
    }

    #[must_use]
    pub fn not_null(self) -> Self {
        self.nullable(false)
    }
}
