//! Relationship metadata.
//!
//! A relationship is a named, directed edge between two entities. The edge
//! carries its cardinality, the foreign-key column pairs that implement it,
//! the cascade policy applied along it and, optionally, the name of the
//! paired relationship on the target entity (the back-reference).

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::error::{Error, SchemaErrorKind};

/// The type of relationship between two entities.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum RelationshipKind {
    /// One-to-one: `User` has one `Profile`; the foreign key lives on the target.
    OneToOne,
    /// Many-to-one: many `Item`s belong to one `Order`; the foreign key lives here.
    #[default]
    ManyToOne,
    /// One-to-many: one `Order` has many `Item`s; the foreign key lives on the target.
    OneToMany,
    /// Many-to-many: `Post`s have many `Tag`s via a link table.
    ManyToMany,
}

impl RelationshipKind {
    /// Whether the attribute holds a collection rather than a single reference.
    pub const fn uselist(self) -> bool {
        matches!(self, Self::OneToMany | Self::ManyToMany)
    }

    /// Whether the foreign-key columns are on the target entity's table.
    pub const fn fk_on_target(self) -> bool {
        matches!(self, Self::OneToMany | Self::OneToOne)
    }
}

/// Passive delete behavior for relationships.
///
/// Controls whether deleting a parent loads its unloaded children so they can
/// be deleted or de-associated, or leaves them to the database's own
/// `ON DELETE` rules.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PassiveDeletes {
    /// Unloaded children are loaded and processed (default behavior).
    #[default]
    Active,
    /// Unloaded children are left alone; loaded ones are still processed.
    Passive,
    /// Like `Passive`, and loaded children are never de-associated either.
    All,
}

/// The set of operations propagated along a relationship.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CascadeOptions {
    pub save_update: bool,
    pub merge: bool,
    pub refresh_expire: bool,
    pub expunge: bool,
    pub delete: bool,
    pub delete_orphan: bool,
}

impl Default for CascadeOptions {
    /// `"save-update, merge"`.
    fn default() -> Self {
        Self {
            save_update: true,
            merge: true,
            ..Self::none()
        }
    }
}

impl CascadeOptions {
    /// No cascades at all.
    pub const fn none() -> Self {
        Self {
            save_update: false,
            merge: false,
            refresh_expire: false,
            expunge: false,
            delete: false,
            delete_orphan: false,
        }
    }

    /// `"all"`: everything except delete-orphan.
    pub const fn all() -> Self {
        Self {
            save_update: true,
            merge: true,
            refresh_expire: true,
            expunge: true,
            delete: true,
            delete_orphan: false,
        }
    }

    /// Parse a comma separated cascade list such as `"all, delete-orphan"`.
    pub fn parse(spec: &str) -> Result<Self, Error> {
        let mut opts = Self::none();
        for token in spec.split(',').map(str::trim).filter(|t| !t.is_empty()) {
            match token {
                "all" => {
                    let delete_orphan = opts.delete_orphan;
                    opts = Self {
                        delete_orphan,
                        ..Self::all()
                    };
                }
                "none" => {}
                "save-update" => opts.save_update = true,
                "merge" => opts.merge = true,
                "refresh-expire" => opts.refresh_expire = true,
                "expunge" => opts.expunge = true,
                "delete" => opts.delete = true,
                "delete-orphan" => opts.delete_orphan = true,
                other => {
                    return Err(Error::schema(
                        SchemaErrorKind::InvalidCascade,
                        format!("invalid cascade option '{other}'"),
                    ));
                }
            }
        }
        if opts.delete_orphan && !opts.delete {
            tracing::warn!(cascade = spec, "delete-orphan cascade normally requires delete");
        }
        Ok(opts)
    }
}

impl FromStr for CascadeOptions {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl fmt::Display for CascadeOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = [
            (self.save_update, "save-update"),
            (self.merge, "merge"),
            (self.refresh_expire, "refresh-expire"),
            (self.expunge, "expunge"),
            (self.delete, "delete"),
            (self.delete_orphan, "delete-orphan"),
        ];
        let enabled: Vec<&str> = names
            .iter()
            .filter(|(on, _)| *on)
            .map(|(_, name)| *name)
            .collect();
        if enabled.is_empty() {
            write!(f, "none")
        } else {
            write!(f, "{}", enabled.join(", "))
        }
    }
}

/// A referencing column and the column it references.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnPair {
    /// Foreign-key column on the dependent (child) table
    pub child: String,
    /// Referenced column on the parent table, usually its primary key
    pub parent: String,
}

impl ColumnPair {
    pub fn new(child: impl Into<String>, parent: impl Into<String>) -> Self {
        Self {
            child: child.into(),
            parent: parent.into(),
        }
    }
}

/// Information about a link table for many-to-many relationships.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LinkTableInfo {
    /// The link table name (e.g., `"post_tags"`).
    pub table: String,
    /// Link columns referencing the relationship's own entity.
    pub local: Vec<ColumnPair>,
    /// Link columns referencing the target entity.
    pub remote: Vec<ColumnPair>,
}

impl LinkTableInfo {
    /// Single-column link table: `local_column -> <source>.id`,
    /// `remote_column -> <target>.id`.
    pub fn new(
        table: impl Into<String>,
        local_column: impl Into<String>,
        remote_column: impl Into<String>,
    ) -> Self {
        Self {
            table: table.into(),
            local: vec![ColumnPair::new(local_column, "id")],
            remote: vec![ColumnPair::new(remote_column, "id")],
        }
    }

    /// Composite link table.
    pub fn composite(table: impl Into<String>, local: Vec<ColumnPair>, remote: Vec<ColumnPair>) -> Self {
        Self {
            table: table.into(),
            local,
            remote,
        }
    }

    /// The same link table seen from the other side.
    #[must_use]
    pub fn reversed(&self) -> Self {
        Self {
            table: self.table.clone(),
            local: self.remote.clone(),
            remote: self.local.clone(),
        }
    }
}

/// How a keyed collection derives the key of a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum KeyFunction {
    /// Value of one attribute of the member.
    Column(String),
    /// Tuple of several attributes, keyed as `Value::Array`.
    Columns(Vec<String>),
}

/// Container semantics of a collection-valued relationship.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum CollectionKind {
    /// Ordered, duplicates of the same instance are ignored.
    #[default]
    List,
    /// Unordered, unique members.
    Set,
    /// Dictionary keyed by a function of the member, computed at insertion.
    Keyed(KeyFunction),
}

/// Metadata about a relationship between two entities.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipInfo {
    /// Attribute name on the owning entity.
    pub name: String,

    /// Target entity name.
    pub target: String,

    /// Cardinality.
    pub kind: RelationshipKind,

    /// Foreign-key pairs (child column, parent column).
    ///
    /// For many-to-one the child columns are on this entity; for one-to-many
    /// and one-to-one they are on the target. Unused for many-to-many.
    pub foreign_keys: Vec<ColumnPair>,

    /// Link table for many-to-many relationships.
    pub secondary: Option<LinkTableInfo>,

    pub cascade: CascadeOptions,

    pub passive_deletes: PassiveDeletes,

    /// Paired relationship on the target entity.
    pub back_populates: Option<String>,

    /// Always write this relationship's foreign key with a separate UPDATE
    /// after both rows exist.
    pub post_update: bool,

    /// Container used for collection-valued relationships.
    pub collection: CollectionKind,

    /// Unparseable cascade spec, reported when the registry is built.
    #[serde(skip)]
    pub(crate) cascade_error: Option<String>,
}

impl RelationshipInfo {
    /// Create a new relationship with defaults.
    pub fn new(name: impl Into<String>, target: impl Into<String>, kind: RelationshipKind) -> Self {
        Self {
            name: name.into(),
            target: target.into(),
            kind,
            foreign_keys: Vec::new(),
            secondary: None,
            cascade: CascadeOptions::default(),
            passive_deletes: PassiveDeletes::Active,
            back_populates: None,
            post_update: false,
            collection: CollectionKind::List,
            cascade_error: None,
        }
    }

    pub fn many_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::ManyToOne)
    }

    pub fn one_to_many(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::OneToMany)
    }

    pub fn one_to_one(name: impl Into<String>, target: impl Into<String>) -> Self {
        Self::new(name, target, RelationshipKind::OneToOne)
    }

    pub fn many_to_many(
        name: impl Into<String>,
        target: impl Into<String>,
        link_table: LinkTableInfo,
    ) -> Self {
        let mut rel = Self::new(name, target, RelationshipKind::ManyToMany);
        rel.secondary = Some(link_table);
        rel
    }

    /// Add a foreign-key pair: `child` references `parent`.
    #[must_use]
    pub fn foreign_key(mut self, child: impl Into<String>, parent: impl Into<String>) -> Self {
        self.foreign_keys.push(ColumnPair::new(child, parent));
        self
    }

    #[must_use]
    pub fn back_populates(mut self, name: impl Into<String>) -> Self {
        self.back_populates = Some(name.into());
        self
    }

    /// Set the cascade policy from a spec such as `"all, delete-orphan"`.
    #[must_use]
    pub fn cascade(mut self, spec: &str) -> Self {
        match CascadeOptions::parse(spec) {
            Ok(opts) => {
                self.cascade = opts;
                self.cascade_error = None;
            }
            Err(e) => self.cascade_error = Some(e.to_string()),
        }
        self
    }

    #[must_use]
    pub fn cascade_options(mut self, opts: CascadeOptions) -> Self {
        self.cascade = opts;
        self.cascade_error = None;
        self
    }

    #[must_use]
    pub fn passive_deletes(mut self, value: PassiveDeletes) -> Self {
        self.passive_deletes = value;
        self
    }

    #[must_use]
    pub fn post_update(mut self, value: bool) -> Self {
        self.post_update = value;
        self
    }

    #[must_use]
    pub fn collection(mut self, kind: CollectionKind) -> Self {
        self.collection = kind;
        self
    }

    /// Whether the attribute holds a collection.
    pub const fn uselist(&self) -> bool {
        self.kind.uselist()
    }

    pub(crate) fn cascade_error(&self) -> Option<&str> {
        self.cascade_error.as_deref()
    }
}
