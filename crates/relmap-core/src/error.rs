//! Error types for relmap operations.

use crate::executor::{WriteAction, WriteKind};
use crate::key::IdentityKey;
use std::fmt;

/// The primary error type for all relmap operations.
#[derive(Debug)]
pub enum Error {
    /// A second live instance claims an identity already held in the session
    DuplicateIdentity(IdentityConflict),
    /// An operation needed a session but the instance has none
    DetachedInstance(String),
    /// The flush dependency graph has a cycle with no deferrable edge
    UnresolvableCycle(CycleError),
    /// A write action failed during flush
    FlushFailed(FlushError),
    /// An UPDATE or DELETE matched an unexpected number of rows
    StaleData(StaleDataError),
    /// API misuse or an invalid state transition
    InvalidRequest(String),
    /// Mapper metadata could not be built
    Schema(SchemaError),
    /// Error reported by the write executor
    Write(WriteError),
    /// Error reported by the loader
    Load(LoadError),
    /// Serialization/deserialization errors
    Serde(String),
    /// Custom error with message
    Custom(String),
}

#[derive(Debug, Clone)]
pub struct IdentityConflict {
    pub key: IdentityKey,
}

#[derive(Debug, Clone)]
pub struct CycleError {
    /// Entities whose rows participate in the unbreakable cycle
    pub entities: Vec<String>,
    /// The non-nullable foreign-key columns forming the cycle
    pub columns: Vec<String>,
}

#[derive(Debug)]
pub struct FlushError {
    /// Position of the failed action in the ordered plan
    pub index: usize,
    pub action: Box<WriteAction>,
    pub cause: Box<Error>,
}

#[derive(Debug, Clone)]
pub struct StaleDataError {
    pub kind: WriteKind,
    pub table: String,
    pub expected: u64,
    pub matched: u64,
}

#[derive(Debug, Clone)]
pub struct SchemaError {
    pub kind: SchemaErrorKind,
    pub message: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchemaErrorKind {
    /// Entity name not registered
    UnknownEntity,
    /// Column referenced but not declared
    UnknownColumn,
    /// Relationship referenced but not declared
    UnknownRelationship,
    /// Entity or relationship declared twice
    Duplicate,
    /// Entity without primary key columns
    MissingPrimaryKey,
    /// Back-reference pair does not line up
    InvalidBackref,
    /// Unknown or contradictory cascade option
    InvalidCascade,
    /// Table or column name is not a plain identifier
    InvalidIdentifier,
}

#[derive(Debug)]
pub struct WriteError {
    pub kind: WriteErrorKind,
    pub message: String,
    pub source: Option<Box<dyn std::error::Error + Send + Sync>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteErrorKind {
    /// Constraint violation (unique, foreign key, not null)
    Constraint,
    /// Connection lost or unavailable
    Connection,
    /// Any other executor failure
    Other,
}

#[derive(Debug, Clone)]
pub struct LoadError {
    pub entity: String,
    pub message: String,
}

impl Error {
    /// Shorthand for [`Error::InvalidRequest`].
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Error::InvalidRequest(message.into())
    }

    pub fn schema(kind: SchemaErrorKind, message: impl Into<String>) -> Self {
        Error::Schema(SchemaError {
            kind,
            message: message.into(),
        })
    }

    /// Is this (or the cause of a failed flush) a stale-data error?
    pub fn is_stale_data(&self) -> bool {
        match self {
            Error::StaleData(_) => true,
            Error::FlushFailed(e) => e.cause.is_stale_data(),
            _ => false,
        }
    }

    /// Is this (or the cause of a failed flush) a constraint violation?
    pub fn is_constraint_violation(&self) -> bool {
        match self {
            Error::Write(w) => w.kind == WriteErrorKind::Constraint,
            Error::FlushFailed(e) => e.cause.is_constraint_violation(),
            _ => false,
        }
    }
}

impl WriteError {
    pub fn new(kind: WriteErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    pub fn constraint(message: impl Into<String>) -> Self {
        Self::new(WriteErrorKind::Constraint, message)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::DuplicateIdentity(e) => write!(f, "Duplicate identity: {}", e),
            Error::DetachedInstance(msg) => write!(f, "Detached instance: {}", msg),
            Error::UnresolvableCycle(e) => write!(f, "Unresolvable cycle: {}", e),
            Error::FlushFailed(e) => write!(f, "Flush failed: {}", e),
            Error::StaleData(e) => write!(f, "Stale data: {}", e),
            Error::InvalidRequest(msg) => write!(f, "Invalid request: {}", msg),
            Error::Schema(e) => write!(f, "Schema error: {}", e.message),
            Error::Write(e) => write!(f, "Write error: {}", e),
            Error::Load(e) => write!(f, "Load error: {}", e),
            Error::Serde(msg) => write!(f, "Serialization error: {}", msg),
            Error::Custom(msg) => write!(f, "{}", msg),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Error::FlushFailed(e) => Some(e.cause.as_ref()),
            Error::Write(e) => e
                .source
                .as_deref()
                .map(|err| err as &(dyn std::error::Error + 'static)),
            _ => None,
        }
    }
}

impl fmt::Display for IdentityConflict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "another instance with identity {} is already present in this session",
            self.key
        )
    }
}

impl fmt::Display for CycleError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "rows of [{}] depend on each other through non-nullable columns [{}]",
            self.entities.join(", "),
            self.columns.join(", ")
        )
    }
}

impl fmt::Display for FlushError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "action #{} ({} on '{}') failed: {}",
            self.index, self.action.kind, self.action.table, self.cause
        )
    }
}

impl fmt::Display for StaleDataError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} statement on table '{}' expected to {} {} row(s); {} were matched.",
            self.kind,
            self.table,
            match self.kind {
                WriteKind::Delete => "delete",
                _ => "update",
            },
            self.expected,
            self.matched
        )
    }
}

impl fmt::Display for SchemaError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for WriteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl fmt::Display for LoadError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "loading {}: {}", self.entity, self.message)
    }
}

impl From<WriteError> for Error {
    fn from(err: WriteError) -> Self {
        Error::Write(err)
    }
}

impl From<LoadError> for Error {
    fn from(err: LoadError) -> Self {
        Error::Load(err)
    }
}

impl From<SchemaError> for Error {
    fn from(err: SchemaError) -> Self {
        Error::Schema(err)
    }
}

impl From<StaleDataError> for Error {
    fn from(err: StaleDataError) -> Self {
        Error::StaleData(err)
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serde(err.to_string())
    }
}

/// Result type alias for relmap operations.
pub type Result<T> = std::result::Result<T, Error>;
