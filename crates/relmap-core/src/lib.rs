//! Core types and traits for relmap.
//!
//! This crate provides the contract layer the persistence core is built on:
//!
//! - `Value` for dynamically-typed column values
//! - `EntityMapper`, `RelationshipInfo` and the validated `Registry`
//! - `WriteExecutor` and `Loader`, the collaborators a session drives
//! - `Error` and the `Result` alias shared by every relmap crate

pub mod error;
pub mod executor;
pub mod field;
pub mod key;
pub mod mapper;
pub mod registry;
pub mod relationship;
pub mod row;
pub mod value;

pub use error::{
    CycleError, Error, FlushError, IdentityConflict, LoadError, Result, SchemaError,
    SchemaErrorKind, StaleDataError, WriteError, WriteErrorKind,
};
pub use executor::{Loader, WriteAction, WriteExecutor, WriteKind, WriteOutcome, WritePhase};
pub use field::ColumnInfo;
pub use key::IdentityKey;
pub use mapper::EntityMapper;
pub use registry::{Registry, RegistryBuilder};
pub use relationship::{
    CascadeOptions, CollectionKind, ColumnPair, KeyFunction, LinkTableInfo, PassiveDeletes,
    RelationshipInfo, RelationshipKind,
};
pub use row::Row;
pub use value::Value;
