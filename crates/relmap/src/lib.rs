//! relmap - the persistence core of an object-relational mapper.
//!
//! relmap keeps one in-memory object per row identity, records every change
//! made to those objects, follows relationship cascades, and on flush turns
//! the accumulated changes into a dependency-ordered list of row writes. It
//! never talks to a database: rows come in through a [`Loader`] and writes go
//! out through a [`WriteExecutor`].
//!
//! # Quick Start
//!
//! ```ignore
//! use relmap::prelude::*;
//! use std::sync::Arc;
//!
//! let registry = Arc::new(
//!     Registry::builder()
//!         .entity(
//!             EntityMapper::new("Order", "orders")
//!                 .column(ColumnInfo::new("id").primary_key().autoincrement())
//!                 .relationship(
//!                     RelationshipInfo::one_to_many("items", "Item")
//!                         .foreign_key("order_id", "id")
//!                         .back_populates("order")
//!                         .cascade("all, delete-orphan"),
//!                 ),
//!         )
//!         .entity(
//!             EntityMapper::new("Item", "items")
//!                 .column(ColumnInfo::new("id").primary_key().autoincrement())
//!                 .column(ColumnInfo::new("order_id"))
//!                 .relationship(RelationshipInfo::many_to_one("order", "Order")),
//!         )
//!         .build()?,
//! );
//!
//! let session = Session::new(registry, my_executor);
//! let order = session.create("Order")?;
//! let item = session.create("Item")?;
//! order.append("items", &item)?;
//! session.add(&order)?;
//!
//! // INSERT orders, then INSERT items with order_id bound to the new key
//! session.commit()?;
//! ```
//!
//! # Crates
//!
//! - `relmap-core`: values, errors, mapper metadata, registry and the
//!   collaborator traits
//! - `relmap-session`: instance state, history, collections, identity map,
//!   cascades, flush planning and the [`Session`]

pub use relmap_core::{
    CascadeOptions, CollectionKind, ColumnInfo, ColumnPair, CycleError, EntityMapper, Error,
    FlushError, IdentityConflict, IdentityKey, KeyFunction, LinkTableInfo, LoadError, Loader,
    PassiveDeletes, Registry, RegistryBuilder, RelationshipInfo, RelationshipKind, Result, Row,
    SchemaError, SchemaErrorKind, StaleDataError, Value, WriteAction, WriteError, WriteErrorKind,
    WriteExecutor, WriteKind, WriteOutcome, WritePhase,
};
pub use relmap_session::{
    AddOutcome, AttributeHistory, CollectionAdapter, FlushPlan, FlushResult, History,
    IdentityEvent, IdentityMap, Instance, InstanceStatus, KeyedCollection, ListCollection,
    PlanStep, PlannedValue, PlannedWrite, Session, SessionBuilder, SessionConfig,
    SessionDebugInfo, SessionEvent, SetCollection, WeakInstance, adapter_for,
};

/// Commonly used items.
pub mod prelude {
    pub use crate::{
        // Metadata
        ColumnInfo,
        EntityMapper,
        // Errors
        Error,
        // Objects
        Instance,
        InstanceStatus,
        // Collaborators
        Loader,
        PassiveDeletes,
        Registry,
        RelationshipInfo,
        Result,
        Row,
        // Session
        Session,
        SessionConfig,
        Value,
        WriteAction,
        WriteExecutor,
        WriteOutcome,
    };
}
