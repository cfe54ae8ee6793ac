//! Session and Unit of Work for relmap.
//!
//! `relmap-session` is the **persistence core**. It coordinates object
//! identity, change tracking, cascades and dependency-ordered flushing of
//! row writes.
//!
//! # Role In The Architecture
//!
//! - **Identity map**: a single in-memory [`Instance`] per row identity.
//! - **Instrumented attributes**: every mutation records history and keeps
//!   back-references in step.
//! - **Cascades**: add, delete, merge, expire, refresh and expunge follow the
//!   relationship graph according to each edge's cascade policy.
//! - **Unit of work**: flush turns the recorded changes into an ordered list
//!   of [`WriteAction`](relmap_core::WriteAction)s, hands them to a
//!   [`WriteExecutor`] and commits the resulting state back.
//!
//! # Threading
//!
//! A session and its instances are single-threaded (`!Send`). Re-entrant use
//! while the session is busy, such as mutating an instance from inside a
//! flush callback, fails with [`Error::InvalidRequest`].
//!
//! # Example
//!
//! ```ignore
//! let session = Session::new(registry, executor);
//!
//! let order = session.create("Order")?;
//! let item = session.create("Item")?;
//! order.append("items", &item)?;
//!
//! // Cascades along Order.items
//! session.add(&order)?;
//!
//! // INSERT orders, then INSERT items with the generated order id
//! session.commit()?;
//! ```

mod attributes;
mod cascade;
pub mod collection;
mod dependency;
pub mod flush;
pub mod history;
pub mod identity_map;
mod loading;
pub mod state;
mod unit_of_work;

pub use collection::{
    AddOutcome, CollectionAdapter, KeyedCollection, ListCollection, SetCollection, adapter_for,
};
pub use flush::{FlushPlan, FlushResult, PlanStep, PlannedValue, PlannedWrite};
pub use history::{AttributeHistory, History};
pub use identity_map::{IdentityEvent, IdentityMap};
pub use state::{Instance, InstanceStatus, WeakInstance};

use std::cell::{Cell, RefCell, RefMut};
use std::collections::HashSet;
use std::rc::Rc;
use std::sync::Arc;

use unit_of_work::FlushPlanner;

use relmap_core::{Error, IdentityKey, Loader, Registry, Result, Row, Value, WriteExecutor};
use serde::Serialize;

// ============================================================================
// Session Events
// ============================================================================

/// Type alias for session event callbacks.
///
/// Callbacks receive no arguments and return `Result<()>`.
type SessionEventFn = Box<dyn FnMut() -> Result<()>>;

/// Type alias for identity-map membership callbacks.
type IdentityEventFn = Box<dyn FnMut(&IdentityKey) -> Result<()>>;

/// Holds registered session-level event callbacks.
///
/// Callbacks are invoked in registration order. If any callback returns
/// `Err`, the operation is aborted and the error is propagated.
#[derive(Default)]
pub struct SessionEventCallbacks {
    before_flush: Vec<SessionEventFn>,
    after_flush: Vec<SessionEventFn>,
    before_commit: Vec<SessionEventFn>,
    after_commit: Vec<SessionEventFn>,
    after_rollback: Vec<SessionEventFn>,
    on_attach: Vec<IdentityEventFn>,
    on_detach: Vec<IdentityEventFn>,
}

impl std::fmt::Debug for SessionEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionEventCallbacks")
            .field("before_flush", &self.before_flush.len())
            .field("after_flush", &self.after_flush.len())
            .field("before_commit", &self.before_commit.len())
            .field("after_commit", &self.after_commit.len())
            .field("after_rollback", &self.after_rollback.len())
            .field("on_attach", &self.on_attach.len())
            .field("on_detach", &self.on_detach.len())
            .finish()
    }
}

impl SessionEventCallbacks {
    fn fire(&mut self, event: SessionEvent) -> Result<()> {
        let callbacks = match event {
            SessionEvent::BeforeFlush => &mut self.before_flush,
            SessionEvent::AfterFlush => &mut self.after_flush,
            SessionEvent::BeforeCommit => &mut self.before_commit,
            SessionEvent::AfterCommit => &mut self.after_commit,
            SessionEvent::AfterRollback => &mut self.after_rollback,
        };
        for cb in callbacks.iter_mut() {
            cb()?;
        }
        Ok(())
    }

    fn fire_identity(&mut self, event: &IdentityEvent) -> Result<()> {
        let (callbacks, key) = match event {
            IdentityEvent::Attached(key) => (&mut self.on_attach, key),
            IdentityEvent::Detached(key) => (&mut self.on_detach, key),
        };
        for cb in callbacks.iter_mut() {
            cb(key)?;
        }
        Ok(())
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionEvent {
    /// Fired before flush executes pending changes.
    BeforeFlush,
    /// Fired after flush completes successfully.
    AfterFlush,
    /// Fired before commit (before its flush).
    BeforeCommit,
    /// Fired after commit completes successfully.
    AfterCommit,
    /// Fired after rollback completes.
    AfterRollback,
}

// ============================================================================
// Session Configuration
// ============================================================================

/// Configuration for Session behavior.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether to flush pending changes before `get` consults the loader.
    pub autoflush: bool,
    /// Whether to expire all instances after commit.
    pub expire_on_commit: bool,
    /// Whether back-reference events also cascade save-update into this
    /// session.
    pub cascade_backrefs: bool,
    /// Whether the identity map holds unmodified instances weakly.
    pub weak_identity_map: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            autoflush: true,
            expire_on_commit: true,
            cascade_backrefs: false,
            weak_identity_map: false,
        }
    }
}

impl SessionConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn autoflush(mut self, value: bool) -> Self {
        self.autoflush = value;
        self
    }

    #[must_use]
    pub fn expire_on_commit(mut self, value: bool) -> Self {
        self.expire_on_commit = value;
        self
    }

    #[must_use]
    pub fn cascade_backrefs(mut self, value: bool) -> Self {
        self.cascade_backrefs = value;
        self
    }

    #[must_use]
    pub fn weak_identity_map(mut self, value: bool) -> Self {
        self.weak_identity_map = value;
        self
    }
}

// ============================================================================
// Session internals
// ============================================================================

/// Insertion-ordered set of instances.
#[derive(Debug, Default)]
pub(crate) struct InstanceSet {
    items: Vec<Instance>,
    ids: HashSet<u64>,
}

impl InstanceSet {
    pub(crate) fn insert(&mut self, inst: &Instance) -> bool {
        if !self.ids.insert(inst.id()) {
            return false;
        }
        self.items.push(inst.clone());
        true
    }

    pub(crate) fn remove(&mut self, inst: &Instance) -> bool {
        if !self.ids.remove(&inst.id()) {
            return false;
        }
        self.items.retain(|i| i != inst);
        true
    }

    pub(crate) fn to_vec(&self) -> Vec<Instance> {
        self.items.clone()
    }

    pub(crate) fn len(&self) -> usize {
        self.items.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub(crate) fn take(&mut self) -> Vec<Instance> {
        self.ids.clear();
        std::mem::take(&mut self.items)
    }
}

/// Mutable bookkeeping of a session.
#[derive(Debug)]
pub(crate) struct SessionInner {
    pub(crate) identity_map: IdentityMap,
    /// Pending instances, in the order they were added.
    pub(crate) new: InstanceSet,
    /// Instances marked for deletion.
    pub(crate) deleted: InstanceSet,
    /// Persistent instances with unflushed changes, held strongly.
    pub(crate) modified: InstanceSet,
    /// Delete-orphan candidates.
    pub(crate) orphans: InstanceSet,
    /// False after a failed flush, until rollback.
    pub(crate) active: bool,
    /// Inserted during the current transaction.
    pub(crate) flushed_new: InstanceSet,
    /// Deleted during the current transaction.
    pub(crate) flushed_deleted: InstanceSet,
}

impl SessionInner {
    fn new(weak: bool) -> Self {
        Self {
            identity_map: if weak {
                IdentityMap::weak()
            } else {
                IdentityMap::new()
            },
            new: InstanceSet::default(),
            deleted: InstanceSet::default(),
            modified: InstanceSet::default(),
            orphans: InstanceSet::default(),
            active: true,
            flushed_new: InstanceSet::default(),
            flushed_deleted: InstanceSet::default(),
        }
    }
}

/// Shared state behind a [`Session`]; instances hold a weak reference to it.
pub(crate) struct SessionCore {
    pub(crate) registry: Arc<Registry>,
    pub(crate) config: SessionConfig,
    pub(crate) inner: RefCell<SessionInner>,
    pub(crate) flushing: Cell<bool>,
    pub(crate) executor: RefCell<Box<dyn WriteExecutor>>,
    pub(crate) loader: RefCell<Option<Box<dyn Loader>>>,
    pub(crate) events: RefCell<SessionEventCallbacks>,
}

impl std::fmt::Debug for SessionCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionCore")
            .field("config", &self.config)
            .field("flushing", &self.flushing.get())
            .field("has_loader", &self.loader.try_borrow().map(|l| l.is_some()).ok())
            .finish_non_exhaustive()
    }
}

impl SessionCore {
    pub(crate) fn inner_mut(&self) -> Result<RefMut<'_, SessionInner>> {
        self.inner
            .try_borrow_mut()
            .map_err(|_| Error::invalid_request("session is busy and cannot be re-entered"))
    }

    /// Reject mutations while a flush is executing.
    pub(crate) fn check_not_flushing(&self) -> Result<()> {
        if self.flushing.get() {
            return Err(Error::invalid_request(
                "session is flushing; instances cannot be modified until the flush completes",
            ));
        }
        Ok(())
    }

    pub(crate) fn mark_modified(&self, inst: &Instance) -> Result<()> {
        if matches!(
            inst.status(),
            InstanceStatus::Persistent | InstanceStatus::Deleted
        ) {
            self.inner_mut()?.modified.insert(inst);
        }
        Ok(())
    }

    pub(crate) fn schedule_orphan(&self, inst: &Instance) -> Result<()> {
        tracing::trace!(entity = inst.entity(), id = inst.id(), "orphan candidate");
        self.inner_mut()?.orphans.insert(inst);
        Ok(())
    }

    pub(crate) fn cancel_orphan(&self, inst: &Instance) -> Result<()> {
        self.inner_mut()?.orphans.remove(inst);
        Ok(())
    }

    pub(crate) fn fire(&self, event: SessionEvent) -> Result<()> {
        let mut events = self
            .events
            .try_borrow_mut()
            .map_err(|_| Error::invalid_request("session events cannot fire re-entrantly"))?;
        events.fire(event)
    }

    /// Deliver identity-map membership changes to listeners.
    pub(crate) fn dispatch_identity_events(&self) -> Result<()> {
        let pending = self.inner_mut()?.identity_map.drain_events();
        if pending.is_empty() {
            return Ok(());
        }
        let mut events = self
            .events
            .try_borrow_mut()
            .map_err(|_| Error::invalid_request("session events cannot fire re-entrantly"))?;
        for event in &pending {
            events.fire_identity(event)?;
        }
        Ok(())
    }

    /// Persistent instances with unflushed changes, in creation order.
    pub(crate) fn dirty(&self) -> Result<Vec<Instance>> {
        let mut inner = self.inner_mut()?;
        let mut dirty: Vec<Instance> = inner
            .identity_map
            .all()
            .into_iter()
            .chain(inner.modified.to_vec())
            .filter(|i| i.status() == InstanceStatus::Persistent && i.is_modified())
            .collect();
        dirty.sort_by_key(Instance::id);
        dirty.dedup();
        Ok(dirty)
    }

    pub(crate) fn has_pending_changes(&self) -> Result<bool> {
        {
            let inner = self.inner_mut()?;
            if !inner.new.is_empty() || !inner.deleted.is_empty() || !inner.orphans.is_empty() {
                return Ok(true);
            }
        }
        Ok(!self.dirty()?.is_empty())
    }

    /// Expire every persistent instance in the identity map.
    pub(crate) fn expire_everything(&self) -> Result<usize> {
        let all = self.inner_mut()?.identity_map.all();
        let mut count = 0;
        for inst in all {
            if inst.status() == InstanceStatus::Persistent {
                let mut st = inst.state_mut()?;
                st.expire_all(inst.mapper());
                count += 1;
            }
        }
        self.inner_mut()?.modified.take();
        Ok(count)
    }
}

// ============================================================================
// Session
// ============================================================================

/// A unit-of-work session over a validated [`Registry`].
///
/// The session owns a [`WriteExecutor`] that receives the ordered row writes
/// of each flush, and optionally a [`Loader`] used for lazy loads, expired
/// attribute reloads, `refresh` and `get`.
#[derive(Debug, Clone)]
pub struct Session {
    core: Rc<SessionCore>,
}

/// Builder for [`Session`].
pub struct SessionBuilder {
    registry: Arc<Registry>,
    config: SessionConfig,
    loader: Option<Box<dyn Loader>>,
}

impl std::fmt::Debug for SessionBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionBuilder")
            .field("config", &self.config)
            .field("has_loader", &self.loader.is_some())
            .finish_non_exhaustive()
    }
}

impl SessionBuilder {
    #[must_use]
    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    #[must_use]
    pub fn loader(mut self, loader: impl Loader + 'static) -> Self {
        self.loader = Some(Box::new(loader));
        self
    }

    pub fn build(self, executor: impl WriteExecutor + 'static) -> Session {
        Session {
            core: Rc::new(SessionCore {
                registry: self.registry,
                inner: RefCell::new(SessionInner::new(self.config.weak_identity_map)),
                config: self.config,
                flushing: Cell::new(false),
                executor: RefCell::new(Box::new(executor)),
                loader: RefCell::new(self.loader),
                events: RefCell::new(SessionEventCallbacks::default()),
            }),
        }
    }
}

impl Session {
    /// Create a session with default configuration and no loader.
    pub fn new(registry: Arc<Registry>, executor: impl WriteExecutor + 'static) -> Self {
        Self::builder(registry).build(executor)
    }

    pub fn builder(registry: Arc<Registry>) -> SessionBuilder {
        SessionBuilder {
            registry,
            config: SessionConfig::default(),
            loader: None,
        }
    }

    pub fn registry(&self) -> &Arc<Registry> {
        &self.core.registry
    }

    pub fn config(&self) -> &SessionConfig {
        &self.core.config
    }

    /// Create a transient instance of a registered entity.
    pub fn create(&self, entity: &str) -> Result<Instance> {
        Instance::of(&self.core.registry, entity)
    }

    /// Whether the session accepts flushes (false after a failed flush).
    pub fn is_active(&self) -> Result<bool> {
        Ok(self.core.inner_mut()?.active)
    }

    // ========================================================================
    // Event Callbacks
    // ========================================================================

    /// Register a callback to run before flush.
    ///
    /// The callback can abort the flush by returning `Err`.
    pub fn on_before_flush(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.core.events.borrow_mut().before_flush.push(Box::new(f));
    }

    /// Register a callback to run after a successful flush.
    pub fn on_after_flush(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.core.events.borrow_mut().after_flush.push(Box::new(f));
    }

    /// Register a callback to run before commit.
    pub fn on_before_commit(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.core.events.borrow_mut().before_commit.push(Box::new(f));
    }

    /// Register a callback to run after a successful commit.
    pub fn on_after_commit(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.core.events.borrow_mut().after_commit.push(Box::new(f));
    }

    /// Register a callback to run after rollback.
    pub fn on_after_rollback(&self, f: impl FnMut() -> Result<()> + 'static) {
        self.core.events.borrow_mut().after_rollback.push(Box::new(f));
    }

    /// Register a callback for identities entering the identity map.
    pub fn on_attach(&self, f: impl FnMut(&IdentityKey) -> Result<()> + 'static) {
        self.core.events.borrow_mut().on_attach.push(Box::new(f));
    }

    /// Register a callback for identities leaving the identity map.
    pub fn on_detach(&self, f: impl FnMut(&IdentityKey) -> Result<()> + 'static) {
        self.core.events.borrow_mut().on_detach.push(Box::new(f));
    }

    // ========================================================================
    // Object Operations
    // ========================================================================

    /// Add an instance (and its save-update cascade) to the session.
    pub fn add(&self, inst: &Instance) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.attach(inst)?;
        self.core.dispatch_identity_events()
    }

    pub fn add_all<'a>(&self, insts: impl IntoIterator<Item = &'a Instance>) -> Result<()> {
        for inst in insts {
            self.add(inst)?;
        }
        Ok(())
    }

    /// Mark an instance (and its delete cascade) for deletion.
    pub fn delete(&self, inst: &Instance) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.delete(inst)?;
        self.core.dispatch_identity_events()
    }

    /// Copy the state of `inst` onto this session's instance of the same
    /// identity, loading or creating it as needed.
    pub fn merge(&self, inst: &Instance) -> Result<Instance> {
        self.core.check_not_flushing()?;
        let merged = self.core.merge(inst, true)?;
        self.core.dispatch_identity_events()?;
        Ok(merged)
    }

    /// Like [`merge`](Self::merge) without consulting the loader; the
    /// counterpart is created persistent with `inst`'s values as committed
    /// state. `inst` must have no unflushed changes.
    pub fn merge_without_load(&self, inst: &Instance) -> Result<Instance> {
        self.core.check_not_flushing()?;
        let merged = self.core.merge(inst, false)?;
        self.core.dispatch_identity_events()?;
        Ok(merged)
    }

    /// Expire the named attributes of a persistent instance, or all of them
    /// when `attrs` is empty.
    pub fn expire(&self, inst: &Instance, attrs: &[&str]) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.expire(inst, attrs)
    }

    #[tracing::instrument(level = "debug", skip(self))]
    pub fn expire_all(&self) -> Result<()> {
        self.core.check_not_flushing()?;
        let count = self.core.expire_everything()?;
        tracing::debug!(count, "Expired all session objects");
        Ok(())
    }

    /// Expire and immediately reload through the loader.
    pub fn refresh(&self, inst: &Instance, attrs: &[&str]) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.refresh(inst, attrs)
    }

    /// Remove an instance (and its expunge cascade) from the session.
    pub fn expunge(&self, inst: &Instance) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.expunge(inst)?;
        self.core.dispatch_identity_events()
    }

    pub fn expunge_all(&self) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.expunge_all()?;
        self.core.dispatch_identity_events()
    }

    /// Turn `inst` back into a transient object.
    ///
    /// It leaves whatever session holds it and loses its identity key and
    /// committed state. Loaded values stay, so adding it again inserts a
    /// new row. Expired attributes are discarded.
    pub fn make_transient(&self, inst: &Instance) -> Result<()> {
        self.core.check_not_flushing()?;
        if let Some(owner) = inst.session_core() {
            owner.check_not_flushing()?;
            owner.expunge_one(inst)?;
            owner.dispatch_identity_events()?;
        }
        let mut st = inst.state_mut()?;
        tracing::debug!(entity = %inst.entity(), key = ?st.key, "made transient");
        st.status = InstanceStatus::Transient;
        st.session = None;
        st.key = None;
        st.committed.clear();
        st.history.clear();
        st.expired.clear();
        st.parents.clear();
        Ok(())
    }

    /// Turn a transient object with a complete primary key into a detached
    /// one, as if it had been loaded and then expunged.
    ///
    /// Its current values become its committed state and unset columns are
    /// expired, so [`merge`](Self::merge) or `add` treat it as an existing
    /// row.
    pub fn make_transient_to_detached(&self, inst: &Instance) -> Result<()> {
        if inst.status() != InstanceStatus::Transient {
            return Err(Error::invalid_request(format!(
                "{} instance is {:?}, not transient",
                inst.entity(),
                inst.status()
            )));
        }
        let key = inst.current_key().ok_or_else(|| {
            Error::invalid_request(format!(
                "{} instance has no complete primary key",
                inst.entity()
            ))
        })?;
        let mut st = inst.state_mut()?;
        for col in &inst.mapper().columns {
            if !st.values.contains_key(&col.name) {
                st.expired.insert(col.name.clone());
            }
        }
        st.committed = st.values.clone();
        st.history.clear();
        st.status = InstanceStatus::Detached;
        tracing::debug!(key = %key, "made detached");
        st.key = Some(key);
        Ok(())
    }

    /// Register a loaded row, returning the session's instance for its
    /// identity. An existing instance keeps its loaded values unless
    /// `populate_existing` is set.
    pub fn load(&self, entity: &str, row: &Row, populate_existing: bool) -> Result<Instance> {
        let mapper = Arc::clone(self.core.registry.mapper(entity)?);
        let inst = self.core.materialize(&mapper, row, populate_existing)?;
        self.core.dispatch_identity_events()?;
        Ok(inst)
    }

    /// Instance for a primary key: identity map first, then the loader.
    ///
    /// Instances marked for deletion are not returned.
    pub fn get(&self, entity: &str, primary_key: Vec<Value>) -> Result<Option<Instance>> {
        let mapper = Arc::clone(self.core.registry.mapper(entity)?);
        let key = IdentityKey::new(mapper.name.clone(), primary_key);
        if let Some(inst) = self.core.inner_mut()?.identity_map.get(&key) {
            return Ok((inst.status() != InstanceStatus::Deleted).then_some(inst));
        }
        if self.core.loader.borrow().is_none() {
            return Ok(None);
        }
        if self.core.config.autoflush && self.core.has_pending_changes()? {
            tracing::debug!(key = %key, "autoflush before get");
            self.flush()?;
            if let Some(inst) = self.core.inner_mut()?.identity_map.get(&key) {
                return Ok(Some(inst));
            }
        }
        let inst = self.core.load_identity(&mapper, &key)?;
        self.core.dispatch_identity_events()?;
        Ok(inst)
    }

    // ========================================================================
    // Flush / Transaction
    // ========================================================================

    /// Write all pending changes through the executor.
    pub fn flush(&self) -> Result<FlushResult> {
        let result = self.core.flush()?;
        self.core.dispatch_identity_events()?;
        Ok(result)
    }

    /// The ordered writes the next flush would issue, without executing them.
    ///
    /// Pending delete-orphans are resolved first, exactly as flush does.
    pub fn plan_flush(&self) -> Result<FlushPlan> {
        self.core.check_not_flushing()?;
        self.core.process_orphans()?;
        let plan = FlushPlanner::new(&self.core).plan()?;
        self.core.dispatch_identity_events()?;
        Ok(plan)
    }

    /// Flush, then commit the executor's transaction.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn commit(&self) -> Result<FlushResult> {
        self.core.fire(SessionEvent::BeforeCommit)?;
        let result = self.flush()?;
        self.core.commit_executor()?;
        {
            let mut inner = self.core.inner_mut()?;
            inner.flushed_new.take();
            inner.flushed_deleted.take();
        }
        if self.core.config.expire_on_commit {
            let count = self.core.expire_everything()?;
            tracing::debug!(count, "expired on commit");
        }
        self.core.fire(SessionEvent::AfterCommit)?;
        tracing::info!(total = result.total(), "Commit complete");
        Ok(result)
    }

    /// Roll back the executor's transaction and restore instance state.
    #[tracing::instrument(level = "debug", skip(self))]
    pub fn rollback(&self) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.rollback()?;
        self.core.dispatch_identity_events()?;
        self.core.fire(SessionEvent::AfterRollback)
    }

    /// Expunge everything and reset the transaction state.
    pub fn close(&self) -> Result<()> {
        self.core.check_not_flushing()?;
        self.core.expunge_all()?;
        {
            let mut inner = self.core.inner_mut()?;
            inner.flushed_new.take();
            inner.flushed_deleted.take();
            inner.active = true;
        }
        self.core.dispatch_identity_events()
    }

    // ========================================================================
    // Inspection
    // ========================================================================

    /// Pending instances, in the order they were added.
    pub fn new_objects(&self) -> Result<Vec<Instance>> {
        Ok(self.core.inner_mut()?.new.to_vec())
    }

    /// Persistent instances with unflushed changes.
    pub fn dirty_objects(&self) -> Result<Vec<Instance>> {
        let dirty = self.core.dirty()?;
        self.core.dispatch_identity_events()?;
        Ok(dirty)
    }

    /// Instances marked for deletion.
    pub fn deleted_objects(&self) -> Result<Vec<Instance>> {
        Ok(self.core.inner_mut()?.deleted.to_vec())
    }

    pub fn history(&self, inst: &Instance, attr: &str) -> Result<AttributeHistory> {
        inst.history(attr)
    }

    pub fn object_state(&self, inst: &Instance) -> InstanceStatus {
        inst.status()
    }

    pub fn is_modified(&self, inst: &Instance) -> bool {
        inst.is_modified()
    }

    /// Whether `inst` is pending, persistent or deleted in this session.
    pub fn contains(&self, inst: &Instance) -> bool {
        inst.belongs_to(&self.core)
    }

    pub fn identity_key(&self, inst: &Instance) -> Option<IdentityKey> {
        inst.identity_key()
    }

    /// Number of instances in the session (identity map plus pending).
    ///
    /// Dead weak entries are pruned first and their detach events fired.
    pub fn len(&self) -> Result<usize> {
        let len = {
            let mut inner = self.core.inner_mut()?;
            inner.identity_map.prune();
            inner.identity_map.len() + inner.new.len()
        };
        self.core.dispatch_identity_events()?;
        Ok(len)
    }

    pub fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Get debug information about the session state.
    pub fn debug_info(&self) -> Result<SessionDebugInfo> {
        let pending_dirty = self.dirty_objects()?.len();
        let inner = self.core.inner_mut()?;
        Ok(SessionDebugInfo {
            tracked: inner.identity_map.len(),
            pending_new: inner.new.len(),
            pending_delete: inner.deleted.len(),
            pending_dirty,
            orphans: inner.orphans.len(),
            active: inner.active,
            weak_identity_map: inner.identity_map.is_weak(),
        })
    }
}

/// Debug information about session state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SessionDebugInfo {
    /// Instances in the identity map.
    pub tracked: usize,
    /// Instances pending INSERT.
    pub pending_new: usize,
    /// Instances pending DELETE.
    pub pending_delete: usize,
    /// Instances pending UPDATE.
    pub pending_dirty: usize,
    /// Delete-orphan candidates awaiting the next flush.
    pub orphans: usize,
    /// False after a failed flush until rollback.
    pub active: bool,
    pub weak_identity_map: bool,
}

// ============================================================================
// Unit Tests
// ============================================================================
