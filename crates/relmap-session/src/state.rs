//! Per-object persistence state.
//!
//! Every mapped object is an [`Instance`]: a shared handle to its
//! [`InstanceState`]. The state records where the object is in its
//! lifecycle, which session owns it, its committed and current attribute
//! values, loaded relationships, change history and expired attributes.
//! The state travels with the object when it is detached.

use std::cell::{Ref, RefCell, RefMut};
use std::collections::{HashMap, HashSet};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::rc::{Rc, Weak};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use relmap_core::{EntityMapper, Error, IdentityKey, Registry, Result, Row, Value};

use crate::SessionCore;
use crate::collection::CollectionAdapter;

static NEXT_INSTANCE_ID: AtomicU64 = AtomicU64::new(1);

/// Lifecycle status of an instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum InstanceStatus {
    /// Not in any session, no identity.
    Transient,
    /// Added to a session, not yet inserted.
    Pending,
    /// Has an identity and is present in a session's identity map.
    Persistent,
    /// Persistent and marked for deletion at the next flush.
    Deleted,
    /// Has (or had) an identity but is not in any session.
    Detached,
}

/// Loaded value of a relationship attribute.
pub(crate) enum RelationValue {
    Reference(Option<Instance>),
    Collection(Box<dyn CollectionAdapter>),
}

impl fmt::Debug for RelationValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RelationValue::Reference(r) => f.debug_tuple("Reference").field(r).finish(),
            RelationValue::Collection(c) => f.debug_tuple("Collection").field(&c.len()).finish(),
        }
    }
}

/// Change record for a relationship attribute since the last flush.
#[derive(Debug, Clone)]
pub(crate) enum RelationHistory {
    /// `original` is meaningful only when `known`; an unloaded reference has
    /// no known original.
    Reference {
        original: Option<Instance>,
        known: bool,
    },
    Collection {
        added: Vec<Instance>,
        removed: Vec<Instance>,
    },
}

impl RelationHistory {
    pub(crate) fn record_added(&mut self, item: &Instance) {
        if let RelationHistory::Collection { added, removed } = self {
            if let Some(pos) = removed.iter().position(|r| r == item) {
                removed.remove(pos);
            } else if !added.contains(item) {
                added.push(item.clone());
            }
        }
    }

    pub(crate) fn record_removed(&mut self, item: &Instance) {
        if let RelationHistory::Collection { added, removed } = self {
            if let Some(pos) = added.iter().position(|a| a == item) {
                added.remove(pos);
            } else if !removed.contains(item) {
                removed.push(item.clone());
            }
        }
    }
}

/// Mutable persistence state of one mapped object.
#[derive(Debug)]
pub(crate) struct InstanceState {
    pub(crate) status: InstanceStatus,
    pub(crate) session: Option<Weak<SessionCore>>,
    pub(crate) key: Option<IdentityKey>,
    /// Values as of the last load or flush.
    pub(crate) committed: HashMap<String, Value>,
    /// Current scalar values.
    pub(crate) values: HashMap<String, Value>,
    /// Loaded relationships; absent means unloaded.
    pub(crate) relations: HashMap<String, RelationValue>,
    pub(crate) history: HashMap<String, RelationHistory>,
    /// Scalar attributes that must be reloaded before they are read.
    pub(crate) expired: HashSet<String>,
    /// Delete-orphan owners per `Entity.relationship`.
    pub(crate) parents: HashMap<String, usize>,
    /// Attributes currently being synchronized with their back-references.
    pub(crate) guards: HashSet<String>,
}

impl InstanceState {
    fn new() -> Self {
        Self {
            status: InstanceStatus::Transient,
            session: None,
            key: None,
            committed: HashMap::new(),
            values: HashMap::new(),
            relations: HashMap::new(),
            history: HashMap::new(),
            expired: HashSet::new(),
            parents: HashMap::new(),
            guards: HashSet::new(),
        }
    }

    /// Whether any scalar differs from its committed value or any
    /// relationship carries changes.
    pub(crate) fn has_changes(&self) -> bool {
        self.changed_columns().next().is_some()
            || self
                .history
                .iter()
                .any(|(name, h)| self.relation_changed(name, h))
    }

    pub(crate) fn relation_changed(&self, name: &str, hist: &RelationHistory) -> bool {
        match hist {
            RelationHistory::Reference { original, known } => {
                let current = match self.relations.get(name) {
                    Some(RelationValue::Reference(r)) => r.as_ref(),
                    _ => None,
                };
                !*known || original.as_ref() != current
            }
            RelationHistory::Collection { added, removed } => {
                !added.is_empty() || !removed.is_empty()
            }
        }
    }

    /// Scalar columns whose current value differs from the committed one.
    pub(crate) fn changed_columns(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values
            .iter()
            .filter(|(k, v)| self.committed.get(*k) != Some(*v))
            .map(|(k, v)| (k.as_str(), v))
    }

    /// Committed values as a row, used as the source row for lazy loads.
    pub(crate) fn committed_row(&self) -> Row {
        let mut row = Row::new();
        let mut keys: Vec<&String> = self.committed.keys().collect();
        keys.sort();
        for k in keys {
            row.set(k.clone(), self.committed[k].clone());
        }
        row
    }

    /// Clear all change tracking after the state has been synchronized.
    pub(crate) fn commit_all(&mut self) {
        self.committed = self.values.clone();
        self.history.clear();
    }

    pub(crate) fn expire_all(&mut self, mapper: &EntityMapper) {
        self.values.clear();
        self.committed.clear();
        self.relations.clear();
        self.history.clear();
        for col in &mapper.columns {
            self.expired.insert(col.name.clone());
        }
    }
}

pub(crate) struct InstanceInner {
    id: u64,
    mapper: Arc<EntityMapper>,
    state: RefCell<InstanceState>,
}

/// Shared handle to a mapped object.
///
/// Cloning the handle does not copy the object: all clones observe the same
/// state. Equality and hashing are by object identity.
#[derive(Clone)]
pub struct Instance(Rc<InstanceInner>);

/// Non-owning handle used by the identity map.
#[derive(Clone)]
pub struct WeakInstance(Weak<InstanceInner>);

impl WeakInstance {
    pub fn upgrade(&self) -> Option<Instance> {
        self.0.upgrade().map(Instance)
    }
}

impl Instance {
    /// Create a transient instance of the given entity.
    pub fn new(mapper: Arc<EntityMapper>) -> Self {
        Self(Rc::new(InstanceInner {
            id: NEXT_INSTANCE_ID.fetch_add(1, Ordering::Relaxed),
            mapper,
            state: RefCell::new(InstanceState::new()),
        }))
    }

    /// Create a transient instance of a registered entity.
    pub fn of(registry: &Registry, entity: &str) -> Result<Self> {
        Ok(Self::new(Arc::clone(registry.mapper(entity)?)))
    }

    /// Process-unique, monotonically assigned id; reflects creation order.
    pub fn id(&self) -> u64 {
        self.0.id
    }

    pub fn mapper(&self) -> &Arc<EntityMapper> {
        &self.0.mapper
    }

    pub fn entity(&self) -> &str {
        &self.0.mapper.name
    }

    pub fn downgrade(&self) -> WeakInstance {
        WeakInstance(Rc::downgrade(&self.0))
    }

    pub fn ptr_eq(&self, other: &Instance) -> bool {
        Rc::ptr_eq(&self.0, &other.0)
    }

    pub fn status(&self) -> InstanceStatus {
        self.0.state.borrow().status
    }

    /// Identity key, once the instance has been inserted or loaded.
    pub fn identity_key(&self) -> Option<IdentityKey> {
        self.0.state.borrow().key.clone()
    }

    /// Names of scalar attributes that will be reloaded on next access.
    pub fn expired_attributes(&self) -> Vec<String> {
        let mut attrs: Vec<String> = self.0.state.borrow().expired.iter().cloned().collect();
        attrs.sort();
        attrs
    }

    /// Whether the instance has changes not yet flushed.
    pub fn is_modified(&self) -> bool {
        let st = self.0.state.borrow();
        st.status == InstanceStatus::Pending || st.has_changes()
    }

    pub(crate) fn state(&self) -> Result<Ref<'_, InstanceState>> {
        self.0.state.try_borrow().map_err(|_| {
            Error::invalid_request(format!(
                "{} instance is being modified and cannot be read re-entrantly",
                self.entity()
            ))
        })
    }

    pub(crate) fn state_mut(&self) -> Result<RefMut<'_, InstanceState>> {
        self.0.state.try_borrow_mut().map_err(|_| {
            Error::invalid_request(format!(
                "{} instance is already in use and cannot be modified re-entrantly",
                self.entity()
            ))
        })
    }

    /// Owning session, if it is still alive.
    pub(crate) fn session_core(&self) -> Option<Rc<SessionCore>> {
        self.0
            .state
            .borrow()
            .session
            .as_ref()
            .and_then(Weak::upgrade)
    }

    pub(crate) fn belongs_to(&self, core: &Rc<SessionCore>) -> bool {
        self.0
            .state
            .borrow()
            .session
            .as_ref()
            .is_some_and(|w| std::ptr::eq(w.as_ptr(), Rc::as_ptr(core)))
    }

    /// Primary key values from the current scalar values.
    pub(crate) fn current_key(&self) -> Option<IdentityKey> {
        let st = self.0.state.borrow();
        self.0.mapper.identity_key(|c| st.values.get(c))
    }
}

impl PartialEq for Instance {
    fn eq(&self, other: &Self) -> bool {
        self.ptr_eq(other)
    }
}

impl Eq for Instance {}

impl Hash for Instance {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.id.hash(state);
    }
}

impl fmt::Debug for Instance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("Instance");
        s.field("entity", &self.entity()).field("id", &self.id());
        if let Ok(st) = self.0.state.try_borrow() {
            s.field("status", &st.status);
            if let Some(key) = &st.key {
                s.field("key", &key.to_string());
            }
        }
        s.finish()
    }
}

impl fmt::Debug for WeakInstance {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.upgrade() {
            Some(inst) => write!(f, "WeakInstance({inst:?})"),
            None => write!(f, "WeakInstance(<dropped>)"),
        }
    }
}

/// Clears an attribute's re-entrancy guard when dropped.
pub(crate) struct AttrGuard {
    instance: Instance,
    attr: String,
}

impl AttrGuard {
    /// Enter the guard; `None` if the attribute is already being synchronized.
    pub(crate) fn enter(instance: &Instance, attr: &str) -> Result<Option<Self>> {
        let mut st = instance.state_mut()?;
        if !st.guards.insert(attr.to_string()) {
            return Ok(None);
        }
        Ok(Some(Self {
            instance: instance.clone(),
            attr: attr.to_string(),
        }))
    }
}

impl Drop for AttrGuard {
    fn drop(&mut self) {
        if let Ok(mut st) = self.instance.0.state.try_borrow_mut() {
            st.guards.remove(&self.attr);
        }
    }
}
