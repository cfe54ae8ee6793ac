//! Attribute history: what changed on an attribute since it was last
//! loaded or flushed.

use relmap_core::Value;
use serde::Serialize;

use crate::state::{Instance, InstanceState, RelationHistory, RelationValue};

/// Added, unchanged and deleted members of one attribute.
///
/// A scalar or reference has at most one element across the three lists.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct History<T> {
    pub added: Vec<T>,
    pub unchanged: Vec<T>,
    pub deleted: Vec<T>,
}

impl<T> Default for History<T> {
    fn default() -> Self {
        Self {
            added: Vec::new(),
            unchanged: Vec::new(),
            deleted: Vec::new(),
        }
    }
}

impl<T> History<T> {
    /// Whether the attribute has changes.
    pub fn has_changes(&self) -> bool {
        !self.added.is_empty() || !self.deleted.is_empty()
    }

    /// Whether nothing at all is known about the attribute.
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.unchanged.is_empty() && self.deleted.is_empty()
    }
}

/// History of one attribute, by attribute type.
#[derive(Debug, Clone, PartialEq)]
pub enum AttributeHistory {
    Scalar(History<Value>),
    Reference(History<Instance>),
    Collection(History<Instance>),
}

impl AttributeHistory {
    pub fn has_changes(&self) -> bool {
        match self {
            AttributeHistory::Scalar(h) => h.has_changes(),
            AttributeHistory::Reference(h) | AttributeHistory::Collection(h) => h.has_changes(),
        }
    }

    /// Values of a scalar history.
    pub fn as_scalar(&self) -> Option<&History<Value>> {
        match self {
            AttributeHistory::Scalar(h) => Some(h),
            _ => None,
        }
    }

    /// Members of a reference or collection history.
    pub fn as_related(&self) -> Option<&History<Instance>> {
        match self {
            AttributeHistory::Reference(h) | AttributeHistory::Collection(h) => Some(h),
            AttributeHistory::Scalar(_) => None,
        }
    }
}

pub(crate) fn scalar_history(state: &InstanceState, column: &str) -> History<Value> {
    let original = state.committed.get(column);
    let current = state.values.get(column);
    match (original, current) {
        (Some(o), Some(c)) if o == c => History {
            unchanged: vec![c.clone()],
            ..History::default()
        },
        (Some(o), Some(c)) => History {
            added: vec![c.clone()],
            deleted: vec![o.clone()],
            ..History::default()
        },
        (None, Some(c)) => History {
            added: vec![c.clone()],
            ..History::default()
        },
        (Some(o), None) => History {
            unchanged: vec![o.clone()],
            ..History::default()
        },
        (None, None) => History::default(),
    }
}

pub(crate) fn reference_history(state: &InstanceState, name: &str) -> History<Instance> {
    let current = match state.relations.get(name) {
        Some(RelationValue::Reference(r)) => r.clone(),
        _ => None,
    };
    match state.history.get(name) {
        Some(RelationHistory::Reference { original, known }) => {
            let original = if *known { original.clone() } else { None };
            if original == current {
                History {
                    unchanged: current.into_iter().collect(),
                    ..History::default()
                }
            } else {
                History {
                    added: current.into_iter().collect(),
                    deleted: original.into_iter().collect(),
                    ..History::default()
                }
            }
        }
        _ => History {
            unchanged: current.into_iter().collect(),
            ..History::default()
        },
    }
}

pub(crate) fn collection_history(state: &InstanceState, name: &str) -> History<Instance> {
    let (added, removed) = match state.history.get(name) {
        Some(RelationHistory::Collection { added, removed }) => (added.clone(), removed.clone()),
        _ => (Vec::new(), Vec::new()),
    };
    let unchanged = match state.relations.get(name) {
        Some(RelationValue::Collection(c)) => c
            .items()
            .into_iter()
            .filter(|i| !added.contains(i))
            .collect(),
        _ => Vec::new(),
    };
    History {
        added,
        unchanged,
        deleted: removed,
    }
}
