//! Row identity.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a mapped row: entity name plus primary key tuple.
///
/// Two instances with equal keys represent the same database row; a session
/// holds at most one live instance per key.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IdentityKey {
    pub entity: String,
    pub primary_key: Vec<Value>,
}

impl IdentityKey {
    pub fn new(entity: impl Into<String>, primary_key: Vec<Value>) -> Self {
        Self {
            entity: entity.into(),
            primary_key,
        }
    }

    /// A key is complete when no primary key component is NULL.
    pub fn is_complete(&self) -> bool {
        !self.primary_key.is_empty() && self.primary_key.iter().all(|v| !v.is_null())
    }
}

impl fmt::Display for IdentityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}(", self.entity)?;
        for (i, v) in self.primary_key.iter().enumerate() {
            if i > 0 {
                write!(f, ", ")?;
            }
            write!(f, "{v}")?;
        }
        write!(f, ")")
    }
}
