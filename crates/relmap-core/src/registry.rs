//! Explicit mapper registry.
//!
//! The registry is the resolved, validated set of entity mappers a session
//! works against. It is built once, shared through `Arc`, and never mutated
//! afterwards; back-references are paired and checked at build time so the
//! session can follow them without further validation.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock};

use regex::Regex;

use crate::error::{Error, SchemaErrorKind};
use crate::mapper::EntityMapper;
use crate::relationship::{CollectionKind, KeyFunction, RelationshipInfo, RelationshipKind};
use crate::Result;

fn identifier_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| Regex::new(r"^[A-Za-z_][A-Za-z0-9_]*$").ok())
        .as_ref()
}

fn check_identifier(what: &str, name: &str) -> Result<()> {
    if identifier_pattern().is_some_and(|re| re.is_match(name)) {
        Ok(())
    } else {
        Err(Error::schema(
            SchemaErrorKind::InvalidIdentifier,
            format!("{what} '{name}' is not a valid identifier"),
        ))
    }
}

/// Validated collection of entity mappers.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    mappers: HashMap<String, Arc<EntityMapper>>,
    order: Vec<String>,
}

/// Builder for [`Registry`].
#[derive(Debug, Default)]
pub struct RegistryBuilder {
    mappers: Vec<EntityMapper>,
}

impl Registry {
    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Look up a mapper by entity name.
    pub fn mapper(&self, entity: &str) -> Result<&Arc<EntityMapper>> {
        self.mappers.get(entity).ok_or_else(|| {
            Error::schema(
                SchemaErrorKind::UnknownEntity,
                format!("entity '{entity}' is not mapped"),
            )
        })
    }

    pub fn get(&self, entity: &str) -> Option<&Arc<EntityMapper>> {
        self.mappers.get(entity)
    }

    /// Mappers in registration order.
    pub fn mappers(&self) -> impl Iterator<Item = &Arc<EntityMapper>> {
        self.order.iter().filter_map(|name| self.mappers.get(name))
    }

    pub fn len(&self) -> usize {
        self.mappers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.mappers.is_empty()
    }

    /// The relationship paired with `rel` on its target, if any.
    pub fn backref(&self, rel: &RelationshipInfo) -> Option<&RelationshipInfo> {
        let name = rel.back_populates.as_deref()?;
        self.mappers.get(&rel.target)?.relationship_info(name)
    }
}

impl RegistryBuilder {
    #[must_use]
    pub fn entity(mut self, mapper: EntityMapper) -> Self {
        self.mappers.push(mapper);
        self
    }

    /// Validate every mapper and pair back-references.
    #[tracing::instrument(level = "debug", skip(self), fields(entities = self.mappers.len()))]
    pub fn build(self) -> Result<Registry> {
        let mut mappers = self.mappers;

        let mut index: HashMap<String, usize> = HashMap::new();
        for (i, mapper) in mappers.iter().enumerate() {
            if index.insert(mapper.name.clone(), i).is_some() {
                return Err(Error::schema(
                    SchemaErrorKind::Duplicate,
                    format!("entity '{}' is registered twice", mapper.name),
                ));
            }
            validate_columns(mapper)?;
        }

        pair_backrefs(&mut mappers, &index)?;

        for mapper in &mappers {
            for rel in &mapper.relationships {
                let target = &mappers[index[&rel.target]];
                validate_relationship(mapper, rel, target)?;
            }
        }

        let order = mappers.iter().map(|m| m.name.clone()).collect();
        let mappers = mappers
            .into_iter()
            .map(|m| (m.name.clone(), Arc::new(m)))
            .collect();
        tracing::debug!("mapper registry built");
        Ok(Registry { mappers, order })
    }
}

fn validate_columns(mapper: &EntityMapper) -> Result<()> {
    check_identifier("entity", &mapper.name)?;
    check_identifier("table", &mapper.table)?;
    let mut seen = std::collections::HashSet::new();
    for col in &mapper.columns {
        check_identifier("column", &col.name)?;
        if !seen.insert(col.name.as_str()) {
            return Err(Error::schema(
                SchemaErrorKind::Duplicate,
                format!("column '{}.{}' is declared twice", mapper.name, col.name),
            ));
        }
    }
    if mapper.primary_key().next().is_none() {
        return Err(Error::schema(
            SchemaErrorKind::MissingPrimaryKey,
            format!("entity '{}' has no primary key column", mapper.name),
        ));
    }
    for rel in &mapper.relationships {
        if !seen.insert(rel.name.as_str()) {
            return Err(Error::schema(
                SchemaErrorKind::Duplicate,
                format!(
                    "relationship '{}.{}' collides with another attribute",
                    mapper.name, rel.name
                ),
            ));
        }
        if let Some(msg) = rel.cascade_error() {
            return Err(Error::schema(
                SchemaErrorKind::InvalidCascade,
                format!("{}.{}: {msg}", mapper.name, rel.name),
            ));
        }
    }
    Ok(())
}

fn compatible(a: RelationshipKind, b: RelationshipKind) -> bool {
    use RelationshipKind::{ManyToMany, ManyToOne, OneToMany, OneToOne};
    matches!(
        (a, b),
        (ManyToOne, OneToMany | OneToOne)
            | (OneToMany | OneToOne, ManyToOne)
            | (ManyToMany, ManyToMany)
    )
}

/// Resolve `back_populates` in both directions and share foreign-key pairs
/// between the two sides when only one declares them.
fn pair_backrefs(mappers: &mut [EntityMapper], index: &HashMap<String, usize>) -> Result<()> {
    let mut fills: Vec<(usize, String, String, Vec<crate::relationship::ColumnPair>)> = Vec::new();

    for (self_idx, mapper) in mappers.iter().enumerate() {
        for rel in &mapper.relationships {
            let Some(&target_idx) = index.get(&rel.target) else {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownEntity,
                    format!(
                        "relationship '{}.{}' targets unmapped entity '{}'",
                        mapper.name, rel.name, rel.target
                    ),
                ));
            };
            let Some(back_name) = rel.back_populates.as_deref() else {
                continue;
            };
            let target = &mappers[target_idx];
            let Some(back) = target.relationship_info(back_name) else {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownRelationship,
                    format!(
                        "'{}.{}' back-populates unknown relationship '{}.{}'",
                        mapper.name, rel.name, target.name, back_name
                    ),
                ));
            };
            if back.target != mapper.name {
                return Err(Error::schema(
                    SchemaErrorKind::InvalidBackref,
                    format!(
                        "'{}.{}' targets '{}', not '{}'",
                        target.name, back.name, back.target, mapper.name
                    ),
                ));
            }
            if let Some(reverse) = back.back_populates.as_deref() {
                if reverse != rel.name {
                    return Err(Error::schema(
                        SchemaErrorKind::InvalidBackref,
                        format!(
                            "'{}.{}' and '{}.{}' disagree on their pairing",
                            mapper.name, rel.name, target.name, back.name
                        ),
                    ));
                }
            }
            if !compatible(rel.kind, back.kind) {
                return Err(Error::schema(
                    SchemaErrorKind::InvalidBackref,
                    format!(
                        "'{}.{}' ({:?}) cannot pair with '{}.{}' ({:?})",
                        mapper.name, rel.name, rel.kind, target.name, back.name, back.kind
                    ),
                ));
            }
            if rel.kind == RelationshipKind::ManyToMany {
                let same_table = match (&rel.secondary, &back.secondary) {
                    (Some(a), Some(b)) => a.table == b.table,
                    _ => true,
                };
                if !same_table {
                    return Err(Error::schema(
                        SchemaErrorKind::InvalidBackref,
                        format!(
                            "'{}.{}' and '{}.{}' use different link tables",
                            mapper.name, rel.name, target.name, back.name
                        ),
                    ));
                }
            }
            fills.push((
                target_idx,
                back.name.clone(),
                rel.name.clone(),
                rel.foreign_keys.clone(),
            ));
            fills.push((
                self_idx,
                rel.name.clone(),
                back.name.clone(),
                back.foreign_keys.clone(),
            ));
        }
    }

    for (target_idx, back_name, rel_name, pairs) in fills {
        if let Some(back) = mappers[target_idx]
            .relationships
            .iter_mut()
            .find(|r| r.name == back_name)
        {
            if back.back_populates.is_none() {
                back.back_populates = Some(rel_name);
            }
            if back.foreign_keys.is_empty() {
                back.foreign_keys = pairs;
            }
        }
    }

    // A many-to-many side without its own link table borrows the reversed
    // one from its pair.
    let mut links = Vec::new();
    for (i, mapper) in mappers.iter().enumerate() {
        for (j, rel) in mapper.relationships.iter().enumerate() {
            if rel.kind == RelationshipKind::ManyToMany && rel.secondary.is_none() {
                let paired = rel.back_populates.as_deref().and_then(|b| {
                    mappers[index[&rel.target]]
                        .relationship_info(b)
                        .and_then(|r| r.secondary.clone())
                });
                if let Some(link) = paired {
                    links.push((i, j, link.reversed()));
                }
            }
        }
    }
    for (i, j, link) in links {
        mappers[i].relationships[j].secondary = Some(link);
    }
    Ok(())
}

fn require_column(mapper: &EntityMapper, column: &str, context: &str) -> Result<()> {
    if mapper.has_column(column) {
        Ok(())
    } else {
        Err(Error::schema(
            SchemaErrorKind::UnknownColumn,
            format!("{context}: column '{}.{column}' is not mapped", mapper.name),
        ))
    }
}

fn validate_relationship(
    mapper: &EntityMapper,
    rel: &RelationshipInfo,
    target: &EntityMapper,
) -> Result<()> {
    let context = format!("relationship '{}.{}'", mapper.name, rel.name);

    match rel.kind {
        RelationshipKind::ManyToMany => {
            let Some(link) = &rel.secondary else {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownColumn,
                    format!("{context}: many-to-many requires a link table"),
                ));
            };
            check_identifier("link table", &link.table)?;
            if link.local.is_empty() || link.remote.is_empty() {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownColumn,
                    format!("{context}: link table '{}' has no key columns", link.table),
                ));
            }
            for pair in &link.local {
                check_identifier("column", &pair.child)?;
                require_column(mapper, &pair.parent, &context)?;
            }
            for pair in &link.remote {
                check_identifier("column", &pair.child)?;
                require_column(target, &pair.parent, &context)?;
            }
        }
        kind => {
            if rel.foreign_keys.is_empty() {
                return Err(Error::schema(
                    SchemaErrorKind::UnknownColumn,
                    format!("{context}: no foreign key columns declared"),
                ));
            }
            let (child, parent) = if kind.fk_on_target() {
                (target, mapper)
            } else {
                (mapper, target)
            };
            for pair in &rel.foreign_keys {
                require_column(child, &pair.child, &context)?;
                require_column(parent, &pair.parent, &context)?;
            }
        }
    }

    if rel.cascade.delete_orphan && !rel.kind.fk_on_target() {
        return Err(Error::schema(
            SchemaErrorKind::InvalidCascade,
            format!("{context}: delete-orphan is only supported on one-to-many and one-to-one"),
        ));
    }

    if let CollectionKind::Keyed(key) = &rel.collection {
        if !rel.uselist() {
            return Err(Error::schema(
                SchemaErrorKind::InvalidCascade,
                format!("{context}: only collections can be keyed"),
            ));
        }
        let columns: Vec<&str> = match key {
            KeyFunction::Column(c) => vec![c.as_str()],
            KeyFunction::Columns(cs) => cs.iter().map(String::as_str).collect(),
        };
        for col in columns {
            require_column(target, col, &context)?;
        }
    }
    Ok(())
}
