/// Identity types for the reconciliation kernel.
///
/// `EntityName` and `SourceName` are interned-looking textual tags drawn
/// from the configured universe (see [`crate::config`]); a [`ForeignKey`]
/// pairs one of each with a source-opaque key string. An [`InternalKey`] is
/// the kernel's own identifier for a logical entity instance, allocated by
/// the [`crate::store::Store`] and stable across reconciliation rounds.
use std::fmt;

use serde::{Deserialize, Serialize};

/// A logical kind of record managed by Retcon (e.g. `customer`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct EntityName(pub String);

impl EntityName {
    /// Wrap a name without validating it against any configured universe.
    pub fn new(name: impl Into<String>) -> Self {
        EntityName(name.into())
    }

    /// Borrow the underlying text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for EntityName {
    fn from(s: &str) -> Self {
        EntityName::new(s)
    }
}

/// An external system that stores one view of entities (e.g. `data`,
/// `test-results`).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct SourceName(pub String);

impl SourceName {
    /// Wrap a name without validating it against any configured universe.
    pub fn new(name: impl Into<String>) -> Self {
        SourceName(name.into())
    }

    /// Borrow the underlying text.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for SourceName {
    fn from(s: &str) -> Self {
        SourceName::new(s)
    }
}

/// A source-assigned opaque identifier for a record, scoped by entity and
/// source. The identifier text itself is never interpreted by the kernel.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ForeignKey {
    /// The entity this key identifies a record for.
    pub entity: EntityName,
    /// The source that assigned this key.
    pub source: SourceName,
    /// The opaque key text, meaningful only to `source`.
    pub key: String,
}

impl ForeignKey {
    /// Build a foreign key from its three parts.
    pub fn new(entity: EntityName, source: SourceName, key: impl Into<String>) -> Self {
        ForeignKey {
            entity,
            source,
            key: key.into(),
        }
    }
}

impl fmt::Display for ForeignKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}/{}", self.entity, self.source, self.key)
    }
}

/// A kernel-assigned identifier tying together the foreign keys that refer
/// to one logical entity instance. Stable across reconciliation rounds;
/// allocated by the [`crate::store::Store`] on the first request that
/// mentions a previously-unknown foreign key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct InternalKey(pub u64);

impl InternalKey {
    /// Wrap a raw internal-key value (used by `Store` implementations
    /// allocating their own sequence).
    pub fn new(value: u64) -> Self {
        InternalKey(value)
    }

    /// The raw numeric value, for persistence layers that need it.
    pub fn value(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for InternalKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ik:{}", self.0)
    }
}

/// Validates `(EntityName, SourceName)` pairs against the universe declared
/// in configuration, trading the source crate's compile-time exhaustive
/// tags for runtime, configuration-driven validation.
#[derive(Debug, Clone, Default)]
pub struct EntityUniverse {
    entities: std::collections::BTreeMap<EntityName, Vec<SourceName>>,
}

impl EntityUniverse {
    /// Build a universe from `(entity, enabled sources)` pairs.
    pub fn new(entities: impl IntoIterator<Item = (EntityName, Vec<SourceName>)>) -> Self {
        EntityUniverse {
            entities: entities.into_iter().collect(),
        }
    }

    /// True if `entity` is configured at all.
    pub fn knows_entity(&self, entity: &EntityName) -> bool {
        self.entities.contains_key(entity)
    }

    /// True if `source` is an enabled source for `entity`.
    pub fn knows_source(&self, entity: &EntityName, source: &SourceName) -> bool {
        self.entities
            .get(entity)
            .is_some_and(|sources| sources.contains(source))
    }

    /// The enabled sources for `entity`, in configured order.
    pub fn sources_for(&self, entity: &EntityName) -> &[SourceName] {
        self.entities
            .get(entity)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    /// Validate a foreign key against this universe at request entry.
    pub fn validate(&self, fk: &ForeignKey) -> Result<(), crate::error::RetconError> {
        if !self.knows_entity(&fk.entity) {
            return Err(crate::error::RetconError::Config(format!(
                "unknown entity '{}'",
                fk.entity
            )));
        }
        if !self.knows_source(&fk.entity, &fk.source) {
            return Err(crate::error::RetconError::Config(format!(
                "source '{}' is not enabled for entity '{}'",
                fk.source, fk.entity
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn universe() -> EntityUniverse {
        EntityUniverse::new([(
            EntityName::new("customer"),
            vec![SourceName::new("data"), SourceName::new("test-results")],
        )])
    }

    #[test]
    fn validate_accepts_known_pair() {
        let fk = ForeignKey::new(
            EntityName::new("customer"),
            SourceName::new("data"),
            "K1",
        );
        assert!(universe().validate(&fk).is_ok());
    }

    #[test]
    fn validate_rejects_unknown_entity() {
        let fk = ForeignKey::new(EntityName::new("invoice"), SourceName::new("data"), "K1");
        assert!(universe().validate(&fk).is_err());
    }

    #[test]
    fn validate_rejects_disabled_source() {
        let fk = ForeignKey::new(
            EntityName::new("customer"),
            SourceName::new("crm"),
            "K1",
        );
        assert!(universe().validate(&fk).is_err());
    }

    #[test]
    fn foreign_key_display_is_stable() {
        let fk = ForeignKey::new(EntityName::new("customer"), SourceName::new("data"), "K1");
        assert_eq!(fk.to_string(), "customer/data/K1");
    }
}
