//! Identity registry: one canonical instance per (entity type, identifier).
//!
//! The registry holds strong references, so a registered entity lives at
//! least as long as the registry (or until it is forgotten).

use std::sync::Arc;

use hashbrown::HashMap;
use parking_lot::RwLock;

use crate::entity::{Entity, EntityRef};

/// Registry key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct EntityKey {
    pub kind: String,
    pub id: String,
}

impl EntityKey {
    pub fn new(kind: impl Into<String>, id: impl Into<String>) -> Self {
        Self { kind: kind.into(), id: id.into() }
    }

    /// Key of `entity`, if it has an identifier.
    pub fn of(entity: &Entity) -> Option<Self> {
        entity.identifier().map(|id| Self::new(entity.kind().name(), id))
    }
}

impl std::fmt::Display for EntityKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.id)
    }
}

/// Canonical-instance table.
#[derive(Default)]
pub struct IdentityRegistry {
    entities: RwLock<HashMap<EntityKey, EntityRef>>,
}

impl std::fmt::Debug for IdentityRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IdentityRegistry")
            .field("entities", &self.entities.read().len())
            .finish()
    }
}

impl IdentityRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// The canonical instance sharing `candidate`'s type and identifier.
    pub fn canonical_model(&self, candidate: &Entity) -> Option<EntityRef> {
        let key = EntityKey::of(candidate)?;
        self.entities.read().get(&key).cloned()
    }

    /// Register `entity` as canonical for its identifier. Returns `false` when
    /// the entity has no identifier. An existing registration for the same
    /// key is replaced.
    pub fn did_instantiate(&self, entity: &EntityRef) -> bool {
        let Some(key) = EntityKey::of(entity) else {
            return false;
        };
        let previous = self.entities.write().insert(key.clone(), Arc::clone(entity));
        match previous {
            Some(prev) if !Arc::ptr_eq(&prev, entity) => {
                tracing::debug!(%key, "canonical instance replaced");
            }
            Some(_) => {}
            None => tracing::debug!(%key, "canonical instance registered"),
        }
        true
    }

    pub fn lookup(&self, kind: &str, id: &str) -> Option<EntityRef> {
        self.entities.read().get(&EntityKey::new(kind, id)).cloned()
    }

    pub fn contains(&self, entity: &EntityRef) -> bool {
        EntityKey::of(entity)
            .and_then(|key| self.entities.read().get(&key).cloned())
            .is_some_and(|canonical| Arc::ptr_eq(&canonical, entity))
    }

    /// Drop the registration for `entity`'s key, if that entity is the
    /// canonical one.
    pub fn forget(&self, entity: &EntityRef) -> Option<EntityRef> {
        let key = EntityKey::of(entity)?;
        let mut entities = self.entities.write();
        match entities.get(&key) {
            Some(canonical) if Arc::ptr_eq(canonical, entity) => entities.remove(&key),
            _ => None,
        }
    }

    pub fn remove(&self, kind: &str, id: &str) -> Option<EntityRef> {
        self.entities.write().remove(&EntityKey::new(kind, id))
    }

    pub fn entities_of(&self, kind: &str) -> Vec<EntityRef> {
        self.entities
            .read()
            .iter()
            .filter(|(key, _)| key.kind == kind)
            .map(|(_, entity)| Arc::clone(entity))
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entities.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.entities.write().clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{InterfaceBuilder, Model};

    struct Tag;

    impl Model for Tag {
        const TYPE_NAME: &'static str = "tag";

        fn declare(builder: &mut InterfaceBuilder) {
            builder.identifier("id");
        }
    }

    fn tag(id: &str) -> EntityRef {
        let entity = Entity::new::<Tag>();
        entity.set_identifier(Some(id.to_string()));
        entity
    }

    #[test]
    fn test_register_and_canonicalize() {
        let registry = IdentityRegistry::new();
        let first = tag("t1");
        assert!(registry.did_instantiate(&first));

        let duplicate = tag("t1");
        let canonical = registry.canonical_model(&duplicate).unwrap();
        assert!(Arc::ptr_eq(&canonical, &first));
        assert!(registry.contains(&first));
        assert!(!registry.contains(&duplicate));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_requires_identifier() {
        let registry = IdentityRegistry::new();
        let anonymous = Entity::new::<Tag>();
        assert!(!registry.did_instantiate(&anonymous));
        assert!(registry.canonical_model(&anonymous).is_none());
        assert!(registry.is_empty());
    }

    #[test]
    fn test_forget_only_canonical() {
        let registry = IdentityRegistry::new();
        let first = tag("t1");
        registry.did_instantiate(&first);

        assert!(registry.forget(&tag("t1")).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.forget(&first).is_some());
        assert!(registry.lookup("tag", "t1").is_none());
    }

    #[test]
    fn test_reregistration_replaces() {
        let registry = IdentityRegistry::new();
        let first = tag("t1");
        let second = tag("t1");
        registry.did_instantiate(&first);
        registry.did_instantiate(&second);
        assert!(Arc::ptr_eq(&registry.lookup("tag", "t1").unwrap(), &second));
        assert_eq!(registry.entities_of("tag").len(), 1);
    }
}
