//! In-memory store.
//!
//! This is the reference implementation of `Store`. Records are the
//! attribute maps the serializer produces, kept per entity type and
//! identifier behind a `RwLock`.
//!
//! ## Limitations
//!
//! - **Single-writer only**: an operation touching several records (cascade
//!   delete) is not atomic against concurrent writers.
//! - **No history**: update overwrites the stored record.
//! - **Identifier changes are not tracked**: re-identifying a stored entity
//!   leaves its old record in place.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;

use super::{Store, StoreConfig};
use crate::entity::{EntityRef, EntityType, FieldSelection};
use crate::field::LoadState;
use crate::model::AttributeMap;
use crate::registry::IdentityRegistry;
use crate::serialize::{self, Context};
use crate::{Error, Result};

// ============================================================================
// MemoryStore
// ============================================================================

/// In-memory entity storage.
pub struct MemoryStore {
    inner: Arc<MemoryInner>,
}

struct MemoryInner {
    /// kind → id → record
    records: RwLock<HashMap<String, BTreeMap<String, AttributeMap>>>,
    registry: Arc<IdentityRegistry>,
    context: Context,
    config: StoreConfig,
    next_id: AtomicU64,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::from_config(StoreConfig::default())
    }

    pub fn from_config(config: StoreConfig) -> Self {
        Self::with_registry(config, IdentityRegistry::shared())
    }

    /// Share `registry` with other stores or contexts.
    pub fn with_registry(config: StoreConfig, registry: Arc<IdentityRegistry>) -> Self {
        let context = Context::from_config(&config.context).with_registry(Arc::clone(&registry));
        Self {
            inner: Arc::new(MemoryInner {
                records: RwLock::new(HashMap::new()),
                registry,
                context,
                config,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn registry(&self) -> &Arc<IdentityRegistry> {
        &self.inner.registry
    }

    /// Number of stored records of `kind`.
    pub fn count(&self, kind: EntityType) -> usize {
        self.inner.records.read().get(kind.name()).map_or(0, BTreeMap::len)
    }

    /// The stored record, as last written.
    pub fn record(&self, kind: EntityType, id: &str) -> Option<AttributeMap> {
        self.inner.records.read().get(kind.name())?.get(id).cloned()
    }

    fn route(&self, kind: EntityType) -> Result<()> {
        if self.inner.config.is_routable(kind.name()) {
            Ok(())
        } else {
            Err(Error::UnroutableEntity(kind.name().to_owned()))
        }
    }

    fn require_valid(&self, entity: &EntityRef) -> Result<()> {
        if self.inner.config.skip_validation {
            return Ok(());
        }
        let state = entity.validate();
        if state.is_invalid() {
            return Err(Error::ValidationFailure { messages: state.messages().to_vec() });
        }
        Ok(())
    }

    fn require_id(entity: &EntityRef) -> Result<String> {
        entity
            .identifier()
            .ok_or_else(|| Error::MissingIdentifier(entity.kind().name().to_owned()))
    }

    fn persist(&self, entity: &EntityRef, id: String) {
        let attrs = serialize::write(entity, &FieldSelection::Loaded, &self.inner.context);
        self.inner
            .records
            .write()
            .entry(entity.kind().name().to_owned())
            .or_default()
            .insert(id, attrs);
        entity.set_load_state(LoadState::Loaded);
        self.inner.registry.did_instantiate(entity);
    }

    fn remove(&self, entity: &EntityRef) -> bool {
        let Some(id) = entity.identifier() else { return false };
        let removed = self
            .inner
            .records
            .write()
            .get_mut(entity.kind().name())
            .and_then(|records| records.remove(&id))
            .is_some();
        self.inner.registry.forget(entity);
        removed
    }
}

/// Numeric identifiers in numeric order, then every other identifier in
/// lexicographic order.
fn id_order(a: &str, b: &str) -> std::cmp::Ordering {
    match (a.parse::<u64>(), b.parse::<u64>()) {
        (Ok(x), Ok(y)) => x.cmp(&y).then_with(|| a.cmp(b)),
        (Ok(_), Err(_)) => std::cmp::Ordering::Less,
        (Err(_), Ok(_)) => std::cmp::Ordering::Greater,
        (Err(_), Err(_)) => a.cmp(b),
    }
}

// ============================================================================
// Store impl
// ============================================================================

#[async_trait]
impl Store for MemoryStore {
    async fn create(&self, entity: &EntityRef) -> Result<EntityRef> {
        let kind = entity.kind();
        self.route(kind)?;
        if entity.identifier_key().is_none() {
            return Err(Error::MissingIdentifier(kind.name().to_owned()));
        }
        self.require_valid(entity)?;

        let id = match entity.identifier() {
            Some(id) => {
                if self.record(kind, &id).is_some() {
                    return Err(Error::Storage(format!("{kind}/{id} already exists")));
                }
                id
            }
            None => {
                let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
                entity.set_identifier(Some(id.clone()));
                id
            }
        };

        tracing::debug!(kind = kind.name(), id = %id, "create");
        self.persist(entity, id);
        Ok(Arc::clone(entity))
    }

    async fn update(&self, entity: &EntityRef) -> Result<EntityRef> {
        let kind = entity.kind();
        self.route(kind)?;
        let id = Self::require_id(entity)?;
        if self.record(kind, &id).is_none() {
            return Err(Error::NotFound(format!("{kind}/{id}")));
        }
        self.require_valid(entity)?;

        tracing::debug!(kind = kind.name(), id = %id, "update");
        self.persist(entity, id);
        Ok(Arc::clone(entity))
    }

    async fn delete(&self, entity: &EntityRef) -> Result<()> {
        let kind = entity.kind();
        self.route(kind)?;
        let id = Self::require_id(entity)?;
        if !self.remove(entity) {
            return Err(Error::NotFound(format!("{kind}/{id}")));
        }

        let mut cascaded = 0usize;
        entity.cascade_delete(|target| {
            if self.remove(target) {
                cascaded += 1;
            }
        });
        tracing::debug!(kind = kind.name(), id = %id, cascaded, "delete");
        Ok(())
    }

    async fn lookup(&self, kind: EntityType, id: &str) -> Result<EntityRef> {
        self.route(kind)?;
        let attrs = self
            .record(kind, id)
            .ok_or_else(|| Error::NotFound(format!("{kind}/{id}")))?;
        Ok(serialize::instantiate(kind, &attrs, &self.inner.context))
    }

    async fn list(&self, kind: EntityType) -> Result<Vec<EntityRef>> {
        self.route(kind)?;
        let mut records: Vec<(String, AttributeMap)> = self
            .inner
            .records
            .read()
            .get(kind.name())
            .map(|records| records.iter().map(|(id, attrs)| (id.clone(), attrs.clone())).collect())
            .unwrap_or_default();
        records.sort_by(|(a, _), (b, _)| id_order(a, b));
        Ok(records
            .iter()
            .map(|(_, attrs)| serialize::instantiate(kind, attrs, &self.inner.context))
            .collect())
    }

    fn context(&self) -> &Context {
        &self.inner.context
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, InterfaceBuilder, Model};
    use crate::field::{Field, ValidationRule};
    use crate::relationship::ToMany;
    use crate::relationship::ToOne;

    struct Person;
    struct Pet;
    struct Note;

    impl Model for Person {
        const TYPE_NAME: &'static str = "person";

        fn declare(b: &mut InterfaceBuilder) {
            b.identifier("id");
            b.field(Field::<String>::new("name").with_rule(ValidationRule::required("name is required")));
            b.field(ToMany::new::<Pet>("pets").inverse("owner").cascade_delete().foreign_key());
        }
    }

    impl Model for Pet {
        const TYPE_NAME: &'static str = "pet";

        fn declare(b: &mut InterfaceBuilder) {
            b.identifier("id");
            b.field(Field::<String>::new("name"));
            b.field(ToOne::new::<Person>("owner").inverse("pets").foreign_key());
        }
    }

    impl Model for Note {
        const TYPE_NAME: &'static str = "note";

        fn declare(b: &mut InterfaceBuilder) {
            b.field(Field::<String>::new("text"));
        }
    }

    fn person(name: &str) -> EntityRef {
        let p = Entity::new::<Person>();
        p.set("name", Some(name.to_string())).unwrap();
        p
    }

    #[tokio::test]
    async fn test_create_assigns_id_and_registers() {
        let db = MemoryStore::new();
        let ada = db.create(&person("Ada")).await.unwrap();

        let id = ada.identifier().unwrap();
        assert_eq!(id, "1");
        assert_eq!(ada.load_state(), LoadState::Loaded);
        assert!(db.registry().contains(&ada));
        assert_eq!(db.count(EntityType::of::<Person>()), 1);
    }

    #[tokio::test]
    async fn test_create_rejects_invalid() {
        let db = MemoryStore::new();
        let nameless = Entity::new::<Person>();

        let err = db.create(&nameless).await.unwrap_err();
        assert!(matches!(err, Error::ValidationFailure { ref messages } if messages == &["name is required"]));
        assert_eq!(db.count(EntityType::of::<Person>()), 0);
    }

    #[tokio::test]
    async fn test_create_requires_identifier_field() {
        let db = MemoryStore::new();
        let note = Entity::new::<Note>();
        assert!(matches!(db.create(&note).await, Err(Error::MissingIdentifier(_))));
    }

    #[tokio::test]
    async fn test_create_duplicate_id() {
        let db = MemoryStore::new();
        let a = person("A");
        a.set_identifier(Some("p".into()));
        db.create(&a).await.unwrap();

        let b = person("B");
        b.set_identifier(Some("p".into()));
        assert!(matches!(db.create(&b).await, Err(Error::Storage(_))));
    }

    #[tokio::test]
    async fn test_lookup_returns_canonical_instance() {
        let db = MemoryStore::new();
        let ada = db.create(&person("Ada")).await.unwrap();
        let id = ada.identifier().unwrap();

        let found = db.lookup(EntityType::of::<Person>(), &id).await.unwrap();
        assert!(Arc::ptr_eq(&found, &ada));

        let missing = db.lookup(EntityType::of::<Person>(), "nope").await;
        assert!(matches!(missing, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_update() {
        let db = MemoryStore::new();
        let ada = db.create(&person("Ada")).await.unwrap();
        ada.set("name", Some("Ada L.".to_string())).unwrap();
        db.update(&ada).await.unwrap();

        let record = db.record(EntityType::of::<Person>(), &ada.identifier().unwrap()).unwrap();
        assert_eq!(record.get("name"), Some(&crate::Value::from("Ada L.")));

        let stranger = person("X");
        assert!(matches!(db.update(&stranger).await, Err(Error::MissingIdentifier(_))));
        stranger.set_identifier(Some("404".into()));
        assert!(matches!(db.update(&stranger).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_cascades() {
        let db = MemoryStore::new();
        let ada = db.create(&person("Ada")).await.unwrap();
        let pet = Entity::new::<Pet>();
        pet.set("name", Some("Rex".to_string())).unwrap();
        db.create(&pet).await.unwrap();

        ada.to_many("pets").unwrap().push(Arc::clone(&pet));
        db.update(&ada).await.unwrap();

        db.delete(&ada).await.unwrap();
        assert_eq!(db.count(EntityType::of::<Person>()), 0);
        assert_eq!(db.count(EntityType::of::<Pet>()), 0);
        assert!(db.registry().is_empty());
        assert!(matches!(db.delete(&ada).await, Err(Error::NotFound(_))));
    }

    #[tokio::test]
    async fn test_list_in_id_order() {
        let db = MemoryStore::new();
        for name in ["A", "B", "C"] {
            db.create(&person(name)).await.unwrap();
        }
        let people = db.list(EntityType::of::<Person>()).await.unwrap();
        let names: Vec<_> = people.iter().filter_map(|p| p.get::<String>("name")).collect();
        assert_eq!(names, vec!["A", "B", "C"]);
        assert!(db.list(EntityType::of::<Pet>()).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_list_orders_numeric_ids_numerically() {
        let db = MemoryStore::new();
        for i in 0..11 {
            db.create(&person(&format!("P{i}"))).await.unwrap();
        }
        let named = person("Named");
        named.set_identifier(Some("alice".into()));
        db.create(&named).await.unwrap();

        let ids: Vec<String> = db
            .list(EntityType::of::<Person>())
            .await
            .unwrap()
            .iter()
            .filter_map(|p| p.identifier())
            .collect();
        let mut expected: Vec<String> = (1..=11).map(|i| i.to_string()).collect();
        expected.push("alice".into());
        assert_eq!(ids, expected);
    }

    #[test]
    fn test_id_order() {
        use std::cmp::Ordering;
        assert_eq!(id_order("2", "10"), Ordering::Less);
        assert_eq!(id_order("10", "a"), Ordering::Less);
        assert_eq!(id_order("b", "a"), Ordering::Greater);
    }

    #[tokio::test]
    async fn test_unroutable() {
        let config = StoreConfig {
            routable_types: Some(vec!["pet".into()]),
            ..StoreConfig::default()
        };
        let db = MemoryStore::from_config(config);
        assert!(matches!(db.create(&person("Ada")).await, Err(Error::UnroutableEntity(_))));
        assert!(matches!(
            db.lookup(EntityType::of::<Person>(), "1").await,
            Err(Error::UnroutableEntity(_))
        ));
    }
}
