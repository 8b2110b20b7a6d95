//! End-to-end tests for `MemoryStore`: persistence through the serializer,
//! canonical lookups, validation gating and cascading deletes.

use std::sync::Arc;

use fieldgraph::storage::StoreConfig;
use fieldgraph::{
    Entity, EntityRef, EntityType, Error, Field, IdentityRegistry, InterfaceBuilder, LoadState, MemoryStore, Model,
    RelationshipField, Store, ToMany, ToOne, ValidationRule,
};
use pretty_assertions::assert_eq;

struct Order;
struct Line;

impl Model for Order {
    const TYPE_NAME: &'static str = "order";

    fn declare(b: &mut InterfaceBuilder) {
        b.identifier("id");
        b.field(Field::<String>::new("customer").with_rule(ValidationRule::required("customer is required")));
        b.field(ToMany::new::<Line>("lines").inverse("order").cascade_delete().foreign_key());
    }
}

impl Model for Line {
    const TYPE_NAME: &'static str = "line";

    fn declare(b: &mut InterfaceBuilder) {
        b.identifier("id");
        b.field(Field::<i64>::new("quantity").with_rule(ValidationRule::range(1, 99)));
        b.field(ToOne::new::<Order>("order").inverse("lines").foreign_key());
    }
}

fn order(customer: &str) -> EntityRef {
    let o = Entity::new::<Order>();
    o.set("customer", Some(customer.to_string())).unwrap();
    o
}

fn line(quantity: i64) -> EntityRef {
    let l = Entity::new::<Line>();
    l.set("quantity", Some(quantity)).unwrap();
    l
}

// ============================================================================
// 1. Create, then look up
// ============================================================================

#[tokio::test]
async fn test_create_and_lookup_graph() {
    let db = MemoryStore::new();
    let o = db.create(&order("ada")).await.unwrap();
    for q in [2, 5] {
        let l = db.create(&line(q)).await.unwrap();
        o.to_many("lines").unwrap().push(l.clone());
        db.update(&l).await.unwrap();
    }
    db.update(&o).await.unwrap();

    let order_id = o.identifier().unwrap();
    let found = db.lookup(EntityType::of::<Order>(), &order_id).await.unwrap();
    assert!(Arc::ptr_eq(&found, &o));

    let quantities: Vec<i64> = found
        .to_many("lines")
        .unwrap()
        .get()
        .iter()
        .filter_map(|l| l.get::<i64>("quantity"))
        .collect();
    assert_eq!(quantities, vec![2, 5]);
}

#[tokio::test]
async fn test_fresh_registry_lookup_builds_graph() {
    let registry = IdentityRegistry::shared();
    let writer = MemoryStore::with_registry(StoreConfig::default(), Arc::clone(&registry));
    let o = writer.create(&order("ada")).await.unwrap();
    let l = writer.create(&line(3)).await.unwrap();
    l.to_one("order").unwrap().set(Some(o.clone()));
    writer.update(&l).await.unwrap();
    writer.update(&o).await.unwrap();

    // Forgetting everything forces lookup to rebuild from records.
    registry.clear();
    let line_id = l.identifier().unwrap();
    let rebuilt = writer.lookup(EntityType::of::<Line>(), &line_id).await.unwrap();
    assert!(!Arc::ptr_eq(&rebuilt, &l));
    assert_eq!(rebuilt.get::<i64>("quantity"), Some(3));

    let parent = rebuilt.to_one("order").unwrap().get().unwrap();
    assert_eq!(parent.identifier(), o.identifier());
    assert_eq!(parent.load_state(), LoadState::Incomplete);
    assert!(parent.to_many("lines").unwrap().contains(&rebuilt));
}

// ============================================================================
// 2. Validation
// ============================================================================

#[tokio::test]
async fn test_invalid_entities_are_rejected() {
    let db = MemoryStore::new();
    let err = db.create(&line(500)).await.unwrap_err();
    assert!(matches!(err, Error::ValidationFailure { .. }));
    assert_eq!(db.count(EntityType::of::<Line>()), 0);

    let lenient = MemoryStore::from_config(StoreConfig { skip_validation: true, ..StoreConfig::default() });
    lenient.create(&line(500)).await.unwrap();
    assert_eq!(lenient.count(EntityType::of::<Line>()), 1);
}

// ============================================================================
// 3. Delete
// ============================================================================

#[tokio::test]
async fn test_delete_cascades_to_lines() {
    let db = MemoryStore::new();
    let o = db.create(&order("ada")).await.unwrap();
    let keep = db.create(&order("bob")).await.unwrap();
    for q in [1, 2, 3] {
        let l = db.create(&line(q)).await.unwrap();
        o.to_many("lines").unwrap().push(l);
    }
    db.update(&o).await.unwrap();
    assert_eq!(db.count(EntityType::of::<Line>()), 3);

    db.delete(&o).await.unwrap();
    assert_eq!(db.count(EntityType::of::<Line>()), 0);
    assert_eq!(db.count(EntityType::of::<Order>()), 1);
    assert!(db.registry().contains(&keep));

    let gone = db.lookup(EntityType::of::<Order>(), &o.identifier().unwrap()).await;
    assert!(matches!(gone, Err(Error::NotFound(_))));
}

// ============================================================================
// 4. Configuration
// ============================================================================

#[tokio::test]
async fn test_config_from_json_drives_store() {
    let config = StoreConfig::from_json(
        r#"{"context": {"key_case": "camel"}, "routable_types": ["order"]}"#,
    )
    .unwrap();
    let db = MemoryStore::from_config(config);

    db.create(&order("ada")).await.unwrap();
    let err = db.create(&line(1)).await.unwrap_err();
    assert!(matches!(err, Error::UnroutableEntity(ref kind) if kind == "line"));

    let all = db.list(EntityType::of::<Order>()).await.unwrap();
    assert_eq!(all.len(), 1);
    assert_eq!(db.context().key_case(), fieldgraph::KeyCase::Camel);
}
