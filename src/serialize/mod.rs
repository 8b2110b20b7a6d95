//! # Graph Serializer
//!
//! Converts entities to and from [`AttributeMap`]s, including cyclic graphs.
//!
//! ## Cycle handling
//!
//! One [`SeenFields`] set is threaded through a whole write pass. The first
//! time a field instance is written it is recorded and written in full; any
//! later occurrence of the same instance goes through
//! [`AnyField::write_seen_value`], which relationship fields implement as an
//! identifier-only reference.
//!
//! ```text
//! A.b ──► B          write(A) = {"id":"A1","b":{"id":"B1","a":{"id":"A1"}}}
//! B.a ──► A
//! ```
//!
//! ## Reads
//!
//! Every included field is either imported from its key or, when the key is
//! absent, cleared. A field whose import fails ends up unset with
//! [`LoadState::Error`]; the rest of the entity still loads.

pub mod context;

use hashbrown::HashSet;

use crate::entity::{EntityRef, EntityType, FieldSelection};
use crate::field::{AnyField, LoadState};
use crate::model::{AttributeMap, Value};

pub use context::{Context, ContextConfig, KeyCase, DEFAULT_CONTEXT};

// ============================================================================
// Seen set
// ============================================================================

/// Field instances already written in the current pass, by address.
#[derive(Debug, Default)]
pub struct SeenFields {
    fields: HashSet<usize>,
}

fn field_addr<F: AnyField + ?Sized>(field: &F) -> usize {
    (field as *const F).cast::<()>() as usize
}

impl SeenFields {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains<F: AnyField + ?Sized>(&self, field: &F) -> bool {
        self.fields.contains(&field_addr(field))
    }

    /// Record `field`. Returns `false` if it was already recorded.
    pub fn insert<F: AnyField + ?Sized>(&mut self, field: &F) -> bool {
        self.fields.insert(field_addr(field))
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }
}

// ============================================================================
// Write
// ============================================================================

/// Write the selected fields of `entity` in a fresh pass.
pub fn write(entity: &EntityRef, fields: &FieldSelection, ctx: &Context) -> AttributeMap {
    let mut seen = SeenFields::new();
    let attrs = write_with_seen(entity, fields, ctx, &mut seen);
    tracing::debug!(
        kind = entity.kind().name(),
        id = ?entity.identifier(),
        context = ctx.name(),
        keys = attrs.len(),
        fields_seen = seen.len(),
        "entity written"
    );
    attrs
}

/// Write `entity` as part of an ongoing pass.
pub fn write_with_seen(
    entity: &EntityRef,
    fields: &FieldSelection,
    ctx: &Context,
    seen: &mut SeenFields,
) -> AttributeMap {
    let mut attrs = AttributeMap::new();
    for field in entity.fields() {
        if !fields.includes(&*field) {
            continue;
        }
        let value = if seen.insert(&*field) {
            field.write_value(ctx, seen)
        } else {
            field.write_seen_value(ctx, seen)
        };
        match value {
            Some(value) => {
                attrs.insert(ctx.external_key(field.key()), value);
            }
            None if ctx.explicit_null() && !field.has_value() => {
                attrs.insert(ctx.external_key(field.key()), Value::Null);
            }
            None => {}
        }
    }
    attrs
}

/// `{identifier}`-only reference to `entity`, or `None` when it has no
/// identifier.
pub fn write_reference(entity: &EntityRef, ctx: &Context) -> Option<AttributeMap> {
    let id = entity.identifier()?;
    let key = entity.identifier_key()?;
    let mut attrs = AttributeMap::new();
    attrs.insert(ctx.external_key(&key), Value::String(id));
    Some(attrs)
}

// ============================================================================
// Read
// ============================================================================

/// Populate `entity` in place from `attrs`.
pub fn read(entity: &EntityRef, attrs: &AttributeMap, fields: &FieldSelection, ctx: &Context) {
    entity.set_load_state(LoadState::Loading);
    for field in entity.fields() {
        if !fields.includes(&*field) {
            continue;
        }
        field.read_value(attrs.get(&ctx.external_key(field.key())), ctx);
    }
    entity.set_load_state(LoadState::Loaded);
    tracing::debug!(
        kind = entity.kind().name(),
        id = ?entity.identifier(),
        context = ctx.name(),
        keys = attrs.len(),
        "entity read"
    );
}

/// Canonicalizing read: reuse the registered instance for the payload's
/// identifier (or build and register a fresh one), then read every field
/// into it.
pub fn instantiate(kind: EntityType, attrs: &AttributeMap, ctx: &Context) -> EntityRef {
    let entity = canonical_or_new(kind, attrs, ctx);
    read(&entity, attrs, &FieldSelection::All, ctx);
    entity
}

fn canonical_or_new(kind: EntityType, attrs: &AttributeMap, ctx: &Context) -> EntityRef {
    let fresh = kind.instantiate();
    let id = fresh
        .identifier_key()
        .and_then(|key| attrs.get(&ctx.external_key(&key)))
        .and_then(Value::as_identifier);
    let Some(id) = id else { return fresh };

    if let Some(registry) = ctx.registry() {
        if let Some(canonical) = registry.lookup(kind.name(), &id) {
            return canonical;
        }
        fresh.set_identifier(Some(id));
        registry.did_instantiate(&fresh);
    } else {
        fresh.set_identifier(Some(id));
    }
    fresh
}

/// The entity `id` refers to: the registered instance when there is one,
/// otherwise an [`Incomplete`](LoadState::Incomplete) shell carrying only the
/// identifier, registered so later references share it.
pub fn resolve_reference(kind: EntityType, id: &str, ctx: &Context) -> EntityRef {
    if let Some(canonical) = ctx.registry().and_then(|r| r.lookup(kind.name(), id)) {
        return canonical;
    }
    let shell = kind.instantiate();
    shell.set_identifier(Some(id.to_owned()));
    shell.set_load_state(LoadState::Incomplete);
    if let Some(registry) = ctx.registry() {
        registry.did_instantiate(&shell);
    }
    tracing::debug!(kind = kind.name(), id, "shell entity created");
    shell
}

/// Resolve a relationship payload value: a bare identifier or an
/// identifier-only map is a reference, any other map is an embedded entity.
pub fn resolve_value(kind: EntityType, value: &Value, ctx: &Context) -> Option<EntityRef> {
    match value {
        Value::Map(attrs) => {
            if let Some(id) = reference_id(kind, attrs, ctx) {
                return Some(resolve_reference(kind, &id, ctx));
            }
            Some(instantiate(kind, attrs, ctx))
        }
        other => other.as_identifier().map(|id| resolve_reference(kind, &id, ctx)),
    }
}

/// The identifier of a map holding nothing but an identifier.
fn reference_id(kind: EntityType, attrs: &AttributeMap, ctx: &Context) -> Option<String> {
    if attrs.len() != 1 {
        return None;
    }
    let key = ctx.external_key(&kind.identifier_key()?);
    attrs.get(&key).and_then(Value::as_identifier)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entity::{Entity, InterfaceBuilder, Model};
    use crate::field::{Field, RangeDomain};
    use crate::model::attributes;
    use crate::registry::IdentityRegistry;
    use pretty_assertions::assert_eq;
    use std::sync::Arc;

    struct Book;

    impl Model for Book {
        const TYPE_NAME: &'static str = "book";

        fn declare(b: &mut InterfaceBuilder) {
            b.identifier("id");
            b.field(Field::<String>::new("title_text"));
            b.field(Field::<i64>::new("rating").with_domain(RangeDomain::new(1, 5)));
        }
    }

    #[test]
    fn test_write_only_loaded_fields() {
        let book = Entity::new::<Book>();
        book.set_identifier(Some("b1".into()));
        book.set("title_text", Some("Dune".to_string())).unwrap();

        let attrs = write(&book, &FieldSelection::Loaded, &Context::default());
        assert_eq!(attrs, attributes([("id", "b1"), ("title_text", "Dune")]));
    }

    #[test]
    fn test_explicit_null() {
        let book = Entity::new::<Book>();
        book.set::<i64>("rating", None).unwrap();

        let plain = write(&book, &FieldSelection::Loaded, &Context::default());
        assert!(plain.is_empty());

        let ctx = Context::default().with_explicit_null(true);
        let nulls = write(&book, &FieldSelection::Loaded, &ctx);
        assert_eq!(nulls, attributes([("rating", Value::Null)]));
    }

    #[test]
    fn test_key_casing_applies_both_ways() {
        let ctx = Context::new("api").with_key_case(KeyCase::Camel);
        let book = Entity::new::<Book>();
        read(&book, &attributes([("titleText", "Emma")]), &FieldSelection::All, &ctx);
        assert_eq!(book.get::<String>("title_text"), Some("Emma".to_string()));

        let attrs = write(&book, &FieldSelection::Loaded, &ctx);
        assert_eq!(attrs.get("titleText"), Some(&Value::from("Emma")));
        assert!(!attrs.contains_key("title_text"));
    }

    #[test]
    fn test_read_clears_absent_and_degrades_bad_fields() {
        let book = Entity::new::<Book>();
        book.set("title_text", Some("Old".to_string())).unwrap();

        read(&book, &attributes([("rating", "five")]), &FieldSelection::All, &Context::default());
        assert_eq!(book.get::<String>("title_text"), None);
        assert_eq!(book.get::<i64>("rating"), None);
        assert_eq!(book.field("rating").unwrap().load_state(), LoadState::Error);
        assert_eq!(book.load_state(), LoadState::Loaded);
    }

    #[test]
    fn test_instantiate_canonicalizes() {
        let registry = IdentityRegistry::shared();
        let ctx = Context::default().with_registry(Arc::clone(&registry));

        let first = instantiate(EntityType::of::<Book>(), &attributes([("id", Value::from("b1")), ("rating", Value::from(3))]), &ctx);
        let second = instantiate(EntityType::of::<Book>(), &attributes([("id", Value::from("b1")), ("rating", Value::from(4))]), &ctx);

        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.get::<i64>("rating"), Some(4));
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn test_resolve_reference_builds_shell() {
        let registry = IdentityRegistry::shared();
        let ctx = Context::default().with_registry(Arc::clone(&registry));

        let shell = resolve_reference(EntityType::of::<Book>(), "42", &ctx);
        assert_eq!(shell.identifier(), Some("42".to_string()));
        assert_eq!(shell.load_state(), LoadState::Incomplete);
        assert_eq!(shell.get::<String>("title_text"), None);

        let again = resolve_value(EntityType::of::<Book>(), &Value::Int(42), &ctx).unwrap();
        assert!(Arc::ptr_eq(&shell, &again));
    }

    #[test]
    fn test_seen_fields_by_instance() {
        let a = Field::<i64>::new("n");
        let b = Field::<i64>::new("n");
        let mut seen = SeenFields::new();
        assert!(seen.insert(&a));
        assert!(!seen.insert(&a));
        assert!(!seen.contains(&b));
        assert!(seen.contains(&a as &dyn AnyField));
    }
}
