//! # Entities
//!
//! An entity is a graph node: an [`Interface`] of fields built once per
//! instance from its [`Model`] declaration, plus entity-level load state,
//! validation state and path-qualified change notifications.
//!
//! ```text
//! Person ─┬─ id        (Field<String>, identifier)
//!         ├─ name      (Field<String>)
//!         └─ employer  (ToOne → Company) ── deep listener ──► Company.changes
//!
//! Company.name set  →  Company emits "name"  →  Person emits "employer.name"
//! ```
//!
//! A field change is always emitted by its own entity. Relayed changes are
//! tracked per propagation: a relay reaching an entity the same change is
//! already passing through is dropped, which ends cycles such as
//! `a.friend == b, b.friend == a`. A change made by an observer starts a
//! propagation of its own.
//!
//! Entities are shared as [`EntityRef`] (`Arc<Entity>`). Relationship cycles
//! between entities are strong cycles; break them with `cascade_delete`, by
//! clearing the relationship, or by forgetting the entities in the registry.

mod interface;

use std::cell::RefCell;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashSet;
use parking_lot::{Mutex, RwLock};

use crate::field::{AnyField, Field, FieldValue, LoadState, ValidationState};
use crate::model::FieldPath;
use crate::observe::{Observers, ReentrancyFlag, SubscriptionId};
use crate::relationship::{RelationshipField, ToMany, ToOne};
use crate::{Error, Result};

pub use interface::{FieldSelection, Interface, InterfaceBuilder, IDENTIFIER_PRIORITY};

/// Shared handle to an entity.
pub type EntityRef = Arc<Entity>;

/// Compile-time field registration for one entity type.
///
/// ```
/// use fieldgraph::entity::{Entity, InterfaceBuilder, Model};
/// use fieldgraph::field::Field;
///
/// struct Person;
///
/// impl Model for Person {
///     const TYPE_NAME: &'static str = "person";
///
///     fn declare(b: &mut InterfaceBuilder) {
///         b.identifier("id");
///         b.field(Field::<String>::new("name"));
///     }
/// }
///
/// let ada = Entity::new::<Person>();
/// ada.set("name", Some("Ada".to_string())).unwrap();
/// assert_eq!(ada.get::<String>("name").as_deref(), Some("Ada"));
/// ```
pub trait Model: 'static {
    const TYPE_NAME: &'static str;

    fn declare(builder: &mut InterfaceBuilder);
}

// ============================================================================
// EntityType
// ============================================================================

/// Runtime handle for a [`Model`]: its name and declaration.
#[derive(Clone, Copy)]
pub struct EntityType {
    name: &'static str,
    declare: fn(&mut InterfaceBuilder),
}

impl PartialEq for EntityType {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name
    }
}

impl Eq for EntityType {}

impl std::hash::Hash for EntityType {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.name.hash(state);
    }
}

impl fmt::Debug for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("EntityType").field(&self.name).finish()
    }
}

impl fmt::Display for EntityType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name)
    }
}

impl EntityType {
    pub fn of<M: Model>() -> Self {
        Self { name: M::TYPE_NAME, declare: M::declare }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    /// A fresh, unregistered instance.
    pub fn instantiate(&self) -> EntityRef {
        Entity::build(*self)
    }

    /// Key of the identifier field, without building an entity.
    pub fn identifier_key(&self) -> Option<String> {
        let mut builder = InterfaceBuilder::new();
        (self.declare)(&mut builder);
        builder.into_identifier_key()
    }

    /// Check that every relationship with an inverse names a relationship on
    /// the target type which targets this type and points back.
    pub fn check_inverses(&self) -> Result<()> {
        let sample = self.instantiate();
        for field in sample.fields() {
            let Some(rel) = field.as_relationship() else { continue };
            if !rel.options().has_inverse() {
                continue;
            }
            let mismatch = |reason: String| Error::InverseMismatch {
                kind: self.name.to_owned(),
                field: field.key().to_owned(),
                reason,
            };
            let target = rel.target().instantiate();
            let Some(inverse) = rel.inverse_of(&target) else {
                return Err(mismatch(format!("{} has no inverse field", rel.target())));
            };
            if inverse.target() != *self {
                return Err(mismatch(format!(
                    "inverse {}.{} targets {}",
                    rel.target(),
                    inverse.key(),
                    inverse.target()
                )));
            }
            if inverse.options().has_inverse() {
                match inverse.inverse_of(&sample) {
                    Some(back) if back.key() == field.key() => {}
                    Some(back) => {
                        return Err(mismatch(format!(
                            "inverse {}.{} points back at {}",
                            rel.target(),
                            inverse.key(),
                            back.key()
                        )));
                    }
                    None => {
                        return Err(mismatch(format!(
                            "inverse {}.{} does not point back",
                            rel.target(),
                            inverse.key()
                        )));
                    }
                }
            }
        }
        Ok(())
    }
}

// ============================================================================
// Entity
// ============================================================================

pub struct Entity {
    kind: EntityType,
    interface: RwLock<Interface>,
    load_state: Mutex<LoadState>,
    validation: Mutex<ValidationState>,
    changes: Observers<FieldPath>,
    validating: ReentrancyFlag,
}

impl fmt::Debug for Entity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Entity")
            .field("kind", &self.kind.name)
            .field("id", &self.identifier())
            .field("load_state", &self.load_state())
            .finish()
    }
}

fn entity_addr(entity: &Entity) -> usize {
    entity as *const Entity as usize
}

thread_local! {
    /// One frame per in-flight field change on this thread, innermost last.
    /// A frame holds the entities the change is currently being relayed
    /// through.
    static PROPAGATION: RefCell<Vec<HashSet<usize>>> = RefCell::new(Vec::new());
}

struct PropagationFrame;

impl PropagationFrame {
    fn enter(origin: usize) -> Self {
        let mut frame = HashSet::new();
        frame.insert(origin);
        PROPAGATION.with(|stack| stack.borrow_mut().push(frame));
        PropagationFrame
    }
}

impl Drop for PropagationFrame {
    fn drop(&mut self) {
        PROPAGATION.with(|stack| {
            stack.borrow_mut().pop();
        });
    }
}

impl Entity {
    pub fn new<M: Model>() -> EntityRef {
        EntityType::of::<M>().instantiate()
    }

    fn build(kind: EntityType) -> EntityRef {
        let mut builder = InterfaceBuilder::new();
        (kind.declare)(&mut builder);
        let entity = Arc::new(Entity {
            kind,
            interface: RwLock::new(Interface::from_builder(builder, kind.name)),
            load_state: Mutex::new(LoadState::NotLoaded),
            validation: Mutex::new(ValidationState::Unknown),
            changes: Observers::new(),
            validating: ReentrancyFlag::new(),
        });
        for field in entity.fields() {
            entity.install(&field);
        }
        entity
    }

    /// Point `field` at this entity and forward its notifications.
    fn install(self: &Arc<Self>, field: &Arc<dyn AnyField>) {
        field.core().set_owner(Arc::downgrade(self));

        let weak = Arc::downgrade(self);
        let path = FieldPath::key(field.key());
        field.core().changes().subscribe_owned(self, move |_| {
            if let Some(entity) = weak.upgrade() {
                entity.emit(&path);
            }
        });

        if let Some(rel) = field.as_relationship() {
            let weak = Arc::downgrade(self);
            let key = field.key().to_owned();
            rel.set_deep_listener(Some(Arc::new(move |path: &FieldPath| {
                if let Some(entity) = weak.upgrade() {
                    entity.relay(&path.prefixed(&key));
                }
            })));
        }
    }

    /// A change of one of this entity's own fields. Always delivered, and
    /// starts a propagation of its own.
    fn emit(&self, path: &FieldPath) {
        let _frame = PropagationFrame::enter(entity_addr(self));
        self.changes.notify(path);
    }

    /// A change relayed from a related entity. Dropped when the current
    /// propagation already runs through this entity.
    fn relay(&self, path: &FieldPath) {
        let me = entity_addr(self);
        let entered = PROPAGATION.with(|stack| {
            stack.borrow_mut().last_mut().map(|frame| frame.insert(me))
        });
        match entered {
            None => self.emit(path),
            Some(false) => {
                tracing::trace!(kind = self.kind.name, %path, "notification came back around a cycle");
            }
            Some(true) => {
                self.changes.notify(path);
                PROPAGATION.with(|stack| {
                    if let Some(frame) = stack.borrow_mut().last_mut() {
                        frame.remove(&me);
                    }
                });
            }
        }
    }

    // ------------------------------------------------------------------------
    // State
    // ------------------------------------------------------------------------

    pub fn kind(&self) -> EntityType { self.kind }

    pub fn load_state(&self) -> LoadState { *self.load_state.lock() }

    pub fn set_load_state(&self, load_state: LoadState) {
        *self.load_state.lock() = load_state;
    }

    /// Result of the last [`validate`](Self::validate).
    pub fn validation_state(&self) -> ValidationState {
        self.validation.lock().clone()
    }

    // ------------------------------------------------------------------------
    // Fields
    // ------------------------------------------------------------------------

    /// Snapshot of the interface in order.
    pub fn fields(&self) -> Vec<Arc<dyn AnyField>> {
        self.interface.read().iter().cloned().collect()
    }

    pub fn field(&self, key: &str) -> Option<Arc<dyn AnyField>> {
        self.interface.read().get(key).cloned()
    }

    pub fn field_keys(&self) -> Vec<String> {
        self.interface.read().keys().map(str::to_owned).collect()
    }

    /// The field at `key` as its concrete type.
    pub fn field_as<F: AnyField>(&self, key: &str) -> Option<Arc<F>> {
        self.field(key)?.into_any().downcast::<F>().ok()
    }

    pub fn scalar<T: FieldValue>(&self, key: &str) -> Option<Arc<Field<T>>> {
        self.field_as(key)
    }

    pub fn to_one(&self, key: &str) -> Option<Arc<ToOne>> {
        self.field_as(key)
    }

    pub fn to_many(&self, key: &str) -> Option<Arc<ToMany>> {
        self.field_as(key)
    }

    pub fn relationship(&self, key: &str) -> Option<Arc<dyn RelationshipField>> {
        self.field(key)?.into_relationship()
    }

    pub fn get<T: FieldValue>(&self, key: &str) -> Option<T> {
        self.scalar::<T>(key)?.get()
    }

    pub fn set<T: FieldValue>(&self, key: &str, value: Option<T>) -> Result<()> {
        let field = self
            .scalar::<T>(key)
            .ok_or_else(|| Error::UnknownField(format!("{}.{key}", self.kind.name)))?;
        field.set(value);
        Ok(())
    }

    /// Resolve a dotted path, descending through single-entity relationships.
    pub fn field_at(&self, path: &FieldPath) -> Option<Arc<dyn AnyField>> {
        let field = self.field(path.first()?)?;
        if path.len() == 1 {
            return Some(field);
        }
        field.single_entity()?.field_at(&path.rest())
    }

    /// Install `field` under its key, returning the field it displaced.
    pub fn replace_field<F: AnyField>(self: &Arc<Self>, field: F) -> Option<Arc<dyn AnyField>> {
        let field: Arc<dyn AnyField> = Arc::new(field);
        let previous = self.interface.write().replace(Arc::clone(&field));
        if let Some(old) = &previous {
            old.core().changes().unsubscribe_owner(self);
            if let Some(rel) = old.as_relationship() {
                rel.set_deep_listener(None);
            }
        }
        self.install(&field);
        previous
    }

    // ------------------------------------------------------------------------
    // Identifier
    // ------------------------------------------------------------------------

    pub fn identifier_key(&self) -> Option<String> {
        self.interface.read().identifier_key().map(str::to_owned)
    }

    pub fn identifier_field(&self) -> Option<Arc<Field<String>>> {
        let key = self.identifier_key()?;
        self.scalar::<String>(&key)
    }

    pub fn identifier(&self) -> Option<String> {
        self.identifier_field()?.get()
    }

    /// Set the identifier. Does not re-key the entity in any registry.
    pub fn set_identifier(&self, id: Option<String>) {
        match self.identifier_field() {
            Some(field) => field.set(id),
            None => tracing::warn!(kind = self.kind.name, "entity type has no identifier field"),
        }
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Every path-qualified change notification of this entity.
    pub fn changes(&self) -> &Observers<FieldPath> { &self.changes }

    /// Subscribe to changes matching `pattern` (`"owner.*"` matches the
    /// owner field and everything beneath it).
    pub fn observe(
        &self,
        pattern: impl Into<FieldPath>,
        callback: impl Fn(&FieldPath) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let pattern = pattern.into();
        self.changes.subscribe(move |path| {
            if pattern.matches(path) {
                callback(path);
            }
        })
    }

    /// Like [`observe`](Self::observe), dropped along with `owner`.
    pub fn observe_owned<O: std::any::Any + Send + Sync>(
        &self,
        owner: &Arc<O>,
        pattern: impl Into<FieldPath>,
        callback: impl Fn(&FieldPath) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let pattern = pattern.into();
        self.changes.subscribe_owned(owner, move |path| {
            if pattern.matches(path) {
                callback(path);
            }
        })
    }

    pub fn unobserve(&self, id: SubscriptionId) -> bool {
        self.changes.unsubscribe(id)
    }

    // ------------------------------------------------------------------------
    // Validation
    // ------------------------------------------------------------------------

    /// Validate this entity's own fields. Related entities are validated only
    /// through relationships declared with `require_valid`. An entity reached
    /// again while it is already being validated counts as valid.
    ///
    /// Messages are concatenated in field order; two fields failing with the
    /// same message contribute it twice. See [`field_errors`](Self::field_errors).
    pub fn validate(&self) -> ValidationState {
        let Some(_guard) = self.validating.enter() else {
            return ValidationState::Valid;
        };
        let mut messages: Vec<String> = Vec::new();
        for field in self.fields() {
            field.core().reset_validation_state();
            messages.extend_from_slice(field.validate().messages());
        }
        let state = if messages.is_empty() {
            ValidationState::Valid
        } else {
            ValidationState::Invalid(messages)
        };
        *self.validation.lock() = state.clone();
        state
    }

    pub fn is_valid(&self) -> bool {
        self.validate().is_valid()
    }

    /// Messages of the last validation, keyed by the field that failed.
    pub fn field_errors(&self) -> Vec<(String, Vec<String>)> {
        self.fields()
            .iter()
            .filter_map(|field| match field.validation_state() {
                ValidationState::Invalid(messages) => Some((field.key().to_owned(), messages)),
                _ => None,
            })
            .collect()
    }

    // ------------------------------------------------------------------------
    // Graph operations
    // ------------------------------------------------------------------------

    /// Invoke `callback` once on every entity reachable through
    /// `cascade_delete` relationships, excluding `self`.
    pub fn cascade_delete(self: &Arc<Self>, mut callback: impl FnMut(&EntityRef)) {
        let mut seen = HashSet::new();
        seen.insert(entity_addr(self));
        self.cascade_into(&mut seen, &mut callback);
    }

    fn cascade_into(&self, seen: &mut HashSet<usize>, callback: &mut dyn FnMut(&EntityRef)) {
        for field in self.fields() {
            let Some(rel) = field.as_relationship() else { continue };
            if !rel.options().cascade_delete {
                continue;
            }
            for target in rel.related() {
                if seen.insert(entity_addr(&target)) {
                    tracing::debug!(
                        from = self.kind.name,
                        field = field.key(),
                        kind = target.kind.name,
                        id = ?target.identifier(),
                        "cascade delete"
                    );
                    callback(&target);
                    target.cascade_into(seen, callback);
                }
            }
        }
    }

    /// Merge newer field values from `other`. The identifier is only merged
    /// when `include_identifier` is set or `fields` names it explicitly.
    pub fn merge(&self, other: &Entity, fields: &FieldSelection, include_identifier: bool) {
        let identifier_key = self.identifier_key();
        for field in self.fields() {
            if !fields.includes(&*field) {
                continue;
            }
            let is_identifier = identifier_key.as_deref() == Some(field.key());
            if is_identifier && !include_identifier && !fields.names(field.key()) {
                continue;
            }
            if let Some(theirs) = other.field(field.key()) {
                field.merge_from(&*theirs);
            }
        }
    }

    /// Visit every field of this entity, and with `recursive` every field of
    /// every related entity, each entity once.
    pub fn visit_all_fields(
        self: &Arc<Self>,
        recursive: bool,
        mut visitor: impl FnMut(&EntityRef, &Arc<dyn AnyField>),
    ) {
        let mut seen = HashSet::new();
        let mut stack = vec![Arc::clone(self)];
        while let Some(entity) = stack.pop() {
            if !seen.insert(entity_addr(&entity)) {
                continue;
            }
            for field in entity.fields() {
                visitor(&entity, &field);
                if recursive {
                    if let Some(rel) = field.as_relationship() {
                        stack.extend(rel.related());
                    }
                }
            }
        }
    }
}
