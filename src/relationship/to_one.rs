use std::any::Any;
use std::sync::Arc;

use parking_lot::Mutex;

use super::{
    link, relationship_builders, same_entity, unlink, validate_related, DeepListener, PathSink,
    RelationshipField, RelationshipOptions,
};
use crate::entity::{EntityRef, EntityType, FieldSelection, Model};
use crate::field::{is_newer, AnyField, FieldCore, LoadState, ValidationState};
use crate::model::Value;
use crate::observe::Observers;
use crate::serialize::{self, Context, SeenFields};

/// Single-valued relationship.
pub struct ToOne {
    core: FieldCore,
    target: EntityType,
    options: RelationshipOptions,
    value: Mutex<Option<EntityRef>>,
    observers: Observers<Option<EntityRef>>,
    deep: DeepListener,
}

impl std::fmt::Debug for ToOne {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToOne")
            .field("key", &self.core.key())
            .field("target", &self.target)
            .field("value", &self.get().and_then(|e| e.identifier()))
            .field("options", &self.options)
            .finish()
    }
}

impl ToOne {
    pub fn new<M: Model>(name: impl Into<String>) -> Self {
        Self::of(name, EntityType::of::<M>())
    }

    pub fn of(name: impl Into<String>, target: EntityType) -> Self {
        Self {
            core: FieldCore::new(name),
            target,
            options: RelationshipOptions::default(),
            value: Mutex::new(None),
            observers: Observers::new(),
            deep: DeepListener::default(),
        }
    }

    relationship_builders!();

    pub fn get(&self) -> Option<EntityRef> {
        self.value.lock().clone()
    }

    pub fn observers(&self) -> &Observers<Option<EntityRef>> { &self.observers }

    /// Point at `new`, moving the owner from the old target's inverse field to
    /// the new target's.
    pub fn set(&self, new: Option<EntityRef>) {
        let unchanged = match (self.value.lock().as_ref(), new.as_ref()) {
            (Some(a), Some(b)) => same_entity(a, b),
            (None, None) => true,
            _ => false,
        };
        if unchanged {
            self.core.touch(false);
            return;
        }

        let old = self.store(new.clone());
        let Some(owner) = self.core.owner() else { return };
        if let Some(old) = old {
            unlink(&owner, self, &old);
        }
        if let Some(new) = new {
            link(&owner, self, &new);
        }
    }

    /// Swap the value and notify. Returns the previous target.
    fn store(&self, new: Option<EntityRef>) -> Option<EntityRef> {
        let old = std::mem::replace(&mut *self.value.lock(), new.clone());
        let changed = match (&old, &new) {
            (Some(a), Some(b)) => !same_entity(a, b),
            (None, None) => false,
            _ => true,
        };
        self.core.touch(changed);
        self.deep.rewire(self.core.owner(), new.as_slice());
        self.observers.notify(&new);
        self.core.changes().notify(&());
        old
    }
}

impl AnyField for ToOne {
    fn core(&self) -> &FieldCore { &self.core }

    fn has_value(&self) -> bool {
        self.value.lock().is_some()
    }

    fn clear(&self) {
        self.set(None);
    }

    fn validate(&self) -> ValidationState {
        let related: Vec<EntityRef> = self.get().into_iter().collect();
        validate_related(&self.core, &self.options, &related)
    }

    fn read_value(&self, value: Option<&Value>, ctx: &Context) {
        match value {
            None | Some(Value::Null) => self.set(None),
            Some(raw) => match serialize::resolve_value(self.target, raw, ctx) {
                Some(entity) => self.set(Some(entity)),
                None => {
                    tracing::trace!(key = self.core.key(), got = raw.type_name(), "unresolvable reference");
                    self.set(None);
                    self.core.set_load_state(LoadState::Error);
                }
            },
        }
    }

    fn write_value(&self, ctx: &Context, seen: &mut SeenFields) -> Option<Value> {
        let target = self.get()?;
        if self.options.foreign_key {
            return target.identifier().map(Value::String);
        }
        if let Some(inverse) = self.inverse_of(&target) {
            seen.insert(&*inverse);
        }
        let attrs = serialize::write_with_seen(&target, &FieldSelection::Loaded, ctx, seen);
        Some(Value::Map(attrs))
    }

    fn write_seen_value(&self, ctx: &Context, _seen: &mut SeenFields) -> Option<Value> {
        let target = self.get()?;
        if self.options.foreign_key {
            return target.identifier().map(Value::String);
        }
        serialize::write_reference(&target, ctx).map(Value::Map)
    }

    fn merge_from(&self, other: &dyn AnyField) {
        let Some(other) = other.as_any().downcast_ref::<ToOne>() else {
            tracing::warn!(key = self.core.key(), "merge skipped: field types differ");
            return;
        };
        let stamp = other.core.updated_at();
        if is_newer(stamp, self.core.updated_at()) {
            self.set(other.get());
            self.core.set_updated_at(stamp);
        }
    }

    fn as_any(&self) -> &dyn Any { self }
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> { self }

    fn as_relationship(&self) -> Option<&dyn RelationshipField> { Some(self) }
    fn into_relationship(self: Arc<Self>) -> Option<Arc<dyn RelationshipField>> { Some(self) }

    fn single_entity(&self) -> Option<EntityRef> {
        self.get()
    }
}

impl RelationshipField for ToOne {
    fn target(&self) -> EntityType { self.target }
    fn options(&self) -> &RelationshipOptions { &self.options }

    fn related(&self) -> Vec<EntityRef> {
        self.get().into_iter().collect()
    }

    fn contains(&self, entity: &EntityRef) -> bool {
        self.value.lock().as_ref().is_some_and(|current| same_entity(current, entity))
    }

    /// Point at `entity`. The entity it displaces loses its link back.
    fn attach(&self, entity: &EntityRef) {
        if self.contains(entity) {
            return;
        }
        let displaced = self.store(Some(Arc::clone(entity)));
        if let (Some(old), Some(owner)) = (displaced, self.core.owner()) {
            unlink(&owner, self, &old);
        }
    }

    fn detach(&self, entity: &EntityRef) {
        if self.contains(entity) {
            self.store(None);
        }
    }

    fn set_deep_listener(&self, sink: Option<PathSink>) {
        self.deep.install(sink, self.core.owner(), &self.related());
    }
}
