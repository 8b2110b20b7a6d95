use std::any::Any;
use std::sync::Arc;

use hashbrown::{HashMap, HashSet};
use parking_lot::Mutex;

use super::{
    link, relationship_builders, unlink, validate_related, DeepListener, PathSink,
    RelationshipField, RelationshipOptions,
};
use crate::entity::{EntityRef, EntityType, FieldSelection, Model};
use crate::field::{is_newer, AnyField, FieldCore, LoadState, ValidationState};
use crate::model::Value;
use crate::observe::Observers;
use crate::serialize::{self, Context, SeenFields};

fn addr(entity: &EntityRef) -> usize {
    Arc::as_ptr(entity) as usize
}

/// Ordered members plus identity and identifier indexes.
#[derive(Default)]
struct Members {
    list: Vec<EntityRef>,
    ptrs: HashSet<usize>,
    by_id: HashMap<String, EntityRef>,
}

impl Members {
    /// Keeps the first occurrence of each instance and of each identifier.
    fn from_list(entities: Vec<EntityRef>) -> Self {
        let mut members = Members::default();
        for entity in entities {
            if members.ptrs.contains(&addr(&entity)) {
                continue;
            }
            if let Some(id) = entity.identifier() {
                if members.by_id.contains_key(&id) {
                    tracing::debug!(kind = entity.kind().name(), id, "duplicate member dropped");
                    continue;
                }
                members.by_id.insert(id, Arc::clone(&entity));
            }
            members.ptrs.insert(addr(&entity));
            members.list.push(entity);
        }
        members
    }
}

/// Collection-valued relationship.
///
/// The identifier index is rebuilt on every mutation; an identifier assigned
/// to a member afterwards is picked up on the next one.
pub struct ToMany {
    core: FieldCore,
    target: EntityType,
    options: RelationshipOptions,
    members: Mutex<Members>,
    observers: Observers<Vec<EntityRef>>,
    deep: DeepListener,
}

impl std::fmt::Debug for ToMany {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ToMany")
            .field("key", &self.core.key())
            .field("target", &self.target)
            .field("len", &self.len())
            .field("options", &self.options)
            .finish()
    }
}

impl ToMany {
    pub fn new<M: Model>(name: impl Into<String>) -> Self {
        Self::of(name, EntityType::of::<M>())
    }

    pub fn of(name: impl Into<String>, target: EntityType) -> Self {
        Self {
            core: FieldCore::new(name),
            target,
            options: RelationshipOptions::default(),
            members: Mutex::new(Members::default()),
            observers: Observers::new(),
            deep: DeepListener::default(),
        }
    }

    relationship_builders!();

    pub fn get(&self) -> Vec<EntityRef> {
        self.members.lock().list.clone()
    }

    pub fn len(&self) -> usize {
        self.members.lock().list.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Member with identifier `id`.
    pub fn find(&self, id: &str) -> Option<EntityRef> {
        self.members.lock().by_id.get(id).cloned()
    }

    pub fn observers(&self) -> &Observers<Vec<EntityRef>> { &self.observers }

    /// Replace the members. Removed members lose their link back, added
    /// members gain one; members present on both sides are left alone.
    pub fn set(&self, entities: Vec<EntityRef>) {
        let old = self.store(entities);
        let Some(owner) = self.core.owner() else { return };

        let new = self.get();
        let old_ptrs: HashSet<usize> = old.iter().map(addr).collect();
        let new_ptrs: HashSet<usize> = new.iter().map(addr).collect();

        for removed in old.iter().filter(|e| !new_ptrs.contains(&addr(e))) {
            unlink(&owner, self, removed);
        }
        for added in new.iter().filter(|e| !old_ptrs.contains(&addr(e))) {
            link(&owner, self, added);
        }
    }

    /// Append `entity`. Returns `false` if it (or another member with the
    /// same identifier) is already present, or if its inverse refused the
    /// owner.
    pub fn push(&self, entity: EntityRef) -> bool {
        if self.contains(&entity) {
            return false;
        }
        let mut list = self.get();
        list.push(Arc::clone(&entity));
        self.store(list);
        if !self.contains(&entity) {
            return false;
        }
        match self.core.owner() {
            Some(owner) => link(&owner, self, &entity),
            None => true,
        }
    }

    /// Remove `entity`. Returns whether it was a member.
    pub fn remove(&self, entity: &EntityRef) -> bool {
        if !self.contains(entity) {
            return false;
        }
        self.store(self.without(entity));
        if let Some(owner) = self.core.owner() {
            unlink(&owner, self, entity);
        }
        true
    }

    fn without(&self, entity: &EntityRef) -> Vec<EntityRef> {
        let target = addr(entity);
        self.get().into_iter().filter(|e| addr(e) != target).collect()
    }

    /// Swap the members and notify. Returns the previous members.
    fn store(&self, entities: Vec<EntityRef>) -> Vec<EntityRef> {
        // Identifiers are read before the member lock is taken.
        let members = Members::from_list(entities);
        let snapshot = members.list.clone();
        let old = std::mem::replace(&mut *self.members.lock(), members).list;
        self.core.touch(true);
        self.deep.rewire(self.core.owner(), &snapshot);
        self.observers.notify(&snapshot);
        self.core.changes().notify(&());
        old
    }

    fn references(&self, ctx: &Context) -> Vec<Value> {
        self.get()
            .iter()
            .filter_map(|e| serialize::write_reference(e, ctx))
            .map(Value::Map)
            .collect()
    }

    fn identifiers(&self) -> Vec<Value> {
        self.get().iter().filter_map(|e| e.identifier()).map(Value::String).collect()
    }
}

impl AnyField for ToMany {
    fn core(&self) -> &FieldCore { &self.core }

    fn has_value(&self) -> bool {
        !self.is_empty()
    }

    fn clear(&self) {
        self.set(Vec::new());
    }

    fn validate(&self) -> ValidationState {
        validate_related(&self.core, &self.options, &self.get())
    }

    /// All-or-nothing: one unresolvable element clears the whole field.
    fn read_value(&self, value: Option<&Value>, ctx: &Context) {
        let items = match value {
            None | Some(Value::Null) => return self.set(Vec::new()),
            Some(Value::List(items)) => items,
            Some(other) => {
                tracing::trace!(key = self.core.key(), got = other.type_name(), "expected a list");
                self.set(Vec::new());
                self.core.set_load_state(LoadState::Error);
                return;
            }
        };
        let resolved: Option<Vec<EntityRef>> = items
            .iter()
            .map(|item| serialize::resolve_value(self.target, item, ctx))
            .collect();
        match resolved {
            Some(entities) => self.set(entities),
            None => {
                tracing::trace!(key = self.core.key(), "unresolvable member");
                self.set(Vec::new());
                self.core.set_load_state(LoadState::Error);
            }
        }
    }

    fn write_value(&self, ctx: &Context, seen: &mut SeenFields) -> Option<Value> {
        if self.options.foreign_key {
            return Some(Value::List(self.identifiers()));
        }
        let mut items = Vec::new();
        for member in self.get() {
            if let Some(inverse) = self.inverse_of(&member) {
                seen.insert(&*inverse);
            }
            let attrs = serialize::write_with_seen(&member, &FieldSelection::Loaded, ctx, seen);
            items.push(Value::Map(attrs));
        }
        Some(Value::List(items))
    }

    fn write_seen_value(&self, ctx: &Context, _seen: &mut SeenFields) -> Option<Value> {
        if self.options.foreign_key {
            return Some(Value::List(self.identifiers()));
        }
        Some(Value::List(self.references(ctx)))
    }

    fn merge_from(&self, other: &dyn AnyField) {
        let Some(other) = other.as_any().downcast_ref::<ToMany>() else {
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
}

impl RelationshipField for ToMany {
    fn target(&self) -> EntityType { self.target }
    fn options(&self) -> &RelationshipOptions { &self.options }

    fn related(&self) -> Vec<EntityRef> {
        self.get()
    }

    fn contains(&self, entity: &EntityRef) -> bool {
        self.members.lock().ptrs.contains(&addr(entity))
    }

    fn attach(&self, entity: &EntityRef) {
        if !self.contains(entity) {
            let mut list = self.get();
            list.push(Arc::clone(entity));
            self.store(list);
        }
    }

    fn detach(&self, entity: &EntityRef) {
        if self.contains(entity) {
            self.store(self.without(entity));
        }
    }

    fn set_deep_listener(&self, sink: Option<PathSink>) {
        self.deep.install(sink, self.core.owner(), &self.related());
    }
}
