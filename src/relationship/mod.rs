//! # Relationship fields
//!
//! Fields whose value is one ([`ToOne`]) or many ([`ToMany`]) other entities.
//!
//! ## Inverse consistency
//!
//! A relationship may name an inverse: the relationship field on the target
//! entity that points back. After any mutation of either side the pair
//! agrees, `X.a == Y` iff `Y.b` holds `X`.
//!
//! ```text
//! X.a.set(Y)   ── old target W ──►  W.b.detach(X)
//!              ── new target Y ──►  Y.b.attach(X)   (ToOne: displaces Y's old X')
//! ```
//!
//! `attach`/`detach` mutate one side only and never re-enter the forward
//! setter, so the protocol terminates on cyclic graphs. Both check membership
//! first, so an already consistent pair is left alone.
//!
//! A `ToMany` keeps one member per identifier. When its `attach` refuses an
//! owner for that reason, the forward side drops its value again.
//!
//! ## External forms
//!
//! | Mode | First occurrence in a pass | Repeat occurrence |
//! |------|----------------------------|-------------------|
//! | foreign key | `"id"` / `["id", ..]` | same |
//! | embedded | `{..all loaded fields..}` | `{"id": ..}`, omitted without id |

mod to_one;
mod to_many;

use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::Mutex;

use crate::entity::{Entity, EntityRef, EntityType};
use crate::field::{AnyField, FieldCore, ValidationState};
use crate::model::FieldPath;
use crate::observe::SubscriptionId;

pub use to_many::ToMany;
pub use to_one::ToOne;

/// Maps a related entity to its field pointing back.
pub type InverseFn = Arc<dyn Fn(&EntityRef) -> Option<Arc<dyn RelationshipField>> + Send + Sync>;

/// Receives change paths bubbling up from related entities.
pub type PathSink = Arc<dyn Fn(&FieldPath) + Send + Sync>;

// ============================================================================
// Options
// ============================================================================

#[derive(Clone, Default)]
pub struct RelationshipOptions {
    /// Serialize as the bare identifier instead of an embedded entity.
    pub foreign_key: bool,
    pub cascade_delete: bool,
    /// Related entities must validate for this field to be valid.
    pub require_valid: bool,
    inverse: Option<InverseFn>,
}

impl fmt::Debug for RelationshipOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RelationshipOptions")
            .field("foreign_key", &self.foreign_key)
            .field("cascade_delete", &self.cascade_delete)
            .field("require_valid", &self.require_valid)
            .field("inverse", &self.inverse.is_some())
            .finish()
    }
}

impl RelationshipOptions {
    pub fn has_inverse(&self) -> bool {
        self.inverse.is_some()
    }

    pub fn inverse(&self) -> Option<&InverseFn> {
        self.inverse.as_ref()
    }
}

/// Declaration builders shared by both relationship kinds.
macro_rules! relationship_builders {
    () => {
        /// External key, overriding the name.
        pub fn with_key(mut self, key: impl Into<String>) -> Self {
            self.core.set_key(key.into());
            self
        }

        pub fn with_priority(mut self, priority: i32) -> Self {
            self.core.set_priority(priority);
            self
        }

        pub fn foreign_key(mut self) -> Self {
            self.options.foreign_key = true;
            self
        }

        pub fn cascade_delete(mut self) -> Self {
            self.options.cascade_delete = true;
            self
        }

        pub fn require_valid(mut self) -> Self {
            self.options.require_valid = true;
            self
        }

        /// Pair with the relationship field at `key` on the target entity.
        pub fn inverse(self, key: impl Into<String>) -> Self {
            let key = key.into();
            self.inverse_with(move |entity: &EntityRef| entity.relationship(&key))
        }

        pub fn inverse_with(
            mut self,
            inverse: impl Fn(&EntityRef) -> Option<Arc<dyn RelationshipField>> + Send + Sync + 'static,
        ) -> Self {
            self.options.inverse = Some(Arc::new(inverse));
            self
        }

        pub fn core(&self) -> &FieldCore {
            &self.core
        }
    };
}

pub(crate) use relationship_builders;

// ============================================================================
// RelationshipField
// ============================================================================

/// Object-safe view of a relationship field.
pub trait RelationshipField: AnyField {
    fn target(&self) -> EntityType;
    fn options(&self) -> &RelationshipOptions;

    /// Current related entities, in order.
    fn related(&self) -> Vec<EntityRef>;

    /// Identity membership.
    fn contains(&self, entity: &EntityRef) -> bool;

    /// Add `entity` on this side only.
    fn attach(&self, entity: &EntityRef);

    /// Remove `entity` on this side only.
    fn detach(&self, entity: &EntityRef);

    /// Route the related entities' notifications to `sink`, or stop when
    /// `None`.
    fn set_deep_listener(&self, sink: Option<PathSink>);

    /// The field on `entity` that should point back at this field's owner.
    fn inverse_of(&self, entity: &EntityRef) -> Option<Arc<dyn RelationshipField>> {
        let inverse = self.options().inverse()?;
        inverse(entity)
    }
}

fn inverse_for(field: &dyn RelationshipField, target: &EntityRef) -> Option<Arc<dyn RelationshipField>> {
    if !field.options().has_inverse() {
        return None;
    }
    let inverse = field.inverse_of(target);
    if inverse.is_none() {
        tracing::warn!(
            field = field.key(),
            target = target.kind().name(),
            "inverse field missing; pairing skipped"
        );
    }
    inverse
}

/// Make `target`'s inverse field hold `owner`.
///
/// An inverse may refuse `owner` (a `ToMany` already holding another member
/// with the same identifier). `field` then lets go of `target` so both sides
/// still agree. Returns whether the pair is linked.
pub(crate) fn link(owner: &EntityRef, field: &dyn RelationshipField, target: &EntityRef) -> bool {
    let Some(inverse) = inverse_for(field, target) else { return true };
    if inverse.contains(owner) {
        return true;
    }
    inverse.attach(owner);
    if inverse.contains(owner) {
        return true;
    }
    tracing::warn!(
        field = field.key(),
        inverse = inverse.key(),
        kind = owner.kind().name(),
        id = ?owner.identifier(),
        "inverse refused duplicate identifier; link rolled back"
    );
    field.detach(target);
    false
}

/// Make `target`'s inverse field let go of `owner`.
pub(crate) fn unlink(owner: &EntityRef, field: &dyn RelationshipField, target: &EntityRef) {
    if let Some(inverse) = inverse_for(field, target) {
        if inverse.contains(owner) {
            inverse.detach(owner);
        }
    }
}

/// Validation shared by both kinds: with `require_valid`, every related
/// entity must validate. Absence is always valid.
pub(crate) fn validate_related(core: &FieldCore, options: &RelationshipOptions, related: &[EntityRef]) -> ValidationState {
    let mut state = ValidationState::Valid;
    if options.require_valid {
        for entity in related {
            if entity.validate().is_invalid() {
                let id = entity.identifier().unwrap_or_else(|| "?".to_owned());
                state.push_message(format!("{}: {} {id} is invalid", core.key(), entity.kind()));
            }
        }
    }
    core.set_validation_state(state.clone());
    state
}

pub(crate) fn same_entity(a: &EntityRef, b: &EntityRef) -> bool {
    Arc::ptr_eq(a, b)
}

// ============================================================================
// Deep listener
// ============================================================================

/// Subscriptions on the related entities' change observers, rebuilt every
/// time the relationship's value changes.
#[derive(Default)]
pub(crate) struct DeepListener {
    sink: Mutex<Option<PathSink>>,
    subscriptions: Mutex<Vec<(Weak<Entity>, SubscriptionId)>>,
}

impl DeepListener {
    pub(crate) fn install(&self, sink: Option<PathSink>, owner: Option<EntityRef>, targets: &[EntityRef]) {
        *self.sink.lock() = sink;
        self.rewire(owner, targets);
    }

    pub(crate) fn rewire(&self, owner: Option<EntityRef>, targets: &[EntityRef]) {
        let stale = std::mem::take(&mut *self.subscriptions.lock());
        for (entity, id) in stale {
            if let Some(entity) = entity.upgrade() {
                entity.changes().unsubscribe(id);
            }
        }

        let Some(sink) = self.sink.lock().clone() else { return };
        let mut subscriptions = Vec::with_capacity(targets.len());
        for target in targets {
            let sink = Arc::clone(&sink);
            let forward = move |path: &FieldPath| sink(path);
            let id = match &owner {
                Some(owner) => target.changes().subscribe_owned(owner, forward),
                None => target.changes().subscribe(forward),
            };
            subscriptions.push((Arc::downgrade(target), id));
        }
        *self.subscriptions.lock() = subscriptions;
    }
}
