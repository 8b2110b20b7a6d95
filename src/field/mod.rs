//! # Fields
//!
//! A field is a typed, observable, validated value cell owned by one entity.
//!
//! Every field kind (scalar [`Field<T>`], and the relationship fields in
//! [`crate::relationship`]) shares a [`FieldCore`] holding its key, load and
//! validation state, timestamps and change observers, and implements the
//! object-safe [`AnyField`] trait the entity interface is made of.
//!
//! ## Set pipeline
//!
//! ```text
//! set(v) → domain.constrain(v) → store → stamp updated_at/changed_at
//!        → load_state = Loaded → value observers → change observers
//! ```
//!
//! The value lock is released before any observer runs.

pub mod domain;
pub mod validation;
pub mod transform;

use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Weak};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};

use crate::entity::{Entity, EntityRef};
use crate::model::Value;
use crate::observe::{Binding, Observers, ReentrancyFlag, SubscriptionId};
use crate::relationship::RelationshipField;
use crate::serialize::{Context, SeenFields};
use crate::{Error, Result};

pub use domain::{ClampDomain, Domain, FnDomain, OneOf, RangeDomain};
pub use transform::{FieldValue, FnTransformer, NativeTransformer, UnixTimestamp, ValueTransformer};
pub use validation::{ValidationRule, ValidationState};

/// Default priority of ordinary fields. Higher priorities come first in the
/// interface.
pub const DEFAULT_PRIORITY: i32 = 0;

// ============================================================================
// Load state
// ============================================================================

/// How much of a field (or entity) has been populated.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    #[default]
    NotLoaded,
    /// Only partially known, e.g. a shell entity carrying just its identifier.
    Incomplete,
    Loading,
    Loaded,
    /// The last import failed.
    Error,
}

/// `a` is strictly newer than `b`. An absent timestamp is always older, and
/// two absent timestamps are not ordered.
pub(crate) fn is_newer(a: Option<DateTime<Utc>>, b: Option<DateTime<Utc>>) -> bool {
    match (a, b) {
        (Some(a), Some(b)) => a > b,
        (Some(_), None) => true,
        (None, _) => false,
    }
}

// ============================================================================
// FieldCore
// ============================================================================

#[derive(Debug, Default)]
struct FieldState {
    load_state: LoadState,
    validation: ValidationState,
    updated_at: Option<DateTime<Utc>>,
    changed_at: Option<DateTime<Utc>>,
}

/// State shared by every field kind.
pub struct FieldCore {
    name: String,
    key: Option<String>,
    priority: i32,
    owner: RwLock<Weak<Entity>>,
    state: Mutex<FieldState>,
    changes: Observers<()>,
}

impl std::fmt::Debug for FieldCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("FieldCore")
            .field("key", &self.key())
            .field("priority", &self.priority)
            .field("load_state", &state.load_state)
            .field("validation", &state.validation)
            .finish()
    }
}

impl FieldCore {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key: None,
            priority: DEFAULT_PRIORITY,
            owner: RwLock::new(Weak::new()),
            state: Mutex::new(FieldState::default()),
            changes: Observers::new(),
        }
    }

    pub fn name(&self) -> &str { &self.name }

    /// The explicit key if one was given, otherwise the name.
    pub fn key(&self) -> &str {
        self.key.as_deref().unwrap_or(&self.name)
    }

    pub fn priority(&self) -> i32 { self.priority }

    pub(crate) fn set_key(&mut self, key: String) { self.key = Some(key); }
    pub(crate) fn set_priority(&mut self, priority: i32) { self.priority = priority; }

    /// The owning entity, if it is still alive.
    pub fn owner(&self) -> Option<EntityRef> {
        self.owner.read().upgrade()
    }

    pub(crate) fn set_owner(&self, owner: Weak<Entity>) {
        *self.owner.write() = owner;
    }

    pub fn load_state(&self) -> LoadState { self.state.lock().load_state }

    pub fn set_load_state(&self, load_state: LoadState) {
        self.state.lock().load_state = load_state;
    }

    pub fn validation_state(&self) -> ValidationState {
        self.state.lock().validation.clone()
    }

    pub fn set_validation_state(&self, validation: ValidationState) {
        self.state.lock().validation = validation;
    }

    pub fn reset_validation_state(&self) {
        self.set_validation_state(ValidationState::Unknown);
    }

    /// Append `message` (once), turning the state `Invalid`.
    pub fn add_validation_error(&self, message: impl Into<String>) {
        self.state.lock().validation.push_message(message);
    }

    pub fn updated_at(&self) -> Option<DateTime<Utc>> { self.state.lock().updated_at }
    pub fn changed_at(&self) -> Option<DateTime<Utc>> { self.state.lock().changed_at }

    /// Override the update timestamp (merges carry the source's stamp over).
    pub fn set_updated_at(&self, at: Option<DateTime<Utc>>) {
        self.state.lock().updated_at = at;
    }

    /// Untyped "this field's value was set" notifications.
    pub fn changes(&self) -> &Observers<()> { &self.changes }

    /// Record a completed set.
    pub(crate) fn touch(&self, changed: bool) {
        let now = Utc::now();
        let mut state = self.state.lock();
        state.updated_at = Some(now);
        if changed {
            state.changed_at = Some(now);
        }
        state.load_state = LoadState::Loaded;
    }
}

// ============================================================================
// AnyField
// ============================================================================

/// Object-safe view of a field, used by the entity interface, the serializer
/// and the merge/validate machinery.
pub trait AnyField: Any + Send + Sync {
    fn core(&self) -> &FieldCore;

    fn key(&self) -> &str { self.core().key() }
    fn name(&self) -> &str { self.core().name() }
    fn priority(&self) -> i32 { self.core().priority() }
    fn load_state(&self) -> LoadState { self.core().load_state() }
    fn validation_state(&self) -> ValidationState { self.core().validation_state() }

    fn has_value(&self) -> bool;

    /// Set the value to nothing.
    fn clear(&self);

    /// Run the rules against the current value, store and return the result.
    fn validate(&self) -> ValidationState;

    /// Import `value` (absent or null clears). Failures leave the field unset.
    fn read_value(&self, value: Option<&Value>, ctx: &Context);

    /// Export the current value on its first occurrence in a pass.
    fn write_value(&self, ctx: &Context, seen: &mut SeenFields) -> Option<Value>;

    /// Export on a repeat occurrence in the same pass.
    fn write_seen_value(&self, ctx: &Context, seen: &mut SeenFields) -> Option<Value> {
        self.write_value(ctx, seen)
    }

    /// Copy `other`'s value iff it was updated strictly later.
    fn merge_from(&self, other: &dyn AnyField);

    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    fn as_relationship(&self) -> Option<&dyn RelationshipField> { None }
    fn into_relationship(self: Arc<Self>) -> Option<Arc<dyn RelationshipField>> { None }

    /// The entity this field points at, for single-valued relationships.
    fn single_entity(&self) -> Option<EntityRef> { None }
}

impl std::fmt::Debug for dyn AnyField {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnyField")
            .field("key", &self.key())
            .field("load_state", &self.load_state())
            .finish()
    }
}

// ============================================================================
// Field<T>
// ============================================================================

/// A typed scalar field.
///
/// ```
/// use fieldgraph::field::{Field, RangeDomain, ValidationRule};
///
/// let age = Field::<i64>::new("age")
///     .with_domain(RangeDomain::new(0, 100))
///     .with_rule(ValidationRule::required("age is required"));
/// age.set(Some(150));
/// assert_eq!(age.get(), None);
/// ```
pub struct Field<T: FieldValue> {
    core: FieldCore,
    value: Mutex<Option<T>>,
    domain: Option<Arc<dyn Domain<T>>>,
    rules: Vec<ValidationRule<T>>,
    transformers: HashMap<String, Arc<dyn ValueTransformer<T>>>,
    observers: Observers<Option<T>>,
}

impl<T: FieldValue> std::fmt::Debug for Field<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Field")
            .field("key", &self.core.key())
            .field("value", &*self.value.lock())
            .field("load_state", &self.core.load_state())
            .finish()
    }
}

impl<T: FieldValue> Field<T> {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            core: FieldCore::new(name),
            value: Mutex::new(None),
            domain: None,
            rules: Vec::new(),
            transformers: HashMap::new(),
            observers: Observers::new(),
        }
    }

    // ------------------------------------------------------------------------
    // Declaration
    // ------------------------------------------------------------------------

    /// External key, overriding the name.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.core.set_key(key.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.core.set_priority(priority);
        self
    }

    pub fn with_domain(mut self, domain: impl Domain<T> + 'static) -> Self {
        self.domain = Some(Arc::new(domain));
        self
    }

    pub fn with_rule(mut self, rule: ValidationRule<T>) -> Self {
        self.rules.push(rule);
        self
    }

    /// Transformer used only under the context named `context`.
    pub fn with_transformer(
        mut self,
        context: impl Into<String>,
        transformer: impl ValueTransformer<T> + 'static,
    ) -> Self {
        self.transformers.insert(context.into(), Arc::new(transformer));
        self
    }

    // ------------------------------------------------------------------------
    // Value access
    // ------------------------------------------------------------------------

    pub fn core(&self) -> &FieldCore { &self.core }

    pub fn get(&self) -> Option<T> {
        self.value.lock().clone()
    }

    /// Borrow the current value without cloning. `f` must not touch this field.
    pub fn with_value<R>(&self, f: impl FnOnce(Option<&T>) -> R) -> R {
        f(self.value.lock().as_ref())
    }

    /// Constrain, store, stamp and notify.
    pub fn set(&self, value: Option<T>) {
        let value = match (value, &self.domain) {
            (Some(v), Some(domain)) => domain.constrain(v),
            (v, _) => v,
        };
        let changed = {
            let mut slot = self.value.lock();
            let changed = *slot != value || T::is_change(slot.as_ref(), value.as_ref());
            *slot = value.clone();
            changed
        };
        self.core.touch(changed);
        self.observers.notify(&value);
        self.core.changes().notify(&());
    }

    pub fn set_value(&self, value: T) {
        self.set(Some(value));
    }

    // ------------------------------------------------------------------------
    // Observation
    // ------------------------------------------------------------------------

    /// Value observers; each set notifies with the stored value.
    pub fn observers(&self) -> &Observers<Option<T>> { &self.observers }

    /// Subscribe to value updates, optionally replaying the current value
    /// immediately.
    pub fn observe(
        &self,
        replay: bool,
        callback: impl Fn(&Option<T>) + Send + Sync + 'static,
    ) -> SubscriptionId {
        let callback = Arc::new(callback);
        if replay {
            callback(&self.get());
        }
        let forward = Arc::clone(&callback);
        self.observers.subscribe(move |value| forward(value))
    }

    /// Keep `self` and `other` in sync in both directions. `other` takes
    /// `self`'s current value immediately.
    pub fn bind(self: &Arc<Self>, other: &Arc<Field<T>>) -> Binding {
        let flag = Arc::new(ReentrancyFlag::new());

        let forward = {
            let target = Arc::downgrade(other);
            let flag = Arc::clone(&flag);
            self.observers.subscribe_owned(other, move |value| {
                let Some(_token) = flag.enter() else { return };
                if let Some(target) = target.upgrade() {
                    target.set(value.clone());
                }
            })
        };
        let backward = {
            let target = Arc::downgrade(self);
            let flag = Arc::clone(&flag);
            other.observers.subscribe_owned(self, move |value| {
                let Some(_token) = flag.enter() else { return };
                if let Some(target) = target.upgrade() {
                    target.set(value.clone());
                }
            })
        };

        if let Some(_token) = flag.enter() {
            other.set(self.get());
        }

        let ours = self.observers.clone();
        let theirs = other.observers.clone();
        Binding::new(vec![
            Box::new(move || { ours.unsubscribe(forward); }) as Box<dyn FnOnce() + Send + Sync>,
            Box::new(move || { theirs.unsubscribe(backward); }),
        ])
    }

    // ------------------------------------------------------------------------
    // Transformation
    // ------------------------------------------------------------------------

    fn transformer_for(&self, ctx: &Context) -> Arc<dyn ValueTransformer<T>> {
        if let Some(t) = self.transformers.get(ctx.name()) {
            return Arc::clone(t);
        }
        ctx.transformer::<T>()
            .unwrap_or_else(|| Arc::new(NativeTransformer::<T>::new()))
    }

    /// Import a payload value under `ctx`.
    pub fn import(&self, value: &Value, ctx: &Context) -> Result<T> {
        self.transformer_for(ctx)
            .import(value)
            .ok_or_else(|| Error::TransformFailure { key: self.core.key().to_owned() })
    }

    /// Export the current value under `ctx`.
    pub fn export(&self, ctx: &Context) -> Result<Option<Value>> {
        let Some(value) = self.get() else { return Ok(None) };
        self.transformer_for(ctx)
            .export(&value)
            .map(Some)
            .ok_or_else(|| Error::TransformFailure { key: self.core.key().to_owned() })
    }
}

impl<T: FieldValue> AnyField for Field<T> {
    fn core(&self) -> &FieldCore { &self.core }

    fn has_value(&self) -> bool {
        self.value.lock().is_some()
    }

    fn clear(&self) {
        self.set(None);
    }

    fn validate(&self) -> ValidationState {
        let value = self.get();
        let messages: Vec<String> = self
            .rules
            .iter()
            .filter(|rule| !rule.check(value.as_ref()))
            .map(|rule| rule.message().to_owned())
            .collect();
        let state = if messages.is_empty() {
            ValidationState::Valid
        } else {
            ValidationState::Invalid(messages)
        };
        self.core.set_validation_state(state.clone());
        state
    }

    fn read_value(&self, value: Option<&Value>, ctx: &Context) {
        match value {
            None | Some(Value::Null) => self.set(None),
            Some(raw) => match self.import(raw, ctx) {
                Ok(v) => self.set(Some(v)),
                Err(err) => {
                    tracing::trace!(key = self.core.key(), got = raw.type_name(), %err, "import failed");
                    self.set(None);
                    self.core.set_load_state(LoadState::Error);
                }
            },
        }
    }

    fn write_value(&self, ctx: &Context, _seen: &mut SeenFields) -> Option<Value> {
        match self.export(ctx) {
            Ok(v) => v,
            Err(err) => {
                tracing::trace!(key = self.core.key(), %err, "export failed");
                None
            }
        }
    }

    fn merge_from(&self, other: &dyn AnyField) {
        let Some(other) = other.as_any().downcast_ref::<Field<T>>() else {
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
}
