//! The keyed, priority-ordered field collection of one entity.

use std::cmp::Reverse;
use std::fmt;
use std::sync::Arc;

use hashbrown::HashMap;

use crate::field::{AnyField, Field, DEFAULT_PRIORITY};

/// Priority given to the identifier field, so it is read and written first.
pub const IDENTIFIER_PRIORITY: i32 = 1_000;

// ============================================================================
// InterfaceBuilder
// ============================================================================

/// Collects the fields a [`Model`](super::Model) declares.
#[derive(Default)]
pub struct InterfaceBuilder {
    fields: Vec<Arc<dyn AnyField>>,
    identifier: Option<String>,
}

impl InterfaceBuilder {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub fn field<F: AnyField>(&mut self, field: F) -> &mut Self {
        self.fields.push(Arc::new(field));
        self
    }

    /// Declare a plain string identifier field named `name`.
    pub fn identifier(&mut self, name: &str) -> &mut Self {
        self.identifier_field(Field::new(name))
    }

    /// Declare `field` as the identifier. Unless it already carries a
    /// priority it is moved to the front of the interface.
    pub fn identifier_field(&mut self, field: Field<String>) -> &mut Self {
        let field = if field.core().priority() == DEFAULT_PRIORITY {
            field.with_priority(IDENTIFIER_PRIORITY)
        } else {
            field
        };
        self.identifier = Some(field.core().key().to_owned());
        self.field(field)
    }

    pub fn identifier_key(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    pub(crate) fn into_identifier_key(self) -> Option<String> {
        self.identifier
    }
}

// ============================================================================
// Interface
// ============================================================================

/// Fields ordered by descending priority, then declaration order, with a
/// key index.
pub struct Interface {
    fields: Vec<Arc<dyn AnyField>>,
    index: HashMap<String, usize>,
    identifier: Option<String>,
}

impl fmt::Debug for Interface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interface")
            .field("keys", &self.keys().collect::<Vec<_>>())
            .field("identifier", &self.identifier)
            .finish()
    }
}

impl Interface {
    pub(crate) fn from_builder(builder: InterfaceBuilder, kind: &str) -> Self {
        let mut fields: Vec<Arc<dyn AnyField>> = Vec::with_capacity(builder.fields.len());
        for field in builder.fields {
            match fields.iter().position(|f| f.key() == field.key()) {
                Some(pos) => {
                    tracing::warn!(kind, key = field.key(), "duplicate field key; later declaration wins");
                    fields[pos] = field;
                }
                None => fields.push(field),
            }
        }
        let mut interface = Self {
            fields,
            index: HashMap::new(),
            identifier: builder.identifier,
        };
        interface.reorder();
        interface
    }

    fn reorder(&mut self) {
        // Stable: equal priorities keep declaration order.
        self.fields.sort_by_key(|f| Reverse(f.priority()));
        self.index = self
            .fields
            .iter()
            .enumerate()
            .map(|(i, f)| (f.key().to_owned(), i))
            .collect();
    }

    pub fn get(&self, key: &str) -> Option<&Arc<dyn AnyField>> {
        self.index.get(key).map(|&i| &self.fields[i])
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.index.contains_key(key)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<dyn AnyField>> {
        self.fields.iter()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.fields.iter().map(|f| f.key())
    }

    pub fn len(&self) -> usize {
        self.fields.len()
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty()
    }

    pub fn identifier_key(&self) -> Option<&str> {
        self.identifier.as_deref()
    }

    /// Swap in `field` under its key, returning the field it displaced.
    pub(crate) fn replace(&mut self, field: Arc<dyn AnyField>) -> Option<Arc<dyn AnyField>> {
        let previous = match self.index.get(field.key()) {
            Some(&i) => Some(std::mem::replace(&mut self.fields[i], field)),
            None => {
                self.fields.push(field);
                None
            }
        };
        self.reorder();
        previous
    }
}

// ============================================================================
// FieldSelection
// ============================================================================

/// Which fields a read, write or merge pass touches.
#[derive(Clone, Default)]
pub enum FieldSelection {
    #[default]
    All,
    /// Fields whose load state is `Loaded`. The usual choice for writes, so
    /// never-set fields stay out of the output.
    Loaded,
    Keys(Vec<String>),
    Except(Vec<String>),
    Custom(Arc<dyn Fn(&dyn AnyField) -> bool + Send + Sync>),
}

impl fmt::Debug for FieldSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldSelection::All => f.write_str("All"),
            FieldSelection::Loaded => f.write_str("Loaded"),
            FieldSelection::Keys(keys) => f.debug_tuple("Keys").field(keys).finish(),
            FieldSelection::Except(keys) => f.debug_tuple("Except").field(keys).finish(),
            FieldSelection::Custom(_) => f.write_str("Custom(..)"),
        }
    }
}

impl FieldSelection {
    pub fn keys<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldSelection::Keys(keys.into_iter().map(Into::into).collect())
    }

    pub fn except<I, S>(keys: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FieldSelection::Except(keys.into_iter().map(Into::into).collect())
    }

    pub fn custom(predicate: impl Fn(&dyn AnyField) -> bool + Send + Sync + 'static) -> Self {
        FieldSelection::Custom(Arc::new(predicate))
    }

    pub fn includes(&self, field: &dyn AnyField) -> bool {
        match self {
            FieldSelection::All => true,
            FieldSelection::Loaded => field.load_state() == crate::field::LoadState::Loaded,
            FieldSelection::Keys(keys) => keys.iter().any(|k| k == field.key()),
            FieldSelection::Except(keys) => !keys.iter().any(|k| k == field.key()),
            FieldSelection::Custom(predicate) => predicate(field),
        }
    }

    /// Whether `key` is named explicitly.
    pub fn names(&self, key: &str) -> bool {
        matches!(self, FieldSelection::Keys(keys) if keys.iter().any(|k| k == key))
    }
}
