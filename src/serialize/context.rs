//! Serialization contexts: named bundles of the settings a read or write pass
//! runs under.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use convert_case::{Case, Casing};
use serde::{Deserialize, Serialize};

use crate::field::{FieldValue, ValueTransformer};
use crate::registry::IdentityRegistry;

/// Name of the context used when none is specified.
pub const DEFAULT_CONTEXT: &str = "default";

/// External key casing convention.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum KeyCase {
    /// Keys are emitted exactly as declared.
    #[default]
    Unchanged,
    Camel,
    Snake,
    Kebab,
    Pascal,
}

impl KeyCase {
    pub fn apply(self, key: &str) -> String {
        match self {
            KeyCase::Unchanged => key.to_owned(),
            KeyCase::Camel => key.to_case(Case::Camel),
            KeyCase::Snake => key.to_case(Case::Snake),
            KeyCase::Kebab => key.to_case(Case::Kebab),
            KeyCase::Pascal => key.to_case(Case::Pascal),
        }
    }
}

/// Deserializable description of a [`Context`].
///
/// ```
/// use fieldgraph::serialize::{Context, ContextConfig, KeyCase};
///
/// let config: ContextConfig =
///     serde_json::from_str(r#"{"name": "api", "key_case": "camel", "explicit_null": true}"#).unwrap();
/// let ctx = Context::from_config(&config);
/// assert_eq!(ctx.name(), "api");
/// assert_eq!(ctx.key_case(), KeyCase::Camel);
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_context_name")]
    pub name: String,
    #[serde(default)]
    pub key_case: KeyCase,
    #[serde(default)]
    pub explicit_null: bool,
}

fn default_context_name() -> String {
    DEFAULT_CONTEXT.to_owned()
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            name: default_context_name(),
            key_case: KeyCase::default(),
            explicit_null: false,
        }
    }
}

/// Per-type transformer overrides, keyed by the field value type.
#[derive(Clone, Default)]
struct TransformerTable {
    by_type: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl TransformerTable {
    fn insert<T: FieldValue>(&mut self, transformer: Arc<dyn ValueTransformer<T>>) {
        self.by_type.insert(TypeId::of::<T>(), Arc::new(transformer));
    }

    fn get<T: FieldValue>(&self) -> Option<Arc<dyn ValueTransformer<T>>> {
        self.by_type
            .get(&TypeId::of::<T>())?
            .downcast_ref::<Arc<dyn ValueTransformer<T>>>()
            .cloned()
    }
}

/// Settings for one serialization pass.
///
/// Cheap to clone; the transformer table is shared.
#[derive(Clone)]
pub struct Context {
    name: String,
    key_case: KeyCase,
    explicit_null: bool,
    transformers: Arc<TransformerTable>,
    registry: Option<Arc<IdentityRegistry>>,
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("name", &self.name)
            .field("key_case", &self.key_case)
            .field("explicit_null", &self.explicit_null)
            .field("transformers", &self.transformers.by_type.len())
            .field("registry", &self.registry.is_some())
            .finish()
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new(DEFAULT_CONTEXT)
    }
}

impl Context {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            key_case: KeyCase::Unchanged,
            explicit_null: false,
            transformers: Arc::new(TransformerTable::default()),
            registry: None,
        }
    }

    pub fn from_config(config: &ContextConfig) -> Self {
        Self::new(config.name.clone())
            .with_key_case(config.key_case)
            .with_explicit_null(config.explicit_null)
    }

    pub fn with_key_case(mut self, key_case: KeyCase) -> Self {
        self.key_case = key_case;
        self
    }

    /// Emit cleared fields as `null` instead of omitting them.
    pub fn with_explicit_null(mut self, explicit_null: bool) -> Self {
        self.explicit_null = explicit_null;
        self
    }

    /// Canonicalize entities through `registry` while reading.
    pub fn with_registry(mut self, registry: Arc<IdentityRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Override the transformer for every `Field<T>` read or written under
    /// this context.
    pub fn with_transformer<T: FieldValue>(
        mut self,
        transformer: impl ValueTransformer<T> + 'static,
    ) -> Self {
        let transformer: Arc<dyn ValueTransformer<T>> = Arc::new(transformer);
        Arc::make_mut(&mut self.transformers).insert(transformer);
        self
    }

    pub fn name(&self) -> &str { &self.name }
    pub fn key_case(&self) -> KeyCase { self.key_case }
    pub fn explicit_null(&self) -> bool { self.explicit_null }
    pub fn registry(&self) -> Option<&Arc<IdentityRegistry>> { self.registry.as_ref() }

    pub fn transformer<T: FieldValue>(&self) -> Option<Arc<dyn ValueTransformer<T>>> {
        self.transformers.get::<T>()
    }

    /// The dictionary key for a field key under this context's casing.
    pub fn external_key(&self, key: &str) -> String {
        self.key_case.apply(key)
    }
}
