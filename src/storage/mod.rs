//! # Store Trait
//!
//! The contract between entity graphs and whatever persists them. A store
//! sees entities only through the serializer: it writes attribute maps on
//! create/update and hands stored maps back to `serialize::instantiate` on
//! lookup, so reads land in the registry's canonical instances.
//!
//! ## Implementations
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `memory` | In-memory for testing/embedding |

pub mod memory;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::entity::{EntityRef, EntityType};
use crate::serialize::{Context, ContextConfig};
use crate::Result;

pub use memory::MemoryStore;

// ============================================================================
// Store Configuration
// ============================================================================

/// Configuration for a store.
///
/// ```
/// use fieldgraph::storage::StoreConfig;
///
/// let config = StoreConfig::from_json(
///     r#"{"context": {"key_case": "camel"}, "routable_types": ["person"]}"#,
/// ).unwrap();
/// assert!(config.is_routable("person"));
/// assert!(!config.is_routable("invoice"));
/// ```
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Context used for every read and write the store performs.
    #[serde(default)]
    pub context: ContextConfig,

    /// Entity types the store accepts. `None` accepts every type.
    #[serde(default)]
    pub routable_types: Option<Vec<String>>,

    /// Persist entities even when they fail validation.
    #[serde(default)]
    pub skip_validation: bool,
}

impl StoreConfig {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    pub fn is_routable(&self, kind: &str) -> bool {
        self.routable_types
            .as_ref()
            .is_none_or(|types| types.iter().any(|t| t == kind))
    }
}

// ============================================================================
// Store Trait
// ============================================================================

/// Entity persistence.
///
/// Every operation works on canonical instances: `create` and `update`
/// register the entity they are given, and `lookup`/`list` return the
/// registered instance, refreshed from storage.
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Persist a new entity. Assigns an identifier when it has none.
    async fn create(&self, entity: &EntityRef) -> Result<EntityRef>;

    /// Persist an existing entity.
    async fn update(&self, entity: &EntityRef) -> Result<EntityRef>;

    /// Remove an entity and everything its cascading relationships reach.
    async fn delete(&self, entity: &EntityRef) -> Result<()>;

    /// Load one entity by identifier.
    async fn lookup(&self, kind: EntityType, id: &str) -> Result<EntityRef>;

    /// Load every stored entity of `kind`, ordered by identifier: numeric
    /// identifiers numerically, then the rest lexicographically.
    async fn list(&self, kind: EntityType) -> Result<Vec<EntityRef>>;

    /// The context reads and writes run under.
    fn context(&self) -> &Context;
}
