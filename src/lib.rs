//! # fieldgraph: Observable Fields and Entity Graphs
//!
//! Typed, observable, validated fields composed into entities, with
//! bidirectional relationships and cycle-safe conversion to and from
//! attribute dictionaries.
//!
//! ## Design Principles
//!
//! 1. **Fields own state, entities own structure**: a `Field<T>` knows its
//!    value, load state and validation; an `Entity` knows its interface.
//! 2. **Inverses are kept, not checked**: relationship fields update the
//!    field pointing back on every mutation.
//! 3. **Seen-sets bound every walk**: serialization, cascade delete and field
//!    visiting terminate on cyclic graphs.
//! 4. **One instance per identity**: reads canonicalize through the
//!    `IdentityRegistry`.
//!
//! ## Quick Start
//!
//! ```rust
//! use fieldgraph::{Context, Entity, Field, FieldSelection, InterfaceBuilder, Model, ToOne};
//! use fieldgraph::serialize;
//!
//! struct Author;
//! struct Book;
//!
//! impl Model for Author {
//!     const TYPE_NAME: &'static str = "author";
//!     fn declare(b: &mut InterfaceBuilder) {
//!         b.identifier("id");
//!         b.field(ToOne::new::<Book>("book").inverse("author"));
//!     }
//! }
//!
//! impl Model for Book {
//!     const TYPE_NAME: &'static str = "book";
//!     fn declare(b: &mut InterfaceBuilder) {
//!         b.identifier("id");
//!         b.field(Field::<String>::new("title"));
//!         b.field(ToOne::new::<Author>("author").inverse("book"));
//!     }
//! }
//!
//! let author = Entity::new::<Author>();
//! author.set_identifier(Some("a1".into()));
//! let book = Entity::new::<Book>();
//! book.set_identifier(Some("b1".into()));
//!
//! author.to_one("book").unwrap().set(Some(book.clone()));
//! assert!(book.to_one("author").unwrap().get().is_some());
//!
//! let attrs = serialize::write(&author, &FieldSelection::Loaded, &Context::default());
//! assert_eq!(
//!     fieldgraph::model::attributes_to_json(&attrs).unwrap(),
//!     r#"{"book":{"author":{"id":"a1"},"id":"b1"},"id":"a1"}"#,
//! );
//! ```
//!
//! ## Stores
//!
//! | Store | Module | Description |
//! |-------|--------|-------------|
//! | `MemoryStore` | `storage::memory` | In-memory, for testing/embedding |

// ============================================================================
// Modules
// ============================================================================

pub mod model;
pub mod observe;
pub mod field;
pub mod entity;
pub mod relationship;
pub mod serialize;
pub mod registry;
pub mod storage;

// ============================================================================
// Re-exports: Model (the plain data)
// ============================================================================

pub use model::{AttributeMap, FieldPath, Value};

// ============================================================================
// Re-exports: Fields and entities
// ============================================================================

pub use field::{AnyField, Field, FieldValue, LoadState, ValidationRule, ValidationState};
pub use observe::{Binding, Observers, SubscriptionId};
pub use entity::{Entity, EntityRef, EntityType, FieldSelection, InterfaceBuilder, Model};
pub use relationship::{RelationshipField, RelationshipOptions, ToMany, ToOne};

// ============================================================================
// Re-exports: Serialization and storage
// ============================================================================

pub use serialize::{Context, ContextConfig, KeyCase};
pub use registry::IdentityRegistry;
pub use storage::{MemoryStore, Store, StoreConfig};

// ============================================================================
// Error Types
// ============================================================================

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Validation failed: {}", messages.join("; "))]
    ValidationFailure { messages: Vec<String> },

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Missing identifier: {0}")]
    MissingIdentifier(String),

    #[error("Transform failed for field '{key}'")]
    TransformFailure { key: String },

    #[error("Unroutable entity type: {0}")]
    UnroutableEntity(String),

    #[error("Unknown field: {0}")]
    UnknownField(String),

    #[error("Inverse mismatch on {kind}.{field}: {reason}")]
    InverseMismatch { kind: String, field: String, reason: String },

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, Error>;
