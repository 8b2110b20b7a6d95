//! # Attribute Model
//!
//! Plain data that crosses every boundary: field ↔ serializer ↔ store.
//!
//! Design rule: nothing here knows about fields, entities or observers.
//! This module is pure data with no I/O or async.

pub mod value;
pub mod attributes;
pub mod path;

pub use value::Value;
pub use attributes::{AttributeMap, attributes, attributes_from_json, attributes_to_json};
pub use path::FieldPath;
