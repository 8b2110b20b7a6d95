//! AttributeMap: the tree-shaped dictionary entities serialize to.

use std::collections::HashMap;
use super::Value;

/// A map of field keys to values. Order is irrelevant.
pub type AttributeMap = HashMap<String, Value>;

/// Build an AttributeMap from (key, value) pairs.
pub fn attributes<K, V>(pairs: impl IntoIterator<Item = (K, V)>) -> AttributeMap
where
    K: Into<String>,
    V: Into<Value>,
{
    pairs.into_iter().map(|(k, v)| (k.into(), v.into())).collect()
}

/// Parse a JSON object into an AttributeMap.
///
/// Anything other than a JSON object is a `TransformFailure`.
pub fn attributes_from_json(json: &str) -> crate::Result<AttributeMap> {
    let parsed: serde_json::Value = serde_json::from_str(json)?;
    match Value::from(parsed) {
        Value::Map(map) => Ok(map),
        other => Err(crate::Error::TransformFailure {
            key: format!("<root: {}>", other.type_name()),
        }),
    }
}

/// Render an AttributeMap as compact JSON.
pub fn attributes_to_json(attrs: &AttributeMap) -> crate::Result<String> {
    let json = serde_json::Value::from(Value::Map(attrs.clone()));
    Ok(serde_json::to_string(&json)?)
}
