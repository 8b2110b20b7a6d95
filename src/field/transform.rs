//! Value transformers: paired import/export between a field's Rust type and
//! the closed [`Value`] representation.
//!
//! Resolution order for a `Field<T>` under a given context:
//!
//! 1. a transformer registered on the field for that context name,
//! 2. a per-type override registered on the context,
//! 3. the type's own [`FieldValue`] conversion.

use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, NaiveDate, TimeZone, Utc};

use crate::model::Value;

/// Types a [`Field`](super::Field) can hold.
pub trait FieldValue: Clone + PartialEq + std::fmt::Debug + Send + Sync + 'static {
    fn import(value: &Value) -> Option<Self>;
    fn export(&self) -> Option<Value>;

    /// Extra change detection beyond `!=`. Collections report every set as a
    /// change because in-place mutation cannot always be seen by equality.
    fn is_change(_old: Option<&Self>, _new: Option<&Self>) -> bool {
        false
    }
}

/// Paired import/export functions.
pub trait ValueTransformer<T>: Send + Sync {
    fn import(&self, value: &Value) -> Option<T>;
    fn export(&self, value: &T) -> Option<Value>;
}

// ============================================================================
// Built-in FieldValue impls
// ============================================================================

impl FieldValue for bool {
    fn import(value: &Value) -> Option<Self> { value.as_bool() }
    fn export(&self) -> Option<Value> { Some(Value::Bool(*self)) }
}

impl FieldValue for i64 {
    fn import(value: &Value) -> Option<Self> { value.as_int() }
    fn export(&self) -> Option<Value> { Some(Value::Int(*self)) }
}

impl FieldValue for i32 {
    fn import(value: &Value) -> Option<Self> {
        value.as_int().and_then(|i| i32::try_from(i).ok())
    }
    fn export(&self) -> Option<Value> { Some(Value::Int(i64::from(*self))) }
}

impl FieldValue for f64 {
    fn import(value: &Value) -> Option<Self> { value.as_float() }
    fn export(&self) -> Option<Value> {
        self.is_finite().then_some(Value::Float(*self))
    }
}

impl FieldValue for String {
    fn import(value: &Value) -> Option<Self> { value.as_str().map(str::to_owned) }
    fn export(&self) -> Option<Value> { Some(Value::String(self.clone())) }
}

impl FieldValue for Value {
    fn import(value: &Value) -> Option<Self> { Some(value.clone()) }
    fn export(&self) -> Option<Value> { Some(self.clone()) }
}

/// RFC 3339 strings; integer input is read as unix seconds.
impl FieldValue for DateTime<Utc> {
    fn import(value: &Value) -> Option<Self> {
        match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s).ok().map(|dt| dt.with_timezone(&Utc)),
            Value::Int(secs) => Utc.timestamp_opt(*secs, 0).single(),
            _ => None,
        }
    }
    fn export(&self) -> Option<Value> { Some(Value::String(self.to_rfc3339())) }
}

/// `YYYY-MM-DD`.
impl FieldValue for NaiveDate {
    fn import(value: &Value) -> Option<Self> {
        value.as_str().and_then(|s| NaiveDate::parse_from_str(s, "%Y-%m-%d").ok())
    }
    fn export(&self) -> Option<Value> {
        Some(Value::String(self.format("%Y-%m-%d").to_string()))
    }
}

/// All-or-nothing: one unreadable element makes the whole list unreadable.
impl<T: FieldValue> FieldValue for Vec<T> {
    fn import(value: &Value) -> Option<Self> {
        value.as_list()?.iter().map(T::import).collect()
    }
    fn export(&self) -> Option<Value> {
        self.iter().map(T::export).collect::<Option<Vec<_>>>().map(Value::List)
    }
    fn is_change(_old: Option<&Self>, _new: Option<&Self>) -> bool {
        true
    }
}

// ============================================================================
// Transformer implementations
// ============================================================================

/// The [`FieldValue`] conversion of `T`, as a transformer.
pub struct NativeTransformer<T>(PhantomData<fn() -> T>);

impl<T> NativeTransformer<T> {
    pub fn new() -> Self {
        Self(PhantomData)
    }
}

impl<T> Default for NativeTransformer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: FieldValue> ValueTransformer<T> for NativeTransformer<T> {
    fn import(&self, value: &Value) -> Option<T> { T::import(value) }
    fn export(&self, value: &T) -> Option<Value> { T::export(value) }
}

/// Transformer assembled from two closures.
pub struct FnTransformer<T> {
    import: Arc<dyn Fn(&Value) -> Option<T> + Send + Sync>,
    export: Arc<dyn Fn(&T) -> Option<Value> + Send + Sync>,
}

impl<T> FnTransformer<T> {
    pub fn new(
        import: impl Fn(&Value) -> Option<T> + Send + Sync + 'static,
        export: impl Fn(&T) -> Option<Value> + Send + Sync + 'static,
    ) -> Self {
        Self { import: Arc::new(import), export: Arc::new(export) }
    }
}

impl<T> ValueTransformer<T> for FnTransformer<T> {
    fn import(&self, value: &Value) -> Option<T> { (self.import)(value) }
    fn export(&self, value: &T) -> Option<Value> { (self.export)(value) }
}

/// Timestamps as integer unix seconds instead of RFC 3339 strings.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixTimestamp;

impl ValueTransformer<DateTime<Utc>> for UnixTimestamp {
    fn import(&self, value: &Value) -> Option<DateTime<Utc>> {
        value.as_int().and_then(|secs| Utc.timestamp_opt(secs, 0).single())
    }
    fn export(&self, value: &DateTime<Utc>) -> Option<Value> {
        Some(Value::Int(value.timestamp()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scalar_conversions() {
        assert_eq!(i64::import(&Value::Int(7)), Some(7));
        assert_eq!(i64::import(&Value::from("7")), None);
        assert_eq!(i32::import(&Value::Int(i64::MAX)), None);
        assert_eq!(f64::import(&Value::Int(2)), Some(2.0));
        assert_eq!(f64::NAN.export(), None);
        assert_eq!(String::import(&Value::from("x")), Some("x".to_string()));
        assert_eq!(bool::import(&Value::Int(1)), None);
    }

    #[test]
    fn test_datetime_conversions() {
        let dt = Utc.with_ymd_and_hms(2024, 5, 1, 12, 0, 0).unwrap();
        let exported = dt.export().unwrap();
        assert_eq!(DateTime::<Utc>::import(&exported), Some(dt));
        assert_eq!(DateTime::<Utc>::import(&Value::Int(dt.timestamp())), Some(dt));

        assert_eq!(UnixTimestamp.export(&dt), Some(Value::Int(dt.timestamp())));
        assert_eq!(UnixTimestamp.import(&Value::from("nope")), None);

        let date = NaiveDate::from_ymd_opt(2024, 2, 29).unwrap();
        assert_eq!(NaiveDate::import(&date.export().unwrap()), Some(date));
    }

    #[test]
    fn test_list_is_all_or_nothing() {
        let good = Value::List(vec![Value::Int(1), Value::Int(2)]);
        let bad = Value::List(vec![Value::Int(1), Value::from("two")]);
        assert_eq!(Vec::<i64>::import(&good), Some(vec![1, 2]));
        assert_eq!(Vec::<i64>::import(&bad), None);
        assert!(Vec::<i64>::is_change(Some(&vec![1]), Some(&vec![1])));
        assert!(!i64::is_change(Some(&1), Some(&1)));
    }

    #[test]
    fn test_fn_transformer() {
        let upper = FnTransformer::new(
            |v: &Value| v.as_str().map(str::to_lowercase),
            |s: &String| Some(Value::String(s.to_uppercase())),
        );
        assert_eq!(upper.import(&Value::from("ABC")), Some("abc".to_string()));
        assert_eq!(upper.export(&"abc".to_string()), Some(Value::from("ABC")));
    }
}
