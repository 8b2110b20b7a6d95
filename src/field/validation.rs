//! Validation rules and validation state.

use std::fmt;
use std::sync::Arc;

use serde::{Deserialize, Serialize};

/// Outcome of the last validation pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum ValidationState {
    #[default]
    Unknown,
    Valid,
    Invalid(Vec<String>),
}

impl ValidationState {
    pub fn is_valid(&self) -> bool { matches!(self, ValidationState::Valid) }
    pub fn is_invalid(&self) -> bool { matches!(self, ValidationState::Invalid(_)) }

    pub fn messages(&self) -> &[String] {
        match self {
            ValidationState::Invalid(messages) => messages,
            _ => &[],
        }
    }

    /// Add `message` unless it is already present.
    pub fn push_message(&mut self, message: impl Into<String>) {
        let message = message.into();
        match self {
            ValidationState::Invalid(messages) => {
                if !messages.contains(&message) {
                    messages.push(message);
                }
            }
            _ => *self = ValidationState::Invalid(vec![message]),
        }
    }
}

/// A named predicate over a field value.
///
/// An absent value satisfies the rule iff the rule was built with
/// [`allow_nil`](ValidationRule::allow_nil).
pub struct ValidationRule<T> {
    message: String,
    allow_nil: bool,
    test: Arc<dyn Fn(&T) -> bool + Send + Sync>,
}

impl<T> Clone for ValidationRule<T> {
    fn clone(&self) -> Self {
        Self {
            message: self.message.clone(),
            allow_nil: self.allow_nil,
            test: Arc::clone(&self.test),
        }
    }
}

impl<T> fmt::Debug for ValidationRule<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ValidationRule")
            .field("message", &self.message)
            .field("allow_nil", &self.allow_nil)
            .finish()
    }
}

impl<T> ValidationRule<T> {
    pub fn new(message: impl Into<String>, test: impl Fn(&T) -> bool + Send + Sync + 'static) -> Self {
        Self {
            message: message.into(),
            allow_nil: false,
            test: Arc::new(test),
        }
    }

    /// Any present value passes; absence fails.
    pub fn required(message: impl Into<String>) -> Self {
        Self::new(message, |_| true)
    }

    pub fn allow_nil(mut self) -> Self {
        self.allow_nil = true;
        self
    }

    pub fn message(&self) -> &str { &self.message }
    pub fn allows_nil(&self) -> bool { self.allow_nil }

    pub fn check(&self, value: Option<&T>) -> bool {
        match value {
            Some(v) => (self.test)(v),
            None => self.allow_nil,
        }
    }
}

impl<T: PartialOrd + fmt::Debug + Send + Sync + 'static> ValidationRule<T> {
    /// Inclusive range check. Absence is allowed.
    pub fn range(min: T, max: T) -> Self {
        let message = format!("must be between {min:?} and {max:?}");
        Self::new(message, move |v| *v >= min && *v <= max).allow_nil()
    }
}

impl ValidationRule<String> {
    /// Minimum length in characters. Absence is allowed.
    pub fn min_len(min: usize) -> Self {
        Self::new(format!("must be at least {min} characters"), move |s: &String| {
            s.chars().count() >= min
        })
        .allow_nil()
    }

    /// Maximum length in characters. Absence is allowed.
    pub fn max_len(max: usize) -> Self {
        Self::new(format!("must be at most {max} characters"), move |s: &String| {
            s.chars().count() <= max
        })
        .allow_nil()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nil_handling() {
        let strict = ValidationRule::<i64>::new("positive", |v| *v > 0);
        assert!(!strict.check(None));
        assert!(strict.check(Some(&1)));
        assert!(!strict.check(Some(&-1)));

        let lenient = strict.clone().allow_nil();
        assert!(lenient.check(None));
    }

    #[test]
    fn test_push_message_is_idempotent() {
        let mut state = ValidationState::Valid;
        state.push_message("taken");
        state.push_message("taken");
        state.push_message("too short");
        assert_eq!(state.messages(), ["taken", "too short"]);
    }

    #[test]
    fn test_builtin_rules() {
        let rule = ValidationRule::min_len(3);
        assert!(rule.check(None));
        assert!(!rule.check(Some(&"ab".to_string())));
        assert!(ValidationRule::max_len(2).check(Some(&"ab".to_string())));
        assert!(!ValidationRule::range(1, 5).check(Some(&9)));
        assert!(!ValidationRule::<String>::required("required").check(None));
    }
}
