//! Value domains: silent constraints applied on every set.
//!
//! A domain never produces a validation error. Out-of-range input is either
//! clamped into range or dropped (the field ends up unset).

use std::sync::Arc;

/// Constrains a candidate value before it is stored.
pub trait Domain<T>: Send + Sync {
    /// `None` drops the value.
    fn constrain(&self, value: T) -> Option<T>;
}

/// Inclusive range; values outside are dropped.
#[derive(Debug, Clone)]
pub struct RangeDomain<T> {
    min: T,
    max: T,
}

impl<T> RangeDomain<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd + Send + Sync> Domain<T> for RangeDomain<T> {
    fn constrain(&self, value: T) -> Option<T> {
        (value >= self.min && value <= self.max).then_some(value)
    }
}

/// Inclusive range; values outside are clamped to the nearest bound.
#[derive(Debug, Clone)]
pub struct ClampDomain<T> {
    min: T,
    max: T,
}

impl<T> ClampDomain<T> {
    pub fn new(min: T, max: T) -> Self {
        Self { min, max }
    }
}

impl<T: PartialOrd + Clone + Send + Sync> Domain<T> for ClampDomain<T> {
    fn constrain(&self, value: T) -> Option<T> {
        if value < self.min {
            Some(self.min.clone())
        } else if value > self.max {
            Some(self.max.clone())
        } else {
            Some(value)
        }
    }
}

/// Enumerated set of permitted values.
#[derive(Debug, Clone)]
pub struct OneOf<T>(pub Vec<T>);

impl<T: PartialEq + Send + Sync> Domain<T> for OneOf<T> {
    fn constrain(&self, value: T) -> Option<T> {
        self.0.contains(&value).then_some(value)
    }
}

/// Arbitrary constraint closure.
pub struct FnDomain<T>(Arc<dyn Fn(T) -> Option<T> + Send + Sync>);

impl<T> FnDomain<T> {
    pub fn new(f: impl Fn(T) -> Option<T> + Send + Sync + 'static) -> Self {
        Self(Arc::new(f))
    }
}

impl<T> Domain<T> for FnDomain<T> {
    fn constrain(&self, value: T) -> Option<T> {
        (self.0)(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_range_drops() {
        let domain = RangeDomain::new(0, 100);
        assert_eq!(domain.constrain(50), Some(50));
        assert_eq!(domain.constrain(100), Some(100));
        assert_eq!(domain.constrain(150), None);
        assert_eq!(domain.constrain(-1), None);
    }

    #[test]
    fn test_clamp() {
        let domain = ClampDomain::new(0.0, 1.0);
        assert_eq!(domain.constrain(1.5), Some(1.0));
        assert_eq!(domain.constrain(-0.5), Some(0.0));
        assert_eq!(domain.constrain(0.25), Some(0.25));
    }

    #[test]
    fn test_one_of_and_fn() {
        let colors = OneOf(vec!["red".to_string(), "blue".to_string()]);
        assert_eq!(colors.constrain("red".into()), Some("red".to_string()));
        assert_eq!(colors.constrain("green".into()), None);

        let trimmed = FnDomain::new(|s: String| {
            let t = s.trim().to_string();
            (!t.is_empty()).then_some(t)
        });
        assert_eq!(trimmed.constrain("  x ".into()), Some("x".to_string()));
        assert_eq!(trimmed.constrain("   ".into()), None);
    }
}
