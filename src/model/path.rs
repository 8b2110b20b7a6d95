//! FieldPath: a dotted route from an entity to one of its (nested) fields.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

/// Segment delimiter in the textual form.
pub const DELIMITER: char = '.';
/// Trailing segment meaning "this path and everything beneath it".
pub const WILDCARD: &str = "*";

/// A path of field keys: `author.address.city`.
///
/// A trailing `*` turns the path into a prefix pattern, so `author.*`
/// matches `author`, `author.name` and `author.address.city`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub struct FieldPath {
    segments: SmallVec<[String; 4]>,
    wildcard: bool,
}

impl FieldPath {
    pub fn new(segments: impl IntoIterator<Item = impl Into<String>>) -> Self {
        Self {
            segments: segments.into_iter().map(Into::into).collect(),
            wildcard: false,
        }
    }

    /// Single-segment path naming one field.
    pub fn key(key: impl Into<String>) -> Self {
        let mut segments = SmallVec::new();
        segments.push(key.into());
        Self { segments, wildcard: false }
    }

    /// Parse `a.b.c` / `a.b.*`. Empty segments are skipped.
    pub fn parse(text: &str) -> Self {
        let mut segments: SmallVec<[String; 4]> = text
            .split(DELIMITER)
            .filter(|s| !s.is_empty())
            .map(str::to_owned)
            .collect();
        let wildcard = segments.last().is_some_and(|s| s == WILDCARD);
        if wildcard {
            segments.pop();
        }
        Self { segments, wildcard }
    }

    /// Turn this path into a prefix pattern.
    pub fn everything_beneath(mut self) -> Self {
        self.wildcard = true;
        self
    }

    pub fn is_wildcard(&self) -> bool { self.wildcard }
    pub fn segments(&self) -> &[String] { &self.segments }
    pub fn len(&self) -> usize { self.segments.len() }
    pub fn is_empty(&self) -> bool { self.segments.is_empty() }

    pub fn first(&self) -> Option<&str> {
        self.segments.first().map(String::as_str)
    }

    /// Everything after the first segment.
    pub fn rest(&self) -> FieldPath {
        Self {
            segments: self.segments.iter().skip(1).cloned().collect(),
            wildcard: self.wildcard,
        }
    }

    /// `key` followed by this path. Used when bubbling notifications up
    /// through a relationship field.
    pub fn prefixed(&self, key: &str) -> FieldPath {
        let mut segments = SmallVec::with_capacity(self.segments.len() + 1);
        segments.push(key.to_owned());
        segments.extend(self.segments.iter().cloned());
        Self { segments, wildcard: self.wildcard }
    }

    /// This path followed by `key`.
    pub fn child(&self, key: &str) -> FieldPath {
        let mut next = self.clone();
        next.segments.push(key.to_owned());
        next
    }

    /// Segment-wise prefix test (ignores wildcards on either side).
    pub fn starts_with(&self, prefix: &FieldPath) -> bool {
        prefix.segments.len() <= self.segments.len()
            && prefix.segments.iter().zip(self.segments.iter()).all(|(a, b)| a == b)
    }

    /// Does `candidate` fall under this pattern?
    pub fn matches(&self, candidate: &FieldPath) -> bool {
        if self.wildcard {
            candidate.starts_with(self)
        } else {
            self.segments == candidate.segments
        }
    }
}

impl fmt::Display for FieldPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, segment) in self.segments.iter().enumerate() {
            if i > 0 { write!(f, "{DELIMITER}")?; }
            write!(f, "{segment}")?;
        }
        if self.wildcard {
            if !self.segments.is_empty() { write!(f, "{DELIMITER}")?; }
            write!(f, "{WILDCARD}")?;
        }
        Ok(())
    }
}

impl FromStr for FieldPath {
    type Err = std::convert::Infallible;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self::parse(s))
    }
}

impl From<&str> for FieldPath {
    fn from(s: &str) -> Self { Self::parse(s) }
}

impl From<String> for FieldPath {
    fn from(s: String) -> Self { Self::parse(&s) }
}

impl From<FieldPath> for String {
    fn from(path: FieldPath) -> Self { path.to_string() }
}
