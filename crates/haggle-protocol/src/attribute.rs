//! Attributes: the name/value tags used for interests and data objects.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::hash::{Hash, Hasher};
use thiserror::Error;

/// Weight given to interests registered without an explicit weight.
pub const DEFAULT_WEIGHT: u32 = 1;

/// Reasons an attribute is refused before it ever reaches the daemon.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AttributeError {
    #[error("attribute name is empty")]
    EmptyName,

    #[error("attribute '{0}' has an empty value")]
    EmptyValue(String),
}

/// A weighted name/value pair.
///
/// Two attributes are equal when their name and value match; the weight only
/// expresses how strongly an interest should be ranked and does not take part
/// in equality or hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Attribute {
    name: String,
    value: String,
    #[serde(default = "default_weight")]
    weight: u32,
}

fn default_weight() -> u32 {
    DEFAULT_WEIGHT
}

impl Attribute {
    pub fn new(name: impl Into<String>, value: impl Into<String>, weight: u32) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
            weight,
        }
    }

    /// Attribute with [`DEFAULT_WEIGHT`].
    pub fn unweighted(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::new(name, value, DEFAULT_WEIGHT)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn value(&self) -> &str {
        &self.value
    }

    pub fn weight(&self) -> u32 {
        self.weight
    }

    /// Check the attribute is well formed (non-empty name and value).
    pub fn validate(&self) -> Result<(), AttributeError> {
        if self.name.trim().is_empty() {
            return Err(AttributeError::EmptyName);
        }
        if self.value.is_empty() {
            return Err(AttributeError::EmptyValue(self.name.clone()));
        }
        Ok(())
    }
}

impl PartialEq for Attribute {
    fn eq(&self, other: &Self) -> bool {
        self.name == other.name && self.value == other.value
    }
}

impl Eq for Attribute {}

impl Hash for Attribute {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.name.hash(state);
        self.value.hash(state);
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}:{}", self.name, self.value, self.weight)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_equality_ignores_weight() {
        let a = Attribute::new("topic", "x", 1);
        let b = Attribute::new("topic", "x", 7);
        assert_eq!(a, b);

        let mut set = HashSet::new();
        set.insert(a);
        assert!(!set.insert(b));
    }

    #[test]
    fn test_different_values_are_distinct() {
        assert_ne!(
            Attribute::unweighted("topic", "x"),
            Attribute::unweighted("topic", "y")
        );
    }

    #[test]
    fn test_validate_rejects_empty_parts() {
        assert_eq!(
            Attribute::unweighted("", "x").validate(),
            Err(AttributeError::EmptyName)
        );
        assert_eq!(
            Attribute::unweighted("topic", "").validate(),
            Err(AttributeError::EmptyValue("topic".into()))
        );
        assert!(Attribute::unweighted("topic", "x").validate().is_ok());
    }

    #[test]
    fn test_missing_weight_defaults_to_one() {
        let attr: Attribute = serde_json::from_str(r#"{"name":"foo","value":"bar"}"#).unwrap();
        assert_eq!(attr.weight(), DEFAULT_WEIGHT);
    }

    #[test]
    fn test_display() {
        assert_eq!(Attribute::new("foo", "bar", 3).to_string(), "foo=bar:3");
    }
}
