//! Hierarchical resource addresses.
//!
//! An address is a sequence of `key=value` elements rendered as
//! `/subsystem=datasources/data-source=primary`. The empty sequence is the
//! root resource and renders as `/`. Registration patterns reuse the same
//! type with [`WILDCARD`] values.

use crate::ModelError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::str::FromStr;

/// Element value matching any value in a registration pattern.
pub const WILDCARD: &str = "*";

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathElement {
    pub key: String,
    pub value: String,
}

impl PathElement {
    pub fn new(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn is_wildcard(&self) -> bool {
        self.value == WILDCARD
    }

    /// Whether this concrete element is matched by a pattern element.
    pub fn matches(&self, pattern: &PathElement) -> bool {
        self.key == pattern.key && (pattern.is_wildcard() || self.value == pattern.value)
    }
}

impl fmt::Display for PathElement {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}={}", self.key, self.value)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct PathAddress(Vec<PathElement>);

impl PathAddress {
    pub fn root() -> Self {
        Self(Vec::new())
    }

    pub fn new(elements: Vec<PathElement>) -> Self {
        Self(elements)
    }

    /// Parse an address, returning [`ModelError::InvalidAddress`] on malformed input.
    pub fn parse(input: &str) -> Result<Self, ModelError> {
        input.parse()
    }

    #[must_use]
    pub fn append(&self, key: impl Into<String>, value: impl Into<String>) -> Self {
        let mut elements = self.0.clone();
        elements.push(PathElement::new(key, value));
        Self(elements)
    }

    pub fn elements(&self) -> &[PathElement] {
        &self.0
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    pub fn first(&self) -> Option<&PathElement> {
        self.0.first()
    }

    pub fn last(&self) -> Option<&PathElement> {
        self.0.last()
    }

    pub fn parent(&self) -> Option<Self> {
        if self.0.is_empty() {
            None
        } else {
            Some(Self(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Whether `prefix` is this address or one of its ancestors.
    pub fn starts_with(&self, prefix: &PathAddress) -> bool {
        self.0.starts_with(&prefix.0)
    }

    /// Whether this concrete address is matched element-by-element by `pattern`.
    pub fn matches(&self, pattern: &PathAddress) -> bool {
        self.0.len() == pattern.0.len()
            && self
                .0
                .iter()
                .zip(pattern.0.iter())
                .all(|(element, pat)| element.matches(pat))
    }

    /// Number of wildcard elements; used to rank competing patterns.
    pub fn wildcard_count(&self) -> usize {
        self.0.iter().filter(|e| e.is_wildcard()).count()
    }
}

impl fmt::Display for PathAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("/");
        }
        for element in &self.0 {
            write!(f, "/{element}")?;
        }
        Ok(())
    }
}

impl FromStr for PathAddress {
    type Err = ModelError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let trimmed = input.trim();
        let mut elements = Vec::new();
        for segment in trimmed.split('/').filter(|s| !s.is_empty()) {
            let Some((key, value)) = segment.split_once('=') else {
                return Err(ModelError::InvalidAddress {
                    input: input.to_owned(),
                    reason: format!("element '{segment}' is not of the form key=value"),
                });
            };
            if key.is_empty() || value.is_empty() || value.contains('=') {
                return Err(ModelError::InvalidAddress {
                    input: input.to_owned(),
                    reason: format!("element '{segment}' has an empty or malformed part"),
                });
            }
            elements.push(PathElement::new(key, value));
        }
        Ok(Self(elements))
    }
}

impl Serialize for PathAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for PathAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}
