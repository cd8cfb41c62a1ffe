//! Object names of the form `domain:key=value[,key=value...]`.
//!
//! Two names are equal when their canonical forms match, i.e. the same
//! domain and the same key properties in any order.

use super::DirectoryError;
use std::fmt;
use std::str::FromStr;

/// A validated managed-object name
#[derive(Debug, Clone)]
pub struct ObjectName {
    name: String,
    canonical: String,
}

impl ObjectName {
    pub fn parse(name: &str) -> Result<Self, DirectoryError> {
        let malformed = |reason| DirectoryError::MalformedObjectName {
            name: name.to_string(),
            reason,
        };

        if name.contains(['*', '?']) {
            return Err(malformed("patterns are not supported"));
        }

        let (domain, properties) = name
            .split_once(':')
            .ok_or_else(|| malformed("missing domain separator ':'"))?;

        if properties.is_empty() {
            return Err(malformed("no key properties"));
        }

        let mut pairs: Vec<(&str, &str)> = Vec::new();
        for property in properties.split(',') {
            let (key, value) = property
                .split_once('=')
                .ok_or_else(|| malformed("key property without '='"))?;
            if key.is_empty() {
                return Err(malformed("empty key"));
            }
            if value.is_empty() {
                return Err(malformed("empty value"));
            }
            if pairs.iter().any(|(k, _)| *k == key) {
                return Err(malformed("duplicate key"));
            }
            pairs.push((key, value));
        }

        pairs.sort_unstable_by_key(|(key, _)| *key);
        let canonical_properties: Vec<String> =
            pairs.iter().map(|(k, v)| format!("{k}={v}")).collect();

        Ok(Self {
            name: name.to_string(),
            canonical: format!("{domain}:{}", canonical_properties.join(",")),
        })
    }

    /// The name as it was written
    pub fn as_str(&self) -> &str {
        &self.name
    }

    /// Domain plus key properties sorted by key
    pub fn canonical(&self) -> &str {
        &self.canonical
    }
}

impl PartialEq for ObjectName {
    fn eq(&self, other: &Self) -> bool {
        self.canonical == other.canonical
    }
}

impl Eq for ObjectName {}

impl fmt::Display for ObjectName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ObjectName {
    type Err = DirectoryError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
