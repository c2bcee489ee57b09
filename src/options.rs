//! Form-encoded cache options.
//!
//! Every cache type is configured with the same two pieces of text: a type
//! keyword and an options string of the form `k1=v1&k2=v2&…`. This module
//! carries the decoded name/value list and the typed accessors the
//! back-ends use to pull their settings out of it.

use crate::error::{CacheError, CacheResult};

/// An insertion-ordered list of `name=value` configuration pairs.
///
/// Duplicate names are kept but the first occurrence wins on lookup, so a
/// host can layer defaults behind user-supplied options by appending.
#[derive(Debug, Clone, Default)]
pub struct CacheOptions {
    pairs: Vec<(String, String)>,
}

impl CacheOptions {
    /// Create an empty option list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Parse a form-encoded options string (`k1=v1&k2=v2&…`).
    ///
    /// Names and values are percent-decoded; a pair without `=` is kept
    /// with an empty value. An empty string yields an empty list.
    pub fn parse(s: &str) -> CacheResult<Self> {
        let mut pairs = Vec::new();
        for part in s.split('&') {
            if part.is_empty() {
                continue;
            }
            let (name, value) = match part.split_once('=') {
                Some((n, v)) => (n, v),
                None => (part, ""),
            };
            let name = urlencoding::decode(name)
                .map_err(|e| CacheError::InvalidConfig(format!("bad option name {name}: {e}")))?;
            let value = urlencoding::decode(value)
                .map_err(|e| CacheError::InvalidConfig(format!("bad option value {value}: {e}")))?;
            pairs.push((name.into_owned(), value.into_owned()));
        }
        Ok(Self { pairs })
    }

    /// Append a pair.
    pub fn push(&mut self, name: impl Into<String>, value: impl Into<String>) {
        self.pairs.push((name.into(), value.into()));
    }

    /// Look up the first value for `name`.
    pub fn get(&self, name: &str) -> Option<&str> {
        self.pairs
            .iter()
            .find(|(n, _)| n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Look up `name` as an unsigned integer, falling back to `default`.
    pub fn get_u64(&self, name: &str, default: u64) -> CacheResult<u64> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| {
                CacheError::InvalidConfig(format!("option {name}={v} is not an integer"))
            }),
        }
    }

    /// Look up `name` as a byte/slot count, falling back to `default`.
    pub fn get_usize(&self, name: &str, default: usize) -> CacheResult<usize> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => v.parse().map_err(|_| {
                CacheError::InvalidConfig(format!("option {name}={v} is not an integer"))
            }),
        }
    }

    /// Look up `name` as a flag, falling back to `default`.
    ///
    /// Accepted spellings: `true`/`false`, `1`/`0`, `on`/`off` (case
    /// insensitive).
    pub fn get_bool(&self, name: &str, default: bool) -> CacheResult<bool> {
        match self.get(name) {
            None => Ok(default),
            Some(v) => match v.to_ascii_lowercase().as_str() {
                "true" | "1" | "on" => Ok(true),
                "false" | "0" | "off" => Ok(false),
                _ => Err(CacheError::InvalidConfig(format!(
                    "option {name}={v} is not a boolean"
                ))),
            },
        }
    }

    /// Iterate over all pairs in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = (&str, &str)> {
        self.pairs.iter().map(|(n, v)| (n.as_str(), v.as_str()))
    }

    /// Whether the list is empty.
    pub fn is_empty(&self) -> bool {
        self.pairs.is_empty()
    }
}

impl std::str::FromStr for CacheOptions {
    type Err = CacheError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}
