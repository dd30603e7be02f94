//! Hierarchical store paths.
//!
//! Paths are absolute, `/`-separated and normalised (no empty segments,
//! no trailing slash). The root is `/`.
//!
//! ```text
//! /status/{uid}        presence record
//! /profiles/{uid}      durable profile
//! /.info/connected     connectivity sentinel (not stored)
//! ```

use serde::{Deserialize, Serialize};
use std::fmt;

/// Characters the backend refuses inside a key.
const FORBIDDEN_KEY_CHARS: &[char] = &['/', '.', '#', '$', '[', ']'];

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum PathError {
    #[error("Empty key")]
    EmptyKey,
    #[error("Key '{key}' contains forbidden character '{ch}'")]
    ForbiddenChar { key: String, ch: char },
}

/// Normalised absolute path into the session store.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StorePath(String);

impl StorePath {
    /// The root path `/`.
    pub fn root() -> Self {
        Self("/".to_string())
    }

    /// Parse and normalise a path. Repeated or trailing slashes collapse.
    pub fn new(raw: &str) -> Self {
        let joined = raw
            .split('/')
            .filter(|s| !s.is_empty())
            .collect::<Vec<_>>()
            .join("/");
        Self(format!("/{joined}"))
    }

    /// Append a single key, validating it against the backend's key rules.
    pub fn child(&self, key: &str) -> Result<Self, PathError> {
        validate_key(key)?;
        Ok(self.join_unchecked(key))
    }

    /// Append one or more segments without key validation.
    ///
    /// Used for fixed, trusted suffixes such as `author/avatar`.
    pub fn join_unchecked(&self, suffix: &str) -> Self {
        if self.is_root() {
            Self::new(suffix)
        } else {
            Self::new(&format!("{}/{}", self.0, suffix))
        }
    }

    pub fn is_root(&self) -> bool {
        self.0 == "/"
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Path segments, root yields none.
    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/').filter(|s| !s.is_empty())
    }

    /// Last segment, `None` for the root.
    pub fn key(&self) -> Option<&str> {
        self.segments().last()
    }

    /// Whether `self` equals `other` or is one of its ancestors.
    pub fn contains(&self, other: &StorePath) -> bool {
        if self.is_root() {
            return true;
        }
        other.0 == self.0
            || (other.0.starts_with(&self.0) && other.0.as_bytes().get(self.0.len()) == Some(&b'/'))
    }

    /// Whether a change at one path can alter the value observed at the other.
    pub fn overlaps(&self, other: &StorePath) -> bool {
        self.contains(other) || other.contains(self)
    }
}

impl fmt::Display for StorePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Validate a single key (identity id, message id, …).
pub fn validate_key(key: &str) -> Result<(), PathError> {
    if key.is_empty() {
        return Err(PathError::EmptyKey);
    }
    if let Some(ch) = key.chars().find(|c| FORBIDDEN_KEY_CHARS.contains(c)) {
        return Err(PathError::ForbiddenChar {
            key: key.to_string(),
            ch,
        });
    }
    Ok(())
}
