//! Absolute filesystem paths as the engine sees them.
//!
//! An [`FsPath`] is the unit of identity for locking, caching and remote naming. The remote
//! name of `/a/b` is `a/b`; the root has the empty remote name.

use std::fmt;

use thiserror::Error;

/// Separator between path segments, both locally and in remote object names.
pub const SEPARATOR: char = '/';

#[derive(Debug, Error, PartialEq, Eq)]
pub enum InvalidPathError {
    #[error("path is not absolute: {0:?}")]
    NotAbsolute(String),

    #[error("path contains an empty, '.' or '..' segment: {0:?}")]
    BadSegment(String),

    #[error("name is not a single path segment: {0:?}")]
    BadName(String),
}

/// An owned, canonical absolute path. Never ends in a separator unless it is the root.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FsPath(String);

impl FsPath {
    /// The mount root, `/`.
    #[must_use]
    pub fn root() -> Self {
        Self(String::from("/"))
    }

    /// Parse an absolute path. A single trailing separator is tolerated and dropped.
    pub fn new(raw: impl Into<String>) -> Result<Self, InvalidPathError> {
        let mut raw = raw.into();
        if !raw.starts_with(SEPARATOR) {
            return Err(InvalidPathError::NotAbsolute(raw));
        }
        if raw.len() > 1 && raw.ends_with(SEPARATOR) {
            raw.pop();
        }
        if raw.len() > 1 && raw[1..].split(SEPARATOR).any(|s| !is_valid_segment(s)) {
            return Err(InvalidPathError::BadSegment(raw));
        }
        Ok(Self(raw))
    }

    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    #[must_use]
    pub fn is_root(&self) -> bool {
        self.0.len() == 1
    }

    /// The object name in the remote store: the path without its leading separator.
    #[must_use]
    pub fn remote_name(&self) -> &str {
        &self.0[1..]
    }

    /// The prefix that lists this directory's immediate children remotely.
    ///
    /// Empty for the root, `a/b/` for `/a/b`.
    #[must_use]
    pub fn list_prefix(&self) -> String {
        if self.is_root() {
            String::new()
        } else {
            let mut prefix = self.remote_name().to_owned();
            prefix.push(SEPARATOR);
            prefix
        }
    }

    /// Append a single segment.
    pub fn join(&self, name: &str) -> Result<Self, InvalidPathError> {
        if !is_valid_segment(name) {
            return Err(InvalidPathError::BadName(name.to_owned()));
        }
        let mut joined = self.0.clone();
        if !self.is_root() {
            joined.push(SEPARATOR);
        }
        joined.push_str(name);
        Ok(Self(joined))
    }

    /// The parent path, or `None` for the root.
    #[must_use]
    pub fn parent(&self) -> Option<Self> {
        if self.is_root() {
            return None;
        }
        match self.0.rfind(SEPARATOR) {
            Some(0) | None => Some(Self::root()),
            Some(idx) => Some(Self(self.0[..idx].to_owned())),
        }
    }

    /// The last segment, or `None` for the root.
    #[must_use]
    pub fn file_name(&self) -> Option<&str> {
        if self.is_root() {
            return None;
        }
        self.0.rsplit(SEPARATOR).next()
    }

    /// Whether `self` lies strictly below `ancestor`.
    #[must_use]
    pub fn is_descendant_of(&self, ancestor: &Self) -> bool {
        if ancestor.is_root() {
            return !self.is_root();
        }
        self.0.len() > ancestor.0.len()
            && self.0.starts_with(&ancestor.0)
            && self.0.as_bytes()[ancestor.0.len()] == b'/'
    }

    /// Re-root `self` from under `from` to under `to`.
    ///
    /// Returns `None` when `self` is neither `from` nor one of its descendants.
    #[must_use]
    pub fn rebase(&self, from: &Self, to: &Self) -> Option<Self> {
        if self == from {
            return Some(to.clone());
        }
        if !self.is_descendant_of(from) {
            return None;
        }
        let rest = if from.is_root() {
            &self.0[1..]
        } else {
            &self.0[from.0.len() + 1..]
        };
        let mut rebased = to.0.clone();
        if !to.is_root() {
            rebased.push(SEPARATOR);
        }
        rebased.push_str(rest);
        Some(Self(rebased))
    }

    /// Iterate over the ancestors between the root and `self`, shallowest first. Neither the root
    /// nor `self` is yielded.
    pub fn ancestors(&self) -> impl Iterator<Item = Self> + '_ {
        self.0
            .match_indices(SEPARATOR)
            .skip(1)
            .map(|(idx, _)| Self(self.0[..idx].to_owned()))
    }
}

fn is_valid_segment(segment: &str) -> bool {
    !(segment.is_empty() || segment == "." || segment == ".." || segment.contains(SEPARATOR))
}

impl fmt::Display for FsPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for FsPath {
    fn as_ref(&self) -> &str {
        &self.0
    }
}
