//! Path indices and file-name mapping
//!
//! An [`Index`] is the tuple of path components that names an entry relative
//! to the root of a tree. It is the sort and alignment key shared by every
//! stream in the crate: scans, metadata snapshots and increment listings all
//! produce entries in ascending index order.
//!
//! Indices compare component by component, so a directory sorts immediately
//! before its own descendants and every descendant sorts before the
//! directory's next sibling. A pre-order walk that visits siblings in sorted
//! order therefore yields strictly ascending indices.
//!
//! [`PathMapping`] translates indices to on-disk names. Mirrors and increment
//! trees may live on filesystems that cannot store every byte a source name
//! contains, so selected bytes are written as `;NNN` escapes.

use crate::error::{Result, RewindError};
use serde::{Deserialize, Serialize};
use std::ffi::{OsStr, OsString};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::{Component, Path, PathBuf};

/// Ordered sequence of path components; empty for the tree root
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Index(Vec<OsString>);

impl Index {
    /// The root of a tree
    pub fn root() -> Self {
        Index(Vec::new())
    }

    /// Build an index from components
    pub fn from_components<I, S>(components: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        Index(components.into_iter().map(Into::into).collect())
    }

    /// Build an index from a relative path
    ///
    /// `.` components are dropped; `..`, absolute prefixes and roots are rejected.
    pub fn from_relative_path(path: &Path) -> Result<Self> {
        let mut parts = Vec::new();
        for component in path.components() {
            match component {
                Component::Normal(name) => parts.push(name.to_os_string()),
                Component::CurDir => {}
                _ => {
                    return Err(RewindError::InvalidConfiguration(format!(
                        "path {:?} is not a plain relative path",
                        path
                    )))
                }
            }
        }
        Ok(Index(parts))
    }

    /// Components of this index
    pub fn components(&self) -> &[OsString] {
        &self.0
    }

    /// Number of components
    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True for the root index
    pub fn is_root(&self) -> bool {
        self.0.is_empty()
    }

    /// Last component, if any
    pub fn file_name(&self) -> Option<&OsStr> {
        self.0.last().map(OsString::as_os_str)
    }

    /// Index of the containing directory
    pub fn parent(&self) -> Option<Index> {
        if self.0.is_empty() {
            None
        } else {
            Some(Index(self.0[..self.0.len() - 1].to_vec()))
        }
    }

    /// Index of a child entry
    pub fn join(&self, name: impl Into<OsString>) -> Index {
        let mut parts = self.0.clone();
        parts.push(name.into());
        Index(parts)
    }

    /// True if `prefix` equals this index or is one of its ancestors
    pub fn starts_with(&self, prefix: &Index) -> bool {
        self.0.len() >= prefix.0.len() && self.0[..prefix.0.len()] == prefix.0[..]
    }

    /// Remove a leading prefix, if present
    pub fn strip_prefix(&self, prefix: &Index) -> Option<Index> {
        if self.starts_with(prefix) {
            Some(Index(self.0[prefix.0.len()..].to_vec()))
        } else {
            None
        }
    }

    /// Relative path with the components unmapped
    pub fn to_path(&self) -> PathBuf {
        self.0.iter().collect()
    }

    /// `/`-joined form used for glob matching and metadata records
    pub fn to_slash_bytes(&self) -> Vec<u8> {
        let mut out = Vec::new();
        for (i, part) in self.0.iter().enumerate() {
            if i > 0 {
                out.push(b'/');
            }
            out.extend_from_slice(part.as_bytes());
        }
        out
    }

    /// Parse the `/`-joined form; `.` is the root
    pub fn from_slash_bytes(bytes: &[u8]) -> Index {
        if bytes == b"." || bytes.is_empty() {
            return Index::root();
        }
        Index(
            bytes
                .split(|b| *b == b'/')
                .map(|part| OsString::from_vec(part.to_vec()))
                .collect(),
        )
    }
}

impl fmt::Display for Index {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str(".");
        }
        f.write_str(&String::from_utf8_lossy(&self.to_slash_bytes()))
    }
}

/// Escape byte used by quoted mappings
const ESCAPE: u8 = b';';

/// How indices map onto file names in the mirror and increment trees
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum PathMapping {
    /// Names are stored unchanged
    #[default]
    Local,
    /// Listed bytes (and the escape byte `;`) are stored as `;NNN`
    Quoted {
        /// Bytes that must be escaped
        chars: Vec<u8>,
    },
}

impl PathMapping {
    /// Build a mapping from an optional quote-character list
    pub fn from_quote_chars(chars: Option<&str>) -> Self {
        match chars {
            Some(chars) if !chars.is_empty() => PathMapping::Quoted {
                chars: chars.bytes().filter(|b| *b != b'/').collect(),
            },
            _ => PathMapping::Local,
        }
    }

    /// On-disk name for one index component
    pub fn quote<'a>(&self, name: &'a OsStr) -> std::borrow::Cow<'a, OsStr> {
        match self {
            PathMapping::Local => std::borrow::Cow::Borrowed(name),
            PathMapping::Quoted { chars } => {
                let bytes = name.as_bytes();
                if !bytes.iter().any(|b| *b == ESCAPE || chars.contains(b)) {
                    return std::borrow::Cow::Borrowed(name);
                }
                let mut out = Vec::with_capacity(bytes.len() + 8);
                for b in bytes {
                    if *b == ESCAPE || chars.contains(b) {
                        out.push(ESCAPE);
                        out.extend_from_slice(format!("{:03}", b).as_bytes());
                    } else {
                        out.push(*b);
                    }
                }
                std::borrow::Cow::Owned(OsString::from_vec(out))
            }
        }
    }

    /// Index component for an on-disk name
    pub fn unquote(&self, name: &OsStr) -> Result<OsString> {
        match self {
            PathMapping::Local => Ok(name.to_os_string()),
            PathMapping::Quoted { .. } => {
                let bytes = name.as_bytes();
                let mut out = Vec::with_capacity(bytes.len());
                let mut i = 0;
                while i < bytes.len() {
                    if bytes[i] == ESCAPE {
                        let code = bytes
                            .get(i + 1..i + 4)
                            .and_then(|digits| std::str::from_utf8(digits).ok())
                            .and_then(|digits| digits.parse::<u8>().ok())
                            .ok_or_else(|| {
                                RewindError::InvalidConfiguration(format!(
                                    "bad quoting sequence in file name {:?}",
                                    name
                                ))
                            })?;
                        out.push(code);
                        i += 4;
                    } else {
                        out.push(bytes[i]);
                        i += 1;
                    }
                }
                Ok(OsString::from_vec(out))
            }
        }
    }

    /// Absolute on-disk path of `index` below `root`
    pub fn to_path(&self, root: &Path, index: &Index) -> PathBuf {
        let mut path = root.to_path_buf();
        for part in index.components() {
            path.push(self.quote(part));
        }
        path
    }
}
