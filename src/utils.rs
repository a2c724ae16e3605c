//! Utility functions for Rewind
//!
//! Hashing and durability helpers shared by the engines.
//!
//! ## Durability
//!
//! Every mutation of the mirror or the data directory goes through one of
//! two patterns:
//!
//! - [`write_temp_sibling`] + `persist`: content lands in a temp file next
//!   to its destination, is fsynced, then renamed over the destination.
//! - [`fsync_dir`]: after a structural change (rename, create, unlink) the
//!   containing directory is synced so the change itself is durable.
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use crate::utils::{atomic_write, hash_data};
//!
//! # fn main() -> rewind::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("state.json");
//! atomic_write(&path, b"{}", true)?;
//! assert_eq!(std::fs::read(&path)?, b"{}");
//!
//! assert_eq!(hash_data(b"").len(), 64);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RewindError};
use crate::scan::TEMP_PREFIX;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::Path;
use tempfile::NamedTempFile;
use tracing::trace;

/// Hash a file's content using SHA-256
///
/// Reads in 8KB chunks, so memory use does not grow with file size.
/// Returns the digest as 64 lowercase hex characters.
pub fn hash_file_content(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 8192];

    loop {
        let bytes_read = file.read(&mut buffer)?;
        if bytes_read == 0 {
            break;
        }
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Hash in-memory data using SHA-256
pub fn hash_data(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// fsync a directory so renames and unlinks inside it are durable
pub fn fsync_dir(path: &Path) -> Result<()> {
    File::open(path)?.sync_all()?;
    trace!("Synced directory {:?}", path);
    Ok(())
}

/// fsync the parent directory of `path`, if it has one
pub fn fsync_parent(path: &Path) -> Result<()> {
    match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => fsync_dir(parent),
        _ => Ok(()),
    }
}

/// Write `content` into a temp file in the same directory as `dest`
///
/// The temp file name starts with [`TEMP_PREFIX`] so leftovers of a crash
/// can be recognised and removed. When `sync` is set it is fsynced before
/// being returned; the caller persists it over `dest`.
pub fn write_temp_sibling(dest: &Path, content: &[u8], sync: bool) -> Result<NamedTempFile> {
    write_temp_sibling_with(dest, content, sync, |_| Ok(()))
}

/// Like [`write_temp_sibling`], running `prepare` on the temp path before the
/// fsync so metadata applied there is durable together with the content
pub fn write_temp_sibling_with(
    dest: &Path,
    content: &[u8],
    sync: bool,
    prepare: impl FnOnce(&Path) -> Result<()>,
) -> Result<NamedTempFile> {
    let parent = dest
        .parent()
        .ok_or_else(|| RewindError::internal(format!("{:?} has no parent directory", dest)))?;
    let mut temp = tempfile::Builder::new()
        .prefix(TEMP_PREFIX)
        .tempfile_in(parent)?;
    temp.write_all(content)?;
    temp.flush()?;
    prepare(temp.path())?;
    if sync {
        temp.as_file().sync_all()?;
    }
    trace!("Wrote {} bytes to temp file {:?}", content.len(), temp.path());
    Ok(temp)
}

/// Atomically replace `path` with `content`
pub fn atomic_write(path: &Path, content: &[u8], sync: bool) -> Result<()> {
    let temp = write_temp_sibling(path, content, sync)?;
    temp.persist(path).map_err(|e| RewindError::Io(e.error))?;
    if sync {
        fsync_parent(path)?;
    }
    Ok(())
}

/// Remove a directory if it is empty
pub fn remove_dir_if_empty(path: &Path) -> Result<bool> {
    if path.is_dir() && fs::read_dir(path)?.next().is_none() {
        fs::remove_dir(path)?;
        trace!("Removed empty directory: {:?}", path);
        Ok(true)
    } else {
        Ok(false)
    }
}

/// True if `path` is missing or an empty directory
pub fn is_absent_or_empty_dir(path: &Path) -> Result<bool> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => Ok(fs::read_dir(path)?.next().is_none()),
        Ok(_) => Ok(false),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(true),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_hash_functions() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("data");
        fs::write(&path, b"Hello, World!").unwrap();
        let from_file = hash_file_content(&path).unwrap();
        assert_eq!(from_file, hash_data(b"Hello, World!"));
        assert_eq!(from_file.len(), 64);
    }

    #[test]
    fn test_atomic_write_leaves_no_temp() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("test.txt");
        fs::write(&path, b"old").unwrap();

        atomic_write(&path, b"Test content", true).unwrap();

        assert_eq!(fs::read(&path).unwrap(), b"Test content");
        let leftovers: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with(TEMP_PREFIX))
            .collect();
        assert!(leftovers.is_empty());
    }

    #[test]
    fn test_remove_dir_if_empty() {
        let dir = TempDir::new().unwrap();
        let empty = dir.path().join("empty");
        let full = dir.path().join("full");
        fs::create_dir(&empty).unwrap();
        fs::create_dir(&full).unwrap();
        fs::write(full.join("file.txt"), b"test").unwrap();

        assert!(remove_dir_if_empty(&empty).unwrap());
        assert!(!empty.exists());
        assert!(!remove_dir_if_empty(&full).unwrap());
        assert!(full.exists());
    }

    #[test]
    fn test_absent_or_empty() {
        let dir = TempDir::new().unwrap();
        assert!(is_absent_or_empty_dir(&dir.path().join("missing")).unwrap());
        assert!(is_absent_or_empty_dir(dir.path()).unwrap());
        fs::write(dir.path().join("f"), b"").unwrap();
        assert!(!is_absent_or_empty_dir(dir.path()).unwrap());
        assert!(!is_absent_or_empty_dir(&dir.path().join("f")).unwrap());
    }
}
