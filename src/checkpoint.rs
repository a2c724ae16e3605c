//! Session checkpoints
//!
//! A backup session periodically persists everything it needs to pick up
//! where it left off: the tree reducer's open branches, how much of the
//! metadata snapshot is durable, and the running statistics. A checkpoint is
//! only written after the metadata snapshot has been synced up to
//! `metadata_len`, so resuming can safely truncate the snapshot back to that
//! length.
//!
//! ## Integrity
//!
//! On disk a checkpoint is a small header followed by a bincode payload:
//!
//! ```text
//! "RWCK" | format version (u32 LE) | SHA-256 of payload (32 bytes) | payload
//! ```
//!
//! A torn or tampered file fails the digest check and is reported as
//! [`RewindError::InvalidCheckpoint`].
//!
//! ## Examples
//!
//! ```rust
//! use rewind::checkpoint::SessionCheckpoint;
//! use rewind::types::Timestamp;
//!
//! # fn main() -> rewind::Result<()> {
//! let dir = tempfile::tempdir()?;
//! let path = dir.path().join("checkpoint.bin");
//!
//! let checkpoint = SessionCheckpoint::new(Timestamp::from_secs(20_000), None, vec![1u32, 2, 3]);
//! checkpoint.save(&path, false)?;
//!
//! let loaded: SessionCheckpoint<Vec<u32>> = SessionCheckpoint::load(&path)?;
//! assert_eq!(loaded.state, vec![1, 2, 3]);
//! # Ok(())
//! # }
//! ```

use crate::error::{Result, RewindError};
use crate::index::Index;
use crate::types::{SessionStats, Timestamp};
use crate::utils;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::fs;
use std::path::Path;
use tracing::debug;

const MAGIC: &[u8; 4] = b"RWCK";
const CHECKPOINT_VERSION: u32 = 1;
const HEADER_LEN: usize = 4 + 4 + 32;

/// Resumable state of a running backup session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionCheckpoint<S> {
    /// Session being run
    pub session_time: Timestamp,
    /// Mirror time the session started from
    pub previous_time: Option<Timestamp>,
    /// Durable length of the metadata snapshot
    pub metadata_len: u64,
    /// Records within `metadata_len`
    pub metadata_records: u64,
    /// Last index reflected in the snapshot
    pub last_index: Option<Index>,
    /// Statistics so far
    pub stats: SessionStats,
    /// Engine state (the tree reducer and friends)
    pub state: S,
}

impl<S> SessionCheckpoint<S> {
    /// Checkpoint at the very start of a session
    pub fn new(session_time: Timestamp, previous_time: Option<Timestamp>, state: S) -> Self {
        SessionCheckpoint {
            session_time,
            previous_time,
            metadata_len: 0,
            metadata_records: 0,
            last_index: None,
            stats: SessionStats::default(),
            state,
        }
    }
}

impl<S: Serialize> SessionCheckpoint<S> {
    /// Serialize with header and digest
    pub fn to_bytes(&self) -> Result<Vec<u8>> {
        let payload = bincode::serde::encode_to_vec(self, bincode::config::standard())?;
        let digest = Sha256::digest(&payload);
        let mut out = Vec::with_capacity(HEADER_LEN + payload.len());
        out.extend_from_slice(MAGIC);
        out.extend_from_slice(&CHECKPOINT_VERSION.to_le_bytes());
        out.extend_from_slice(&digest);
        out.extend_from_slice(&payload);
        Ok(out)
    }

    /// Atomically replace the checkpoint file at `path`
    pub fn save(&self, path: &Path, fsync: bool) -> Result<()> {
        let bytes = self.to_bytes()?;
        utils::atomic_write(path, &bytes, fsync)?;
        debug!(
            "Saved checkpoint for {} at {:?} ({} bytes)",
            self.session_time,
            self.last_index.as_ref().map(|i| i.to_string()),
            bytes.len()
        );
        Ok(())
    }
}

impl<S: DeserializeOwned> SessionCheckpoint<S> {
    /// Parse and verify serialized bytes
    pub fn from_bytes(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < HEADER_LEN || &bytes[..4] != MAGIC {
            return Err(RewindError::InvalidCheckpoint("bad header".to_string()));
        }
        let mut version = [0u8; 4];
        version.copy_from_slice(&bytes[4..8]);
        let version = u32::from_le_bytes(version);
        if version != CHECKPOINT_VERSION {
            return Err(RewindError::InvalidCheckpoint(format!(
                "unsupported checkpoint version {}",
                version
            )));
        }
        let payload = &bytes[HEADER_LEN..];
        if Sha256::digest(payload).as_slice() != &bytes[8..HEADER_LEN] {
            return Err(RewindError::InvalidCheckpoint("digest mismatch".to_string()));
        }
        let (checkpoint, _) =
            bincode::serde::decode_from_slice(payload, bincode::config::standard())
                .map_err(|e| RewindError::InvalidCheckpoint(e.to_string()))?;
        Ok(checkpoint)
    }

    /// Load and verify the checkpoint file at `path`
    pub fn load(path: &Path) -> Result<Self> {
        let bytes = fs::read(path)?;
        Self::from_bytes(&bytes)
    }
}
