//! Gzip compression for increments and metadata snapshots
//!
//! Compression is a file-level property: an artifact is either a plain file
//! or a gzip stream, and its name says which (`.gz` suffix). There is no
//! in-band header.
//!
//! ## Compression Strategies
//!
//! - **None**: never compress
//! - **Gzip**: compress every eligible artifact
//! - **Adaptive**: skip small artifacts and paths whose extension names an
//!   already-compressed format (default)
//!
//! ## Examples
//!
//! ```rust
//! use rewind::compression::{CompressionEngine, CompressionStrategy};
//! use std::path::Path;
//!
//! let mut engine = CompressionEngine::new(CompressionStrategy::Gzip);
//! let data = b"the same line again\n".repeat(50);
//!
//! assert!(engine.should_compress(Path::new("notes.txt"), data.len() as u64));
//! let packed = engine.compress(&data).unwrap();
//! assert!(packed.len() < data.len());
//! assert_eq!(engine.decompress(&packed).unwrap(), data);
//! ```

use crate::error::{Result, RewindError};
use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::{self, Read, Write};
use std::path::Path;
use std::time::Instant;
use tracing::{debug, trace};

/// Extensions of formats that do not shrink under gzip
pub const DEFAULT_SKIP_EXTENSIONS: &[&str] = &[
    "gz", "tgz", "bz2", "xz", "zst", "lz4", "zip", "7z", "rar", "jpg", "jpeg", "png", "gif",
    "webp", "mp3", "mp4", "mkv", "mov", "avi", "ogg", "flac", "pdf",
];

/// When increments and snapshots are compressed
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum CompressionStrategy {
    /// Never compress
    None,
    /// Compress every eligible artifact
    Gzip,
    /// Compress unless the artifact is small or already compressed
    Adaptive {
        /// Skip artifacts smaller than this many bytes
        min_size: u64,
        /// Skip source paths with these extensions (lowercase, no dot)
        skip_extensions: Vec<String>,
    },
}

impl Default for CompressionStrategy {
    fn default() -> Self {
        CompressionStrategy::Adaptive {
            min_size: 512,
            skip_extensions: DEFAULT_SKIP_EXTENSIONS.iter().map(|s| s.to_string()).collect(),
        }
    }
}

impl CompressionStrategy {
    /// True unless compression is disabled outright
    pub fn is_enabled(&self) -> bool {
        !matches!(self, CompressionStrategy::None)
    }
}

/// Compression statistics for monitoring
#[derive(Debug, Default, Clone)]
pub struct CompressionStats {
    /// Artifacts compressed
    pub files_compressed: usize,
    /// Artifacts stored raw
    pub files_stored_raw: usize,
    /// Bytes saved by compression
    pub bytes_saved: u64,
    /// Total compression time in milliseconds
    pub compression_time_ms: u64,
}

impl CompressionStats {
    /// Fraction of artifacts that were compressed
    pub fn compression_ratio(&self) -> f64 {
        let total = self.files_compressed + self.files_stored_raw;
        if total == 0 {
            return 0.0;
        }
        self.files_compressed as f64 / total as f64
    }
}

/// Applies a [`CompressionStrategy`] and keeps statistics
#[derive(Debug)]
pub struct CompressionEngine {
    strategy: CompressionStrategy,
    level: Compression,
    stats: CompressionStats,
}

impl CompressionEngine {
    /// Create an engine with the default gzip level
    pub fn new(strategy: CompressionStrategy) -> Self {
        Self {
            strategy,
            level: Compression::default(),
            stats: CompressionStats::default(),
        }
    }

    /// Strategy in force
    pub fn strategy(&self) -> &CompressionStrategy {
        &self.strategy
    }

    /// Statistics since creation
    pub fn stats(&self) -> &CompressionStats {
        &self.stats
    }

    /// Decide whether an artifact for `path` of `size` bytes is compressed
    pub fn should_compress(&self, path: &Path, size: u64) -> bool {
        match &self.strategy {
            CompressionStrategy::None => false,
            CompressionStrategy::Gzip => true,
            CompressionStrategy::Adaptive {
                min_size,
                skip_extensions,
            } => {
                if size < *min_size {
                    return false;
                }
                match path.extension().and_then(|e| e.to_str()) {
                    Some(ext) => {
                        let ext = ext.to_ascii_lowercase();
                        !skip_extensions.iter().any(|s| *s == ext)
                    }
                    None => true,
                }
            }
        }
    }

    /// Gzip a buffer
    pub fn compress(&mut self, data: &[u8]) -> Result<Vec<u8>> {
        let start = Instant::now();
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 2 + 64), self.level);
        encoder
            .write_all(data)
            .map_err(|e| RewindError::compression(e.to_string()))?;
        let packed = encoder
            .finish()
            .map_err(|e| RewindError::compression(e.to_string()))?;
        self.stats.files_compressed += 1;
        self.stats.bytes_saved += (data.len() as u64).saturating_sub(packed.len() as u64);
        self.stats.compression_time_ms += start.elapsed().as_millis() as u64;
        trace!("Compressed {} -> {} bytes", data.len(), packed.len());
        Ok(packed)
    }

    /// Record that an artifact was stored raw
    pub fn record_raw(&mut self) {
        self.stats.files_stored_raw += 1;
    }

    /// Gunzip a buffer
    pub fn decompress(&self, data: &[u8]) -> Result<Vec<u8>> {
        gunzip(data)
    }
}

/// Gunzip a buffer
pub fn gunzip(data: &[u8]) -> Result<Vec<u8>> {
    let mut out = Vec::with_capacity(data.len() * 2);
    GzDecoder::new(data)
        .read_to_end(&mut out)
        .map_err(|e| RewindError::compression(format!("corrupt gzip stream: {}", e)))?;
    Ok(out)
}

/// Stream `src` into a gzip file at `dst` and fsync it; returns bytes written
pub fn gzip_file(src: &Path, dst: &Path) -> Result<u64> {
    let mut input = File::open(src)?;
    let output = File::create(dst)?;
    let mut encoder = GzEncoder::new(output, Compression::default());
    let copied = io::copy(&mut input, &mut encoder)?;
    let file = encoder.finish()?;
    file.sync_all()?;
    let written = file.metadata()?.len();
    debug!("Compressed {:?}: {} -> {} bytes", src, copied, written);
    Ok(written)
}

/// Read a file, gunzipping it when `compressed` is set
pub fn read_file(path: &Path, compressed: bool) -> Result<Vec<u8>> {
    let raw = std::fs::read(path)?;
    if compressed {
        gunzip(&raw)
    } else {
        Ok(raw)
    }
}
