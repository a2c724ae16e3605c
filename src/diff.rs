//! Binary delta codec
//!
//! Diff increments store a reverse delta: applied to the newer content of a
//! file it yields the older content. The codec is a seam; the engines only
//! see [`DeltaCodec`]. [`RsyncCodec`] implements it with rsync rolling-hash
//! signatures from `fast_rsync`.
//!
//! ```rust
//! use rewind::diff::{DeltaCodec, RsyncCodec};
//!
//! let codec = RsyncCodec::default();
//! let old = b"version one of the file\n".repeat(40);
//! let new = b"version two of the file\n".repeat(40);
//!
//! let delta = codec.reverse_delta(&new, &old).unwrap();
//! assert_eq!(codec.patch(&new, &delta).unwrap(), old);
//! ```

use crate::error::{Result, RewindError};
use std::fmt;
use tracing::trace;

/// Smallest rsync block size used
const MIN_BLOCK_SIZE: u32 = 256;
/// Largest rsync block size used
const MAX_BLOCK_SIZE: u32 = 64 * 1024;
/// Strong hash bytes kept per block
const CRYPTO_HASH_SIZE: u32 = 8;

/// Signature of a basis file, opaque to callers
pub struct Signature {
    inner: fast_rsync::Signature,
}

impl Signature {
    /// Serialized size in bytes
    pub fn len(&self) -> usize {
        self.inner.serialized().len()
    }

    /// True if the signature is empty
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl fmt::Debug for Signature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Signature").field("bytes", &self.len()).finish()
    }
}

/// Signature, delta and patch primitives
pub trait DeltaCodec: Send + Sync {
    /// Compute the signature of `basis`
    fn signature(&self, basis: &[u8]) -> Signature;

    /// Delta turning the content behind `signature` into `target`
    fn delta(&self, signature: &Signature, target: &[u8]) -> Result<Vec<u8>>;

    /// Apply `delta` to `basis`
    fn patch(&self, basis: &[u8], delta: &[u8]) -> Result<Vec<u8>>;

    /// Delta that recovers `prior` from `current`
    fn reverse_delta(&self, current: &[u8], prior: &[u8]) -> Result<Vec<u8>> {
        let signature = self.signature(current);
        self.delta(&signature, prior)
    }
}

/// rsync-style codec
#[derive(Debug, Clone, Default)]
pub struct RsyncCodec {
    block_size: Option<u32>,
}

impl RsyncCodec {
    /// Use a fixed block size instead of sizing blocks by basis length
    pub fn with_block_size(block_size: u32) -> Self {
        RsyncCodec {
            block_size: Some(block_size.max(1)),
        }
    }

    /// Block size for a basis of `len` bytes, roughly its square root
    fn block_size_for(&self, len: usize) -> u32 {
        if let Some(fixed) = self.block_size {
            return fixed;
        }
        let root = (len as f64).sqrt() as u32;
        root.next_power_of_two().clamp(MIN_BLOCK_SIZE, MAX_BLOCK_SIZE)
    }
}

impl DeltaCodec for RsyncCodec {
    fn signature(&self, basis: &[u8]) -> Signature {
        let options = fast_rsync::SignatureOptions {
            block_size: self.block_size_for(basis.len()),
            crypto_hash_size: CRYPTO_HASH_SIZE,
        };
        Signature {
            inner: fast_rsync::Signature::calculate(basis, options),
        }
    }

    fn delta(&self, signature: &Signature, target: &[u8]) -> Result<Vec<u8>> {
        let indexed = signature.inner.index();
        let mut out = Vec::new();
        fast_rsync::diff(&indexed, target, &mut out).map_err(|e| RewindError::delta(e.to_string()))?;
        trace!("Delta of {} bytes for {} byte target", out.len(), target.len());
        Ok(out)
    }

    fn patch(&self, basis: &[u8], delta: &[u8]) -> Result<Vec<u8>> {
        let mut out = Vec::new();
        fast_rsync::apply(basis, delta, &mut out).map_err(|e| RewindError::delta(e.to_string()))?;
        Ok(out)
    }
}
