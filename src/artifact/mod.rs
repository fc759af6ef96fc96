//! Content-addressed artifacts.
//!
//! An artifact is a binary input to a job (code bundle, config, data blob)
//! identified by a stable id and a SHA-256 checksum. The checksum is the
//! unit of deduplication: the on-disk store and the worker-side cache both
//! key on it, which is what lets re-dispatches skip the transfer.

mod codec;
mod store;

pub use codec::{
    chunk_count, compress, decompress, CodecError, Compression, CHUNK_SIZE,
};
pub use store::{ArtifactStore, StoreError};

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::job::ArtifactId;

/// Metadata describing a stored artifact.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Artifact {
    /// Stable identifier, unchanged across transfers.
    pub id: ArtifactId,
    /// Human-readable name.
    pub name: String,
    /// Uncompressed size in bytes.
    pub size: u64,
    /// Hex-encoded SHA-256 of the content.
    pub checksum: String,
    /// Preferred compression for transfers of this artifact.
    pub compression_hint: Compression,
}

/// Computes the hex-encoded SHA-256 checksum of a byte slice.
pub fn compute_checksum(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}
