//! Transfer compression and chunking.
//!
//! Artifact payloads are compressed as a whole, then split into fixed-size
//! chunks for streaming. `original_size` always refers to the uncompressed
//! byte length; a decompressed payload whose length disagrees with it is a
//! hard protocol error, not a recoverable condition.

use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Fixed transfer chunk size (64 KiB).
pub const CHUNK_SIZE: usize = 64 * 1024;

/// Compression applied to an artifact transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    /// No compression.
    #[default]
    None,
    /// gzip (DEFLATE) compression.
    Gzip,
    /// Zstandard compression. Optional worker capability; senders fall back
    /// to gzip when the worker does not support it.
    Zstd,
}

impl std::fmt::Display for Compression {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Compression::None => write!(f, "none"),
            Compression::Gzip => write!(f, "gzip"),
            Compression::Zstd => write!(f, "zstd"),
        }
    }
}

/// Errors raised while encoding or decoding transfer payloads.
#[derive(Debug, Error)]
pub enum CodecError {
    /// Compression or decompression failed at the byte level.
    #[error("{codec} codec failed: {source}")]
    Io {
        codec: Compression,
        #[source]
        source: std::io::Error,
    },

    /// The decompressed payload does not match the declared original size.
    #[error("Decompressed size {actual} does not match declared original size {expected}")]
    OriginalSizeMismatch { expected: u64, actual: u64 },
}

/// Compresses a payload with the given codec.
pub fn compress(data: &[u8], compression: Compression) -> Result<Vec<u8>, CodecError> {
    match compression {
        Compression::None => Ok(data.to_vec()),
        Compression::Gzip => {
            let mut encoder = GzEncoder::new(Vec::new(), flate2::Compression::default());
            encoder.write_all(data).map_err(|source| CodecError::Io {
                codec: Compression::Gzip,
                source,
            })?;
            encoder.finish().map_err(|source| CodecError::Io {
                codec: Compression::Gzip,
                source,
            })
        }
        Compression::Zstd => zstd::stream::encode_all(data, 0).map_err(|source| CodecError::Io {
            codec: Compression::Zstd,
            source,
        }),
    }
}

/// Decompresses a payload and verifies it against the declared original size.
pub fn decompress(
    data: &[u8],
    compression: Compression,
    original_size: u64,
) -> Result<Vec<u8>, CodecError> {
    let out = match compression {
        Compression::None => data.to_vec(),
        Compression::Gzip => {
            let mut decoder = GzDecoder::new(data);
            let mut out = Vec::new();
            decoder
                .read_to_end(&mut out)
                .map_err(|source| CodecError::Io {
                    codec: Compression::Gzip,
                    source,
                })?;
            out
        }
        Compression::Zstd => zstd::stream::decode_all(data).map_err(|source| CodecError::Io {
            codec: Compression::Zstd,
            source,
        })?,
    };

    if out.len() as u64 != original_size {
        return Err(CodecError::OriginalSizeMismatch {
            expected: original_size,
            actual: out.len() as u64,
        });
    }
    Ok(out)
}

/// Number of chunks a payload of `len` bytes occupies.
///
/// An empty payload still occupies one (empty, terminating) chunk so that
/// every transfer ends with exactly one `is_last` frame.
pub fn chunk_count(len: usize, chunk_size: usize) -> usize {
    if len == 0 {
        1
    } else {
        len.div_ceil(chunk_size)
    }
}
