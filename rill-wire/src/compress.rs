//! Payload decompression seam.
//!
//! The full codec suite lives in the wire codec next to framing; the
//! session engine only needs the uncompressed path plus typed failures
//! for its discard handling. Entries compressed with a codec this build
//! does not carry surface as decompression errors and are discarded the
//! same way a corrupt payload would be.

use bytes::Bytes;
use rill_core::Compression;
use thiserror::Error;

/// Decompression failures.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum DecompressError {
    /// Output size disagreed with the declared uncompressed size.
    #[error("size mismatch: metadata says {expected} bytes, got {actual}")]
    SizeMismatch {
        /// Size declared in the entry metadata.
        expected: u32,
        /// Size actually produced.
        actual: u32,
    },

    /// The codec is not available in this build.
    #[error("unsupported compression codec {codec:?}")]
    Unsupported {
        /// The requested codec.
        codec: Compression,
    },
}

/// Decompresses an entry payload per its metadata.
///
/// # Errors
/// Returns [`DecompressError::SizeMismatch`] when the output size
/// disagrees with `uncompressed_size`, and
/// [`DecompressError::Unsupported`] for codecs not carried by this
/// build.
pub fn decompress(
    compression: Compression,
    payload: &Bytes,
    uncompressed_size: u32,
) -> Result<Bytes, DecompressError> {
    match compression {
        Compression::None => {
            #[allow(clippy::cast_possible_truncation)] // Entry sizes bounded by limits.
            let actual = payload.len() as u32;
            if uncompressed_size != 0 && actual != uncompressed_size {
                return Err(DecompressError::SizeMismatch {
                    expected: uncompressed_size,
                    actual,
                });
            }
            Ok(payload.clone())
        }
        Compression::Lz4 | Compression::Zstd | Compression::Zlib => {
            Err(DecompressError::Unsupported { codec: compression })
        }
    }
}
