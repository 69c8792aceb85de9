/*!
Compression adapters for snapshot artifacts.

Both the bulk data artifact and the manifest are stored compressed. Gzip is the
default; `NoCompression` exists for tests and for already-compressed payloads.
*/

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use std::io::{Read, Write};

use crate::{FolioError, Result};

/// Leading bytes of every gzip stream
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression abstraction for artifact bytes
pub trait CompressionAdapter: Send + Sync {
    /// Compress the input data
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress the input data
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Name recorded in snapshot metadata, e.g. `gzip`
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// ```rust
/// use folio_core::compression::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let data = br#"[{"id":"page-1","kind":"page"}]"#;
/// let compressed = compressor.compress(data).unwrap();
/// assert_eq!(compressor.decompress(&compressed).unwrap(), data.to_vec());
/// ```
#[derive(Debug, Clone)]
pub struct GzipCompressor {
    compression_level: Compression,
}

impl GzipCompressor {
    /// Create a new gzip compressor with default compression level (6)
    pub fn new() -> Self {
        Self {
            compression_level: Compression::default(),
        }
    }

    /// Create a gzip compressor with the given level; values above 9 are clamped
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }

    /// True when `data` starts with the gzip magic bytes
    pub fn looks_compressed(data: &[u8]) -> bool {
        data.starts_with(&GZIP_MAGIC)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::with_capacity(data.len() / 4), self.compression_level);

        encoder
            .write_all(data)
            .map_err(|e| FolioError::compression(format!("Failed to write data for compression: {e}")))?;

        encoder
            .finish()
            .map_err(|e| FolioError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        if !Self::looks_compressed(compressed_data) {
            return Err(FolioError::compression("Data is not a gzip stream"));
        }

        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| FolioError::compression(format!("Failed to decompress data: {e}")))?;

        Ok(decompressed)
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }
}

/// Pass-through adapter
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        Ok(data.to_vec())
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        Ok(compressed_data.to_vec())
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }
}
