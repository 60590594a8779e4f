/*!
Compression adapters for persisted records.

Records are compressed one at a time before they reach a backend. Gzip is the
default for durable backends; the in-memory backend usually runs without
compression.
*/

use std::io::{Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};
use serde::{Deserialize, Serialize};

use crate::{PersistError, Result};

/// First two bytes of every gzip stream.
const GZIP_MAGIC: [u8; 2] = [0x1f, 0x8b];

/// Compression abstraction for record bytes
///
/// Implementations are shared between the caller thread that encodes records
/// and the thread that decodes them on load, hence `Send + Sync`.
pub trait CompressionAdapter: Send + Sync {
    /// Compress one encoded record
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>>;

    /// Decompress one stored record
    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use memento_core::compression::{CompressionAdapter, GzipCompressor};
///
/// let compressor = GzipCompressor::new();
/// let record = br#"{"format_version":1,"body":{}}"#;
/// let compressed = compressor.compress(record)?;
/// assert_eq!(compressor.decompress(&compressed)?, record.to_vec());
/// # Ok::<(), memento_core::PersistError>(())
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

    /// Create a new gzip compressor with the specified level (0-9)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Level 1; checkpoints of large graphs write many small records
    pub fn fast() -> Self {
        Self::with_level(1)
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        let mut encoder = GzEncoder::new(Vec::new(), self.compression_level);

        encoder.write_all(data).map_err(|e| {
            PersistError::compression(format!("Failed to write record for compression: {e}"))
        })?;

        encoder
            .finish()
            .map_err(|e| PersistError::compression(format!("Failed to finish compression: {e}")))
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        let mut decoder = GzDecoder::new(compressed_data);
        let mut decompressed = Vec::new();

        decoder
            .read_to_end(&mut decompressed)
            .map_err(|e| PersistError::compression(format!("Failed to decompress record: {e}")))?;

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

/// Compression selectable from configuration.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CompressionKind {
    None,
    #[default]
    Gzip,
}

/// Adapter chosen at runtime from a [`CompressionKind`].
///
/// Decompression sniffs the gzip header, so a store written with either
/// setting can be read back with the other.
#[derive(Debug, Clone)]
pub enum RecordCompression {
    Gzip(GzipCompressor),
    None(NoCompression),
}

impl From<CompressionKind> for RecordCompression {
    fn from(kind: CompressionKind) -> Self {
        match kind {
            CompressionKind::Gzip => RecordCompression::Gzip(GzipCompressor::new()),
            CompressionKind::None => RecordCompression::None(NoCompression),
        }
    }
}

impl CompressionAdapter for RecordCompression {
    fn compress(&self, data: &[u8]) -> Result<Vec<u8>> {
        match self {
            RecordCompression::Gzip(gzip) => gzip.compress(data),
            RecordCompression::None(none) => none.compress(data),
        }
    }

    fn decompress(&self, compressed_data: &[u8]) -> Result<Vec<u8>> {
        if compressed_data.starts_with(&GZIP_MAGIC) {
            GzipCompressor::new().decompress(compressed_data)
        } else {
            NoCompression.decompress(compressed_data)
        }
    }

    fn algorithm_name(&self) -> &str {
        match self {
            RecordCompression::Gzip(gzip) => gzip.algorithm_name(),
            RecordCompression::None(none) => none.algorithm_name(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gzip_compression_roundtrip() {
        let compressor = GzipCompressor::new();
        let original_data = br#"{"id":"e1","type":"BasicEntity","config":{}}"#.repeat(10);

        let compressed = compressor.compress(&original_data).unwrap();
        assert!(compressed.len() < original_data.len());
        assert!(compressed.starts_with(&GZIP_MAGIC));

        let decompressed = compressor.decompress(&compressed).unwrap();
        assert_eq!(original_data, decompressed);
    }

    #[test]
    fn test_no_compression() {
        let compressor = NoCompression::new();
        let test_data = b"test data";

        let compressed = compressor.compress(test_data).unwrap();
        assert_eq!(compressed, test_data);
        assert_eq!(compressor.decompress(&compressed).unwrap(), test_data);
        assert_eq!(compressor.algorithm_name(), "none");
    }

    #[test]
    fn test_gzip_invalid_compressed_data() {
        let compressor = GzipCompressor::new();
        let result = compressor.decompress(b"this is not compressed gzip data");
        assert!(matches!(result, Err(PersistError::Compression(_))));
    }

    #[test]
    fn test_record_compression_reads_either_format() {
        let data = br#"{"format_version":1}"#;
        let gzip = RecordCompression::from(CompressionKind::Gzip);
        let plain = RecordCompression::from(CompressionKind::None);

        let gzipped = gzip.compress(data).unwrap();
        let stored_plain = plain.compress(data).unwrap();

        assert_eq!(plain.decompress(&gzipped).unwrap(), data);
        assert_eq!(gzip.decompress(&stored_plain).unwrap(), data);
        assert_eq!(gzip.algorithm_name(), "gzip");
    }

    #[test]
    fn test_compression_kind_serde() {
        assert_eq!(
            serde_json::to_string(&CompressionKind::Gzip).unwrap(),
            "\"gzip\""
        );
        assert_eq!(CompressionKind::default(), CompressionKind::Gzip);
    }
}
