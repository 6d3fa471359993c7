/*!
Streaming compression adapters for backup artifacts.

Artifacts can be as large as the data store itself, so both directions work
on readers and writers in fixed-size chunks and never buffer the whole
payload. The default implementation uses gzip, but the engine only depends on
the [`CompressionAdapter`] trait.
*/

use std::io::{self, Read, Write};

use flate2::{read::GzDecoder, write::GzEncoder, Compression};

use crate::{Result, VaultError};

/// Size of the buffer used to move bytes between source and destination.
pub const CHUNK_SIZE: usize = 512 * 1024;

/// Compression abstraction for backup artifacts
///
/// A failure part way through leaves `dst` holding an unusable prefix. Callers
/// own the destination and must discard it on error.
pub trait CompressionAdapter: Send + Sync {
    /// Compress everything readable from `src` into `dst`
    ///
    /// # Returns
    /// The number of uncompressed bytes consumed from `src`
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;

    /// Decompress everything readable from `src` into `dst`
    ///
    /// # Returns
    /// The number of decompressed bytes written to `dst`
    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64>;

    /// Get the name of the compression algorithm
    fn algorithm_name(&self) -> &str;

    /// File extension appended to artifact names, without the dot
    fn extension(&self) -> &str;
}

/// Copy `src` to `dst` through a single `CHUNK_SIZE` buffer.
pub(crate) fn copy_chunked(src: &mut dyn Read, dst: &mut dyn Write) -> io::Result<u64> {
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = match src.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        };
        dst.write_all(&buf[..n])?;
        total += n as u64;
    }
    Ok(total)
}

/// Gzip compression adapter
///
/// # Example
/// ```rust
/// use divevault_core::{CompressionAdapter, GzipCompressor};
/// use std::io::Cursor;
///
/// let compressor = GzipCompressor::new();
/// let mut compressed = Vec::new();
/// compressor.compress(&mut Cursor::new(b"INSERT INTO divers VALUES (1);"), &mut compressed)?;
///
/// let mut restored = Vec::new();
/// compressor.decompress(&mut Cursor::new(compressed), &mut restored)?;
/// assert_eq!(restored, b"INSERT INTO divers VALUES (1);");
/// # Ok::<(), divevault_core::VaultError>(())
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

    /// Create a new gzip compressor with the specified compression level
    ///
    /// # Arguments
    /// * `level` - Compression level (0-9, where 0 is no compression and 9 is maximum)
    pub fn with_level(level: u32) -> Self {
        Self {
            compression_level: Compression::new(level.min(9)),
        }
    }

    /// Create a compressor for maximum compression (level 9)
    pub fn max() -> Self {
        Self::with_level(9)
    }

    pub fn level(&self) -> u32 {
        self.compression_level.level()
    }
}

impl Default for GzipCompressor {
    fn default() -> Self {
        Self::new()
    }
}

impl CompressionAdapter for GzipCompressor {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut encoder = GzEncoder::new(dst, self.compression_level);

        let consumed = copy_chunked(src, &mut encoder)
            .map_err(|e| VaultError::compression(format!("Failed to write data for compression: {e}")))?;

        encoder
            .finish()
            .map_err(|e| VaultError::compression(format!("Failed to finish compression: {e}")))?;

        Ok(consumed)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        let mut decoder = GzDecoder::new(src);

        copy_chunked(&mut decoder, dst)
            .map_err(|e| VaultError::compression(format!("Failed to decompress data: {e}")))
    }

    fn algorithm_name(&self) -> &str {
        "gzip"
    }

    fn extension(&self) -> &str {
        "gz"
    }
}

/// Pass-through adapter for tests or already-compressed exports
#[derive(Debug, Clone, Default)]
pub struct NoCompression;

impl NoCompression {
    pub fn new() -> Self {
        Self
    }
}

impl CompressionAdapter for NoCompression {
    fn compress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        Ok(copy_chunked(src, dst)?)
    }

    fn decompress(&self, src: &mut dyn Read, dst: &mut dyn Write) -> Result<u64> {
        Ok(copy_chunked(src, dst)?)
    }

    fn algorithm_name(&self) -> &str {
        "none"
    }

    fn extension(&self) -> &str {
        "raw"
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(compressor: &dyn CompressionAdapter, data: &[u8]) -> (Vec<u8>, Vec<u8>) {
        let mut compressed = Vec::new();
        let consumed = compressor
            .compress(&mut Cursor::new(data), &mut compressed)
            .unwrap();
        assert_eq!(consumed, data.len() as u64);

        let mut decompressed = Vec::new();
        let written = compressor
            .decompress(&mut Cursor::new(&compressed), &mut decompressed)
            .unwrap();
        assert_eq!(written, data.len() as u64);
        (compressed, decompressed)
    }

    #[test]
    fn test_gzip_streaming_roundtrip() {
        let compressor = GzipCompressor::new();
        let original = b"INSERT INTO courses VALUES (1, 'Open Water');\n".repeat(200);

        let (compressed, decompressed) = roundtrip(&compressor, &original);

        assert!(compressed.len() < original.len());
        assert_eq!(original, decompressed);
    }

    #[test]
    fn test_gzip_input_larger_than_chunk() {
        let compressor = GzipCompressor::max();
        let original: Vec<u8> = (0..(CHUNK_SIZE * 3 + 17)).map(|i| (i % 251) as u8).collect();

        let (_, decompressed) = roundtrip(&compressor, &original);
        assert_eq!(original, decompressed);
    }

    #[test]
    fn test_gzip_empty_data() {
        let compressor = GzipCompressor::new();
        let (_, decompressed) = roundtrip(&compressor, b"");
        assert!(decompressed.is_empty());
    }

    #[test]
    fn test_gzip_invalid_compressed_data() {
        let compressor = GzipCompressor::new();
        let mut out = Vec::new();
        let result = compressor.decompress(&mut Cursor::new(b"this is not gzip data"), &mut out);
        assert!(matches!(result, Err(VaultError::Compression(_))));
    }

    #[test]
    fn test_gzip_truncated_stream_fails() {
        let compressor = GzipCompressor::new();
        let original = b"customer rows ".repeat(1000);
        let mut compressed = Vec::new();
        compressor
            .compress(&mut Cursor::new(&original), &mut compressed)
            .unwrap();
        compressed.truncate(compressed.len() / 2);

        let mut out = Vec::new();
        assert!(compressor
            .decompress(&mut Cursor::new(&compressed), &mut out)
            .is_err());
    }

    struct FailingWriter {
        budget: usize,
    }

    impl Write for FailingWriter {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            if self.budget < buf.len() {
                return Err(io::Error::new(io::ErrorKind::Other, "disk full"));
            }
            self.budget -= buf.len();
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_destination_failure_surfaces() {
        let compressor = NoCompression::new();
        let data = vec![7u8; 4096];
        let mut dst = FailingWriter { budget: 100 };
        let result = compressor.compress(&mut Cursor::new(&data), &mut dst);
        assert!(matches!(result, Err(VaultError::Io(_))));
    }

    #[test]
    fn test_levels_are_clamped() {
        assert_eq!(GzipCompressor::with_level(42).level(), 9);
        assert_eq!(GzipCompressor::new().algorithm_name(), "gzip");
        assert_eq!(NoCompression::new().algorithm_name(), "none");
    }
}
