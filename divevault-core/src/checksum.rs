/*!
SHA-256 checksums over artifacts, computed in bounded memory.
*/

use std::fs::File;
use std::io::{self, Write};
use std::path::Path;

use sha2::{Digest, Sha256};

use crate::compression::copy_chunked;
use crate::{Result, VaultError};

/// Hex-encoded SHA-256 of a byte slice.
pub fn compute_hash(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    format!("{:x}", hasher.finalize())
}

/// Hex-encoded SHA-256 of a file, streamed in chunks.
pub fn compute_file_checksum(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut writer = HashingWriter::new(io::sink());
    copy_chunked(&mut file, &mut writer)?;
    let (_, checksum) = writer.finish();
    Ok(checksum)
}

/// Fail with `ChecksumMismatch` unless `path` hashes to `expected`.
pub fn verify_file_checksum(path: &Path, expected: &str) -> Result<()> {
    let actual = compute_file_checksum(path)?;
    if actual == expected {
        Ok(())
    } else {
        Err(VaultError::ChecksumMismatch {
            expected: expected.to_string(),
            actual,
        })
    }
}

/// Writer that hashes and counts everything passed through to `inner`.
pub struct HashingWriter<W: Write> {
    inner: W,
    hasher: Sha256,
    written: u64,
}

impl<W: Write> HashingWriter<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            hasher: Sha256::new(),
            written: 0,
        }
    }

    pub fn bytes_written(&self) -> u64 {
        self.written
    }

    /// Return the inner writer and the hex digest of what it received.
    pub fn finish(self) -> (W, String) {
        (self.inner, format!("{:x}", self.hasher.finalize()))
    }
}

impl<W: Write> Write for HashingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.written += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}
