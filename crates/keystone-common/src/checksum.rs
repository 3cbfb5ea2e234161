//! Checksum utilities for checkpoint packages
//!
//! A checkpoint package is tagged with a digest on the serving side and
//! re-verified after download, in addition to the log-index check.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Read size used when digesting a stream
pub const DIGEST_CHUNK_SIZE: usize = 64 * 1024;

/// Digest of a checkpoint package's bytes
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PackageDigest {
    /// CRC32C checksum (fast, catches truncation and bit flips)
    pub crc32c: u32,
    /// xxHash64 (fast, for byte-for-byte comparison of packages)
    pub xxhash64: u64,
    /// Total length in bytes
    pub len: u64,
}

impl PackageDigest {
    /// Compute digest over a complete buffer
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        let mut calc = DigestCalculator::new();
        calc.update(data);
        calc.finalize()
    }

    /// Compute digest over a reader without buffering it whole
    pub fn compute_reader(mut reader: impl Read) -> io::Result<Self> {
        let mut calc = DigestCalculator::new();
        let mut buf = vec![0u8; DIGEST_CHUNK_SIZE];
        loop {
            match reader.read(&mut buf) {
                Ok(0) => return Ok(calc.finalize()),
                Ok(n) => calc.update(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
    }

    /// Compute digest over a file on disk
    pub fn compute_file(path: impl AsRef<Path>) -> io::Result<Self> {
        Self::compute_reader(File::open(path)?)
    }

    /// Verify data against this digest
    #[must_use]
    pub fn verify(&self, data: &[u8]) -> bool {
        Self::compute(data) == *self
    }
}

impl fmt::Display for PackageDigest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "crc32c={:08x} xxh64={:016x} len={}",
            self.crc32c, self.xxhash64, self.len
        )
    }
}

/// Streaming digest calculator
pub struct DigestCalculator {
    crc32c: u32,
    xxhash_state: xxhash_rust::xxh64::Xxh64,
    len: u64,
}

impl DigestCalculator {
    #[must_use]
    pub fn new() -> Self {
        Self {
            crc32c: 0,
            xxhash_state: xxhash_rust::xxh64::Xxh64::new(0),
            len: 0,
        }
    }

    /// Update the calculator with more data
    pub fn update(&mut self, data: &[u8]) {
        self.crc32c = crc32c::crc32c_append(self.crc32c, data);
        self.xxhash_state.update(data);
        self.len += data.len() as u64;
    }

    /// Finalize and return the computed digest
    #[must_use]
    pub fn finalize(self) -> PackageDigest {
        PackageDigest {
            crc32c: self.crc32c,
            xxhash64: self.xxhash_state.digest(),
            len: self.len,
        }
    }
}

impl Default for DigestCalculator {
    fn default() -> Self {
        Self::new()
    }
}
