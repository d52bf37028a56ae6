//! Hashing Engine
//!
//! SHA-256 digests for whole files and individual chunks, plus the
//! non-cryptographic aggregate token carried in the manifest.

use std::fmt;

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncReadExt;

use crate::error::{Result, UploadError};
use crate::manifest::FileSource;

/// Read block size when streaming a file through the hasher
pub const HASH_BLOCK_SIZE: usize = 1024 * 1024;

/// Lowercase hex SHA-256 digest
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Checksum(String);

impl Checksum {
    /// Parse a hex digest, normalizing to lowercase
    pub fn from_hex(value: &str) -> Option<Self> {
        let valid = value.len() == 64 && value.bytes().all(|b| b.is_ascii_hexdigit());
        valid.then(|| Self(value.to_ascii_lowercase()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Checksum {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Compute SHA-256 of data
pub fn digest(data: &[u8]) -> Checksum {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Checksum(hex::encode(hasher.finalize()))
}

/// Digest of the concatenation of `parts`, without concatenating them
pub fn digest_parts<'a, I>(parts: I) -> Checksum
where
    I: IntoIterator<Item = &'a [u8]>,
{
    let mut hasher = Sha256::new();
    for part in parts {
        hasher.update(part);
    }
    Checksum(hex::encode(hasher.finalize()))
}

/// Verify data matches an expected digest
pub fn verify(data: &[u8], expected: &Checksum) -> bool {
    digest(data) == *expected
}

/// Stream a file source through SHA-256
///
/// Returns the digest and the number of bytes read.
pub async fn digest_source(file_id: &str, source: &FileSource) -> Result<(Checksum, u64)> {
    match source {
        FileSource::Memory(bytes) => Ok((digest(bytes), bytes.len() as u64)),
        FileSource::Path(path) => {
            let read_error = |source| UploadError::Read {
                file_id: file_id.to_string(),
                source,
            };

            let mut file = tokio::fs::File::open(path).await.map_err(read_error)?;
            let mut hasher = Sha256::new();
            let mut buf = vec![0u8; HASH_BLOCK_SIZE];
            let mut total = 0u64;

            loop {
                let n = file.read(&mut buf).await.map_err(read_error)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                total += n as u64;
            }

            Ok((Checksum(hex::encode(hasher.finalize())), total))
        }
    }
}

/// Aggregate token over a set of per-file digests
///
/// Digests are sorted before folding, so the token does not depend on input
/// order. This is an integrity hint for negotiation only; it is not
/// collision resistant.
pub fn manifest_checksum<'a, I>(digests: I) -> String
where
    I: IntoIterator<Item = &'a Checksum>,
{
    let mut sorted: Vec<&str> = digests.into_iter().map(Checksum::as_str).collect();
    sorted.sort_unstable();

    let folded = sorted
        .iter()
        .flat_map(|d| d.bytes())
        .fold(0u32, |acc, b| acc.wrapping_mul(31).wrapping_add(u32::from(b)));

    format!("{:08x}", folded)
}
