//! Content hashing helpers shared by the Verifier (transcript hash)
//! and the Finalizer (artifact hashes), spec.md §4.2/§4.4.

use blake2::{Blake2b512, Digest};
use sha2::Sha256;

use crate::error::{CoordinatorError, Result};

/// Blake-512 hash of a local file's contents, hex-encoded.
pub async fn blake512_file_hex(path: &str) -> Result<String> {
    let bytes = tokio::fs::read(path)
        .await
        .map_err(|e| CoordinatorError::Blob(anyhow::anyhow!(e)))?;
    let mut hasher = Blake2b512::new();
    hasher.update(&bytes);
    Ok(hex::encode(hasher.finalize()))
}

/// SHA-256 hash of a UTF-8 string, hex-encoded. Used for the beacon
/// record (spec.md §4.4).
pub fn sha256_str_hex(value: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(value.as_bytes());
    hex::encode(hasher.finalize())
}
