//! Streaming content fingerprinting.
//!
//! Grounded on the sync plugin's `compute_file_hash`, but using SHA-256
//! (the spec's default) instead of BLAKE3, and async so it never blocks
//! a reconciler or uploader task's executor thread.

use sha2::{Digest, Sha256};
use std::path::Path;
use tokio::io::AsyncReadExt;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// A SHA-256 content fingerprint, hex-encoded for storage and logging.
#[derive(Debug, Clone, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
pub struct Fingerprint(String);

impl Fingerprint {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Hashes the file at `path` in fixed-size chunks, never holding the
/// whole content in memory at once.
pub async fn hash_file(path: &Path) -> std::io::Result<Fingerprint> {
    let mut file = tokio::fs::File::open(path).await?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        let read = file.read(&mut buffer).await?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }

    Ok(Fingerprint(hex_encode(&hasher.finalize())))
}

pub fn hash_bytes(data: &[u8]) -> Fingerprint {
    let mut hasher = Sha256::new();
    hasher.update(data);
    Fingerprint(hex_encode(&hasher.finalize()))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for byte in bytes {
        let _ = write!(out, "{:02x}", byte);
    }
    out
}
