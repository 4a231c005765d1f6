//! SHA256 hashing for content identity
//!
//! Used for provenance manifests of run inputs and dependency files.

use sha2::{Digest, Sha256};
use sparc_protocol::defaults::HASH_CHUNK_SIZE;
use std::fs::File;
use std::io::{self, Read};
use std::path::Path;

/// Compute SHA256 hash of data
pub fn sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Compute the SHA256 hash of a file, reading it in fixed-size chunks.
pub fn sha256_file(path: &Path) -> io::Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let read = file.read(&mut buf)?;
        if read == 0 {
            break;
        }
        hasher.update(&buf[..read]);
    }
    Ok(hex::encode(hasher.finalize()))
}
