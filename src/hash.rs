// src/hash.rs

//! Streaming SHA-256 checksums for package files
//!
//! Packages can be large; files are read through a fixed buffer and are
//! never loaded into memory whole.

use crate::error::Result;
use sha2::{Digest, Sha256};
use std::fs::File;
use std::io::Read;
use std::path::Path;

/// Read buffer size for file checksumming
const BUF_SIZE: usize = 4 * 1024 * 1024;

/// Compute the SHA-256 of a file, returned as a lowercase hex digest
pub fn checksum_file(path: &Path) -> Result<String> {
    let mut file = File::open(path)?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; BUF_SIZE];

    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }

    Ok(hex::encode(hasher.finalize()))
}

/// Compute the SHA-256 of a byte slice, returned as a lowercase hex digest
pub fn checksum_bytes(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}
