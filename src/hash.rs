//! SHA-512 hashing utilities for artifact integrity

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;

use sha2::{Digest, Sha512};

use crate::error::{Result, fs::read_failed};

/// Digest of a file together with the number of bytes hashed
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileDigest {
    pub hex: String,
    pub size: u64,
}

/// Calculate the SHA-512 digest of a file
pub fn hash_file(path: &Path) -> Result<FileDigest> {
    let file = File::open(path).map_err(|e| read_failed(path, &e))?;

    let mut reader = BufReader::new(file);
    let mut hasher = Sha512::new();
    let mut buffer = [0u8; 64 * 1024];
    let mut size = 0u64;

    loop {
        let bytes_read = reader.read(&mut buffer).map_err(|e| read_failed(path, &e))?;

        if bytes_read == 0 {
            break;
        }

        size += bytes_read as u64;
        hasher.update(&buffer[..bytes_read]);
    }

    Ok(FileDigest {
        hex: hex::encode(hasher.finalize()),
        size,
    })
}

/// Calculate the SHA-512 digest of a byte slice
pub fn hash_bytes(bytes: &[u8]) -> String {
    hex::encode(Sha512::digest(bytes))
}

/// Compare two hex digests; case-insensitive and any length difference is a mismatch
pub fn verify_hash(expected: &str, actual: &str) -> bool {
    expected.len() == actual.len() && expected.eq_ignore_ascii_case(actual)
}
