//! Artifact verification
//!
//! Size is always checked first when one is declared. Hash verification
//! compares the file's SHA-512 against the expected digest; signature
//! verification delegates to a [`TrustProvider`]; update bundles are lenient
//! and only check what the manifest declares.

use std::path::Path;

use tracing::{debug, warn};

use super::signature::{TrustProvider, envelope_path, verify_signature};
use super::transfer::{RetryPolicy, remove_file_with_retry};
use crate::domain::{Container, Payload, Verification};
use crate::error::{
    Result,
    verify::{hash_mismatch, size_mismatch},
};
use crate::hash::{hash_file, verify_hash};

/// What an artifact must satisfy
#[derive(Debug, Clone, Copy)]
pub struct Expectation<'a> {
    pub id: &'a str,
    pub size: Option<u64>,
    pub verification: &'a Verification,
}

impl<'a> Expectation<'a> {
    pub fn for_payload(payload: &'a Payload) -> Self {
        Self {
            id: &payload.key,
            size: payload.size,
            verification: &payload.verification,
        }
    }
}

/// Expectation for a container; containers are always hash-verified
pub fn container_verification(container: &Container) -> Verification {
    Verification::Hash {
        hash: container.hash.clone(),
    }
}

/// Verify `path` against `expected`. Returns the verified size in bytes.
pub fn verify_file(path: &Path, expected: &Expectation<'_>, trust: &dyn TrustProvider) -> Result<u64> {
    let actual_size = std::fs::metadata(path)
        .map_err(|e| crate::error::fs::read_failed(path, &e))?
        .len();

    if let Some(size) = expected.size {
        if size != actual_size {
            warn!(id = expected.id, expected = size, actual = actual_size, "size mismatch");
            return Err(size_mismatch(expected.id, size, actual_size));
        }
    }

    match expected.verification {
        Verification::Hash { hash } => check_hash(path, expected.id, hash)?,
        Verification::UpdateBundle { hash: Some(hash) } => check_hash(path, expected.id, hash)?,
        Verification::UpdateBundle { hash: None } => {
            debug!(id = expected.id, "update bundle without hash, size check only");
        }
        Verification::Signature {
            public_key_identifier,
            thumbprint,
        } => verify_signature(
            trust,
            expected.id,
            path,
            public_key_identifier,
            thumbprint.as_deref(),
        )?,
    }

    Ok(actual_size)
}

/// Verify `path`, deleting it when it fails verification
pub fn verify_or_delete(
    path: &Path,
    expected: &Expectation<'_>,
    trust: &dyn TrustProvider,
    retry: &RetryPolicy,
) -> Result<u64> {
    match verify_file(path, expected, trust) {
        Ok(size) => Ok(size),
        Err(e) if e.is_verification_failure() => {
            warn!(id = expected.id, path = %path.display(), "deleting artifact that failed verification");
            remove_file_with_retry(path, retry)?;
            if expected.verification.is_signed() {
                remove_file_with_retry(&envelope_path(path), retry)?;
            }
            Err(e)
        }
        Err(e) => Err(e),
    }
}

fn check_hash(path: &Path, id: &str, expected: &str) -> Result<()> {
    let actual = hash_file(path)?;
    if verify_hash(expected, &actual.hex) {
        debug!(id, "hash verified");
        Ok(())
    } else {
        warn!(id, expected, actual = %actual.hex, "hash mismatch");
        Err(hash_mismatch(id, expected, actual.hex))
    }
}
