//! Signature verification
//!
//! A [`TrustProvider`] validates an artifact's signature and returns its
//! certificate chain. Verification tries online revocation checking first and
//! falls back to cache-only checking, then walks the chain for the pinned
//! public-key identifier (and thumbprint, when one is pinned).
//!
//! The shipped provider, [`Ed25519TrustProvider`], reads a detached JSON
//! envelope at `<file>.sig`:
//!
//! ```json
//! {
//!   "signature": "<hex ed25519 signature over the file's SHA-512 digest>",
//!   "chain": [
//!     { "public_key": "<hex>", "issuer_signature": "<hex>" }
//!   ],
//!   "revocation_url": "https://example.com/revoked.json"
//! }
//! ```
//!
//! `chain[0]` signs the file; every element's `issuer_signature` is made by the
//! next element over the element's public key, and the last element signs itself.

use std::fmt;
use std::path::{Path, PathBuf};

use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::error::{Result, verify::untrusted};
use crate::hash::hash_file;

/// Suffix of the detached signature envelope
pub const SIGNATURE_SUFFIX: &str = "sig";

/// How certificate revocation is checked
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationMode {
    Online,
    CacheOnly,
}

/// One certificate of a validated chain
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChainElement {
    pub public_key_identifier: String,
    pub thumbprint: String,
}

/// Validates signatures and yields the signer's chain
pub trait TrustProvider: Send + Sync + fmt::Debug {
    fn verify_chain(&self, path: &Path, mode: RevocationMode) -> Result<Vec<ChainElement>>;
}

/// Verify `path` and require the pinned key somewhere in its chain
pub fn verify_signature(
    provider: &dyn TrustProvider,
    id: &str,
    path: &Path,
    public_key_identifier: &str,
    thumbprint: Option<&str>,
) -> Result<()> {
    let chain = match provider.verify_chain(path, RevocationMode::Online) {
        Ok(chain) => chain,
        Err(e) => {
            debug!(id, error = %e, "online revocation check failed, using cache only");
            provider.verify_chain(path, RevocationMode::CacheOnly)?
        }
    };

    let matched = chain.iter().any(|element| {
        element
            .public_key_identifier
            .eq_ignore_ascii_case(public_key_identifier)
            && thumbprint.is_none_or(|t| element.thumbprint.eq_ignore_ascii_case(t))
    });

    if matched {
        debug!(id, "signature chain matches pinned key");
        Ok(())
    } else {
        warn!(
            id,
            expected_key = public_key_identifier,
            expected_thumbprint = thumbprint.unwrap_or("-"),
            "no certificate in the chain matches the pinned key"
        );
        Err(untrusted(id, "no certificate in the chain matches the pinned key"))
    }
}

/// Identifier of a public key: hex SHA-256 of its bytes
pub fn key_identifier(public_key: &[u8]) -> String {
    hex::encode(Sha256::digest(public_key))
}

/// Thumbprint of a chain element: hex SHA-256 of key and issuer signature
pub fn thumbprint(public_key: &[u8], issuer_signature: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(public_key);
    hasher.update(issuer_signature);
    hex::encode(hasher.finalize())
}

/// Path of the detached envelope for `path`
pub fn envelope_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(".");
    name.push(SIGNATURE_SUFFIX);
    PathBuf::from(name)
}

/// Detached signature envelope
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignatureEnvelope {
    pub signature: String,
    pub chain: Vec<EnvelopeCertificate>,
    #[serde(default)]
    pub revocation_url: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EnvelopeCertificate {
    pub public_key: String,
    pub issuer_signature: String,
}

/// Trust provider for ed25519 signature envelopes
#[derive(Debug, Clone, Default)]
pub struct Ed25519TrustProvider {
    /// Local JSON list of revoked key identifiers used in cache-only mode
    revocation_cache: Option<PathBuf>,
}

impl Ed25519TrustProvider {
    pub fn new(revocation_cache: Option<PathBuf>) -> Self {
        Self { revocation_cache }
    }

    fn revoked_identifiers(
        &self,
        envelope: &SignatureEnvelope,
        mode: RevocationMode,
        id: &str,
    ) -> Result<Vec<String>> {
        match (mode, &envelope.revocation_url) {
            (RevocationMode::Online, Some(url)) => fetch_revocation_list(url, id),
            _ => match &self.revocation_cache {
                Some(path) if path.is_file() => {
                    let content = std::fs::read_to_string(path)
                        .map_err(|e| untrusted(id, format!("revocation cache: {e}")))?;
                    serde_json::from_str(&content)
                        .map_err(|e| untrusted(id, format!("revocation cache: {e}")))
                }
                _ => Ok(Vec::new()),
            },
        }
    }
}

impl TrustProvider for Ed25519TrustProvider {
    fn verify_chain(&self, path: &Path, mode: RevocationMode) -> Result<Vec<ChainElement>> {
        let id = path.display().to_string();
        let envelope_file = envelope_path(path);
        let content = std::fs::read_to_string(&envelope_file)
            .map_err(|e| untrusted(&id, format!("missing signature envelope: {e}")))?;
        let envelope: SignatureEnvelope = serde_json::from_str(&content)
            .map_err(|e| untrusted(&id, format!("malformed signature envelope: {e}")))?;

        if envelope.chain.is_empty() {
            return Err(untrusted(&id, "signature envelope has an empty chain"));
        }

        let keys = envelope
            .chain
            .iter()
            .map(|c| decode_key(&id, &c.public_key))
            .collect::<Result<Vec<_>>>()?;

        let digest = hex::decode(hash_file(path)?.hex)
            .map_err(|e| untrusted(&id, format!("digest: {e}")))?;
        let signature = decode_signature(&id, &envelope.signature)?;
        keys[0]
            .verify(&digest, &signature)
            .map_err(|_| untrusted(&id, "file signature does not verify"))?;

        let revoked = self.revoked_identifiers(&envelope, mode, &id)?;
        let mut chain = Vec::with_capacity(keys.len());

        for (index, certificate) in envelope.chain.iter().enumerate() {
            let issuer = keys.get(index + 1).unwrap_or(&keys[index]);
            let issuer_signature = decode_signature(&id, &certificate.issuer_signature)?;
            issuer
                .verify(keys[index].as_bytes(), &issuer_signature)
                .map_err(|_| untrusted(&id, format!("chain element {index} is not signed by its issuer")))?;

            let identifier = key_identifier(keys[index].as_bytes());
            if revoked.iter().any(|r| r.eq_ignore_ascii_case(&identifier)) {
                return Err(untrusted(&id, format!("certificate {identifier} is revoked")));
            }

            chain.push(ChainElement {
                thumbprint: thumbprint(keys[index].as_bytes(), &issuer_signature.to_bytes()),
                public_key_identifier: identifier,
            });
        }

        Ok(chain)
    }
}

fn fetch_revocation_list(url: &str, id: &str) -> Result<Vec<String>> {
    let mut response = ureq::get(url)
        .call()
        .map_err(|e| untrusted(id, format!("revocation list {url}: {e}")))?;
    let body = response
        .body_mut()
        .read_to_string()
        .map_err(|e| untrusted(id, format!("revocation list {url}: {e}")))?;
    serde_json::from_str(&body).map_err(|e| untrusted(id, format!("revocation list {url}: {e}")))
}

fn decode_key(id: &str, hex_key: &str) -> Result<VerifyingKey> {
    let bytes: [u8; 32] = hex::decode(hex_key)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| untrusted(id, "public key is not 32 hex-encoded bytes"))?;
    VerifyingKey::from_bytes(&bytes).map_err(|e| untrusted(id, format!("public key: {e}")))
}

fn decode_signature(id: &str, hex_signature: &str) -> Result<Signature> {
    let bytes: [u8; 64] = hex::decode(hex_signature)
        .ok()
        .and_then(|b| b.try_into().ok())
        .ok_or_else(|| untrusted(id, "signature is not 64 hex-encoded bytes"))?;
    Ok(Signature::from_bytes(&bytes))
}
