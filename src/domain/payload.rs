//! Payload domain types
//!
//! A payload is a single cacheable file. It belongs to a package (or to the
//! bootstrapper UI) and may be shipped inside a container.

use serde::{Deserialize, Serialize};

/// How a payload or container must be verified before it is promoted
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Verification {
    /// SHA-512 over the full file
    Hash { hash: String },
    /// Detached signature whose chain must contain the pinned key
    Signature {
        public_key_identifier: String,
        #[serde(default)]
        thumbprint: Option<String>,
    },
    /// Lenient mode for update bundles: size and hash are checked only if present
    UpdateBundle {
        #[serde(default)]
        hash: Option<String>,
    },
}

impl Verification {
    /// The expected digest, if this verification kind carries one
    pub fn expected_hash(&self) -> Option<&str> {
        match self {
            Verification::Hash { hash } => Some(hash),
            Verification::UpdateBundle { hash } => hash.as_deref(),
            Verification::Signature { .. } => None,
        }
    }

    /// Whether the artifact travels with a detached signature envelope
    pub fn is_signed(&self) -> bool {
        matches!(self, Verification::Signature { .. })
    }
}

/// A single cacheable file
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Payload {
    /// Stable identity
    pub key: String,

    /// Path relative to the owning package's cache directory
    pub file_path: String,

    /// Expected size in bytes
    #[serde(default)]
    pub size: Option<u64>,

    pub verification: Verification,

    /// Source path relative to the bundle's source folder (defaults to `file_path`)
    #[serde(default)]
    pub source_path: Option<String>,

    /// Container this payload is shipped in
    #[serde(default)]
    pub container: Option<String>,

    #[serde(default)]
    pub download_url: Option<String>,
}

impl Payload {
    /// Relative path used when searching for the payload's source
    pub fn source_relative_path(&self) -> &str {
        self.source_path.as_deref().unwrap_or(&self.file_path)
    }

    /// Whether this payload must be extracted from a container rather than located directly
    pub fn is_embedded(&self) -> bool {
        self.container.is_some()
    }
}
