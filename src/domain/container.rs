//! Container domain type

use serde::{Deserialize, Serialize};

/// A downloadable archive bundling several payloads
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Container {
    pub id: String,

    /// Source path relative to the bundle's source folder
    pub file_path: String,

    #[serde(default)]
    pub size: Option<u64>,

    /// Expected SHA-512, hex encoded
    pub hash: String,

    #[serde(default)]
    pub download_url: Option<String>,
}
