//! Messages exchanged with the elevated companion
//!
//! Every message is one JSON document per line. The companion opens two
//! connections, each introduced by a [`Hello`]:
//!
//! - the RPC channel: the primary sends a [`Request`]; the companion answers
//!   with any number of [`CompanionMessage::Cache`] / [`CompanionMessage::Progress`]
//!   notifications (each answered with a [`ParentReply`]) followed by exactly
//!   one [`CompanionMessage::Response`] or [`CompanionMessage::Failed`]
//! - the log channel: plain log lines, companion to primary only

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::cache::CacheMessage;
use crate::domain::{ActionState, RelationType};
use crate::error::BootstrapError;
use crate::packages::Restart;
use crate::variables::Variables;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelKind {
    Rpc,
    Log,
}

/// First line on every connection
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub secret: String,
    pub parent_pid: u32,
    pub channel: ChannelKind,
}

/// Work the primary forwards to the companion
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "request", rename_all = "snake_case")]
pub enum Request {
    /// Prepare the companion's hardened working folder
    ApplyInitialize,
    ApplyUninitialize,
    /// Register the bundle: cache its engine and manifest, write its record
    SessionBegin {
        engine_path: PathBuf,
        manifest_path: PathBuf,
    },
    /// End the session, removing the registration when `unregister` is set
    SessionEnd { unregister: bool },
    SaveState { variables: Variables },
    CacheCompletePayload {
        package_id: String,
        payload_key: String,
        working_path: PathBuf,
        move_file: bool,
    },
    CacheVerifyPayload {
        package_id: String,
        payload_key: String,
    },
    CacheRemovePackage { package_id: String },
    CacheCleanup { per_machine: bool },
    ExecutePackage {
        package_id: String,
        action: ActionState,
        rollback: bool,
        variables: Variables,
    },
    ExecuteRelatedBundle {
        bundle_id: String,
        action: ActionState,
        relation: RelationType,
    },
    /// Launch an executable the manifest approves for elevated launch
    LaunchApprovedExe { id: String, variables: Variables },
    Terminate,
}

impl Request {
    pub fn name(&self) -> &'static str {
        match self {
            Request::ApplyInitialize => "apply_initialize",
            Request::ApplyUninitialize => "apply_uninitialize",
            Request::SessionBegin { .. } => "session_begin",
            Request::SessionEnd { .. } => "session_end",
            Request::SaveState { .. } => "save_state",
            Request::CacheCompletePayload { .. } => "cache_complete_payload",
            Request::CacheVerifyPayload { .. } => "cache_verify_payload",
            Request::CacheRemovePackage { .. } => "cache_remove_package",
            Request::CacheCleanup { .. } => "cache_cleanup",
            Request::ExecutePackage { .. } => "execute_package",
            Request::ExecuteRelatedBundle { .. } => "execute_related_bundle",
            Request::LaunchApprovedExe { .. } => "launch_approved_exe",
            Request::Terminate => "terminate",
        }
    }
}

/// Successful result of a request
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "response", rename_all = "snake_case")]
pub enum Response {
    Done,
    Path { path: PathBuf },
    Restart { restart: Restart },
    Launched { pid: u32 },
}

/// Companion to primary, on the RPC channel
#[derive(Debug, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CompanionMessage {
    Cache { id: String, message: CacheMessage },
    Progress { package_id: String, percent: u8 },
    Response { response: Response },
    Failed { error: BootstrapError },
}

/// Primary's answer to a notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentReply {
    pub cancel: bool,
}
