pub mod config;

use std::path::Path;

use serde::{Deserialize, Serialize};
use tokio::{fs, io};

/// Store key for the liveness flag the executor keeps asserting.
pub const LIVENESS_KEY: &str = "uploadWorkerHeartBeat";
/// Store key for the persisted file awaiting a retry.
pub const PENDING_KEY: &str = "fileToUpload";
/// Store key for the single-writer lease on the persisted file.
pub const LEASE_KEY: &str = "uploadLease";
/// Tag the coordinator registers its background-retry trigger under.
pub const RETRY_TAG: &str = "retryUpload";

pub const STATUS_DONE: &str = "Done";
pub const STATUS_FAILED: &str = "Failed";
pub const STATUS_RETRYING: &str = "Retrying Upload";

/// The only artifact exchanged on the message bus.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum Message {
    /// Executor accepted a file and begins the transfer.
    #[serde(rename_all = "camelCase")]
    Ready { file_name: String },
    /// Fractional bytes sent, in [0, 1].
    Progress { progress: f64 },
    /// Terminal or transient state description. `retry = true` requests
    /// failover scheduling from the coordinator.
    Status {
        status: String,
        #[serde(default)]
        retry: bool,
    },
    /// Liveness probe. The executor answers by writing the liveness flag,
    /// not by replying on the bus.
    HeartBeat,
    /// Instruction to continue/restart the pending transfer.
    ResumeUpload,
    /// Instruction to stop the executor immediately.
    Terminate,
}

/// A file handle as handed to the executor, and the payload persisted to the
/// store while an upload is incomplete.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UploadFile {
    pub name: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub async fn from_path(path: &Path) -> io::Result<Self> {
        let bytes = fs::read(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "upload.bin".to_string());
        Ok(Self { name, bytes })
    }
}
