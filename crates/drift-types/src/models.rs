use serde::{Deserialize, Serialize};

/// What a sender publishes after binding its listener: enough for a
/// peer to connect and authenticate.
///
/// In remote mode `address` is the literal `"REMOTE"`, `port` is 0
/// and `code` carries the rendezvous peer identity instead of a
/// session code.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionInfo {
    pub address: String,
    pub port: u16,
    pub code: String,
    pub hostname: String,
}

/// Per-file header sent ahead of the payload bytes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransferMetadata {
    pub file_name: String,
    pub file_size: u64,
    /// 1-based index of this file in the batch.
    pub current_file: usize,
    pub total_files: usize,
}
