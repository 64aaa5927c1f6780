use serde::{Deserialize, Serialize};

use drift_types::TransferMetadata;

/// Control frames on a local TCP session.
///
/// Each frame is one JSON record followed by the four-NUL delimiter.
/// Payload bytes between `metadata` and `file-end` never pass through
/// this type; the codec hands them out as opaque byte runs.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum ControlFrame {
    /// Receiver → sender, once, immediately after connect.
    Auth { code: String },
    /// Sender → receiver on code match.
    AuthSuccess,
    /// Sender → receiver, fatal; the socket closes after this.
    Error { message: String },
    /// Announces the next file; exactly `file_size` payload bytes
    /// follow before `file-end`.
    Metadata(TransferMetadata),
    /// Marks the end of the current file's payload run.
    FileEnd,
    /// Receiver → sender after the file is durably written.
    FileSaved,
}

/// The message a sender puts in its `error` frame on a bad code.
/// Receivers match on it to distinguish `INVALID_CODE` from other
/// remote failures.
pub const INVALID_CODE_MESSAGE: &str = "Invalid connection code";
