use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};

/// Which half of a session this side is playing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    Sender,
    Receiver,
}

/// Events published to the host application.
///
/// These are immutable records fanned out over a broadcast channel;
/// observers never mutate engine state through them.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", content = "data", rename_all = "kebab-case")]
pub enum EngineEvent {
    /// A peer authenticated (or the connection was torn down).
    ConnectionStatus { connected: bool, mode: Mode },

    /// The transport dropped mid-session.
    ConnectionLost { mode: Mode, reason: String },

    /// Periodic progress for the file currently in flight.
    #[serde(rename_all = "camelCase")]
    TransferProgress {
        file_name: String,
        /// Whole percent, 0–100.
        progress: u8,
        #[serde(skip_serializing_if = "Option::is_none")]
        sent_bytes: Option<u64>,
        #[serde(skip_serializing_if = "Option::is_none")]
        received_bytes: Option<u64>,
        total_bytes: u64,
        current_file: usize,
        total_files: usize,
        /// Bytes per second since the file started, when known.
        #[serde(skip_serializing_if = "Option::is_none")]
        speed: Option<u64>,
    },

    /// A file is durably on the receiver's disk.
    #[serde(rename_all = "camelCase")]
    FileReceived {
        file_name: String,
        file_size: u64,
        save_path: String,
        current_file: usize,
        total_files: usize,
    },

    /// Every file in the batch was acknowledged.
    TransferComplete {},

    /// The current operation failed in a way the host should show.
    TransferError { message: String },
}

/// Throttle for progress emission: an update passes when the
/// configured interval has elapsed or the whole-percent value moved,
/// whichever comes first.
#[derive(Debug)]
pub struct ProgressGate {
    interval: Duration,
    last_emit: Option<Instant>,
    last_percent: Option<u8>,
}

impl ProgressGate {
    pub fn new(interval: Duration) -> Self {
        Self {
            interval,
            last_emit: None,
            last_percent: None,
        }
    }

    /// Whether an update at `percent` should be published now.
    pub fn admit(&mut self, percent: u8) -> bool {
        let now = Instant::now();
        let interval_due = self
            .last_emit
            .is_none_or(|at| now.duration_since(at) >= self.interval);
        let percent_moved = self.last_percent != Some(percent);
        if interval_due || percent_moved {
            self.last_emit = Some(now);
            self.last_percent = Some(percent);
            true
        } else {
            false
        }
    }
}

/// Whole-percent completion for `done` of `total` bytes. Zero-byte
/// totals count as complete.
pub fn percent_done(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    ((done.saturating_mul(100)) / total).min(100) as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gate_admits_first_update_and_percent_moves() {
        let mut gate = ProgressGate::new(Duration::from_secs(3600));
        assert!(gate.admit(0));
        assert!(!gate.admit(0));
        assert!(gate.admit(1));
        assert!(!gate.admit(1));
        assert!(gate.admit(100));
    }

    #[test]
    fn percent_done_handles_edges() {
        assert_eq!(percent_done(0, 0), 100);
        assert_eq!(percent_done(0, 10), 0);
        assert_eq!(percent_done(5, 10), 50);
        assert_eq!(percent_done(10, 10), 100);
        assert_eq!(percent_done(20, 10), 100);
    }

    #[test]
    fn events_serialise_with_documented_tags() {
        let event = EngineEvent::ConnectionStatus {
            connected: true,
            mode: Mode::Sender,
        };
        let json = serde_json::to_value(&event).expect("serialise");
        assert_eq!(json["type"], "connection-status");
        assert_eq!(json["data"]["mode"], "sender");

        let event = EngineEvent::TransferProgress {
            file_name: "photo.jpg".into(),
            progress: 42,
            sent_bytes: Some(420),
            received_bytes: None,
            total_bytes: 1000,
            current_file: 1,
            total_files: 3,
            speed: Some(512),
        };
        let json = serde_json::to_value(&event).expect("serialise");
        assert_eq!(json["type"], "transfer-progress");
        assert_eq!(json["data"]["fileName"], "photo.jpg");
        assert_eq!(json["data"]["totalBytes"], 1000);
        assert!(json["data"].get("receivedBytes").is_none());
    }
}
