use std::time::Duration;

use tracing::warn;

/// Service type advertised and browsed on the local link.
pub const SERVICE_TYPE: &str = "file-transfer";

/// Protocol version reported in the advertisement TXT record.
pub const PROTOCOL_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Tunables recognised by the engine. `Default` gives the production
/// values; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Listener port; 0 binds an ephemeral port.
    pub port: u16,
    /// Read-block size for local TCP streaming.
    pub chunk_size: usize,
    /// Chunk size for the remote channel protocol.
    pub remote_chunk_size: usize,
    /// Remote sliding-window width, in chunks.
    pub window_size: u64,
    /// Hard deadline for an accepted socket to authenticate.
    pub auth_timeout: Duration,
    /// Soft per-file wait for the receiver's `file-saved`.
    pub ack_timeout: Duration,
    /// How long `browse` accumulates discovery events.
    pub discovery_window: Duration,
    /// Local files at or under this size are buffered in memory;
    /// larger ones stream through a temp file.
    pub memory_buffer_limit: u64,
    /// Remote receive buffers flush to the write queue at this size.
    pub remote_flush_threshold: usize,
    /// Bound on pending flushes in a per-transfer write queue.
    pub write_queue_depth: usize,
    /// Soft wait for the window to open before sending the next
    /// remote chunk.
    pub chunk_ack_timeout: Duration,
    /// Soft wait for the final remote ack before `file-complete`.
    pub final_ack_timeout: Duration,
    /// Bound on write-queue drain after the last remote chunk.
    pub drain_timeout: Duration,
    /// Grace period for in-flight messages after `disconnect-request`.
    pub disconnect_grace: Duration,
    /// Minimum interval between progress events (whole-percent jumps
    /// are always reported).
    pub progress_interval: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            port: 0,
            chunk_size: 64 * 1024,
            remote_chunk_size: 256 * 1024,
            window_size: 20,
            auth_timeout: Duration::from_secs(10),
            ack_timeout: Duration::from_secs(30),
            discovery_window: Duration::from_secs(3),
            memory_buffer_limit: 8 * 1024 * 1024,
            remote_flush_threshold: 1024 * 1024,
            write_queue_depth: 5,
            chunk_ack_timeout: Duration::from_secs(5),
            final_ack_timeout: Duration::from_secs(3),
            drain_timeout: Duration::from_secs(10),
            disconnect_grace: Duration::from_millis(100),
            progress_interval: Duration::from_millis(100),
        }
    }
}

impl EngineConfig {
    /// Defaults overlaid with `DRIFT_*` environment variables.
    /// Unparsable values are ignored with a warning.
    pub fn from_env() -> Self {
        let mut cfg = Self::default();
        if let Some(v) = env_parse::<u16>("DRIFT_PORT") {
            cfg.port = v;
        }
        if let Some(v) = env_parse::<usize>("DRIFT_CHUNK_SIZE") {
            cfg.chunk_size = v;
        }
        if let Some(v) = env_parse::<u64>("DRIFT_WINDOW_SIZE") {
            cfg.window_size = v;
        }
        if let Some(v) = env_parse::<u64>("DRIFT_AUTH_TIMEOUT_MS") {
            cfg.auth_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("DRIFT_ACK_TIMEOUT_MS") {
            cfg.ack_timeout = Duration::from_millis(v);
        }
        if let Some(v) = env_parse::<u64>("DRIFT_DISCOVERY_WINDOW_MS") {
            cfg.discovery_window = Duration::from_millis(v);
        }
        cfg
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    let raw = std::env::var(key).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!("ignoring unparsable {}={:?}", key, raw);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_contract() {
        let cfg = EngineConfig::default();
        assert_eq!(cfg.port, 0);
        assert_eq!(cfg.chunk_size, 65_536);
        assert_eq!(cfg.remote_chunk_size, 262_144);
        assert_eq!(cfg.window_size, 20);
        assert_eq!(cfg.auth_timeout, Duration::from_secs(10));
        assert_eq!(cfg.ack_timeout, Duration::from_secs(30));
        assert_eq!(cfg.discovery_window, Duration::from_secs(3));
    }
}
