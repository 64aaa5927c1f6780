use thiserror::Error;

/// Everything that can go wrong inside the engine.
///
/// Variants map one-to-one onto the conditions the engine either
/// surfaces to the host application or recovers from internally.
/// Recovered conditions (`AckTimeout`, `PeerDisconnect`) still exist
/// as variants so internal call sites can report them uniformly.
#[derive(Debug, Error)]
pub enum EngineError {
    /// The system RNG refused to produce bytes. Never falls back to a
    /// weaker source; the session cannot start.
    #[error("system RNG unavailable")]
    RngUnavailable,

    #[error("failed to bind listener: {0}")]
    BindFailed(#[source] std::io::Error),

    #[error("malformed control frame: {0}")]
    MalformedFrame(#[source] serde_json::Error),

    /// The stream ended while payload bytes were still owed.
    #[error("payload truncated: expected {expected} more bytes")]
    TruncatedPayload { expected: u64 },

    #[error("protocol violation: {0}")]
    ProtocolViolation(String),

    /// The peer never completed authentication inside the deadline.
    #[error("authentication timed out")]
    AuthTimeout,

    /// The sender rejected our session code.
    #[error("invalid connection code")]
    InvalidCode,

    /// The sender reported a fatal error that was not a code mismatch.
    #[error("remote error: {0}")]
    Remote(String),

    #[error("connection refused")]
    ConnectRefused,

    #[error("connection timed out")]
    ConnectTimeout,

    #[error("host not found")]
    HostNotFound,

    #[error("i/o error: {0}")]
    Io(#[from] std::io::Error),

    /// A per-file acknowledgement did not arrive in time. Soft: the
    /// sender logs and moves on.
    #[error("acknowledgement timed out for {file_name}")]
    AckTimeout { file_name: String },

    #[error("peer disconnected")]
    PeerDisconnect,

    #[error("channel closed")]
    ChannelClosed,

    #[error("operation cancelled")]
    Cancelled,

    /// The requested operation is illegal in the session's current
    /// state (e.g. `send_files` with no authenticated peer).
    #[error("invalid state: {0}")]
    InvalidState(&'static str),
}

impl EngineError {
    /// Classify a TCP connect failure into the taxonomy.
    pub fn from_connect_error(err: std::io::Error) -> Self {
        match err.kind() {
            std::io::ErrorKind::ConnectionRefused => Self::ConnectRefused,
            std::io::ErrorKind::TimedOut => Self::ConnectTimeout,
            std::io::ErrorKind::NotFound => Self::HostNotFound,
            _ => Self::Io(err),
        }
    }
}
