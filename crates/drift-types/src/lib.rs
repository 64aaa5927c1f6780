//! Shared types for the Drift transfer engine: configuration, the
//! public event vocabulary, the error taxonomy, session codes, and
//! file naming.

pub mod code;
pub mod config;
pub mod error;
pub mod events;
pub mod models;
pub mod savepath;

pub use code::SessionCode;
pub use config::EngineConfig;
pub use error::EngineError;
pub use events::{EngineEvent, Mode, ProgressGate, percent_done};
pub use models::{ConnectionInfo, TransferMetadata};
pub use savepath::collision_free_path;
