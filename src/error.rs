//! Error types for the vigil client

use thiserror::Error;

/// Result type alias for vigil operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in the vigil client
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Microphone or audio channel could not be revoked from its prior owner
    /// in time; the grant proceeds anyway
    #[error("resource conflict: {0}")]
    ResourceConflict(String),

    /// Speech engine failed during active capture
    #[error("capture error: {0}")]
    Capture(String),

    /// Network or server error on the main assistant request
    #[error("remote error: {0}")]
    Remote(String),

    /// Keyword-spotting process failed to (re)start
    #[error("liveness error: {0}")]
    Liveness(String),

    /// Audio device or codec error
    #[error("audio error: {0}")]
    Audio(String),

    /// Playback error
    #[error("playback error: {0}")]
    Playback(String),

    /// IO error
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP error
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// TOML parsing error
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),
}
