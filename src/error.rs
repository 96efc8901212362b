//! Error types for backhaul

use thiserror::Error;

/// Main error type for the backhaul library
#[derive(Error, Debug)]
pub enum Error {
    /// SQLite error from the default persistent store
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    /// Generic persistent-store error (external implementations)
    #[error("store error: {0}")]
    Store(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON serialization/deserialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Encryption or decryption failure in the at-rest codec
    #[error("crypto error: {0}")]
    Crypto(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    Config(String),

    /// Transport/API error
    #[error("transport error: {0}")]
    Transport(String),

    /// An offline session is already open; close it before opening another
    #[error("offline session {0} is already open")]
    SessionAlreadyOpen(i64),

    /// Server response did not have the expected shape
    #[error("malformed server response: {0}")]
    Response(String),

    /// The backlog service task has stopped; its handle is no longer usable
    #[error("backlog service is not running")]
    ServiceStopped,
}

/// Result type alias for the backhaul library
pub type Result<T> = std::result::Result<T, Error>;
