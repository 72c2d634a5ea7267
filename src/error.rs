//! Error types for the turtle daemon.

use thiserror::Error;

/// Errors that can occur across the daemon's operations.
///
/// The dispatcher flattens these into a plain `ErrorMessage` string at the
/// wire boundary; internally the variants stay tagged so callers can react
/// to the kind.
#[derive(Debug, Error)]
pub enum Error {
    /// Bad input (names, ports, volume strings, request payloads).
    #[error("{0}")]
    Validation(String),

    /// Unknown app or backup.
    #[error("{0}")]
    NotFound(String),

    /// Another task is already running on the app.
    #[error("another task is already running")]
    Busy,

    /// Required environment variables are not filled in yet.
    #[error("the app has to be set up first")]
    NotSetup,

    /// Manifest parse, validation or link-cycle failure.
    #[error("{0}")]
    Manifest(String),

    /// Container runtime surface.
    #[error("{0}")]
    Runtime(String),

    /// Copy-on-write filesystem surface.
    #[error("{0}")]
    Fs(String),

    /// Source clone/pull failure.
    #[error("{0}")]
    Source(String),

    /// The supervise loop gave up restarting the app's containers.
    /// `details` carries the indented stderr tail of every stopped container.
    #[error("failed to restart app: max restart retries reached! App '{app}' stopped running!{details}")]
    RestartExhausted { app: String, details: String },

    /// Aggregate of several independent failures (retention GC, state restore).
    #[error("{}", .0.join("\n"))]
    Multi(Vec<String>),

    /// Plain I/O outside the capability surfaces.
    #[error(transparent)]
    Io(#[from] std::io::Error),

    /// JSON encoding of a response payload failed.
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
}

/// Result type for daemon operations.
pub type Result<T> = std::result::Result<T, Error>;
