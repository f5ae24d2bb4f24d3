//! Error types for mail-ingest.

use std::time::Duration;

/// Top-level error type for the service.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Database error: {0}")]
    Database(#[from] DatabaseError),

    #[error("Mail source error: {0}")]
    Source(#[from] SourceError),

    #[error("Normalization error: {0}")]
    Normalize(#[from] NormalizeError),

    #[error("LLM error: {0}")]
    Llm(#[from] LlmError),

    #[error("Boundary error: {0}")]
    Boundary(#[from] BoundaryError),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Configuration-related errors. Fatal at startup.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required configuration: {key}. {hint}")]
    MissingRequired { key: String, hint: String },

    #[error("Invalid configuration value for {key}: {message}")]
    InvalidValue { key: String, message: String },
}

/// Database-related errors.
#[derive(Debug, thiserror::Error)]
pub enum DatabaseError {
    #[error("Connection pool error: {0}")]
    Pool(String),

    #[error("Query failed: {0}")]
    Query(String),

    #[error("Entity not found: {entity} with id {id}")]
    NotFound { entity: String, id: String },

    #[error("Transaction failed: {0}")]
    Transaction(String),

    #[error("Migration failed: {0}")]
    Migration(String),
}

/// Mailbox transport errors.
#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Mailbox {host} unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("Authentication failed for {user}")]
    AuthFailed { user: String },

    #[error("IMAP command {command} failed: {reason}")]
    Command { command: String, reason: String },

    #[error("IMAP protocol error: {0}")]
    Protocol(String),

    #[error("Not connected")]
    NotConnected,

    #[error("TLS error: {0}")]
    Tls(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Raised only when a raw blob cannot be read as a message at all.
#[derive(Debug, thiserror::Error)]
pub enum NormalizeError {
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// LLM provider errors.
#[derive(Debug, thiserror::Error)]
pub enum LlmError {
    #[error("Provider {provider} request failed: {reason}")]
    RequestFailed { provider: String, reason: String },

    #[error("Invalid response from {provider}: {reason}")]
    InvalidResponse { provider: String, reason: String },

    #[error("Provider {provider} timed out after {timeout:?}")]
    Timeout { provider: String, timeout: Duration },

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Errors crossing the fetcher → parser boundary.
///
/// Any of these means the message was NOT durably processed.
#[derive(Debug, thiserror::Error)]
pub enum BoundaryError {
    #[error("Processing boundary unreachable: {0}")]
    Unreachable(String),

    #[error("Processing boundary timed out after {0:?}")]
    Timeout(Duration),

    #[error("Processing boundary rejected message ({status}): {detail}")]
    Rejected { status: u16, detail: String },

    #[error("Unexpected response from processing boundary: {0}")]
    InvalidResponse(String),

    #[error("Pipeline error: {0}")]
    Pipeline(#[from] PipelineError),
}

/// Pipeline-related errors, raised by the processing side.
#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Malformed input: {0}")]
    Malformed(#[from] NormalizeError),

    #[error("Persistence failed: {0}")]
    Persistence(#[from] DatabaseError),
}

impl PipelineError {
    /// Malformed input resurfaces identically on retry; persistence
    /// failures may succeed on the next cycle.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Persistence(_))
    }
}

/// Result type alias for the service.
pub type Result<T> = std::result::Result<T, Error>;
