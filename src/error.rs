//! Common error types for the generation gateway

use thiserror::Error;

/// Application-wide error type
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    #[error("Event stream error: {0}")]
    Stream(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("TLS error: {0}")]
    Tls(#[from] native_tls::Error),

    #[error("Authentication rejected by instance {url}")]
    AuthRejected { url: String },

    #[error("Failed to connect to instance {url}: {reason}")]
    ConnectionFailed { url: String, reason: String },

    #[error("No available instances")]
    NoAvailableInstances,

    #[error("Generation request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("Upload request failed with status {status}: {body}")]
    UploadFailed { status: u16, body: String },

    #[error("No connected instance for prompt {0}")]
    UnknownPrompt(String),

    #[error("Engine reported an error: {0}")]
    EngineFailure(String),

    #[error("Instance {url} dropped an in-flight generation")]
    InstanceInterrupted { url: String },

    #[error("Hook callback failed: {0}")]
    Hook(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl GatewayError {
    /// True for the failure kind callers may answer by resubmitting the job
    /// on a freshly selected instance.
    pub fn is_interruption(&self) -> bool {
        matches!(self, GatewayError::InstanceInterrupted { .. })
    }
}

/// Result type alias for convenience
pub type Result<T> = std::result::Result<T, GatewayError>;
