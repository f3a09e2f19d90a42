use std::sync::Arc;
use thiserror::Error;

/// Unified error type for the Warden DNS resolver
#[derive(Debug, Clone, Error)]
pub enum WardenError {
    // IO errors
    #[error("IO error: {0}")]
    Io(String),
    #[error("IO error: {0}")]
    IoError(Arc<std::io::Error>),

    // Configuration errors
    #[error("Invalid bind address: {0}")]
    InvalidBindAddress(String),
    #[error("Invalid upstream: {0}")]
    InvalidUpstream(String),
    #[error("Invalid cache size: {0}")]
    InvalidCacheSize(String),
    #[error("Invalid timeout: {0}")]
    InvalidTimeout(String),
    #[error("Configuration parse error: {0}")]
    ConfigParseError(String),

    // Wire format errors
    #[error("Invalid DNS header")]
    InvalidHeader,
    #[error("Invalid DNS label")]
    InvalidLabel,
    #[error("Invalid question section")]
    InvalidQuestionSection,
    #[error("Invalid record section")]
    InvalidRecordSection,
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // Cache errors
    #[error("Cache read failure: {0}")]
    CacheRead(String),
    #[error("Cache write failure: {0}")]
    CacheWrite(String),
    #[error("Counter failure: {0}")]
    Counter(String),
    #[error("Refresh lock failure: {0}")]
    Lock(String),
    #[error("Redis error: {0}")]
    Redis(String),

    // Upstream errors
    #[error("Upstream transport failure ({upstream}): {message}")]
    UpstreamTransport { upstream: String, message: String },
    #[error("Upstream returned SERVFAIL ({0})")]
    UpstreamServfail(String),
    #[error("Truncation fallback failed ({upstream}): {message}")]
    TruncationFallback { upstream: String, message: String },
    #[error("No upstream available")]
    NoUpstreamAvailable,

    // Background work errors
    #[error("Refresh upstream failure: {0}")]
    RefreshUpstream(String),
    #[error("Sweep failure: {0}")]
    Sweep(String),
    #[error("Expiry index reconcile failure: {0}")]
    IndexReconcile(String),

    // Client-facing terminal errors
    #[error("Failed to write response to client: {0}")]
    WriteToClient(String),

    #[error("Operation timed out")]
    Timeout,
    #[error("Server is shutting down")]
    ServerShutdown,
}

impl From<std::io::Error> for WardenError {
    fn from(err: std::io::Error) -> Self {
        WardenError::IoError(Arc::new(err))
    }
}

impl From<redis::RedisError> for WardenError {
    fn from(err: redis::RedisError) -> Self {
        WardenError::Redis(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, WardenError>;
