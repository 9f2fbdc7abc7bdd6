//! Error types for the orchestration core.

/// Top-level error type for collectors, the scheduler, and the transfer queue.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Snapshot cache or settings store persistence error.
    #[error("persistence error: {0}")]
    Persistence(String),

    /// Status collector error.
    #[error("collector error: {0}")]
    Collector(String),

    /// Scheduled task handler error.
    #[error("handler error: {0}")]
    Handler(String),

    /// File transfer error.
    #[error("transfer error: {0}")]
    Transfer(String),

    /// Notification delivery error.
    #[error("notify error: {0}")]
    Notify(String),

    /// Remote shell (ssh) error.
    #[error("shell error: {0}")]
    Shell(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON (de)serialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, OrchestratorError>;

/// Render a caught panic payload as a message.
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_owned()
    }
}
