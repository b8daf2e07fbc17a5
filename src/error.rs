//! Error types for the conversation core.

/// Top-level error type for the companion.
#[derive(Debug, thiserror::Error)]
pub enum CompanionError {
    /// Model provider request or response error.
    #[error("provider error: {0}")]
    Provider(String),

    /// Error while reading a provider event stream.
    #[error("stream error: {0}")]
    Stream(String),

    /// Retrieval store error.
    #[error("knowledge error: {0}")]
    Knowledge(String),

    /// Configuration error.
    #[error("config error: {0}")]
    Config(String),

    /// Error raised by a hook callback.
    #[error("hook error: {0}")]
    Hook(String),

    /// Conversation history storage error.
    #[error("history error: {0}")]
    History(String),

    /// Pipeline coordination error.
    #[error("pipeline error: {0}")]
    Pipeline(String),

    /// I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Convenience result type.
pub type Result<T> = std::result::Result<T, CompanionError>;
