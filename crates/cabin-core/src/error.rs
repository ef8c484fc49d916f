//! Error types for the agent.
//!
//! Every failure that can be surfaced to a client maps to one of the wire
//! error codes via [`AgentError::code`]; everything else collapses to
//! `INTERNAL_ERROR`.

/// The main error type for agent operations.
#[derive(Debug, thiserror::Error)]
pub enum AgentError {
    /// The operation envelope carried an unrecognised `type` tag.
    #[error("Unknown operation type: {0}")]
    InvalidOperation(String),

    /// A filesystem operation failed (syscall error, missing required
    /// field, unsupported encoding, …).
    #[error("{0}")]
    Filesystem(String),

    /// A process operation failed (unknown pid, missing stream handle,
    /// helper binary not found, …).
    #[error("{0}")]
    Process(String),

    /// A watch operation failed (glob or watcher initialisation error).
    #[error("{0}")]
    Watch(String),

    /// Token verification failed or the token was missing.
    #[error("{0}")]
    Auth(String),

    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Invalid configuration value
    #[error("Invalid configuration for '{field}': {message}")]
    InvalidConfig { field: String, message: String },

    /// Orchestrator (machine control plane) errors
    #[error("Orchestrator error: {0}")]
    Orchestrator(String),

    /// The orchestrator does not know the requested machine.
    #[error("Machine not found: {0}")]
    MachineNotFound(String),

    /// HTTP client errors (wraps reqwest errors)
    #[error("HTTP client error: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// JSON serialization errors (wraps serde_json errors)
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl AgentError {
    /// Create a filesystem error with a message
    pub fn filesystem<S: Into<String>>(message: S) -> Self {
        Self::Filesystem(message.into())
    }

    /// Create a process error with a message
    pub fn process<S: Into<String>>(message: S) -> Self {
        Self::Process(message.into())
    }

    /// The canonical unknown-pid error; the message always carries the pid.
    pub fn process_not_found(pid: u32) -> Self {
        Self::Process(format!("Process {} not found", pid))
    }

    /// Create a watch error with a message
    pub fn watch<S: Into<String>>(message: S) -> Self {
        Self::Watch(message.into())
    }

    /// Create an auth error with a message
    pub fn auth<S: Into<String>>(message: S) -> Self {
        Self::Auth(message.into())
    }

    /// Create a config error with a message
    pub fn config<S: Into<String>>(message: S) -> Self {
        Self::Config(message.into())
    }

    /// Create an invalid config error
    pub fn invalid_config<S: Into<String>>(field: S, message: S) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            message: message.into(),
        }
    }

    /// Create an orchestrator error
    pub fn orchestrator<S: Into<String>>(message: S) -> Self {
        Self::Orchestrator(message.into())
    }

    /// Create an internal error
    pub fn internal<S: Into<String>>(message: S) -> Self {
        Self::Internal(message.into())
    }

    /// The wire error code for this error, as carried in response
    /// envelopes (`error.code`).
    pub fn code(&self) -> &'static str {
        match self {
            Self::InvalidOperation(_) => "INVALID_OPERATION",
            Self::Filesystem(_) | Self::Io(_) => "FILESYSTEM_OPERATION_FAILED",
            Self::Process(_) => "PROCESS_OPERATION_FAILED",
            Self::Watch(_) => "WATCH_OPERATION_FAILED",
            Self::Auth(_) => "auth_error",
            _ => "INTERNAL_ERROR",
        }
    }
}

/// Result type alias for agent operations
pub type Result<T> = std::result::Result<T, AgentError>;
