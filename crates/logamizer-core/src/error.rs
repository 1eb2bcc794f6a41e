/// Logamizer error types
#[derive(Debug, thiserror::Error)]
pub enum LogamizerError {
    #[error("decode failed: {0}")]
    Decode(String),

    #[error("unsupported log format: {0}")]
    UnknownFormat(String),

    #[error("site not found: {0}")]
    SiteNotFound(String),

    #[error("log file not found: {0}")]
    LogFileNotFound(String),

    #[error("a job is already running for log file {0}")]
    JobInFlight(String),

    #[error("persistence error: {message}")]
    Persistence { message: String, transient: bool },

    #[error("job deadline exceeded")]
    DeadlineExceeded,

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl LogamizerError {
    /// A transient persistence failure, safe to retry.
    pub fn transient(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            transient: true,
        }
    }

    /// A permanent persistence failure.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self::Persistence {
            message: message.into(),
            transient: false,
        }
    }

    /// Whether the driver should retry the failed operation.
    pub fn is_transient(&self) -> bool {
        matches!(self, Self::Persistence { transient: true, .. })
    }
}
