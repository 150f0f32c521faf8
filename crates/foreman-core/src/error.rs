use uuid::Uuid;

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// The domain error taxonomy.
///
/// The first three variants surface as 4xx-ish responses at the API
/// boundary and are never escalated to alarms. Store and broker failures
/// propagate to the caller; background loops catch and log them.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("QueueNotFound: queue '{0}' not found")]
    QueueNotFound(String),

    #[error("QueueInactive: queue '{0}' is not active")]
    QueueInactive(String),

    #[error("TaskNotFound: task '{0}' not found")]
    TaskNotFound(Uuid),

    #[error("invalid task submission: {0}")]
    InvalidSubmission(String),

    #[error("broker request failed: {0}")]
    Broker(String),

    #[error(transparent)]
    Store(#[from] sqlx::Error),

    #[error("handler failed: {0}")]
    Handler(String),
}

impl Error {
    /// Whether the error is a caller mistake rather than a system fault.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::QueueNotFound(_)
                | Self::QueueInactive(_)
                | Self::TaskNotFound(_)
                | Self::InvalidSubmission(_)
        )
    }
}
