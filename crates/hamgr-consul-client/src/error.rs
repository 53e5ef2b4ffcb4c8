// Error types for the lock client

/// Errors that can occur while talking to the lock provider
#[derive(Debug, thiserror::Error)]
pub enum ConsulError {
    /// The session used for a lock operation no longer exists. Raised when the
    /// session was destroyed explicitly or reaped after its check failed.
    #[error("session '{0}' not found")]
    SessionNotFound(String),

    #[error("{0} not found")]
    NotFound(String),

    #[error("request failed with status {status}: {body}")]
    RequestFailed { status: u16, body: String },

    #[error("lock provider unavailable: {0}")]
    Unavailable(String),

    #[error("all servers failed")]
    AllServersFailed,

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("decode error: {0}")]
    Decode(#[from] base64::DecodeError),
}

impl ConsulError {
    pub fn is_session_not_found(&self) -> bool {
        matches!(self, ConsulError::SessionNotFound(_))
    }
}

pub type Result<T> = std::result::Result<T, ConsulError>;
