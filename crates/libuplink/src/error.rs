use thiserror::Error;
use uplink_protocol::{ErrorCode, SessionId};

#[derive(Error, Debug)]
pub enum UplinkError {
    #[error("session not found: {0}")]
    SessionNotFound(SessionId),

    #[error("session already terminated: {0}")]
    SessionExited(SessionId),

    #[error("failed to spawn subprocess: {0}")]
    SpawnFailed(String),

    #[error("stale response: submitted for prompt {submitted}, outstanding is {outstanding}")]
    PromptStale { submitted: u64, outstanding: u64 },

    #[error("no prompt outstanding")]
    NoPromptOutstanding,

    #[error("a prompt is already outstanding")]
    PromptOverlap,

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl UplinkError {
    /// Convert to protocol error code and sanitized message.
    pub fn to_error_code(&self) -> (ErrorCode, String) {
        match self {
            UplinkError::SessionNotFound(_) => (ErrorCode::SessionNotFound, self.to_string()),
            UplinkError::SessionExited(_) => (ErrorCode::SessionExited, self.to_string()),
            UplinkError::SpawnFailed(_) => (ErrorCode::SpawnFailed, self.to_string()),
            UplinkError::PromptStale { .. } => (ErrorCode::PromptStale, self.to_string()),
            UplinkError::NoPromptOutstanding => (ErrorCode::NoPromptOutstanding, self.to_string()),
            UplinkError::PromptOverlap => (ErrorCode::ServerError, self.to_string()),
            UplinkError::Io(_) => (ErrorCode::ServerError, "internal I/O error".to_string()),
        }
    }
}
