use serde::{Deserialize, Serialize};

/// Errors crossing crate boundaries, suitable for transport to a UI layer.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error, Serialize, Deserialize)]
pub enum LookoutError {
    #[error("transport: {0}")]
    Transport(String),
    #[error("authorization: {0}")]
    Authorization(String),
    #[error("malformed_payload: {0}")]
    MalformedPayload(String),
    /// The requested resourceVersion is no longer served; the kind must be relisted.
    #[error("expired: {0}")]
    Expired(String),
    #[error("closed: {0}")]
    Closed(String),
}

pub type LookoutResult<T> = Result<T, LookoutError>;

/// Coarse classification used by the error channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorClass {
    Transport,
    Authorization,
    Staleness,
    Payload,
    Lifecycle,
}

impl LookoutError {
    pub fn class(&self) -> ErrorClass {
        match self {
            LookoutError::Transport(_) => ErrorClass::Transport,
            LookoutError::Authorization(_) => ErrorClass::Authorization,
            LookoutError::MalformedPayload(_) => ErrorClass::Payload,
            LookoutError::Expired(_) => ErrorClass::Staleness,
            LookoutError::Closed(_) => ErrorClass::Lifecycle,
        }
    }

    /// Whether retry/backoff/degradation can handle this without asking the user.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, LookoutError::Transport(_) | LookoutError::Expired(_))
    }
}
