use crate::domain_port::{StoreError, TransportError};

#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    #[error("network error: {0}")]
    Network(String),
    /// Non-401 failure; `message` is the server's message when it sent one.
    #[error("{message}")]
    Http { status: u16, message: String },
    #[error("Authentication failed")]
    AuthenticationFailed,
    #[error("invalid response body: {0}")]
    Decode(String),
    #[error("store error: {0}")]
    Store(String),
    #[error("session ended before the operation completed")]
    Superseded,
}

impl SessionError {
    /// Whether the outer retry loop may try the call again.
    pub fn is_retryable(&self) -> bool {
        !matches!(
            self,
            SessionError::AuthenticationFailed | SessionError::Superseded
        )
    }
}

impl From<StoreError> for SessionError {
    fn from(error: StoreError) -> Self {
        SessionError::Store(error.to_string())
    }
}

impl From<TransportError> for SessionError {
    fn from(error: TransportError) -> Self {
        SessionError::Network(error.to_string())
    }
}
