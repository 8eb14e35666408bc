use thiserror::Error;

use crate::providers::types::ProviderError;

/// Errors surfaced by the chat core. All of them are recoverable where they occur.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChatError {
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Network error: {0}")]
    NetworkFailure(String),

    #[error("Failed to decode stream: {0}")]
    StreamDecodeFailure(String),

    #[error("Storage error: {0}")]
    StorageFailure(String),
}

impl From<ProviderError> for ChatError {
    fn from(err: ProviderError) -> Self {
        match err {
            ProviderError::InvalidResponse(msg) => ChatError::StreamDecodeFailure(msg),
            other => ChatError::NetworkFailure(other.to_string()),
        }
    }
}
