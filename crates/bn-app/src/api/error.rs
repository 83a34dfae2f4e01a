use thiserror::Error;
use crate::tracker::retry::Retryable;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),
    #[error("Request timed out")]
    TimedOut,
    #[error("HTTP {status}: {body}")]
    Http { status: u16, body: String },
    #[error("Malformed response: {0}")]
    Decode(String),
    #[error("Client error: {0}")]
    Client(String),
}

impl Retryable for ApiError {
    fn is_retryable(&self) -> bool {
        match self {
            Self::Network(_) | Self::TimedOut => true,
            Self::Http { status, .. } => matches!(*status, 408 | 429) || (500..600).contains(status),
            Self::Decode(_) | Self::Client(_) => false,
        }
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_timeout() {
            Self::TimedOut
        } else if err.is_builder() {
            Self::Client(err.to_string())
        } else if err.is_decode() {
            Self::Decode(err.to_string())
        } else if let Some(status) = err.status() {
            Self::Http { status: status.as_u16(), body: err.to_string() }
        } else {
            Self::Network(err.to_string())
        }
    }
}
