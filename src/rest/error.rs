//! Error types for the REST compute API client.

use serde::Deserialize;
use thiserror::Error;

use crate::remote::ApiError;

/// Errors raised by [`super::RestComputeApi`].
#[derive(Clone, Debug, Error, Eq, PartialEq)]
pub enum RestApiError {
    /// Raised when the client configuration is unusable.
    #[error("configuration error: {0}")]
    Config(String),
    /// Raised when the API answers 404.
    #[error("{resource} not found")]
    NotFound {
        /// Request path that was not found.
        resource: String,
    },
    /// Raised for any other non-success status.
    #[error("API returned HTTP {status}: {message}")]
    Http {
        /// HTTP status code.
        status: u16,
        /// Message extracted from the response body.
        message: String,
    },
    /// Raised when the request could not be sent or the body not read.
    #[error("transport error: {message}")]
    Transport {
        /// Message returned by the HTTP client.
        message: String,
    },
    /// Raised when a success body does not match the expected shape.
    #[error("failed to decode response from {path}: {message}")]
    Decode {
        /// Request path.
        path: String,
        /// Parser message.
        message: String,
    },
}

impl ApiError for RestApiError {
    fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }
}

impl From<reqwest::Error> for RestApiError {
    fn from(value: reqwest::Error) -> Self {
        Self::Transport {
            message: value.to_string(),
        }
    }
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

/// Maps a response status and body to the body on success or a typed error.
pub(super) fn classify(status: u16, path: &str, body: String) -> Result<String, RestApiError> {
    match status {
        200..=299 => Ok(body),
        404 => Err(RestApiError::NotFound {
            resource: path.to_owned(),
        }),
        _ => Err(RestApiError::Http {
            status,
            message: error_message(&body),
        }),
    }
}

fn error_message(body: &str) -> String {
    if let Ok(parsed) = serde_json::from_str::<ErrorBody>(body) {
        return parsed.message;
    }
    let trimmed = body.trim();
    if trimmed.is_empty() {
        String::from("no response body")
    } else {
        trimmed.to_owned()
    }
}
