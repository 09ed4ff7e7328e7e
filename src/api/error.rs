use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Request rejected: {0}")]
    Rejected(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Network error: {0}")]
    NetworkError(#[from] reqwest::Error),

    #[error("Invalid response: {0}")]
    InvalidResponse(String),
}

/// Coarse classification used by the session core.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    /// Could not reach the server, or it failed on its side
    Transport,
    /// Credentials, code or token were refused
    Authentication,
    /// Server answered 2xx with a body we can't use
    MalformedResponse,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

/// Error body shape used by the backend for every non-2xx response
#[derive(Debug, Deserialize)]
struct ErrorBody {
    message: Option<String>,
}

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            body.to_string()
        } else {
            let mut end = MAX_ERROR_BODY_LENGTH;
            while !body.is_char_boundary(end) {
                end -= 1;
            }
            format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
        }
    }

    /// Pull `{message}` out of an error body, falling back to the raw text
    fn extract_message(body: &str) -> String {
        match serde_json::from_str::<ErrorBody>(body) {
            Ok(ErrorBody { message: Some(message) }) if !message.trim().is_empty() => {
                Self::truncate_body(&message)
            }
            _ => Self::truncate_body(body),
        }
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let message = Self::extract_message(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized(message),
            403 => ApiError::AccessDenied(message),
            404 => ApiError::NotFound(message),
            429 => ApiError::RateLimited,
            400 | 409 | 422 => ApiError::Rejected(message),
            500..=599 => ApiError::ServerError(message),
            _ => ApiError::InvalidResponse(format!("Status {}: {}", status, message)),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            ApiError::NetworkError(e) if e.is_decode() => ErrorKind::MalformedResponse,
            ApiError::NetworkError(_) | ApiError::RateLimited | ApiError::ServerError(_) => {
                ErrorKind::Transport
            }
            ApiError::Unauthorized(_)
            | ApiError::AccessDenied(_)
            | ApiError::NotFound(_)
            | ApiError::Rejected(_) => ErrorKind::Authentication,
            ApiError::InvalidResponse(_) => ErrorKind::MalformedResponse,
        }
    }

    /// Failures worth retrying: the request may succeed unchanged later
    pub fn is_transient(&self) -> bool {
        self.kind() == ErrorKind::Transport
    }

    /// Message suitable for the login form
    pub fn user_message(&self) -> String {
        match self {
            ApiError::Unauthorized(msg) | ApiError::Rejected(msg) | ApiError::AccessDenied(msg)
                if !msg.is_empty() =>
            {
                msg.clone()
            }
            ApiError::Unauthorized(_) | ApiError::Rejected(_) => {
                "Invalid email or password".to_string()
            }
            ApiError::AccessDenied(_) => "Access denied".to_string(),
            ApiError::NetworkError(e) if e.is_timeout() => {
                "Connection timed out. Please try again.".to_string()
            }
            ApiError::NetworkError(e) if e.is_decode() => {
                "Unexpected response from server. Please try again.".to_string()
            }
            ApiError::NetworkError(_) => {
                "Unable to connect to server. Check your internet connection.".to_string()
            }
            ApiError::RateLimited => "Too many attempts. Please wait and try again.".to_string(),
            ApiError::InvalidResponse(_) => {
                "Unexpected response from server. Please try again.".to_string()
            }
            ApiError::NotFound(_) | ApiError::ServerError(_) => {
                format!("Login failed: {}", self)
            }
        }
    }
}
