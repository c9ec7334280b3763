use thiserror::Error;

/// Errors surfaced to callers of [`ApiClient`](super::ApiClient).
///
/// Cloneable so that a single renewal failure can be handed to every request
/// queued behind it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ApiError {
    #[error("Network error: {0}")]
    Network(String),

    #[error("Unauthorized - token may be expired")]
    Unauthorized,

    #[error("Unauthorized after session renewal")]
    UnauthorizedAfterRenewal,

    #[error("Session renewal failed: {0}")]
    RenewalFailed(RenewalFailure),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    #[error("Resource not found: {0}")]
    NotFound(String),

    #[error("Rate limited - please wait before retrying")]
    RateLimited,

    #[error("Server error ({status}): {body}")]
    ServerError { status: u16, body: String },

    #[error("Request rejected ({status}): {body}")]
    Rejected { status: u16, body: String },

    #[error("Invalid response: {0}")]
    InvalidResponse(String),

    #[error("Invalid request: {0}")]
    InvalidRequest(String),
}

/// Why a session renewal did not produce a usable credential.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RenewalFailure {
    #[error("no refresh token stored - sign-in required")]
    MissingRefreshToken,

    #[error("refresh token rejected with status {status}")]
    Rejected { status: u16 },

    #[error("network error: {0}")]
    Network(String),

    #[error("renewal timed out")]
    TimedOut,

    #[error("invalid renewal response: {0}")]
    InvalidResponse(String),

    #[error("session ended while renewal was in flight")]
    SessionEnded,
}

/// Coarse classification of an [`ApiError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// No response was received.
    Transport,
    /// The server answered 401.
    Authorization,
    /// The server answered with another error status.
    Server,
    /// Renewing the session failed; the session is gone.
    Renewal,
    /// Still unauthorized after one successful renewal.
    RepeatAuthorization,
    /// The request could not be built or the response could not be decoded.
    Local,
}

/// Maximum length for error response bodies in error messages
const MAX_ERROR_BODY_LENGTH: usize = 500;

impl ApiError {
    /// Truncate a response body to avoid logging excessive data
    fn truncate_body(body: &str) -> String {
        if body.len() <= MAX_ERROR_BODY_LENGTH {
            return body.to_string();
        }
        let mut end = MAX_ERROR_BODY_LENGTH;
        while !body.is_char_boundary(end) {
            end -= 1;
        }
        format!("{}... (truncated, {} total bytes)", &body[..end], body.len())
    }

    pub fn from_status(status: reqwest::StatusCode, body: &str) -> Self {
        let truncated = Self::truncate_body(body);
        match status.as_u16() {
            401 => ApiError::Unauthorized,
            403 => ApiError::AccessDenied(truncated),
            404 => ApiError::NotFound(truncated),
            429 => ApiError::RateLimited,
            code @ 500..=599 => ApiError::ServerError {
                status: code,
                body: truncated,
            },
            code => ApiError::Rejected {
                status: code,
                body: truncated,
            },
        }
    }

    /// HTTP status reported by the server, if a response was received.
    pub fn status(&self) -> Option<u16> {
        match self {
            ApiError::Unauthorized | ApiError::UnauthorizedAfterRenewal => Some(401),
            ApiError::AccessDenied(_) => Some(403),
            ApiError::NotFound(_) => Some(404),
            ApiError::RateLimited => Some(429),
            ApiError::ServerError { status, .. } | ApiError::Rejected { status, .. } => {
                Some(*status)
            }
            ApiError::RenewalFailed(RenewalFailure::Rejected { status }) => Some(*status),
            _ => None,
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            ApiError::Network(_) => ErrorCategory::Transport,
            ApiError::Unauthorized => ErrorCategory::Authorization,
            ApiError::UnauthorizedAfterRenewal => ErrorCategory::RepeatAuthorization,
            ApiError::RenewalFailed(_) => ErrorCategory::Renewal,
            ApiError::AccessDenied(_)
            | ApiError::NotFound(_)
            | ApiError::RateLimited
            | ApiError::ServerError { .. }
            | ApiError::Rejected { .. } => ErrorCategory::Server,
            ApiError::InvalidResponse(_) | ApiError::InvalidRequest(_) => ErrorCategory::Local,
        }
    }

    /// Check if this error means the user has to sign in again.
    pub fn requires_sign_in(&self) -> bool {
        matches!(
            self,
            ApiError::RenewalFailed(_) | ApiError::UnauthorizedAfterRenewal
        )
    }

    /// Check if this error is transient and the request may be retried later.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            ApiError::Network(_) | ApiError::RateLimited | ApiError::ServerError { .. }
        )
    }
}

impl From<reqwest::Error> for ApiError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            ApiError::InvalidResponse(err.to_string())
        } else if err.is_builder() {
            ApiError::InvalidRequest(err.to_string())
        } else {
            ApiError::Network(err.to_string())
        }
    }
}

impl From<serde_json::Error> for ApiError {
    fn from(err: serde_json::Error) -> Self {
        ApiError::InvalidResponse(err.to_string())
    }
}

impl RenewalFailure {
    /// Classify an error returned while calling the renewal endpoint.
    pub fn from_api_error(err: &ApiError) -> Self {
        match err {
            ApiError::Network(msg) => RenewalFailure::Network(msg.clone()),
            ApiError::InvalidResponse(msg) | ApiError::InvalidRequest(msg) => {
                RenewalFailure::InvalidResponse(msg.clone())
            }
            ApiError::RenewalFailed(inner) => inner.clone(),
            other => RenewalFailure::Rejected {
                status: other.status().unwrap_or(0),
            },
        }
    }
}
