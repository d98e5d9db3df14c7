//! Error taxonomy for the remote store.

use thiserror::Error;

/// How the orchestrator should treat a failed action.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryClass {
    /// Leave queued and try again after backoff.
    Retryable,
    /// Row-level security or auth denial; needs a human, surfaced to the user.
    PermissionDenied,
    /// The conflict key disagrees with the remote schema.
    Misconfigured,
    /// Rejected for any other reason; retrying cannot help.
    Permanent,
}

#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("network error: {0}")]
    Network(String),

    #[error("permission denied ({status}): {message}")]
    Unauthorized { status: u16, message: String },

    #[error("constraint violation on {table}: {message}")]
    Constraint { table: String, message: String },

    #[error("remote rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("invalid remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Classify an HTTP error response, using the Postgres error code when
    /// the body carries one.
    pub fn from_response(table: &str, status: u16, code: Option<&str>, message: String) -> Self {
        match code {
            Some("42501") => return Self::Unauthorized { status, message },
            Some("23505" | "23502" | "42P10") => {
                return Self::Constraint {
                    table: table.to_string(),
                    message,
                }
            }
            _ => {}
        }
        match status {
            401 | 403 => Self::Unauthorized { status, message },
            409 => Self::Constraint {
                table: table.to_string(),
                message,
            },
            408 | 425 | 429 | 500..=599 => Self::Network(format!("HTTP {status}: {message}")),
            _ => Self::Rejected { status, message },
        }
    }

    pub fn retry_class(&self) -> RetryClass {
        match self {
            Self::Network(_) => RetryClass::Retryable,
            Self::Unauthorized { .. } => RetryClass::PermissionDenied,
            Self::Constraint { .. } => RetryClass::Misconfigured,
            Self::Rejected { .. } | Self::Decode(_) => RetryClass::Permanent,
        }
    }
}

impl From<reqwest::Error> for RemoteError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_decode() {
            Self::Decode(err.to_string())
        } else {
            Self::Network(err.to_string())
        }
    }
}
