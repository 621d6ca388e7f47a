//! Error types for the SSO token broker

use std::io;
use std::path::PathBuf;
use std::sync::Arc;

use thiserror::Error;

/// Result type alias for the SSO token broker
pub type Result<T> = std::result::Result<T, Error>;

/// SSO token broker errors
///
/// `Clone` so that the outcome of a single in-flight refresh can be handed
/// to every caller waiting on it.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// No usable token and no refresh path; an interactive login is required
    #[error("Authentication required for {0}")]
    AuthenticationRequired(String),

    /// Token expired but a refresh can recover it without user interaction
    #[error("Token for {0} has expired and is being refreshed")]
    TokenExpiredRecoverable(String),

    /// Transient network or service-side failure
    #[error("Network error: {0}")]
    Network(String),

    /// Refresh token rejected by the service
    #[error("Invalid grant: {0}")]
    InvalidGrant(String),

    /// Local credential storage could not be read or written
    #[error("Storage error at {}: {source}", path.display())]
    Storage {
        /// File or directory that failed
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: Arc<io::Error>,
    },

    /// Device code expired before the user completed authorization
    #[error("Device code expired, restart login")]
    DeviceCodeExpired,

    /// User denied the authorization request
    #[error("Access denied: {0}")]
    AccessDenied(String),

    /// Operation cancelled by the caller or by provider disposal
    #[error("Operation cancelled")]
    Cancelled,

    /// Terminal error response from the OIDC service
    #[error("Service error {status} ({code}): {message}")]
    Service {
        /// HTTP status code
        status: u16,
        /// Service error code
        code: String,
        /// Error description
        message: String,
    },

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// JSON (de)serialization error
    #[error("Serialization error: {0}")]
    Serialization(String),

    /// A registered client factory failed
    #[error("Client construction failed: {0}")]
    ClientConstruction(String),

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

/// User-facing failure category, one actionable message per category
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorCategory {
    /// "Please sign in again"
    SignInAgain,
    /// "Could not reach AWS"
    Unreachable,
    /// "Local credential storage is inaccessible"
    StorageInaccessible,
    /// Anything else
    Other,
}

impl Error {
    /// Create a storage error for `path`
    pub fn storage(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Storage {
            path: path.into(),
            source: Arc::new(source),
        }
    }

    /// Whether a blocking caller may retry this error with backoff
    #[must_use]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Network(_))
    }

    /// Map to the user-facing category
    #[must_use]
    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::AuthenticationRequired(_)
            | Self::InvalidGrant(_)
            | Self::DeviceCodeExpired
            | Self::AccessDenied(_) => ErrorCategory::SignInAgain,
            Self::Network(_) | Self::TokenExpiredRecoverable(_) => ErrorCategory::Unreachable,
            Self::Storage { .. } => ErrorCategory::StorageInaccessible,
            _ => ErrorCategory::Other,
        }
    }
}

impl From<reqwest::Error> for Error {
    fn from(e: reqwest::Error) -> Self {
        Self::Network(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}
