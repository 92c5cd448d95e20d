//! Error types for the authentication middleware.
//!
//! [`AuthError`] is generic over `E`, the inner service's error type, so
//! transport errors reach the caller without boxing. [`RefreshError`] is the
//! outcome of a failed refresh; it is `Clone` because every request waiting
//! on that refresh receives the same value.

use std::fmt;
use std::time::Duration;

use crate::config::ConfigError;
use crate::store::TokenStoreError;

/// Stable codes for the failures this middleware reports.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Fetching the service descriptor failed.
    Service,
    /// Exchanging the service descriptor for a ticket failed.
    Ticket,
    /// Exchanging the ticket for an access token failed.
    Token,
    /// A request used up its attempts; the last response is passed through.
    RetryExceeded,
    /// Missing OAuth parameters, or configuration set twice.
    Config,
}

impl ErrorCode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCode::Service => "ERR_SERVICE",
            ErrorCode::Ticket => "ERR_TICKET",
            ErrorCode::Token => "ERR_TOKEN",
            ErrorCode::RetryExceeded => "ERR_RETRY_EXCEEDED",
            ErrorCode::Config => "ERR_CONFIG",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Why a refresh did not produce an access token.
#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum RefreshError {
    /// One of the service, ticket or token steps failed.
    #[error("{code}: {message}")]
    Step { code: ErrorCode, message: String },

    /// The user agent was sent to the identity provider; the flow resumes
    /// once it comes back with a token fragment.
    #[error("redirected to the identity provider for login")]
    Redirected,

    /// OAuth mode is configured but no user agent was attached.
    #[error("OAuth mode requires a user agent")]
    MissingUserAgent,

    #[error("refresh did not complete within {0:?}")]
    TimedOut(Duration),

    /// The refresh task ended without reporting an outcome.
    #[error("refresh ended without an outcome")]
    Aborted,
}

impl RefreshError {
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            RefreshError::Step { code, .. } => Some(*code),
            RefreshError::MissingUserAgent => Some(ErrorCode::Config),
            _ => None,
        }
    }
}

/// Errors that can occur while sending a request through the middleware.
#[derive(Debug)]
pub enum AuthError<E> {
    /// An error originating from the inner HTTP service.
    Inner(E),

    /// The request waited on a refresh that failed, so it was never sent.
    Refresh(RefreshError),

    /// The access token cannot be used as a header value.
    InvalidToken(String),
}

// Implemented by hand so that `E: Display` is only required where Display is used.
impl<E: fmt::Display> fmt::Display for AuthError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AuthError::Inner(e) => write!(f, "inner service error: {e}"),
            AuthError::Refresh(e) => write!(f, "authentication failed: {e}"),
            AuthError::InvalidToken(msg) => write!(f, "invalid access token: {msg}"),
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for AuthError<E> {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            AuthError::Refresh(e) => Some(e),
            _ => None,
        }
    }
}

impl<E> From<RefreshError> for AuthError<E> {
    fn from(e: RefreshError) -> Self {
        AuthError::Refresh(e)
    }
}

/// Errors that can occur when constructing an
/// [`AuthenticationLayer`](super::AuthenticationLayer) from a configuration.
#[derive(Debug, thiserror::Error)]
pub enum FromConfigError {
    #[error("invalid configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("token store error: {0}")]
    TokenStore(#[from] TokenStoreError),
}
