//! Error types for token acquisition

use std::{error, sync::Arc, time::Duration};

use thiserror::Error;

/// A shared, type-erased error cause
///
/// Causes are reference counted so that every caller waiting on the same
/// refresh receives the same failure.
pub type SharedCause = Arc<dyn error::Error + Send + Sync + 'static>;

/// A failure reported by a [`TokenSource`][crate::sources::TokenSource]
#[derive(Debug, Error)]
pub enum AuthFailure {
    /// The authority rejected the presented credentials or refresh token
    #[error("authority rejected the grant: {0}")]
    InvalidGrant(String),
    /// The exchange failed for a reason that may not recur
    #[error("token exchange failed")]
    Transient(#[source] Box<dyn error::Error + Send + Sync + 'static>),
    /// The authority answered with something other than a token response
    #[error("unexpected token response: {0}")]
    Protocol(String),
}

impl AuthFailure {
    /// Wraps any error as a transient failure
    pub fn transient<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync + 'static>>,
    {
        Self::Transient(error.into())
    }
}

/// Why a process holds no usable credentials
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum UnauthenticatedReason {
    /// There is no refresh token in memory or in the store
    #[error("no refresh token is available")]
    MissingRefreshToken,
    /// The authority rejected the refresh token
    #[error("the refresh token was rejected: {0}")]
    RefreshTokenRejected(String),
    /// The authority rejected the account credentials presented at login
    #[error("the account credentials were rejected: {0}")]
    CredentialsRejected(String),
    /// The authority rejected a token that had just been issued
    #[error("a freshly refreshed token was rejected")]
    RejectedAfterRefresh,
}

/// An error obtaining a valid token
#[derive(Clone, Debug, Error)]
pub enum TokenError {
    /// Credentials must be bootstrapped again; retrying cannot help
    #[error("unauthenticated: {0}")]
    Unauthenticated(#[from] UnauthenticatedReason),
    /// The authority could not be reached; a later attempt may succeed
    #[error("network failure while refreshing tokens")]
    Network(#[source] SharedCause),
    /// The authority's answer could not be understood
    #[error("protocol failure while refreshing tokens: {0}")]
    Protocol(String),
    /// The refresh did not complete before its deadline
    #[error("token refresh timed out after {0:?}")]
    Timeout(Duration),
    /// A rotated refresh token could not be written to the store
    ///
    /// The new bundle is installed in memory regardless.
    #[error("unable to persist the rotated refresh token")]
    Persist(#[source] SharedCause),
    /// The refresh task ended without producing a result
    #[error("token refresh was aborted")]
    Aborted,
}

impl TokenError {
    /// Whether this error ends all further attempts until credentials are re-bootstrapped
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Unauthenticated(_))
    }

    /// Whether the caller may reasonably retry
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Network(_) | Self::Timeout(_) | Self::Persist(_) | Self::Aborted
        )
    }
}

impl From<AuthFailure> for TokenError {
    fn from(failure: AuthFailure) -> Self {
        match failure {
            AuthFailure::InvalidGrant(detail) => {
                UnauthenticatedReason::RefreshTokenRejected(detail).into()
            }
            AuthFailure::Transient(cause) => Self::Network(Arc::from(cause)),
            AuthFailure::Protocol(detail) => Self::Protocol(detail),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invalid_grant_is_terminal() {
        let err = TokenError::from(AuthFailure::InvalidGrant("invalid_grant".into()));
        assert!(err.is_terminal());
        assert!(!err.is_transient());
    }

    #[test]
    fn transport_failures_are_transient() {
        let io = std::io::Error::new(std::io::ErrorKind::ConnectionReset, "reset");
        let err = TokenError::from(AuthFailure::transient(io));
        assert!(err.is_transient());
        assert!(!err.is_terminal());
    }

    #[test]
    fn protocol_failures_are_neither() {
        let err = TokenError::from(AuthFailure::Protocol("html".into()));
        assert!(!err.is_transient());
        assert!(!err.is_terminal());
    }
}
