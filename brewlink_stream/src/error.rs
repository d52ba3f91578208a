//! Error types for the streaming connection

use std::{error, sync::Arc, time::Duration};

use brewlink_tokens::{AuthorizedError, SharedCause, TokenError, UnauthenticatedReason};
use thiserror::Error;

/// An error from a stream transport
#[derive(Clone, Debug, Error)]
pub enum StreamError {
    /// The backend rejected the presented credentials
    #[error("the backend rejected the presented credentials")]
    Unauthorized,
    /// The connection could not be established or broke
    #[error("stream transport failure")]
    Transport(#[source] SharedCause),
    /// The backend closed the connection
    #[error("connection closed by the backend")]
    Closed,
    /// The backend sent a message that could not be understood
    #[error("undecodable message from the backend: {0}")]
    Protocol(String),
    /// An operation did not complete before its deadline
    #[error("stream operation timed out after {0:?}")]
    Timeout(Duration),
}

impl StreamError {
    /// Wraps any error as a transport failure
    pub fn transport<E>(error: E) -> Self
    where
        E: Into<Box<dyn error::Error + Send + Sync + 'static>>,
    {
        Self::Transport(Arc::from(error.into()))
    }

    /// Whether the connection is gone and must be re-established
    ///
    /// Protocol failures concern a single message; the connection survives them.
    pub fn is_connection_lost(&self) -> bool {
        !matches!(self, Self::Protocol(_))
    }

    /// Whether a later attempt may succeed
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Unauthorized | Self::Transport(_) | Self::Closed | Self::Timeout(_)
        )
    }
}

/// An error surfaced by the connection supervisor
#[derive(Clone, Debug, Error)]
pub enum SupervisorError {
    /// No valid token could be obtained
    #[error("unable to obtain a valid token")]
    Token(#[source] TokenError),
    /// The stream transport failed
    #[error(transparent)]
    Stream(StreamError),
}

impl SupervisorError {
    /// Whether the supervisor cannot continue until credentials are bootstrapped again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Token(err) if err.is_terminal())
    }

    /// Whether the supervisor recovers from this error by reconnecting
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Token(err) => err.is_transient(),
            Self::Stream(err) => err.is_transient(),
        }
    }
}

impl From<TokenError> for SupervisorError {
    fn from(err: TokenError) -> Self {
        Self::Token(err)
    }
}

impl From<StreamError> for SupervisorError {
    fn from(err: StreamError) -> Self {
        Self::Stream(err)
    }
}

impl From<AuthorizedError<StreamError>> for SupervisorError {
    fn from(err: AuthorizedError<StreamError>) -> Self {
        match err {
            AuthorizedError::Token(err) => Self::Token(err),
            AuthorizedError::Rejected => {
                Self::Token(UnauthenticatedReason::RejectedAfterRefresh.into())
            }
            AuthorizedError::Call(err) => Self::Stream(err),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn a_second_handshake_rejection_is_terminal() {
        let err = SupervisorError::from(AuthorizedError::<StreamError>::Rejected);
        assert!(err.is_terminal());
        assert!(!err.is_transient());
    }

    #[test]
    fn a_single_handshake_rejection_is_transient() {
        let err = SupervisorError::from(AuthorizedError::Call(StreamError::Unauthorized));
        assert!(err.is_transient());
        assert!(!err.is_terminal());
    }

    #[test]
    fn protocol_failures_keep_the_connection() {
        assert!(!StreamError::Protocol("not json".into()).is_connection_lost());
        assert!(StreamError::Closed.is_connection_lost());
    }
}
