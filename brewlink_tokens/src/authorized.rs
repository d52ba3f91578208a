//! Executing calls with the refresh-then-retry-once policy

use std::{error, fmt};

use async_trait::async_trait;
use brewlink_clock::{Clock, System};
use thiserror::Error;

use crate::{TokenBundle, TokenError, TokenManager};

/// An outbound call that presents credentials
///
/// Implementations must be safe to execute twice: the executor repeats the
/// call once when the first attempt is rejected as unauthorized.
#[async_trait]
pub trait AuthorizedCall: Send {
    /// The value produced by a completed call
    type Output: Send;
    /// The error produced by a failed call
    type Error: Send;

    /// Executes the call presenting the credentials in `bundle`
    async fn call(&mut self, bundle: &TokenBundle) -> Result<Self::Output, Self::Error>;

    /// Whether the backend rejected the presented credentials
    ///
    /// This must recognize only the backend's "token rejected" signal, not
    /// every client error.
    fn is_unauthorized(&self, result: &Result<Self::Output, Self::Error>) -> bool;
}

/// An error from an authorized call
#[derive(Debug, Error)]
pub enum AuthorizedError<E> {
    /// No valid token could be obtained
    ///
    /// This includes the refresh forced by a rejection. A transient failure of
    /// that refresh stays transient: it is unauthenticated only if
    /// [`TokenError::is_terminal()`] says so.
    #[error("unable to obtain a valid token")]
    Token(#[source] TokenError),
    /// The call was rejected as unauthorized even with freshly refreshed credentials
    #[error("credentials rejected again after refreshing")]
    Rejected,
    /// The call itself failed
    #[error(transparent)]
    Call(E),
}

impl<E> AuthorizedError<E> {
    /// Whether the credentials are unusable and must be bootstrapped again
    pub fn is_unauthenticated(&self) -> bool {
        match self {
            Self::Token(err) => err.is_terminal(),
            Self::Rejected => true,
            Self::Call(_) => false,
        }
    }

    /// Gets the call's own error, if that is what failed
    pub fn into_call_error(self) -> Option<E> {
        match self {
            Self::Call(err) => Some(err),
            _ => None,
        }
    }
}

/// Applies the refresh-then-retry-once policy to [`AuthorizedCall`]s
///
/// 1. A valid token is obtained from the [`TokenManager`] and the call is made.
/// 2. If the backend rejects the token, a refresh is forced and the call is
///    made exactly once more.
/// 3. A second rejection ends in [`AuthorizedError::Rejected`]. There is never
///    a third attempt.
///
/// Failures that are not authorization rejections are returned unchanged.
pub struct AuthorizedExecutor<C = System> {
    tokens: TokenManager<C>,
}

impl<C> AuthorizedExecutor<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Constructs an executor drawing credentials from `tokens`
    pub fn new(tokens: TokenManager<C>) -> Self {
        Self { tokens }
    }

    /// The token manager backing this executor
    pub fn tokens(&self) -> &TokenManager<C> {
        &self.tokens
    }

    /// Executes `call`, refreshing and retrying once if it is rejected
    pub async fn execute<A>(&self, call: &mut A) -> Result<A::Output, AuthorizedError<A::Error>>
    where
        A: AuthorizedCall + ?Sized,
    {
        let bundle = self.tokens.valid_token().await.map_err(AuthorizedError::Token)?;

        let first = call.call(&bundle).await;
        if !call.is_unauthorized(&first) {
            return first.map_err(AuthorizedError::Call);
        }

        tracing::debug!("credentials rejected, forcing a token refresh");
        let refreshed = self
            .tokens
            .force_refresh_after(&bundle)
            .await
            .map_err(|err| {
                tracing::warn!(
                    error = (&err as &dyn error::Error),
                    "token refresh after rejection failed"
                );
                AuthorizedError::Token(err)
            })?;

        let second = call.call(&refreshed).await;
        if call.is_unauthorized(&second) {
            tracing::warn!("credentials rejected again after refresh, giving up");
            return Err(AuthorizedError::Rejected);
        }

        second.map_err(AuthorizedError::Call)
    }
}

impl<C: Clone> Clone for AuthorizedExecutor<C> {
    fn clone(&self) -> Self {
        Self {
            tokens: self.tokens.clone(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for AuthorizedExecutor<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedExecutor")
            .field("tokens", &self.tokens)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{collections::VecDeque, sync::Arc};

    use brewlink_clock::{DurationSecs, ManualClock, UnixTime};
    use color_eyre::Result;

    use super::*;
    use crate::{
        stores::InMemoryTokenStore,
        test::{bundle_expiring, CountingSource, Outcome},
    };

    const ISSUED: UnixTime = UnixTime(1_700_000_000);

    #[derive(Debug, PartialEq, Eq, Error)]
    #[error("backend answered {0}")]
    struct Status(u16);

    /// A call that answers with a scripted sequence of HTTP-like statuses
    struct StatusCall {
        statuses: VecDeque<u16>,
        presented: Vec<String>,
    }

    impl StatusCall {
        fn answering(statuses: &[u16]) -> Self {
            Self {
                statuses: statuses.iter().copied().collect(),
                presented: Vec::new(),
            }
        }

        fn attempts(&self) -> usize {
            self.presented.len()
        }
    }

    #[async_trait]
    impl AuthorizedCall for StatusCall {
        type Output = u16;
        type Error = Status;

        async fn call(&mut self, bundle: &TokenBundle) -> Result<u16, Status> {
            self.presented.push(bundle.refresh_token().as_str().to_owned());
            match self.statuses.pop_front().unwrap_or(200) {
                s @ 200..=299 => Ok(s),
                s => Err(Status(s)),
            }
        }

        fn is_unauthorized(&self, result: &Result<u16, Status>) -> bool {
            matches!(result, Err(Status(401)))
        }
    }

    fn executor(
        configure: impl FnOnce(CountingSource) -> CountingSource,
    ) -> (Arc<CountingSource>, AuthorizedExecutor<ManualClock>) {
        let clock = ManualClock::new(ISSUED);
        let source = Arc::new(configure(CountingSource::new(clock.clone())));
        let tokens = TokenManager::new(Arc::clone(&source), InMemoryTokenStore::new())
            .with_clock(clock)
            .with_initial_bundle(bundle_expiring(ISSUED + DurationSecs(3600), "rt-0"));

        (source, AuthorizedExecutor::new(tokens))
    }

    mod when_call_is_accepted {
        use super::*;

        #[tokio::test]
        async fn no_refresh_is_forced() -> Result<()> {
            let (source, executor) = executor(|s| s);
            let mut call = StatusCall::answering(&[200]);

            let status = executor.execute(&mut call).await?;

            assert_eq!(status, 200);
            assert_eq!(call.attempts(), 1);
            assert_eq!(source.refreshes(), 0);
            Ok(())
        }
    }

    mod when_rejected_once {
        use super::*;

        #[tokio::test]
        async fn one_refresh_and_one_retry_happen() -> Result<()> {
            let (source, executor) = executor(|s| s);
            let mut call = StatusCall::answering(&[401, 204]);

            let status = executor.execute(&mut call).await?;

            assert_eq!(status, 204);
            assert_eq!(source.refreshes(), 1);
            assert_eq!(call.presented, ["rt-0", "rt-1"]);
            Ok(())
        }

        #[tokio::test]
        async fn a_revoked_refresh_token_is_unauthenticated() {
            let (source, executor) = executor(|s| s.then(Outcome::Reject));
            let mut call = StatusCall::answering(&[401]);

            let result = executor.execute(&mut call).await;

            assert!(matches!(result, Err(ref e) if e.is_unauthenticated()));
            assert_eq!(call.attempts(), 1);
            assert_eq!(source.refreshes(), 1);
        }
    }

    mod when_refresh_after_rejection_fails {
        use super::*;

        #[tokio::test]
        async fn a_transient_failure_stays_transient() {
            let (source, executor) = executor(|s| s.then(Outcome::Unavailable));
            let mut call = StatusCall::answering(&[401, 200]);

            let result = executor.execute(&mut call).await;

            assert!(matches!(result, Err(AuthorizedError::Token(ref e)) if e.is_transient()));
            assert!(result.is_err_and(|e| !e.is_unauthenticated()));
            assert_eq!(call.attempts(), 1);
            assert_eq!(source.refreshes(), 1);
        }
    }

    mod when_rejected_twice {
        use super::*;

        #[tokio::test]
        async fn there_is_no_third_attempt() {
            let (source, executor) = executor(|s| s);
            let mut call = StatusCall::answering(&[401, 401, 200]);

            let result = executor.execute(&mut call).await;

            assert!(matches!(result, Err(AuthorizedError::Rejected)));
            assert!(result.is_err_and(|e| e.is_unauthenticated()));
            assert_eq!(call.attempts(), 2);
            assert_eq!(source.refreshes(), 1);
        }
    }

    mod when_call_fails_otherwise {
        use super::*;

        #[tokio::test]
        async fn the_error_is_returned_unmodified() {
            let (source, executor) = executor(|s| s);
            let mut call = StatusCall::answering(&[503]);

            let result = executor.execute(&mut call).await;

            assert_eq!(result.map_err(AuthorizedError::into_call_error), Err(Some(Status(503))));
            assert_eq!(call.attempts(), 1);
            assert_eq!(source.refreshes(), 0);
        }

        #[tokio::test]
        async fn a_forbidden_status_is_not_retried() {
            let (_, executor) = executor(|s| s);
            let mut call = StatusCall::answering(&[403, 200]);

            let result = executor.execute(&mut call).await;

            assert!(matches!(result, Err(AuthorizedError::Call(Status(403)))));
            assert_eq!(call.attempts(), 1);
        }
    }

    #[tokio::test]
    async fn concurrent_rejections_share_one_refresh() -> Result<()> {
        let (source, executor) = executor(|s| s);
        let mut first = StatusCall::answering(&[401, 200]);
        let mut second = StatusCall::answering(&[401, 200]);

        let (a, b) = tokio::join!(executor.execute(&mut first), executor.execute(&mut second));
        a?;
        b?;

        assert_eq!(source.refreshes(), 1);
        assert_eq!(first.presented[1], second.presented[1]);
        Ok(())
    }
}
