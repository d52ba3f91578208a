//! Refreshing tokens in the background ahead of staleness

use std::{error, time::Duration};

use brewlink_clock::{Clock, DurationSecs, UnixTime};
use tokio::task::JoinHandle;

use crate::{
    backoff::{ErrorBackoffConfig, ErrorBackoffHandler, WithBackoff},
    jitter::JitterSource,
    TokenBundle, TokenManager,
};

/// How long the refresher sleeps at most before looking at the clock again
///
/// Timers do not advance while a host is suspended, so a refresher that slept
/// until the stale time could wake long after the token expired.
pub const HEARTBEAT: DurationSecs = DurationSecs(30);

enum Delay {
    UntilTime(UnixTime),
    ForDuration(Duration),
}

impl<C> TokenManager<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Spawns a task that keeps the held bundle fresh
    ///
    /// The task refreshes at a time jittered by `jitter_source` ahead of the
    /// moment the bundle turns stale, so that callers of
    /// [`valid_token()`][Self::valid_token()] rarely wait on the authority.
    /// Failures other than a rejected refresh token are retried after a backoff
    /// delay, including a bundle that the authority issued already stale.
    ///
    /// The task ends when the refresh token is rejected, or once every handle
    /// to this manager has been dropped.
    pub fn spawn_refresher<J>(
        &self,
        mut jitter_source: J,
        backoff_config: ErrorBackoffConfig,
    ) -> JoinHandle<()>
    where
        J: JitterSource + Send + 'static,
    {
        let weak = self.downgrade();
        let mut scheduled = self.current();
        let mut delay = match &scheduled {
            Some(bundle) => Delay::UntilTime(jitter_source.jitter(refresh_due(self, bundle))),
            None => Delay::ForDuration(Duration::ZERO),
        };

        tokio::spawn(async move {
            let mut backoff_handler = ErrorBackoffHandler::new(backoff_config);

            loop {
                match delay {
                    Delay::ForDuration(d) => tokio::time::sleep(d).await,
                    Delay::UntilTime(t) => loop {
                        let Some(now) = weak.upgrade().map(|m| m.clock().now()) else {
                            break;
                        };
                        if now >= t {
                            tracing::trace!("token now due for refresh");
                            break;
                        }

                        let until_due = t - now;
                        let nap = until_due.min(HEARTBEAT);
                        tracing::trace!(
                            delay = nap.0,
                            until_due = until_due.0,
                            "token not yet due for refresh, sleeping…"
                        );
                        tokio::time::sleep(nap.into()).await;
                    },
                }

                let Some(manager) = weak.upgrade() else {
                    tracing::info!("all token manager handles dropped, halting refreshes");
                    return;
                };

                tracing::debug!("refreshing token ahead of staleness");
                let outcome = match &scheduled {
                    Some(bundle) => manager.force_refresh_after(bundle).await,
                    None => manager.valid_token().await,
                };

                delay = match outcome.with_backoff(&mut backoff_handler) {
                    Ok(bundle) => {
                        let stale = refresh_due(&manager, &bundle);
                        let next = jitter_source.jitter(stale);
                        tracing::debug!(
                            stale = stale.0,
                            delay = (next - manager.clock().now()).0,
                            "waiting for token to become stale"
                        );
                        scheduled = Some(bundle);
                        Delay::UntilTime(next)
                    }
                    Err((error, _)) if error.is_terminal() => {
                        tracing::error!(
                            error = (&error as &dyn error::Error),
                            "refresh token no longer accepted, halting refreshes"
                        );
                        return;
                    }
                    Err((error, delay)) => {
                        tracing::warn!(
                            error = (&error as &dyn error::Error),
                            delay_ms = delay.as_millis() as u64,
                            "error refreshing token, will retry"
                        );
                        Delay::ForDuration(delay)
                    }
                };
            }
        })
    }
}

fn refresh_due<C: Clock + Clone + Send + Sync + 'static>(
    manager: &TokenManager<C>,
    bundle: &TokenBundle,
) -> UnixTime {
    bundle.expires_at().saturating_sub(manager.skew())
}
