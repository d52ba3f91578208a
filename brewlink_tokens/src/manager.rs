//! The single-flight token manager

use std::{
    fmt,
    sync::{
        atomic::{AtomicU64, Ordering},
        Arc, Mutex, MutexGuard, Weak,
    },
    time::Duration,
};

use arc_swap::ArcSwapOption;
use brewlink_clock::{Clock, DurationSecs, System};
use futures_util::future::{BoxFuture, FutureExt, Shared};
use tokio::sync::oneshot;

use crate::{
    sources::{PasswordCredentials, TokenSource},
    stores::TokenStore,
    AuthFailure, RefreshToken, TokenBundle, TokenError, UnauthenticatedReason,
};

/// The result every waiter on a refresh receives
pub type RefreshResult = Result<Arc<TokenBundle>, TokenError>;

type InFlightRefresh = Shared<BoxFuture<'static, RefreshResult>>;

/// The default margin before expiry at which a bundle is considered stale
pub const DEFAULT_SKEW: DurationSecs = DurationSecs(60);

/// The default deadline for a single exchange with the authority
pub const DEFAULT_REFRESH_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the current token bundle and serializes refreshes
///
/// Handles are cheap to clone and all clones share the same bundle, the same
/// in-flight refresh, and the same terminal state. Configuration set with the
/// `with_*` methods applies to the handle it is called on and to clones made
/// from it afterwards.
///
/// At most one exchange with the [`TokenSource`] is in flight at any time.
/// Callers that find a refresh already running wait for it and receive its
/// result, whether that is a bundle or an error.
pub struct TokenManager<C = System> {
    state: Arc<State>,
    skew: DurationSecs,
    refresh_timeout: Duration,
    clock: C,
}

struct State {
    source: Arc<dyn TokenSource>,
    store: Arc<dyn TokenStore>,
    current: ArcSwapOption<TokenBundle>,
    slot: Mutex<Slot>,
    generation: AtomicU64,
}

#[derive(Default)]
struct Slot {
    in_flight: Option<(u64, InFlightRefresh)>,
    revoked: Option<UnauthenticatedReason>,
}

impl TokenManager<System> {
    /// Constructs a manager that holds no bundle yet
    ///
    /// The first call to [`valid_token()`][Self::valid_token()] refreshes using
    /// the refresh token found in `store`, unless [`bootstrap()`][Self::bootstrap()]
    /// or [`with_initial_bundle()`][Self::with_initial_bundle()] supplies one first.
    pub fn new<S, T>(source: S, store: T) -> Self
    where
        S: TokenSource + 'static,
        T: TokenStore + 'static,
    {
        Self {
            state: Arc::new(State {
                source: Arc::new(source),
                store: Arc::new(store),
                current: ArcSwapOption::empty(),
                slot: Mutex::new(Slot::default()),
                generation: AtomicU64::new(0),
            }),
            skew: DEFAULT_SKEW,
            refresh_timeout: DEFAULT_REFRESH_TIMEOUT,
            clock: System,
        }
    }
}

impl<C> TokenManager<C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Sets how long before literal expiry a bundle is considered stale
    pub fn with_skew(mut self, skew: DurationSecs) -> Self {
        self.skew = skew;
        self
    }

    /// Sets the deadline for each exchange with the authority
    ///
    /// A refresh that exceeds it fails with [`TokenError::Timeout`] and
    /// admits the next refresh.
    pub fn with_refresh_timeout(mut self, refresh_timeout: Duration) -> Self {
        self.refresh_timeout = refresh_timeout;
        self
    }

    /// Uses `clock` to judge staleness
    pub fn with_clock<D>(self, clock: D) -> TokenManager<D>
    where
        D: Clock + Clone + Send + Sync + 'static,
    {
        TokenManager {
            state: self.state,
            skew: self.skew,
            refresh_timeout: self.refresh_timeout,
            clock,
        }
    }

    /// Seeds the manager with a previously obtained bundle
    pub fn with_initial_bundle(self, bundle: TokenBundle) -> Self {
        self.state.current.store(Some(Arc::new(bundle)));
        self
    }

    /// The configured skew margin
    pub fn skew(&self) -> DurationSecs {
        self.skew
    }

    /// The clock used to judge staleness
    pub fn clock(&self) -> &C {
        &self.clock
    }

    /// The bundle currently held, regardless of its freshness
    pub fn current(&self) -> Option<Arc<TokenBundle>> {
        self.state.current.load_full()
    }

    /// The subject of the current ID token, if a bundle is held
    pub fn subject(&self) -> Option<String> {
        self.current()?.subject().map(str::to_owned)
    }

    /// Why the manager stopped refreshing, if the authority rejected its refresh token
    pub fn revoked(&self) -> Option<UnauthenticatedReason> {
        self.state.lock_slot().revoked.clone()
    }

    /// Gets a bundle that is fresh with respect to the skew margin
    ///
    /// If the held bundle is missing or stale, performs a single refresh,
    /// sharing it with every other caller that finds the bundle stale at the
    /// same time. A bundle the authority issues already stale is installed
    /// but not returned; the call fails with [`TokenError::Protocol`].
    pub async fn valid_token(&self) -> RefreshResult {
        if let Some(bundle) = self.fresh_bundle() {
            return Ok(bundle);
        }

        let pending = {
            let mut slot = self.state.lock_slot();
            match &slot.in_flight {
                Some((_, pending)) => pending.clone(),
                None => {
                    if let Some(reason) = &slot.revoked {
                        return Err(reason.clone().into());
                    }
                    // Another caller may have completed a refresh since the check above
                    if let Some(bundle) = self.fresh_bundle() {
                        return Ok(bundle);
                    }
                    self.start_refresh(&mut slot)
                }
            }
        };

        self.checked(pending.await)
    }

    /// Refreshes regardless of the held bundle's freshness
    ///
    /// Joins a refresh that is already in flight rather than starting another.
    pub async fn force_refresh(&self) -> RefreshResult {
        self.refresh_unless(|_| false).await
    }

    /// Refreshes because `rejected` was refused by the backend
    ///
    /// If the held bundle has already been replaced by a different one, that
    /// bundle is returned without another exchange. Many callers that were
    /// rejected with the same bundle therefore cause a single refresh.
    pub async fn force_refresh_after(&self, rejected: &TokenBundle) -> RefreshResult {
        self.refresh_unless(|held| held != rejected).await
    }

    async fn refresh_unless<F>(&self, already_replaced: F) -> RefreshResult
    where
        F: FnOnce(&TokenBundle) -> bool,
    {
        let pending = {
            let mut slot = self.state.lock_slot();
            match &slot.in_flight {
                Some((_, pending)) => pending.clone(),
                None => {
                    if let Some(reason) = &slot.revoked {
                        return Err(reason.clone().into());
                    }
                    if let Some(held) = self.current() {
                        if already_replaced(&held) && self.is_fresh(&held) {
                            return Ok(held);
                        }
                    }
                    self.start_refresh(&mut slot)
                }
            }
        };

        self.checked(pending.await)
    }

    /// Logs in with account credentials, replacing any held bundle
    ///
    /// The issued refresh token is persisted before this returns. A successful
    /// login clears a previous rejection of the refresh token.
    ///
    /// The login occupies the refresh slot: it starts only after a refresh
    /// already in flight has finished, and callers needing a token meanwhile
    /// wait for the login's result.
    #[tracing::instrument(skip_all, fields(username = %credentials.username))]
    pub async fn bootstrap(&self, credentials: PasswordCredentials<'_>) -> RefreshResult {
        let (generation, done) = self.claim_slot().await;
        let _release = ReleaseSlot {
            state: &self.state,
            generation,
        };

        let result = self.login(credentials).await;
        let _ = done.send(result.clone());
        result
    }

    /// Waits until no exchange is in flight, then reserves the slot
    ///
    /// Callers joining the slot receive what is sent on the returned channel,
    /// or [`TokenError::Aborted`] if it is dropped unsent.
    async fn claim_slot(&self) -> (u64, oneshot::Sender<RefreshResult>) {
        loop {
            let pending = {
                let mut slot = self.state.lock_slot();
                match &slot.in_flight {
                    Some((_, pending)) => pending.clone(),
                    None => {
                        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed);
                        let (done, result) = oneshot::channel();
                        let pending = async move { result.await.unwrap_or(Err(TokenError::Aborted)) }
                            .boxed()
                            .shared();
                        slot.in_flight = Some((generation, pending));
                        return (generation, done);
                    }
                }
            };

            tracing::debug!("waiting for the refresh in flight before logging in");
            let _ = pending.await;
        }
    }

    async fn login(&self, credentials: PasswordCredentials<'_>) -> RefreshResult {
        let login = tokio::time::timeout(self.refresh_timeout, self.state.source.login(credentials));

        let bundle = match login.await {
            Ok(Ok(bundle)) => Arc::new(bundle),
            Ok(Err(AuthFailure::InvalidGrant(detail))) => {
                tracing::warn!(detail = %detail, "authority rejected account credentials");
                return Err(UnauthenticatedReason::CredentialsRejected(detail).into());
            }
            Ok(Err(failure)) => return Err(failure.into()),
            Err(_) => return Err(TokenError::Timeout(self.refresh_timeout)),
        };

        let persisted = self.state.store.save(bundle.refresh_token()).await;

        {
            let mut slot = self.state.lock_slot();
            slot.revoked = None;
            self.state.current.store(Some(Arc::clone(&bundle)));
        }

        tracing::info!(expires_at = bundle.expires_at().0, "session bootstrapped");

        match persisted {
            Ok(()) => Ok(bundle),
            Err(error) => {
                tracing::error!(
                    error = (&*error as &dyn std::error::Error),
                    "unable to persist refresh token issued at login"
                );
                Err(TokenError::Persist(Arc::from(error)))
            }
        }
    }

    pub(crate) fn downgrade(&self) -> WeakTokenManager<C> {
        WeakTokenManager {
            state: Arc::downgrade(&self.state),
            skew: self.skew,
            refresh_timeout: self.refresh_timeout,
            clock: self.clock.clone(),
        }
    }

    fn is_fresh(&self, bundle: &TokenBundle) -> bool {
        bundle.is_fresh_at(self.clock.now(), self.skew)
    }

    /// Refuses a bundle that is stale on this manager's clock
    fn checked(&self, result: RefreshResult) -> RefreshResult {
        let bundle = result?;
        if self.is_fresh(&bundle) {
            return Ok(bundle);
        }

        tracing::warn!(
            expires_at = bundle.expires_at().0,
            now = self.clock.now().0,
            skew = self.skew.0,
            "authority issued a bundle that is already stale"
        );
        Err(TokenError::Protocol("issued bundle is already stale".into()))
    }

    fn fresh_bundle(&self) -> Option<Arc<TokenBundle>> {
        self.current().filter(|bundle| self.is_fresh(bundle))
    }

    fn start_refresh(&self, slot: &mut Slot) -> InFlightRefresh {
        let generation = self.state.generation.fetch_add(1, Ordering::Relaxed);
        let state = Arc::clone(&self.state);
        let deadline = self.refresh_timeout;

        tracing::debug!(generation, "starting token refresh");

        let task = tokio::spawn(async move {
            let _release = ReleaseSlot {
                state: &state,
                generation,
            };

            match tokio::time::timeout(deadline, state.refresh_once()).await {
                Ok(result) => result,
                Err(_) => {
                    tracing::warn!(timeout_ms = deadline.as_millis() as u64, "token refresh timed out");
                    Err(TokenError::Timeout(deadline))
                }
            }
        });

        let pending = async move { task.await.unwrap_or(Err(TokenError::Aborted)) }
            .boxed()
            .shared();

        slot.in_flight = Some((generation, pending.clone()));
        pending
    }
}

impl State {
    fn lock_slot(&self) -> MutexGuard<'_, Slot> {
        self.slot.lock().unwrap_or_else(|e| e.into_inner())
    }

    async fn refresh_once(&self) -> RefreshResult {
        let presented = match self.current.load_full() {
            Some(bundle) => bundle.refresh_token().to_owned(),
            None => self.stored_refresh_token().await?,
        };

        let bundle = match self.source.refresh(&presented).await {
            Ok(bundle) => Arc::new(bundle),
            Err(failure) => {
                let error = TokenError::from(failure);
                if let TokenError::Unauthenticated(reason) = &error {
                    tracing::error!(%reason, "refresh token rejected; re-bootstrap required");
                    self.lock_slot().revoked = Some(reason.clone());
                } else {
                    tracing::warn!(error = (&error as &dyn std::error::Error), "token refresh failed");
                }
                return Err(error);
            }
        };

        let rotated = bundle.refresh_token() != &*presented;
        let persisted = if rotated {
            self.store.save(bundle.refresh_token()).await
        } else {
            Ok(())
        };

        self.current.store(Some(Arc::clone(&bundle)));
        tracing::debug!(rotated, expires_at = bundle.expires_at().0, "installed refreshed tokens");

        match persisted {
            Ok(()) => Ok(bundle),
            Err(error) => {
                tracing::error!(
                    error = (&*error as &dyn std::error::Error),
                    "unable to persist rotated refresh token"
                );
                Err(TokenError::Persist(Arc::from(error)))
            }
        }
    }

    async fn stored_refresh_token(&self) -> Result<RefreshToken, TokenError> {
        match self.store.load().await {
            Ok(Some(token)) => Ok(token),
            Ok(None) => Err(UnauthenticatedReason::MissingRefreshToken.into()),
            Err(error) => Err(TokenError::Persist(Arc::from(error))),
        }
    }
}

/// Clears the in-flight slot once the refresh task ends, however it ends
struct ReleaseSlot<'a> {
    state: &'a State,
    generation: u64,
}

impl Drop for ReleaseSlot<'_> {
    fn drop(&mut self) {
        let mut slot = self.state.lock_slot();
        if matches!(slot.in_flight, Some((g, _)) if g == self.generation) {
            slot.in_flight = None;
        }
    }
}

/// A handle that does not keep the manager's shared state alive
pub(crate) struct WeakTokenManager<C> {
    state: Weak<State>,
    skew: DurationSecs,
    refresh_timeout: Duration,
    clock: C,
}

impl<C: Clone> WeakTokenManager<C> {
    pub(crate) fn upgrade(&self) -> Option<TokenManager<C>> {
        Some(TokenManager {
            state: self.state.upgrade()?,
            skew: self.skew,
            refresh_timeout: self.refresh_timeout,
            clock: self.clock.clone(),
        })
    }
}

impl<C: Clone> Clone for TokenManager<C> {
    fn clone(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            skew: self.skew,
            refresh_timeout: self.refresh_timeout,
            clock: self.clock.clone(),
        }
    }
}

impl<C: fmt::Debug> fmt::Debug for TokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenManager")
            .field("current", &self.state.current.load())
            .field("skew", &self.skew)
            .field("refresh_timeout", &self.refresh_timeout)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}

impl<C: fmt::Debug> fmt::Debug for WeakTokenManager<C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WeakTokenManager")
            .field("skew", &self.skew)
            .field("clock", &self.clock)
            .finish_non_exhaustive()
    }
}
