//! Test fixtures shared by the unit tests in this crate

use std::{
    collections::VecDeque,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Mutex,
    },
    time::Duration,
};

use aliri_base64::Base64Url;
use async_trait::async_trait;
use brewlink_clock::{Clock, DurationSecs, ManualClock, UnixTime};

use crate::{
    sources::{PasswordCredentials, TokenSource},
    AccessToken, AuthFailure, IdToken, RefreshToken, RefreshTokenRef, TokenBundle,
};

/// Builds an unsigned compact JWT carrying `exp` and, optionally, `sub`
pub(crate) fn fake_jwt(exp: UnixTime, sub: Option<&str>) -> String {
    let claims = match sub {
        Some(sub) => serde_json::json!({ "exp": exp.0, "sub": sub }),
        None => serde_json::json!({ "exp": exp.0 }),
    };
    let header = Base64Url::from_raw(br#"{"alg":"none"}"#.to_vec());
    let payload = Base64Url::from_raw(claims.to_string().into_bytes());

    format!("{header}.{payload}.c2ln")
}

/// A bundle for `user-1` that expires at `exp`
pub(crate) fn bundle_expiring(exp: UnixTime, refresh_token: &str) -> TokenBundle {
    TokenBundle::from_tokens(
        AccessToken::new(fake_jwt(exp, None)),
        IdToken::new(fake_jwt(exp, Some("user-1"))),
        RefreshToken::new(refresh_token.to_owned()),
    )
    .expect("fake tokens carry an expiry")
}

/// What the next call to a [`CountingSource`] does
#[derive(Clone, Copy, Debug)]
pub(crate) enum Outcome {
    /// Issue a new bundle with a rotated refresh token
    Issue,
    /// Issue a new bundle, keeping the presented refresh token
    IssueWithoutRotation,
    /// Reject the grant
    Reject,
    /// Fail as if the network dropped
    Unavailable,
    /// Never answer
    Hang,
}

/// A token source that counts calls and follows a script
///
/// Once the script runs out every call issues a rotated bundle. Issued
/// bundles expire `lifetime` after the source's clock.
#[derive(Debug)]
pub(crate) struct CountingSource {
    clock: ManualClock,
    lifetime: DurationSecs,
    latency: Duration,
    script: Mutex<VecDeque<Outcome>>,
    refreshes: AtomicUsize,
    logins: AtomicUsize,
}

impl CountingSource {
    pub(crate) fn new(clock: ManualClock) -> Self {
        Self {
            clock,
            lifetime: DurationSecs(3600),
            latency: Duration::ZERO,
            script: Mutex::new(VecDeque::new()),
            refreshes: AtomicUsize::new(0),
            logins: AtomicUsize::new(0),
        }
    }

    /// Issues bundles that expire `lifetime` after the source's clock
    pub(crate) fn with_lifetime(mut self, lifetime: DurationSecs) -> Self {
        self.lifetime = lifetime;
        self
    }

    pub(crate) fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub(crate) fn then(self, outcome: Outcome) -> Self {
        self.script.lock().unwrap().push_back(outcome);
        self
    }

    pub(crate) fn refreshes(&self) -> usize {
        self.refreshes.load(Ordering::SeqCst)
    }

    pub(crate) fn logins(&self) -> usize {
        self.logins.load(Ordering::SeqCst)
    }

    async fn respond(&self, serial: usize, presented: Option<&RefreshTokenRef>) -> Result<TokenBundle, AuthFailure> {
        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Outcome::Issue);
        let exp = self.clock.now() + self.lifetime;
        let rotated = format!("rt-{serial}");

        match outcome {
            Outcome::Issue => Ok(bundle_expiring(exp, &rotated)),
            Outcome::IssueWithoutRotation => Ok(bundle_expiring(
                exp,
                presented.map_or(rotated.as_str(), |rt| rt.as_str()),
            )),
            Outcome::Reject => Err(AuthFailure::InvalidGrant("invalid_grant".into())),
            Outcome::Unavailable => Err(AuthFailure::transient("connection reset")),
            Outcome::Hang => std::future::pending().await,
        }
    }
}

#[async_trait]
impl TokenSource for CountingSource {
    async fn login(&self, _credentials: PasswordCredentials<'_>) -> Result<TokenBundle, AuthFailure> {
        let serial = self.logins.fetch_add(1, Ordering::SeqCst) + 1;
        self.respond(serial * 1000, None).await
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenBundle, AuthFailure> {
        let serial = self.refreshes.fetch_add(1, Ordering::SeqCst) + 1;
        self.respond(serial, Some(refresh_token)).await
    }
}
