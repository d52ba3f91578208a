//! Token sources
//!
//! A token source performs the network exchange with the issuing authority.
//! It holds no token state of its own; the [`TokenManager`][crate::TokenManager]
//! decides when to call it.

use async_trait::async_trait;

use crate::{AuthFailure, PasswordRef, RefreshTokenRef, TokenBundle, UsernameRef};

#[cfg(feature = "oauth2")]
pub mod oauth2;

/// Account credentials used to bootstrap a session
#[derive(Clone, Copy, Debug)]
pub struct PasswordCredentials<'a> {
    /// The account name, usually an email address
    pub username: &'a UsernameRef,
    /// The account password
    pub password: &'a PasswordRef,
}

/// An asynchronous source for tokens
#[async_trait]
pub trait TokenSource: Send + Sync {
    /// Exchanges account credentials for a first token bundle
    async fn login(&self, credentials: PasswordCredentials<'_>)
        -> Result<TokenBundle, AuthFailure>;

    /// Exchanges a refresh token for a new token bundle
    ///
    /// If the authority does not rotate the refresh token, the returned bundle
    /// carries `refresh_token` unchanged.
    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenBundle, AuthFailure>;
}

#[async_trait]
impl<T: TokenSource + ?Sized> TokenSource for std::sync::Arc<T> {
    async fn login(
        &self,
        credentials: PasswordCredentials<'_>,
    ) -> Result<TokenBundle, AuthFailure> {
        (**self).login(credentials).await
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenBundle, AuthFailure> {
        (**self).refresh(refresh_token).await
    }
}
