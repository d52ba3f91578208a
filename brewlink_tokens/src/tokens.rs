use brewlink_clock::{Clock, DurationSecs, UnixTime};

use crate::{
    claims::UnverifiedClaims, AccessToken, AccessTokenRef, AuthFailure, IdToken, IdTokenRef,
    RefreshToken, RefreshTokenRef,
};

/// The credentials issued together by the authority
///
/// A bundle is never modified after construction. Refreshing produces a new
/// bundle which replaces the old one wholesale.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TokenBundle {
    access_token: AccessToken,
    id_token: IdToken,
    refresh_token: RefreshToken,
    expires_at: UnixTime,
    subject: Option<String>,
}

/// A token's lifecycle status
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TokenStatus {
    /// The token is valid and outside the skew margin
    Fresh,
    /// The token is still valid, but inside the skew margin and should be refreshed
    Stale,
    /// The token is no longer valid
    Expired,
}

impl TokenBundle {
    /// Assembles a bundle, reading the expiry from the tokens themselves
    ///
    /// The `exp` claim of the ID token is preferred, falling back to that of the
    /// access token. Bundles whose tokens carry no readable expiry are rejected.
    pub fn from_tokens(
        access_token: AccessToken,
        id_token: IdToken,
        refresh_token: RefreshToken,
    ) -> Result<Self, AuthFailure> {
        let id_claims = UnverifiedClaims::decode(id_token.as_str()).ok();
        let expires_at = id_claims
            .as_ref()
            .and_then(|c| c.exp)
            .or_else(|| {
                UnverifiedClaims::decode(access_token.as_str())
                    .ok()
                    .and_then(|c| c.exp)
            })
            .ok_or_else(|| AuthFailure::Protocol("issued tokens carry no `exp` claim".into()))?;

        Ok(Self {
            access_token,
            id_token,
            refresh_token,
            expires_at,
            subject: id_claims.and_then(|c| c.sub),
        })
    }

    /// Gets the access token
    #[inline]
    pub fn access_token(&self) -> &AccessTokenRef {
        &self.access_token
    }

    /// Gets the ID token
    #[inline]
    pub fn id_token(&self) -> &IdTokenRef {
        &self.id_token
    }

    /// Gets the refresh token
    #[inline]
    pub fn refresh_token(&self) -> &RefreshTokenRef {
        &self.refresh_token
    }

    /// Gets the time at which the tokens expire
    #[inline]
    pub fn expires_at(&self) -> UnixTime {
        self.expires_at
    }

    /// Gets the user the ID token was issued to
    #[inline]
    pub fn subject(&self) -> Option<&str> {
        self.subject.as_deref()
    }

    /// Gets the bundle's lifetime status as of `now`
    ///
    /// The bundle is stale once `now` is within `skew` of expiry.
    pub fn status_at(&self, now: UnixTime, skew: DurationSecs) -> TokenStatus {
        if now >= self.expires_at {
            TokenStatus::Expired
        } else if now >= self.expires_at.saturating_sub(skew) {
            TokenStatus::Stale
        } else {
            TokenStatus::Fresh
        }
    }

    /// Gets the bundle's lifetime status according to `clock`
    #[inline]
    pub fn status_with_clock<C: Clock>(&self, clock: &C, skew: DurationSecs) -> TokenStatus {
        self.status_at(clock.now(), skew)
    }

    /// Whether the bundle may be handed out as of `now`
    #[inline]
    pub fn is_fresh_at(&self, now: UnixTime, skew: DurationSecs) -> bool {
        self.status_at(now, skew) == TokenStatus::Fresh
    }

    /// Gets how much longer the bundle will be fresh as of `now`
    #[inline]
    pub fn until_stale_at(&self, now: UnixTime, skew: DurationSecs) -> DurationSecs {
        self.expires_at.saturating_sub(skew) - now
    }
}
