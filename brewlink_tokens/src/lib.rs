//! Single-flight token lifecycle management for the Breville/Sage IoT cloud
//!
//! The cloud issues a short-lived access token and ID token together with a
//! long-lived refresh token. This crate keeps exactly one valid bundle of those
//! tokens available to any number of concurrent callers.
//!
//! * A [`TokenManager`] owns the current [`TokenBundle`]. Callers ask it for a
//!   valid token; if the bundle is missing or within the skew margin of expiry,
//!   one refresh is performed and shared by every caller waiting on it.
//! * Rotated refresh tokens are written to a [`TokenStore`][stores::TokenStore]
//!   before the refresh completes, so a crash cannot leave the durable copy
//!   behind the in-memory one.
//! * If the authority rejects the refresh token, every later request fails with
//!   [`TokenError::Unauthenticated`] until credentials are bootstrapped again.
//! * An [`AuthorizedExecutor`] wraps outbound calls with the
//!   refresh-then-retry-once policy.
//!
//! ```
//! use brewlink_tokens::{sources::oauth2, stores::FileTokenStore, ClientId, TokenManager};
//!
//! # fn build() -> Result<(), Box<dyn std::error::Error>> {
//! let source = oauth2::Auth0TokenSource::new(
//!     reqwest::Client::new(),
//!     oauth2::DEFAULT_TOKEN_URL.parse()?,
//!     ClientId::from_static(oauth2::DEFAULT_CLIENT_ID),
//! );
//!
//! let manager = TokenManager::new(source, FileTokenStore::new("credentials.json"))
//!     .with_skew(brewlink_clock::DurationSecs(60));
//! # ;/* Commented out due to this trying to interact with the world.
//! let bundle = manager.valid_token().await?;
//! # */
//! # Ok(())
//! # }
//! ```
//!
//! A background refresher can keep the bundle fresh ahead of time so that
//! callers rarely wait; see [`TokenManager::spawn_refresher()`].
//!
//! # Features
//!
//! The following features are supported by this crate, all of which are enabled by default:
//!
//! * `oauth2`: Provides a token source for Auth0's _password-realm_ and
//!   _refresh token_ grants.
//! * `file`: Provides a token store using the local filesystem.
//! * `rand`: Provides for an implementation of [JitterSource][jitter::JitterSource] based on the
//!   random number generator provided by the [rand] crate, and jitters backoff delays.

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod authorized;
pub mod backoff;
mod braids;
pub mod claims;
mod error;
pub mod jitter;
mod manager;
mod refresher;
pub mod sources;
pub mod stores;
mod tokens;

#[cfg(test)]
mod test;

pub use authorized::{AuthorizedCall, AuthorizedError, AuthorizedExecutor};
pub use braids::*;
pub use error::{AuthFailure, SharedCause, TokenError, UnauthenticatedReason};
pub use manager::{RefreshResult, TokenManager, DEFAULT_REFRESH_TIMEOUT, DEFAULT_SKEW};
pub use refresher::HEARTBEAT;
pub use tokens::{TokenBundle, TokenStatus};
