//! Durable storage for the refresh token
//!
//! Only the refresh token is persisted; access and ID tokens are short-lived
//! and are obtained again on start-up.

use std::error;

use async_trait::async_trait;

use crate::{RefreshToken, RefreshTokenRef};

#[cfg(feature = "file")]
pub mod file;
pub mod in_memory;

#[cfg(feature = "file")]
pub use file::FileTokenStore;
pub use in_memory::InMemoryTokenStore;

/// The error type produced by token stores
pub type StoreError = Box<dyn error::Error + Send + Sync + 'static>;

/// Persistence for the refresh token
///
/// `save` must be atomic with respect to `load`: a concurrent reader sees
/// either the previous token or the new one, never a partial write.
#[async_trait]
pub trait TokenStore: Send + Sync {
    /// Loads the persisted refresh token, if one exists
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError>;

    /// Replaces the persisted refresh token
    async fn save(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError>;
}

#[async_trait]
impl<T: TokenStore + ?Sized> TokenStore for std::sync::Arc<T> {
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError> {
        (**self).load().await
    }

    async fn save(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError> {
        (**self).save(refresh_token).await
    }
}
