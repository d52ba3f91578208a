//! An in-memory token store

use std::sync::Mutex;

use async_trait::async_trait;

use super::{StoreError, TokenStore};
use crate::{RefreshToken, RefreshTokenRef};

/// An in-memory refresh token store
///
/// Nothing survives the process; useful for tests and short-lived tools.
#[derive(Default, Debug)]
pub struct InMemoryTokenStore {
    token: Mutex<Option<RefreshToken>>,
    saves: Mutex<usize>,
}

impl InMemoryTokenStore {
    /// Constructs an empty store
    pub fn new() -> Self {
        Self::default()
    }

    /// Constructs a store already holding `refresh_token`
    pub fn with_token(refresh_token: RefreshToken) -> Self {
        Self {
            token: Mutex::new(Some(refresh_token)),
            saves: Mutex::new(0),
        }
    }

    /// The number of times [`save()`][TokenStore::save()] has been called
    pub fn save_count(&self) -> usize {
        *self.saves.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// The currently stored token, without going through the async interface
    pub fn snapshot(&self) -> Option<RefreshToken> {
        self.token.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

#[async_trait]
impl TokenStore for InMemoryTokenStore {
    async fn load(&self) -> Result<Option<RefreshToken>, StoreError> {
        Ok(self.snapshot())
    }

    async fn save(&self, refresh_token: &RefreshTokenRef) -> Result<(), StoreError> {
        *self.token.lock().unwrap_or_else(|e| e.into_inner()) = Some(refresh_token.to_owned());
        *self.saves.lock().unwrap_or_else(|e| e.into_inner()) += 1;
        Ok(())
    }
}
