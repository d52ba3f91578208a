//! DTOs for interacting with the Auth0 token endpoint

use serde::{Deserialize, Serialize};

use crate::{AccessToken, ClientIdRef, IdToken, PasswordRef, RefreshToken, RefreshTokenRef, UsernameRef};

/// The grant type identifier for Auth0's password-realm extension grant
pub const PASSWORD_REALM_GRANT: &str = "http://auth0.com/oauth/grant-type/password-realm";

/// Form body for the password-realm grant
#[derive(Debug, Serialize)]
pub(super) struct PasswordRealmRequest<'a> {
    pub grant_type: &'static str,
    pub realm: &'a str,
    pub scope: &'a str,
    pub audience: &'a str,
    pub client_id: &'a ClientIdRef,
    pub username: &'a UsernameRef,
    pub password: &'a PasswordRef,
}

/// Form body for the refresh-token grant
#[derive(Debug, Serialize)]
pub(super) struct RefreshTokenRequest<'a> {
    pub grant_type: &'static str,
    pub client_id: &'a ClientIdRef,
    pub refresh_token: &'a RefreshTokenRef,
    pub scope: &'a str,
}

#[derive(Debug, Deserialize)]
pub(super) struct TokenResponse {
    pub access_token: AccessToken,
    #[serde(default)]
    pub id_token: Option<IdToken>,
    #[serde(default)]
    pub refresh_token: Option<RefreshToken>,
}

/// The error body of an OAuth2 token endpoint
#[derive(Debug, Default, Deserialize)]
pub(super) struct ErrorResponse {
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub error_description: Option<String>,
}

impl ErrorResponse {
    /// Whether the authority says the grant itself can never succeed
    pub fn is_grant_rejection(&self) -> bool {
        matches!(
            self.error.as_deref(),
            Some("invalid_grant" | "unauthorized_client" | "access_denied" | "invalid_client")
        )
    }

    pub fn describe(&self) -> String {
        match (&self.error, &self.error_description) {
            (Some(e), Some(d)) => format!("{e}: {d}"),
            (Some(e), None) => e.clone(),
            (None, Some(d)) => d.clone(),
            (None, None) => "no error detail".to_owned(),
        }
    }
}
