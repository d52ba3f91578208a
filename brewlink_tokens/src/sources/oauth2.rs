//! A token source that exchanges grants with the Auth0 authority

use async_trait::async_trait;
use reqwest::StatusCode;

use super::{PasswordCredentials, TokenSource};
use crate::{AuthFailure, ClientId, RefreshTokenRef, TokenBundle};

pub mod dto;

/// The Breville/Sage token endpoint
pub const DEFAULT_TOKEN_URL: &str = "https://my.breville.com/oauth/token";

/// The client ID used by the vendor's mobile application
pub const DEFAULT_CLIENT_ID: &str = "gSo1NuhsGPs5J2e5zyw0oGaSqdqsq2vc";

const DEFAULT_REALM: &str = "Salesforce";
const DEFAULT_LOGIN_SCOPE: &str = "openid profile email offline_access";
const DEFAULT_REFRESH_SCOPE: &str = "openid profile email";
const DEFAULT_AUDIENCE: &str = "https://iden-prod.us.auth0.com/userinfo";

/// Performs password-realm and refresh-token grants against an Auth0 tenant
#[derive(Debug)]
pub struct Auth0TokenSource {
    client: reqwest::Client,
    token_url: reqwest::Url,
    client_id: ClientId,
    realm: String,
    login_scope: String,
    refresh_scope: String,
    audience: String,
}

impl Auth0TokenSource {
    /// Constructs a new source with the vendor's realm, scopes, and audience
    pub fn new(client: reqwest::Client, token_url: reqwest::Url, client_id: ClientId) -> Self {
        Self {
            client,
            token_url,
            client_id,
            realm: DEFAULT_REALM.to_owned(),
            login_scope: DEFAULT_LOGIN_SCOPE.to_owned(),
            refresh_scope: DEFAULT_REFRESH_SCOPE.to_owned(),
            audience: DEFAULT_AUDIENCE.to_owned(),
        }
    }

    /// Overrides the realm used for the password grant
    pub fn with_realm(mut self, realm: impl Into<String>) -> Self {
        self.realm = realm.into();
        self
    }

    /// Overrides the audience requested at login
    pub fn with_audience(mut self, audience: impl Into<String>) -> Self {
        self.audience = audience.into();
        self
    }

    /// Overrides the scopes requested at login and on refresh
    ///
    /// Both should include `openid` so that an ID token is issued.
    pub fn with_scopes(mut self, login: impl Into<String>, refresh: impl Into<String>) -> Self {
        self.login_scope = login.into();
        self.refresh_scope = refresh.into();
        self
    }

    #[tracing::instrument(
        err,
        skip(self, form),
        fields(token_url = %self.token_url, client_id = %self.client_id),
    )]
    async fn exchange<F: serde::Serialize + Sync>(
        &self,
        grant: &'static str,
        form: &F,
    ) -> Result<dto::TokenResponse, AuthFailure> {
        tracing::trace!("requesting token from authority");

        let resp = self
            .client
            .post(self.token_url.clone())
            .form(form)
            .send()
            .await
            .map_err(AuthFailure::transient)?;

        let status = resp.status();
        tracing::debug!(
            response.status = status.as_u16(),
            "received token response from issuing authority"
        );

        let body = resp.bytes().await.map_err(AuthFailure::transient)?;

        if !status.is_success() {
            return Err(classify_rejection(status, &body));
        }

        serde_json::from_slice(&body)
            .map_err(|e| AuthFailure::Protocol(format!("undecodable token response: {e}")))
    }
}

/// Maps a non-success token endpoint response onto an [`AuthFailure`]
fn classify_rejection(status: StatusCode, body: &[u8]) -> AuthFailure {
    let detail: dto::ErrorResponse = serde_json::from_slice(body).unwrap_or_default();

    if detail.is_grant_rejection()
        || status == StatusCode::UNAUTHORIZED
        || status == StatusCode::FORBIDDEN
    {
        AuthFailure::InvalidGrant(detail.describe())
    } else if status.is_server_error()
        || status == StatusCode::TOO_MANY_REQUESTS
        || status == StatusCode::REQUEST_TIMEOUT
    {
        AuthFailure::transient(format!("authority returned {status}: {}", detail.describe()))
    } else {
        AuthFailure::Protocol(format!("authority returned {status}: {}", detail.describe()))
    }
}

#[async_trait]
impl TokenSource for Auth0TokenSource {
    async fn login(
        &self,
        credentials: PasswordCredentials<'_>,
    ) -> Result<TokenBundle, AuthFailure> {
        let form = dto::PasswordRealmRequest {
            grant_type: dto::PASSWORD_REALM_GRANT,
            realm: &self.realm,
            scope: &self.login_scope,
            audience: &self.audience,
            client_id: &self.client_id,
            username: credentials.username,
            password: credentials.password,
        };

        let resp = self.exchange("password-realm", &form).await?;

        let refresh_token = resp
            .refresh_token
            .ok_or_else(|| AuthFailure::Protocol("login issued no refresh token".into()))?;
        let id_token = resp
            .id_token
            .ok_or_else(|| AuthFailure::Protocol("login issued no ID token".into()))?;

        let bundle = TokenBundle::from_tokens(resp.access_token, id_token, refresh_token)?;
        tracing::info!(expires_at = bundle.expires_at().0, "logged in");
        Ok(bundle)
    }

    async fn refresh(&self, refresh_token: &RefreshTokenRef) -> Result<TokenBundle, AuthFailure> {
        let form = dto::RefreshTokenRequest {
            grant_type: "refresh_token",
            client_id: &self.client_id,
            refresh_token,
            scope: &self.refresh_scope,
        };

        let resp = self.exchange("refresh_token", &form).await?;

        let rotated = resp.refresh_token.is_some();
        let id_token = resp
            .id_token
            .ok_or_else(|| AuthFailure::Protocol("refresh issued no ID token".into()))?;
        let refresh_token = resp
            .refresh_token
            .unwrap_or_else(|| refresh_token.to_owned());

        let bundle = TokenBundle::from_tokens(resp.access_token, id_token, refresh_token)?;
        tracing::info!(
            rotated,
            expires_at = bundle.expires_at().0,
            "received new tokens"
        );
        Ok(bundle)
    }
}
