//! A client for the appliance REST API

use std::time::Duration;

use brewlink_clock::Clock;
use brewlink_tokens::{TokenError, TokenManager};
use predicates::prelude::*;
use reqwest::{header, Method, StatusCode, Url};
use reqwest_middleware::{ClientBuilder, ClientWithMiddleware, RequestBuilder};
use serde::Deserialize;
use serde_json::Value;
use thiserror::Error;

use crate::{AuthorizedMiddleware, ExactHostMatch, HttpsOnly, Idempotent};

/// The production API endpoint
pub const DEFAULT_BASE_URL: &str = "https://iot-api.breville.com";

/// The application identifier sent with each request
pub const DEFAULT_APP: &str = "sageCoffee";

const APP_HEADER: &str = "app";
const DEFAULT_RETRY_AFTER: Duration = Duration::from_secs(5);

/// Configuration for an [`ApplianceApi`]
#[derive(Clone, Debug)]
pub struct ApiConfig {
    base_url: Url,
    app: String,
    request_timeout: Duration,
    connect_timeout: Duration,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: Url::parse(DEFAULT_BASE_URL).expect("default base URL is valid"),
            app: DEFAULT_APP.to_owned(),
            request_timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl ApiConfig {
    /// Sends requests to `base_url` instead of the production endpoint
    pub fn with_base_url(mut self, base_url: Url) -> Self {
        self.base_url = base_url;
        self
    }

    /// Sets the application identifier sent in the `app` header
    pub fn with_app(mut self, app: impl Into<String>) -> Self {
        self.app = app.into();
        self
    }

    /// Sets the deadline for each request, including any replay
    pub fn with_request_timeout(mut self, request_timeout: Duration) -> Self {
        self.request_timeout = request_timeout;
        self
    }

    /// Sets the deadline for establishing a connection
    pub fn with_connect_timeout(mut self, connect_timeout: Duration) -> Self {
        self.connect_timeout = connect_timeout;
        self
    }

    /// The API endpoint
    pub fn base_url(&self) -> &Url {
        &self.base_url
    }
}

/// An error from the appliance API
#[derive(Debug, Error)]
pub enum ApiError {
    /// No valid token could be obtained, or the backend kept rejecting it
    #[error(transparent)]
    Token(#[from] TokenError),
    /// The request could not be sent or the response could not be read
    #[error("transport failure")]
    Transport(#[from] reqwest::Error),
    /// A middleware failed for a reason other than credentials
    #[error("middleware failure")]
    Middleware(#[source] anyhow::Error),
    /// The backend answered with a failure status
    #[error("backend answered {status}: {body}")]
    Status {
        /// The response status
        status: StatusCode,
        /// The response body, as text
        body: String,
    },
    /// The response body was not the JSON expected
    #[error("undecodable response body")]
    Decode(#[from] serde_json::Error),
    /// The request path could not be joined onto the base URL
    #[error("invalid request path {0:?}")]
    InvalidPath(String),
}

impl ApiError {
    /// Whether the credentials are unusable and must be bootstrapped again
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Token(err) if err.is_terminal())
    }

    /// Whether the caller may reasonably retry
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Token(err) => err.is_transient(),
            Self::Transport(err) => err.is_timeout() || err.is_connect(),
            Self::Status { status, .. } => {
                status.is_server_error() || *status == StatusCode::TOO_MANY_REQUESTS
            }
            Self::Middleware(_) | Self::Decode(_) | Self::InvalidPath(_) => false,
        }
    }
}

impl From<reqwest_middleware::Error> for ApiError {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => Self::Transport(err),
            reqwest_middleware::Error::Middleware(err) => match err.downcast::<TokenError>() {
                Ok(err) => Self::Token(err),
                Err(err) => Self::Middleware(err),
            },
        }
    }
}

/// An appliance registered to the account
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Appliance {
    /// The appliance's serial number
    pub serial_number: String,
    /// The model identifier, such as `BES995`
    pub model: String,
    /// The name the owner gave the appliance
    #[serde(default)]
    pub name: Option<String>,
    /// How the appliance was paired with the account
    #[serde(default)]
    pub pairing_type: Option<String>,
}

/// A client for appliance discovery and commands
///
/// Every request carries the current ID token. Requests rejected with `401`
/// are refreshed and replayed once; requests answered with `429` are retried
/// once after the delay the backend asks for.
#[derive(Clone, Debug)]
pub struct ApplianceApi {
    client: ClientWithMiddleware,
    config: ApiConfig,
}

impl ApplianceApi {
    /// Constructs a client that draws credentials from `tokens`
    ///
    /// Credentials are only attached to HTTPS requests to the configured host.
    pub fn new<C>(tokens: TokenManager<C>, config: ApiConfig) -> Result<Self, ApiError>
    where
        C: Clock + Clone + Send + Sync + 'static,
    {
        let host = config
            .base_url
            .host_str()
            .ok_or_else(|| ApiError::InvalidPath(config.base_url.to_string()))?
            .to_owned();

        let inner = reqwest::Client::builder()
            .timeout(config.request_timeout)
            .connect_timeout(config.connect_timeout)
            .build()?;

        let client = ClientBuilder::new(inner)
            .with(AuthorizedMiddleware::new(tokens).with_predicate(HttpsOnly.and(ExactHostMatch::new(host))))
            .build();

        Ok(Self::with_client(client, config))
    }

    /// Constructs a client around a prepared middleware stack
    pub fn with_client(client: ClientWithMiddleware, config: ApiConfig) -> Self {
        Self { client, config }
    }

    /// Lists the appliances registered to the user identified by `subject`
    ///
    /// Entries that cannot be understood are skipped.
    #[tracing::instrument(skip(self, subject))]
    pub async fn list_appliances(&self, subject: &str) -> Result<Vec<Appliance>, ApiError> {
        let path = format!("/user/v2/user/{}/appliances", urlencoding::encode(subject));
        let response = self.raw(Method::GET, &path, None).await?;

        let entries = match response.get("appliances") {
            Some(Value::Array(entries)) => entries.as_slice(),
            _ => &[],
        };

        let appliances: Vec<Appliance> = entries
            .iter()
            .filter_map(|entry| match Appliance::deserialize(entry) {
                Ok(appliance) => Some(appliance),
                Err(error) => {
                    tracing::warn!(%error, "skipping unrecognized appliance entry");
                    None
                }
            })
            .collect();

        tracing::info!(count = appliances.len(), "found appliances");
        Ok(appliances)
    }

    /// Sends a set of coffee parameters to an appliance
    ///
    /// The parameters describe a desired state, so a rejected command is
    /// replayed after a refresh even though it is a `POST`.
    pub async fn set_coffee_params(&self, serial: &str, params: &Value) -> Result<Value, ApiError> {
        let path = format!(
            "/appliance/v1/appliances/{}/set-coffeeParams",
            urlencoding::encode(serial)
        );
        self.send(Method::POST, &path, Some(params), true).await
    }

    /// Wakes an appliance
    #[tracing::instrument(skip(self))]
    pub async fn wake(&self, serial: &str) -> Result<Value, ApiError> {
        tracing::info!("waking appliance");
        self.set_coffee_params(serial, &serde_json::json!({ "state": "ready" }))
            .await
    }

    /// Puts an appliance to sleep
    #[tracing::instrument(skip(self))]
    pub async fn sleep(&self, serial: &str) -> Result<Value, ApiError> {
        tracing::info!("putting appliance to sleep");
        self.set_coffee_params(serial, &serde_json::json!({ "state": "asleep" }))
            .await
    }

    /// Sends an arbitrary request to the API
    ///
    /// `path` is resolved against the base URL. Only requests whose method is
    /// idempotent are replayed after a `401`; others surface the rejection.
    ///
    /// Empty responses decode as an empty JSON object.
    pub async fn raw(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Value, ApiError> {
        self.send(method, path, body, false).await
    }

    async fn send(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        replayable: bool,
    ) -> Result<Value, ApiError> {
        let url = self
            .config
            .base_url
            .join(path)
            .map_err(|_| ApiError::InvalidPath(path.to_owned()))?;

        tracing::debug!(%method, %url, "API request");

        let build = || -> RequestBuilder {
            let mut req = self
                .client
                .request(method.clone(), url.clone())
                .header(header::ACCEPT, "application/json")
                .header(APP_HEADER, &self.config.app);
            if replayable {
                req = req.with_extension(Idempotent);
            }
            match body {
                Some(body) => req.json(body),
                None => req,
            }
        };

        let mut response = build().send().await?;

        if response.status() == StatusCode::TOO_MANY_REQUESTS {
            let delay = retry_after(response.headers());
            tracing::warn!(delay_secs = delay.as_secs(), "rate limited, waiting");
            tokio::time::sleep(delay).await;
            response = build().send().await?;
        }

        let status = response.status();
        let bytes = response.bytes().await?;

        if !status.is_success() {
            let body = String::from_utf8_lossy(&bytes).into_owned();
            tracing::error!(%method, %url, status = status.as_u16(), "API error");
            return Err(ApiError::Status { status, body });
        }

        if status == StatusCode::NO_CONTENT || bytes.is_empty() {
            return Ok(Value::Object(Default::default()));
        }

        Ok(serde_json::from_slice(&bytes)?)
    }
}

fn retry_after(headers: &header::HeaderMap) -> Duration {
    headers
        .get(header::RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse::<u64>().ok())
        .map_or(DEFAULT_RETRY_AFTER, Duration::from_secs)
}
