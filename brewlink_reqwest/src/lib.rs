//! Middleware to attach cloud credentials to outgoing requests
//!
//! When using [`ClientWithMiddleware`](reqwest_middleware::ClientWithMiddleware),
//! include the [`AuthorizedMiddleware`] in the middleware stack to attach a
//! valid token from a [`TokenManager`] to each outbound request.
//!
//! If the backend answers `401 Unauthorized`, the middleware forces a token
//! refresh and sends the request exactly once more. A second `401` ends the
//! request with [`TokenError::Unauthenticated`]. Only requests that are safe
//! to send twice are replayed: those with an idempotent method, or those
//! explicitly marked with the [`Idempotent`] extension, and only when their
//! body can be cloned.
//!
//! If a request already carries the credential header by the time that the
//! middleware executes, the existing value is left in place and the request
//! is passed through untouched, allowing overrides to be specified as required.
//!
//! ```
//! use brewlink_reqwest::{AuthorizedMiddleware, ExactHostMatch, HttpsOnly, Idempotent};
//! use predicates::prelude::PredicateBooleanExt;
//! use reqwest_middleware::ClientBuilder;
//! # use brewlink_tokens::{stores::InMemoryTokenStore, TokenManager};
//! # fn tokens() -> TokenManager { unimplemented!() }
//! # fn build() {
//! let tokens: TokenManager = tokens();
//!
//! let client = ClientBuilder::new(reqwest::Client::default())
//!     .with(
//!         AuthorizedMiddleware::new(tokens)
//!             .with_predicate(HttpsOnly.and(ExactHostMatch::new("iot-api.breville.com"))),
//!     )
//!     .build();
//!
//! let req = client
//!     .post("https://iot-api.breville.com/appliance/v1/appliances/A1/set-coffeeParams")
//!     .with_extension(Idempotent)
//!     .json(&serde_json::json!({ "state": "ready" }));
//! # let _ = req;
//! # }
//! ```

#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    missing_copy_implementations,
    trivial_casts,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

use std::fmt;

use async_trait::async_trait;
use brewlink_clock::{Clock, System};
use brewlink_tokens::{
    AuthorizedCall, AuthorizedError, AuthorizedExecutor, TokenBundle, TokenError, TokenManager,
    UnauthenticatedReason,
};
use bytes::{BufMut, BytesMut};
use predicates::{prelude::*, reflection};
use reqwest::{
    header::{self, HeaderName, HeaderValue},
    Method, Request, Response, StatusCode,
};
use reqwest_middleware::{Middleware, Next, Result};

pub mod api;

pub use api::{ApiConfig, ApiError, Appliance, ApplianceApi};

/// The header in which the appliance API expects the ID token
pub const SF_ID_TOKEN: HeaderName = HeaderName::from_static("sf-id-token");

/// Marks a request as safe to send twice
///
/// Requests with methods that are not idempotent are only replayed after a
/// `401` when they carry this extension.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct Idempotent;

/// The credential attached to requests, and the header that carries it
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum CredentialHeader {
    /// The ID token as `sf-id-token`, as the appliance API expects
    #[default]
    SfIdToken,
    /// The access token as an `Authorization: Bearer` credential
    Bearer,
}

impl CredentialHeader {
    fn name(self) -> HeaderName {
        match self {
            Self::SfIdToken => SF_ID_TOKEN,
            Self::Bearer => header::AUTHORIZATION,
        }
    }

    fn value(self, bundle: &TokenBundle) -> std::result::Result<HeaderValue, header::InvalidHeaderValue> {
        let mut value = match self {
            Self::SfIdToken => HeaderValue::from_str(bundle.id_token().as_str())?,
            Self::Bearer => {
                let token = bundle.access_token().as_str();
                let mut header_value = BytesMut::with_capacity(token.len() + 7);
                header_value.put_slice(b"Bearer ");
                header_value.put_slice(token.as_bytes());
                HeaderValue::from_maybe_shared(header_value.freeze())?
            }
        };
        value.set_sensitive(true);
        Ok(value)
    }
}

/// A middleware that attaches credentials and recovers from one rejection
pub struct AuthorizedMiddleware<P, C = System> {
    executor: AuthorizedExecutor<C>,
    header: CredentialHeader,
    predicate: P,
}

impl<C> AuthorizedMiddleware<HttpsOnly, C>
where
    C: Clock + Clone + Send + Sync + 'static,
{
    /// Construct a new middleware from a token manager
    ///
    /// By default, this middleware will only send credentials if the request
    /// is being sent via HTTPS. To change this behavior, provide a
    /// custom predicate with [`with_predicate()`][Self::with_predicate()].
    pub fn new(tokens: TokenManager<C>) -> Self {
        Self {
            executor: AuthorizedExecutor::new(tokens),
            header: CredentialHeader::default(),
            predicate: HttpsOnly,
        }
    }
}

impl<P, C> AuthorizedMiddleware<P, C> {
    /// Replaces the default predicate with a custom predicate
    pub fn with_predicate<Q>(self, predicate: Q) -> AuthorizedMiddleware<Q, C> {
        AuthorizedMiddleware {
            executor: self.executor,
            header: self.header,
            predicate,
        }
    }

    /// Chooses which credential to attach
    pub fn with_credential_header(mut self, header: CredentialHeader) -> Self {
        self.header = header;
        self
    }
}

impl<P: fmt::Debug, C: fmt::Debug> fmt::Debug for AuthorizedMiddleware<P, C> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AuthorizedMiddleware")
            .field("executor", &self.executor)
            .field("header", &self.header)
            .field("predicate", &self.predicate)
            .finish()
    }
}

impl<P: Clone, C: Clone> Clone for AuthorizedMiddleware<P, C> {
    fn clone(&self) -> Self {
        Self {
            executor: self.executor.clone(),
            header: self.header,
            predicate: self.predicate.clone(),
        }
    }
}

fn is_replayable(req: &Request, extensions: &http::Extensions) -> bool {
    let idempotent_method = matches!(
        *req.method(),
        Method::GET | Method::HEAD | Method::PUT | Method::DELETE | Method::OPTIONS
    );

    let body_replayable = req.body().map_or(true, |body| body.as_bytes().is_some());

    (idempotent_method || extensions.get::<Idempotent>().is_some()) && body_replayable
}

/// One logical request, sent at most twice
struct MiddlewareCall<'a, 'n> {
    request: Option<Request>,
    replayable: bool,
    header: CredentialHeader,
    extensions: &'a mut http::Extensions,
    next: Next<'n>,
}

#[async_trait]
impl AuthorizedCall for MiddlewareCall<'_, '_> {
    type Output = Response;
    type Error = reqwest_middleware::Error;

    async fn call(&mut self, bundle: &TokenBundle) -> Result<Response> {
        let request = if self.replayable {
            self.request.as_ref().and_then(Request::try_clone)
        } else {
            self.request.take()
        };

        let mut request = request.ok_or_else(|| {
            reqwest_middleware::Error::Middleware(anyhow::anyhow!("request cannot be sent again"))
        })?;

        let value = self
            .header
            .value(bundle)
            .map_err(reqwest_middleware::Error::middleware)?;
        request.headers_mut().insert(self.header.name(), value);

        tracing::trace!(
            method = %request.method(),
            url = %request.url(),
            token.expires_at = bundle.expires_at().0,
            "sending authorized request"
        );

        self.next.clone().run(request, &mut *self.extensions).await
    }

    fn is_unauthorized(&self, result: &Result<Response>) -> bool {
        let unauthorized = matches!(result, Ok(resp) if resp.status() == StatusCode::UNAUTHORIZED);
        if unauthorized && !self.replayable {
            tracing::debug!("request rejected as unauthorized but cannot be replayed");
        }
        unauthorized && self.replayable
    }
}

#[async_trait]
impl<P, C> Middleware for AuthorizedMiddleware<P, C>
where
    P: Predicate<Request> + Send + Sync + 'static,
    C: Clock + Clone + Send + Sync + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        if !self.predicate.eval(&req) || req.headers().contains_key(self.header.name()) {
            return next.run(req, extensions).await;
        }

        let mut call = MiddlewareCall {
            replayable: is_replayable(&req, extensions),
            request: Some(req),
            header: self.header,
            extensions,
            next,
        };

        match self.executor.execute(&mut call).await {
            Ok(resp) => Ok(resp),
            Err(AuthorizedError::Call(err)) => Err(err),
            Err(AuthorizedError::Token(err)) => Err(reqwest_middleware::Error::middleware(err)),
            Err(AuthorizedError::Rejected) => Err(reqwest_middleware::Error::middleware(
                TokenError::from(UnauthenticatedReason::RejectedAfterRefresh),
            )),
        }
    }
}

/// Reports the request attribute a predicate looked at when its verdict
/// differs from `expected`
fn mismatch<'a, P>(
    predicate: &'a P,
    expected: bool,
    verdict: bool,
    attribute: &'static str,
    observed: &str,
) -> Option<reflection::Case<'a>>
where
    P: reflection::PredicateReflection,
{
    (verdict != expected).then(|| {
        reflection::Case::new(Some(predicate), verdict)
            .add_product(reflection::Product::new(attribute, observed.to_owned()))
    })
}

/// Attaches credentials only to requests sent over HTTPS
#[derive(Clone, Copy, Debug)]
pub struct HttpsOnly;

impl Predicate<Request> for HttpsOnly {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().scheme() == "https"
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        mismatch(self, expected, self.eval(req), "scheme", req.url().scheme())
    }
}

impl reflection::PredicateReflection for HttpsOnly {}

impl fmt::Display for HttpsOnly {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("scheme is https")
    }
}

/// Attaches credentials only to requests for one host
///
/// Useful when the same client also talks to hosts that must never see the
/// ID token.
#[derive(Clone, Debug)]
pub struct ExactHostMatch {
    host: String,
}

impl ExactHostMatch {
    /// Matches requests whose URL host is exactly `host`
    pub fn new(host: impl Into<String>) -> Self {
        Self { host: host.into() }
    }
}

impl Predicate<Request> for ExactHostMatch {
    #[inline]
    fn eval(&self, req: &Request) -> bool {
        req.url().host_str() == Some(self.host.as_str())
    }

    fn find_case(&self, expected: bool, req: &Request) -> Option<reflection::Case> {
        let host = req.url().host_str().unwrap_or("<no host>");
        mismatch(self, expected, self.eval(req), "host", host)
    }
}

impl reflection::PredicateReflection for ExactHostMatch {}

impl fmt::Display for ExactHostMatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "host is {}", self.host)
    }
}


#[cfg(test)]
mod tests {
    use std::sync::{atomic::Ordering, Arc};

    use reqwest::Client;
    use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};

    use super::{test::*, *};

    fn client(middleware: AuthorizedMiddleware<impl Predicate<Request> + Send + Sync + 'static>, backend: &Arc<Backend>) -> ClientWithMiddleware {
        ClientBuilder::new(Client::default())
            .with(middleware)
            .with_arc(backend.clone())
            .build()
    }

    mod when_request_has_no_credential_header {
        use super::*;

        #[tokio::test]
        async fn middleware_with_defaults_attaches_id_token_on_https_request() {
            let (_, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[200]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let resp = client.get("https://example.com").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.header_values("sf-id-token"), [Some(id_token(0))]);
        }

        #[tokio::test]
        async fn bearer_mode_attaches_access_token() {
            let (_, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[200]));
            let middleware =
                AuthorizedMiddleware::new(tokens).with_credential_header(CredentialHeader::Bearer);
            let client = client(middleware, &backend);

            client.get("https://example.com").send().await.unwrap();

            let values = backend.header_values("authorization");
            assert!(values[0].as_deref().is_some_and(|v| v.starts_with("Bearer ") && v.ends_with(".at-0")));
        }

        mod and_predicate_evaluates_to_ignore {
            use super::*;

            #[tokio::test]
            async fn middleware_does_not_attach_credentials() {
                let (_, tokens) = tokens();
                let backend = Arc::new(Backend::answering(&[200]));
                let middleware = AuthorizedMiddleware::new(tokens).with_predicate(predicate::never());
                let client = client(middleware, &backend);

                client.get("https://example.com").send().await.unwrap();

                assert_eq!(backend.header_values("sf-id-token"), [None]);
            }

            #[tokio::test]
            async fn plain_http_is_left_alone_by_default() {
                let (_, tokens) = tokens();
                let backend = Arc::new(Backend::answering(&[200]));
                let client = client(AuthorizedMiddleware::new(tokens), &backend);

                client.get("http://example.com").send().await.unwrap();

                assert_eq!(backend.header_values("sf-id-token"), [None]);
            }
        }
    }

    mod when_request_already_contains_a_credential_header {
        use super::*;

        #[tokio::test]
        async fn middleware_does_not_replace_it() {
            let (source, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[401]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let resp = client
                .get("https://example.com")
                .header("sf-id-token", "overridden!")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.header_values("sf-id-token"), [Some("overridden!".to_owned())]);
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 0);
        }
    }

    mod when_backend_rejects_the_token {
        use super::*;

        #[tokio::test]
        async fn idempotent_request_is_retried_once_with_refreshed_token() {
            let (source, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[401, 200]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let resp = client.get("https://example.com/thing").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
            assert_eq!(
                backend.header_values("sf-id-token"),
                [Some(id_token(0)), Some(id_token(1))]
            );
        }

        #[tokio::test]
        async fn second_rejection_is_unauthenticated() {
            let (source, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[401, 401, 200]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let err = client.get("https://example.com/thing").send().await.unwrap_err();

            let reqwest_middleware::Error::Middleware(err) = err else {
                panic!("expected a middleware error");
            };
            assert!(err.downcast_ref::<TokenError>().is_some_and(TokenError::is_terminal));
            assert_eq!(backend.requests(), 2);
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn post_is_not_replayed_unless_marked() {
            let (source, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[401, 200]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let resp = client
                .post("https://example.com/thing")
                .body("{}")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
            assert_eq!(backend.requests(), 1);
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 0);
        }

        #[tokio::test]
        async fn post_marked_idempotent_is_replayed() {
            let (source, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[401, 200]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let resp = client
                .post("https://example.com/thing")
                .with_extension(Idempotent)
                .body("{}")
                .send()
                .await
                .unwrap();

            assert_eq!(resp.status(), StatusCode::OK);
            assert_eq!(backend.requests(), 2);
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 1);
        }

        #[tokio::test]
        async fn forbidden_is_passed_through() {
            let (source, tokens) = tokens();
            let backend = Arc::new(Backend::answering(&[403]));
            let client = client(AuthorizedMiddleware::new(tokens), &backend);

            let resp = client.get("https://example.com/thing").send().await.unwrap();

            assert_eq!(resp.status(), StatusCode::FORBIDDEN);
            assert_eq!(source.refreshes.load(Ordering::SeqCst), 0);
        }
    }

    mod when_choosing_requests_to_authorize {
        use super::*;

        fn get(url: &str) -> Request {
            Request::new(reqwest::Method::GET, url.parse().unwrap())
        }

        #[test]
        fn https_only_accepts_only_https() {
            assert!(HttpsOnly.eval(&get("https://iot-api.breville.com/user/v2/user/appliances")));
            assert!(!HttpsOnly.eval(&get("http://iot-api.breville.com/user/v2/user/appliances")));
        }

        #[test]
        fn https_only_explains_a_rejected_scheme() {
            let request = get("http://iot-api.breville.com");

            assert!(HttpsOnly.find_case(false, &request).is_none());
            let case = HttpsOnly.find_case(true, &request).unwrap();
            let products: Vec<_> = case
                .products()
                .map(|p| (p.name().to_owned(), p.value().to_string()))
                .collect();
            assert_eq!(products, [("scheme".to_owned(), "http".to_owned())]);
        }

        #[test]
        fn exact_host_ignores_other_hosts() {
            let predicate = ExactHostMatch::new("iot-api.breville.com");

            assert!(predicate.eval(&get("https://iot-api.breville.com/appliance/v1")));
            assert!(!predicate.eval(&get("https://iot-api.breville.com.evil.test/")));
            assert!(predicate.find_case(false, &get("https://example.com")).is_none());
            assert!(predicate.find_case(true, &get("https://example.com")).is_some());
        }

        #[test]
        fn predicates_describe_themselves() {
            assert_eq!(HttpsOnly.to_string(), "scheme is https");
            assert_eq!(
                ExactHostMatch::new("iot-api.breville.com").to_string(),
                "host is iot-api.breville.com"
            );
        }
    }
}
