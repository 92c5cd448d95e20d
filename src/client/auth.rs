//! Tower middleware that authenticates requests to managed APIs.
//!
//! This module implements a [`Layer`] and [`Service`] pair that sits in
//! front of an HTTP client. Every outgoing request is classified first:
//!
//! - requests to the authentication service itself and to URLs outside the
//!   managed prefixes pass through untouched;
//! - requests to a managed API get `Authorization: Bearer <token>` and are
//!   retried after a re-authentication when the API answers with a CAS
//!   challenge (`401` + `WWW-Authenticate: CAS ...`).
//!
//! ```text
//! ┌──────────────────────────┐
//! │   AuthenticationLayer    │  ← Implements Layer<S>: creates Authentication<S>
//! │ ┌──────────────────────┐ │
//! │ │  Authentication<S>   │ │  ← Implements Service: pre-send, success and
//! │ │ ┌──────────────────┐ │ │    challenge hooks around the inner call
//! │ │ │  Inner Service S │ │ │  ← The actual HTTP client
//! │ │ └──────────────────┘ │ │
//! │ └──────────────────────┘ │
//! └──────────────────────────┘
//! ```
//!
//! # Token Acquisition
//!
//! A refresh clones the inner service and uses it for the service, ticket and
//! token exchanges, so they share the transport (TLS, proxies, connection
//! pool) of regular API requests. See [`Coordinator`] for how concurrent
//! requests share one refresh.

use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::AUTHORIZATION;
use http::{HeaderMap, HeaderValue, Method, Request, Response, Uri, Version};
use http_body::Body;
use tower::{Layer, Service};
use tracing::{debug, info, warn};

use crate::config::{CasAuthConfig, Settings};
use crate::store::{TokenStore, get_token_store};

use super::challenge;
use super::classifier::{self, RequestKind};
use super::coordinator::Coordinator;
use super::error::{AuthError, ErrorCode, FromConfigError};
use super::oauth::UserAgent;

/// Number of times a request has been sent, stamped into the request extensions.
///
/// A request that already carries the extension continues counting from it.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Attempts(pub u32);

impl Attempts {
    pub fn count(self) -> u32 {
        self.0
    }

    fn next(self) -> Self {
        Attempts(self.0.saturating_add(1))
    }
}

// ---------------------------------------------------------------------------
// Layer
// ---------------------------------------------------------------------------

/// A Tower [`Layer`] that authenticates requests to managed APIs.
///
/// ```rust,ignore
/// use tower::ServiceBuilder;
///
/// let config = CasAuthConfig::builder()
///     .auth_api_base_url("https://auth.example.com/v1")
///     .ticket_url("https://sso.example.com/ticket")
///     .add_managed_api("https://api.example.com")
///     .build()?;
///
/// let client = ServiceBuilder::new()
///     .layer(AuthenticationLayer::new(Settings::with_config(config)?))
///     .service(http_client);
/// ```
///
/// All services created by this layer share one [`Coordinator`], so they
/// share the access token and never refresh twice at the same time.
#[derive(Clone, Debug)]
pub struct AuthenticationLayer {
    coordinator: Coordinator,
}

impl AuthenticationLayer {
    /// Create a layer reading its configuration from `settings`.
    ///
    /// When `settings` has not been configured yet, the defaults are locked
    /// in on the first request.
    pub fn new(settings: Settings) -> Self {
        AuthenticationLayer {
            coordinator: Coordinator::new(settings),
        }
    }

    /// Create a layer from a configuration, opening the platform token store
    /// under `namespace` when `cache_access_token` is enabled.
    ///
    /// # Errors
    ///
    /// Returns [`FromConfigError`] if the configuration is invalid or no
    /// token store can be opened.
    pub fn from_config(config: CasAuthConfig, namespace: &str) -> Result<Self, FromConfigError> {
        let cache_access_token = config.cache_access_token;
        let layer = Self::new(Settings::with_config(config)?);

        if !cache_access_token {
            return Ok(layer);
        }

        let store = get_token_store(namespace)?;
        debug!(namespace, "opened token store");
        Ok(layer.with_token_store(store))
    }

    pub fn with_token_store(self, store: Box<dyn TokenStore>) -> Self {
        AuthenticationLayer {
            coordinator: self.coordinator.with_token_store(store),
        }
    }

    /// Attach the navigation context used in OAuth redirect mode.
    pub fn with_user_agent(self, user_agent: Arc<dyn UserAgent>) -> Self {
        AuthenticationLayer {
            coordinator: self.coordinator.with_user_agent(user_agent),
        }
    }

    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

impl<S> Layer<S> for AuthenticationLayer {
    type Service = Authentication<S>;

    fn layer(&self, service: S) -> Self::Service {
        Authentication {
            inner: service,
            coordinator: self.coordinator.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Service
// ---------------------------------------------------------------------------

/// Tower [`Service`] that authenticates requests to managed APIs.
///
/// `Authentication<S>` is `Clone` when `S` is `Clone`. All clones share the
/// same [`Coordinator`].
#[derive(Clone, Debug)]
pub struct Authentication<S> {
    inner: S,
    coordinator: Coordinator,
}

impl<S> Authentication<S> {
    pub fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

/// # Service Implementation
///
/// 1. **Boxed future**: a managed request may wait for a refresh and be sent
///    several times, so the amount of async work varies per request.
///
/// 2. **Service swap pattern**: the readied inner service moves into the
///    future and a fresh clone takes its place for the next request.
///
/// 3. **`ReqBody: Clone`**: a challenged request is resent with its
///    original body.
///
/// 4. **`ReqBody: From<Bytes>`**: the refresh exchanges are built in the
///    body type the inner service accepts.
impl<S, ReqBody, ResBody> Service<Request<ReqBody>> for Authentication<S>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + fmt::Debug,
    ReqBody: From<Bytes> + Clone + Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Send + fmt::Debug,
{
    type Response = Response<ResBody>;
    type Error = AuthError<S::Error>;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(AuthError::Inner)
    }

    fn call(&mut self, req: Request<ReqBody>) -> Self::Future {
        let coordinator = self.coordinator.clone();

        let mut inner = self.inner.clone();
        std::mem::swap(&mut self.inner, &mut inner);

        Box::pin(async move {
            let config = coordinator.settings();
            let kind = classifier::classify_uri(req.uri(), &config);
            debug!(uri = %req.uri(), kind = ?kind, "classified request");

            match kind {
                RequestKind::Managed => {
                    handle_managed_request(coordinator, config, inner, req).await
                }
                RequestKind::AuthService | RequestKind::Unmanaged => {
                    inner.call(req).await.map_err(AuthError::Inner)
                }
            }
        })
    }
}

// ---------------------------------------------------------------------------
// Managed Request Flow
// ---------------------------------------------------------------------------

/// Send a managed request until it succeeds, stops being challenged, or
/// runs out of attempts.
///
/// Each pass:
/// 1. **Pre-send**: wait for the refresh in flight (or start one when a token
///    is required and missing), then attach the held token.
/// 2. **Send** with the [`Attempts`] extension stamped.
/// 3. **Success (2xx)**: persist the token and return the response.
/// 4. **CAS challenge** with attempts left: re-authenticate and go again.
///    Any other response, or a failed re-authentication, is returned as-is.
async fn handle_managed_request<S, ReqBody, ResBody>(
    coordinator: Coordinator,
    config: Arc<CasAuthConfig>,
    mut inner: S,
    req: Request<ReqBody>,
) -> Result<Response<ResBody>, AuthError<S::Error>>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>> + Clone + Send + 'static,
    S::Future: Send,
    S::Error: Send + fmt::Debug,
    ReqBody: From<Bytes> + Clone + Send + 'static,
    ResBody: Body + Send + 'static,
    ResBody::Data: Send,
    ResBody::Error: Send + fmt::Debug,
{
    let mut attempts = req
        .extensions()
        .get::<Attempts>()
        .copied()
        .unwrap_or_default();
    let template = RequestTemplate::capture(&req);
    let mut first = Some(req);

    loop {
        attempts = attempts.next();

        let access_token = coordinator
            .prepare_request::<S, ReqBody, ResBody>(inner.clone())
            .await?;

        let mut request = first.take().unwrap_or_else(|| template.build());
        request.extensions_mut().insert(attempts);
        match &access_token {
            Some(token) => {
                debug!(
                    token_prefix = token.get(..token.len().min(8)).unwrap_or_default(),
                    token_len = token.len(),
                    attempt = attempts.count(),
                    "attaching Bearer token"
                );
                request
                    .headers_mut()
                    .insert(AUTHORIZATION, make_bearer_header(token)?);
            }
            None => debug!(attempt = attempts.count(), "no access token held, sending as-is"),
        }

        let response = inner.call(request).await.map_err(AuthError::Inner)?;
        debug!(
            status = %response.status(),
            attempt = attempts.count(),
            "managed response received"
        );

        if response.status().is_success() {
            coordinator.persist_token().await;
            return Ok(response);
        }

        if !challenge::is_cas_challenge(&response) {
            return Ok(response);
        }

        if attempts.count() >= config.max_attempts {
            warn!(
                code = %ErrorCode::RetryExceeded,
                attempts = attempts.count(),
                max_attempts = config.max_attempts,
                "CAS challenge after the last attempt, giving up"
            );
            return Ok(response);
        }

        // A concurrent refresh may already have replaced the token this
        // request was sent with.
        let current = coordinator.access_token().await;
        if current.is_some() && current != access_token {
            debug!(attempt = attempts.count(), "token changed since send, retrying");
        } else {
            info!(attempt = attempts.count(), "received CAS challenge, re-authenticating");
            let refresh = coordinator
                .begin_authentication::<S, ReqBody, ResBody>(inner.clone())
                .await;
            if let Err(e) = refresh.wait().await {
                warn!(error = %e, "re-authentication failed, returning challenge");
                return Ok(response);
            }
        }

        std::future::poll_fn(|cx| inner.poll_ready(cx))
            .await
            .map_err(AuthError::Inner)?;
    }
}

fn make_bearer_header<E>(token: &str) -> Result<HeaderValue, AuthError<E>> {
    HeaderValue::from_str(&format!("Bearer {token}")).map_err(|e| {
        AuthError::InvalidToken(format!("token contains invalid header characters: {e}"))
    })
}

/// The parts of a request needed to send it again.
///
/// `http::Request` is not `Clone`, so the parts are saved before the first
/// send consumes it. Extensions other than [`Attempts`] are not replayed.
struct RequestTemplate<B> {
    method: Method,
    uri: Uri,
    version: Version,
    headers: HeaderMap,
    body: B,
}

impl<B: Clone> RequestTemplate<B> {
    fn capture(req: &Request<B>) -> Self {
        RequestTemplate {
            method: req.method().clone(),
            uri: req.uri().clone(),
            version: req.version(),
            headers: req.headers().clone(),
            body: req.body().clone(),
        }
    }

    fn build(&self) -> Request<B> {
        let mut req = Request::new(self.body.clone());
        *req.method_mut() = self.method.clone();
        *req.uri_mut() = self.uri.clone();
        *req.version_mut() = self.version;
        *req.headers_mut() = self.headers.clone();
        req
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
