//! In-process stand-in for the CAS authentication service and a managed API.

use std::collections::{HashMap, HashSet};
use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use bytes::Bytes;
use http::header::{AUTHORIZATION, WWW_AUTHENTICATE};
use http::{Request, Response, StatusCode};
use http_body_util::Full;
use tower::Service;

use super::auth::Attempts;
use crate::config::{CasAuthConfig, CasAuthConfigBuilder};

pub(crate) const SERVICE_PATH: &str = "/v1/service";
pub(crate) const TICKET_PATH: &str = "/ticket";
pub(crate) const OAUTH_TICKET_PATH: &str = "/cas/oauth2.0/ticket";
pub(crate) const TOKEN_PATH: &str = "/v1/token/new";

/// A configuration pointing at [`MockCasService`], managing `https://api.example.com`.
pub(crate) fn test_config() -> CasAuthConfigBuilder {
    CasAuthConfig::builder()
        .auth_api_base_url("https://auth.example.com/v1")
        .ticket_url("https://sso.example.com/ticket")
        .add_managed_api("https://api.example.com")
}

#[derive(Debug, Clone)]
pub(crate) struct CapturedRequest {
    pub uri: http::Uri,
    pub headers: http::HeaderMap,
    pub attempts: Option<Attempts>,
}

impl CapturedRequest {
    pub fn path(&self) -> &str {
        self.uri.path()
    }

    pub fn query(&self) -> Option<&str> {
        self.uri.query()
    }

    pub fn authorization(&self) -> Option<&str> {
        self.headers
            .get(AUTHORIZATION)
            .and_then(|value| value.to_str().ok())
    }
}

type ApiHandler = Arc<dyn Fn(&CapturedRequest) -> Response<Full<Bytes>> + Send + Sync>;

/// Answers the service, ticket and token endpoints with `svc1`, `tkt1` and
/// `tok1`. Every other path is answered by the API handler.
#[derive(Clone)]
pub(crate) struct MockCasService {
    captured: Arc<Mutex<Vec<CapturedRequest>>>,
    failures: Arc<Mutex<HashMap<String, usize>>>,
    hanging: Arc<Mutex<HashSet<String>>>,
    api: ApiHandler,
}

impl MockCasService {
    pub fn new(
        api: impl Fn(&CapturedRequest) -> Response<Full<Bytes>> + Send + Sync + 'static,
    ) -> Self {
        MockCasService {
            captured: Arc::new(Mutex::new(Vec::new())),
            failures: Arc::new(Mutex::new(HashMap::new())),
            hanging: Arc::new(Mutex::new(HashSet::new())),
            api: Arc::new(api),
        }
    }

    /// The API always answers 200.
    pub fn new_ok() -> Self {
        Self::new(|_| ok_response())
    }

    /// The API challenges every request that does not carry `Bearer <token>`.
    pub fn challenge_unless(token: &'static str) -> Self {
        let expected = format!("Bearer {token}");
        Self::new(move |req| {
            if req.authorization() == Some(expected.as_str()) {
                ok_response()
            } else {
                challenge_response()
            }
        })
    }

    /// Answer `path` with a 500 for the next `times` calls.
    pub fn fail(self, path: &str, times: usize) -> Self {
        self.failures.lock().unwrap().insert(path.to_string(), times);
        self
    }

    /// Never answer `path`.
    pub fn hang(self, path: &str) -> Self {
        self.hanging.lock().unwrap().insert(path.to_string());
        self
    }

    pub fn captured(&self) -> Vec<CapturedRequest> {
        self.captured.lock().unwrap().clone()
    }

    pub fn paths(&self) -> Vec<String> {
        self.captured()
            .iter()
            .map(|req| req.path().to_string())
            .collect()
    }

    pub fn count(&self, path: &str) -> usize {
        self.captured()
            .iter()
            .filter(|req| req.path() == path)
            .count()
    }

    fn respond(&self, req: &CapturedRequest) -> Response<Full<Bytes>> {
        let mut failures = self.failures.lock().unwrap();
        if let Some(remaining) = failures.get_mut(req.path())
            && *remaining > 0
        {
            *remaining -= 1;
            return error_response();
        }
        drop(failures);

        match req.path() {
            SERVICE_PATH => resource_response("svc1"),
            TICKET_PATH | OAUTH_TICKET_PATH => resource_response("tkt1"),
            TOKEN_PATH => resource_response("tok1"),
            _ => (self.api)(req),
        }
    }
}

impl Service<Request<Full<Bytes>>> for MockCasService {
    type Response = Response<Full<Bytes>>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Response<Full<Bytes>>, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: Request<Full<Bytes>>) -> Self::Future {
        let captured = CapturedRequest {
            uri: req.uri().clone(),
            headers: req.headers().clone(),
            attempts: req.extensions().get::<Attempts>().copied(),
        };
        self.captured.lock().unwrap().push(captured.clone());

        if self.hanging.lock().unwrap().contains(captured.path()) {
            return Box::pin(std::future::pending());
        }

        let response = self.respond(&captured);
        Box::pin(async move { Ok(response) })
    }
}

pub(crate) fn ok_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::OK)
        .body(Full::new(Bytes::from_static(b"payload")))
        .unwrap()
}

pub(crate) fn challenge_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .header(WWW_AUTHENTICATE, "CAS realm=\"example\"")
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub(crate) fn unauthorized_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::UNAUTHORIZED)
        .body(Full::new(Bytes::new()))
        .unwrap()
}

pub(crate) fn error_response() -> Response<Full<Bytes>> {
    Response::builder()
        .status(StatusCode::INTERNAL_SERVER_ERROR)
        .body(Full::new(Bytes::from_static(b"boom")))
        .unwrap()
}

pub(crate) fn resource_response(id: &str) -> Response<Full<Bytes>> {
    let body = serde_json::json!({ "data": { "id": id } });
    Response::builder()
        .status(StatusCode::OK)
        .header("Content-Type", "application/json")
        .body(Full::new(Bytes::from(serde_json::to_vec(&body).unwrap())))
        .unwrap()
}

pub(crate) fn get_request(uri: &str) -> Request<Full<Bytes>> {
    Request::builder()
        .method(http::Method::GET)
        .uri(uri)
        .body(Full::new(Bytes::new()))
        .unwrap()
}
