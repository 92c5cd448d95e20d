//! The three exchanges of a refresh, sent through the inner Tower service.
//!
//! ```text
//! GET <auth api>/service                  -> {"data":{"id":"<service id>"}}
//! GET <ticket url>?service=<service id>   -> {"data":{"id":"<ticket id>"}}
//! GET <auth api>/token/new?st=<ticket id> -> {"data":{"id":"<access token>"}}
//! ```
//!
//! The requests go to the inner service directly, so they never pass
//! through the authentication hooks.

use std::fmt;

use bytes::Bytes;
use http::header::{ACCEPT, AUTHORIZATION};
use http::{Request, Response};
use http_body::Body;
use http_body_util::BodyExt;
use serde::Deserialize;
use tower::Service;
use tracing::{debug, warn};
use url::form_urlencoded;

#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("HTTP request failed: {0}")]
    HttpError(String),

    #[error("endpoint returned invalid response: {0}")]
    InvalidResponse(String),

    #[error("endpoint returned error (HTTP {status}): {body}")]
    EndpointError { status: u16, body: String },
}

#[derive(Deserialize)]
struct Envelope {
    data: Resource,
}

#[derive(Deserialize)]
struct Resource {
    id: String,
}

/// Fetch the service descriptor id.
pub(crate) async fn fetch_service<S, ReqBody, ResBody>(
    inner: &mut S,
    service_url: &str,
) -> Result<String, ExchangeError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: fmt::Debug,
    ReqBody: From<Bytes>,
    ResBody: Body,
    ResBody::Error: fmt::Debug,
{
    fetch_resource_id(inner, service_url.to_string(), None).await
}

/// Exchange a service descriptor id for a ticket id.
///
/// `bearer` is the token from the OAuth redirect fragment, when in OAuth mode.
pub(crate) async fn fetch_ticket<S, ReqBody, ResBody>(
    inner: &mut S,
    ticket_url: &str,
    service_id: &str,
    bearer: Option<&str>,
) -> Result<String, ExchangeError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: fmt::Debug,
    ReqBody: From<Bytes>,
    ResBody: Body,
    ResBody::Error: fmt::Debug,
{
    let url = with_query(ticket_url, &[("service", service_id)]);
    fetch_resource_id(inner, url, bearer).await
}

/// Exchange a ticket id for an access token.
pub(crate) async fn fetch_token<S, ReqBody, ResBody>(
    inner: &mut S,
    token_url: &str,
    ticket_id: &str,
) -> Result<String, ExchangeError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: fmt::Debug,
    ReqBody: From<Bytes>,
    ResBody: Body,
    ResBody::Error: fmt::Debug,
{
    let url = with_query(token_url, &[("st", ticket_id)]);
    fetch_resource_id(inner, url, None).await
}

/// Append form-encoded `params` to `base`, which may be absolute or
/// origin-relative. A fragment is dropped since it is never sent.
fn with_query(base: &str, params: &[(&str, &str)]) -> String {
    let target = base.split_once('#').map_or(base, |(target, _)| target);
    let query = form_urlencoded::Serializer::new(String::new())
        .extend_pairs(params)
        .finish();

    let separator = if !target.contains('?') {
        "?"
    } else if target.ends_with('?') || target.ends_with('&') {
        ""
    } else {
        "&"
    };
    format!("{target}{separator}{query}")
}

async fn fetch_resource_id<S, ReqBody, ResBody>(
    inner: &mut S,
    url: String,
    bearer: Option<&str>,
) -> Result<String, ExchangeError>
where
    S: Service<Request<ReqBody>, Response = Response<ResBody>>,
    S::Error: fmt::Debug,
    ReqBody: From<Bytes>,
    ResBody: Body,
    ResBody::Error: fmt::Debug,
{
    debug!(url = %url, "GET authentication endpoint");

    let mut builder = Request::get(url.as_str()).header(ACCEPT, "application/json");
    if let Some(token) = bearer {
        builder = builder.header(AUTHORIZATION, format!("Bearer {token}"));
    }
    let request = builder
        .body(ReqBody::from(Bytes::new()))
        .map_err(|e| ExchangeError::HttpError(format!("failed to build request: {e}")))?;

    std::future::poll_fn(|cx| inner.poll_ready(cx))
        .await
        .map_err(|e| ExchangeError::HttpError(format!("{e:?}")))?;

    let response = inner
        .call(request)
        .await
        .map_err(|e| ExchangeError::HttpError(format!("{e:?}")))?;

    let status = response.status();
    debug!(status = %status, url = %url, "authentication endpoint responded");

    let collected = BodyExt::collect(response.into_body())
        .await
        .map_err(|e| ExchangeError::HttpError(format!("failed to read response body: {e:?}")))?;
    let bytes = collected.to_bytes();

    if !status.is_success() {
        let body = String::from_utf8_lossy(&bytes).to_string();
        warn!(status = status.as_u16(), body = %body, "authentication endpoint returned error");
        return Err(ExchangeError::EndpointError {
            status: status.as_u16(),
            body,
        });
    }

    parse_resource_id(&bytes)
}

fn parse_resource_id(body: &[u8]) -> Result<String, ExchangeError> {
    let envelope: Envelope = serde_json::from_slice(body)
        .map_err(|e| ExchangeError::InvalidResponse(format!("expected data.id: {e}")))?;
    Ok(envelope.data.id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_resource_id_extracts_data_id() {
        let body = serde_json::to_vec(&serde_json::json!({
            "data": { "id": "svc1", "type": "service" }
        }))
        .unwrap();
        assert_eq!(parse_resource_id(&body).unwrap(), "svc1");
    }

    #[test]
    fn parse_resource_id_rejects_missing_id() {
        let body = serde_json::to_vec(&serde_json::json!({ "data": {} })).unwrap();
        assert!(matches!(
            parse_resource_id(&body),
            Err(ExchangeError::InvalidResponse(_))
        ));
    }

    #[test]
    fn with_query_appends_encoded_parameters() {
        let url = with_query(
            "https://sso.example.com/ticket?lang=en",
            &[("service", "https://app.example.com/?a=b")],
        );
        assert_eq!(
            url,
            "https://sso.example.com/ticket?lang=en&service=https%3A%2F%2Fapp.example.com%2F%3Fa%3Db"
        );
    }

    #[test]
    fn with_query_keeps_relative_urls() {
        assert_eq!(
            with_query("/ticket", &[("service", "svc1")]),
            "/ticket?service=svc1"
        );
        assert_eq!(
            with_query("/v1/token/new?", &[("st", "tkt 1")]),
            "/v1/token/new?st=tkt+1"
        );
    }

    #[test]
    fn with_query_drops_fragment() {
        assert_eq!(
            with_query("https://sso.example.com/ticket#login", &[("service", "svc1")]),
            "https://sso.example.com/ticket?service=svc1"
        );
    }
}
