//! Detection of CAS authentication challenges.
//!
//! A response is a challenge only when it is a `401 Unauthorized` with a
//! `WWW-Authenticate` header whose auth-scheme is `CAS`. A bare 401, or one
//! asking for another scheme (Basic, Bearer, Digest), is passed through.

use http::header::WWW_AUTHENTICATE;
use http::{Response, StatusCode};

/// The auth-scheme that identifies a CAS challenge.
pub const CAS_CHALLENGE_SCHEME: &str = "CAS";

pub fn is_cas_challenge<B>(response: &Response<B>) -> bool {
    if response.status() != StatusCode::UNAUTHORIZED {
        return false;
    }

    response
        .headers()
        .get_all(WWW_AUTHENTICATE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .any(|value| {
            value
                .split_whitespace()
                .next()
                .is_some_and(|scheme| scheme.eq_ignore_ascii_case(CAS_CHALLENGE_SCHEME))
        })
}
