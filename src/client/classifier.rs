//! Decides which requests the middleware manages.

use http::Uri;

use crate::config::{CasAuthConfig, Endpoint};

/// How the middleware treats a request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RequestKind {
    /// Targets the authentication API itself; never touched.
    AuthService,
    /// Starts with a managed API prefix.
    Managed,
    Unmanaged,
}

impl RequestKind {
    pub fn is_managed(self) -> bool {
        self == RequestKind::Managed
    }
}

/// Classify a request URL against the configuration.
///
/// The service and token endpoints are checked first so that they are never
/// managed, even when a managed prefix covers them.
pub fn classify(url: &str, config: &CasAuthConfig) -> RequestKind {
    let without_query = url.split_once('?').map_or(url, |(path, _)| path);
    if without_query == config.api_url(Endpoint::Service)
        || without_query == config.api_url(Endpoint::Token)
    {
        return RequestKind::AuthService;
    }

    if is_managed_api(url, &config.managed_apis) {
        RequestKind::Managed
    } else {
        RequestKind::Unmanaged
    }
}

/// Classify an outgoing request by its URI.
pub fn classify_uri(uri: &Uri, config: &CasAuthConfig) -> RequestKind {
    classify(&uri.to_string(), config)
}

/// Case-sensitive prefix match against the managed API list.
pub fn is_managed_api(url: &str, managed_apis: &[String]) -> bool {
    managed_apis.iter().any(|prefix| url.starts_with(prefix.as_str()))
}
