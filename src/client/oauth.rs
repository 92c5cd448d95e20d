//! OAuth browser-redirect mode.
//!
//! In this mode the ticket exchange is authorized with a token the identity
//! provider hands back in the URL fragment after a login redirect:
//!
//! ```text
//! app ──redirect──▶ <cas>/oauth2.0/authorize?response_type=token&client_id=..&redirect_uri=..&scope=..
//! app ◀─redirect─── <redirect_url>#access_token=...&token_type=bearer
//! ```
//!
//! The navigation context (reading the fragment, issuing the redirect) is
//! owned by the host and reached through [`UserAgent`].

use url::Url;

use crate::config::CasAuthConfig;

/// The host's navigation context.
pub trait UserAgent: Send + Sync {
    /// The fragment of the current location, without the leading `#`.
    fn fragment(&self) -> Option<String>;

    /// Navigate to the given URL. The current flow does not resume.
    fn redirect(&self, url: &Url);
}

/// Extract the `access_token` parameter from a URL fragment.
pub fn fragment_access_token(fragment: &str) -> Option<String> {
    let fragment = fragment.strip_prefix('#').unwrap_or(fragment);
    url::form_urlencoded::parse(fragment.as_bytes())
        .find(|(key, _)| key == "access_token")
        .map(|(_, value)| value.into_owned())
        .filter(|token| !token.is_empty())
}

/// Build the identity provider login URL for the implicit token flow.
///
/// Returns `None` when the configuration lacks the OAuth parameters or the
/// login URL does not parse.
pub fn login_redirect_url(config: &CasAuthConfig) -> Option<Url> {
    let login_url = config.login_url()?;
    let client_id = config.client_id.as_deref()?;
    let redirect_url = config.redirect_url.as_deref()?;

    Url::parse_with_params(
        &login_url,
        &[
            ("response_type", "token"),
            ("client_id", client_id),
            ("redirect_uri", redirect_url),
            ("scope", config.oauth_scope.as_str()),
        ],
    )
    .ok()
}
