//! HTTP client authentication against a CAS-style single sign-on service.
//!
//! The main components are:
//!
//! - [`AuthenticationLayer`] / [`Authentication`]: Tower middleware that
//!   attaches the access token to requests for managed APIs and
//!   re-authenticates when one of them answers with a CAS challenge.
//! - [`Coordinator`]: owns the access token and guarantees a single refresh
//!   at a time, shared by every request that needs it.
//! - [`UserAgent`]: the host's navigation context for OAuth redirect mode.
//! - [`AuthError`] / [`RefreshError`]: what can go wrong.
//!
//! # Example
//!
//! ```rust,ignore
//! use tower::ServiceBuilder;
//! use cas_auth_middleware::client::AuthenticationLayer;
//! use cas_auth_middleware::config::CasAuthConfig;
//!
//! let config = CasAuthConfig::builder()
//!     .auth_api_base_url("https://auth.example.com/v1")
//!     .ticket_url("https://sso.example.com/ticket")
//!     .add_managed_api("https://api.example.com")
//!     .build()?;
//!
//! let client = ServiceBuilder::new()
//!     .layer(AuthenticationLayer::from_config(config, "default")?)
//!     .service(http_client);
//! ```

pub mod auth;
mod cas;
pub mod challenge;
pub mod classifier;
pub mod coordinator;
pub mod error;
pub mod oauth;

#[cfg(test)]
pub(crate) mod testing;

pub use auth::{Attempts, Authentication, AuthenticationLayer};
pub use cas::ExchangeError;
pub use classifier::RequestKind;
pub use coordinator::{Coordinator, RefreshHandle};
pub use error::{AuthError, ErrorCode, FromConfigError, RefreshError};
pub use oauth::UserAgent;
