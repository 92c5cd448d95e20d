//! Tower middleware that transparently authenticates outgoing HTTP requests
//! against a CAS-style single sign-on service.
//!
//! Requests whose URL starts with one of the configured managed API prefixes
//! get an `Authorization: Bearer` header. When such a request is answered
//! with a `401` carrying a `WWW-Authenticate: CAS` challenge, the middleware
//! runs a single shared refresh (service → ticket → token) and replays the
//! request, bounded by `max_attempts`.

pub mod client;
pub mod config;
pub mod path;
pub mod store;
