//! Example: Make an authenticated request to a managed API.
//!
//! This example demonstrates the full setup of an authenticated HTTP client:
//! 1. Load the middleware config (global keys + instance table + `CAS_AUTH_*`)
//! 2. Build an `AuthenticationLayer` from the config (opens the token store
//!    when `cache_access_token` is set)
//! 3. Compose a Tower service stack with user-agent + auth
//! 4. Request the first managed API
//!
//! # Prerequisites
//!
//! A config file at the default config path (e.g.,
//! `~/.config/cas-auth/config.toml` on Linux) pointing at your CAS
//! deployment:
//!
//! ```toml
//! auth_api_base_url = "https://auth.example.com/v1"
//! ticket_url = "https://sso.example.com/cas/ticket"
//! managed_apis = ["https://api.example.com"]
//! cache_access_token = true
//! ```
//!
//! # Usage
//!
//! ```sh
//! RUST_LOG=cas_auth_middleware=debug cargo run --example use_client -- /users/me
//! ```

use bytes::Bytes;
use http::{HeaderValue, Request, header::USER_AGENT};
use http_body_util::{BodyExt, Full};
use hyper_util::{client::legacy::Client, rt::TokioExecutor};
use tower::{Service, ServiceBuilder, ServiceExt};
use tower_http::set_header::SetRequestHeaderLayer;

use cas_auth_middleware::{client::AuthenticationLayer, config};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cas_auth_middleware=info".parse().unwrap()),
        )
        .init();

    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("failed to install ring crypto provider");

    let instance = "default";
    let path = std::env::args().nth(1).unwrap_or_else(|| "/".to_string());

    // Step 1: Load the config for this instance.
    let cfg = config::load_config(Some(instance)).unwrap_or_else(|e| {
        eprintln!("Failed to load config: {e}");
        std::process::exit(1);
    });
    let Some(api) = cfg.managed_apis.first().cloned() else {
        eprintln!("No managed APIs configured, nothing to request");
        std::process::exit(1);
    };
    println!("Auth API:   {}", cfg.auth_api_base_url);
    println!("Ticket URL: {}", cfg.resolved_ticket_url());
    println!("Managed:    {:?}", cfg.managed_apis);

    // Step 2: Build the authentication layer.
    let auth_layer = AuthenticationLayer::from_config(cfg, instance).unwrap_or_else(|e| {
        eprintln!("Failed to create auth layer: {e}");
        std::process::exit(1);
    });

    // Step 3: Build the Tower service stack with an HTTPS-capable client.
    let https_connector = hyper_rustls::HttpsConnectorBuilder::new()
        .with_webpki_roots()
        .https_or_http()
        .enable_http1()
        .build();
    let http_client = Client::builder(TokioExecutor::new()).build(https_connector);

    // The request flows through SetRequestHeader → AuthenticationLayer → Client.
    let mut client = ServiceBuilder::new()
        .layer(SetRequestHeaderLayer::overriding(
            USER_AGENT,
            HeaderValue::from_static("cas-auth-middleware/0.1.0"),
        ))
        .layer(auth_layer)
        .service(http_client);

    // Step 4: Make an authenticated request.
    let uri = format!("{}{}", api.trim_end_matches('/'), path);
    println!("\nRequesting: {uri}");

    let request = Request::builder()
        .method("GET")
        .uri(uri)
        .header("Accept", "application/json")
        .body(Full::<Bytes>::default())
        .unwrap();

    match client.ready().await {
        Ok(ready_client) => match ready_client.call(request).await {
            Ok(response) => {
                println!("Status: {}", response.status());
                let body = response.into_body();
                let bytes = body.collect().await.unwrap().to_bytes();
                println!("Body: {}", String::from_utf8_lossy(&bytes));
            }
            Err(e) => {
                eprintln!("Request failed: {e}");
            }
        },
        Err(e) => {
            eprintln!("Service not ready: {e}");
        }
    }
}
