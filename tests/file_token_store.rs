use std::time::Duration;

use cas_auth_middleware::config::ACCESS_TOKEN_KEY;
use cas_auth_middleware::store::{FileTokenStore, TokenStore, TokenStoreError};
use tempfile::TempDir;

use helper::fixture_path;

const HOUR: Duration = Duration::from_secs(3600);

#[test]
fn missing_file_reads_as_empty() {
    let dir = TempDir::new().unwrap();
    let store = FileTokenStore::new(dir.path().join("tokens.toml"), "default");

    assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
}

#[test]
fn set_then_get_in_nested_directory() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("cache").join("cas-auth").join("tokens.toml");
    let mut store = FileTokenStore::new(path.clone(), "default");

    store.set(ACCESS_TOKEN_KEY, "tok1", HOUR).unwrap();

    assert!(path.exists());
    assert_eq!(
        store.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
        Some("tok1")
    );
}

#[test]
fn namespaces_are_isolated() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.toml");
    let mut billing = FileTokenStore::new(path.clone(), "billing");
    let mut reports = FileTokenStore::new(path, "reports");

    billing.set(ACCESS_TOKEN_KEY, "billing-token", HOUR).unwrap();
    reports.set(ACCESS_TOKEN_KEY, "reports-token", HOUR).unwrap();
    billing.remove(ACCESS_TOKEN_KEY).unwrap();

    assert_eq!(billing.get(ACCESS_TOKEN_KEY).unwrap(), None);
    assert_eq!(
        reports.get(ACCESS_TOKEN_KEY).unwrap().as_deref(),
        Some("reports-token")
    );
}

#[test]
fn zero_ttl_reads_as_absent() {
    let dir = TempDir::new().unwrap();
    let mut store = FileTokenStore::new(dir.path().join("tokens.toml"), "default");

    store
        .set(ACCESS_TOKEN_KEY, "short-lived", Duration::ZERO)
        .unwrap();

    assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
}

#[test]
fn expired_entry_reads_as_absent() {
    let store = FileTokenStore::new(fixture_path("05-token-cache.toml"), "expired");

    assert_eq!(store.get(ACCESS_TOKEN_KEY).unwrap(), None);
}

#[test]
fn non_string_token_is_invalid_format() {
    let store = FileTokenStore::new(fixture_path("05-token-cache.toml"), "broken");

    let err = store.get(ACCESS_TOKEN_KEY).unwrap_err();
    assert!(matches!(err, TokenStoreError::InvalidStoreFormat { .. }));
}

#[test]
fn removing_a_missing_key_is_a_no_op() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("tokens.toml");
    let mut store = FileTokenStore::new(path.clone(), "default");

    store.remove(ACCESS_TOKEN_KEY).unwrap();

    assert!(!path.exists());
}
