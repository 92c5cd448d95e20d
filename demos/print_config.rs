use cas_auth_middleware::{
    config,
    config::ACCESS_TOKEN_KEY,
    store::{TokenStore, get_token_store},
};

pub fn main() {
    let instance = std::env::args().nth(1).unwrap_or_else(|| "default".to_string());

    // Load the config
    let config = config::load_config(Some(&instance)).unwrap();
    println!("{:#?}", config);

    if !config.cache_access_token {
        eprintln!("Token caching disabled for {instance}, exiting");
        return;
    }

    // Show whether a persisted token is available, without printing it
    let token_store = get_token_store(&instance).unwrap();
    match token_store.get(ACCESS_TOKEN_KEY).unwrap() {
        Some(token) => println!("Persisted access token: {} characters", token.len()),
        None => println!("No persisted access token"),
    }
}
