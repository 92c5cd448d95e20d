use std::path::PathBuf;

use thiserror::Error;

const APPLICATION_DIRECTORY: &str = "cas-auth";

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum GetPathError {
    #[error("Could not determine config directory")]
    CouldNotDetermineConfigDir,
    #[error("Could not determine cache directory")]
    CouldNotDetermineCacheDir,
}

/// Get the path to the config file for the current platform
///
/// On macOS, this is `~/Library/Application Support/cas-auth/config.toml`
/// On Linux, this is `~/.config/cas-auth/config.toml`
/// On Windows, this is `%APPDATA%\cas-auth\config.toml`
pub fn config_file() -> Result<PathBuf, GetPathError> {
    let config_dir = dirs::config_dir().ok_or(GetPathError::CouldNotDetermineConfigDir)?;

    Ok(config_dir.join(APPLICATION_DIRECTORY).join("config.toml"))
}

/// Get the path to the token cache file for the current platform
///
/// On macOS, this is `~/Library/Caches/cas-auth/tokens.toml`
/// On Linux, this is `~/.cache/cas-auth/tokens.toml`
/// On Windows, this is `%LOCALAPPDATA%\cas-auth\tokens.toml`
pub fn token_cache_file() -> Result<PathBuf, GetPathError> {
    let cache_dir = dirs::cache_dir().ok_or(GetPathError::CouldNotDetermineCacheDir)?;

    Ok(cache_dir.join(APPLICATION_DIRECTORY).join("tokens.toml"))
}
