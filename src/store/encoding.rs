use std::string::FromUtf8Error;

use base64::{DecodeError, Engine, prelude::*};
use thiserror::Error;

use crate::store::TokenStoreError;

const ENTRY_PREFIX: &str = "cas-auth-v1:";

#[derive(Debug, Error)]
pub enum DecodeEntryError {
    #[error("Missing entry prefix")]
    MissingPrefix,
    #[error("Missing expiry separator")]
    MissingSeparator,
    #[error("Invalid expiry value: {0}")]
    InvalidExpiry(#[from] std::num::ParseIntError),
    #[error("Invalid utf8 value: {0}")]
    InvalidUtf8Value(#[from] FromUtf8Error),
    #[error("Invalid base64 value: {0}")]
    InvalidBase64Value(#[from] DecodeError),
}

impl From<DecodeEntryError> for TokenStoreError {
    fn from(error: DecodeEntryError) -> Self {
        TokenStoreError::Serialization {
            reason: error.to_string(),
        }
    }
}

/// Encode a value together with its expiry (unix seconds) into one keychain password.
pub fn encode_entry(value: &str, expires_at: u64) -> String {
    format!(
        "{ENTRY_PREFIX}{expires_at}:{}",
        BASE64_STANDARD.encode(value)
    )
}

/// Decode a keychain password written by [`encode_entry`].
pub fn decode_entry(entry: &str) -> Result<(String, u64), DecodeEntryError> {
    let encoded = entry
        .strip_prefix(ENTRY_PREFIX)
        .ok_or(DecodeEntryError::MissingPrefix)?;
    let (expires_at, value) = encoded
        .split_once(':')
        .ok_or(DecodeEntryError::MissingSeparator)?;

    let expires_at = expires_at.parse::<u64>()?;
    let value = String::from_utf8(BASE64_STANDARD.decode(value)?)?;

    Ok((value, expires_at))
}
