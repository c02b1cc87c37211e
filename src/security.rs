//! Session tokens and identifier validation.
//!
//! Sessions ride an opaque, unguessable cookie; the account hint is a
//! second cookie holding a validated identifier. Both are checked here
//! before any subprocess or registry state is touched.

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use thiserror::Error;

/// Cookie carrying the session token. Sliding TTL: refreshed on every
/// request that touches a session.
pub const SESSION_COOKIE: &str = "finops_session_id";

/// Cookie carrying the account hint used to rehydrate a missing session
/// record after an instance restart. Never overrides a bound account.
pub const ACCOUNT_HINT_COOKIE: &str = "finops_account_id";

/// Sliding lifetime for the session cookie, matching the registry's idle
/// timeout default.
pub const SESSION_COOKIE_MAX_AGE_SECS: u64 = 30 * 60;

const TOKEN_BYTES: usize = 32;
const MAX_ACCOUNT_ID_LEN: usize = 64;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("account id is empty")]
    EmptyAccountId,
    #[error("account id exceeds {MAX_ACCOUNT_ID_LEN} characters")]
    AccountIdTooLong,
    #[error("account id contains invalid characters")]
    InvalidAccountId,
    #[error("malformed session token")]
    InvalidSessionToken,
}

/// Generate a fresh opaque session token (256 bits, url-safe).
pub fn generate_session_token() -> String {
    let mut bytes = [0u8; TOKEN_BYTES];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Validate an account identifier: non-empty, bounded length, and only
/// `[A-Za-z0-9_-]`. Returns the input unchanged so callers can thread the
/// validated borrow onward.
pub fn validate_account_id(account_id: &str) -> Result<&str, ValidationError> {
    if account_id.is_empty() {
        return Err(ValidationError::EmptyAccountId);
    }
    if account_id.len() > MAX_ACCOUNT_ID_LEN {
        return Err(ValidationError::AccountIdTooLong);
    }
    if !account_id
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(ValidationError::InvalidAccountId);
    }
    Ok(account_id)
}

/// Validate a session token received in a cookie. Checks shape only; the
/// registry decides whether the token maps to a live session.
pub fn validate_session_token(token: &str) -> Result<&str, ValidationError> {
    let expected_len = URL_SAFE_NO_PAD.encode([0u8; TOKEN_BYTES]).len();
    if token.len() != expected_len {
        return Err(ValidationError::InvalidSessionToken);
    }
    if !token
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
    {
        return Err(ValidationError::InvalidSessionToken);
    }
    Ok(token)
}
