//! Registry token inspection.
//!
//! The registry issues JWTs whose signatures we cannot (and need not) verify;
//! we only read the expiry claim to decide when to refresh.

use chrono::{DateTime, TimeZone, Utc};
use jsonwebtoken::{decode, Algorithm, DecodingKey, Validation};
use serde::Deserialize;
use thiserror::Error;

/// Error type for token inspection.
#[derive(Debug, Error)]
pub enum TokenError {
    #[error("Failed to decode token: {0}")]
    DecodingError(String),
}

/// Expiry-related claims. The registry uses either `exp` (seconds) or `expireAt` (milliseconds).
#[derive(Debug, Clone, Deserialize)]
struct ExpiryClaims {
    #[serde(default)]
    exp: Option<i64>,
    #[serde(default, rename = "expireAt")]
    expire_at: Option<i64>,
}

/// Reads the expiry instant from a token without verifying its signature.
///
/// Returns `Ok(None)` when the token carries no expiry claim.
pub fn peek_expiry(token: &str) -> Result<Option<DateTime<Utc>>, TokenError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.insecure_disable_signature_validation();
    validation.validate_exp = false;
    validation.validate_aud = false;
    validation.required_spec_claims.clear();

    let data = decode::<ExpiryClaims>(token, &DecodingKey::from_secret(&[]), &validation)
        .map_err(|e| TokenError::DecodingError(e.to_string()))?;

    let expiry = match (data.claims.expire_at, data.claims.exp) {
        (Some(millis), _) => Utc.timestamp_millis_opt(millis).single(),
        (None, Some(secs)) => Utc.timestamp_opt(secs, 0).single(),
        (None, None) => None,
    };
    Ok(expiry)
}
