//! Access and refresh token issuance and verification.
//!
//! Both tokens are HS256 JWTs signed with the configured secret. The access
//! token travels in the response body and the `Authorization` header; the
//! refresh token only ever travels in an HTTP-only cookie scoped to `/auth`.

use anyhow::{bail, Context, Result};
use axum_extra::extract::cookie::{Cookie, SameSite};
use chrono::{Duration, Utc};
use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};

/// Name of the refresh token cookie.
pub const REFRESH_COOKIE: &str = "lexgate_refresh";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TokenPurpose {
    Access,
    Refresh,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// User id.
    pub sub: i64,
    pub role: String,
    pub iat: i64,
    pub exp: i64,
    pub purpose: TokenPurpose,
}

/// Issue a signed token for a user.
pub fn issue(
    secret: &str,
    user_id: i64,
    role: &str,
    purpose: TokenPurpose,
    ttl: Duration,
) -> Result<String> {
    let now = Utc::now();
    let claims = Claims {
        sub: user_id,
        role: role.to_string(),
        iat: now.timestamp(),
        exp: (now + ttl).timestamp(),
        purpose,
    };
    encode(
        &Header::default(),
        &claims,
        &EncodingKey::from_secret(secret.as_bytes()),
    )
    .context("Failed to sign token")
}

/// Verify a token's signature, expiry, and purpose.
pub fn verify(secret: &str, token: &str, expected: TokenPurpose) -> Result<Claims> {
    let mut validation = Validation::default();
    validation.leeway = 5;
    let data = decode::<Claims>(
        token,
        &DecodingKey::from_secret(secret.as_bytes()),
        &validation,
    )
    .context("Invalid token")?;
    if data.claims.purpose != expected {
        bail!("Token purpose mismatch");
    }
    Ok(data.claims)
}

/// Build the refresh cookie. HTTP-only and strictly same-site so client
/// script never sees it.
pub fn refresh_cookie(token: String, max_age_days: i64, secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, token))
        .path("/auth")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::days(max_age_days))
        .build()
}

/// Build an expired refresh cookie, instructing the browser to drop it.
pub fn clear_refresh_cookie(secure: bool) -> Cookie<'static> {
    Cookie::build((REFRESH_COOKIE, ""))
        .path("/auth")
        .http_only(true)
        .secure(secure)
        .same_site(SameSite::Strict)
        .max_age(time::Duration::ZERO)
        .build()
}
