//! Registration, login, 2FA challenge completion, token refresh, and the
//! bearer-token extractor.
//!
//! Login is deliberately uniform about failure: an unknown identifier and a
//! wrong password take the same code path cost and produce the same error.

use axum::{
    async_trait,
    extract::{FromRequestParts, State},
    http::{request::Parts, StatusCode},
    response::IntoResponse,
    Json,
};
use axum_extra::extract::CookieJar;
use chrono::{Duration, Utc};
use std::sync::Arc;

use crate::api::error::{ApiError, ValidationErrorBuilder};
use crate::api::validation::{validate_email, validate_password, validate_username};
use crate::auth::tokens::{self, TokenPurpose};
use crate::auth::totp::{consume_backup_code, normalize_backup_code};
use crate::auth::{generate_token, hash_password, hash_token, verify_password, verify_password_dummy};
use crate::db::{
    AuthResponse, ChallengeResponse, DbPool, ForgotPasswordRequest, LoginRequest, LoginResponse,
    MessageResponse, RefreshResponse, RegisterRequest, RegisterResponse, ResetPasswordRequest,
    TwoFactorState, User, UserResponse, VerificationRequiredResponse, VerifyEmailRequest,
    VerifyTwoFactorRequest, ROLE_CLIENT,
};
use crate::{AppState, TwoFactorChallenge};

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

async fn find_by_identifier(pool: &DbPool, identifier: &str) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as("SELECT * FROM users WHERE username = ?1 OR email = ?1")
        .bind(identifier)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

pub(crate) async fn find_by_id(pool: &DbPool, id: i64) -> Result<Option<User>, ApiError> {
    let user = sqlx::query_as("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    Ok(user)
}

/// Mint an access token and a refresh cookie for a fully authenticated user,
/// stamping `last_login_at`.
async fn issue_session(
    state: &AppState,
    jar: CookieJar,
    user: User,
) -> Result<(CookieJar, AuthResponse), ApiError> {
    let auth = &state.config.auth;
    let access = tokens::issue(
        &auth.jwt_secret,
        user.id,
        &user.role,
        TokenPurpose::Access,
        Duration::minutes(auth.access_token_minutes),
    )?;
    let refresh = tokens::issue(
        &auth.jwt_secret,
        user.id,
        &user.role,
        TokenPurpose::Refresh,
        Duration::days(auth.refresh_token_days),
    )?;

    sqlx::query("UPDATE users SET last_login_at = ?, updated_at = ? WHERE id = ?")
        .bind(now_ts())
        .bind(now_ts())
        .bind(user.id)
        .execute(&state.db)
        .await?;

    let jar = jar.add(tokens::refresh_cookie(
        refresh,
        auth.refresh_token_days,
        state.config.server.secure_cookies,
    ));

    tracing::info!(user_id = user.id, username = %user.username, "Session issued");

    Ok((
        jar,
        AuthResponse {
            user: UserResponse::from(user),
            access_token: access,
        },
    ))
}

/// Register a new portal account
///
/// POST /auth/register
pub async fn register(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<RegisterRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_username(&req.username) {
        errors.add("username", e);
    }
    if let Err(e) = validate_email(&req.email) {
        errors.add("email", e);
    }
    if let Err(e) = validate_password(&req.password) {
        errors.add("password", e);
    }
    if req.password != req.confirm_password {
        errors.add("confirmPassword", "Passwords do not match");
    }
    errors.finish()?;

    let taken: Option<(i64,)> =
        sqlx::query_as("SELECT id FROM users WHERE username = ? OR email = ?")
            .bind(&req.username)
            .bind(&req.email)
            .fetch_optional(&state.db)
            .await?;
    if taken.is_some() {
        return Err(ApiError::validation_field(
            "username",
            "Username or email is already in use",
        ));
    }

    let password_hash =
        hash_password(&req.password).map_err(|e| ApiError::internal(format!("Hashing failed: {}", e)))?;

    let require_verification = state.config.auth.require_email_verification;
    let (verification_hash, verification_expiry) = if require_verification {
        let token = generate_token();
        // The portal's mailer picks this up; the core only records the token.
        tracing::info!(email = %req.email, token = %token, "Email verification token issued");
        (
            Some(hash_token(&token)),
            Some((Utc::now() + Duration::minutes(state.config.auth.reset_token_minutes)).to_rfc3339()),
        )
    } else {
        (None, None)
    };

    let user: User = sqlx::query_as(
        r#"INSERT INTO users
            (username, email, password_hash, name, phone, role, email_verified,
             email_verification_token, email_verification_expires_at, created_at, updated_at)
           VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
           RETURNING *"#,
    )
    .bind(&req.username)
    .bind(&req.email)
    .bind(&password_hash)
    .bind(&req.name)
    .bind(&req.phone)
    .bind(ROLE_CLIENT)
    .bind(!require_verification)
    .bind(&verification_hash)
    .bind(&verification_expiry)
    .bind(now_ts())
    .bind(now_ts())
    .fetch_one(&state.db)
    .await?;

    tracing::info!(user_id = user.id, username = %user.username, "User registered");

    if require_verification {
        return Ok((
            StatusCode::CREATED,
            jar,
            Json(RegisterResponse::VerificationRequired(
                VerificationRequiredResponse {
                    email_verification_required: true,
                },
            )),
        ));
    }

    let (jar, auth) = issue_session(&state, jar, user).await?;
    Ok((StatusCode::CREATED, jar, Json(RegisterResponse::Tokens(auth))))
}

/// Login with username or email
///
/// POST /auth/login
pub async fn login(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<LoginRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let user = match find_by_identifier(&state.db, &req.identifier).await? {
        Some(user) => user,
        None => {
            verify_password_dummy(&req.password);
            return Err(ApiError::invalid_credentials());
        }
    };

    let Some(hash) = user.password_hash.as_deref() else {
        // Provisioned account with no login
        verify_password_dummy(&req.password);
        return Err(ApiError::invalid_credentials());
    };

    if !verify_password(&req.password, hash) {
        return Err(ApiError::invalid_credentials());
    }

    if !user.active {
        return Err(ApiError::account_inactive());
    }

    if user.two_factor_enabled {
        // Password checks out but the second factor is pending: hand out a
        // short-lived challenge instead of tokens.
        state
            .challenges
            .retain(|_, c: &mut TwoFactorChallenge| c.expires_at > Utc::now());

        let temp_token = generate_token();
        state.challenges.insert(
            temp_token.clone(),
            TwoFactorChallenge {
                user_id: user.id,
                expires_at: Utc::now() + Duration::minutes(state.config.auth.challenge_minutes),
            },
        );

        tracing::info!(user_id = user.id, "Login challenged for second factor");

        return Ok((
            jar,
            Json(LoginResponse::Challenge(ChallengeResponse {
                requires_2fa: true,
                user_id: user.id,
                temp_token,
            })),
        ));
    }

    let (jar, auth) = issue_session(&state, jar, user).await?;
    Ok((jar, Json(LoginResponse::Tokens(auth))))
}

/// Complete a 2FA login challenge with a TOTP code or a backup code
///
/// POST /auth/verify-2fa
pub async fn verify_two_factor(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
    Json(req): Json<VerifyTwoFactorRequest>,
) -> Result<impl IntoResponse, ApiError> {
    // Single use: the challenge is gone whether or not the code is right.
    let Some((_, challenge)) = state.challenges.remove(&req.temp_token) else {
        return Err(ApiError::invalid_two_factor_code());
    };

    if challenge.expires_at <= Utc::now() || challenge.user_id != req.user_id {
        return Err(ApiError::invalid_two_factor_code());
    }

    let user = find_by_id(&state.db, req.user_id)
        .await?
        .ok_or_else(ApiError::invalid_two_factor_code)?;

    if !user.active {
        return Err(ApiError::account_inactive());
    }

    let TwoFactorState::Enabled {
        secret,
        backup_code_hashes,
    } = user.two_factor_state()?
    else {
        return Err(ApiError::invalid_two_factor_code());
    };

    if req.is_backup_code {
        let submitted = normalize_backup_code(&req.token);
        let Some(remaining) = consume_backup_code(&backup_code_hashes, &submitted) else {
            return Err(ApiError::invalid_two_factor_code());
        };

        // Compare-and-swap on the stored set: if a concurrent submission got
        // there first, zero rows change and this attempt loses.
        let old_json = user
            .two_factor_backup_codes
            .clone()
            .ok_or_else(ApiError::invalid_two_factor_code)?;
        let new_json = serde_json::to_string(&remaining)
            .map_err(|e| ApiError::internal(format!("Failed to encode backup codes: {}", e)))?;

        let result = sqlx::query(
            "UPDATE users SET two_factor_backup_codes = ?, updated_at = ?
             WHERE id = ? AND two_factor_backup_codes = ?",
        )
        .bind(&new_json)
        .bind(now_ts())
        .bind(user.id)
        .bind(&old_json)
        .execute(&state.db)
        .await?;

        if result.rows_affected() == 0 {
            return Err(ApiError::invalid_two_factor_code());
        }

        tracing::info!(user_id = user.id, remaining = remaining.len(), "Backup code consumed");
    } else {
        let secret_plain = crate::crypto::decrypt(&secret, &state.secret_key)?;
        if !state.totp.check(&secret_plain, req.token.trim())? {
            return Err(ApiError::invalid_two_factor_code());
        }
    }

    let (jar, auth) = issue_session(&state, jar, user).await?;
    Ok((jar, Json(auth)))
}

/// Mint a new access token from the refresh cookie
///
/// POST /auth/refresh
pub async fn refresh(
    State(state): State<Arc<AppState>>,
    jar: CookieJar,
) -> Result<impl IntoResponse, ApiError> {
    let secure = state.config.server.secure_cookies;

    let Some(cookie) = jar.get(tokens::REFRESH_COOKIE) else {
        return Err(ApiError::unauthorized("No refresh token"));
    };

    let claims = match tokens::verify(
        &state.config.auth.jwt_secret,
        cookie.value(),
        TokenPurpose::Refresh,
    ) {
        Ok(claims) => claims,
        Err(_) => {
            // Unusable cookie: tell the browser to drop it
            let jar = jar.add(tokens::clear_refresh_cookie(secure));
            return Ok((jar, Err::<Json<RefreshResponse>, _>(ApiError::unauthorized("Invalid refresh token"))).into_response());
        }
    };

    let user = match find_by_id(&state.db, claims.sub).await? {
        Some(user) if user.active => user,
        _ => {
            let jar = jar.add(tokens::clear_refresh_cookie(secure));
            return Ok((jar, Err::<Json<RefreshResponse>, _>(ApiError::unauthorized("Invalid refresh token"))).into_response());
        }
    };

    let auth = &state.config.auth;
    let access = tokens::issue(
        &auth.jwt_secret,
        user.id,
        &user.role,
        TokenPurpose::Access,
        Duration::minutes(auth.access_token_minutes),
    )?;
    // Rotate the refresh token on every use
    let rotated = tokens::issue(
        &auth.jwt_secret,
        user.id,
        &user.role,
        TokenPurpose::Refresh,
        Duration::days(auth.refresh_token_days),
    )?;
    let jar = jar.add(tokens::refresh_cookie(rotated, auth.refresh_token_days, secure));

    Ok((jar, Ok::<_, ApiError>(Json(RefreshResponse { access_token: access }))).into_response())
}

/// Clear the refresh cookie. Never fails, even without a valid session.
///
/// POST /auth/logout
pub async fn logout(State(state): State<Arc<AppState>>, jar: CookieJar) -> impl IntoResponse {
    let jar = jar.add(tokens::clear_refresh_cookie(
        state.config.server.secure_cookies,
    ));
    (
        jar,
        Json(MessageResponse {
            message: "Logged out".to_string(),
        }),
    )
}

/// Current user profile
///
/// GET /auth/me
pub async fn me(user: User) -> Json<UserResponse> {
    Json(UserResponse::from(user))
}

/// Request a password reset token
///
/// POST /auth/forgot-password
pub async fn forgot_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ForgotPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    // The response never reveals whether the address exists
    if let Some(user) = sqlx::query_as::<_, User>("SELECT * FROM users WHERE email = ?")
        .bind(&req.email)
        .fetch_optional(&state.db)
        .await?
    {
        let token = generate_token();
        let expires =
            (Utc::now() + Duration::minutes(state.config.auth.reset_token_minutes)).to_rfc3339();
        sqlx::query(
            "UPDATE users SET password_reset_token = ?, password_reset_expires_at = ?, updated_at = ?
             WHERE id = ?",
        )
        .bind(hash_token(&token))
        .bind(&expires)
        .bind(now_ts())
        .bind(user.id)
        .execute(&state.db)
        .await?;

        // The portal's mailer picks this up; the core only records the token.
        tracing::info!(user_id = user.id, token = %token, "Password reset token issued");
    }

    Ok(Json(MessageResponse {
        message: "If the address exists, a reset link has been sent".to_string(),
    }))
}

/// Consume a password reset token
///
/// POST /auth/reset-password
pub async fn reset_password(
    State(state): State<Arc<AppState>>,
    Json(req): Json<ResetPasswordRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let mut errors = ValidationErrorBuilder::new();
    if let Err(e) = validate_password(&req.password) {
        errors.add("password", e);
    }
    if req.password != req.confirm_password {
        errors.add("confirmPassword", "Passwords do not match");
    }
    errors.finish()?;

    let token_hash = hash_token(&req.token);
    let user: Option<User> = sqlx::query_as(
        "SELECT * FROM users WHERE password_reset_token = ? AND password_reset_expires_at > ?",
    )
    .bind(&token_hash)
    .bind(now_ts())
    .fetch_optional(&state.db)
    .await?;

    let user = user.ok_or_else(|| ApiError::bad_request("Invalid or expired reset token"))?;

    let password_hash =
        hash_password(&req.password).map_err(|e| ApiError::internal(format!("Hashing failed: {}", e)))?;

    // Clearing the token in the same guarded UPDATE makes it single-use even
    // under concurrent submissions.
    let result = sqlx::query(
        "UPDATE users SET password_hash = ?, password_reset_token = NULL,
                password_reset_expires_at = NULL, updated_at = ?
         WHERE id = ? AND password_reset_token = ?",
    )
    .bind(&password_hash)
    .bind(now_ts())
    .bind(user.id)
    .bind(&token_hash)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::bad_request("Invalid or expired reset token"));
    }

    tracing::info!(user_id = user.id, "Password reset completed");

    Ok(Json(MessageResponse {
        message: "Password has been reset".to_string(),
    }))
}

/// Consume an email verification token
///
/// POST /auth/verify-email
pub async fn verify_email(
    State(state): State<Arc<AppState>>,
    Json(req): Json<VerifyEmailRequest>,
) -> Result<Json<MessageResponse>, ApiError> {
    let token_hash = hash_token(&req.token);
    let result = sqlx::query(
        "UPDATE users SET email_verified = 1, email_verification_token = NULL,
                email_verification_expires_at = NULL, updated_at = ?
         WHERE email_verification_token = ? AND email_verification_expires_at > ?",
    )
    .bind(now_ts())
    .bind(&token_hash)
    .bind(now_ts())
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::bad_request("Invalid or expired verification token"));
    }

    Ok(Json(MessageResponse {
        message: "Email verified".to_string(),
    }))
}

fn extract_bearer(parts: &Parts) -> Option<&str> {
    parts
        .headers
        .get("Authorization")
        .and_then(|h| h.to_str().ok())
        .and_then(|h| h.strip_prefix("Bearer "))
}

/// Extractor for the current authenticated user.
#[async_trait]
impl FromRequestParts<Arc<AppState>> for User {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &Arc<AppState>,
    ) -> Result<Self, Self::Rejection> {
        let token =
            extract_bearer(parts).ok_or_else(|| ApiError::unauthorized("Missing bearer token"))?;

        let claims = tokens::verify(&state.config.auth.jwt_secret, token, TokenPurpose::Access)
            .map_err(|_| ApiError::unauthorized("Invalid or expired token"))?;

        let user = find_by_id(&state.db, claims.sub)
            .await?
            .ok_or_else(|| ApiError::unauthorized("Invalid or expired token"))?;

        if !user.active {
            return Err(ApiError::account_inactive());
        }

        Ok(user)
    }
}
