//! Two-factor enrollment and management.
//!
//! The state machine is `disabled -> pending_verification -> enabled` and
//! back. Setup parks the encrypted secret in a pending column; nothing is
//! committed until the user proves possession of the authenticator. Disable
//! demands both the password and a current code: one stolen factor must not
//! be enough to remove the other.

use axum::{extract::State, Json};
use chrono::Utc;
use std::sync::Arc;

use crate::api::error::ApiError;
use crate::auth::totp::{consume_backup_code, generate_backup_codes, hash_backup_code};
use crate::auth::verify_password;
use crate::crypto;
use crate::db::{
    parse_backup_codes, RegenerateBackupCodesRequest, RegenerateBackupCodesResponse,
    TwoFactorDisableRequest, TwoFactorDisableResponse, TwoFactorSetupResponse, TwoFactorState,
    TwoFactorStatusResponse, TwoFactorVerifyRequest, TwoFactorVerifyResponse, User,
};
use crate::AppState;

fn now_ts() -> String {
    Utc::now().to_rfc3339()
}

/// Current 2FA state for the authenticated user
///
/// GET /2fa/status
pub async fn status(user: User) -> Result<Json<TwoFactorStatusResponse>, ApiError> {
    let has_backup_codes = !parse_backup_codes(user.two_factor_backup_codes.as_deref())
        .map_err(|e| ApiError::internal(format!("Corrupt backup code set: {}", e)))?
        .is_empty();
    Ok(Json(TwoFactorStatusResponse {
        enabled: user.two_factor_enabled,
        has_backup_codes,
    }))
}

/// Begin TOTP enrollment
///
/// POST /2fa/setup
pub async fn setup(
    State(state): State<Arc<AppState>>,
    user: User,
) -> Result<Json<TwoFactorSetupResponse>, ApiError> {
    if user.two_factor_enabled {
        return Err(ApiError::bad_request(
            "Two-factor authentication is already enabled",
        ));
    }

    let secret = crate::auth::totp::TotpEngine::generate_secret();
    let qr_code_url = state.totp.otpauth_url(&secret, &user.email)?;
    let backup_codes = generate_backup_codes(state.config.two_factor.backup_code_count);

    // Parked until verified; re-running setup simply replaces it
    let encrypted = crypto::encrypt(&secret, &state.secret_key)?;
    sqlx::query("UPDATE users SET two_factor_pending_secret = ?, updated_at = ? WHERE id = ?")
        .bind(&encrypted)
        .bind(now_ts())
        .bind(user.id)
        .execute(&state.db)
        .await?;

    tracing::info!(user_id = user.id, "Two-factor enrollment started");

    Ok(Json(TwoFactorSetupResponse {
        qr_code_url,
        secret,
        backup_codes,
    }))
}

/// Prove possession of the authenticator and commit enrollment
///
/// POST /2fa/verify
pub async fn verify(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(req): Json<TwoFactorVerifyRequest>,
) -> Result<Json<TwoFactorVerifyResponse>, ApiError> {
    let TwoFactorState::PendingVerification { secret: encrypted } = user.two_factor_state()? else {
        return Err(ApiError::bad_request("No enrollment in progress"));
    };

    if req.backup_codes.is_empty() {
        return Err(ApiError::bad_request("Backup codes are required"));
    }

    let secret = crypto::decrypt(&encrypted, &state.secret_key)?;
    if !state.totp.check(&secret, req.token.trim())? {
        return Err(ApiError::bad_request("Invalid two-factor code"));
    }

    let hashes: Vec<String> = req.backup_codes.iter().map(|c| hash_backup_code(c)).collect();
    let hashes_json = serde_json::to_string(&hashes)
        .map_err(|e| ApiError::internal(format!("Failed to encode backup codes: {}", e)))?;

    // Secret, codes, and flag commit together; the guard on the pending
    // column keeps a stale verify from re-enabling with an old secret.
    let result = sqlx::query(
        "UPDATE users SET two_factor_secret = ?, two_factor_backup_codes = ?,
                two_factor_enabled = 1, two_factor_pending_secret = NULL, updated_at = ?
         WHERE id = ? AND two_factor_pending_secret = ?",
    )
    .bind(&encrypted)
    .bind(&hashes_json)
    .bind(now_ts())
    .bind(user.id)
    .bind(&encrypted)
    .execute(&state.db)
    .await?;

    if result.rows_affected() == 0 {
        return Err(ApiError::bad_request("No enrollment in progress"));
    }

    tracing::info!(user_id = user.id, "Two-factor authentication enabled");

    Ok(Json(TwoFactorVerifyResponse {
        message: "Two-factor authentication enabled".to_string(),
        enabled: true,
    }))
}

/// Turn 2FA off. Requires the password and a current code (TOTP or backup).
///
/// POST /2fa/disable
pub async fn disable(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(req): Json<TwoFactorDisableRequest>,
) -> Result<Json<TwoFactorDisableResponse>, ApiError> {
    let TwoFactorState::Enabled {
        secret: encrypted,
        backup_code_hashes,
    } = user.two_factor_state()?
    else {
        return Err(ApiError::bad_request(
            "Two-factor authentication is not enabled",
        ));
    };

    let password_ok = user
        .password_hash
        .as_deref()
        .map(|hash| verify_password(&req.password, hash))
        .unwrap_or(false);
    if !password_ok {
        return Err(ApiError::bad_request("Password is incorrect"));
    }

    let secret = crypto::decrypt(&encrypted, &state.secret_key)?;
    let code = req.token.trim();
    let code_ok = state.totp.check(&secret, code)?
        || consume_backup_code(&backup_code_hashes, code).is_some();
    if !code_ok {
        return Err(ApiError::bad_request("Invalid two-factor code"));
    }

    sqlx::query(
        "UPDATE users SET two_factor_secret = NULL, two_factor_pending_secret = NULL,
                two_factor_backup_codes = NULL, two_factor_enabled = 0, updated_at = ?
         WHERE id = ?",
    )
    .bind(now_ts())
    .bind(user.id)
    .execute(&state.db)
    .await?;

    tracing::info!(user_id = user.id, "Two-factor authentication disabled");

    Ok(Json(TwoFactorDisableResponse {
        message: "Two-factor authentication disabled".to_string(),
        enabled: false,
    }))
}

/// Replace the whole backup-code set. Requires a current TOTP code.
///
/// PUT /2fa/regenerate-backup-codes
pub async fn regenerate_backup_codes(
    State(state): State<Arc<AppState>>,
    user: User,
    Json(req): Json<RegenerateBackupCodesRequest>,
) -> Result<Json<RegenerateBackupCodesResponse>, ApiError> {
    let TwoFactorState::Enabled { secret: encrypted, .. } = user.two_factor_state()? else {
        return Err(ApiError::bad_request(
            "Two-factor authentication is not enabled",
        ));
    };

    let secret = crypto::decrypt(&encrypted, &state.secret_key)?;
    if !state.totp.check(&secret, req.token.trim())? {
        return Err(ApiError::bad_request("Invalid two-factor code"));
    }

    let backup_codes = generate_backup_codes(state.config.two_factor.backup_code_count);
    let hashes: Vec<String> = backup_codes.iter().map(|c| hash_backup_code(c)).collect();
    let hashes_json = serde_json::to_string(&hashes)
        .map_err(|e| ApiError::internal(format!("Failed to encode backup codes: {}", e)))?;

    // One UPDATE replaces the set; every previously issued code dies with it
    sqlx::query("UPDATE users SET two_factor_backup_codes = ?, updated_at = ? WHERE id = ?")
        .bind(&hashes_json)
        .bind(now_ts())
        .bind(user.id)
        .execute(&state.db)
        .await?;

    tracing::info!(user_id = user.id, "Backup codes regenerated");

    Ok(Json(RegenerateBackupCodesResponse { backup_codes }))
}
