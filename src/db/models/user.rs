//! User model and auth request/response types.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

pub const ROLE_CLIENT: &str = "client";

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub id: i64,
    pub username: String,
    pub email: String,
    /// None only for accounts provisioned without a login.
    pub password_hash: Option<String>,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub role: String,
    pub active: bool,
    pub email_verified: bool,
    pub email_verification_token: Option<String>,
    pub email_verification_expires_at: Option<String>,
    pub password_reset_token: Option<String>,
    pub password_reset_expires_at: Option<String>,
    /// Committed TOTP secret, encrypted at rest.
    pub two_factor_secret: Option<String>,
    /// Enrollment secret awaiting verification, encrypted at rest.
    pub two_factor_pending_secret: Option<String>,
    pub two_factor_enabled: bool,
    /// JSON array of SHA-256 hex digests of unconsumed backup codes.
    pub two_factor_backup_codes: Option<String>,
    pub last_login_at: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

/// Two-factor state derived from the raw row columns.
///
/// Secrets here are still in their encrypted at-rest form; decryption happens
/// at the point of use.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TwoFactorState {
    Disabled,
    PendingVerification {
        secret: String,
    },
    Enabled {
        secret: String,
        backup_code_hashes: Vec<String>,
    },
}

impl User {
    /// Interpret the 2FA columns as a state machine state.
    ///
    /// An enabled flag without a secret is a corrupt row and is refused
    /// rather than silently downgraded. An empty backup-code set is valid:
    /// the user spent them all.
    pub fn two_factor_state(&self) -> Result<TwoFactorState> {
        if self.two_factor_enabled {
            let secret = match &self.two_factor_secret {
                Some(s) => s.clone(),
                None => bail!("user {} has 2FA enabled without a secret", self.id),
            };
            let backup_code_hashes = parse_backup_codes(self.two_factor_backup_codes.as_deref())?;
            return Ok(TwoFactorState::Enabled {
                secret,
                backup_code_hashes,
            });
        }
        if let Some(secret) = &self.two_factor_pending_secret {
            return Ok(TwoFactorState::PendingVerification {
                secret: secret.clone(),
            });
        }
        Ok(TwoFactorState::Disabled)
    }
}

/// Parse the stored backup-code hash array.
pub fn parse_backup_codes(json: Option<&str>) -> Result<Vec<String>> {
    match json {
        Some(raw) => Ok(serde_json::from_str(raw)?),
        None => Ok(Vec::new()),
    }
}

/// Public view of a user, safe to return to clients.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UserResponse {
    pub id: i64,
    pub username: String,
    pub email: String,
    pub name: Option<String>,
    pub phone: Option<String>,
    pub role: String,
    pub email_verified: bool,
    pub two_factor_enabled: bool,
    pub last_login_at: Option<String>,
    pub created_at: String,
}

impl From<User> for UserResponse {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            username: user.username,
            email: user.email,
            name: user.name,
            phone: user.phone,
            role: user.role,
            email_verified: user.email_verified,
            two_factor_enabled: user.two_factor_enabled,
            last_login_at: user.last_login_at,
            created_at: user.created_at,
        }
    }
}

// -------------------------------------------------------------------------
// Request/response bodies
// -------------------------------------------------------------------------

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    pub username: String,
    pub email: String,
    pub password: String,
    pub confirm_password: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub phone: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LoginRequest {
    /// Username or email address.
    #[serde(alias = "email")]
    pub identifier: String,
    pub password: String,
}

/// Tokens handed out after full authentication.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AuthResponse {
    pub user: UserResponse,
    pub access_token: String,
}

/// Login stopped at the second factor.
#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChallengeResponse {
    #[serde(rename = "requires2FA")]
    pub requires_2fa: bool,
    pub user_id: i64,
    pub temp_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum LoginResponse {
    Tokens(AuthResponse),
    Challenge(ChallengeResponse),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerificationRequiredResponse {
    pub email_verification_required: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(untagged)]
pub enum RegisterResponse {
    Tokens(AuthResponse),
    VerificationRequired(VerificationRequiredResponse),
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VerifyTwoFactorRequest {
    pub user_id: i64,
    pub temp_token: String,
    pub token: String,
    #[serde(default)]
    pub is_backup_code: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshResponse {
    pub access_token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MessageResponse {
    pub message: String,
}

#[derive(Debug, Deserialize)]
pub struct ForgotPasswordRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResetPasswordRequest {
    pub token: String,
    pub password: String,
    pub confirm_password: String,
}

#[derive(Debug, Deserialize)]
pub struct VerifyEmailRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorStatusResponse {
    pub enabled: bool,
    pub has_backup_codes: bool,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorSetupResponse {
    pub qr_code_url: String,
    pub secret: String,
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TwoFactorVerifyRequest {
    pub token: String,
    /// The plaintext codes shown at setup, persisted on success.
    pub backup_codes: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TwoFactorVerifyResponse {
    pub message: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct TwoFactorDisableRequest {
    pub password: String,
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct TwoFactorDisableResponse {
    pub message: String,
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
pub struct RegenerateBackupCodesRequest {
    pub token: String,
}

#[derive(Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegenerateBackupCodesResponse {
    pub backup_codes: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn blank_user() -> User {
        User {
            id: 1,
            username: "alice".into(),
            email: "alice@example.com".into(),
            password_hash: Some("hash".into()),
            name: None,
            phone: None,
            role: ROLE_CLIENT.into(),
            active: true,
            email_verified: true,
            email_verification_token: None,
            email_verification_expires_at: None,
            password_reset_token: None,
            password_reset_expires_at: None,
            two_factor_secret: None,
            two_factor_pending_secret: None,
            two_factor_enabled: false,
            two_factor_backup_codes: None,
            last_login_at: None,
            created_at: "2026-01-01T00:00:00Z".into(),
            updated_at: "2026-01-01T00:00:00Z".into(),
        }
    }

    #[test]
    fn two_factor_state_disabled() {
        let user = blank_user();
        assert_eq!(user.two_factor_state().unwrap(), TwoFactorState::Disabled);
    }

    #[test]
    fn two_factor_state_pending() {
        let mut user = blank_user();
        user.two_factor_pending_secret = Some("enc".into());
        assert_eq!(
            user.two_factor_state().unwrap(),
            TwoFactorState::PendingVerification {
                secret: "enc".into()
            }
        );
    }

    #[test]
    fn two_factor_state_enabled() {
        let mut user = blank_user();
        user.two_factor_enabled = true;
        user.two_factor_secret = Some("enc".into());
        user.two_factor_backup_codes = Some(r#"["aa","bb"]"#.into());
        match user.two_factor_state().unwrap() {
            TwoFactorState::Enabled {
                backup_code_hashes, ..
            } => assert_eq!(backup_code_hashes.len(), 2),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn enabled_without_secret_is_refused() {
        let mut user = blank_user();
        user.two_factor_enabled = true;
        user.two_factor_backup_codes = Some(r#"["aa"]"#.into());
        assert!(user.two_factor_state().is_err());
    }

    #[test]
    fn enabled_with_exhausted_backup_codes_is_still_enabled() {
        let mut user = blank_user();
        user.two_factor_enabled = true;
        user.two_factor_secret = Some("enc".into());
        user.two_factor_backup_codes = Some("[]".into());
        match user.two_factor_state().unwrap() {
            TwoFactorState::Enabled {
                backup_code_hashes, ..
            } => assert!(backup_code_hashes.is_empty()),
            other => panic!("unexpected state: {:?}", other),
        }
    }

    #[test]
    fn user_response_hides_credentials() {
        let user = blank_user();
        let json = serde_json::to_value(UserResponse::from(user)).unwrap();
        assert!(json.get("passwordHash").is_none());
        assert!(json.get("password_hash").is_none());
        assert_eq!(json["username"], "alice");
    }

    #[test]
    fn login_request_accepts_email_alias() {
        let req: LoginRequest =
            serde_json::from_str(r#"{"email":"a@x.com","password":"pw"}"#).unwrap();
        assert_eq!(req.identifier, "a@x.com");
    }

    #[test]
    fn challenge_response_field_names() {
        let json = serde_json::to_value(ChallengeResponse {
            requires_2fa: true,
            user_id: 7,
            temp_token: "t".into(),
        })
        .unwrap();
        assert_eq!(json["requires2FA"], true);
        assert_eq!(json["userId"], 7);
        assert_eq!(json["tempToken"], "t");
    }
}
