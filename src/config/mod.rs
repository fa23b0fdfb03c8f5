use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub two_factor: TwoFactorConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_api_port")]
    pub api_port: u16,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    /// Mark the refresh cookie Secure. Disable only for local development
    /// behind plain HTTP.
    #[serde(default = "default_true")]
    pub secure_cookies: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            api_port: default_api_port(),
            data_dir: default_data_dir(),
            secure_cookies: default_true(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_api_port() -> u16 {
    8080
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Secret used to sign access and refresh tokens (HS256).
    #[serde(default = "default_generated_secret")]
    pub jwt_secret: String,
    /// Secret the at-rest encryption key for TOTP secrets is derived from.
    #[serde(default = "default_generated_secret")]
    pub encryption_secret: String,
    #[serde(default = "default_access_token_minutes")]
    pub access_token_minutes: i64,
    #[serde(default = "default_refresh_token_days")]
    pub refresh_token_days: i64,
    /// Lifetime of the temp token handed out when login hits a 2FA challenge.
    #[serde(default = "default_challenge_minutes")]
    pub challenge_minutes: i64,
    /// Lifetime of password-reset and email-verification tokens.
    #[serde(default = "default_reset_token_minutes")]
    pub reset_token_minutes: i64,
    /// When set, registration returns an email-verification notice instead of
    /// tokens until the address is confirmed.
    #[serde(default)]
    pub require_email_verification: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: default_generated_secret(),
            encryption_secret: default_generated_secret(),
            access_token_minutes: default_access_token_minutes(),
            refresh_token_days: default_refresh_token_days(),
            challenge_minutes: default_challenge_minutes(),
            reset_token_minutes: default_reset_token_minutes(),
            require_email_verification: false,
        }
    }
}

fn default_generated_secret() -> String {
    // Generate a random secret if not provided. Tokens will not survive a
    // restart without an explicit secret in the config file.
    uuid::Uuid::new_v4().to_string()
}

fn default_access_token_minutes() -> i64 {
    15
}

fn default_refresh_token_days() -> i64 {
    7
}

fn default_challenge_minutes() -> i64 {
    5
}

fn default_reset_token_minutes() -> i64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct TwoFactorConfig {
    /// Issuer shown in authenticator apps.
    #[serde(default = "default_issuer")]
    pub issuer: String,
    #[serde(default = "default_digits")]
    pub digits: usize,
    /// Accepted clock drift in 30-second steps, each direction.
    #[serde(default = "default_skew")]
    pub skew: u8,
    #[serde(default = "default_backup_code_count")]
    pub backup_code_count: usize,
}

impl Default for TwoFactorConfig {
    fn default() -> Self {
        Self {
            issuer: default_issuer(),
            digits: default_digits(),
            skew: default_skew(),
            backup_code_count: default_backup_code_count(),
        }
    }
}

fn default_issuer() -> String {
    "Lexgate Portal".to_string()
}

fn default_digits() -> usize {
    6
}

fn default_skew() -> u8 {
    1
}

fn default_backup_code_count() -> usize {
    10
}

#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Idle time after which the client logs itself out.
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// How often the client checks the idle clock.
    #[serde(default = "default_check_interval_secs")]
    pub check_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            check_interval_secs: default_check_interval_secs(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    15 * 60
}

fn default_check_interval_secs() -> u64 {
    60
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_window_seconds")]
    pub window_seconds: u64,
    #[serde(default = "default_api_requests_per_window")]
    pub api_requests_per_window: u32,
    #[serde(default = "default_auth_requests_per_window")]
    pub auth_requests_per_window: u32,
    /// How often the background task prunes expired limiter entries.
    #[serde(default = "default_cleanup_interval_secs")]
    pub cleanup_interval_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            window_seconds: default_window_seconds(),
            api_requests_per_window: default_api_requests_per_window(),
            auth_requests_per_window: default_auth_requests_per_window(),
            cleanup_interval_secs: default_cleanup_interval_secs(),
        }
    }
}

fn default_window_seconds() -> u64 {
    60
}

fn default_api_requests_per_window() -> u32 {
    100
}

fn default_auth_requests_per_window() -> u32 {
    20
}

fn default_cleanup_interval_secs() -> u64 {
    300
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            info!("Loading configuration from {}", path.display());
            let content = std::fs::read_to_string(path)
                .with_context(|| format!("Failed to read config file: {}", path.display()))?;
            let config: Config = toml::from_str(&content)
                .with_context(|| "Failed to parse configuration file")?;
            Ok(config)
        } else {
            info!("No config file found, using defaults");
            Ok(Config::default())
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            auth: AuthConfig::default(),
            two_factor: TwoFactorConfig::default(),
            session: SessionConfig::default(),
            rate_limit: RateLimitConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.auth.access_token_minutes, 15);
        assert_eq!(config.auth.refresh_token_days, 7);
        assert_eq!(config.auth.challenge_minutes, 5);
        assert_eq!(config.two_factor.digits, 6);
        assert_eq!(config.two_factor.skew, 1);
        assert_eq!(config.session.idle_timeout_secs, 900);
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let config: Config = toml::from_str(
            r#"
            [auth]
            jwt_secret = "test-secret"
            access_token_minutes = 5
            "#,
        )
        .unwrap();
        assert_eq!(config.auth.jwt_secret, "test-secret");
        assert_eq!(config.auth.access_token_minutes, 5);
        assert_eq!(config.auth.refresh_token_days, 7);
        assert_eq!(config.two_factor.backup_code_count, 10);
    }
}
