pub mod api;
pub mod auth;
pub mod client;
pub mod config;
pub mod crypto;
pub mod db;

pub use db::DbPool;

use chrono::{DateTime, Utc};
use config::Config;
use dashmap::DashMap;
use std::sync::Arc;

use crate::api::rate_limit::RateLimiter;
use crate::auth::totp::TotpEngine;

/// A pending second-factor login: the password already checked out, the code
/// has not. Keyed by temp token, purged lazily on the next challenged login.
#[derive(Debug, Clone)]
pub struct TwoFactorChallenge {
    pub user_id: i64,
    pub expires_at: DateTime<Utc>,
}

pub struct AppState {
    pub config: Config,
    pub db: DbPool,
    pub challenges: DashMap<String, TwoFactorChallenge>,
    pub rate_limiter: Arc<RateLimiter>,
    pub totp: TotpEngine,
    /// At-rest encryption key for TOTP secrets, derived once at startup.
    pub secret_key: crypto::SecretKey,
}

impl AppState {
    pub fn new(config: Config, db: DbPool) -> Self {
        let rate_limiter = Arc::new(RateLimiter::new(config.rate_limit.clone()));
        let totp = TotpEngine::new(&config.two_factor);
        let secret_key = crypto::derive_key(&config.auth.encryption_secret);
        Self {
            config,
            db,
            challenges: DashMap::new(),
            rate_limiter,
            totp,
            secret_key,
        }
    }
}
