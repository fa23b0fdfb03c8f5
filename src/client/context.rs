//! High-level session facade composing the token manager and the idle guard.

use parking_lot::Mutex;
use std::sync::Arc;

use super::session_guard::SessionGuard;
use super::storage::TokenStorage;
use super::token_manager::{ClientError, TokenManager};
use crate::config::SessionConfig;
use crate::db::{
    AuthResponse, ChallengeResponse, LoginRequest, LoginResponse, MessageResponse,
    RegisterRequest, RegisterResponse, UserResponse, VerifyTwoFactorRequest,
};

/// Outcome of a login attempt.
#[derive(Debug)]
pub enum LoginFlow {
    LoggedIn(UserResponse),
    /// Password accepted, second factor pending. Complete with
    /// [`AuthSession::verify_two_factor`].
    TwoFactorRequired(ChallengeResponse),
}

pub struct AuthSession {
    manager: Arc<TokenManager>,
    guard: Arc<SessionGuard>,
    user: Mutex<Option<UserResponse>>,
}

impl AuthSession {
    pub fn new(
        base_url: impl Into<String>,
        session: &SessionConfig,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<Self, ClientError> {
        let manager = Arc::new(TokenManager::new(base_url, storage.clone())?);
        let guard = Arc::new(SessionGuard::new(session, storage));
        Ok(Self {
            manager,
            guard,
            user: Mutex::new(None),
        })
    }

    pub fn token_manager(&self) -> &Arc<TokenManager> {
        &self.manager
    }

    pub fn guard(&self) -> &Arc<SessionGuard> {
        &self.guard
    }

    /// Restore a session persisted by an earlier run. Returns the profile if
    /// the stored token (refreshed if needed) still works.
    pub async fn init(&self) -> Result<Option<UserResponse>, ClientError> {
        if self.manager.token().is_none() {
            return Ok(None);
        }
        match self.manager.get::<UserResponse>("/auth/me").await {
            Ok(user) => {
                *self.user.lock() = Some(user.clone());
                self.guard.record_activity();
                Ok(Some(user))
            }
            Err(ClientError::Unauthorized) => {
                self.manager.set_token(None);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn register(&self, req: &RegisterRequest) -> Result<RegisterResponse, ClientError> {
        let response: RegisterResponse = self.manager.post_public("/auth/register", req).await?;
        if let RegisterResponse::Tokens(auth) = &response {
            self.install(auth);
        }
        Ok(response)
    }

    pub async fn login(&self, identifier: &str, password: &str) -> Result<LoginFlow, ClientError> {
        let req = LoginRequest {
            identifier: identifier.to_string(),
            password: password.to_string(),
        };
        let response: LoginResponse = self.manager.post_public("/auth/login", &req).await?;
        Ok(match response {
            LoginResponse::Tokens(auth) => {
                self.install(&auth);
                LoginFlow::LoggedIn(auth.user)
            }
            LoginResponse::Challenge(challenge) => LoginFlow::TwoFactorRequired(challenge),
        })
    }

    /// Complete a challenged login with a TOTP code or a backup code.
    pub async fn verify_two_factor(
        &self,
        challenge: &ChallengeResponse,
        code: &str,
        is_backup_code: bool,
    ) -> Result<UserResponse, ClientError> {
        let req = VerifyTwoFactorRequest {
            user_id: challenge.user_id,
            temp_token: challenge.temp_token.clone(),
            token: code.to_string(),
            is_backup_code,
        };
        let auth: AuthResponse = self.manager.post_public("/auth/verify-2fa", &req).await?;
        self.install(&auth);
        Ok(auth.user)
    }

    fn install(&self, auth: &AuthResponse) {
        self.manager.set_token(Some(auth.access_token.clone()));
        *self.user.lock() = Some(auth.user.clone());
        self.guard.record_activity();
    }

    /// Start the idle watcher. On timeout the session logs itself out.
    pub fn start_guard(self: &Arc<Self>) {
        let session = Arc::downgrade(self);
        self.guard.start(move || {
            let session = session.clone();
            async move {
                if let Some(session) = session.upgrade() {
                    session.logout().await;
                }
            }
        });
    }

    pub fn record_activity(&self) {
        self.guard.record_activity();
    }

    /// Idempotent. Local state is cleared even when the server is
    /// unreachable.
    pub async fn logout(&self) {
        let result = self
            .manager
            .post_public::<_, MessageResponse>("/auth/logout", &serde_json::json!({}))
            .await;
        if let Err(e) = result {
            tracing::warn!(error = %e, "Server logout failed, clearing local session anyway");
        }
        self.guard.stop();
        self.guard.clear_activity();
        self.manager.set_token(None);
        *self.user.lock() = None;
    }

    /// Re-fetch the profile of the current user.
    pub async fn refresh_user(&self) -> Result<UserResponse, ClientError> {
        let user: UserResponse = self.manager.get("/auth/me").await?;
        *self.user.lock() = Some(user.clone());
        Ok(user)
    }

    pub fn current_user(&self) -> Option<UserResponse> {
        self.user.lock().clone()
    }

    pub fn is_authenticated(&self) -> bool {
        self.manager.token().is_some()
    }
}
