//! HTTP client with transparent token refresh.
//!
//! The manager holds the access token in memory (mirrored to storage) and
//! lets the refresh cookie ride in the reqwest cookie store. A 401 on an
//! authenticated request triggers exactly one refresh-and-retry; concurrent
//! 401s collapse into a single refresh request.

use parking_lot::Mutex;
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use super::storage::{TokenStorage, ACCESS_TOKEN_KEY};
use crate::api::error::ErrorResponse;
use crate::db::RefreshResponse;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug, Error)]
pub enum ClientError {
    /// No usable session: the access token and the refresh cookie are both
    /// spent. The caller should send the user back to login.
    #[error("not authenticated")]
    Unauthorized,
    /// The server answered with a non-auth error.
    #[error("{message}")]
    Api { status: StatusCode, message: String },
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

pub struct TokenManager {
    http: Client,
    base_url: String,
    storage: Arc<dyn TokenStorage>,
    access_token: Mutex<Option<String>>,
    /// Serializes refreshes so a burst of 401s produces one refresh call.
    refresh_gate: tokio::sync::Mutex<()>,
}

impl TokenManager {
    pub fn new(
        base_url: impl Into<String>,
        storage: Arc<dyn TokenStorage>,
    ) -> Result<Self, ClientError> {
        let http = Client::builder()
            .cookie_store(true)
            .timeout(REQUEST_TIMEOUT)
            .build()?;
        let base_url = base_url.into().trim_end_matches('/').to_string();
        // Hydrate from the previous run, if any
        let access_token = Mutex::new(storage.get(ACCESS_TOKEN_KEY));
        Ok(Self {
            http,
            base_url,
            storage,
            access_token,
            refresh_gate: tokio::sync::Mutex::new(()),
        })
    }

    pub fn token(&self) -> Option<String> {
        self.access_token.lock().clone()
    }

    /// Replace the in-memory token and mirror the change to storage.
    pub fn set_token(&self, token: Option<String>) {
        match &token {
            Some(t) => self.storage.set(ACCESS_TOKEN_KEY, t),
            None => self.storage.remove(ACCESS_TOKEN_KEY),
        }
        *self.access_token.lock() = token;
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    /// Send a request without touching authentication state. Used for the
    /// public credential endpoints.
    pub async fn request_public<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let mut builder = self.http.request(method, self.url(path));
        if let Some(body) = body {
            builder = builder.json(body);
        }
        let response = builder.send().await?;
        Self::decode(response).await
    }

    pub async fn post_public<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.request_public(Method::POST, path, Some(body)).await
    }

    /// Send an authenticated request. On a 401 the manager refreshes the
    /// access token once and retries; a second 401 clears the session.
    pub async fn request<B: Serialize, T: DeserializeOwned>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<T, ClientError> {
        let response = self.send_with_token(method.clone(), path, body).await?;
        if response.status() != StatusCode::UNAUTHORIZED {
            return Self::decode(response).await;
        }

        self.refresh().await?;

        let retried = self.send_with_token(method, path, body).await?;
        if retried.status() == StatusCode::UNAUTHORIZED {
            self.set_token(None);
            return Err(ClientError::Unauthorized);
        }
        Self::decode(retried).await
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> Result<T, ClientError> {
        self.request::<(), T>(Method::GET, path, None).await
    }

    pub async fn post<B: Serialize, T: DeserializeOwned>(
        &self,
        path: &str,
        body: &B,
    ) -> Result<T, ClientError> {
        self.request(Method::POST, path, Some(body)).await
    }

    async fn send_with_token<B: Serialize>(
        &self,
        method: Method,
        path: &str,
        body: Option<&B>,
    ) -> Result<reqwest::Response, ClientError> {
        let mut builder = self.http.request(method, self.url(path));
        if let Some(token) = self.token() {
            builder = builder.bearer_auth(token);
        }
        if let Some(body) = body {
            builder = builder.json(body);
        }
        Ok(builder.send().await?)
    }

    /// Mint a new access token from the refresh cookie. Callers queued on the
    /// gate reuse the token the first one installed instead of refreshing
    /// again.
    pub async fn refresh(&self) -> Result<(), ClientError> {
        let before = self.token();
        let _gate = self.refresh_gate.lock().await;
        if self.token() != before {
            return Ok(());
        }

        let response = self.http.post(self.url("/auth/refresh")).send().await?;
        if response.status() == StatusCode::UNAUTHORIZED {
            self.set_token(None);
            return Err(ClientError::Unauthorized);
        }
        let refreshed: RefreshResponse = Self::decode(response).await?;
        self.set_token(Some(refreshed.access_token));
        Ok(())
    }

    async fn decode<T: DeserializeOwned>(response: reqwest::Response) -> Result<T, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json().await?);
        }
        if status == StatusCode::UNAUTHORIZED {
            return Err(ClientError::Unauthorized);
        }
        let message = match response.json::<ErrorResponse>().await {
            Ok(body) => body.error.message,
            Err(_) => status
                .canonical_reason()
                .unwrap_or("Request failed")
                .to_string(),
        };
        Err(ClientError::Api { status, message })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::client::storage::MemoryStorage;

    #[tokio::test]
    async fn hydrates_token_from_storage() {
        let storage = Arc::new(MemoryStorage::new());
        storage.set(ACCESS_TOKEN_KEY, "stored-token");

        let manager = TokenManager::new("http://localhost:1", storage).unwrap();
        assert_eq!(manager.token(), Some("stored-token".to_string()));
    }

    #[tokio::test]
    async fn set_token_mirrors_to_storage() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = TokenManager::new("http://localhost:1/", storage.clone()).unwrap();

        manager.set_token(Some("fresh".to_string()));
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), Some("fresh".to_string()));

        manager.set_token(None);
        assert_eq!(storage.get(ACCESS_TOKEN_KEY), None);
        assert_eq!(manager.token(), None);
    }

    #[test]
    fn base_url_trailing_slash_is_normalized() {
        let storage = Arc::new(MemoryStorage::new());
        let manager = TokenManager::new("http://localhost:1/", storage).unwrap();
        assert_eq!(manager.url("/auth/me"), "http://localhost:1/auth/me");
    }
}
