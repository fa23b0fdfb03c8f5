pub mod auth;
pub mod error;
pub mod rate_limit;
pub mod two_factor;
pub mod validation;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use std::sync::Arc;
use tower_http::trace::TraceLayer;

use crate::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    // Credential routes (public, tighter rate limit)
    let auth_routes = Router::new()
        .route("/register", post(auth::register))
        .route("/login", post(auth::login))
        .route("/verify-2fa", post(auth::verify_two_factor))
        .route("/refresh", post(auth::refresh))
        .route("/logout", post(auth::logout))
        .route("/me", get(auth::me))
        .route("/forgot-password", post(auth::forgot_password))
        .route("/reset-password", post(auth::reset_password))
        .route("/verify-email", post(auth::verify_email))
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::auth_rate_limit,
        ));

    // 2FA management (bearer auth enforced by the User extractor)
    let two_factor_routes = Router::new()
        .route("/status", get(two_factor::status))
        .route("/setup", post(two_factor::setup))
        .route("/verify", post(two_factor::verify))
        .route("/disable", post(two_factor::disable))
        .route(
            "/regenerate-backup-codes",
            put(two_factor::regenerate_backup_codes),
        )
        .layer(middleware::from_fn_with_state(
            state.clone(),
            rate_limit::api_rate_limit,
        ));

    Router::new()
        .route("/health", get(health_check))
        .nest("/auth", auth_routes)
        .nest("/2fa", two_factor_routes)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health_check() -> &'static str {
    "OK"
}

#[cfg(test)]
pub(crate) mod test_util {
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use axum::Router;
    use http_body_util::BodyExt;
    use serde_json::Value;
    use std::sync::Arc;

    use crate::config::Config;
    use crate::AppState;

    pub async fn test_state() -> Arc<AppState> {
        let mut config = Config::default();
        config.auth.jwt_secret = "test-jwt-secret".to_string();
        config.auth.encryption_secret = "test-encryption-secret".to_string();
        config.server.secure_cookies = false;
        let db = crate::db::init_in_memory().await.unwrap();
        Arc::new(AppState::new(config, db))
    }

    pub async fn test_app() -> (Arc<AppState>, Router) {
        let state = test_state().await;
        let router = super::create_router(state.clone());
        (state, router)
    }

    pub struct TestResponse {
        pub status: StatusCode,
        pub body: Value,
        pub set_cookies: Vec<String>,
    }

    impl TestResponse {
        /// The `name=value` pair of the refresh cookie, ready for a Cookie
        /// header, if the response set one.
        pub fn refresh_cookie(&self) -> Option<String> {
            self.set_cookies
                .iter()
                .find(|c| c.starts_with(crate::auth::tokens::REFRESH_COOKIE))
                .and_then(|c| c.split(';').next())
                .map(|s| s.to_string())
        }
    }

    pub struct RequestBuilder<'a> {
        router: &'a Router,
        method: Method,
        path: String,
        bearer: Option<String>,
        cookie: Option<String>,
        body: Option<Value>,
    }

    pub fn req<'a>(router: &'a Router, method: Method, path: &str) -> RequestBuilder<'a> {
        RequestBuilder {
            router,
            method,
            path: path.to_string(),
            bearer: None,
            cookie: None,
            body: None,
        }
    }

    impl RequestBuilder<'_> {
        pub fn bearer(mut self, token: &str) -> Self {
            self.bearer = Some(token.to_string());
            self
        }

        pub fn cookie(mut self, cookie: &str) -> Self {
            self.cookie = Some(cookie.to_string());
            self
        }

        pub fn json(mut self, body: Value) -> Self {
            self.body = Some(body);
            self
        }

        pub async fn send(self) -> TestResponse {
            use tower::ServiceExt;

            let mut builder = Request::builder().method(self.method).uri(&self.path);
            if let Some(token) = &self.bearer {
                builder = builder.header(header::AUTHORIZATION, format!("Bearer {}", token));
            }
            if let Some(cookie) = &self.cookie {
                builder = builder.header(header::COOKIE, cookie.as_str());
            }
            let request = match self.body {
                Some(value) => builder
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(value.to_string()))
                    .unwrap(),
                None => builder.body(Body::empty()).unwrap(),
            };

            let response = self.router.clone().oneshot(request).await.unwrap();
            let status = response.status();
            let set_cookies = response
                .headers()
                .get_all(header::SET_COOKIE)
                .iter()
                .map(|v| v.to_str().unwrap().to_string())
                .collect();
            let bytes = response.into_body().collect().await.unwrap().to_bytes();
            let body = if bytes.is_empty() {
                Value::Null
            } else {
                serde_json::from_slice(&bytes)
                    .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
            };

            TestResponse {
                status,
                body,
                set_cookies,
            }
        }
    }
}
