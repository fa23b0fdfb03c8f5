//! Rate limiting middleware using a sliding window algorithm.
//!
//! Login and 2FA verification are the endpoints worth brute-forcing, so the
//! Auth tier gets a much smaller budget than general API traffic.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::Request,
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::api::error::ApiError;
use crate::config::RateLimitConfig;
use crate::AppState;

/// Rate limit tier for different endpoint types
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// General API endpoints (100 req/min default)
    Api,
    /// Credential endpoints (20 req/min default)
    Auth,
}

/// Entry in the rate limit tracker
#[derive(Debug, Clone)]
struct RateLimitEntry {
    /// Tokens remaining in the current window
    tokens: u32,
    /// Start of the current window
    window_start: Instant,
    /// Last request time (for sliding window)
    last_request: Instant,
}

impl RateLimitEntry {
    fn new(max_tokens: u32) -> Self {
        let now = Instant::now();
        Self {
            tokens: max_tokens,
            window_start: now,
            last_request: now,
        }
    }
}

/// Thread-safe rate limiter keyed by (IP, tier)
#[derive(Debug)]
pub struct RateLimiter {
    entries: DashMap<(IpAddr, RateLimitTier), RateLimitEntry>,
    config: RateLimitConfig,
    window_duration: Duration,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            entries: DashMap::new(),
            window_duration: Duration::from_secs(config.window_seconds),
            config,
        }
    }

    /// Check if a request should be allowed and consume a token if so.
    /// Returns Err(retry_after_seconds) if rate limited.
    pub fn check_rate_limit(&self, ip: IpAddr, tier: RateLimitTier) -> Result<(), u64> {
        if !self.config.enabled {
            return Ok(());
        }

        let max_tokens = self.max_tokens(tier);
        let now = Instant::now();

        let mut entry = self
            .entries
            .entry((ip, tier))
            .or_insert_with(|| RateLimitEntry::new(max_tokens));

        let elapsed = now.duration_since(entry.window_start);
        if elapsed >= self.window_duration {
            entry.tokens = max_tokens;
            entry.window_start = now;
        } else {
            // Gradually replenish tokens based on time since the last request
            let since_last = now.duration_since(entry.last_request);
            let replenish_rate = max_tokens as f64 / self.window_duration.as_secs_f64();
            let replenished = (since_last.as_secs_f64() * replenish_rate) as u32;
            entry.tokens = (entry.tokens + replenished).min(max_tokens);
        }

        entry.last_request = now;

        if entry.tokens > 0 {
            entry.tokens -= 1;
            Ok(())
        } else {
            let retry_after = self.window_duration.saturating_sub(elapsed).as_secs().max(1);
            Err(retry_after)
        }
    }

    fn max_tokens(&self, tier: RateLimitTier) -> u32 {
        match tier {
            RateLimitTier::Api => self.config.api_requests_per_window,
            RateLimitTier::Auth => self.config.auth_requests_per_window,
        }
    }

    /// Clean up expired entries to prevent unbounded growth
    pub fn cleanup_expired(&self) {
        let now = Instant::now();
        let expiry = self.window_duration * 2;
        self.entries
            .retain(|_, entry| now.duration_since(entry.window_start) < expiry);
    }

    pub fn entry_count(&self) -> usize {
        self.entries.len()
    }
}

/// Spawn a background task that periodically prunes expired limiter entries.
pub fn spawn_cleanup_task(rate_limiter: Arc<RateLimiter>, cleanup_interval_secs: u64) {
    tokio::spawn(async move {
        let interval = Duration::from_secs(cleanup_interval_secs);
        loop {
            tokio::time::sleep(interval).await;
            rate_limiter.cleanup_expired();
            tracing::debug!(
                "Rate limiter cleanup complete, {} entries remaining",
                rate_limiter.entry_count()
            );
        }
    });
}

fn client_ip(request: &Request<Body>) -> Option<IpAddr> {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip())
}

/// Middleware enforcing the Auth tier on credential endpoints.
pub async fn auth_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    // No peer address (e.g. in-process tests): nothing to key on
    let Some(ip) = client_ip(&request) else {
        return next.run(request).await;
    };

    match state.rate_limiter.check_rate_limit(ip, RateLimitTier::Auth) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(ip = %ip, retry_after, "Auth rate limit exceeded");
            let mut response =
                ApiError::rate_limited("Too many attempts, slow down").into_response();
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
            response
        }
    }
}

/// Middleware enforcing the Api tier on bearer-protected endpoints.
pub async fn api_rate_limit(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let Some(ip) = client_ip(&request) else {
        return next.run(request).await;
    };

    match state.rate_limiter.check_rate_limit(ip, RateLimitTier::Api) {
        Ok(()) => next.run(request).await,
        Err(retry_after) => {
            tracing::warn!(ip = %ip, retry_after, "Api rate limit exceeded");
            let mut response = ApiError::rate_limited("Too many requests").into_response();
            if let Ok(value) = retry_after.to_string().parse() {
                response.headers_mut().insert("Retry-After", value);
            }
            response
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(auth_per_window: u32) -> RateLimitConfig {
        RateLimitConfig {
            enabled: true,
            window_seconds: 60,
            api_requests_per_window: 100,
            auth_requests_per_window: auth_per_window,
            cleanup_interval_secs: 300,
        }
    }

    #[test]
    fn auth_tier_exhausts() {
        let limiter = RateLimiter::new(config(3));
        let ip: IpAddr = "10.0.0.1".parse().unwrap();

        for _ in 0..3 {
            assert!(limiter.check_rate_limit(ip, RateLimitTier::Auth).is_ok());
        }
        assert!(limiter.check_rate_limit(ip, RateLimitTier::Auth).is_err());
    }

    #[test]
    fn tiers_are_independent() {
        let limiter = RateLimiter::new(config(1));
        let ip: IpAddr = "10.0.0.2".parse().unwrap();

        assert!(limiter.check_rate_limit(ip, RateLimitTier::Auth).is_ok());
        assert!(limiter.check_rate_limit(ip, RateLimitTier::Auth).is_err());
        // Api tier still has budget
        assert!(limiter.check_rate_limit(ip, RateLimitTier::Api).is_ok());
    }

    #[test]
    fn ips_are_independent() {
        let limiter = RateLimiter::new(config(1));
        let a: IpAddr = "10.0.0.3".parse().unwrap();
        let b: IpAddr = "10.0.0.4".parse().unwrap();

        assert!(limiter.check_rate_limit(a, RateLimitTier::Auth).is_ok());
        assert!(limiter.check_rate_limit(a, RateLimitTier::Auth).is_err());
        assert!(limiter.check_rate_limit(b, RateLimitTier::Auth).is_ok());
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let mut cfg = config(1);
        cfg.enabled = false;
        let limiter = RateLimiter::new(cfg);
        let ip: IpAddr = "10.0.0.5".parse().unwrap();

        for _ in 0..50 {
            assert!(limiter.check_rate_limit(ip, RateLimitTier::Auth).is_ok());
        }
    }

    #[test]
    fn cleanup_keeps_entries_inside_the_window() {
        let limiter = RateLimiter::new(config(3));
        let ip: IpAddr = "10.0.0.6".parse().unwrap();

        let _ = limiter.check_rate_limit(ip, RateLimitTier::Auth);
        assert_eq!(limiter.entry_count(), 1);

        limiter.cleanup_expired();
        assert_eq!(limiter.entry_count(), 1);
    }

    #[test]
    fn cleanup_drops_entries_past_the_window() {
        // A zero-length window makes every entry immediately stale
        let mut cfg = config(3);
        cfg.window_seconds = 0;
        let limiter = RateLimiter::new(cfg);
        let ip: IpAddr = "10.0.0.7".parse().unwrap();

        let _ = limiter.check_rate_limit(ip, RateLimitTier::Auth);
        let _ = limiter.check_rate_limit(ip, RateLimitTier::Api);
        assert_eq!(limiter.entry_count(), 2);

        limiter.cleanup_expired();
        assert_eq!(limiter.entry_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn cleanup_task_prunes_on_schedule() {
        let mut cfg = config(3);
        cfg.window_seconds = 0;
        let limiter = Arc::new(RateLimiter::new(cfg));
        let ip: IpAddr = "10.0.0.8".parse().unwrap();

        let _ = limiter.check_rate_limit(ip, RateLimitTier::Auth);
        assert_eq!(limiter.entry_count(), 1);

        spawn_cleanup_task(limiter.clone(), 300);
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        tokio::time::advance(Duration::from_secs(301)).await;
        for _ in 0..20 {
            tokio::task::yield_now().await;
        }
        assert_eq!(limiter.entry_count(), 0);
    }

    #[tokio::test]
    async fn api_tier_limit_uses_the_error_envelope() {
        use axum::http::StatusCode;
        use axum::{middleware, routing::get, Router};
        use http_body_util::BodyExt;
        use tower::ServiceExt;

        let mut config = crate::config::Config::default();
        config.rate_limit.api_requests_per_window = 1;
        let db = crate::db::init_in_memory().await.unwrap();
        let state = Arc::new(crate::AppState::new(config, db));

        let app = Router::new()
            .route("/ping", get(|| async { "pong" }))
            .layer(middleware::from_fn_with_state(state, api_rate_limit));

        let addr: SocketAddr = "10.1.1.1:5000".parse().unwrap();
        let request = || {
            Request::builder()
                .uri("/ping")
                .extension(ConnectInfo(addr))
                .body(Body::empty())
                .unwrap()
        };

        let ok = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(ok.status(), StatusCode::OK);

        let limited = app.clone().oneshot(request()).await.unwrap();
        assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);
        assert!(limited.headers().get("Retry-After").is_some());

        let bytes = limited.into_body().collect().await.unwrap().to_bytes();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["error"]["code"], "too_many_requests");
    }
}
