//! Per-client request budgets, counted in fixed windows per route tier.
//!
//! Clients are keyed by the socket peer address. `X-Forwarded-For` is read
//! only when `rate_limit.trust_forwarded_for` is set, since any caller can
//! send it. Login codes are also capped per phone in `auth::request_otp`.

use axum::{
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderValue, Request},
    middleware::Next,
    response::{IntoResponse, Response},
};
use dashmap::DashMap;
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::error::ApiError;
use crate::config::RateLimitConfig;
use crate::AppState;

pub const RATE_LIMITED_TOTAL: &str = "http_rate_limited_total";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RateLimitTier {
    /// Authenticated owner and admin endpoints
    Api,
    /// OTP request/verify and admin login
    Auth,
    /// Booking pages, customer links and the payment callback
    Public,
}

impl RateLimitTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            RateLimitTier::Api => "api",
            RateLimitTier::Auth => "auth",
            RateLimitTier::Public => "public",
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    opened: Instant,
    used: u32,
}

/// Budget left after an accepted request
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Quota {
    pub limit: u32,
    pub remaining: u32,
    pub reset_after: u64,
}

/// A rejected request and how long the client should wait
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Throttled {
    pub limit: u32,
    pub retry_after: u64,
}

#[derive(Debug)]
pub struct RateLimiter {
    windows: DashMap<(IpAddr, RateLimitTier), Window>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            windows: DashMap::new(),
            config,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    pub fn limit(&self, tier: RateLimitTier) -> u32 {
        match tier {
            RateLimitTier::Api => self.config.api_requests_per_window,
            RateLimitTier::Auth => self.config.auth_requests_per_window,
            RateLimitTier::Public => self.config.public_requests_per_window,
        }
    }

    fn window(&self) -> Duration {
        Duration::from_secs(self.config.window_seconds.max(1))
    }

    /// Count one request from `ip` against the tier's budget
    pub fn check(&self, ip: IpAddr, tier: RateLimitTier) -> Result<Quota, Throttled> {
        self.check_at(ip, tier, Instant::now())
    }

    fn check_at(&self, ip: IpAddr, tier: RateLimitTier, now: Instant) -> Result<Quota, Throttled> {
        let limit = self.limit(tier);
        let window = self.window();

        let mut slot = self
            .windows
            .entry((ip, tier))
            .or_insert(Window { opened: now, used: 0 });
        if now.saturating_duration_since(slot.opened) >= window {
            *slot = Window { opened: now, used: 0 };
        }

        let reset_after = window
            .saturating_sub(now.saturating_duration_since(slot.opened))
            .as_secs()
            .max(1);
        if slot.used >= limit {
            return Err(Throttled {
                limit,
                retry_after: reset_after,
            });
        }

        slot.used += 1;
        Ok(Quota {
            limit,
            remaining: limit - slot.used,
            reset_after,
        })
    }

    /// Drop closed windows; returns how many remain
    pub fn prune(&self) -> usize {
        self.prune_at(Instant::now())
    }

    fn prune_at(&self, now: Instant) -> usize {
        let window = self.window();
        self.windows
            .retain(|_, slot| now.saturating_duration_since(slot.opened) < window);
        self.windows.len()
    }
}

fn client_ip(request: &Request<Body>, trust_forwarded_for: bool) -> IpAddr {
    if trust_forwarded_for {
        // The proxy appends the peer it accepted the connection from
        let forwarded = request
            .headers()
            .get("x-forwarded-for")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.rsplit(',').next())
            .and_then(|ip| ip.trim().parse::<IpAddr>().ok());
        if let Some(ip) = forwarded {
            return ip;
        }
    }

    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::UNSPECIFIED))
}

pub async fn rate_limit_api(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    enforce(&state, request, next, RateLimitTier::Api).await
}

pub async fn rate_limit_auth(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    enforce(&state, request, next, RateLimitTier::Auth).await
}

pub async fn rate_limit_public(
    State(state): State<Arc<AppState>>,
    request: Request<Body>,
    next: Next,
) -> Response {
    enforce(&state, request, next, RateLimitTier::Public).await
}

async fn enforce(state: &AppState, request: Request<Body>, next: Next, tier: RateLimitTier) -> Response {
    let limiter = &state.rate_limiter;
    if !limiter.enabled() {
        return next.run(request).await;
    }

    let ip = client_ip(&request, state.config.rate_limit.trust_forwarded_for);
    match limiter.check(ip, tier) {
        Ok(quota) => {
            let mut response = next.run(request).await;
            let headers = response.headers_mut();
            headers.insert("X-RateLimit-Limit", HeaderValue::from(quota.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(quota.remaining));
            headers.insert("X-RateLimit-Reset", HeaderValue::from(quota.reset_after));
            response
        }
        Err(throttled) => {
            tracing::warn!(ip = %ip, tier = tier.as_str(), "Rate limit exceeded");
            metrics::counter!(RATE_LIMITED_TOTAL, "tier" => tier.as_str()).increment(1);

            let mut response = ApiError::rate_limited(format!(
                "Too many requests, retry in {} seconds",
                throttled.retry_after
            ))
            .into_response();
            let headers = response.headers_mut();
            headers.insert("Retry-After", HeaderValue::from(throttled.retry_after));
            headers.insert("X-RateLimit-Limit", HeaderValue::from(throttled.limit));
            headers.insert("X-RateLimit-Remaining", HeaderValue::from(0u32));
            response
        }
    }
}

/// Periodically drop closed windows so idle clients do not accumulate
pub fn spawn_cleanup_task(limiter: Arc<RateLimiter>, interval_secs: u64) {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(Duration::from_secs(interval_secs.max(1)));
        loop {
            ticker.tick().await;
            let remaining = limiter.prune();
            tracing::debug!(remaining, "Rate limit windows pruned");
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            enabled: true,
            api_requests_per_window: 4,
            auth_requests_per_window: 2,
            public_requests_per_window: 3,
            window_seconds: 60,
            cleanup_interval: 300,
            trust_forwarded_for: false,
        })
    }

    fn ip(s: &str) -> IpAddr {
        s.parse().unwrap()
    }

    #[test]
    fn test_tier_budget_is_spent_then_throttled() {
        let limiter = limiter();
        let now = Instant::now();
        let client = ip("203.0.113.9");

        let remaining: Vec<u32> = (0..2)
            .map(|_| limiter.check_at(client, RateLimitTier::Auth, now).unwrap().remaining)
            .collect();
        assert_eq!(remaining, vec![1, 0]);

        let throttled = limiter
            .check_at(client, RateLimitTier::Auth, now + Duration::from_secs(20))
            .unwrap_err();
        assert_eq!(throttled.limit, 2);
        assert_eq!(throttled.retry_after, 40);

        // Other tiers keep their own budget
        assert!(limiter.check_at(client, RateLimitTier::Public, now).is_ok());
    }

    #[test]
    fn test_window_reopens_after_expiry() {
        let limiter = limiter();
        let now = Instant::now();
        let client = ip("198.51.100.4");

        for _ in 0..3 {
            limiter.check_at(client, RateLimitTier::Public, now).unwrap();
        }
        assert!(limiter.check_at(client, RateLimitTier::Public, now).is_err());

        let later = now + Duration::from_secs(60);
        let quota = limiter.check_at(client, RateLimitTier::Public, later).unwrap();
        assert_eq!(quota.remaining, 2);
        assert_eq!(quota.reset_after, 60);
    }

    #[test]
    fn test_clients_are_counted_separately() {
        let limiter = limiter();
        let now = Instant::now();
        for _ in 0..2 {
            limiter.check_at(ip("10.0.0.1"), RateLimitTier::Auth, now).unwrap();
        }
        assert!(limiter.check_at(ip("10.0.0.1"), RateLimitTier::Auth, now).is_err());
        assert!(limiter.check_at(ip("10.0.0.2"), RateLimitTier::Auth, now).is_ok());
    }

    #[test]
    fn test_prune_drops_closed_windows() {
        let limiter = limiter();
        let now = Instant::now();
        limiter.check_at(ip("10.0.0.1"), RateLimitTier::Api, now).unwrap();
        limiter
            .check_at(ip("10.0.0.2"), RateLimitTier::Api, now + Duration::from_secs(30))
            .unwrap();

        assert_eq!(limiter.prune_at(now + Duration::from_secs(45)), 2);
        assert_eq!(limiter.prune_at(now + Duration::from_secs(75)), 1);
    }

    #[test]
    fn test_forwarded_for_needs_trust() {
        let mut request = Request::builder()
            .header("X-Forwarded-For", "1.2.3.4, 172.16.0.9")
            .body(Body::empty())
            .unwrap();
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 0, 2, 7], 51000))));

        assert_eq!(client_ip(&request, false), ip("192.0.2.7"));
        assert_eq!(client_ip(&request, true), ip("172.16.0.9"));
    }

    #[test]
    fn test_missing_peer_falls_back_to_unspecified() {
        let request = Request::builder()
            .header("X-Forwarded-For", "1.2.3.4")
            .body(Body::empty())
            .unwrap();
        assert_eq!(client_ip(&request, false), IpAddr::V4(Ipv4Addr::UNSPECIFIED));
    }
}
