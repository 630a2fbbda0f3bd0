//! Security middleware for API authentication and rate limiting.
//!
//! Authentication only validates: keys are provisioned out of band and the
//! server never issues or stores tokens. A matching key is turned into a
//! [`Caller`] request extension that handlers pass into the core.

use axum::{
    body::Body,
    extract::State,
    http::{Request, StatusCode},
    middleware::Next,
    response::Response,
};
use std::{
    collections::{HashMap, VecDeque},
    net::IpAddr,
    sync::{Arc, Mutex},
    time::{Duration, Instant},
};

use crate::models::Caller;

/// Header used by RFID reader devices, which cannot send bearer tokens.
pub const DEVICE_KEY_HEADER: &str = "X-Api-Key";

/// A named API key. The name becomes the caller identity.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ApiKey {
    pub name: String,
    pub key: String,
}

/// Security configuration loaded from environment variables.
#[derive(Clone, Debug)]
pub struct SecurityConfig {
    /// Accepted keys (from ROLLCALL_API_KEYS, `name:key` pairs, comma-separated).
    /// Authentication is disabled when empty.
    pub api_keys: Vec<ApiKey>,
    /// Allowed CORS origins (from ROLLCALL_CORS_ORIGINS, comma-separated)
    pub cors_origins: Option<Vec<String>>,
    pub rate_limiter: Option<RateLimiter>,
}

impl SecurityConfig {
    /// Load security configuration from environment variables.
    pub fn from_env() -> Self {
        let api_keys = std::env::var("ROLLCALL_API_KEYS")
            .map(|s| parse_api_keys(&s))
            .unwrap_or_default();

        let cors_origins = std::env::var("ROLLCALL_CORS_ORIGINS")
            .ok()
            .map(|s| s.split(',').map(|s| s.trim().to_string()).collect());

        let rate_limit = std::env::var("ROLLCALL_RATE_LIMIT")
            .ok()
            .and_then(|s| s.parse::<u32>().ok())
            .unwrap_or(300); // Dashboards poll every 5s, readers burst on class entry

        let rate_limiter = if api_keys.is_empty() {
            None
        } else {
            Some(RateLimiter::new(rate_limit, Duration::from_secs(60)))
        };

        Self {
            api_keys,
            cors_origins,
            rate_limiter,
        }
    }

    /// Create a config with no authentication (for local development/testing).
    pub fn disabled() -> Self {
        Self {
            api_keys: Vec::new(),
            cors_origins: None,
            rate_limiter: None,
        }
    }

    /// Create a config accepting a single key, for a caller named `default`.
    pub fn with_api_key(key: impl Into<String>) -> Self {
        Self::with_api_keys([("default", key)])
    }

    pub fn with_api_keys<N, K>(keys: impl IntoIterator<Item = (N, K)>) -> Self
    where
        N: Into<String>,
        K: Into<String>,
    {
        Self {
            api_keys: keys
                .into_iter()
                .map(|(name, key)| ApiKey {
                    name: name.into(),
                    key: key.into(),
                })
                .collect(),
            cors_origins: None,
            rate_limiter: None,
        }
    }

    /// Create a config with rate limiting enabled.
    pub fn with_rate_limit(max_requests: u32) -> Self {
        Self {
            api_keys: Vec::new(),
            cors_origins: None,
            rate_limiter: Some(RateLimiter::new(max_requests, Duration::from_secs(60))),
        }
    }

    pub fn auth_enabled(&self) -> bool {
        !self.api_keys.is_empty()
    }

    /// Resolve a presented key to a caller.
    pub fn authenticate(&self, presented: &str) -> Option<Caller> {
        self.api_keys
            .iter()
            .find(|k| k.key == presented)
            .map(|k| Caller::new(k.name.clone()))
    }
}

impl Default for SecurityConfig {
    fn default() -> Self {
        Self::from_env()
    }
}

/// Parse `name:key` pairs. A bare key gets a positional name.
fn parse_api_keys(raw: &str) -> Vec<ApiKey> {
    raw.split(',')
        .map(str::trim)
        .filter(|entry| !entry.is_empty())
        .enumerate()
        .map(|(i, entry)| match entry.split_once(':') {
            Some((name, key)) => ApiKey {
                name: name.trim().to_string(),
                key: key.trim().to_string(),
            },
            None => ApiKey {
                name: format!("client-{}", i + 1),
                key: entry.to_string(),
            },
        })
        .filter(|k| !k.key.is_empty())
        .collect()
}

/// Per-client request budget over a sliding window.
///
/// Each client IP keeps the instants of its recent requests; a request is
/// admitted while fewer than `max_requests` of them fall inside `window`.
#[derive(Clone, Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    clients: Arc<Mutex<HashMap<IpAddr, VecDeque<Instant>>>>,
}

impl RateLimiter {
    pub fn new(max_requests: u32, window: Duration) -> Self {
        Self {
            max_requests: max_requests as usize,
            window,
            clients: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Record a request from `ip`. Returns false when its budget is spent.
    pub fn check(&self, ip: IpAddr) -> bool {
        let now = Instant::now();
        let mut clients = self.clients.lock().expect("rate limiter lock poisoned");

        // Forget clients whose whole history has aged out.
        clients.retain(|_, seen| {
            while seen.front().is_some_and(|&t| now.duration_since(t) >= self.window) {
                seen.pop_front();
            }
            !seen.is_empty()
        });

        let seen = clients.entry(ip).or_default();
        if seen.len() >= self.max_requests {
            return false;
        }
        seen.push_back(now);
        true
    }
}

/// Authentication middleware. Attaches the resolved [`Caller`] to the request.
pub async fn auth_middleware(
    State(config): State<SecurityConfig>,
    mut request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    if !config.auth_enabled() {
        request.extensions_mut().insert(Caller::anonymous());
        return Ok(next.run(request).await);
    }

    let presented = match presented_key(&request) {
        Ok(key) => key,
        Err(reason) => {
            tracing::warn!("{}", reason);
            return Err(StatusCode::UNAUTHORIZED);
        }
    };

    match config.authenticate(&presented) {
        Some(caller) => {
            request.extensions_mut().insert(caller);
            Ok(next.run(request).await)
        }
        None => {
            tracing::warn!("Invalid API key provided");
            Err(StatusCode::UNAUTHORIZED)
        }
    }
}

fn presented_key(request: &Request<Body>) -> Result<String, &'static str> {
    if let Some(header) = request.headers().get("Authorization") {
        let value = header
            .to_str()
            .map_err(|_| "Invalid Authorization header format")?;
        return value
            .strip_prefix("Bearer ")
            .map(|token| token.trim().to_string())
            .ok_or("Invalid Authorization header format");
    }

    if let Some(header) = request.headers().get(DEVICE_KEY_HEADER) {
        return header
            .to_str()
            .map(|key| key.trim().to_string())
            .map_err(|_| "Invalid device key header");
    }

    Err("Missing Authorization header")
}

/// Rate limiting middleware.
pub async fn rate_limit_middleware(
    State(rate_limiter): State<RateLimiter>,
    request: Request<Body>,
    next: Next,
) -> Result<Response, StatusCode> {
    let ip = extract_client_ip(&request);

    if rate_limiter.check(ip) {
        Ok(next.run(request).await)
    } else {
        tracing::warn!("Rate limit exceeded for IP: {}", ip);
        Err(StatusCode::TOO_MANY_REQUESTS)
    }
}

fn extract_client_ip(request: &Request<Body>) -> IpAddr {
    let forwarded: Option<IpAddr> = request
        .headers()
        .get("X-Forwarded-For")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .and_then(|ip| ip.trim().parse().ok());

    let real_ip = || -> Option<IpAddr> {
        request
            .headers()
            .get("X-Real-IP")
            .and_then(|v| v.to_str().ok())
            .and_then(|ip| ip.trim().parse().ok())
    };

    forwarded
        .or_else(real_ip)
        .unwrap_or(IpAddr::from([127, 0, 0, 1]))
}
