//! Per-service rate limiting with adaptive governor instances, plus the
//! bounded retry loop every remote call goes through.
//!
//! Each request waits for its governor permit via `until_ready()`, which
//! spaces requests at the configured rate. On 429 the governor is slowed and
//! the call is retried after the server's Retry-After (or the fixed backoff).

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::{Duration, Instant};

use arc_swap::ArcSwap;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use thiserror::Error;

/// Type alias for governor's direct rate limiter.
type DirectLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Service names used as limiter keys and in log output.
pub mod service {
    pub const CROSSREF: &str = "Crossref";
    pub const SEMANTIC_SCHOLAR: &str = "Semantic Scholar";
    pub const DNB: &str = "DNB";
    pub const OPEN_LIBRARY: &str = "Open Library";
    pub const TRANSLATION: &str = "Translation";
    pub const LIBRARY: &str = "Library";
    pub const GND: &str = "GND";
    pub const WIKIDATA: &str = "Wikidata";
}

/// Failure of a matcher or external lookup.
///
/// "Not found" is never an error; matchers return `Ok(None)` for it.
#[derive(Debug, Clone, Error)]
pub enum MatchError {
    /// Server returned 429 Too Many Requests.
    #[error("rate limited (429)")]
    RateLimited { retry_after: Option<Duration> },
    #[error("timeout: {0}")]
    Timeout(String),
    #[error("HTTP {status} from {service}")]
    Http { service: String, status: u16 },
    /// The response did not have the expected shape.
    #[error("malformed response: {message}")]
    Malformed { message: String, payload: String },
    #[error("{0}")]
    Other(String),
}

impl MatchError {
    /// Timeouts and rate limiting; these abort the document and may trigger
    /// a pass-level retry.
    pub fn is_transient(&self) -> bool {
        matches!(self, MatchError::Timeout(_) | MatchError::RateLimited { .. })
    }

    pub fn malformed(message: impl Into<String>, payload: impl std::fmt::Display) -> Self {
        let mut payload = payload.to_string();
        if payload.len() > 2000 {
            let cut = (0..=2000)
                .rev()
                .find(|i| payload.is_char_boundary(*i))
                .unwrap_or(0);
            payload.truncate(cut);
        }
        MatchError::Malformed {
            message: message.into(),
            payload,
        }
    }
}

impl From<reqwest::Error> for MatchError {
    fn from(e: reqwest::Error) -> Self {
        if e.is_timeout() {
            MatchError::Timeout(e.to_string())
        } else if e.is_decode() {
            MatchError::malformed(e.to_string(), "")
        } else {
            MatchError::Other(e.to_string())
        }
    }
}

/// Per-service rate limiter with adaptive rate adjustment via ArcSwap.
///
/// When a 429 is received, the governor is atomically swapped to a slower rate.
/// After a cooldown period (60s) with no 429s, the original rate is restored.
pub struct AdaptiveLimiter {
    limiter: ArcSwap<DirectLimiter>,
    /// Base period between allowed requests.
    base_period: Duration,
    /// Current slowdown factor (1 = normal, 2 = half rate, etc.).
    current_factor: AtomicU32,
    /// Timestamp of the last 429 response.
    last_429: std::sync::Mutex<Option<Instant>>,
}

fn quota_for(period: Duration) -> Quota {
    Quota::with_period(period)
        .unwrap_or_else(|| Quota::per_second(std::num::NonZeroU32::MIN))
}

impl AdaptiveLimiter {
    /// Create a new limiter with the given period between requests.
    pub fn new(period: Duration) -> Self {
        let limiter = Arc::new(DirectLimiter::direct(quota_for(period)));
        Self {
            limiter: ArcSwap::from(limiter),
            base_period: period,
            current_factor: AtomicU32::new(1),
            last_429: std::sync::Mutex::new(None),
        }
    }

    /// Create a limiter allowing `n` requests per second.
    pub fn per_second(n: u32) -> Self {
        let ms = 1000 / n.max(1) as u64;
        Self::new(Duration::from_millis(ms))
    }

    /// Wait until the rate limiter allows a request.
    pub async fn acquire(&self) {
        self.try_decay();
        let limiter = self.limiter.load();
        limiter.until_ready().await;
    }

    /// Called when a 429 is received. Doubles the slowdown factor and swaps the governor.
    pub fn on_rate_limited(&self) {
        if let Ok(mut last) = self.last_429.lock() {
            *last = Some(Instant::now());
        }

        // Double factor, cap at 16x slowdown
        let _ = self
            .current_factor
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |f| {
                Some((f * 2).min(16))
            });

        let factor = self.current_factor.load(Ordering::SeqCst);
        if let Some(scaled) = self.base_period.checked_mul(factor)
            && let Some(quota) = Quota::with_period(scaled)
        {
            self.limiter.store(Arc::new(DirectLimiter::direct(quota)));
        }
    }

    /// If 60s have passed since the last 429, restore the original rate.
    fn try_decay(&self) {
        let should_restore = self
            .last_429
            .lock()
            .ok()
            .and_then(|last| last.map(|t| t.elapsed().as_secs() >= 60))
            .unwrap_or(false);

        if should_restore && self.current_factor.load(Ordering::SeqCst) > 1 {
            self.current_factor.store(1, Ordering::SeqCst);
            self.limiter
                .store(Arc::new(DirectLimiter::direct(quota_for(self.base_period))));
        }
    }
}

/// Collection of per-service rate limiters.
pub struct RateLimiters {
    limiters: HashMap<&'static str, AdaptiveLimiter>,
}

impl Default for RateLimiters {
    fn default() -> Self {
        Self::new(false, false)
    }
}

impl std::fmt::Debug for RateLimiters {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut names: Vec<_> = self.limiters.keys().collect();
        names.sort();
        f.debug_struct("RateLimiters").field("services", &names).finish()
    }
}

impl RateLimiters {
    /// Build rate limiters based on whether API keys/mailto are configured.
    pub fn new(has_crossref_mailto: bool, has_s2_api_key: bool) -> Self {
        let mut limiters = HashMap::new();

        // Crossref: 1/s anonymous, 3/s in the polite pool
        let crossref_rate = if has_crossref_mailto { 3 } else { 1 };
        limiters.insert(
            service::CROSSREF,
            AdaptiveLimiter::per_second(crossref_rate),
        );

        // Semantic Scholar: keyless ~100 req/5min, keyed 1/s
        if has_s2_api_key {
            limiters.insert(service::SEMANTIC_SCHOLAR, AdaptiveLimiter::per_second(1));
        } else {
            limiters.insert(
                service::SEMANTIC_SCHOLAR,
                AdaptiveLimiter::new(Duration::from_secs(3)),
            );
        }

        // Catalogs publish no limits; stay conservative
        limiters.insert(service::DNB, AdaptiveLimiter::per_second(2));
        limiters.insert(service::OPEN_LIBRARY, AdaptiveLimiter::per_second(1));

        // Self-hosted translation server
        limiters.insert(service::TRANSLATION, AdaptiveLimiter::per_second(10));

        // Library Web API: documented backoff only, keep well below it
        limiters.insert(service::LIBRARY, AdaptiveLimiter::per_second(5));

        limiters.insert(service::GND, AdaptiveLimiter::per_second(5));
        limiters.insert(service::WIKIDATA, AdaptiveLimiter::per_second(5));

        Self { limiters }
    }

    /// Get the rate limiter for a given service, if one exists.
    pub fn get(&self, service: &str) -> Option<&AdaptiveLimiter> {
        self.limiters.get(service)
    }
}

/// Check an HTTP response for 429 and other failure statuses.
///
/// Returns `Err(MatchError::RateLimited { .. })` on 429 (with Retry-After if
/// present), `Err(MatchError::Http { .. })` on any other non-success status.
pub fn check_response(service: &str, resp: &reqwest::Response) -> Result<(), MatchError> {
    let status = resp.status();
    if status.as_u16() == 429 {
        let retry_after = resp
            .headers()
            .get("retry-after")
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        return Err(MatchError::RateLimited { retry_after });
    }
    if status.as_u16() == 408 || status.as_u16() == 504 {
        return Err(MatchError::Timeout(format!("HTTP {} from {}", status, service)));
    }
    if !status.is_success() {
        return Err(MatchError::Http {
            service: service.to_string(),
            status: status.as_u16(),
        });
    }
    Ok(())
}

/// Parse a Retry-After header value (seconds or HTTP-date).
pub fn parse_retry_after(value: &str) -> Option<Duration> {
    if let Ok(secs) = value.trim().parse::<u64>() {
        return Some(Duration::from_secs(secs));
    }
    // HTTP-date: use a conservative fixed wait
    if value.contains(',') || value.contains("GMT") {
        return Some(Duration::from_secs(5));
    }
    None
}

/// Bounded retry for transient transport failures.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Fixed wait between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            backoff: Duration::from_secs(2),
        }
    }
}

/// Run `op` with governor pacing and fixed-backoff retry.
///
/// 1. Acquires the service's governor (waits if needed)
/// 2. Runs `op`
/// 3. On 429: slows the governor, waits Retry-After (capped at 30s) or the
///    backoff, and retries
/// 4. On timeout: waits the backoff and retries
/// 5. Anything else returns immediately
///
/// After `policy.attempts` the last transient error is returned.
pub async fn with_retry<T, F, Fut>(
    service: &str,
    limiters: &RateLimiters,
    policy: RetryPolicy,
    mut op: F,
) -> Result<T, MatchError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, MatchError>>,
{
    let limiter = limiters.get(service);
    let attempts = policy.attempts.max(1);
    let mut attempt = 0;

    loop {
        attempt += 1;
        if let Some(lim) = limiter {
            lim.acquire().await;
        }

        let err = match op().await {
            Ok(value) => return Ok(value),
            Err(e) if !e.is_transient() => return Err(e),
            Err(e) => e,
        };

        if attempt >= attempts {
            tracing::warn!(service, attempts, error = %err, "giving up after retries");
            return Err(err);
        }

        let wait = match &err {
            MatchError::RateLimited { retry_after } => {
                if let Some(lim) = limiter {
                    lim.on_rate_limited();
                }
                retry_after
                    .unwrap_or(policy.backoff)
                    .min(Duration::from_secs(30))
            }
            _ => policy.backoff,
        };
        tracing::info!(
            service,
            attempt,
            wait_secs = wait.as_secs_f64(),
            error = %err,
            "transient failure, retrying"
        );
        tokio::time::sleep(wait).await;
    }
}
