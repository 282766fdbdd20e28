//! Per service key request and token throttling
//!
//! Each key keeps a sliding record of `{timestamp, tokens}` entries. Requests
//! are checked against an optional burst window, requests per minute, requests
//! per hour and tokens per minute, in that order. Callers that cannot be
//! granted immediately queue behind a fair mutex, so waiters for a key are
//! served in arrival order.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::core::errors::{Result, RunbookError};

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

/// Records older than this are evicted by the sweep
pub const RECORD_RETENTION: Duration = HOUR;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub requests_per_hour: Option<u32>,
    pub tokens_per_minute: Option<u64>,
    /// Maximum requests inside `burst_window_ms`
    pub burst_size: Option<u32>,
    pub burst_window_ms: u64,
    /// Default wait budget for `acquire`
    pub acquire_timeout_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_minute: 60,
            requests_per_hour: None,
            tokens_per_minute: None,
            burst_size: None,
            burst_window_ms: 1000,
            acquire_timeout_ms: 60_000,
        }
    }
}

impl RateLimitConfig {
    pub fn per_minute(requests_per_minute: u32) -> Self {
        Self {
            requests_per_minute,
            ..Default::default()
        }
    }

    pub fn with_requests_per_hour(mut self, limit: u32) -> Self {
        self.requests_per_hour = Some(limit);
        self
    }

    pub fn with_tokens_per_minute(mut self, limit: u64) -> Self {
        self.tokens_per_minute = Some(limit);
        self
    }

    pub fn with_burst(mut self, size: u32, window: Duration) -> Self {
        self.burst_size = Some(size);
        self.burst_window_ms = window.as_millis() as u64;
        self
    }

    pub fn burst_window(&self) -> Duration {
        Duration::from_millis(self.burst_window_ms)
    }

    pub fn acquire_timeout(&self) -> Duration {
        Duration::from_millis(self.acquire_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.requests_per_minute == 0 {
            return Err(RunbookError::configuration(
                "requests_per_minute must be greater than 0",
            ));
        }
        if self.requests_per_hour == Some(0) {
            return Err(RunbookError::configuration(
                "requests_per_hour must be greater than 0",
            ));
        }
        if self.tokens_per_minute == Some(0) {
            return Err(RunbookError::configuration(
                "tokens_per_minute must be greater than 0",
            ));
        }
        if let Some(burst) = self.burst_size {
            if burst == 0 {
                return Err(RunbookError::configuration("burst_size must be greater than 0"));
            }
            if self.burst_window_ms == 0 {
                return Err(RunbookError::configuration(
                    "burst_window_ms must be greater than 0",
                ));
            }
        }
        if self.acquire_timeout_ms == 0 {
            return Err(RunbookError::configuration(
                "acquire_timeout_ms must be greater than 0",
            ));
        }
        Ok(())
    }
}

/// Result of a capacity check
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    /// How long until the violated window frees a slot
    pub wait_time: Option<Duration>,
    pub reason: Option<String>,
}

impl RateLimitDecision {
    fn allow() -> Self {
        Self {
            allowed: true,
            wait_time: None,
            reason: None,
        }
    }

    fn deny(wait_time: Option<Duration>, reason: impl Into<String>) -> Self {
        Self {
            allowed: false,
            wait_time,
            reason: Some(reason.into()),
        }
    }
}

/// Point-in-time usage for one key
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitStatus {
    pub key: String,
    pub requests_last_minute: usize,
    pub requests_last_hour: usize,
    pub tokens_last_minute: u64,
    pub queue_length: usize,
    pub limits: RateLimitConfig,
}

#[derive(Debug, Clone, Copy)]
struct RequestRecord {
    at: Instant,
    tokens: u64,
}

struct KeyLimiter {
    config: RateLimitConfig,
    /// Oldest first
    records: Mutex<VecDeque<RequestRecord>>,
    /// Fair lock; tokio hands it out in request order
    turnstile: tokio::sync::Mutex<()>,
    waiting: AtomicUsize,
}

impl KeyLimiter {
    fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            records: Mutex::new(VecDeque::new()),
            turnstile: tokio::sync::Mutex::new(()),
            waiting: AtomicUsize::new(0),
        }
    }

    fn oversized(&self, tokens: Option<u64>) -> Option<String> {
        match (tokens, self.config.tokens_per_minute) {
            (Some(t), Some(limit)) if t > limit => Some(format!(
                "request of {} tokens exceeds tokens_per_minute budget of {}",
                t, limit
            )),
            _ => None,
        }
    }

    fn evaluate(
        &self,
        records: &VecDeque<RequestRecord>,
        tokens: Option<u64>,
        now: Instant,
    ) -> RateLimitDecision {
        if let Some(reason) = self.oversized(tokens) {
            return RateLimitDecision::deny(None, reason);
        }

        let in_window = |window: Duration| {
            records
                .iter()
                .filter(move |r| now.saturating_duration_since(r.at) < window)
        };
        let wait_for = |window: Duration| {
            in_window(window)
                .next()
                .map(|oldest| (oldest.at + window).saturating_duration_since(now))
        };

        if let Some(burst) = self.config.burst_size {
            let window = self.config.burst_window();
            if in_window(window).count() >= burst as usize {
                return RateLimitDecision::deny(
                    wait_for(window),
                    format!("burst limit of {} per {}ms reached", burst, window.as_millis()),
                );
            }
        }

        if in_window(MINUTE).count() >= self.config.requests_per_minute as usize {
            return RateLimitDecision::deny(
                wait_for(MINUTE),
                format!(
                    "requests_per_minute limit of {} reached",
                    self.config.requests_per_minute
                ),
            );
        }

        if let Some(per_hour) = self.config.requests_per_hour {
            if in_window(HOUR).count() >= per_hour as usize {
                return RateLimitDecision::deny(
                    wait_for(HOUR),
                    format!("requests_per_hour limit of {} reached", per_hour),
                );
            }
        }

        if let (Some(limit), Some(requested)) = (self.config.tokens_per_minute, tokens) {
            let used: u64 = in_window(MINUTE).map(|r| r.tokens).sum();
            if used + requested > limit {
                return RateLimitDecision::deny(
                    wait_for(MINUTE),
                    format!(
                        "tokens_per_minute limit of {} reached ({} used)",
                        limit, used
                    ),
                );
            }
        }

        RateLimitDecision::allow()
    }

    fn check(&self, tokens: Option<u64>) -> RateLimitDecision {
        let records = self.records.lock();
        self.evaluate(&records, tokens, Instant::now())
    }

    /// Check and record in one step
    fn try_record(&self, tokens: Option<u64>) -> RateLimitDecision {
        let now = Instant::now();
        let mut records = self.records.lock();
        let decision = self.evaluate(&records, tokens, now);
        if decision.allowed {
            evict_before(&mut records, now);
            records.push_back(RequestRecord {
                at: now,
                tokens: tokens.unwrap_or(0),
            });
        }
        decision
    }
}

fn evict_before(records: &mut VecDeque<RequestRecord>, now: Instant) -> usize {
    let mut removed = 0;
    while let Some(front) = records.front() {
        if now.saturating_duration_since(front.at) >= RECORD_RETENTION {
            records.pop_front();
            removed += 1;
        } else {
            break;
        }
    }
    removed
}

struct WaitGuard<'a>(&'a AtomicUsize);

impl<'a> WaitGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaitGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Rate limiter holding independent state per service key
pub struct RateLimiter {
    limiters: DashMap<String, Arc<KeyLimiter>>,
    configs: HashMap<String, RateLimitConfig>,
    default_config: RateLimitConfig,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

impl RateLimiter {
    pub fn new(default_config: RateLimitConfig) -> Self {
        Self {
            limiters: DashMap::new(),
            configs: HashMap::new(),
            default_config,
        }
    }

    pub fn with_limits(
        limits: HashMap<String, RateLimitConfig>,
        default_config: RateLimitConfig,
    ) -> Self {
        Self {
            limiters: DashMap::new(),
            configs: limits,
            default_config,
        }
    }

    /// Replace the limits for `key`, discarding its recorded history
    pub fn configure(&mut self, key: impl Into<String>, config: RateLimitConfig) {
        let key = key.into();
        self.limiters.remove(&key);
        self.configs.insert(key, config);
    }

    pub fn config_for(&self, key: &str) -> &RateLimitConfig {
        self.configs.get(key).unwrap_or(&self.default_config)
    }

    fn limiter(&self, key: &str) -> Arc<KeyLimiter> {
        if let Some(existing) = self.limiters.get(key) {
            return existing.clone();
        }
        self.limiters
            .entry(key.to_string())
            .or_insert_with(|| Arc::new(KeyLimiter::new(self.config_for(key).clone())))
            .clone()
    }

    /// Check capacity without recording anything
    pub fn can_make_request(&self, key: &str, tokens: Option<u64>) -> RateLimitDecision {
        self.limiter(key).check(tokens)
    }

    /// Record a request if it fits right now, without waiting
    pub fn try_acquire(&self, key: &str, tokens: Option<u64>) -> RateLimitDecision {
        let limiter = self.limiter(key);
        if limiter.waiting.load(Ordering::SeqCst) > 0 {
            return RateLimitDecision::deny(None, "callers already waiting for this key");
        }
        limiter.try_record(tokens)
    }

    /// Wait for capacity and record the request.
    ///
    /// Waiters for a key are served in arrival order. A request that can never
    /// fit in the token budget fails at once; otherwise the call fails with
    /// `RateLimitTimeout` once `timeout` (or the key's `acquire_timeout_ms`)
    /// has passed.
    pub async fn acquire(
        &self,
        key: &str,
        tokens: Option<u64>,
        timeout: Option<Duration>,
    ) -> Result<()> {
        let limiter = self.limiter(key);

        if let Some(reason) = limiter.oversized(tokens) {
            return Err(RunbookError::RateLimitExceeded {
                service: key.to_string(),
                reason,
                wait_ms: None,
            });
        }

        let timeout = timeout.unwrap_or_else(|| limiter.config.acquire_timeout());
        let _waiting = WaitGuard::enter(&limiter.waiting);

        let granted = tokio::time::timeout(timeout, async {
            let _turn = limiter.turnstile.lock().await;
            loop {
                let decision = limiter.try_record(tokens);
                if decision.allowed {
                    return;
                }
                let wait = decision
                    .wait_time
                    .unwrap_or(Duration::from_millis(10))
                    .max(Duration::from_millis(1));
                debug!(
                    service = %key,
                    wait_ms = wait.as_millis() as u64,
                    reason = decision.reason.as_deref().unwrap_or(""),
                    "Rate limited, waiting"
                );
                tokio::time::sleep(wait).await;
            }
        })
        .await;

        granted.map_err(|_| {
            warn!(service = %key, timeout_ms = timeout.as_millis() as u64, "Rate limit wait timed out");
            RunbookError::RateLimitTimeout {
                service: key.to_string(),
                timeout_ms: timeout.as_millis() as u64,
            }
        })
    }

    pub fn status(&self, key: &str) -> RateLimitStatus {
        let limiter = self.limiter(key);
        let now = Instant::now();
        let records = limiter.records.lock();
        let within = |window: Duration| {
            records
                .iter()
                .filter(move |r| now.saturating_duration_since(r.at) < window)
        };
        RateLimitStatus {
            key: key.to_string(),
            requests_last_minute: within(MINUTE).count(),
            requests_last_hour: within(HOUR).count(),
            tokens_last_minute: within(MINUTE).map(|r| r.tokens).sum(),
            queue_length: limiter.waiting.load(Ordering::SeqCst),
            limits: limiter.config.clone(),
        }
    }

    /// Forget all recorded requests for `key`
    pub fn reset(&self, key: &str) {
        if let Some(limiter) = self.limiters.get(key) {
            limiter.records.lock().clear();
        }
    }

    /// Evict records older than the longest tracked window. Returns the
    /// number of records removed.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        self.limiters
            .iter()
            .map(|entry| evict_before(&mut entry.value().records.lock(), now))
            .sum()
    }

    /// Run `sweep` every `interval` until the limiter is dropped
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> JoinHandle<()> {
        let weak: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(limiter) = weak.upgrade() else {
                    break;
                };
                let removed = limiter.sweep();
                if removed > 0 {
                    debug!(removed, "Evicted expired rate limit records");
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test(start_paused = true)]
    async fn test_third_request_in_minute_waits() {
        let limiter = RateLimiter::new(RateLimitConfig::per_minute(2));
        limiter.acquire("svc", None, None).await.unwrap();
        limiter.acquire("svc", None, None).await.unwrap();

        let decision = limiter.can_make_request("svc", None);
        assert!(!decision.allowed);
        assert_eq!(decision.wait_time, Some(Duration::from_secs(60)));
        assert!(decision.reason.unwrap().contains("requests_per_minute"));

        let err = limiter
            .acquire("svc", None, Some(Duration::from_secs(1)))
            .await
            .unwrap_err();
        assert!(matches!(err, RunbookError::RateLimitTimeout { .. }));

        let start = Instant::now();
        limiter
            .acquire("svc", None, Some(Duration::from_secs(120)))
            .await
            .unwrap();
        assert!(start.elapsed() >= Duration::from_secs(58));
    }

    #[tokio::test(start_paused = true)]
    async fn test_burst_checked_first() {
        let config = RateLimitConfig::per_minute(100).with_burst(1, Duration::from_millis(500));
        let limiter = RateLimiter::new(config);
        assert!(limiter.try_acquire("svc", None).allowed);

        let decision = limiter.can_make_request("svc", None);
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("burst"));
        assert_eq!(decision.wait_time, Some(Duration::from_millis(500)));

        tokio::time::advance(Duration::from_millis(500)).await;
        assert!(limiter.can_make_request("svc", None).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_token_budget() {
        let config = RateLimitConfig::per_minute(100).with_tokens_per_minute(1000);
        let limiter = RateLimiter::new(config);

        let err = limiter.acquire("svc", Some(1001), None).await.unwrap_err();
        assert!(matches!(err, RunbookError::RateLimitExceeded { .. }));

        limiter.acquire("svc", Some(600), None).await.unwrap();
        let decision = limiter.can_make_request("svc", Some(500));
        assert!(!decision.allowed);
        assert!(decision.reason.unwrap().contains("tokens_per_minute"));
        assert!(limiter.can_make_request("svc", Some(400)).allowed);
        assert_eq!(limiter.status("svc").tokens_last_minute, 600);
    }

    #[tokio::test(start_paused = true)]
    async fn test_hourly_limit() {
        let config = RateLimitConfig::per_minute(100).with_requests_per_hour(2);
        let limiter = RateLimiter::new(config);
        assert!(limiter.try_acquire("svc", None).allowed);
        tokio::time::advance(Duration::from_secs(120)).await;
        assert!(limiter.try_acquire("svc", None).allowed);

        let decision = limiter.can_make_request("svc", None);
        assert!(!decision.allowed);
        assert_eq!(decision.wait_time, Some(Duration::from_secs(3600 - 120)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_waiters_served_in_order() {
        let limiter = Arc::new(RateLimiter::new(RateLimitConfig::per_minute(1)));
        limiter.acquire("svc", None, None).await.unwrap();

        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        for name in ["first", "second", "third"] {
            let limiter = limiter.clone();
            let tx = tx.clone();
            tokio::spawn(async move {
                limiter
                    .acquire("svc", None, Some(Duration::from_secs(600)))
                    .await
                    .unwrap();
                tx.send(name).unwrap();
            });
            tokio::time::sleep(Duration::from_millis(1)).await;
        }
        drop(tx);

        assert_eq!(limiter.status("svc").queue_length, 3);

        let mut order = Vec::new();
        while let Some(name) = rx.recv().await {
            order.push(name);
        }
        assert_eq!(order, vec!["first", "second", "third"]);
    }

    #[tokio::test(start_paused = true)]
    async fn test_keys_are_independent() {
        let mut limiter = RateLimiter::default();
        limiter.configure("slow", RateLimitConfig::per_minute(1));
        assert!(limiter.try_acquire("slow", None).allowed);
        assert!(!limiter.try_acquire("slow", None).allowed);
        assert!(limiter.try_acquire("fast", None).allowed);

        limiter.reset("slow");
        assert!(limiter.try_acquire("slow", None).allowed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_evicts_old_records() {
        let limiter = Arc::new(RateLimiter::default());
        limiter.try_acquire("svc", None);
        limiter.try_acquire("svc", None);
        assert_eq!(limiter.sweep(), 0);

        tokio::time::advance(RECORD_RETENTION).await;
        assert_eq!(limiter.sweep(), 2);
        assert_eq!(limiter.status("svc").requests_last_hour, 0);

        let handle = limiter.spawn_sweeper(Duration::from_secs(60));
        drop(limiter);
        tokio::time::sleep(Duration::from_secs(120)).await;
        assert!(handle.is_finished());
    }
}
