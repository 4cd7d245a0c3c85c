//! Per-provider rate limiting, backoff and retry.
//!
//! Every external call goes through one [`RateLimiter`]. Each [`Provider`]
//! owns an independent token bucket (`governor`) and backoff window, so a
//! throttled knowledge store never slows the calendar or the LLM.
//!
//! # Retry strategy
//!
//! [`RateLimiter::call`] wraps any `Result`-returning async operation:
//!
//! 1. [`acquire`](RateLimiter::acquire): wait for the backoff window to
//!    close, then for a token.
//! 2. Run the operation under the provider's call timeout.
//! 3. [`on_result`](RateLimiter::on_result): success resets backoff;
//!    throttling (HTTP 429, honouring `Retry-After`), 5xx, timeouts and
//!    network errors extend it to `base · 2^(n-1)` (capped) plus jitter.
//! 4. Retryable failures are retried up to `max_retries` times. Running out
//!    while throttled yields [`CallError::Exhausted`]; running out on other
//!    transient failures yields the last error. Everything else (4xx,
//!    credentials) returns immediately.
//!
//! The wrapped operation never sees the attempt number.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use governor::{DefaultDirectRateLimiter, Quota};
use prism_core::store::ProviderError;
use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::{ProviderLimits, RateLimitsConfig};
use crate::error::Error;

/// An external service with its own rate budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Provider {
    Notion,
    Calendar,
    Llm,
}

impl Provider {
    pub const ALL: [Provider; 3] = [Provider::Notion, Provider::Calendar, Provider::Llm];

    pub fn as_str(&self) -> &'static str {
        match self {
            Provider::Notion => "notion",
            Provider::Calendar => "calendar",
            Provider::Llm => "llm",
        }
    }
}

impl fmt::Display for Provider {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Exponential backoff with jitter.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub base: Duration,
    pub max: Duration,
    pub max_retries: u32,
}

impl BackoffPolicy {
    pub fn from_limits(limits: &ProviderLimits) -> Self {
        Self {
            base: Duration::from_millis(limits.base_delay_ms),
            max: Duration::from_millis(limits.max_delay_ms),
            max_retries: limits.max_retries,
        }
    }

    /// Delay after the `failures`-th consecutive failure (1-based).
    ///
    /// A server-provided `Retry-After` replaces the exponential term; the
    /// result never exceeds `max` before jitter is added.
    pub fn delay(&self, failures: u32, retry_after: Option<Duration>) -> Duration {
        let exponent = 2u32.saturating_pow(failures.saturating_sub(1));
        let backoff = retry_after.unwrap_or_else(|| self.base.saturating_mul(exponent));
        let capped = backoff.min(self.max);
        let jitter_ms = self.base.as_millis() as u64;
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(rand::thread_rng().gen_range(0..=jitter_ms))
        };
        capped + jitter
    }
}

/// Outcome of one provider call, as reported to [`RateLimiter::on_result`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Success,
    Throttled { retry_after: Option<Duration> },
    Transient,
    /// A non-retryable failure; leaves backoff untouched.
    Rejected,
}

impl Outcome {
    pub fn of<T>(result: &Result<T, ProviderError>) -> Self {
        match result {
            Ok(_) => Outcome::Success,
            Err(ProviderError::Throttled { retry_after }) => Outcome::Throttled {
                retry_after: *retry_after,
            },
            Err(e) if e.is_retryable() => Outcome::Transient,
            Err(_) => Outcome::Rejected,
        }
    }
}

/// Proof that a request may be sent now.
#[derive(Debug)]
#[must_use = "report the outcome with RateLimiter::on_result"]
pub struct Permit {
    provider: Provider,
}

impl Permit {
    pub fn provider(&self) -> Provider {
        self.provider
    }
}

/// Failure of a call made through [`RateLimiter::call`].
#[derive(Debug, Clone, thiserror::Error)]
pub enum CallError {
    #[error("rate limit exhausted for {provider} after {attempts} attempts")]
    Exhausted { provider: Provider, attempts: u32 },
    #[error(transparent)]
    Provider(#[from] ProviderError),
}

impl CallError {
    /// Convert into the engine error taxonomy, wrapping plain provider
    /// failures with `wrap` (e.g. [`Error::Fetch`]).
    pub fn into_error(self, provider: Provider, wrap: fn(ProviderError) -> Error) -> Error {
        match self {
            CallError::Exhausted { provider, attempts } => Error::RateLimitExhausted { provider, attempts },
            CallError::Provider(e) => Error::from_provider(provider, e, wrap),
        }
    }
}

#[derive(Debug, Default)]
struct BackoffState {
    failures: u32,
    until: Option<Instant>,
}

struct ProviderState {
    bucket: DefaultDirectRateLimiter,
    policy: BackoffPolicy,
    timeout: Duration,
    backoff: Mutex<BackoffState>,
}

impl ProviderState {
    fn new(limits: &ProviderLimits) -> Self {
        let rps = NonZeroU32::new(limits.requests_per_second).unwrap_or(NonZeroU32::MIN);
        let burst = NonZeroU32::new(limits.burst).unwrap_or(NonZeroU32::MIN);
        Self {
            bucket: DefaultDirectRateLimiter::direct(Quota::per_second(rps).allow_burst(burst)),
            policy: BackoffPolicy::from_limits(limits),
            timeout: Duration::from_secs(limits.timeout_secs),
            backoff: Mutex::new(BackoffState::default()),
        }
    }

    fn remaining_backoff(&self) -> Duration {
        let state = self.backoff.lock().unwrap_or_else(|e| e.into_inner());
        state
            .until
            .map(|until| until.saturating_duration_since(Instant::now()))
            .unwrap_or(Duration::ZERO)
    }
}

/// Shared limiter for all providers.
pub struct RateLimiter {
    providers: HashMap<Provider, ProviderState>,
    retries: AtomicU64,
}

impl RateLimiter {
    pub fn new(config: &RateLimitsConfig) -> Self {
        Self {
            providers: Provider::ALL
                .into_iter()
                .map(|p| (p, ProviderState::new(config.for_provider(p))))
                .collect(),
            retries: AtomicU64::new(0),
        }
    }

    fn state(&self, provider: Provider) -> &ProviderState {
        // Every provider is inserted in `new`.
        &self.providers[&provider]
    }

    /// Total retries performed since startup, across providers.
    pub fn retries(&self) -> u64 {
        self.retries.load(Ordering::Relaxed)
    }

    /// Time until `provider`'s backoff window closes.
    pub fn backoff_remaining(&self, provider: Provider) -> Duration {
        self.state(provider).remaining_backoff()
    }

    /// Wait until `provider` accepts another request.
    pub async fn acquire(&self, provider: Provider) -> Permit {
        let state = self.state(provider);
        loop {
            let wait = state.remaining_backoff();
            if wait.is_zero() {
                break;
            }
            tracing::debug!(%provider, wait_ms = wait.as_millis() as u64, "waiting for backoff window");
            tokio::time::sleep(wait).await;
        }
        state.bucket.until_ready().await;
        Permit { provider }
    }

    /// Record the outcome of the request made under `permit`.
    pub fn on_result(&self, permit: Permit, outcome: Outcome) {
        let state = self.state(permit.provider);
        let mut backoff = state.backoff.lock().unwrap_or_else(|e| e.into_inner());
        match outcome {
            Outcome::Success => {
                backoff.failures = 0;
                backoff.until = None;
            }
            Outcome::Throttled { retry_after } => {
                backoff.failures += 1;
                let delay = state.policy.delay(backoff.failures, retry_after);
                backoff.until = Some(Instant::now() + delay);
                tracing::warn!(provider = %permit.provider, failures = backoff.failures, delay_ms = delay.as_millis() as u64, "provider throttled; backing off");
            }
            Outcome::Transient => {
                backoff.failures += 1;
                let delay = state.policy.delay(backoff.failures, None);
                backoff.until = Some(Instant::now() + delay);
                tracing::warn!(provider = %permit.provider, failures = backoff.failures, delay_ms = delay.as_millis() as u64, "transient provider error; backing off");
            }
            Outcome::Rejected => {}
        }
    }

    /// Run `op` against `provider` with rate limiting, timeout and retry.
    pub async fn call<T, F, Fut>(&self, provider: Provider, mut op: F) -> Result<T, CallError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, ProviderError>>,
    {
        let state = self.state(provider);
        let attempts = state.policy.max_retries + 1;
        let mut last_err = None;

        for attempt in 1..=attempts {
            if attempt > 1 {
                self.retries.fetch_add(1, Ordering::Relaxed);
            }
            let permit = self.acquire(provider).await;
            let result = match tokio::time::timeout(state.timeout, op()).await {
                Ok(r) => r,
                Err(_) => Err(ProviderError::Timeout),
            };
            self.on_result(permit, Outcome::of(&result));

            match result {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() => {
                    tracing::debug!(%provider, attempt, error = %e, "retryable provider error");
                    last_err = Some(e);
                }
                Err(e) => return Err(CallError::Provider(e)),
            }
        }

        match last_err {
            Some(e) if e.is_throttle() => Err(CallError::Exhausted { provider, attempts }),
            Some(e) => Err(CallError::Provider(e)),
            None => Err(CallError::Exhausted { provider, attempts }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicU32;

    fn limits(max_retries: u32) -> RateLimitsConfig {
        let fast = ProviderLimits {
            requests_per_second: 1000,
            burst: 1000,
            max_retries,
            base_delay_ms: 100,
            max_delay_ms: 1_000,
            timeout_secs: 1,
        };
        RateLimitsConfig {
            notion: fast.clone(),
            calendar: fast.clone(),
            llm: fast,
        }
    }

    #[test]
    fn delay_grows_and_caps() {
        let policy = BackoffPolicy {
            base: Duration::from_millis(100),
            max: Duration::from_millis(1_000),
            max_retries: 5,
        };
        let first = policy.delay(1, None);
        assert!(first >= Duration::from_millis(100) && first <= Duration::from_millis(200));
        let third = policy.delay(3, None);
        assert!(third >= Duration::from_millis(400) && third <= Duration::from_millis(500));
        let huge = policy.delay(30, None);
        assert!(huge <= Duration::from_millis(1_100));
        let honoured = policy.delay(1, Some(Duration::from_millis(700)));
        assert!(honoured >= Duration::from_millis(700));
    }

    #[tokio::test(start_paused = true)]
    async fn throttling_is_bounded_then_exhausted() {
        let limiter = RateLimiter::new(&limits(3));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = limiter
            .call(Provider::Notion, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Throttled { retry_after: None })
            })
            .await;
        assert!(matches!(
            result,
            Err(CallError::Exhausted {
                provider: Provider::Notion,
                attempts: 4
            })
        ));
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(limiter.retries(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_then_success() {
        let limiter = RateLimiter::new(&limits(3));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = limiter
            .call(Provider::Llm, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    Err(ProviderError::Transient("502".into()))
                } else {
                    Ok(42)
                }
            })
            .await;
        assert_eq!(result.unwrap(), 42);
        assert_eq!(limiter.retries(), 1);
        assert_eq!(limiter.backoff_remaining(Provider::Llm), Duration::ZERO);
    }

    #[tokio::test(start_paused = true)]
    async fn transient_exhaustion_returns_last_error() {
        let limiter = RateLimiter::new(&limits(2));
        let result: Result<(), _> = limiter
            .call(Provider::Notion, move || async move { Err(ProviderError::Transient("503".into())) })
            .await;
        assert!(matches!(result, Err(CallError::Provider(ProviderError::Transient(_)))));
    }

    #[tokio::test(start_paused = true)]
    async fn non_retryable_returns_immediately() {
        let limiter = RateLimiter::new(&limits(5));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result: Result<(), _> = limiter
            .call(Provider::Notion, move || async move {
                calls.fetch_add(1, Ordering::SeqCst);
                Err(ProviderError::Unauthorized("bad token".into()))
            })
            .await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let err = result.unwrap_err().into_error(Provider::Notion, Error::Fetch);
        assert!(matches!(err, Error::Unauthorized { provider: Provider::Notion, .. }));
    }

    #[tokio::test(start_paused = true)]
    async fn slow_call_times_out_and_is_retried() {
        let limiter = RateLimiter::new(&limits(1));
        let counter = AtomicU32::new(0);
        let calls = &counter;
        let result = limiter
            .call(Provider::Calendar, move || async move {
                if calls.fetch_add(1, Ordering::SeqCst) == 0 {
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
                Ok::<_, ProviderError>("done")
            })
            .await;
        assert_eq!(result.unwrap(), "done");
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn backoff_is_provider_scoped() {
        let limiter = RateLimiter::new(&limits(0));
        let _ = limiter
            .call(Provider::Notion, move || async move {
                Err::<(), _>(ProviderError::Throttled {
                    retry_after: Some(Duration::from_secs(1)),
                })
            })
            .await;
        assert!(limiter.backoff_remaining(Provider::Notion) > Duration::ZERO);
        assert_eq!(limiter.backoff_remaining(Provider::Calendar), Duration::ZERO);
    }
}
