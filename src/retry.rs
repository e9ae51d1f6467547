use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;

use rand::Rng;
use serde::Serialize;
use tracing::{debug, info, warn};

/// Backoff and retry-budget knobs. Defaults match a UI automation loop:
/// three retries, one second base, ten second ceiling.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub exponential_base: f64,
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(1000),
            max_delay: Duration::from_millis(10_000),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

/// Outcome of one protected operation invocation.
#[derive(Clone, Debug, Serialize)]
pub struct RetryResult<T> {
    pub success: bool,
    pub result: Option<T>,
    pub error: Option<String>,
    pub attempts: u32,
    #[serde(skip)]
    pub total_time: Duration,
}

/// Aggregates over the bounded attempt history.
#[derive(Clone, Debug, Default, Serialize)]
pub struct RetryStats {
    pub total_attempts: usize,
    pub success_rate: f64,
    pub average_attempt: f64,
    pub failures_last_minute: usize,
}

/// Error fragments that mark a failure as structurally unrecoverable:
/// retrying a permission error or a missing element does not help.
const TERMINAL_PATTERNS: &[&str] = &[
    "permission denied",
    "access denied",
    "not found",
    "invalid",
    "unauthorized",
    "forbidden",
    "aborted",
    "cancelled",
];

const HISTORY_LIMIT: usize = 100;
const CIRCUIT_THRESHOLD: u32 = 5;
const CIRCUIT_COOLDOWN: Duration = Duration::from_secs(30);

#[derive(Clone, Debug, Default)]
struct BreakerState {
    consecutive_failures: u32,
    last_failure: Option<Instant>,
}

#[derive(Clone, Debug)]
struct AttemptRecord {
    operation: String,
    attempt: u32,
    success: bool,
    at: Instant,
}

/// Executes operations with exponential backoff, terminal-failure
/// suppression and per-key circuit breaking. Breaker state is owned by the
/// instance, so independent agents never share it.
pub struct RetryCoordinator {
    policy: RetryPolicy,
    breakers: HashMap<String, BreakerState>,
    history: VecDeque<AttemptRecord>,
}

impl RetryCoordinator {
    pub fn new(policy: RetryPolicy) -> Self {
        Self {
            policy,
            breakers: HashMap::new(),
            history: VecDeque::new(),
        }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Drop all breaker state and history. Intended for test isolation and
    /// for operator-driven recovery.
    pub fn reset(&mut self) {
        self.breakers.clear();
        self.history.clear();
    }

    /// Backoff before the given attempt (1-based):
    /// `min(base * exponential_base^(attempt-1), max)`, then scaled by a
    /// uniform factor in [0.5, 1.0] when jitter is on. Jitter exists to avoid
    /// synchronized retry storms when several operations fail together.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let exp = self.policy.exponential_base.powi(attempt.saturating_sub(1) as i32);
        let raw = self.policy.base_delay.as_millis() as f64 * exp;
        let capped = raw.min(self.policy.max_delay.as_millis() as f64);
        let scaled = if self.policy.jitter {
            capped * rand::thread_rng().gen_range(0.5..=1.0)
        } else {
            capped
        };
        Duration::from_millis(scaled as u64)
    }

    /// Run `operation` with retries; all failures considered retryable apart
    /// from the terminal patterns.
    pub async fn execute<F, Fut, T>(&mut self, name: &str, operation: F) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        self.execute_filtered(name, operation, |_, _| true).await
    }

    /// Run `operation` with retries. A failure is retried only while the
    /// retry budget lasts, the error matches no terminal pattern, and
    /// `should_retry(error, attempt)` agrees.
    pub async fn execute_filtered<F, Fut, T, P>(
        &mut self,
        name: &str,
        operation: F,
        should_retry: P,
    ) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, String>>,
        P: Fn(&str, u32) -> bool,
    {
        let start = Instant::now();
        let mut last_error = String::new();

        for attempt in 1..=self.policy.max_retries.max(1) {
            match operation().await {
                Ok(value) => {
                    self.record(name, attempt, true);
                    if attempt > 1 {
                        info!(operation = name, attempt, "succeeded after retry");
                    }
                    return RetryResult {
                        success: true,
                        result: Some(value),
                        error: None,
                        attempts: attempt,
                        total_time: start.elapsed(),
                    };
                }
                Err(error) => {
                    self.record(name, attempt, false);
                    warn!(operation = name, attempt, %error, "attempt failed");
                    let terminal = Self::is_terminal(&error);
                    let caller_stop = !should_retry(&error, attempt);
                    last_error = error;
                    if terminal || caller_stop {
                        debug!(operation = name, terminal, "not retrying");
                        return RetryResult {
                            success: false,
                            result: None,
                            error: Some(last_error),
                            attempts: attempt,
                            total_time: start.elapsed(),
                        };
                    }
                    if attempt < self.policy.max_retries.max(1) {
                        tokio::time::sleep(self.calculate_delay(attempt)).await;
                    }
                }
            }
        }

        RetryResult {
            success: false,
            result: None,
            error: Some(last_error),
            attempts: self.policy.max_retries.max(1),
            total_time: start.elapsed(),
        }
    }

    /// Like [`execute`](Self::execute), guarded by the circuit breaker for
    /// `circuit_key`. While a breaker is open, calls are rejected without
    /// invoking the operation; once the cooldown has elapsed since the last
    /// failure the breaker half-closes and new attempts flow again. A single
    /// success closes it fully.
    pub async fn execute_with_circuit_breaker<F, Fut, T>(
        &mut self,
        name: &str,
        circuit_key: &str,
        operation: F,
    ) -> RetryResult<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T, String>>,
    {
        {
            let breaker = self.breakers.entry(circuit_key.to_string()).or_default();
            if breaker.consecutive_failures >= CIRCUIT_THRESHOLD {
                let cooled = breaker
                    .last_failure
                    .map(|at| at.elapsed() >= CIRCUIT_COOLDOWN)
                    .unwrap_or(true);
                if cooled {
                    debug!(key = circuit_key, "circuit breaker half-closed");
                    breaker.consecutive_failures = 0;
                } else {
                    warn!(key = circuit_key, "circuit breaker open, rejecting call");
                    return RetryResult {
                        success: false,
                        result: None,
                        error: Some(format!("circuit breaker open for '{}'", circuit_key)),
                        attempts: 0,
                        total_time: Duration::ZERO,
                    };
                }
            }
        }

        let result = self.execute(name, operation).await;

        let breaker = self.breakers.entry(circuit_key.to_string()).or_default();
        if result.success {
            breaker.consecutive_failures = 0;
        } else {
            breaker.consecutive_failures += 1;
            breaker.last_failure = Some(Instant::now());
        }
        result
    }

    pub fn stats(&self) -> RetryStats {
        let total = self.history.len();
        if total == 0 {
            return RetryStats::default();
        }
        let successes = self.history.iter().filter(|r| r.success).count();
        let attempt_sum: u32 = self.history.iter().map(|r| r.attempt).sum();
        let minute_ago = Duration::from_secs(60);
        let failures_last_minute = self
            .history
            .iter()
            .filter(|r| !r.success && r.at.elapsed() <= minute_ago)
            .count();
        RetryStats {
            total_attempts: total,
            success_rate: successes as f64 / total as f64,
            average_attempt: attempt_sum as f64 / total as f64,
            failures_last_minute,
        }
    }

    fn is_terminal(error: &str) -> bool {
        let lower = error.to_lowercase();
        TERMINAL_PATTERNS.iter().any(|p| lower.contains(p))
    }

    fn record(&mut self, operation: &str, attempt: u32, success: bool) {
        if self.history.len() >= HISTORY_LIMIT {
            self.history.pop_front();
        }
        self.history.push_back(AttemptRecord {
            operation: operation.to_string(),
            attempt,
            success,
            at: Instant::now(),
        });
    }

    /// Operations seen in the bounded history, most recent last. Handy for
    /// diagnostics.
    pub fn recent_operations(&self) -> Vec<String> {
        self.history.iter().map(|r| r.operation.clone()).collect()
    }
}

impl Default for RetryCoordinator {
    fn default() -> Self {
        Self::new(RetryPolicy::default())
    }
}
