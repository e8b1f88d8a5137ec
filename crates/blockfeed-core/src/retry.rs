//! Exponential backoff with random jitter for reconnect-on-error loops.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::FeedError;

/// Configuration for the retry policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Maximum number of retry attempts (not counting the first try).
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    /// Delay before the first retry.
    #[serde(default = "default_initial_backoff_ms")]
    pub initial_backoff_ms: u64,
    /// Caps exponential growth.
    #[serde(default = "default_max_backoff_ms")]
    pub max_backoff_ms: u64,
    /// Multiplier applied to backoff on each retry.
    #[serde(default = "default_multiplier")]
    pub multiplier: f64,
    /// Upper bound of the uniformly random delay added to every backoff.
    #[serde(default = "default_jitter_ms")]
    pub jitter_ms: u64,
}

fn default_max_retries() -> u32 {
    3
}
fn default_initial_backoff_ms() -> u64 {
    500
}
fn default_max_backoff_ms() -> u64 {
    10_000
}
fn default_multiplier() -> f64 {
    2.0
}
fn default_jitter_ms() -> u64 {
    500
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: default_max_retries(),
            initial_backoff_ms: default_initial_backoff_ms(),
            max_backoff_ms: default_max_backoff_ms(),
            multiplier: default_multiplier(),
            jitter_ms: default_jitter_ms(),
        }
    }
}

/// Stateless retry policy: computes the next delay given the attempt number.
#[derive(Debug, Clone, Default)]
pub struct RetryPolicy {
    pub config: RetryConfig,
}

impl RetryPolicy {
    pub fn new(config: RetryConfig) -> Self {
        Self { config }
    }

    /// Backoff before the `attempt`-th retry (1-based), without jitter.
    /// Returns `None` if `attempt` exceeds `max_retries`.
    pub fn base_delay(&self, attempt: u32) -> Option<Duration> {
        if attempt == 0 || attempt > self.config.max_retries {
            return None;
        }
        let base_ms = self.config.initial_backoff_ms as f64
            * self.config.multiplier.powi((attempt - 1) as i32);
        let capped = base_ms.min(self.config.max_backoff_ms as f64);
        Some(Duration::from_millis(capped as u64))
    }

    /// Backoff plus a random `0..=jitter_ms` offset.
    pub fn next_delay(&self, attempt: u32) -> Option<Duration> {
        let base = self.base_delay(attempt)?;
        let jitter = if self.config.jitter_ms > 0 {
            rand::thread_rng().gen_range(0..=self.config.jitter_ms)
        } else {
            0
        };
        Some(base + Duration::from_millis(jitter))
    }

    /// Returns `true` if any retries remain after `attempt` failures.
    pub fn should_retry(&self, attempt: u32) -> bool {
        attempt <= self.config.max_retries
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// retry budget is spent. Sleeps honour `cancel`.
    pub async fn run<T, F, Fut>(
        &self,
        what: &str,
        cancel: &CancellationToken,
        mut op: F,
    ) -> Result<T, FeedError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, FeedError>>,
    {
        let mut attempt = 0u32;
        loop {
            let err = match op().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            attempt += 1;
            let Some(delay) = self.next_delay(attempt) else {
                return Err(FeedError::RetriesExhausted {
                    attempts: attempt,
                    last_error: err.to_string(),
                });
            };

            warn!(
                what,
                attempt,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "retrying after transient error"
            );

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(FeedError::Aborted { reason: format!("{what}: cancelled during backoff") });
                }
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    fn no_jitter(max_retries: u32) -> RetryPolicy {
        RetryPolicy::new(RetryConfig {
            max_retries,
            initial_backoff_ms: 100,
            max_backoff_ms: 30_000,
            multiplier: 2.0,
            jitter_ms: 0,
        })
    }

    #[test]
    fn first_retry_delay() {
        let policy = no_jitter(3);
        assert_eq!(policy.next_delay(1).unwrap().as_millis(), 100);
        assert_eq!(policy.next_delay(2).unwrap().as_millis(), 200);
        assert_eq!(policy.next_delay(3).unwrap().as_millis(), 400);
        assert!(policy.next_delay(4).is_none());
    }

    #[test]
    fn delay_capped_at_max() {
        let policy = RetryPolicy::new(RetryConfig {
            max_retries: 10,
            initial_backoff_ms: 100,
            max_backoff_ms: 500,
            multiplier: 10.0,
            jitter_ms: 0,
        });
        let d5 = policy.next_delay(5).unwrap();
        assert!(d5 <= Duration::from_millis(500), "d5={d5:?} exceeds max");
    }

    #[test]
    fn jitter_stays_within_bound() {
        let policy = RetryPolicy::new(RetryConfig {
            jitter_ms: 50,
            ..no_jitter(3).config
        });
        for _ in 0..100 {
            let d = policy.next_delay(1).unwrap().as_millis();
            assert!((100..=150).contains(&d), "d={d}");
        }
    }

    #[test]
    fn should_retry_boundary() {
        let policy = no_jitter(2);
        assert!(policy.should_retry(1));
        assert!(policy.should_retry(2));
        assert!(!policy.should_retry(3));
    }

    #[tokio::test]
    async fn run_recovers_from_transient_errors() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_backoff_ms: 1,
            ..no_jitter(3).config
        });
        let calls = AtomicU32::new(0);
        let out = policy
            .run("test", &CancellationToken::new(), || async {
                if calls.fetch_add(1, Ordering::SeqCst) < 2 {
                    Err(FeedError::Rpc("unavailable".into()))
                } else {
                    Ok(7)
                }
            })
            .await
            .unwrap();
        assert_eq!(out, 7);
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn run_gives_up_after_budget() {
        let policy = RetryPolicy::new(RetryConfig {
            initial_backoff_ms: 1,
            ..no_jitter(2).config
        });
        let err = policy
            .run("test", &CancellationToken::new(), || async {
                Err::<(), _>(FeedError::Rpc("down".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::RetriesExhausted { attempts: 3, .. }));
    }

    #[tokio::test]
    async fn run_does_not_retry_permanent_errors() {
        let calls = AtomicU32::new(0);
        let err = no_jitter(5)
            .run("test", &CancellationToken::new(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Err::<(), _>(FeedError::Config("bad".into()))
            })
            .await
            .unwrap_err();
        assert!(matches!(err, FeedError::Config(_)));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
