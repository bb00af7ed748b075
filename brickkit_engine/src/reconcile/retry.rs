use std::collections::hash_map::DefaultHasher;
use std::env;
use std::hash::{Hash, Hasher};
use std::thread;
use std::time::Duration;

use crate::backend::{BackendResult};
use super::CancelToken;

/// Retry policy for transient backend failures
///
/// Exponential backoff with deterministic jitter; permission and
/// validation errors never re-enter the loop.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_retries: 3,
            base_delay_ms: 500,
            max_delay_ms: 10_000,
        }
    }
}

impl RetryPolicy {
    /// Default policy with `BRICKKIT_MAX_RETRIES` honored
    pub fn from_env() -> RetryPolicy {
        let mut policy = RetryPolicy::default();
        if let Ok(val) = env::var("BRICKKIT_MAX_RETRIES") {
            match val.parse::<u32>() {
                Ok(n) => policy.max_retries = n,
                Err(_) => warn!("Ignoring non-numeric BRICKKIT_MAX_RETRIES '{}'", val),
            }
        }
        policy
    }

    /// Fast policy for tests: no sleeping between attempts
    pub fn immediate(max_retries: u32) -> RetryPolicy {
        RetryPolicy {
            max_retries,
            base_delay_ms: 0,
            max_delay_ms: 0,
        }
    }

    /// Backoff for an attempt (1-based), with jitter derived from the
    /// operation name so concurrent workers do not stampede in step
    pub fn delay(&self, what: &str, attempt: u32) -> Duration {
        let exp = self
            .base_delay_ms
            .saturating_mul(1u64 << attempt.min(16))
            .min(self.max_delay_ms);
        let mut hasher = DefaultHasher::new();
        (what, attempt).hash(&mut hasher);
        let jitter = if exp > 0 { hasher.finish() % (exp / 2 + 1) } else { 0 };
        Duration::from_millis(exp + jitter)
    }
}

/// Run a backend call under the retry policy
///
/// Only transient kinds are retried. The cancel token is checked
/// before every attempt; in-flight calls are never interrupted.
pub fn call<T, F>(
    policy: &RetryPolicy,
    cancel: Option<&CancelToken>,
    what: &str,
    mut f: F,
) -> BackendResult<T>
where
    F: FnMut() -> BackendResult<T>,
{
    let mut attempt = 0;
    loop {
        if let Some(token) = cancel {
            if token.is_cancelled() {
                return Err(crate::backend::BackendError::transient("run cancelled"));
            }
        }
        match f() {
            Ok(v) => return Ok(v),
            Err(e) => {
                if !e.is_transient() || attempt >= policy.max_retries {
                    return Err(e);
                }
                attempt += 1;
                let wait = policy.delay(what, attempt);
                debug!(
                    "{} failed transiently ({}), retry {}/{} in {:?}",
                    what, e, attempt, policy.max_retries, wait
                );
                if wait > Duration::from_millis(0) {
                    thread::sleep(wait);
                }
            }
        }
    }
}
