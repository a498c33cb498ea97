//! Reconnect backoff policy.

use std::time::Duration;

use rand::Rng;

/// Successive reconnect delays for one failure streak.
pub trait BackoffPolicy: Send {
    fn next_backoff(&mut self) -> Duration;
}

/// Hands out a fresh policy each time a failure streak begins.
pub trait BackoffPolicyProvider: Send + Sync {
    fn get(&self) -> Box<dyn BackoffPolicy>;
}

const INITIAL_BACKOFF: Duration = Duration::from_secs(1);
const MAX_BACKOFF: Duration = Duration::from_secs(120);
const MULTIPLIER: f64 = 1.6;
const JITTER: f64 = 0.2;

/// Exponential backoff: 1s initial, ×1.6 per attempt, 120s cap, ±20% jitter.
pub struct ExponentialBackoff {
    next: f64,
}

impl ExponentialBackoff {
    pub fn new() -> ExponentialBackoff {
        ExponentialBackoff {
            next: INITIAL_BACKOFF.as_secs_f64(),
        }
    }
}

impl Default for ExponentialBackoff {
    fn default() -> ExponentialBackoff {
        ExponentialBackoff::new()
    }
}

impl BackoffPolicy for ExponentialBackoff {
    fn next_backoff(&mut self) -> Duration {
        let current = self.next;
        self.next = (current * MULTIPLIER).min(MAX_BACKOFF.as_secs_f64());
        let jitter = rand::thread_rng().gen_range(-JITTER..=JITTER);
        Duration::from_secs_f64(current * (1.0 + jitter))
    }
}

/// Provider for [`ExponentialBackoff`].
pub struct ExponentialBackoffProvider;

impl BackoffPolicyProvider for ExponentialBackoffProvider {
    fn get(&self) -> Box<dyn BackoffPolicy> {
        Box::new(ExponentialBackoff::new())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delays_grow_toward_the_cap_with_bounded_jitter() {
        let mut policy = ExponentialBackoff::new();
        let mut nominal = 1.0f64;
        for _ in 0..20 {
            let delay = policy.next_backoff().as_secs_f64();
            assert!(delay >= nominal * (1.0 - JITTER) - 1e-9, "delay {delay} nominal {nominal}");
            assert!(delay <= nominal * (1.0 + JITTER) + 1e-9, "delay {delay} nominal {nominal}");
            nominal = (nominal * MULTIPLIER).min(120.0);
        }
        assert_eq!(nominal, 120.0);
    }
}
