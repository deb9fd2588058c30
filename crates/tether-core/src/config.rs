//! Proxy configuration: per-category timeouts, restart policy and
//! abandonment behavior.

use std::time::Duration;

use rand::Rng;

use crate::rpc::CallCategory;

/// Configuration for a [`WorkerProxy`](crate::WorkerProxy).
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Timeouts per call category.
    pub timeouts: TimeoutConfig,
    /// How long callers wait for the worker to become ready.
    pub init_timeout: Duration,
    /// Automatic restart after a crash.
    pub restart: RestartPolicy,
    /// What happens on the worker when a caller abandons a generation stream.
    pub abandon: AbandonPolicy,
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            timeouts: TimeoutConfig::default(),
            init_timeout: Duration::from_secs(60),
            restart: RestartPolicy::default(),
            abandon: AbandonPolicy::default(),
        }
    }
}

/// Timeout per call category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutConfig {
    /// Ordinary unary operations.
    pub standard: Duration,
    /// Long-running operations such as model downloads.
    pub long_running: Duration,
    /// Token generation, streamed or not.
    pub generation: Duration,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            standard: Duration::from_secs(60),
            long_running: Duration::from_secs(600),
            generation: Duration::from_secs(300),
        }
    }
}

impl TimeoutConfig {
    /// Timeout for a call category.
    pub fn for_category(&self, category: CallCategory) -> Duration {
        match category {
            CallCategory::Standard => self.standard,
            CallCategory::LongRunning => self.long_running,
            CallCategory::Generation => self.generation,
        }
    }
}

/// Bounded restart policy applied after a channel crash.
///
/// Delay for attempt `n` (0-based) is `base_delay * multiplier^n`, capped at
/// `max_delay`, plus up to 50% random jitter when enabled.
#[derive(Debug, Clone, PartialEq)]
pub struct RestartPolicy {
    /// Restarts permitted over the proxy's lifetime.
    pub max_attempts: u32,
    /// Delay before the first restart.
    pub base_delay: Duration,
    /// Growth factor between attempts. `1.0` keeps the delay fixed.
    pub multiplier: f64,
    /// Upper bound on the computed delay.
    pub max_delay: Duration,
    /// Add random jitter to each delay.
    pub jitter: bool,
}

impl Default for RestartPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::from_secs(1))
    }
}

impl RestartPolicy {
    /// Constant delay, no jitter.
    pub fn fixed(max_attempts: u32, delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay: delay,
            multiplier: 1.0,
            max_delay: Duration::from_secs(30),
            jitter: false,
        }
    }

    /// Doubling delay with jitter, for hosts that may run several proxies.
    pub fn exponential(max_attempts: u32, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts,
            base_delay,
            multiplier: 2.0,
            max_delay,
            jitter: true,
        }
    }

    /// Never restart.
    pub fn disabled() -> Self {
        Self::fixed(0, Duration::ZERO)
    }

    /// Delay before restart attempt `attempt` (0-based).
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = self.multiplier.max(1.0).powi(attempt.min(32) as i32);
        let scaled = self.base_delay.as_secs_f64() * factor;
        let capped = Duration::from_secs_f64(scaled.min(self.max_delay.as_secs_f64()));

        if self.jitter && !capped.is_zero() {
            let max_jitter = capped.as_millis() as u64 / 2;
            capped + Duration::from_millis(rand::rng().random_range(0..=max_jitter))
        } else {
            capped
        }
    }
}

/// What to do on the worker when a consumer drops a generation stream early.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum AbandonPolicy {
    /// Stop consuming locally and let the worker run to completion.
    #[default]
    LetFinish,
    /// Also send `abortGeneration` to the worker.
    AbortGeneration,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_timeouts() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.for_category(CallCategory::Standard), Duration::from_secs(60));
        assert_eq!(timeouts.for_category(CallCategory::LongRunning), Duration::from_secs(600));
        assert_eq!(timeouts.for_category(CallCategory::Generation), Duration::from_secs(300));
    }

    #[test]
    fn test_fixed_delay_does_not_grow() {
        let policy = RestartPolicy::default();
        assert_eq!(policy.max_attempts, 3);
        assert_eq!(policy.delay_for(0), Duration::from_secs(1));
        assert_eq!(policy.delay_for(2), Duration::from_secs(1));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let mut policy =
            RestartPolicy::exponential(5, Duration::from_millis(100), Duration::from_millis(350));
        policy.jitter = false;
        assert_eq!(policy.delay_for(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for(30), Duration::from_millis(350));
    }

    #[test]
    fn test_jitter_stays_within_half_delay() {
        let policy =
            RestartPolicy::exponential(3, Duration::from_millis(200), Duration::from_secs(10));
        for _ in 0..50 {
            let delay = policy.delay_for(0);
            assert!(delay >= Duration::from_millis(200));
            assert!(delay <= Duration::from_millis(300));
        }
    }
}
