use std::time::Duration;

use rand::Rng;

/// Retry policy for reopening the change feed.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffConfig {
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor applied after every attempt
    pub multiplier: f64,
    /// Consecutive retries allowed before giving up. `None` retries forever.
    pub max_retries: Option<u32>,
    /// Fraction of each delay that may be randomly shaved off, in `0.0..=1.0`
    pub jitter: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            max_retries: Some(10),
            jitter: 0.2,
        }
    }
}

/// Exponential backoff state for one run of consecutive failures.
#[derive(Debug, Clone)]
pub struct ExponentialBackoff {
    config: BackoffConfig,
    attempt: u32,
}

impl ExponentialBackoff {
    pub fn new(config: BackoffConfig) -> Self {
        Self { config, attempt: 0 }
    }

    /// Returns the delay before the next retry, or `None` once the retry
    /// budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        if let Some(max_retries) = self.config.max_retries {
            if self.attempt >= max_retries {
                return None;
            }
        }

        let factor = self.config.multiplier.max(1.0).powi(self.attempt as i32);
        let base = self.config.initial_delay.as_secs_f64() * factor;
        let capped = base.min(self.config.max_delay.as_secs_f64());

        let jitter = self.config.jitter.clamp(0.0, 1.0);
        let delay = if jitter > 0.0 {
            capped - rand::thread_rng().gen_range(0.0..=capped * jitter)
        } else {
            capped
        };

        self.attempt += 1;
        Some(Duration::from_secs_f64(delay.max(0.0)))
    }

    /// Clears the failure run after a successful read.
    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Number of delays handed out since the last reset.
    pub fn attempts(&self) -> u32 {
        self.attempt
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(max_retries: Option<u32>) -> BackoffConfig {
        BackoffConfig {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(1000),
            multiplier: 2.0,
            max_retries,
            jitter: 0.0,
        }
    }

    #[test]
    fn test_delays_double_until_capped() {
        let mut backoff = ExponentialBackoff::new(config(None));

        let delays: Vec<u128> = (0..6)
            .map(|_| backoff.next_delay().unwrap().as_millis())
            .collect();

        assert_eq!(delays, vec![100, 200, 400, 800, 1000, 1000]);
    }

    #[test]
    fn test_retry_budget_and_reset() {
        let mut backoff = ExponentialBackoff::new(config(Some(2)));

        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_some());
        assert!(backoff.next_delay().is_none());
        assert_eq!(backoff.attempts(), 2);

        backoff.reset();
        assert_eq!(backoff.next_delay().map(|d| d.as_millis()), Some(100));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let mut backoff = ExponentialBackoff::new(BackoffConfig {
            jitter: 0.5,
            ..config(None)
        });

        for _ in 0..20 {
            backoff.reset();
            let delay = backoff.next_delay().unwrap();
            assert!(delay >= Duration::from_millis(49));
            assert!(delay <= Duration::from_millis(100));
        }
    }
}
