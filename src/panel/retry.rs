use std::{ops::RangeInclusive, time::Duration};

use rand::Rng;

use super::transport::Scheme;

#[derive(Clone, Debug)]
pub(crate) enum Backoff {
    /// `random(range) * attempt_index` seconds. Attempt indices start at zero,
    /// so the second attempt follows the first almost immediately.
    RandomLinear(RangeInclusive<u64>),
    None,
}

/// How every panel operation is retried.
#[derive(Clone, Debug)]
pub(crate) struct RetryPolicy {
    pub(crate) max_attempts: u32,
    pub(crate) schemes: Vec<Scheme>,
    pub(crate) backoff: Backoff,
    /// Upper bound on the whole operation, retries and token refreshes
    /// included.
    pub(crate) overall_deadline: Option<Duration>,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 20,
            schemes: vec![Scheme::Https, Scheme::Http],
            backoff: Backoff::RandomLinear(2..=5),
            overall_deadline: None,
        }
    }
}

impl RetryPolicy {
    /// Delay to wait after the zero-based `attempt` failed, or `None` if it
    /// was the last one.
    pub(crate) fn delay_after(&self, attempt: u32, rng: &mut impl Rng) -> Option<Duration> {
        if attempt + 1 >= self.max_attempts {
            return None;
        }

        Some(match &self.backoff {
            Backoff::RandomLinear(range) => {
                Duration::from_secs(rng.random_range(range.clone()) * u64::from(attempt))
            }
            Backoff::None => Duration::ZERO,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_policy_matches_panel_expectations() {
        let policy = RetryPolicy::default();

        assert_eq!(policy.max_attempts, 20);
        assert_eq!(policy.schemes, [Scheme::Https, Scheme::Http]);
    }

    #[test]
    fn first_retry_is_immediate_then_grows_linearly() {
        let policy = RetryPolicy::default();
        let mut rng = rand::rng();

        assert_eq!(policy.delay_after(0, &mut rng), Some(Duration::ZERO));

        for attempt in 1..19 {
            let delay = policy.delay_after(attempt, &mut rng).unwrap();
            let attempt = u64::from(attempt);
            assert!(delay >= Duration::from_secs(2 * attempt));
            assert!(delay <= Duration::from_secs(5 * attempt));
        }
    }

    #[test]
    fn no_delay_after_final_attempt() {
        let policy = RetryPolicy::default();
        let mut rng = rand::rng();

        assert_eq!(policy.delay_after(19, &mut rng), None);
    }

    #[test]
    fn zero_backoff_policy() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Backoff::None,
            ..RetryPolicy::default()
        };
        let mut rng = rand::rng();

        assert_eq!(policy.delay_after(1, &mut rng), Some(Duration::ZERO));
        assert_eq!(policy.delay_after(2, &mut rng), None);
    }
}
