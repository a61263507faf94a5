use rand::{rng, Rng};
use tokio::time::Duration;

pub(crate) trait ExponentialBackoff: Sized {
    /// Adds a random amount of time, up to `spread`.
    fn add_spread(&self, spread: Duration) -> Self;

    /// Doubles the duration, up to `max`.
    fn exponential_backoff(&self, max: Duration) -> Self;
}

impl ExponentialBackoff for Duration {
    fn add_spread(&self, spread: Duration) -> Self {
        if spread.is_zero() {
            return *self;
        }
        let spread = rng().random_range(0..spread.as_nanos());
        self.saturating_add(Duration::from_nanos(
            u64::try_from(spread).unwrap_or(u64::MAX),
        ))
    }

    fn exponential_backoff(&self, max: Duration) -> Self {
        std::cmp::min(self.saturating_mul(2), max)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_backoff_doubles_up_to_max() {
        let max = Duration::from_millis(500);
        let mut delay = Duration::from_millis(100);
        let mut seen = vec![delay];
        for _ in 0..4 {
            delay = delay.exponential_backoff(max);
            seen.push(delay);
        }
        assert_eq!(
            seen,
            [100, 200, 400, 500, 500].map(Duration::from_millis).to_vec()
        );
    }

    #[test]
    fn test_spread_is_bounded() {
        let base = Duration::from_millis(100);
        assert_eq!(base.add_spread(Duration::ZERO), base);
        for _ in 0..100 {
            let delay = base.add_spread(Duration::from_millis(10));
            assert!(delay >= base && delay < base + Duration::from_millis(10));
        }
    }
}
