use std::cmp::min;
use std::time::Duration;

/// Intervals between periodic HEARTBEATs while there is no progress: they grow along the
///  Fibonacci sequence (1, 1, 2, 3, 5, ... times the base period) up to a maximum, and any
///  progress starts over.
pub struct FibonacciBackoff {
    previous: Duration,
    current: Duration,

    config_base: Duration,
    config_max: Duration,
}

impl FibonacciBackoff {
    pub fn new(base: Duration, max: Duration) -> FibonacciBackoff {
        assert!(max >= base);

        FibonacciBackoff {
            previous: Duration::ZERO,
            current: base,
            config_base: base,
            config_max: max,
        }
    }

    #[must_use]
    pub fn next_interval(&mut self) -> Duration {
        let result = self.current;
        let next = min(self.previous + self.current, self.config_max);
        self.previous = self.current;
        self.current = next;
        result
    }

    pub fn reset(&mut self) {
        self.previous = Duration::ZERO;
        self.current = self.config_base;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    fn secs(n: u64) -> Duration {
        Duration::from_secs(n)
    }

    #[rstest]
    #[case::initial(0, 1, 1, 100, 1, 1, 1)]
    #[case::second(1, 1, 1, 100, 1, 1, 2)]
    #[case::third(1, 2, 1, 100, 2, 2, 3)]
    #[case::later(5, 8, 1, 100, 8, 8, 13)]
    #[case::below_max(34, 55, 1, 100, 55, 55, 89)]
    #[case::reaching_max(55, 89, 1, 100, 89, 89, 100)]
    #[case::at_max(89, 100, 1, 100, 100, 100, 100)]
    #[case::stays_at_max(100, 100, 1, 100, 100, 100, 100)]
    #[case::base_2(0, 2, 2, 100, 2, 2, 2)]
    #[case::base_2_later(4, 6, 2, 100, 6, 6, 10)]
    fn test_next_interval(
        #[case] previous: u64,
        #[case] current: u64,
        #[case] config_base: u64,
        #[case] config_max: u64,
        #[case] expected_result: u64,
        #[case] expected_previous: u64,
        #[case] expected_current: u64,
    ) {
        let mut backoff = FibonacciBackoff {
            previous: secs(previous),
            current: secs(current),
            config_base: secs(config_base),
            config_max: secs(config_max),
        };

        assert_eq!(backoff.next_interval(), secs(expected_result));
        assert_eq!(backoff.previous, secs(expected_previous));
        assert_eq!(backoff.current, secs(expected_current));
    }

    #[test]
    fn test_sequence_and_reset() {
        let mut backoff = FibonacciBackoff::new(secs(1), secs(10));
        let intervals: Vec<_> = (0..8).map(|_| backoff.next_interval().as_secs()).collect();
        assert_eq!(intervals, vec![1, 1, 2, 3, 5, 8, 10, 10]);

        backoff.reset();
        assert_eq!(backoff.next_interval(), secs(1));
        assert_eq!(backoff.next_interval(), secs(1));
        assert_eq!(backoff.next_interval(), secs(2));
    }
}
