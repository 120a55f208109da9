//! # Fibonacci Backoff
//!
//! Progressive retry intervals for failing reconciliations.
//!
//! The sequence grows as 1, 1, 2, 3, 5, 8... times the minimum and is capped at the maximum.
//! Each resource keeps its own [`BackoffState`] so one failing resource never slows down
//! another.

/// Fibonacci backoff measured in minutes
#[derive(Debug, Clone)]
pub struct FibonacciBackoff {
    min_minutes: u64,
    max_minutes: u64,
    previous: u64,
    current: u64,
}

impl FibonacciBackoff {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        let min_minutes = min_minutes.max(1);
        Self {
            min_minutes,
            max_minutes: max_minutes.max(min_minutes),
            previous: 0,
            current: 1,
        }
    }

    /// Next interval in seconds; advances the sequence
    pub fn next_backoff_seconds(&mut self) -> u64 {
        let minutes = (self.current.saturating_mul(self.min_minutes)).min(self.max_minutes);
        let next = self.previous.saturating_add(self.current);
        self.previous = self.current;
        self.current = next;
        minutes * 60
    }

    pub fn reset(&mut self) {
        self.previous = 0;
        self.current = 1;
    }
}

/// Per-resource error tracking
#[derive(Debug, Clone)]
pub struct BackoffState {
    pub backoff: FibonacciBackoff,
    pub error_count: u32,
}

impl BackoffState {
    pub fn new(min_minutes: u64, max_minutes: u64) -> Self {
        Self {
            backoff: FibonacciBackoff::new(min_minutes, max_minutes),
            error_count: 0,
        }
    }

    pub fn increment_error(&mut self) {
        self.error_count = self.error_count.saturating_add(1);
    }

    pub fn reset(&mut self) {
        self.backoff.reset();
        self.error_count = 0;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sequence_is_fibonacci_and_capped() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        let minutes: Vec<u64> = (0..8).map(|_| backoff.next_backoff_seconds() / 60).collect();
        assert_eq!(minutes, vec![1, 1, 2, 3, 5, 8, 10, 10]);
    }

    #[test]
    fn test_reset_restarts_sequence() {
        let mut backoff = FibonacciBackoff::new(1, 10);
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();
        backoff.next_backoff_seconds();
        backoff.reset();
        assert_eq!(backoff.next_backoff_seconds(), 60);
    }
}
