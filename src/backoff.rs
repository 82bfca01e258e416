//! Reconnect delay policy.

use std::time::Duration;

/// Delay doubles per attempt up to this attempt, then falls back to the
/// plateau value. The source protocol grows 3s, 6s, 12s, 24s, 48s and then
/// settles at 15s for every attempt after the fifth.
const GROWTH_LIMIT: u32 = 5;

/// Compute the reconnect delay for the given attempt number (1-based).
pub(crate) fn delay_for_attempt(attempt: u32, base: Duration, cap: Duration) -> Duration {
    if attempt == 0 {
        return base;
    }

    if attempt > GROWTH_LIMIT {
        cap
    } else {
        base * 2u32.pow(attempt - 1)
    }
}

/// Reconnect attempt counter.
///
/// Incremented on every scheduled reconnect, reset to zero only on a
/// successful connection open.
#[derive(Debug)]
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    attempt: u32,
}

impl Backoff {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            attempt: 0,
        }
    }

    /// Record another attempt and return the delay to wait before it.
    pub fn next_delay(&mut self) -> Duration {
        self.attempt += 1;
        delay_for_attempt(self.attempt, self.base, self.cap)
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_delay_sequence_grows_then_plateaus() {
        let base = Duration::from_millis(3000);
        let cap = Duration::from_millis(15000);

        let delays: Vec<u64> = (1..=7)
            .map(|attempt| delay_for_attempt(attempt, base, cap).as_millis() as u64)
            .collect();

        assert_eq!(delays, vec![3000, 6000, 12000, 24000, 48000, 15000, 15000]);
    }

    #[test]
    fn test_counter_resets_on_open() {
        let mut backoff = Backoff::new(Duration::from_millis(3000), Duration::from_millis(15000));

        assert_eq!(backoff.next_delay(), Duration::from_millis(3000));
        assert_eq!(backoff.next_delay(), Duration::from_millis(6000));
        assert_eq!(backoff.attempt(), 2);

        backoff.reset();

        assert_eq!(backoff.attempt(), 0);
        assert_eq!(backoff.next_delay(), Duration::from_millis(3000));
    }
}
