use std::time::Duration;

/// Yields backoff durations that grow geometrically up to a ceiling, forever.
#[derive(Clone, Copy, Debug)]
pub struct ExpDecay {
    start: Duration,
    current: Duration,
    multiplier: u32,
    max: Duration,
}

impl ExpDecay {
    pub const fn constant(duration: Duration) -> Self {
        Self {
            start: duration,
            current: duration,
            multiplier: 1,
            max: duration,
        }
    }

    /// Doubles the wait on every step, capped at `max`.
    pub const fn quadratic(starting: Duration, max: Duration) -> Self {
        Self {
            start: starting,
            current: starting,
            multiplier: 2,
            max,
        }
    }

    pub fn next_duration(&mut self) -> Duration {
        let duration = self.current;
        self.current = std::cmp::min(self.max, self.current.saturating_mul(self.multiplier));
        duration
    }

    /// Starts the decay over, e.g. once the awaited resource became available again.
    pub fn reset(&mut self) {
        self.current = self.start;
    }
}

impl Iterator for ExpDecay {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        Some(self.next_duration())
    }
}
