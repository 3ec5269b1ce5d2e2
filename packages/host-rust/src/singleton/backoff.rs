use std::time::Duration;

/// Growing retry delays: `initial`, then doubling, for at most `limit` steps.
#[derive(Debug, Clone)]
pub struct Backoff {
    retries: u32,
    limit: u32,
    multiplier: u32,
    current: Duration,
}

impl Backoff {
    /// Create a backoff yielding `limit` delays starting at `initial`.
    #[must_use]
    pub fn new(initial: Duration, limit: u32) -> Self {
        Self {
            retries: 0,
            limit,
            multiplier: 2,
            current: initial,
        }
    }
}

impl Iterator for Backoff {
    type Item = Duration;

    fn next(&mut self) -> Option<Self::Item> {
        if self.retries >= self.limit {
            return None;
        }
        self.retries += 1;
        let delay = self.current;
        self.current = self.current.saturating_mul(self.multiplier);
        Some(delay)
    }
}
