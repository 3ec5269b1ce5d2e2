//! Per-processor processing settings.

use std::time::Duration;

/// Per-processor configuration, immutable once a channel receiver starts.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingSettings {
    /// Maximum number of messages processed concurrently by one receiver.
    pub max_concurrent_calls: usize,
    /// Number of messages a receiver may hold beyond `max_concurrent_calls`.
    pub prefetch_count: usize,
    /// Lock (visibility) timeout passed to [`Transport::receive`](crate::Transport::receive).
    /// An unsettled delivery becomes visible again once it elapses.
    pub lock_timeout: Duration,
    /// Deliveries allowed before a message is dead-lettered. A message whose
    /// delivery count is strictly greater than this limit is quarantined.
    pub dead_letter_delivery_limit: u32,
}

impl Default for ProcessingSettings {
    fn default() -> Self {
        Self {
            max_concurrent_calls: 10,
            prefetch_count: 0,
            lock_timeout: Duration::from_secs(60),
            dead_letter_delivery_limit: 10,
        }
    }
}

/// Reasons a [`ProcessingSettings`] value is rejected.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum SettingsError {
    #[error("max_concurrent_calls must be at least 1")]
    ZeroConcurrency,
    #[error("dead_letter_delivery_limit must be at least 1")]
    ZeroDeliveryLimit,
    #[error("lock_timeout must be non-zero")]
    ZeroLockTimeout,
}

impl ProcessingSettings {
    /// Checks the settings for values that would stall or misbehave a receiver.
    ///
    /// # Errors
    ///
    /// Returns the first invalid field found.
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.max_concurrent_calls == 0 {
            return Err(SettingsError::ZeroConcurrency);
        }
        if self.dead_letter_delivery_limit == 0 {
            return Err(SettingsError::ZeroDeliveryLimit);
        }
        if self.lock_timeout.is_zero() {
            return Err(SettingsError::ZeroLockTimeout);
        }
        Ok(())
    }

    /// Returns `true` if a delivery with `delivery_count` must be dead-lettered.
    #[must_use]
    pub fn exceeds_delivery_limit(&self, delivery_count: u32) -> bool {
        delivery_count > self.dead_letter_delivery_limit
    }

    /// Settings used for a receiver running under singleton coordination.
    ///
    /// Concurrency is forced to one in-flight message with no prefetch so that
    /// losing the lease and stopping the receiver never strands buffered work.
    #[must_use]
    pub fn for_singleton(&self) -> Self {
        Self {
            max_concurrent_calls: 1,
            prefetch_count: 0,
            ..self.clone()
        }
    }

    /// Upper bound on attempts a receiver keeps in flight at once.
    #[must_use]
    pub fn in_flight_capacity(&self) -> usize {
        self.max_concurrent_calls + self.prefetch_count
    }
}
