//! Transport adapter boundary.
//!
//! Concrete queue/topic backends implement [`Transport`]; the host only ever
//! talks to this trait.

use std::time::Duration;

use async_trait::async_trait;

use crate::error::ProcessingError;
use crate::message::{LockToken, ReceivedMessage};

/// Errors surfaced by a transport adapter.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The lock on the delivery expired or was taken over; the message will be
    /// redelivered by the transport regardless of what the caller does.
    #[error("lock {token} is no longer held")]
    LockLost { token: LockToken },
    #[error("transport is closed")]
    Closed,
    #[error("transport backend failure: {0:#}")]
    Backend(#[source] anyhow::Error),
}

/// A source of messages plus the settlement operations for its deliveries.
///
/// Implementations must report a delivery count that never decreases across
/// redeliveries of the same logical message.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    /// Human-readable name of the source (queue or subscription).
    fn name(&self) -> &str;

    /// Receives up to `max_messages` deliveries, waiting at most `max_wait`
    /// for the first one. An empty batch is not an error.
    ///
    /// Each delivery stays locked for `lock_timeout`. A delivery that is not
    /// settled before its lock expires returns to the source and is
    /// redelivered with a higher delivery count; settling it afterwards
    /// fails with [`TransportError::LockLost`].
    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
        lock_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, TransportError>;

    /// Acknowledges a delivery; the message is removed from the source.
    async fn complete(&self, lock_token: &LockToken) -> Result<(), TransportError>;

    /// Returns a delivery to the source for redelivery, optionally carrying
    /// the fault that caused it.
    async fn abandon(
        &self,
        lock_token: &LockToken,
        reason: Option<&ProcessingError>,
    ) -> Result<(), TransportError>;

    /// Moves a delivery to the quarantine (dead-letter) area.
    async fn dead_letter(&self, lock_token: &LockToken, reason: &str)
        -> Result<(), TransportError>;
}
