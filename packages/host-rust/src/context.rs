//! Per-message state handler passed through the pipeline.
//!
//! [`MessageContext`] carries the decoded payload, transport metadata, the
//! property bag, a per-message dependency scope and the cancellation signal.
//! Its three terminal operations (`complete`, `abandon`, `dead_letter`) share
//! one [`Settlement`] record so that exactly one of them takes effect per
//! attempt; later calls fail with [`SettlementError::AlreadySettled`].

use std::sync::Arc;

use bytes::Bytes;
use conveyor_core::{
    Disposition, LockToken, MessageProperties, ProcessingError, ReceivedMessage,
    SettlementError, Transport,
};
use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::registry::ServiceScope;

// ---------------------------------------------------------------------------
// Settlement
// ---------------------------------------------------------------------------

/// Shared settlement record for one delivery.
///
/// Held by the context and, independently, by stages that must be able to
/// settle the message after the context has been moved into the inner chain.
pub struct Settlement {
    transport: Arc<dyn Transport>,
    lock_token: LockToken,
    disposition: Mutex<Option<Disposition>>,
}

impl Settlement {
    /// Create an unsettled record for the delivery locked by `lock_token`.
    #[must_use]
    pub fn new(transport: Arc<dyn Transport>, lock_token: LockToken) -> Self {
        Self {
            transport,
            lock_token,
            disposition: Mutex::new(None),
        }
    }

    /// Lock token of the delivery being settled.
    #[must_use]
    pub fn lock_token(&self) -> &LockToken {
        &self.lock_token
    }

    /// Disposition claimed so far, if any.
    #[must_use]
    pub fn disposition(&self) -> Option<Disposition> {
        *self.disposition.lock()
    }

    /// Returns `true` once a terminal call has claimed the delivery.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.disposition().is_some()
    }

    /// Claims the attempt for `disposition`. The claim sticks even if the
    /// transport call that follows fails; the transport's lock timeout then
    /// decides the message's fate.
    fn claim(&self, disposition: Disposition) -> Result<(), SettlementError> {
        let mut slot = self.disposition.lock();
        if let Some(previous) = *slot {
            return Err(SettlementError::AlreadySettled {
                previous,
                attempted: disposition,
            });
        }
        *slot = Some(disposition);
        Ok(())
    }

    /// Acknowledges the delivery.
    ///
    /// # Errors
    ///
    /// [`SettlementError::AlreadySettled`] on a second terminal call, or the
    /// transport's failure.
    pub async fn complete(&self) -> Result<(), SettlementError> {
        self.claim(Disposition::Completed)?;
        self.transport.complete(&self.lock_token).await?;
        Ok(())
    }

    /// Returns the delivery to its source, carrying the causing fault.
    ///
    /// # Errors
    ///
    /// [`SettlementError::AlreadySettled`] on a second terminal call, or the
    /// transport's failure.
    pub async fn abandon(&self, reason: Option<&ProcessingError>) -> Result<(), SettlementError> {
        self.claim(Disposition::Abandoned)?;
        self.transport.abandon(&self.lock_token, reason).await?;
        Ok(())
    }

    /// Quarantines the delivery.
    ///
    /// # Errors
    ///
    /// [`SettlementError::AlreadySettled`] on a second terminal call, or the
    /// transport's failure.
    pub async fn dead_letter(&self, reason: &str) -> Result<(), SettlementError> {
        self.claim(Disposition::DeadLettered)?;
        self.transport.dead_letter(&self.lock_token, reason).await?;
        Ok(())
    }
}

impl std::fmt::Debug for Settlement {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Settlement")
            .field("transport", &self.transport.name())
            .field("lock_token", &self.lock_token)
            .field("disposition", &self.disposition())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// MessageContext
// ---------------------------------------------------------------------------

/// The message state handler for one processing attempt.
pub struct MessageContext<T> {
    receiver: Arc<str>,
    message_id: String,
    payload: T,
    body: Bytes,
    delivery_count: u32,
    dead_letter_limit: u32,
    properties: MessageProperties,
    scope: ServiceScope,
    cancel: CancellationToken,
    settlement: Arc<Settlement>,
}

impl<T> MessageContext<T> {
    /// Builds the context for a decoded delivery.
    #[must_use]
    pub fn new(
        receiver: Arc<str>,
        message: ReceivedMessage,
        payload: T,
        dead_letter_limit: u32,
        scope: ServiceScope,
        cancel: CancellationToken,
        transport: Arc<dyn Transport>,
    ) -> Self {
        let settlement = Arc::new(Settlement::new(transport, message.lock_token));
        Self {
            receiver,
            message_id: message.message_id,
            payload,
            body: message.body,
            delivery_count: message.delivery_count,
            dead_letter_limit,
            properties: message.properties,
            scope,
            cancel,
            settlement,
        }
    }

    /// Name of the receiver processing this message.
    #[must_use]
    pub fn receiver(&self) -> &str {
        &self.receiver
    }

    /// Transport-assigned message id.
    #[must_use]
    pub fn message_id(&self) -> &str {
        &self.message_id
    }

    /// The decoded payload.
    #[must_use]
    pub fn payload(&self) -> &T {
        &self.payload
    }

    /// Raw body as received, kept for fault diagnostics.
    #[must_use]
    pub fn body(&self) -> &Bytes {
        &self.body
    }

    /// Delivery count reported by the transport, starting at 1.
    #[must_use]
    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    /// Deliveries allowed before the message is dead-lettered.
    #[must_use]
    pub fn dead_letter_limit(&self) -> u32 {
        self.dead_letter_limit
    }

    /// Transport properties of the message.
    #[must_use]
    pub fn properties(&self) -> &MessageProperties {
        &self.properties
    }

    /// Mutable property bag, e.g. for trace propagation.
    pub fn properties_mut(&mut self) -> &mut MessageProperties {
        &mut self.properties
    }

    /// Per-message dependency resolution scope.
    #[must_use]
    pub fn scope(&self) -> &ServiceScope {
        &self.scope
    }

    /// Cancellation signal threaded from host shutdown.
    #[must_use]
    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancel
    }

    /// Shared settlement record, for stages that settle after handing the
    /// context to the inner chain.
    #[must_use]
    pub fn settlement(&self) -> Arc<Settlement> {
        Arc::clone(&self.settlement)
    }

    /// Returns `true` once the message was completed, abandoned or dead-lettered.
    #[must_use]
    pub fn is_settled(&self) -> bool {
        self.settlement.is_settled()
    }

    /// Acknowledges the message.
    ///
    /// # Errors
    ///
    /// See [`Settlement::complete`].
    pub async fn complete(&self) -> Result<(), SettlementError> {
        self.settlement.complete().await
    }

    /// Returns the message to its source for redelivery.
    ///
    /// # Errors
    ///
    /// See [`Settlement::abandon`].
    pub async fn abandon(&self, reason: Option<&ProcessingError>) -> Result<(), SettlementError> {
        self.settlement.abandon(reason).await
    }

    /// Moves the message to quarantine.
    ///
    /// # Errors
    ///
    /// See [`Settlement::dead_letter`].
    pub async fn dead_letter(&self, reason: &str) -> Result<(), SettlementError> {
        self.settlement.dead_letter(reason).await
    }

    /// Short printable rendering of the raw body for log lines.
    #[must_use]
    pub fn body_preview(&self) -> String {
        body_preview(&self.body)
    }
}

/// Lossy UTF-8 rendering of `body`, cut at 256 characters.
#[must_use]
pub fn body_preview(body: &[u8]) -> String {
    const MAX: usize = 256;
    let text = String::from_utf8_lossy(body);
    if text.chars().count() <= MAX {
        text.into_owned()
    } else {
        let mut preview: String = text.chars().take(MAX).collect();
        preview.push('…');
        preview
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for MessageContext<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MessageContext")
            .field("receiver", &self.receiver)
            .field("message_id", &self.message_id)
            .field("payload", &self.payload)
            .field("delivery_count", &self.delivery_count)
            .field("dead_letter_limit", &self.dead_letter_limit)
            .field("properties", &self.properties)
            .field("settlement", &self.settlement)
            .finish_non_exhaustive()
    }
}
