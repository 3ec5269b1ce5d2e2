//! In-memory [`Transport`] implementation.
//!
//! A single FIFO queue with peek-lock semantics: received messages move to a
//! locked set until settled or until their lock expires. Abandoned and
//! expired messages return to the back of the queue with their delivery count
//! preserved. Settled deliveries are kept for inspection. Suitable for
//! development and tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use conveyor_core::{
    LockToken, MessageProperties, ProcessingError, ReceivedMessage, Serializer, SerializerError,
    Transport, TransportError,
};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::Notify;
use tokio::time::Instant;
use uuid::Uuid;

// ---------------------------------------------------------------------------
// Public records
// ---------------------------------------------------------------------------

/// A message to enqueue.
#[derive(Debug, Clone, Default)]
pub struct OutgoingMessage {
    pub body: Bytes,
    pub content_type: Option<String>,
    pub properties: MessageProperties,
    /// Deliveries already made elsewhere; the first receive reports this + 1.
    pub prior_deliveries: u32,
}

impl OutgoingMessage {
    /// Create a message with `body` and no metadata.
    #[must_use]
    pub fn new(body: impl Into<Bytes>) -> Self {
        Self {
            body: body.into(),
            ..Self::default()
        }
    }

    /// Sets the content type label.
    #[must_use]
    pub fn content_type(mut self, content_type: impl Into<String>) -> Self {
        self.content_type = Some(content_type.into());
        self
    }

    /// Adds a transport property.
    #[must_use]
    pub fn property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key, value);
        self
    }

    /// Pretends the message was already delivered `count` times.
    #[must_use]
    pub fn prior_deliveries(mut self, count: u32) -> Self {
        self.prior_deliveries = count;
        self
    }
}

/// A settled delivery, as recorded for inspection.
#[derive(Debug, Clone)]
pub struct SettledMessage {
    pub message_id: String,
    pub body: Bytes,
    pub delivery_count: u32,
    /// Abandon fault or dead-letter reason.
    pub reason: Option<String>,
}

// ---------------------------------------------------------------------------
// InMemoryTransport
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct Stored {
    message_id: String,
    body: Bytes,
    content_type: Option<String>,
    properties: MessageProperties,
    delivery_count: u32,
}

impl Stored {
    fn settled(self, reason: Option<String>) -> SettledMessage {
        SettledMessage {
            message_id: self.message_id,
            body: self.body,
            delivery_count: self.delivery_count,
            reason,
        }
    }
}

#[derive(Debug)]
struct Locked {
    stored: Stored,
    expires_at: Instant,
}

#[derive(Debug, Default)]
struct QueueState {
    ready: VecDeque<Stored>,
    locked: HashMap<String, Locked>,
    completed: Vec<SettledMessage>,
    abandoned: Vec<SettledMessage>,
    dead_lettered: Vec<SettledMessage>,
    closed: bool,
}

impl QueueState {
    /// Returns deliveries whose lock has expired to the ready queue and
    /// reports the earliest remaining expiry.
    fn reclaim_expired(&mut self, now: Instant) -> Option<Instant> {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, locked)| locked.expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();
        for token in expired {
            if let Some(locked) = self.locked.remove(&token) {
                self.ready.push_back(locked.stored);
            }
        }
        self.locked.values().map(|locked| locked.expires_at).min()
    }
}

/// Process-local queue implementing [`Transport`].
pub struct InMemoryTransport {
    name: String,
    state: Mutex<QueueState>,
    arrivals: Notify,
    next_id: AtomicU64,
    failing_receives: AtomicU32,
    failing_settlements: AtomicBool,
}

impl InMemoryTransport {
    /// Create an empty queue called `name`.
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            state: Mutex::new(QueueState::default()),
            arrivals: Notify::new(),
            next_id: AtomicU64::new(1),
            failing_receives: AtomicU32::new(0),
            failing_settlements: AtomicBool::new(false),
        }
    }

    /// Enqueues a raw body with no content type. Returns the message id.
    pub fn send_bytes(&self, body: impl Into<Bytes>) -> String {
        self.send_message(OutgoingMessage::new(body))
    }

    /// Serializes `value` and enqueues it labelled with the serializer's
    /// content type.
    ///
    /// # Errors
    ///
    /// Returns the serializer's encode failure.
    pub fn send<T: Serialize, S: Serializer>(
        &self,
        serializer: &S,
        value: &T,
    ) -> Result<String, SerializerError> {
        let body = serializer.serialize(value)?;
        Ok(self.send_message(OutgoingMessage::new(body).content_type(serializer.content_type())))
    }

    /// Enqueues `message`. Returns the message id.
    pub fn send_message(&self, message: OutgoingMessage) -> String {
        let message_id = format!("{}-{}", self.name, self.next_id.fetch_add(1, Ordering::Relaxed));
        self.state.lock().ready.push_back(Stored {
            message_id: message_id.clone(),
            body: message.body,
            content_type: message.content_type,
            properties: message.properties,
            delivery_count: message.prior_deliveries,
        });
        self.arrivals.notify_waiters();
        message_id
    }

    /// Makes the next `count` receive calls fail with a backend error.
    pub fn fail_next_receives(&self, count: u32) {
        self.failing_receives.store(count, Ordering::SeqCst);
    }

    /// Makes every settlement call fail with a backend error while set.
    pub fn fail_settlements(&self, fail: bool) {
        self.failing_settlements.store(fail, Ordering::SeqCst);
    }

    /// Stops accepting receives; pending receivers wake with
    /// [`TransportError::Closed`].
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.arrivals.notify_waiters();
    }

    /// Messages waiting to be received, including expired deliveries.
    #[must_use]
    pub fn pending(&self) -> usize {
        let mut state = self.state.lock();
        state.reclaim_expired(Instant::now());
        state.ready.len()
    }

    /// Deliveries received, not yet settled, and still locked.
    #[must_use]
    pub fn in_flight(&self) -> usize {
        let mut state = self.state.lock();
        state.reclaim_expired(Instant::now());
        state.locked.len()
    }

    /// Completed deliveries, oldest first.
    #[must_use]
    pub fn completed(&self) -> Vec<SettledMessage> {
        self.state.lock().completed.clone()
    }

    /// Abandon calls, oldest first, with the fault that caused each.
    #[must_use]
    pub fn abandoned(&self) -> Vec<SettledMessage> {
        self.state.lock().abandoned.clone()
    }

    /// Dead-lettered deliveries, oldest first, with their reasons.
    #[must_use]
    pub fn dead_lettered(&self) -> Vec<SettledMessage> {
        self.state.lock().dead_lettered.clone()
    }

    /// Locks up to `max_messages` ready deliveries. Also returns the earliest
    /// lock expiry still outstanding, so an empty receive knows when to look
    /// again.
    fn take_batch(
        &self,
        max_messages: usize,
        lock_timeout: Duration,
    ) -> Result<(Vec<ReceivedMessage>, Option<Instant>), TransportError> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(TransportError::Closed);
        }
        let now = Instant::now();
        state.reclaim_expired(now);
        let count = max_messages.max(1).min(state.ready.len());
        let mut batch = Vec::with_capacity(count);
        for mut stored in state.ready.drain(..count).collect::<Vec<_>>() {
            stored.delivery_count += 1;
            let lock_token = LockToken::new(Uuid::new_v4().to_string());
            batch.push(ReceivedMessage {
                message_id: stored.message_id.clone(),
                body: stored.body.clone(),
                content_type: stored.content_type.clone(),
                delivery_count: stored.delivery_count,
                lock_token: lock_token.clone(),
                properties: stored.properties.clone(),
            });
            state.locked.insert(
                lock_token.as_str().to_owned(),
                Locked {
                    stored,
                    expires_at: now + lock_timeout,
                },
            );
        }
        let next_expiry = state.locked.values().map(|locked| locked.expires_at).min();
        Ok((batch, next_expiry))
    }

    fn check_settlement(&self) -> Result<(), TransportError> {
        if self.failing_settlements.load(Ordering::SeqCst) {
            return Err(TransportError::Backend(anyhow::anyhow!(
                "settlement rejected by {}",
                self.name
            )));
        }
        Ok(())
    }

    /// Releases a live lock. An expired lock is reclaimed first and reported
    /// as lost.
    fn unlock(state: &mut QueueState, lock_token: &LockToken) -> Result<Stored, TransportError> {
        state.reclaim_expired(Instant::now());
        state
            .locked
            .remove(lock_token.as_str())
            .map(|locked| locked.stored)
            .ok_or_else(|| TransportError::LockLost {
                token: lock_token.clone(),
            })
    }
}

impl std::fmt::Debug for InMemoryTransport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("InMemoryTransport")
            .field("name", &self.name)
            .field("pending", &state.ready.len())
            .field("in_flight", &state.locked.len())
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl Transport for InMemoryTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn receive(
        &self,
        max_messages: usize,
        max_wait: Duration,
        lock_timeout: Duration,
    ) -> Result<Vec<ReceivedMessage>, TransportError> {
        let deadline = Instant::now() + max_wait;
        loop {
            let failing = self.failing_receives.load(Ordering::SeqCst);
            if failing > 0 {
                self.failing_receives.store(failing - 1, Ordering::SeqCst);
                return Err(TransportError::Backend(anyhow::anyhow!(
                    "receive failed on {}",
                    self.name
                )));
            }

            // Register interest before checking so a send in between is seen.
            let arrival = self.arrivals.notified();
            let (batch, next_expiry) = self.take_batch(max_messages, lock_timeout)?;
            if !batch.is_empty() {
                return Ok(batch);
            }
            // Wake early when a lock expires; its message becomes receivable.
            let wake = next_expiry.map_or(deadline, |expiry| expiry.min(deadline));
            if tokio::time::timeout_at(wake, arrival).await.is_err() && Instant::now() >= deadline {
                return Ok(Vec::new());
            }
        }
    }

    async fn complete(&self, lock_token: &LockToken) -> Result<(), TransportError> {
        self.check_settlement()?;
        let mut state = self.state.lock();
        let stored = Self::unlock(&mut state, lock_token)?;
        state.completed.push(stored.settled(None));
        Ok(())
    }

    async fn abandon(
        &self,
        lock_token: &LockToken,
        reason: Option<&ProcessingError>,
    ) -> Result<(), TransportError> {
        self.check_settlement()?;
        {
            let mut state = self.state.lock();
            let stored = Self::unlock(&mut state, lock_token)?;
            state
                .abandoned
                .push(stored.clone().settled(reason.map(ToString::to_string)));
            state.ready.push_back(stored);
        }
        self.arrivals.notify_waiters();
        Ok(())
    }

    async fn dead_letter(&self, lock_token: &LockToken, reason: &str) -> Result<(), TransportError> {
        self.check_settlement()?;
        let mut state = self.state.lock();
        let stored = Self::unlock(&mut state, lock_token)?;
        state.dead_lettered.push(stored.settled(Some(reason.to_owned())));
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use conveyor_core::JsonSerializer;

    use super::*;

    const WAIT: Duration = Duration::from_millis(20);
    const LOCK: Duration = Duration::from_secs(30);

    #[tokio::test]
    async fn receive_returns_empty_batch_after_wait() {
        let transport = InMemoryTransport::new("orders");
        let batch = transport.receive(4, WAIT, LOCK).await.unwrap();
        assert!(batch.is_empty());
    }

    #[tokio::test]
    async fn receive_wakes_on_send() {
        let transport = Arc::new(InMemoryTransport::new("orders"));
        let receiver = {
            let transport = Arc::clone(&transport);
            tokio::spawn(async move { transport.receive(1, Duration::from_secs(5), LOCK).await })
        };
        tokio::time::sleep(Duration::from_millis(5)).await;
        transport.send_bytes(&b"late"[..]);

        let batch = receiver.await.unwrap().unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(&batch[0].body[..], b"late");
    }

    #[tokio::test]
    async fn abandon_redelivers_with_higher_count() {
        let transport = InMemoryTransport::new("orders");
        let id = transport.send_bytes(&b"x"[..]);

        let first = transport.receive(1, WAIT, LOCK).await.unwrap().remove(0);
        assert_eq!(first.delivery_count, 1);
        transport.abandon(&first.lock_token, None).await.unwrap();

        let second = transport.receive(1, WAIT, LOCK).await.unwrap().remove(0);
        assert_eq!(second.message_id, id);
        assert_eq!(second.delivery_count, 2);
        assert_ne!(second.lock_token, first.lock_token);
        assert_eq!(transport.abandoned().len(), 1);
    }

    #[tokio::test]
    async fn settling_twice_reports_lock_lost() {
        let transport = InMemoryTransport::new("orders");
        transport.send_bytes(&b"x"[..]);
        let message = transport.receive(1, WAIT, LOCK).await.unwrap().remove(0);

        transport.complete(&message.lock_token).await.unwrap();
        let err = transport.complete(&message.lock_token).await.unwrap_err();
        assert!(matches!(err, TransportError::LockLost { .. }));
    }

    #[tokio::test]
    async fn batch_respects_max_messages() {
        let transport = InMemoryTransport::new("orders");
        for i in 0..5u8 {
            transport.send_bytes(vec![i]);
        }
        let batch = transport.receive(3, WAIT, LOCK).await.unwrap();
        assert_eq!(batch.len(), 3);
        assert_eq!(transport.pending(), 2);
        assert_eq!(transport.in_flight(), 3);
    }

    #[tokio::test]
    async fn send_labels_content_type_and_prior_deliveries() {
        let transport = InMemoryTransport::new("orders");
        transport.send(&JsonSerializer, &vec![1, 2, 3]).unwrap();
        transport.send_message(OutgoingMessage::new(&b"{}"[..]).prior_deliveries(4));

        let batch = transport.receive(2, WAIT, LOCK).await.unwrap();
        assert_eq!(batch[0].content_type.as_deref(), Some("application/json"));
        assert_eq!(batch[1].delivery_count, 5);
    }

    #[tokio::test]
    async fn injected_faults_surface_as_backend_errors() {
        let transport = InMemoryTransport::new("orders");
        transport.fail_next_receives(1);
        assert!(matches!(
            transport.receive(1, WAIT, LOCK).await,
            Err(TransportError::Backend(_))
        ));
        assert!(transport.receive(1, WAIT, LOCK).await.unwrap().is_empty());

        transport.send_bytes(&b"x"[..]);
        let message = transport.receive(1, WAIT, LOCK).await.unwrap().remove(0);
        transport.fail_settlements(true);
        assert!(transport.dead_letter(&message.lock_token, "bad").await.is_err());
        assert_eq!(transport.in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lock_returns_message_with_count_preserved() {
        let transport = InMemoryTransport::new("orders");
        let id = transport.send_bytes(&b"x"[..]);
        let lock = Duration::from_millis(50);

        let first = transport.receive(1, WAIT, lock).await.unwrap().remove(0);
        assert_eq!(first.delivery_count, 1);
        transport.fail_settlements(true);
        assert!(transport.abandon(&first.lock_token, None).await.is_err());
        transport.fail_settlements(false);
        assert_eq!(transport.in_flight(), 1);

        tokio::time::sleep(lock).await;
        assert_eq!(transport.in_flight(), 0);
        assert_eq!(transport.pending(), 1);

        let second = transport.receive(1, WAIT, lock).await.unwrap().remove(0);
        assert_eq!(second.message_id, id);
        assert_eq!(second.delivery_count, 2);
        assert!(matches!(
            transport.complete(&first.lock_token).await,
            Err(TransportError::LockLost { .. })
        ));
        transport.complete(&second.lock_token).await.unwrap();
        assert_eq!(transport.completed()[0].delivery_count, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn waiting_receive_wakes_when_a_lock_expires() {
        let transport = InMemoryTransport::new("orders");
        transport.send_bytes(&b"x"[..]);
        let lock = Duration::from_millis(50);
        let first = transport.receive(1, WAIT, lock).await.unwrap().remove(0);

        let started = Instant::now();
        let batch = transport
            .receive(1, Duration::from_secs(10), lock)
            .await
            .unwrap();
        assert_eq!(batch.len(), 1);
        assert_eq!(batch[0].message_id, first.message_id);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn closed_transport_rejects_receive() {
        let transport = InMemoryTransport::new("orders");
        transport.close();
        assert!(matches!(
            transport.receive(1, WAIT, LOCK).await,
            Err(TransportError::Closed)
        ));
    }
}
