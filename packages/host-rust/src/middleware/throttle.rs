//! Concurrency throttle for message processing.
//!
//! Each attempt waits for a slot on the shared [`ConcurrencyGate`] before the
//! inner chain runs and releases it when the chain finishes, fails, panics or
//! is dropped. Waiters are served in arrival order.

use std::sync::Arc;
use std::task::{Context, Poll};

use conveyor_core::ProcessingError;
use tower::{Layer, Service, ServiceExt};

use super::StageFuture;
use crate::context::MessageContext;
use crate::gate::{ConcurrencyGate, GateError};

// ---------------------------------------------------------------------------
// ThrottleLayer
// ---------------------------------------------------------------------------

/// Tower layer that bounds concurrent attempts through a [`ConcurrencyGate`].
///
/// Unlike load shedding, excess attempts queue rather than fail. A waiter
/// whose message is cancelled leaves the queue with
/// [`ProcessingError::Cancelled`].
#[derive(Debug, Clone)]
pub struct ThrottleLayer {
    gate: Arc<ConcurrencyGate>,
}

impl ThrottleLayer {
    /// Create a new `ThrottleLayer` admitting work through `gate`.
    #[must_use]
    pub fn new(gate: Arc<ConcurrencyGate>) -> Self {
        Self { gate }
    }

    /// Convenience constructor owning a fresh gate of `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self::new(Arc::new(ConcurrencyGate::new(capacity)))
    }

    /// The gate shared by every service this layer produces.
    #[must_use]
    pub fn gate(&self) -> &Arc<ConcurrencyGate> {
        &self.gate
    }
}

impl<S> Layer<S> for ThrottleLayer {
    type Service = ThrottleService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ThrottleService {
            inner,
            gate: Arc::clone(&self.gate),
        }
    }
}

// ---------------------------------------------------------------------------
// ThrottleService
// ---------------------------------------------------------------------------

/// Service produced by [`ThrottleLayer`].
#[derive(Debug, Clone)]
pub struct ThrottleService<S> {
    inner: S,
    gate: Arc<ConcurrencyGate>,
}

impl<S, T> Service<MessageContext<T>> for ThrottleService<S>
where
    S: Service<MessageContext<T>, Response = (), Error = ProcessingError> + Clone + Send + 'static,
    S::Future: Send + 'static,
    T: Send + 'static,
{
    type Response = ();
    type Error = ProcessingError;
    type Future = StageFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, ctx: MessageContext<T>) -> Self::Future {
        let gate = Arc::clone(&self.gate);
        let inner = self.inner.clone();
        let cancel = ctx.cancellation().clone();
        Box::pin(async move {
            let _permit = gate
                .acquire(&cancel)
                .await
                .map_err(|err| match err {
                    GateError::Cancelled => ProcessingError::Cancelled,
                    GateError::Closed => ProcessingError::GateClosed,
                })?;
            inner.oneshot(ctx).await
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
