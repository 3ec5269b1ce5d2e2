//! Poison-message quarantine.
//!
//! A delivery whose count exceeds the context's dead-letter limit is moved to
//! quarantine without reaching the rest of the chain.

use std::task::{Context, Poll};

use conveyor_core::ProcessingError;
use tower::{Layer, Service, ServiceExt};
use tracing::warn;

use super::StageFuture;
use crate::context::MessageContext;

// ---------------------------------------------------------------------------
// DeadLetterLayer
// ---------------------------------------------------------------------------

/// Layer that quarantines deliveries past their delivery limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct DeadLetterLayer;

impl<S> Layer<S> for DeadLetterLayer {
    type Service = DeadLetterService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        DeadLetterService { inner }
    }
}

// ---------------------------------------------------------------------------
// DeadLetterService
// ---------------------------------------------------------------------------

/// Service produced by [`DeadLetterLayer`].
#[derive(Debug, Clone)]
pub struct DeadLetterService<S> {
    inner: S,
}

impl<S, T> Service<MessageContext<T>> for DeadLetterService<S>
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
        let inner = self.inner.clone();
        Box::pin(async move {
            let delivery_count = ctx.delivery_count();
            let limit = ctx.dead_letter_limit();
            if delivery_count <= limit {
                return inner.oneshot(ctx).await;
            }

            let reason = format!("delivery count {delivery_count} exceeded limit {limit}");
            warn!(
                receiver = ctx.receiver(),
                message_id = ctx.message_id(),
                delivery_count,
                limit,
                "dead-lettering message"
            );
            metrics::counter!(
                "conveyor_dead_lettered_total",
                "receiver" => ctx.receiver().to_owned()
            )
            .increment(1);
            let settlement = ctx.settlement();
            drop(ctx);
            settlement.dead_letter(&reason).await?;
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
