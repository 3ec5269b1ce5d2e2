//! Tracing and metrics for each processing attempt.
//!
//! Opens a span per attempt carrying the receiver, message id, delivery count
//! and correlation id, then records duration and outcome on completion. The
//! correlation id property is filled from the message id when absent so that
//! downstream sends can propagate it.

use std::task::{Context, Poll};
use std::time::Instant;

use conveyor_core::{MessageProperties, ProcessingError};
use tower::{Layer, Service, ServiceExt};
use tracing::{info_span, Instrument};

use super::StageFuture;
use crate::context::MessageContext;

// ---------------------------------------------------------------------------
// InstrumentLayer
// ---------------------------------------------------------------------------

/// Layer that wraps each attempt in a `message` span and records metrics.
#[derive(Debug, Clone, Copy, Default)]
pub struct InstrumentLayer;

impl<S> Layer<S> for InstrumentLayer {
    type Service = InstrumentService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        InstrumentService { inner }
    }
}

// ---------------------------------------------------------------------------
// InstrumentService
// ---------------------------------------------------------------------------

/// Records duration and outcome of the inner chain in a tracing span and the
/// `conveyor_messages_total` counter.
#[derive(Debug, Clone)]
pub struct InstrumentService<S> {
    inner: S,
}

impl<S, T> Service<MessageContext<T>> for InstrumentService<S>
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

    fn call(&mut self, mut ctx: MessageContext<T>) -> Self::Future {
        if !ctx.properties().contains_key(MessageProperties::CORRELATION_ID) {
            let message_id = ctx.message_id().to_owned();
            ctx.properties_mut()
                .insert(MessageProperties::CORRELATION_ID, message_id);
        }

        let receiver = ctx.receiver().to_owned();
        let span = info_span!(
            "message",
            receiver = %receiver,
            message_id = ctx.message_id(),
            delivery_count = ctx.delivery_count(),
            correlation_id = ctx
                .properties()
                .get(MessageProperties::CORRELATION_ID)
                .unwrap_or_default(),
            duration_ms = tracing::field::Empty,
            outcome = tracing::field::Empty,
        );

        let settlement = ctx.settlement();
        let inner = self.inner.clone();

        Box::pin(
            async move {
                let start = Instant::now();
                let result = inner.oneshot(ctx).await;
                let elapsed = start.elapsed();

                let outcome = match (&result, settlement.disposition()) {
                    (Err(_), _) => "failed",
                    (Ok(()), Some(disposition)) => disposition.as_str(),
                    (Ok(()), None) => "unsettled",
                };

                #[allow(clippy::cast_possible_truncation)]
                let duration_ms = elapsed.as_millis() as u64;
                tracing::Span::current().record("duration_ms", duration_ms);
                tracing::Span::current().record("outcome", outcome);
                tracing::debug!(duration_ms, outcome, "message processed");

                metrics::counter!(
                    "conveyor_messages_total",
                    "receiver" => receiver.clone(),
                    "outcome" => outcome
                )
                .increment(1);
                metrics::histogram!(
                    "conveyor_message_duration_seconds",
                    "receiver" => receiver
                )
                .record(elapsed.as_secs_f64());

                result
            }
            .instrument(span),
        )
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::future::Future;
    use std::pin::Pin;
    use std::sync::Arc;

    use parking_lot::Mutex;

    use super::*;
    use crate::test_support::delivered;

    /// Captures the correlation id the inner chain sees, then completes.
    #[derive(Clone, Default)]
    struct Capture {
        seen: Arc<Mutex<Option<String>>>,
    }

    impl Service<MessageContext<()>> for Capture {
        type Response = ();
        type Error = ProcessingError;
        type Future = Pin<Box<dyn Future<Output = Result<(), ProcessingError>> + Send>>;

        fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
            Poll::Ready(Ok(()))
        }

        fn call(&mut self, ctx: MessageContext<()>) -> Self::Future {
            *self.seen.lock() = ctx
                .properties()
                .get(MessageProperties::CORRELATION_ID)
                .map(str::to_owned);
            Box::pin(async move {
                ctx.complete().await?;
                Ok(())
            })
        }
    }

    #[tokio::test]
    async fn fills_missing_correlation_id_from_message_id() {
        let capture = Capture::default();
        let svc = InstrumentLayer.layer(capture.clone());

        let (ctx, transport) = delivered((), 1, 5).await;
        let message_id = ctx.message_id().to_owned();
        svc.oneshot(ctx).await.unwrap();

        assert_eq!(capture.seen.lock().as_deref(), Some(message_id.as_str()));
        assert_eq!(transport.completed().len(), 1);
    }

    #[tokio::test]
    async fn keeps_existing_correlation_id() {
        let capture = Capture::default();
        let svc = InstrumentLayer.layer(capture.clone());

        let (mut ctx, _transport) = delivered((), 1, 5).await;
        ctx.properties_mut()
            .insert(MessageProperties::CORRELATION_ID, "order-42".to_owned());
        svc.oneshot(ctx).await.unwrap();

        assert_eq!(capture.seen.lock().as_deref(), Some("order-42"));
    }
}
