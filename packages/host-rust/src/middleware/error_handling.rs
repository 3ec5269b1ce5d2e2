//! Outermost fault boundary of the pipeline.
//!
//! Any error or panic raised by the inner chain is logged with the message
//! body preview and the message is abandoned with the fault attached. A chain
//! that returns without settling is abandoned too. Nothing escapes this stage,
//! so a faulting message never stops the receive loop.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::task::{Context, Poll};

use conveyor_core::{ProcessingError, SettlementError};
use futures_util::FutureExt;
use tower::{Layer, Service, ServiceExt};
use tracing::{debug, error, warn};

use super::StageFuture;
use crate::context::{body_preview, MessageContext};

// ---------------------------------------------------------------------------
// ErrorHandlingLayer
// ---------------------------------------------------------------------------

/// Outermost layer: turns every failure into an abandon.
#[derive(Debug, Clone, Copy, Default)]
pub struct ErrorHandlingLayer;

impl<S> Layer<S> for ErrorHandlingLayer {
    type Service = ErrorHandlingService<S>;

    fn layer(&self, inner: S) -> Self::Service {
        ErrorHandlingService { inner }
    }
}

// ---------------------------------------------------------------------------
// ErrorHandlingService
// ---------------------------------------------------------------------------

/// Service produced by [`ErrorHandlingLayer`].
#[derive(Debug, Clone)]
pub struct ErrorHandlingService<S> {
    inner: S,
}

impl<S, T> Service<MessageContext<T>> for ErrorHandlingService<S>
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
        let settlement = ctx.settlement();
        let receiver = ctx.receiver().to_owned();
        let message_id = ctx.message_id().to_owned();
        let body = ctx.body().clone();

        Box::pin(async move {
            let fault = match AssertUnwindSafe(inner.oneshot(ctx)).catch_unwind().await {
                Ok(Ok(())) if settlement.is_settled() => return Ok(()),
                Ok(Ok(())) => ProcessingError::Unsettled,
                Ok(Err(err)) => err,
                Err(panic) => ProcessingError::Panicked(panic_message(panic.as_ref())),
            };

            match &fault {
                ProcessingError::Cancelled | ProcessingError::GateClosed => debug!(
                    receiver = %receiver,
                    message_id = %message_id,
                    reason = %fault,
                    "message not processed; abandoning"
                ),
                _ => error!(
                    receiver = %receiver,
                    message_id = %message_id,
                    error = %fault,
                    body = %body_preview(&body),
                    "message processing failed; abandoning"
                ),
            }

            match settlement.abandon(Some(&fault)).await {
                Ok(()) => {}
                Err(SettlementError::AlreadySettled { previous, .. }) => warn!(
                    receiver = %receiver,
                    message_id = %message_id,
                    %previous,
                    "fault raised after message was settled"
                ),
                Err(err) => error!(
                    receiver = %receiver,
                    message_id = %message_id,
                    error = %err,
                    "failed to abandon message; it returns once its lock expires"
                ),
            }
            Ok(())
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_owned()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_owned()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
