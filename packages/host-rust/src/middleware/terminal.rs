//! Terminal invocation: resolve the registered processor and run it.

use std::marker::PhantomData;
use std::sync::Arc;
use std::task::{Context, Poll};

use conveyor_core::ProcessingError;
use tower::Service;

use super::StageFuture;
use crate::context::MessageContext;
use crate::registry::ProcessorRegistry;

/// Innermost service of every pipeline.
///
/// Resolves a processor for `T` from the message's own scope, invokes it, and
/// completes the message on success unless the processor settled it already.
pub struct ProcessorInvoker<T> {
    registry: Arc<ProcessorRegistry>,
    _message: PhantomData<fn(T)>,
}

impl<T> ProcessorInvoker<T> {
    /// Create an invoker resolving processors from `registry`.
    #[must_use]
    pub fn new(registry: Arc<ProcessorRegistry>) -> Self {
        Self {
            registry,
            _message: PhantomData,
        }
    }
}

impl<T> Clone for ProcessorInvoker<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.registry))
    }
}

impl<T> Service<MessageContext<T>> for ProcessorInvoker<T>
where
    T: Send + Sync + 'static,
{
    type Response = ();
    type Error = ProcessingError;
    type Future = StageFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, mut ctx: MessageContext<T>) -> Self::Future {
        let registry = Arc::clone(&self.registry);
        Box::pin(async move {
            let processor = registry.resolve::<T>(ctx.scope())?;
            processor
                .process(&mut ctx)
                .await
                .map_err(ProcessingError::Processor)?;
            if !ctx.is_settled() {
                ctx.complete().await?;
            }
            Ok(())
        })
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
