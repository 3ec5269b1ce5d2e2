//! The processing capability implemented by application code.

use async_trait::async_trait;

use crate::context::MessageContext;

/// Handles messages of type `T`.
///
/// A fresh instance is resolved from the [`ProcessorRegistry`](crate::ProcessorRegistry)
/// for every message. Returning `Ok(())` completes the message unless the
/// processor already settled it through the context; returning `Err`
/// abandons it for redelivery. Delivery is at-least-once, so processing
/// should be idempotent.
#[async_trait]
pub trait Processor<T: Send + Sync + 'static>: Send + Sync {
    async fn process(&self, ctx: &mut MessageContext<T>) -> anyhow::Result<()>;
}
