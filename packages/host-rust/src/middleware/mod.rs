//! Tower middleware stages for the message pipeline.
//!
//! - [`error_handling`]: Outermost stage; abandons on any fault
//! - [`instrument`]: Tracing span, outcome counters and correlation id
//! - [`dead_letter`]: Quarantines deliveries past the delivery limit
//! - [`throttle`]: Concurrency gate around the inner chain
//! - [`terminal`]: Resolves and invokes the registered processor
//! - [`pipeline`]: Composes stages into a single service

pub mod dead_letter;
pub mod error_handling;
pub mod instrument;
pub mod pipeline;
pub mod terminal;
pub mod throttle;

use std::future::Future;
use std::pin::Pin;

use conveyor_core::ProcessingError;
use tower::util::BoxCloneService;
use tower::{Layer, Service};

use crate::context::MessageContext;

pub use dead_letter::DeadLetterLayer;
pub use error_handling::ErrorHandlingLayer;
pub use instrument::InstrumentLayer;
pub use pipeline::{build_message_pipeline, PipelineBuilder};
pub use terminal::ProcessorInvoker;
pub use throttle::ThrottleLayer;

/// Future returned by every stage.
pub type StageFuture = Pin<Box<dyn Future<Output = Result<(), ProcessingError>> + Send>>;

/// Type-erased "rest of the chain" handed to each stage.
pub type MessageService<T> = BoxCloneService<MessageContext<T>, (), ProcessingError>;

// ---------------------------------------------------------------------------
// Stage
// ---------------------------------------------------------------------------

/// One pipeline stage: wraps the rest of the chain.
///
/// Any tower [`Layer`] whose service handles `MessageContext<T>` is a stage.
/// A stage may observe or decorate the call, or short-circuit it by not
/// invoking the inner service, in which case it must settle the message
/// itself.
pub trait Stage<T>: Send + Sync + 'static {
    fn wrap(&self, next: MessageService<T>) -> MessageService<T>;
}

impl<T, L> Stage<T> for L
where
    T: Send + 'static,
    L: Layer<MessageService<T>> + Send + Sync + 'static,
    L::Service: Service<MessageContext<T>, Response = (), Error = ProcessingError>
        + Clone
        + Send
        + 'static,
    <L::Service as Service<MessageContext<T>>>::Future: Send + 'static,
{
    fn wrap(&self, next: MessageService<T>) -> MessageService<T> {
        BoxCloneService::new(self.layer(next))
    }
}
