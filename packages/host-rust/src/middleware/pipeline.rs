//! Pipeline composition: folds registered stages around the terminal service.

use std::sync::Arc;

use conveyor_core::ProcessingError;
use tower::util::BoxCloneService;
use tower::Service;

use super::{
    DeadLetterLayer, ErrorHandlingLayer, InstrumentLayer, MessageService, ProcessorInvoker,
    Stage, ThrottleLayer,
};
use crate::context::MessageContext;
use crate::gate::ConcurrencyGate;
use crate::registry::ProcessorRegistry;

// ---------------------------------------------------------------------------
// PipelineBuilder
// ---------------------------------------------------------------------------

/// Ordered list of stages composed into one [`MessageService`].
///
/// Each stage wraps everything registered before it, so the first stage sits
/// next to the terminal and the last one is outermost. Post-processing
/// therefore runs in registration order.
pub struct PipelineBuilder<T> {
    stages: Vec<Box<dyn Stage<T>>>,
}

impl<T: Send + 'static> PipelineBuilder<T> {
    /// Create an empty builder.
    #[must_use]
    pub fn new() -> Self {
        Self { stages: Vec::new() }
    }

    /// Adds a stage; it wraps every stage added before it.
    #[must_use]
    pub fn stage(mut self, stage: impl Stage<T>) -> Self {
        self.stages.push(Box::new(stage));
        self
    }

    /// Adds an already boxed stage.
    pub fn push(&mut self, stage: Box<dyn Stage<T>>) {
        self.stages.push(stage);
    }

    /// Number of stages added.
    #[must_use]
    pub fn len(&self) -> usize {
        self.stages.len()
    }

    /// Returns `true` if no stage was added.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    /// Composes the stages around `terminal`.
    #[must_use]
    pub fn build<S>(self, terminal: S) -> MessageService<T>
    where
        S: Service<MessageContext<T>, Response = (), Error = ProcessingError>
            + Clone
            + Send
            + 'static,
        S::Future: Send + 'static,
    {
        self.stages
            .iter()
            .fold(BoxCloneService::new(terminal), |next, stage| stage.wrap(next))
    }
}

impl<T: Send + 'static> Default for PipelineBuilder<T> {
    fn default() -> Self {
        Self::new()
    }
}

/// Builds the receiver pipeline.
///
/// Stage order (innermost to outermost):
/// 1. `custom` stages, in the order given
/// 2. `ThrottleLayer`: wait for a concurrency slot
/// 3. `DeadLetterLayer`: quarantine deliveries past the limit
/// 4. `InstrumentLayer`: span, duration and outcome counter
/// 5. `ErrorHandlingLayer`: abandon on any fault
#[must_use]
pub fn build_message_pipeline<T>(
    registry: Arc<ProcessorRegistry>,
    gate: Arc<ConcurrencyGate>,
    custom: Vec<Box<dyn Stage<T>>>,
) -> MessageService<T>
where
    T: Send + Sync + 'static,
{
    let mut builder = PipelineBuilder::new();
    for stage in custom {
        builder.push(stage);
    }
    builder
        .stage(ThrottleLayer::new(gate))
        .stage(DeadLetterLayer)
        .stage(InstrumentLayer)
        .stage(ErrorHandlingLayer)
        .build(ProcessorInvoker::new(registry))
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
