//! Conveyor host — runs typed message processors over pluggable transports.
//!
//! A [`MessageHost`] owns channel receivers and other hosted components.
//! Each [`ChannelReceiver`] pulls messages from a [`Transport`], decodes them
//! and drives every attempt through a tower middleware pipeline:
//! error handling, instrumentation, dead-lettering, concurrency throttling,
//! custom stages and finally the registered [`Processor`]. Components marked
//! singleton run under a lease from a [`LockManager`] so only one fleet
//! member executes them at a time.

pub mod config;
pub mod context;
pub mod gate;
pub mod host;
pub mod middleware;
pub mod processor;
pub mod receiver;
pub mod registry;
pub mod shutdown;
pub mod singleton;
pub mod storage;
pub mod telemetry;
pub mod transport;

#[cfg(test)]
mod test_support;

pub use config::{HostConfig, ReceiverConfig, SingletonConfig, TelemetryConfig};
pub use context::{MessageContext, Settlement};
pub use gate::{ConcurrencyGate, GateError};
pub use host::{HostError, HostedComponent, MessageHost};
pub use middleware::{MessageService, PipelineBuilder, Stage};
pub use processor::Processor;
pub use receiver::{ChannelReceiver, ChannelReceiverBuilder, ReceiverError};
pub use registry::{ProcessorOptions, ProcessorRegistry, ServiceScope};
pub use shutdown::{HealthState, ShutdownController};
pub use singleton::{SingletonCoordinator, SingletonState};
pub use telemetry::init_tracing;

pub use conveyor_core::{
    Disposition, JsonSerializer, LockManager, MessagePackSerializer, ProcessingError,
    ProcessingSettings, ReceivedMessage, Serializer, Transport,
};
