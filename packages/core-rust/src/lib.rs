//! Conveyor core — message, transport, lock-store, saga-store and serializer
//! contracts shared by the host and by backend adapters.

pub mod error;
pub mod lock;
pub mod message;
pub mod saga;
pub mod serializer;
pub mod settings;
pub mod transport;

pub use error::{ProcessingError, SettlementError};
pub use lock::{LockError, LockHandle, LockManager};
pub use message::{Disposition, LockToken, MessageProperties, ReceivedMessage};
pub use saga::{Saga, SagaConflict, SagaError, SagaKey, SagaRecord, SagaStore, TypedSagaStore};
pub use serializer::{JsonSerializer, MessagePackSerializer, Serializer, SerializerError};
pub use settings::{ProcessingSettings, SettingsError};
pub use transport::{Transport, TransportError};
