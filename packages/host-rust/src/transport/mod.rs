//! Transport adapters bundled with the host.

pub mod memory;

pub use memory::{InMemoryTransport, OutgoingMessage, SettledMessage};
