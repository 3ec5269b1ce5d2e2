//! In-memory backends for the lock-store and saga-store contracts.
//!
//! - [`InMemoryLockManager`]: lease store used by the singleton coordinator
//! - [`InMemorySagaStore`]: versioned workflow state with atomic create and CAS

pub mod lock;
pub mod saga;

pub use lock::{InMemoryLockHandle, InMemoryLockManager};
pub use saga::InMemorySagaStore;
