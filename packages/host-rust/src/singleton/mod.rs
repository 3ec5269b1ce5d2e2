//! Fleet-wide singleton execution backed by a lease store.
//!
//! - [`coordinator`]: Lease acquisition, renewal and failover around a component
//! - [`backoff`]: Growing delays between renewal retries

pub mod backoff;
pub mod coordinator;

pub use backoff::Backoff;
pub use coordinator::{SingletonCoordinator, SingletonState};
