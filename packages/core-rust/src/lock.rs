//! Lease-based distributed lock contracts.
//!
//! A lock store grants time-bounded leases over named resources. The
//! singleton coordinator in the host uses these traits to make sure only one
//! fleet member runs a given component.

use std::time::Duration;

use async_trait::async_trait;

/// Errors surfaced by a lock store adapter.
#[derive(Debug, thiserror::Error)]
pub enum LockError {
    #[error("lock store operation timed out after {timeout:?}")]
    Timeout { timeout: Duration },
    #[error("lock store unavailable: {0:#}")]
    Storage(#[source] anyhow::Error),
}

/// Store that hands out leases.
///
/// Implementations must guarantee at most one successful concurrent
/// [`try_acquire`](LockManager::try_acquire) per `lock_id` within the
/// consistency window they advertise.
#[async_trait]
pub trait LockManager: Send + Sync + 'static {
    /// One-time setup of the backing store (containers, tables, scripts).
    async fn initialize(&self) -> Result<(), LockError>;

    /// Attempts to take the lease on `lock_id` for `lease_period`.
    ///
    /// Returns `Ok(None)` when another owner currently holds the lease.
    async fn try_acquire(
        &self,
        lock_id: &str,
        lease_period: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError>;
}

/// One acquired lease.
#[async_trait]
pub trait LockHandle: Send + Sync {
    /// Logical resource name the lease covers.
    fn lock_id(&self) -> &str;

    /// Opaque lease token issued by the store.
    fn lease_id(&self) -> &str;

    /// Extends the lease by its original period.
    ///
    /// `Ok(false)` means the lease was lost (expired or taken over) and will
    /// not come back; `Err` signals a possibly transient store failure.
    async fn renew(&self, timeout: Duration) -> Result<bool, LockError>;

    /// Gives the lease up. Best-effort: callers log failures and move on.
    async fn release(&self) -> Result<(), LockError>;
}
