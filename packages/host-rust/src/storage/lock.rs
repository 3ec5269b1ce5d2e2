//! In-memory [`LockManager`] backed by [`DashMap`].
//!
//! Leases live in a process-local map keyed by lock id, so this store only
//! coordinates coordinators inside one process. It is the reference
//! implementation for tests and single-node deployments.

use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use conveyor_core::{LockError, LockHandle, LockManager};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use tokio::time::Instant;
use uuid::Uuid;

#[derive(Debug, Clone)]
struct Lease {
    lease_id: String,
    period: Duration,
    expires_at: Instant,
}

impl Lease {
    fn new(period: Duration, now: Instant) -> Self {
        Self {
            lease_id: Uuid::new_v4().to_string(),
            period,
            expires_at: now + period,
        }
    }

    fn is_live(&self, now: Instant) -> bool {
        self.expires_at > now
    }
}

#[derive(Debug, Default)]
struct Shared {
    leases: DashMap<String, Lease>,
    failing_renewals: AtomicU32,
    unavailable: AtomicBool,
}

impl Shared {
    fn check_available(&self) -> Result<(), LockError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(LockError::Storage(anyhow::anyhow!("lock store unreachable")));
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// InMemoryLockManager
// ---------------------------------------------------------------------------

/// Process-local lease store.
///
/// Expiry is measured with tokio's clock, so paused-time tests can advance
/// past a lease period deterministically.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLockManager {
    shared: Arc<Shared>,
}

impl InMemoryLockManager {
    /// Create an empty lease store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Lease id currently holding `lock_id`, if the lease is live.
    #[must_use]
    pub fn holder(&self, lock_id: &str) -> Option<String> {
        let now = Instant::now();
        self.shared
            .leases
            .get(lock_id)
            .filter(|lease| lease.is_live(now))
            .map(|lease| lease.lease_id.clone())
    }

    /// Drops the lease on `lock_id` as if it had expired or been broken by an
    /// operator. The holder learns about it on its next renewal.
    pub fn revoke(&self, lock_id: &str) {
        self.shared.leases.remove(lock_id);
    }

    /// Makes the next `count` renewals fail with a storage error.
    pub fn fail_next_renewals(&self, count: u32) {
        self.shared.failing_renewals.store(count, Ordering::SeqCst);
    }

    /// Toggles a full store outage: every call fails while set.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.shared.unavailable.store(unavailable, Ordering::SeqCst);
    }
}

#[async_trait]
impl LockManager for InMemoryLockManager {
    async fn initialize(&self) -> Result<(), LockError> {
        self.shared.check_available()
    }

    async fn try_acquire(
        &self,
        lock_id: &str,
        lease_period: Duration,
    ) -> Result<Option<Box<dyn LockHandle>>, LockError> {
        self.shared.check_available()?;
        let now = Instant::now();
        let lease = match self.shared.leases.entry(lock_id.to_owned()) {
            Entry::Occupied(entry) if entry.get().is_live(now) => return Ok(None),
            Entry::Occupied(mut entry) => {
                let lease = Lease::new(lease_period, now);
                entry.insert(lease.clone());
                lease
            }
            Entry::Vacant(entry) => entry.insert(Lease::new(lease_period, now)).clone(),
        };
        Ok(Some(Box::new(InMemoryLockHandle {
            shared: Arc::clone(&self.shared),
            lock_id: lock_id.to_owned(),
            lease_id: lease.lease_id,
        })))
    }
}

// ---------------------------------------------------------------------------
// InMemoryLockHandle
// ---------------------------------------------------------------------------

/// Handle to one lease held in an [`InMemoryLockManager`].
#[derive(Debug)]
pub struct InMemoryLockHandle {
    shared: Arc<Shared>,
    lock_id: String,
    lease_id: String,
}

#[async_trait]
impl LockHandle for InMemoryLockHandle {
    fn lock_id(&self) -> &str {
        &self.lock_id
    }

    fn lease_id(&self) -> &str {
        &self.lease_id
    }

    async fn renew(&self, _timeout: Duration) -> Result<bool, LockError> {
        self.shared.check_available()?;
        let failing = self.shared.failing_renewals.load(Ordering::SeqCst);
        if failing > 0 {
            self.shared
                .failing_renewals
                .store(failing - 1, Ordering::SeqCst);
            return Err(LockError::Storage(anyhow::anyhow!(
                "renewal of {} failed",
                self.lock_id
            )));
        }

        let now = Instant::now();
        let Some(mut lease) = self.shared.leases.get_mut(&self.lock_id) else {
            return Ok(false);
        };
        if lease.lease_id != self.lease_id || !lease.is_live(now) {
            return Ok(false);
        }
        lease.expires_at = now + lease.period;
        Ok(true)
    }

    async fn release(&self) -> Result<(), LockError> {
        self.shared.check_available()?;
        self.shared
            .leases
            .remove_if(&self.lock_id, |_, lease| lease.lease_id == self.lease_id);
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
